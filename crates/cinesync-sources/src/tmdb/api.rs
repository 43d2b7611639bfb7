use crate::error::{ErrorCategory, SourceError};
use crate::tmdb::client::{QueryParams, TmdbClient};
use crate::traits::CatalogApi;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use cinesync_models::{CatalogItem, CreditEntry, CreditKind, KeywordEntry};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Named {
    id: u64,
    name: String,
}

/// Shape shared by list results and the detail endpoint.
#[derive(Debug, Deserialize)]
struct TmdbMovie {
    id: u64,
    title: Option<String>,
    original_title: Option<String>,
    release_date: Option<String>,
    overview: Option<String>,
    tagline: Option<String>,
    poster_path: Option<String>,
    backdrop_path: Option<String>,
    #[serde(default)]
    adult: bool,
    original_language: Option<String>,
    runtime: Option<u32>,
    status: Option<String>,
    popularity: Option<f64>,
    vote_average: Option<f64>,
    vote_count: Option<u64>,
    #[serde(default)]
    genres: Vec<Named>,
    credits: Option<TmdbCredits>,
    keywords: Option<TmdbKeywords>,
}

#[derive(Debug, Deserialize)]
struct TmdbCredits {
    #[serde(default)]
    cast: Vec<TmdbCastMember>,
    #[serde(default)]
    crew: Vec<TmdbCrewMember>,
}

#[derive(Debug, Deserialize)]
struct TmdbCastMember {
    id: u64,
    name: String,
    character: Option<String>,
    order: Option<u32>,
    profile_path: Option<String>,
    gender: Option<u8>,
    known_for_department: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbCrewMember {
    id: u64,
    name: String,
    department: Option<String>,
    job: Option<String>,
    profile_path: Option<String>,
    gender: Option<u8>,
    known_for_department: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbKeywords {
    #[serde(default)]
    keywords: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct TmdbChange {
    id: u64,
    adult: Option<bool>,
}

/// TMDB sends `""` for unknown release dates.
fn parse_release_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.filter(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

impl From<TmdbMovie> for CatalogItem {
    fn from(movie: TmdbMovie) -> Self {
        let mut credits = Vec::new();
        let mut keywords = Vec::new();

        if let Some(block) = movie.credits {
            credits.extend(block.cast.into_iter().map(|c| CreditEntry {
                person_id: c.id,
                name: c.name,
                kind: CreditKind::Cast,
                character: c.character,
                order: c.order,
                department: None,
                job: None,
                profile_path: c.profile_path,
                gender: c.gender,
                known_for_department: c.known_for_department,
            }));
            credits.extend(block.crew.into_iter().map(|c| CreditEntry {
                person_id: c.id,
                name: c.name,
                kind: CreditKind::Crew,
                character: None,
                order: None,
                department: c.department,
                job: c.job,
                profile_path: c.profile_path,
                gender: c.gender,
                known_for_department: c.known_for_department,
            }));
        }
        if let Some(block) = movie.keywords {
            keywords.extend(block.keywords.into_iter().map(|k| KeywordEntry { id: k.id, name: k.name }));
        }

        CatalogItem {
            id: movie.id,
            title: movie.title,
            original_title: movie.original_title,
            release_date: parse_release_date(movie.release_date.as_deref()),
            overview: movie.overview,
            tagline: movie.tagline,
            poster_path: movie.poster_path,
            backdrop_path: movie.backdrop_path,
            popularity: movie.popularity,
            vote_average: movie.vote_average,
            vote_count: movie.vote_count,
            runtime: movie.runtime,
            status: movie.status,
            adult: movie.adult,
            original_language: movie.original_language,
            genres: movie.genres.into_iter().map(|g| g.name).collect(),
            credits,
            keywords,
        }
    }
}

fn params(pairs: &[(&str, String)]) -> QueryParams {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl TmdbClient {
    fn parse_movie(&self, resource: &str, value: Value) -> Option<CatalogItem> {
        match serde_json::from_value::<TmdbMovie>(value) {
            Ok(movie) => Some(movie.into()),
            Err(e) => {
                warn!(resource, error = %e, "Skipping malformed movie record");
                self.tally().record(ErrorCategory::Validation);
                None
            }
        }
    }

    /// Drain a paged endpoint into catalog items. An error on the first page
    /// is returned; a later one keeps what was already collected.
    async fn collect_movies(&self, resource: &str, query: QueryParams, max_pages: u32) -> Result<Vec<CatalogItem>, SourceError> {
        let mut items = Vec::new();
        let mut pages = self.fetch_paged_capped(resource, query, max_pages);
        while let Some(next) = pages.next().await {
            match next {
                Ok(value) => {
                    if let Some(item) = self.parse_movie(resource, value) {
                        items.push(item);
                    }
                }
                Err(e) if items.is_empty() => return Err(e),
                Err(e) => {
                    warn!(resource, error = %e, collected = items.len(), "Stopping pagination early");
                    break;
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl CatalogApi for TmdbClient {
    fn source_name(&self) -> &str {
        "tmdb"
    }

    async fn ping(&self) -> Result<(), SourceError> {
        TmdbClient::ping(self).await
    }

    async fn movie_details(&self, tmdb_id: u64) -> Result<Option<CatalogItem>, SourceError> {
        let resource = format!("movie/{}", tmdb_id);
        let query = params(&[
            ("append_to_response", "credits,keywords".to_string()),
            ("language", self.language().to_string()),
        ]);
        Ok(self
            .fetch(&resource, &query)
            .await?
            .and_then(|body| self.parse_movie(&resource, body)))
    }

    async fn discover_year(&self, year: i32, since_id: Option<u64>) -> Result<Vec<CatalogItem>, SourceError> {
        let query = params(&[
            ("primary_release_year", year.to_string()),
            ("sort_by", "popularity.desc".to_string()),
            ("include_adult", "false".to_string()),
            ("include_video", "false".to_string()),
            ("language", self.language().to_string()),
        ]);
        let items = self.collect_movies("discover/movie", query, self.max_pages).await?;

        // Pages shift while being walked, so the same id can show up twice
        let mut by_id: BTreeMap<u64, CatalogItem> = BTreeMap::new();
        for item in items {
            if since_id.map_or(true, |since| item.id > since) {
                by_id.insert(item.id, item);
            }
        }
        debug!(year, count = by_id.len(), "Discovered movies");
        Ok(by_id.into_values().collect())
    }

    async fn changed_movie_ids(&self, days: u32) -> Result<Vec<u64>, SourceError> {
        let end = Utc::now().date_naive();
        let start = end - Duration::days(i64::from(days.max(1)));
        let query = params(&[
            ("start_date", start.format("%Y-%m-%d").to_string()),
            ("end_date", end.format("%Y-%m-%d").to_string()),
        ]);

        let mut ids = Vec::new();
        let mut pages = self.fetch_paged("movie/changes", query);
        while let Some(next) = pages.next().await {
            match next {
                Ok(value) => match serde_json::from_value::<TmdbChange>(value) {
                    Ok(change) if change.adult == Some(true) => {}
                    Ok(change) => ids.push(change.id),
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed change entry");
                        self.tally().record(ErrorCategory::Validation);
                    }
                },
                Err(e) if ids.is_empty() => return Err(e),
                Err(e) => {
                    warn!(error = %e, collected = ids.len(), "Stopping change pagination early");
                    break;
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        info!(days, count = ids.len(), "Fetched changed movie ids");
        Ok(ids)
    }

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>, SourceError> {
        let query = query.trim();
        if let Ok(tmdb_id) = query.parse::<u64>() {
            return Ok(self.movie_details(tmdb_id).await?.into_iter().collect());
        }

        let search = params(&[
            ("query", query.to_string()),
            ("include_adult", "false".to_string()),
            ("language", self.language().to_string()),
            ("page", "1".to_string()),
        ]);
        let Some(body) = self.fetch("search/movie", &search).await? else {
            return Ok(Vec::new());
        };
        let results = match body.get("results") {
            Some(Value::Array(results)) => results.clone(),
            _ => Vec::new(),
        };
        Ok(results
            .into_iter()
            .filter_map(|value| self.parse_movie("search/movie", value))
            .collect())
    }

    async fn movies_since(&self, date: NaiveDate) -> Result<Vec<CatalogItem>, SourceError> {
        let query = params(&[
            ("primary_release_date.gte", date.format("%Y-%m-%d").to_string()),
            ("sort_by", "release_date.desc".to_string()),
            ("include_adult", "false".to_string()),
            ("language", self.language().to_string()),
        ]);
        self.collect_movies("discover/movie", query, self.movies_since_max_pages).await
    }
}
