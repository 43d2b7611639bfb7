use crate::catalog::{CatalogItem, CreditEntry, KeywordEntry};
use crate::local::LocalDatasetItem;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A candidate row for the `movies` table, built from the catalog, the local
/// dataset, or both.
///
/// Two fields can carry the external catalog ID: `tmdb_id` (the catalog's own
/// `id`) and `linked_tmdb_id` (the `tmdbId` column of the MovieLens link table).
/// [`MovieRecord::external_id`] prefers the catalog field; the two are never
/// merged.
///
/// This is also the record format of YAML batch files, which is why the serde
/// names follow the upstream field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MovieRecord {
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<u64>,
    #[serde(default, rename = "tmdbId", skip_serializing_if = "Option::is_none")]
    pub linked_tmdb_id: Option<u64>,
    #[serde(default, alias = "movieId", skip_serializing_if = "Option::is_none")]
    pub movielens_id: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(default)]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub backdrop_path: Option<String>,
    #[serde(default)]
    pub adult: bool,
    #[serde(default)]
    pub original_language: Option<String>,
    #[serde(default)]
    pub runtime: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub popularity: Option<f64>,
    #[serde(default)]
    pub vote_average: Option<f64>,
    #[serde(default)]
    pub vote_count: Option<u64>,
    #[serde(default)]
    pub movielens_rating: Option<f64>,
    #[serde(default)]
    pub movielens_num_ratings: u64,
    #[serde(default)]
    pub movielens_tags: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub credits: Vec<CreditEntry>,
    #[serde(default)]
    pub keywords: Vec<KeywordEntry>,
}

impl MovieRecord {
    /// The external catalog ID: the catalog field if present, else the link
    /// table field, else nothing.
    pub fn external_id(&self) -> Option<u64> {
        self.tmdb_id.or(self.linked_tmdb_id)
    }

    /// Title with surrounding whitespace removed, `None` if blank.
    pub fn valid_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn from_catalog(item: CatalogItem) -> Self {
        let mut record = Self::default();
        record.overlay_catalog(item);
        record
    }

    pub fn from_local(item: &LocalDatasetItem) -> Self {
        let mut record = Self {
            title: Some(item.title.clone()),
            genres: item.genres.clone(),
            ..Self::default()
        };
        record.merge_local(item);
        record
    }

    /// Apply catalog data on top of whatever is already here. Catalog values
    /// win where present; local aggregates are left alone.
    pub fn overlay_catalog(&mut self, item: CatalogItem) {
        self.tmdb_id = Some(item.id);
        self.title = item.title.or_else(|| self.title.take());
        self.original_title = item.original_title.or_else(|| self.original_title.take());
        self.release_date = item.release_date.or(self.release_date);
        self.overview = item.overview.or_else(|| self.overview.take());
        self.tagline = item.tagline.or_else(|| self.tagline.take());
        self.poster_path = item.poster_path.or_else(|| self.poster_path.take());
        self.backdrop_path = item.backdrop_path.or_else(|| self.backdrop_path.take());
        self.adult = item.adult;
        self.original_language = item.original_language.or_else(|| self.original_language.take());
        self.runtime = item.runtime.or(self.runtime);
        self.status = item.status.or_else(|| self.status.take());
        self.popularity = item.popularity.or(self.popularity);
        self.vote_average = item.vote_average.or(self.vote_average);
        self.vote_count = item.vote_count.or(self.vote_count);
        if !item.genres.is_empty() {
            self.genres = item.genres;
        }
        if !item.credits.is_empty() {
            self.credits = item.credits;
        }
        if !item.keywords.is_empty() {
            self.keywords = item.keywords;
        }
    }

    /// Attach the local dataset's identity and aggregates.
    pub fn merge_local(&mut self, item: &LocalDatasetItem) {
        self.movielens_id = Some(item.movie_id);
        self.linked_tmdb_id = item.tmdb_id;
        self.movielens_rating = item.rating_mean;
        self.movielens_num_ratings = item.rating_count;
        self.movielens_tags = item.tags.clone();
        if self.valid_title().is_none() {
            self.title = Some(item.title.clone());
        }
        if self.genres.is_empty() {
            self.genres = item.genres.clone();
        }
    }
}
