//! In-process catalog double for pipeline and enrichment tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use cinesync_models::CatalogItem;
use cinesync_sources::{CatalogApi, SourceError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct FakeCatalog {
    pub movies: HashMap<u64, CatalogItem>,
    pub transient: HashSet<u64>,
    pub unauthorized: HashSet<u64>,
    pub changed: Vec<u64>,
    pub unreachable: bool,
    pub delay: Option<Duration>,
    pub detail_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub searched: Mutex<Vec<String>>,
    /// Cancelled as soon as a lookup for this id starts.
    pub cancel_on_lookup: Option<(u64, CancellationToken)>,
}

impl FakeCatalog {
    pub fn with_movies(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        Self {
            movies: items.into_iter().map(|item| (item.id, item)).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn catalog_item(id: u64, title: &str, release_date: &str) -> CatalogItem {
    CatalogItem {
        id,
        title: Some(title.to_string()),
        release_date: NaiveDate::parse_from_str(release_date, "%Y-%m-%d").ok(),
        genres: vec!["Drama".to_string()],
        ..CatalogItem::default()
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    fn source_name(&self) -> &str {
        "fake"
    }

    async fn ping(&self) -> Result<(), SourceError> {
        if self.unreachable {
            return Err(SourceError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn movie_details(&self, tmdb_id: u64) -> Result<Option<CatalogItem>, SourceError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((id, token)) = &self.cancel_on_lookup {
            if *id == tmdb_id {
                token.cancel();
            }
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.unauthorized.contains(&tmdb_id) {
            return Err(SourceError::Unauthorized { status: 401 });
        }
        if self.transient.contains(&tmdb_id) {
            return Err(SourceError::Transient {
                resource: format!("movie/{}", tmdb_id),
                attempts: 4,
                message: "HTTP 503".to_string(),
            });
        }
        Ok(self.movies.get(&tmdb_id).cloned())
    }

    async fn discover_year(&self, year: i32, since_id: Option<u64>) -> Result<Vec<CatalogItem>, SourceError> {
        let mut items: Vec<CatalogItem> = self
            .movies
            .values()
            .filter(|m| m.release_date.map(|d| d.format("%Y").to_string()) == Some(year.to_string()))
            .filter(|m| since_id.map_or(true, |since| m.id > since))
            .cloned()
            .collect();
        items.sort_by_key(|m| m.id);
        Ok(items)
    }

    async fn changed_movie_ids(&self, _days: u32) -> Result<Vec<u64>, SourceError> {
        Ok(self.changed.clone())
    }

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>, SourceError> {
        self.searched.lock().unwrap().push(query.to_string());
        let needle = query.to_lowercase();
        let mut items: Vec<CatalogItem> = self
            .movies
            .values()
            .filter(|m| m.title.as_deref().unwrap_or("").to_lowercase().contains(&needle))
            .cloned()
            .collect();
        items.sort_by_key(|m| m.id);
        Ok(items)
    }

    async fn movies_since(&self, date: NaiveDate) -> Result<Vec<CatalogItem>, SourceError> {
        let mut items: Vec<CatalogItem> = self
            .movies
            .values()
            .filter(|m| m.release_date.map_or(false, |d| d >= date))
            .cloned()
            .collect();
        items.sort_by_key(|m| m.id);
        Ok(items)
    }
}
