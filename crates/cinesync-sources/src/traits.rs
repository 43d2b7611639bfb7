use crate::error::SourceError;
use async_trait::async_trait;
use chrono::NaiveDate;
use cinesync_models::CatalogItem;

/// Read-only view of an external movie catalog.
///
/// `Ok(None)` / empty results mean the catalog had nothing usable; the
/// implementation has already counted the failure. `Err` is reserved for
/// failures the caller has to act on (exhausted retries, bad credentials).
#[async_trait]
pub trait CatalogApi: Send + Sync {
    fn source_name(&self) -> &str;

    /// Verify the catalog is reachable and accepts our credentials.
    async fn ping(&self) -> Result<(), SourceError>;

    /// Full record for one movie, including credits and keywords.
    async fn movie_details(&self, tmdb_id: u64) -> Result<Option<CatalogItem>, SourceError>;

    /// Summary records for movies released in `year`, ascending by id,
    /// restricted to ids greater than `since_id` when given.
    async fn discover_year(&self, year: i32, since_id: Option<u64>) -> Result<Vec<CatalogItem>, SourceError>;

    /// IDs of movies changed within the last `days` days.
    async fn changed_movie_ids(&self, days: u32) -> Result<Vec<u64>, SourceError>;

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>, SourceError>;

    /// Summary records for movies released on or after `date`.
    async fn movies_since(&self, date: NaiveDate) -> Result<Vec<CatalogItem>, SourceError>;
}
