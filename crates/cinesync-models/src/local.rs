use serde::{Deserialize, Serialize};

/// One title from the MovieLens dataset, joined with its link row and the
/// pre-aggregated ratings and tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalDatasetItem {
    pub movie_id: u64,
    /// Cross-reference to the catalog, taken from `links.csv`.
    pub tmdb_id: Option<u64>,
    pub imdb_id: Option<String>,
    /// Title with the trailing `(YYYY)` removed.
    pub title: String,
    pub year: Option<i32>,
    pub genres: Vec<String>,
    pub rating_mean: Option<f64>,
    pub rating_count: u64,
    pub tags: Vec<String>,
}
