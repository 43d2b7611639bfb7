pub mod cache;
pub mod error;
pub mod movielens;
pub mod progress;
pub mod tmdb;
pub mod traits;

pub use cache::ResponseCache;
pub use error::{ErrorCategory, FailureTally, SourceError, TallySnapshot};
pub use movielens::{MovieLensLoader, extract_year};
pub use progress::ProgressTracker;
pub use tmdb::{QueryParams, RateLimiter, RetryPolicy, TmdbClient};
pub use traits::CatalogApi;
