pub mod api;
pub mod client;
pub mod rate_limit;

pub use client::{QueryParams, RetryPolicy, TmdbClient, cache_key};
pub use rate_limit::RateLimiter;
