use crate::cache::ResponseCache;
use crate::error::{ErrorCategory, FailureTally, SourceError};
use crate::tmdb::rate_limit::RateLimiter;
use anyhow::Result;
use cinesync_config::{CacheConfig, TmdbConfig, TmdbCredentials};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Query parameters, kept sorted so the cache signature does not depend on
/// insertion order.
pub type QueryParams = BTreeMap<String, String>;

/// Cache key for a request: `resource?k1=v1&k2=v2` with keys in sorted order.
/// Credentials are never part of the key.
pub fn cache_key(resource: &str, params: &QueryParams) -> String {
    let signature: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", resource.trim_matches('/'), signature.join("&"))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: base, 2*base, 4*base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// What a single HTTP attempt produced.
enum Attempt {
    Body(Value),
    NotFound,
    Unauthorized(StatusCode),
    Rejected(StatusCode, String),
    Malformed(String),
    Retryable(String),
}

#[derive(Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    total_pages: u32,
}

/// HTTP client for the TMDB v3 API.
///
/// Every request goes through the shared rate limiter and the response cache.
/// Transient failures (429, 5xx, timeouts, dropped connections) are retried
/// with exponential backoff. 404s and other non-retryable client errors come
/// back as `Ok(None)` and are counted in the failure tally.
pub struct TmdbClient {
    http: Client,
    base_url: String,
    language: String,
    credentials: TmdbCredentials,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache<Value>>,
    tally: Arc<FailureTally>,
    retry: RetryPolicy,
    pub(crate) max_pages: u32,
    pub(crate) movies_since_max_pages: u32,
}

impl TmdbClient {
    pub fn new(
        config: &TmdbConfig,
        cache_config: &CacheConfig,
        credentials: TmdbCredentials,
        tally: Arc<FailureTally>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("cinesync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
            credentials,
            limiter: Arc::new(RateLimiter::new(config.requests_per_second)),
            cache: Arc::new(ResponseCache::new(
                Duration::from_secs(cache_config.ttl_secs),
                Duration::from_secs(cache_config.sweep_interval_secs),
            )),
            tally,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
            },
            max_pages: config.max_pages,
            movies_since_max_pages: 20,
        })
    }

    pub fn with_movies_since_max_pages(mut self, pages: u32) -> Self {
        self.movies_since_max_pages = pages.clamp(1, self.max_pages.max(1));
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn cache(&self) -> &ResponseCache<Value> {
        &self.cache
    }

    pub fn tally(&self) -> &Arc<FailureTally> {
        &self.tally
    }

    /// Fetch one resource. `Ok(None)` means the upstream has nothing usable
    /// for it (404, rejected request, unparseable body).
    pub async fn fetch(&self, resource: &str, params: &QueryParams) -> Result<Option<Value>, SourceError> {
        let key = cache_key(resource, params);
        if let Some(hit) = self.cache.get(&key) {
            debug!(resource, "Cache hit");
            return Ok(Some(hit));
        }

        let url = format!("{}/{}", self.base_url, resource.trim_start_matches('/'));
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.send_once(&url, params).await {
                Attempt::Body(body) => {
                    self.cache.put(key, body.clone());
                    return Ok(Some(body));
                }
                Attempt::NotFound => {
                    debug!(resource, "Not found upstream");
                    self.tally.record(ErrorCategory::NotFound);
                    return Ok(None);
                }
                Attempt::Unauthorized(status) => {
                    self.tally.record(ErrorCategory::Validation);
                    return Err(SourceError::Unauthorized { status: status.as_u16() });
                }
                Attempt::Rejected(status, body) => {
                    warn!(resource, status = status.as_u16(), body = %truncate(&body, 200), "Request rejected");
                    self.tally.record(ErrorCategory::Validation);
                    return Ok(None);
                }
                Attempt::Malformed(message) => {
                    warn!(resource, error = %message, "Response body is not valid JSON");
                    self.tally.record(ErrorCategory::Validation);
                    return Ok(None);
                }
                Attempt::Retryable(message) => {
                    if attempt >= self.retry.max_retries {
                        warn!(resource, attempts = attempt + 1, error = %message, "Giving up after retries");
                        self.tally.record(ErrorCategory::Transient);
                        return Err(SourceError::Transient {
                            resource: resource.to_string(),
                            attempts: attempt + 1,
                            message,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(resource, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %message, "Retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Lazily walk a `results` + `total_pages` list endpoint, yielding one
    /// record at a time. Stops at `total_pages`, at the configured page cap,
    /// on an empty page, or after yielding the first error.
    pub fn fetch_paged<'a>(&'a self, resource: &'a str, params: QueryParams) -> BoxStream<'a, Result<Value, SourceError>> {
        self.fetch_paged_capped(resource, params, self.max_pages)
    }

    pub fn fetch_paged_capped<'a>(
        &'a self,
        resource: &'a str,
        params: QueryParams,
        max_pages: u32,
    ) -> BoxStream<'a, Result<Value, SourceError>> {
        let cap = max_pages.clamp(1, self.max_pages.max(1));
        stream::unfold(Some(1u32), move |next_page| {
            let mut page_params = params.clone();
            async move {
                let page = next_page?;
                page_params.insert("page".to_string(), page.to_string());
                match self.fetch(resource, &page_params).await {
                    Ok(Some(body)) => match serde_json::from_value::<PageEnvelope>(body) {
                        Ok(envelope) => {
                            let last = envelope.total_pages.min(cap);
                            let next = (page < last && !envelope.results.is_empty()).then_some(page + 1);
                            let items: Vec<Result<Value, SourceError>> = envelope.results.into_iter().map(Ok).collect();
                            Some((items, next))
                        }
                        Err(e) => {
                            self.tally.record(ErrorCategory::Validation);
                            let err = SourceError::Validation {
                                resource: resource.to_string(),
                                message: format!("page {}: {}", page, e),
                            };
                            Some((vec![Err(err)], None))
                        }
                    },
                    Ok(None) => None,
                    Err(e) => Some((vec![Err(e)], None)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// Hit the `configuration` endpoint once, uncached, to prove the API is
    /// reachable and the credentials are accepted.
    pub async fn ping(&self) -> Result<(), SourceError> {
        let url = format!("{}/configuration", self.base_url);
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.send_once(&url, &QueryParams::new()).await {
                Attempt::Body(_) => return Ok(()),
                Attempt::Unauthorized(status) => return Err(SourceError::Unauthorized { status: status.as_u16() }),
                Attempt::Retryable(message) if attempt < self.retry.max_retries => {
                    sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                    debug!(attempt, error = %message, "Retrying connectivity check");
                }
                Attempt::Retryable(message) | Attempt::Malformed(message) => return Err(SourceError::Unreachable(message)),
                Attempt::NotFound => return Err(SourceError::Unreachable(format!("{} returned 404", url))),
                Attempt::Rejected(status, _) => return Err(SourceError::Unreachable(format!("{} returned {}", url, status))),
            }
        }
    }

    async fn send_once(&self, url: &str, params: &QueryParams) -> Attempt {
        let mut request = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&params.iter().collect::<Vec<_>>());
        if let Some(token) = &self.credentials.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(api_key) = &self.credentials.api_key {
            request = request.query(&[("api_key", api_key)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retryable(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Attempt::NotFound;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retryable(format!("HTTP {}", status));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Attempt::Unauthorized(status);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Attempt::Rejected(status, body);
        }

        match response.json::<Value>().await {
            Ok(body) => Attempt::Body(body),
            Err(e) if e.is_decode() => Attempt::Malformed(e.to_string()),
            Err(e) => Attempt::Retryable(e.to_string()),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering each connection with the next canned
    /// response (500 once the script runs out). Records request lines.
    pub(crate) struct ScriptedServer {
        pub base_url: String,
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedServer {
        pub(crate) async fn start(script: Vec<(u16, String)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            tokio::spawn(async move {
                let mut script = script.into_iter();
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else { break };
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    seen.lock().unwrap().push(head);

                    let (status, body) = script.next().unwrap_or((500, "{}".to_string()));
                    let response = format!(
                        "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            Self {
                base_url: format!("http://{}", addr),
                requests,
            }
        }

        pub(crate) fn hits(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    pub(crate) fn test_client(base_url: &str, max_retries: u32) -> TmdbClient {
        let config = TmdbConfig {
            base_url: base_url.to_string(),
            max_retries,
            retry_base_delay_ms: 1,
            requests_per_second: 1000,
            ..TmdbConfig::default()
        };
        let credentials = TmdbCredentials {
            api_key: Some("test-key".to_string()),
            bearer_token: Some("test-token".to_string()),
        };
        TmdbClient::new(&config, &CacheConfig::default(), credentials, Arc::new(FailureTally::new())).unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_cache_key_ignores_insertion_order() {
        let mut a = QueryParams::new();
        a.insert("year".to_string(), "2010".to_string());
        a.insert("page".to_string(), "1".to_string());
        let b = params(&[("page", "1"), ("year", "2010")]);
        assert_eq!(cache_key("/discover/movie", &a), cache_key("discover/movie", &b));
        assert_eq!(cache_key("discover/movie", &a), "discover/movie?page=1&year=2010");
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = ScriptedServer::start(vec![(503, "{}".to_string()), (200, r#"{"id": 27205}"#.to_string())]).await;
        let client = test_client(&server.base_url, 3);

        let body = client.fetch("movie/27205", &QueryParams::new()).await.unwrap();
        assert_eq!(body.unwrap()["id"], 27205);
        assert_eq!(server.hits(), 2);
        assert_eq!(client.tally().count(ErrorCategory::Transient), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_ceiling() {
        let server = ScriptedServer::start(vec![
            (500, "{}".to_string()),
            (502, "{}".to_string()),
            (429, "{}".to_string()),
        ])
        .await;
        let client = test_client(&server.base_url, 2);

        let result = client.fetch("movie/1", &QueryParams::new()).await;
        assert!(matches!(result, Err(SourceError::Transient { attempts: 3, .. })));
        assert_eq!(server.hits(), 3);
        assert_eq!(client.tally().count(ErrorCategory::Transient), 1);
    }

    #[tokio::test]
    async fn test_not_found_returns_none_without_retry() {
        let server = ScriptedServer::start(vec![(404, r#"{"status_code": 34}"#.to_string())]).await;
        let client = test_client(&server.base_url, 3);

        let body = client.fetch("movie/999999999", &QueryParams::new()).await.unwrap();
        assert!(body.is_none());
        assert_eq!(server.hits(), 1);
        assert_eq!(client.tally().count(ErrorCategory::NotFound), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_returns_none() {
        let server = ScriptedServer::start(vec![(422, r#"{"errors": ["page must be less than or equal to 500"]}"#.to_string())]).await;
        let client = test_client(&server.base_url, 3);

        let body = client.fetch("discover/movie", &params(&[("page", "501")])).await.unwrap();
        assert!(body.is_none());
        assert_eq!(server.hits(), 1);
        assert_eq!(client.tally().count(ErrorCategory::Validation), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_an_error() {
        let server = ScriptedServer::start(vec![(401, "{}".to_string())]).await;
        let client = test_client(&server.base_url, 3);

        let result = client.fetch("movie/1", &QueryParams::new()).await;
        assert!(matches!(result, Err(SourceError::Unauthorized { status: 401 })));
    }

    #[tokio::test]
    async fn test_second_fetch_is_served_from_cache() {
        let server = ScriptedServer::start(vec![(200, r#"{"id": 603}"#.to_string())]).await;
        let client = test_client(&server.base_url, 0);
        let p = params(&[("language", "en-US")]);

        client.fetch("movie/603", &p).await.unwrap();
        let again = client.fetch("movie/603", &p).await.unwrap();
        assert_eq!(again.unwrap()["id"], 603);
        assert_eq!(server.hits(), 1);
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_credentials_are_sent() {
        let server = ScriptedServer::start(vec![(200, "{}".to_string())]).await;
        let client = test_client(&server.base_url, 0);

        client.fetch("movie/603", &params(&[("language", "en-US")])).await.unwrap();
        let requests = server.requests.lock().unwrap();
        let head = requests[0].to_lowercase();
        assert!(head.starts_with("get /movie/603?"));
        assert!(head.contains("api_key=test-key"));
        assert!(head.contains("language=en-us"));
        assert!(head.contains("authorization: bearer test-token"));
    }

    #[tokio::test]
    async fn test_paged_fetch_respects_page_cap() {
        let page = |ids: &[u64], total: u32| {
            let results: Vec<Value> = ids.iter().map(|id| serde_json::json!({ "id": id })).collect();
            (200, serde_json::json!({ "page": 1, "results": results, "total_pages": total }).to_string())
        };
        let server = ScriptedServer::start(vec![page(&[1, 2], 5), page(&[3, 4], 5), page(&[5], 5)]).await;
        let client = test_client(&server.base_url, 0);

        let items: Vec<Value> = client
            .fetch_paged_capped("discover/movie", QueryParams::new(), 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_paged_fetch_stops_at_total_pages() {
        let body = serde_json::json!({ "page": 1, "results": [{ "id": 7 }], "total_pages": 1 }).to_string();
        let server = ScriptedServer::start(vec![(200, body)]).await;
        let client = test_client(&server.base_url, 0);

        let items: Vec<Value> = client
            .fetch_paged("movie/changes", QueryParams::new())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_ping_reports_unreachable() {
        let server = ScriptedServer::start(vec![(500, "{}".to_string()), (500, "{}".to_string())]).await;
        let client = test_client(&server.base_url, 1);

        let result = client.ping().await;
        assert!(matches!(result, Err(SourceError::Unreachable(_))));
        assert!(result.unwrap_err().is_fatal());
    }
}
