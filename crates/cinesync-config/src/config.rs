use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tmdb: TmdbConfig,
    #[serde(default)]
    pub movielens: MovieLensConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub batch_files: BatchFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Ceiling for the sliding one-second request window
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Hard cap for paged endpoints (the API refuses anything past 500)
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MovieLensConfig {
    /// Directory holding movies.csv, links.csv, ratings.csv and tags.csv.
    /// Defaults to `<data_dir>/movielens`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `<data_dir>/cinesync.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_movies_since_max_pages")]
    pub movies_since_max_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchFileConfig {
    /// Root of the raw/ and processed/ directories; defaults to `<data_dir>/batches`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_requests_per_second() -> u32 {
    40
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_max_pages() -> u32 {
    500
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    200
}

fn default_max_workers() -> usize {
    10
}

fn default_movies_since_max_pages() -> u32 {
    20
}

impl Default for TmdbConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            requests_per_second: default_requests_per_second(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_pages: default_max_pages(),
            request_timeout_secs: default_request_timeout_secs(),
            language: default_language(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            movies_since_max_pages: default_movies_since_max_pages(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.tmdb.base_url.starts_with("http://") && !self.tmdb.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("tmdb.base_url must be an http(s) URL: {}", self.tmdb.base_url));
        }
        if self.tmdb.requests_per_second == 0 {
            return Err(anyhow::anyhow!("tmdb.requests_per_second must be greater than zero"));
        }
        if self.tmdb.max_pages == 0 || self.tmdb.max_pages > 500 {
            return Err(anyhow::anyhow!("tmdb.max_pages must be between 1 and 500"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(anyhow::anyhow!("cache.ttl_secs must be greater than zero"));
        }
        if self.pipeline.batch_size == 0 {
            return Err(anyhow::anyhow!("pipeline.batch_size must be greater than zero"));
        }
        if self.pipeline.max_workers == 0 {
            return Err(anyhow::anyhow!("pipeline.max_workers must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_load_and_save() {
        let file = NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.tmdb.requests_per_second = 20;
        config.pipeline.batch_size = 50;
        config.database.path = Some(PathBuf::from("/tmp/movies.db"));

        let path = file.path().to_path_buf();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.tmdb.requests_per_second, 20);
        assert_eq!(loaded.pipeline.batch_size, 50);
        assert_eq!(loaded.database.path, Some(PathBuf::from("/tmp/movies.db")));
        assert_eq!(loaded.cache.ttl_secs, 3600);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[pipeline]\nmax_workers = 16\n").unwrap();

        let loaded = Config::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(loaded.pipeline.max_workers, 16);
        assert_eq!(loaded.pipeline.batch_size, 200);
        assert_eq!(loaded.tmdb.base_url, "https://api.themoviedb.org/3");
        assert_eq!(loaded.tmdb.max_retries, 3);
        assert_eq!(loaded.cache.sweep_interval_secs, 300);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.tmdb.requests_per_second, 40);
    }

    #[test]
    fn test_config_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.pipeline.max_workers = 0;
        assert!(config.validate().is_err());

        config.pipeline.max_workers = 10;
        config.tmdb.max_pages = 501;
        assert!(config.validate().is_err());

        config.tmdb.max_pages = 500;
        config.tmdb.base_url = "ftp://example.org".to_string();
        assert!(config.validate().is_err());
    }
}
