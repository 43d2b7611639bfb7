pub mod config;
pub mod credentials;
pub mod paths;

pub use config::{BatchFileConfig, CacheConfig, Config, DatabaseConfig, MovieLensConfig, PipelineConfig, TmdbConfig};
pub use credentials::{CredentialError, CredentialStore, TmdbCredentials, mask};
pub use paths::{PathManager, container_base_path};
