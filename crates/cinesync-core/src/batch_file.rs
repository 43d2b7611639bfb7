use anyhow::{Context, Result};
use chrono::Local;
use cinesync_models::MovieRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    Initial,
    Missing,
    Changes,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Initial => "initial",
            BatchType::Missing => "missing",
            BatchType::Changes => "changes",
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(BatchType::Initial),
            "missing" => Ok(BatchType::Missing),
            "changes" => Ok(BatchType::Changes),
            other => anyhow::bail!("Unknown batch type '{}'. Expected one of: initial, missing, changes", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchMetadata {
    pub batch_type: BatchType,
    pub batch_id: String,
    /// `YYYYmmdd_HHMMSS`, local time, same stamp as in the file name
    pub timestamp: String,
    pub movie_count: usize,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub metadata: BatchMetadata,
    #[serde(default)]
    pub movies: Vec<MovieRecord>,
}

/// YAML interchange between fetch-only and load-only runs.
///
/// Fetch runs write into `raw/`; load runs read `raw/` in file-name order and
/// move each file to `processed/` once its records are stored.
pub struct BatchFileStore {
    base_dir: PathBuf,
}

impl BatchFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            base_dir: base_dir.into(),
        };
        fs::create_dir_all(store.raw_dir())
            .with_context(|| format!("Failed to create {}", store.raw_dir().display()))?;
        fs::create_dir_all(store.processed_dir())
            .with_context(|| format!("Failed to create {}", store.processed_dir().display()))?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.base_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.base_dir.join("processed")
    }

    /// Write `movies` to `raw/<type>_<id>_<YYYYmmdd_HHMMSS>.yaml`.
    pub fn save_batch(&self, batch_type: BatchType, batch_id: &str, movies: Vec<MovieRecord>) -> Result<PathBuf> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self
            .raw_dir()
            .join(format!("{}_{}_{}.yaml", batch_type, batch_id, timestamp));

        let batch = BatchFile {
            metadata: BatchMetadata {
                batch_type,
                batch_id: batch_id.to_string(),
                timestamp,
                movie_count: movies.len(),
                schema_version: SCHEMA_VERSION.to_string(),
            },
            movies,
        };
        let yaml = serde_yaml::to_string(&batch).context("Failed to serialize batch")?;
        fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;

        info!(path = %path.display(), movies = batch.metadata.movie_count, "Saved batch file");
        Ok(path)
    }

    pub fn load_batch(&self, path: &Path) -> Result<BatchFile> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let batch: BatchFile =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        if batch.metadata.movie_count != batch.movies.len() {
            debug!(
                path = %path.display(),
                declared = batch.metadata.movie_count,
                actual = batch.movies.len(),
                "Batch header count does not match its contents"
            );
        }
        Ok(batch)
    }

    /// Move a consumed file from `raw/` to `processed/`.
    pub fn mark_processed(&self, path: &Path) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .with_context(|| format!("Not a file path: {}", path.display()))?;
        let target = self.processed_dir().join(file_name);
        fs::rename(path, &target)
            .with_context(|| format!("Failed to move {} to {}", path.display(), target.display()))?;
        debug!(from = %path.display(), to = %target.display(), "Marked batch processed");
        Ok(target)
    }

    /// Unprocessed `.yaml` files, sorted by name, optionally limited to one type.
    pub fn unprocessed(&self, batch_type: Option<BatchType>) -> Result<Vec<PathBuf>> {
        let prefix = batch_type.map(|t| format!("{}_", t));
        let mut files = Vec::new();
        for entry in fs::read_dir(self.raw_dir()).with_context(|| format!("Failed to list {}", self.raw_dir().display()))? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".yaml") {
                continue;
            }
            if prefix.as_deref().map_or(true, |p| name.starts_with(p)) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn movie(id: u64, title: &str) -> MovieRecord {
        MovieRecord {
            tmdb_id: Some(id),
            title: Some(title.to_string()),
            ..MovieRecord::default()
        }
    }

    #[test]
    fn test_save_then_load_keeps_header_and_records() {
        let dir = TempDir::new().unwrap();
        let store = BatchFileStore::new(dir.path()).unwrap();

        let path = store
            .save_batch(BatchType::Missing, "2024", vec![movie(1, "One"), movie(2, "Two")])
            .unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("missing_2024_"));
        assert!(name.ends_with(".yaml"));

        let batch = store.load_batch(&path).unwrap();
        assert_eq!(batch.metadata.batch_type, BatchType::Missing);
        assert_eq!(batch.metadata.movie_count, 2);
        assert_eq!(batch.metadata.schema_version, SCHEMA_VERSION);
        assert_eq!(batch.movies[1].title.as_deref(), Some("Two"));
    }

    #[test]
    fn test_unprocessed_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = BatchFileStore::new(dir.path()).unwrap();
        for name in ["missing_b_20240102_000000.yaml", "changes_a_20240101_000000.yaml", "missing_a_20240101_000000.yaml", "notes.txt"] {
            fs::write(store.raw_dir().join(name), "metadata: {}").unwrap();
        }

        let all = store.unprocessed(None).unwrap();
        assert_eq!(all.len(), 3);
        let missing = store.unprocessed(Some(BatchType::Missing)).unwrap();
        let names: Vec<_> = missing.iter().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["missing_a_20240101_000000.yaml", "missing_b_20240102_000000.yaml"]);
    }

    #[test]
    fn test_mark_processed_moves_file() {
        let dir = TempDir::new().unwrap();
        let store = BatchFileStore::new(dir.path()).unwrap();
        let path = store.save_batch(BatchType::Changes, "1", vec![movie(1, "One")]).unwrap();

        let target = store.mark_processed(&path).unwrap();
        assert!(!path.exists());
        assert!(target.exists());
        assert!(store.unprocessed(None).unwrap().is_empty());
    }

    #[test]
    fn test_legacy_records_parse_with_link_field() {
        let dir = TempDir::new().unwrap();
        let store = BatchFileStore::new(dir.path()).unwrap();
        let path = store.raw_dir().join("initial_x_20240101_000000.yaml");
        fs::write(
            &path,
            "metadata:\n  batch_type: initial\n  batch_id: x\n  timestamp: '20240101_000000'\n  movie_count: 1\nmovies:\n  - tmdbId: 862\n    movieId: 1\n    title: Toy Story\n",
        )
        .unwrap();

        let batch = store.load_batch(&path).unwrap();
        assert_eq!(batch.movies[0].external_id(), Some(862));
        assert_eq!(batch.movies[0].movielens_id, Some(1));
        assert_eq!(batch.metadata.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_batch_type_parse() {
        assert_eq!("Changes".parse::<BatchType>().unwrap(), BatchType::Changes);
        assert!("weekly".parse::<BatchType>().is_err());
    }
}
