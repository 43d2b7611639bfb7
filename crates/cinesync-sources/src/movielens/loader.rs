use anyhow::{Context, Result};
use cinesync_models::LocalDatasetItem;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const NO_GENRES: &str = "(no genres listed)";

#[derive(Debug, Deserialize)]
struct MovieRow {
    #[serde(rename = "movieId")]
    movie_id: u64,
    title: String,
    #[serde(default)]
    genres: String,
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    #[serde(rename = "movieId")]
    movie_id: u64,
    #[serde(rename = "imdbId", default)]
    imdb_id: Option<String>,
    // Some rows leave tmdbId blank
    #[serde(rename = "tmdbId", deserialize_with = "csv::invalid_option", default)]
    tmdb_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RatingRow {
    #[serde(rename = "movieId")]
    movie_id: u64,
    rating: f32,
}

#[derive(Debug, Deserialize)]
struct TagRow {
    #[serde(rename = "movieId")]
    movie_id: u64,
    tag: String,
}

/// Year from a trailing `(YYYY)`, e.g. `"Inception (2010)"`.
pub fn extract_year(title: &str) -> Option<i32> {
    let trimmed = title.trim_end();
    let inner = trimmed.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let digits = &inner[open + 1..];
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Title with a well-formed trailing `(YYYY)` removed.
pub fn strip_year(title: &str) -> &str {
    let trimmed = title.trim_end();
    if extract_year(trimmed).is_some() {
        if let Some(open) = trimmed.rfind('(') {
            return trimmed[..open].trim_end();
        }
    }
    trimmed
}

/// In-memory MovieLens dataset. `load` reads the CSV files once and builds
/// every index; lookups afterwards never touch the disk.
#[derive(Debug, Default)]
pub struct MovieLensLoader {
    data_dir: PathBuf,
    movies: HashMap<u64, MovieRow>,
    links: HashMap<u64, LinkRow>,
    ratings: HashMap<u64, Vec<f32>>,
    tags: HashMap<u64, Vec<String>>,
    by_year: BTreeMap<i32, Vec<u64>>,
}

impl MovieLensLoader {
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(path = %data_dir.display(), "Loading MovieLens dataset");

        let mut loader = Self {
            data_dir,
            ..Self::default()
        };

        for row in read_rows::<MovieRow>(&loader.data_dir.join("movies.csv"), true)? {
            if let Some(year) = extract_year(&row.title) {
                loader.by_year.entry(year).or_default().push(row.movie_id);
            }
            loader.movies.insert(row.movie_id, row);
        }
        for ids in loader.by_year.values_mut() {
            ids.sort_unstable();
        }

        for row in read_rows::<LinkRow>(&loader.data_dir.join("links.csv"), true)? {
            loader.links.insert(row.movie_id, row);
        }

        for row in read_rows::<RatingRow>(&loader.data_dir.join("ratings.csv"), false)? {
            loader.ratings.entry(row.movie_id).or_default().push(row.rating);
        }

        for row in read_rows::<TagRow>(&loader.data_dir.join("tags.csv"), false)? {
            let tag = row.tag.trim();
            if !tag.is_empty() {
                loader.tags.entry(row.movie_id).or_default().push(tag.to_string());
            }
        }

        info!(
            movies = loader.movies.len(),
            links = loader.links.len(),
            rated = loader.ratings.len(),
            tagged = loader.tags.len(),
            "MovieLens dataset loaded"
        );
        Ok(loader)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn len(&self) -> usize {
        self.movies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movies.is_empty()
    }

    pub fn lookup(&self, movie_id: u64) -> Option<LocalDatasetItem> {
        let movie = self.movies.get(&movie_id)?;
        let link = self.links.get(&movie_id);
        let ratings = self.ratings.get(&movie_id);

        let rating_mean = ratings
            .filter(|r| !r.is_empty())
            .map(|r| r.iter().map(|v| f64::from(*v)).sum::<f64>() / r.len() as f64);

        Some(LocalDatasetItem {
            movie_id,
            tmdb_id: link.and_then(|l| l.tmdb_id),
            imdb_id: link.and_then(|l| l.imdb_id.clone()).filter(|s| !s.is_empty()),
            title: strip_year(&movie.title).to_string(),
            year: extract_year(&movie.title),
            genres: movie
                .genres
                .split('|')
                .map(str::trim)
                .filter(|g| !g.is_empty() && *g != NO_GENRES)
                .map(String::from)
                .collect(),
            rating_mean,
            rating_count: ratings.map_or(0, |r| r.len() as u64),
            tags: self.tags.get(&movie_id).cloned().unwrap_or_default(),
        })
    }

    /// Items released in `year`, ascending by MovieLens id. Each call walks
    /// the prebuilt index again.
    pub fn items_for_year(&self, year: i32) -> impl Iterator<Item = LocalDatasetItem> + '_ {
        self.by_year
            .get(&year)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.lookup(*id))
    }

    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.by_year.keys().copied()
    }

    /// Latest year present in the dataset, 1900 when no title carries one.
    pub fn latest_year(&self) -> i32 {
        self.by_year.keys().next_back().copied().unwrap_or(1900)
    }
}

fn read_rows<T>(path: &Path, required: bool) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        if required {
            anyhow::bail!("MovieLens file not found: {}", path.display());
        }
        warn!(path = %path.display(), "Optional MovieLens file missing, continuing without it");
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    let mut bad = 0usize;
    for record in reader.deserialize::<T>() {
        match record {
            Ok(row) => rows.push(row),
            Err(e) => {
                bad += 1;
                debug!(path = %path.display(), error = %e, "Skipping unparseable row");
            }
        }
    }
    if bad > 0 {
        warn!(path = %path.display(), skipped = bad, "Skipped unparseable rows");
    }
    Ok(rows)
}
