use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use cinesync_models::{ChangeKind, ChangeRecord, CreditEntry, CreditKind, KeywordEntry, MovieRecord};
use cinesync_sources::ErrorCategory;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// SQLite's default host-parameter ceiling is 999 on older builds.
const LOOKUP_CHUNK: usize = 500;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt column {column}: {message}")]
    Corrupt { column: &'static str, message: String },
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Persistence
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A persisted movie with its surrogate key and bookkeeping timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMovie {
    pub id: i64,
    pub record: MovieRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub movies: usize,
    pub genres: usize,
    pub people: usize,
    pub credits: usize,
    pub keywords: usize,
    pub changes: usize,
}

/// Relational store for canonical movies and their child collections.
///
/// One connection behind a mutex: every write goes through it, so batches are
/// serialized without any extra coordination.
#[derive(Clone)]
pub struct MovieStore {
    conn: Arc<Mutex<Connection>>,
}

impl MovieStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        migrate(&conn)?;
        info!(path = %path.display(), "Opened movie store");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside one transaction. Any error rolls the whole thing back.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Bulk set-membership lookup: external ID to surrogate key for every
    /// ID that already has a row.
    pub fn existing_ids(&self, tmdb_ids: &[u64]) -> StoreResult<HashMap<u64, i64>> {
        let conn = self.lock();
        existing_ids_in(&conn, tmdb_ids)
    }

    pub fn movie_by_tmdb_id(&self, tmdb_id: u64) -> StoreResult<Option<StoredMovie>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tmdb_id, movielens_id, title, original_title, release_date, overview,
                    tagline, poster_path, backdrop_path, adult, original_language, runtime,
                    status, popularity, vote_average, vote_count, movielens_rating,
                    movielens_num_ratings, movielens_tags, created_at, updated_at
             FROM movies WHERE tmdb_id = ?1",
        )?;
        let row = match stmt.query_row(params![tmdb_id as i64], read_movie_row) {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (id, mut record, tags, created_at, updated_at) = row;

        record.movielens_tags = serde_json::from_str(&tags).map_err(|e| StoreError::Corrupt {
            column: "movies.movielens_tags",
            message: e.to_string(),
        })?;
        record.genres = load_genres(&conn, id)?;
        record.credits = load_credits(&conn, id)?;
        record.keywords = load_keywords(&conn, id)?;

        Ok(Some(StoredMovie {
            id,
            record,
            created_at: parse_timestamp("movies.created_at", &created_at)?,
            updated_at: parse_timestamp("movies.updated_at", &updated_at)?,
        }))
    }

    /// Most recent release date on record, if any movie has one.
    pub fn latest_release_date(&self) -> StoreResult<Option<NaiveDate>> {
        let conn = self.lock();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(release_date) FROM movies WHERE release_date IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        latest.map(|s| parse_date("movies.release_date", &s)).transpose()
    }

    /// Change records newer than now minus `days`, newest first.
    pub fn recent_changes(&self, days: u32) -> StoreResult<Vec<ChangeRecord>> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.movie_id, m.tmdb_id, c.change_type, c.change_date, c.details
             FROM movie_changes c
             JOIN movies m ON m.id = c.movie_id
             WHERE c.change_date >= ?1
             ORDER BY c.change_date DESC, c.id DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut changes = Vec::new();
        for row in rows {
            let (id, movie_id, tmdb_id, kind, changed_at, details) = row?;
            changes.push(ChangeRecord {
                id,
                movie_id,
                tmdb_id: tmdb_id as u64,
                kind: ChangeKind::from_db_str(&kind).ok_or_else(|| StoreError::Corrupt {
                    column: "movie_changes.change_type",
                    message: kind.clone(),
                })?,
                changed_at: parse_timestamp("movie_changes.change_date", &changed_at)?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
            });
        }
        Ok(changes)
    }

    pub fn counts(&self) -> StoreResult<StoreCounts> {
        let conn = self.lock();
        counts_in(&conn)
    }

    /// Empty every table, children first, in one transaction. Returns what
    /// was removed.
    pub fn clear(&self) -> StoreResult<StoreCounts> {
        let mut conn = self.lock();
        let removed = counts_in(&conn)?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM movie_changes;
             DELETE FROM movie_keywords;
             DELETE FROM movie_credits;
             DELETE FROM movie_genres;
             DELETE FROM people;
             DELETE FROM genres;
             DELETE FROM movies;",
        )?;
        tx.commit()?;
        info!(movies = removed.movies, changes = removed.changes, "Cleared movie store");
        Ok(removed)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |r| r.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    debug!(from = version, to = SCHEMA_VERSION, "Migrating movie store schema");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS movies (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            tmdb_id               INTEGER NOT NULL UNIQUE,
            movielens_id          INTEGER,
            title                 TEXT NOT NULL,
            original_title        TEXT,
            release_date          TEXT,
            overview              TEXT,
            tagline               TEXT,
            poster_path           TEXT,
            backdrop_path         TEXT,
            adult                 INTEGER NOT NULL DEFAULT 0,
            original_language     TEXT,
            runtime               INTEGER,
            status                TEXT,
            popularity            REAL,
            vote_average          REAL,
            vote_count            INTEGER,
            movielens_rating      REAL,
            movielens_num_ratings INTEGER NOT NULL DEFAULT 0,
            movielens_tags        TEXT NOT NULL DEFAULT '[]',
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_movies_movielens_id ON movies(movielens_id);
        CREATE INDEX IF NOT EXISTS idx_movies_release_date ON movies(release_date);

        CREATE TABLE IF NOT EXISTS genres (
            id   INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS movie_genres (
            movie_id INTEGER NOT NULL REFERENCES movies(id) ON DELETE CASCADE,
            genre_id INTEGER NOT NULL REFERENCES genres(id),
            PRIMARY KEY (movie_id, genre_id)
        );

        CREATE TABLE IF NOT EXISTS people (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            tmdb_id              INTEGER NOT NULL UNIQUE,
            name                 TEXT NOT NULL,
            profile_path         TEXT,
            gender               INTEGER,
            known_for_department TEXT
        );

        CREATE TABLE IF NOT EXISTS movie_credits (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            movie_id     INTEGER NOT NULL REFERENCES movies(id) ON DELETE CASCADE,
            person_id    INTEGER NOT NULL REFERENCES people(id),
            credit_type  TEXT NOT NULL,
            character    TEXT,
            credit_order INTEGER,
            department   TEXT,
            job          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_movie_credits_movie ON movie_credits(movie_id);

        CREATE TABLE IF NOT EXISTS movie_keywords (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            movie_id INTEGER NOT NULL REFERENCES movies(id) ON DELETE CASCADE,
            tmdb_id  INTEGER,
            name     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_movie_keywords_movie ON movie_keywords(movie_id);

        CREATE TABLE IF NOT EXISTS movie_changes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            movie_id    INTEGER NOT NULL REFERENCES movies(id),
            change_type TEXT NOT NULL,
            change_date TEXT NOT NULL,
            details     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_movie_changes_date ON movie_changes(change_date);

        PRAGMA user_version = 1;",
    )?;
    Ok(())
}

pub(crate) fn existing_ids_in(conn: &Connection, tmdb_ids: &[u64]) -> StoreResult<HashMap<u64, i64>> {
    let mut found = HashMap::with_capacity(tmdb_ids.len());
    for chunk in tmdb_ids.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT tmdb_id, id FROM movies WHERE tmdb_id IN ({})", placeholders);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| *id as i64)), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (tmdb_id, id) = row?;
            found.insert(tmdb_id as u64, id);
        }
    }
    Ok(found)
}

fn counts_in(conn: &Connection) -> StoreResult<StoreCounts> {
    let count = |table: &str| -> StoreResult<usize> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(n as usize)
    };
    Ok(StoreCounts {
        movies: count("movies")?,
        genres: count("genres")?,
        people: count("people")?,
        credits: count("movie_credits")?,
        keywords: count("movie_keywords")?,
        changes: count("movie_changes")?,
    })
}

type MovieRow = (i64, MovieRecord, String, String, String);

fn read_movie_row(row: &Row<'_>) -> rusqlite::Result<MovieRow> {
    let release_date: Option<String> = row.get(5)?;
    let record = MovieRecord {
        tmdb_id: Some(row.get::<_, i64>(1)? as u64),
        movielens_id: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
        title: Some(row.get(3)?),
        original_title: row.get(4)?,
        release_date: release_date.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        overview: row.get(6)?,
        tagline: row.get(7)?,
        poster_path: row.get(8)?,
        backdrop_path: row.get(9)?,
        adult: row.get(10)?,
        original_language: row.get(11)?,
        runtime: row.get(12)?,
        status: row.get(13)?,
        popularity: row.get(14)?,
        vote_average: row.get(15)?,
        vote_count: row.get::<_, Option<i64>>(16)?.map(|v| v as u64),
        movielens_rating: row.get(17)?,
        movielens_num_ratings: row.get::<_, i64>(18)? as u64,
        ..MovieRecord::default()
    };
    Ok((row.get(0)?, record, row.get(19)?, row.get(20)?, row.get(21)?))
}

fn load_genres(conn: &Connection, movie_id: i64) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT g.name FROM movie_genres mg JOIN genres g ON g.id = mg.genre_id
         WHERE mg.movie_id = ?1 ORDER BY g.name",
    )?;
    let names = stmt
        .query_map(params![movie_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn load_credits(conn: &Connection, movie_id: i64) -> StoreResult<Vec<CreditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT p.tmdb_id, p.name, c.credit_type, c.character, c.credit_order, c.department,
                c.job, p.profile_path, p.gender, p.known_for_department
         FROM movie_credits c JOIN people p ON p.id = c.person_id
         WHERE c.movie_id = ?1 ORDER BY c.id",
    )?;
    let rows = stmt.query_map(params![movie_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<u32>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<u8>>(8)?,
            row.get::<_, Option<String>>(9)?,
        ))
    })?;

    let mut credits = Vec::new();
    for row in rows {
        let (person_id, name, kind, character, order, department, job, profile_path, gender, known_for) = row?;
        credits.push(CreditEntry {
            person_id: person_id as u64,
            name,
            kind: CreditKind::from_db_str(&kind).ok_or_else(|| StoreError::Corrupt {
                column: "movie_credits.credit_type",
                message: kind.clone(),
            })?,
            character,
            order,
            department,
            job,
            profile_path,
            gender,
            known_for_department: known_for,
        });
    }
    Ok(credits)
}

fn load_keywords(conn: &Connection, movie_id: i64) -> StoreResult<Vec<KeywordEntry>> {
    let mut stmt = conn.prepare("SELECT tmdb_id, name FROM movie_keywords WHERE movie_id = ?1 ORDER BY id")?;
    let keywords = stmt
        .query_map(params![movie_id], |row| {
            Ok(KeywordEntry {
                id: row.get::<_, Option<i64>>(0)?.unwrap_or_default() as u64,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keywords)
}

/// Fixed-width RFC 3339 in UTC, so text comparison orders correctly.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column,
            message: format!("{}: {}", raw, e),
        })
}

fn parse_date(column: &'static str, raw: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| StoreError::Corrupt {
        column,
        message: format!("{}: {}", raw, e),
    })
}
