use crate::reconcile::{external_ids, reconcile};
use crate::store::{existing_ids_in, format_timestamp, MovieStore, StoreError, StoreResult};
use chrono::Utc;
use cinesync_models::{ChangeKind, MovieRecord};
use cinesync_sources::{ErrorCategory, FailureTally};
use rusqlite::{params, Transaction};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A record that did not make it into the store.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub tmdb_id: Option<u64>,
    pub title: Option<String>,
    pub category: ErrorCategory,
    pub reason: String,
}

impl FailedRecord {
    fn new(record: &MovieRecord, category: ErrorCategory, reason: impl Into<String>) -> Self {
        Self {
            tmdb_id: record.external_id(),
            title: record.title.clone(),
            category,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct UpsertOutcome {
    pub created: usize,
    pub updated: usize,
    pub failed: Vec<FailedRecord>,
    /// How many of `failed` were candidates without any external ID.
    pub rejected: usize,
}

impl UpsertOutcome {
    pub fn merge(&mut self, other: UpsertOutcome) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed.extend(other.failed);
        self.rejected += other.rejected;
    }

    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

/// Writes reconciled records into the store, one transaction per batch.
///
/// Records are validated before the transaction opens, so a malformed record
/// is skipped without touching the batch. A database error rolls the whole
/// batch back; batches committed earlier stay.
pub struct BatchUpsertEngine {
    store: MovieStore,
    tally: Arc<FailureTally>,
}

impl BatchUpsertEngine {
    pub fn new(store: MovieStore, tally: Arc<FailureTally>) -> Self {
        Self { store, tally }
    }

    pub fn store(&self) -> &MovieStore {
        &self.store
    }

    pub fn upsert_batch(&self, records: Vec<MovieRecord>) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();
        let mut valid = Vec::with_capacity(records.len());

        for record in records {
            if record.external_id().is_none() {
                warn!(title = record.title.as_deref().unwrap_or("<untitled>"), "Skipping record without an external ID");
                self.tally.record_rejected(1);
                outcome.rejected += 1;
                outcome.failed.push(FailedRecord::new(&record, ErrorCategory::Validation, "missing external id"));
            } else if record.valid_title().is_none() {
                warn!(tmdb_id = ?record.external_id(), "Skipping record without a title");
                self.tally.record(ErrorCategory::Validation);
                outcome.failed.push(FailedRecord::new(&record, ErrorCategory::Validation, "missing title"));
            } else {
                valid.push(record);
            }
        }

        if valid.is_empty() {
            return outcome;
        }

        let batch_len = valid.len();
        // Kept for failure reporting if the transaction rolls back
        let identities: Vec<FailedRecord> = valid
            .iter()
            .map(|r| FailedRecord::new(r, ErrorCategory::Persistence, String::new()))
            .collect();

        match self.store.transaction(|tx| write_batch(tx, valid)) {
            Ok((created, updated)) => {
                debug!(created, updated, "Committed batch");
                outcome.created += created;
                outcome.updated += updated;
            }
            Err(e) => {
                error!(error = %e, records = batch_len, "Batch rolled back");
                self.tally.record_many(ErrorCategory::Persistence, batch_len);
                let reason = e.to_string();
                outcome.failed.extend(identities.into_iter().map(|mut f| {
                    f.reason = reason.clone();
                    f
                }));
            }
        }
        outcome
    }
}

fn write_batch(tx: &Transaction<'_>, records: Vec<MovieRecord>) -> StoreResult<(usize, usize)> {
    let ids = external_ids(&records);
    let existing = existing_ids_in(tx, &ids)?;
    let plan = reconcile(records, &existing);
    let now = format_timestamp(Utc::now());

    let mut created = 0;
    for record in &plan.to_create {
        let movie_id = insert_movie(tx, record, &now)?;
        replace_children(tx, movie_id, record)?;
        append_change(tx, movie_id, ChangeKind::Create, record, &now)?;
        created += 1;
    }

    let mut updated = 0;
    for (movie_id, record) in &plan.to_update {
        update_movie(tx, *movie_id, record, &now)?;
        replace_children(tx, *movie_id, record)?;
        append_change(tx, *movie_id, ChangeKind::Update, record, &now)?;
        updated += 1;
    }
    Ok((created, updated))
}

fn tags_json(record: &MovieRecord) -> StoreResult<String> {
    serde_json::to_string(&record.movielens_tags).map_err(|e| StoreError::Corrupt {
        column: "movies.movielens_tags",
        message: e.to_string(),
    })
}

fn insert_movie(tx: &Transaction<'_>, record: &MovieRecord, now: &str) -> StoreResult<i64> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO movies (
            tmdb_id, movielens_id, title, original_title, release_date, overview, tagline,
            poster_path, backdrop_path, adult, original_language, runtime, status, popularity,
            vote_average, vote_count, movielens_rating, movielens_num_ratings, movielens_tags,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?20)",
    )?;
    stmt.execute(params![
        record.external_id().map(|id| id as i64),
        record.movielens_id.map(|id| id as i64),
        record.valid_title(),
        record.original_title,
        record.release_date.map(|d| d.format("%Y-%m-%d").to_string()),
        record.overview,
        record.tagline,
        record.poster_path,
        record.backdrop_path,
        record.adult,
        record.original_language,
        record.runtime,
        record.status,
        record.popularity,
        record.vote_average,
        record.vote_count.map(|v| v as i64),
        record.movielens_rating,
        record.movielens_num_ratings as i64,
        tags_json(record)?,
        now,
    ])?;
    Ok(tx.last_insert_rowid())
}

/// Catalog fields missing from `record` keep their stored value. MovieLens
/// aggregates are only replaced when the record carries a MovieLens ID.
fn update_movie(tx: &Transaction<'_>, movie_id: i64, record: &MovieRecord, now: &str) -> StoreResult<()> {
    let mut stmt = tx.prepare_cached(
        "UPDATE movies SET
            movielens_id          = COALESCE(?2, movielens_id),
            title                 = ?3,
            original_title        = COALESCE(?4, original_title),
            release_date          = COALESCE(?5, release_date),
            overview              = COALESCE(?6, overview),
            tagline               = COALESCE(?7, tagline),
            poster_path           = COALESCE(?8, poster_path),
            backdrop_path         = COALESCE(?9, backdrop_path),
            adult                 = ?10,
            original_language     = COALESCE(?11, original_language),
            runtime               = COALESCE(?12, runtime),
            status                = COALESCE(?13, status),
            popularity            = COALESCE(?14, popularity),
            vote_average          = COALESCE(?15, vote_average),
            vote_count            = COALESCE(?16, vote_count),
            movielens_rating      = CASE WHEN ?2 IS NULL THEN movielens_rating ELSE ?17 END,
            movielens_num_ratings = CASE WHEN ?2 IS NULL THEN movielens_num_ratings ELSE ?18 END,
            movielens_tags        = CASE WHEN ?2 IS NULL THEN movielens_tags ELSE ?19 END,
            updated_at            = ?20
         WHERE id = ?1",
    )?;
    stmt.execute(params![
        movie_id,
        record.movielens_id.map(|id| id as i64),
        record.valid_title(),
        record.original_title,
        record.release_date.map(|d| d.format("%Y-%m-%d").to_string()),
        record.overview,
        record.tagline,
        record.poster_path,
        record.backdrop_path,
        record.adult,
        record.original_language,
        record.runtime,
        record.status,
        record.popularity,
        record.vote_average,
        record.vote_count.map(|v| v as i64),
        record.movielens_rating,
        record.movielens_num_ratings as i64,
        tags_json(record)?,
        now,
    ])?;
    Ok(())
}

/// Child collections are a full replacement set: delete, then reinsert.
fn replace_children(tx: &Transaction<'_>, movie_id: i64, record: &MovieRecord) -> StoreResult<()> {
    tx.execute("DELETE FROM movie_genres WHERE movie_id = ?1", params![movie_id])?;
    tx.execute("DELETE FROM movie_credits WHERE movie_id = ?1", params![movie_id])?;
    tx.execute("DELETE FROM movie_keywords WHERE movie_id = ?1", params![movie_id])?;

    for name in &record.genres {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        tx.prepare_cached("INSERT OR IGNORE INTO genres (name) VALUES (?1)")?
            .execute(params![name])?;
        let genre_id: i64 = tx
            .prepare_cached("SELECT id FROM genres WHERE name = ?1")?
            .query_row(params![name], |row| row.get(0))?;
        tx.prepare_cached("INSERT OR IGNORE INTO movie_genres (movie_id, genre_id) VALUES (?1, ?2)")?
            .execute(params![movie_id, genre_id])?;
    }

    for credit in &record.credits {
        tx.prepare_cached(
            "INSERT INTO people (tmdb_id, name, profile_path, gender, known_for_department)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tmdb_id) DO UPDATE SET
                name = excluded.name,
                profile_path = COALESCE(excluded.profile_path, people.profile_path),
                gender = COALESCE(excluded.gender, people.gender),
                known_for_department = COALESCE(excluded.known_for_department, people.known_for_department)",
        )?
        .execute(params![
            credit.person_id as i64,
            credit.name,
            credit.profile_path,
            credit.gender,
            credit.known_for_department,
        ])?;
        let person_id: i64 = tx
            .prepare_cached("SELECT id FROM people WHERE tmdb_id = ?1")?
            .query_row(params![credit.person_id as i64], |row| row.get(0))?;
        tx.prepare_cached(
            "INSERT INTO movie_credits (movie_id, person_id, credit_type, character, credit_order, department, job)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            movie_id,
            person_id,
            credit.kind.as_str(),
            credit.character,
            credit.order,
            credit.department,
            credit.job,
        ])?;
    }

    for keyword in &record.keywords {
        tx.prepare_cached("INSERT INTO movie_keywords (movie_id, tmdb_id, name) VALUES (?1, ?2, ?3)")?
            .execute(params![movie_id, keyword.id as i64, keyword.name])?;
    }
    Ok(())
}

fn append_change(tx: &Transaction<'_>, movie_id: i64, kind: ChangeKind, record: &MovieRecord, now: &str) -> StoreResult<()> {
    let details = serde_json::json!({
        "title": record.valid_title(),
        "movielens_id": record.movielens_id,
        "genres": record.genres.len(),
        "credits": record.credits.len(),
        "keywords": record.keywords.len(),
    });
    tx.prepare_cached("INSERT INTO movie_changes (movie_id, change_type, change_date, details) VALUES (?1, ?2, ?3, ?4)")?
        .execute(params![movie_id, kind.to_db_str(), now, details.to_string()])?;
    Ok(())
}
