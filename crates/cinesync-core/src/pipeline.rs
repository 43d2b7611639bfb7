use crate::batch_file::{BatchFileStore, BatchType};
use crate::enrich::Enricher;
use crate::reconcile::{collapse_duplicates, reconcile};
use crate::store::{MovieStore, StoreCounts};
use crate::upsert::{BatchUpsertEngine, FailedRecord};
use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use cinesync_models::{CatalogItem, ChangeRecord, MovieRecord};
use cinesync_sources::{CatalogApi, ErrorCategory, FailureTally, MovieLensLoader, TallySnapshot};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hook for surfacing run progress (progress bars in the CLI).
pub trait ProgressObserver: Send + Sync {
    fn stage(&self, _message: &str) {}
    /// New candidates were queued for this run.
    fn queued(&self, _count: usize) {}
    /// Candidates finished: stored, written to a file, or dropped.
    fn handled(&self, _count: usize) {}
}

pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Everything a run needs, built once at start-up and dropped at the end.
pub struct SyncContext {
    pub api: Arc<dyn CatalogApi>,
    pub store: MovieStore,
    pub loader: Option<Arc<MovieLensLoader>>,
    pub tally: Arc<FailureTally>,
    pub batch_files: Option<BatchFileStore>,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn ProgressObserver>,
    pub batch_size: usize,
    pub max_workers: usize,
}

impl SyncContext {
    pub fn new(api: Arc<dyn CatalogApi>, store: MovieStore, tally: Arc<FailureTally>) -> Self {
        Self {
            api,
            store,
            loader: None,
            tally,
            batch_files: None,
            cancel: CancellationToken::new(),
            observer: Arc::new(NoProgress),
            batch_size: 200,
            max_workers: 10,
        }
    }

    pub fn with_loader(mut self, loader: Arc<MovieLensLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_batch_files(mut self, batch_files: BatchFileStore) -> Self {
        self.batch_files = Some(batch_files);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }
}

/// End-of-run summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub operation: String,
    pub candidates: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Records written to batch files by fetch-only runs.
    pub fetched: usize,
    pub failures: TallySnapshot,
    pub failed_records: Vec<FailedRecord>,
    pub files: Vec<PathBuf>,
    pub cancelled: bool,
    pub fatal: Option<String>,
    pub duration_secs: f64,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_clean() && !self.cancelled && self.fatal.is_none()
    }

    fn persistence_failures(&self) -> usize {
        self.failed_records
            .iter()
            .filter(|f| f.category == ErrorCategory::Persistence)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item: CatalogItem,
    /// Already present in the store.
    pub stored: bool,
}

/// What a fetch-only run should collect.
#[derive(Debug, Clone)]
pub enum FetchRequest {
    Initial { start_year: i32, end_year: i32, enrich: bool },
    Missing { after_date: Option<NaiveDate>, end_year: Option<i32> },
    Changes { days: u32 },
}

struct Run {
    report: RunReport,
    started: Instant,
    baseline: TallySnapshot,
}

/// Orchestrates loader, catalog, reconciler and upsert engine for each
/// command.
pub struct SyncPipeline {
    ctx: SyncContext,
    engine: BatchUpsertEngine,
    enricher: Enricher,
}

impl SyncPipeline {
    pub fn new(ctx: SyncContext) -> Self {
        let engine = BatchUpsertEngine::new(ctx.store.clone(), Arc::clone(&ctx.tally));
        let enricher = Enricher::new(Arc::clone(&ctx.api), ctx.max_workers);
        Self { ctx, engine, enricher }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Load MovieLens titles in the year range, optionally enriching linked
    /// ones from the catalog.
    pub async fn initial_load(&self, start_year: i32, end_year: i32, enrich: bool) -> Result<RunReport> {
        anyhow::ensure!(start_year <= end_year, "start year {} is after end year {}", start_year, end_year);
        let loader = self.loader()?;
        if enrich {
            self.ensure_reachable().await?;
        }

        let mut run = self.begin("initial_load");
        let mut records = Vec::new();
        for year in start_year..=end_year {
            if self.stop_requested(&mut run) {
                break;
            }
            let titles = local_records(loader, year);
            if titles.is_empty() {
                continue;
            }
            info!(operation = "initial_load", year, count = titles.len(), "Collected year");
            self.queue(&mut run, titles.len());
            records.extend(titles);
        }

        self.ctx
            .observer
            .stage(&format!("Loading {} titles from {} to {}", records.len(), start_year, end_year));
        if enrich {
            self.enrich_and_persist(records, &mut run).await;
        } else {
            self.persist(records, &mut run);
        }
        Ok(self.finish(run))
    }

    /// Re-sync every catalog ID changed in the last `days` days.
    pub async fn process_changes(&self, days: u32) -> Result<RunReport> {
        self.ensure_reachable().await?;
        let mut run = self.begin("changes");
        let ids = self
            .ctx
            .api
            .changed_movie_ids(days)
            .await
            .context("Failed to fetch changed movie ids")?;
        info!(operation = "changes", days, count = ids.len(), "Processing changed movies");
        self.queue(&mut run, ids.len());

        self.enrich_and_persist(ids.into_iter().map(bare_record).collect(), &mut run)
            .await;
        Ok(self.finish(run))
    }

    pub async fn update_movie(&self, tmdb_id: u64) -> Result<RunReport> {
        self.ensure_reachable().await?;
        let mut run = self.begin("update");
        self.queue(&mut run, 1);
        self.enrich_and_persist(vec![bare_record(tmdb_id)], &mut run).await;
        Ok(self.finish(run))
    }

    /// Add catalog movies released after `after_date` (default: the newest
    /// release date already stored) that the store does not have yet.
    pub async fn missing(&self, after_date: Option<NaiveDate>, end_year: Option<i32>) -> Result<RunReport> {
        self.ensure_reachable().await?;
        let mut run = self.begin("missing");
        let records = self.missing_records(after_date, end_year, &mut run).await?;
        self.enrich_and_persist(records, &mut run).await;
        Ok(self.finish(run))
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let items = self
            .ctx
            .api
            .search(query)
            .await
            .with_context(|| format!("Search for '{}' failed", query))?;
        let ids: Vec<u64> = items.iter().map(|i| i.id).collect();
        let existing = self.ctx.store.existing_ids(&ids)?;
        Ok(items
            .into_iter()
            .map(|item| SearchHit {
                stored: existing.contains_key(&item.id),
                item,
            })
            .collect())
    }

    /// Fetch half only: collect records and write them to batch files.
    pub async fn fetch_to_file(&self, request: FetchRequest) -> Result<RunReport> {
        let batch_files = self.batch_files()?;
        match request {
            FetchRequest::Initial { start_year, end_year, enrich } => {
                anyhow::ensure!(start_year <= end_year, "start year {} is after end year {}", start_year, end_year);
                let loader = self.loader()?;
                if enrich {
                    self.ensure_reachable().await?;
                }
                let mut run = self.begin("fetch_initial");
                for year in start_year..=end_year {
                    if self.stop_requested(&mut run) {
                        break;
                    }
                    let mut records = local_records(loader, year);
                    if records.is_empty() {
                        continue;
                    }
                    self.queue(&mut run, records.len());
                    if enrich {
                        records = self.enrich_all(records, &mut run).await;
                    }
                    self.save(batch_files, BatchType::Initial, &year.to_string(), records, &mut run)?;
                    if run.report.fatal.is_some() {
                        break;
                    }
                }
                Ok(self.finish(run))
            }
            FetchRequest::Missing { after_date, end_year } => {
                self.ensure_reachable().await?;
                let mut run = self.begin("fetch_missing");
                let records = self.missing_records(after_date, end_year, &mut run).await?;
                let records = self.enrich_all(records, &mut run).await;
                let batch_id = run_batch_id();
                self.save(batch_files, BatchType::Missing, &batch_id, records, &mut run)?;
                Ok(self.finish(run))
            }
            FetchRequest::Changes { days } => {
                self.ensure_reachable().await?;
                let mut run = self.begin("fetch_changes");
                let ids = self
                    .ctx
                    .api
                    .changed_movie_ids(days)
                    .await
                    .context("Failed to fetch changed movie ids")?;
                self.queue(&mut run, ids.len());
                let records = self.enrich_all(ids.into_iter().map(bare_record).collect(), &mut run).await;
                let batch_id = run_batch_id();
                self.save(batch_files, BatchType::Changes, &batch_id, records, &mut run)?;
                Ok(self.finish(run))
            }
        }
    }

    /// Load half only: upsert batch files and move them to `processed/`.
    ///
    /// Duplicates across files resolve last-write-wins in file-name order.
    /// Files stay in `raw/` when any batch failed to persist or the run was
    /// interrupted; reloading them is idempotent.
    pub async fn load_from_files(&self, file: Option<PathBuf>, batch_type: Option<BatchType>) -> Result<RunReport> {
        let batch_files = self.batch_files()?;
        let mut run = self.begin("load");

        let files = match file {
            Some(path) => vec![path],
            None => batch_files.unprocessed(batch_type)?,
        };
        if files.is_empty() {
            info!(operation = "load", "No unprocessed batch files");
            return Ok(self.finish(run));
        }

        let mut loaded = Vec::new();
        let mut records = Vec::new();
        for path in files {
            match batch_files.load_batch(&path) {
                Ok(batch) => {
                    info!(path = %path.display(), movies = batch.movies.len(), "Loaded batch file");
                    records.extend(batch.movies);
                    loaded.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %format!("{:#}", e), "Leaving unreadable batch file in place");
                    self.ctx.tally.record(ErrorCategory::Validation);
                }
            }
        }
        run.report.candidates = records.len();

        let plan = reconcile(records, &HashMap::new());
        let mut merged = plan.to_create;
        merged.extend(plan.rejected);
        self.ctx.observer.queued(merged.len());
        self.persist(merged, &mut run);

        if run.report.cancelled || run.report.persistence_failures() > 0 {
            warn!(operation = "load", files = loaded.len(), "Batch files left unprocessed");
            return Ok(self.finish(run));
        }
        let raw_dir = batch_files.raw_dir();
        for path in loaded {
            if path.parent() == Some(raw_dir.as_path()) {
                run.report.files.push(batch_files.mark_processed(&path)?);
            }
        }
        Ok(self.finish(run))
    }

    pub fn clear(&self) -> Result<StoreCounts> {
        Ok(self.ctx.store.clear()?)
    }

    pub fn history(&self, days: u32) -> Result<Vec<ChangeRecord>> {
        Ok(self.ctx.store.recent_changes(days)?)
    }

    async fn ensure_reachable(&self) -> Result<()> {
        self.ctx
            .api
            .ping()
            .await
            .with_context(|| format!("{} API is not reachable", self.ctx.api.source_name()))
    }

    fn loader(&self) -> Result<&MovieLensLoader> {
        self.ctx
            .loader
            .as_deref()
            .context("MovieLens dataset is not loaded; set [movielens] data_dir in the config")
    }

    fn batch_files(&self) -> Result<&BatchFileStore> {
        self.ctx.batch_files.as_ref().context("Batch file directory is not configured")
    }

    async fn missing_records(
        &self,
        after_date: Option<NaiveDate>,
        end_year: Option<i32>,
        run: &mut Run,
    ) -> Result<Vec<MovieRecord>> {
        let after = match after_date {
            Some(date) => date,
            None => self
                .ctx
                .store
                .latest_release_date()?
                .context("The store has no release dates yet; pass --after-date or run init first")?,
        };

        let found = match end_year {
            None => self.ctx.api.movies_since(after).await.context("Failed to list recent movies")?,
            Some(end) => {
                let mut found = Vec::new();
                for year in after.year()..=end {
                    if self.stop_requested(run) {
                        break;
                    }
                    self.ctx.observer.stage(&format!("Discovering {}", year));
                    match self.ctx.api.discover_year(year, None).await {
                        Ok(items) => found.extend(items),
                        Err(e) if e.is_fatal() => return Err(e).context("Catalog discovery failed"),
                        Err(e) => warn!(year, error = %e, "Skipping year after discovery failure"),
                    }
                }
                found
            }
        };

        let mut seen = HashSet::new();
        let candidates: Vec<CatalogItem> = found
            .into_iter()
            .filter(|item| item.release_date.map_or(false, |d| d > after))
            .filter(|item| seen.insert(item.id))
            .collect();
        let ids: Vec<u64> = candidates.iter().map(|i| i.id).collect();
        let existing = self.ctx.store.existing_ids(&ids)?;

        let records: Vec<MovieRecord> = candidates
            .into_iter()
            .filter(|item| !existing.contains_key(&item.id))
            .map(MovieRecord::from_catalog)
            .collect();
        info!(
            operation = "missing",
            after = %after,
            found = ids.len(),
            missing = records.len(),
            "Found movies missing from the store"
        );
        self.queue(run, records.len());
        Ok(records)
    }

    fn begin(&self, operation: &str) -> Run {
        info!(operation, "Run started");
        Run {
            report: RunReport {
                operation: operation.to_string(),
                ..RunReport::default()
            },
            started: Instant::now(),
            baseline: self.ctx.tally.snapshot(),
        }
    }

    fn finish(&self, mut run: Run) -> RunReport {
        run.report.failures = self.ctx.tally.snapshot().since(&run.baseline);
        run.report.duration_secs = run.started.elapsed().as_secs_f64();
        let report = run.report;
        info!(
            operation = %report.operation,
            candidates = report.candidates,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failures = %report.failures,
            cancelled = report.cancelled,
            duration_secs = report.duration_secs,
            "Run finished"
        );
        report
    }

    fn queue(&self, run: &mut Run, count: usize) {
        run.report.candidates += count;
        self.ctx.observer.queued(count);
    }

    fn stop_requested(&self, run: &mut Run) -> bool {
        if self.ctx.cancel.is_cancelled() {
            if !run.report.cancelled {
                warn!(operation = %run.report.operation, "Interrupted, not starting further work");
            }
            run.report.cancelled = true;
        }
        run.report.cancelled
    }

    /// Merge candidates sharing an external ID before any of them is looked
    /// up or written, so each movie gets one upsert and one change per run.
    fn collapse(&self, records: Vec<MovieRecord>, run: &Run) -> Vec<MovieRecord> {
        let before = records.len();
        let merged = collapse_duplicates(records);
        let dropped = before - merged.len();
        if dropped > 0 {
            debug!(operation = %run.report.operation, dropped, "Merged duplicate candidates");
            self.ctx.observer.handled(dropped);
        }
        merged
    }

    /// Upsert in `batch_size` chunks, one transaction each.
    fn persist(&self, records: Vec<MovieRecord>, run: &mut Run) {
        let records = self.collapse(records, run);
        let mut remaining = records.into_iter().peekable();
        while remaining.peek().is_some() {
            if self.stop_requested(run) {
                break;
            }
            let chunk: Vec<MovieRecord> = remaining.by_ref().take(self.ctx.batch_size).collect();
            self.write_chunk(chunk, run);
        }
    }

    fn write_chunk(&self, chunk: Vec<MovieRecord>, run: &mut Run) {
        if chunk.is_empty() {
            return;
        }
        let handled = chunk.len();
        let outcome = self.engine.upsert_batch(chunk);
        run.report.created += outcome.created;
        run.report.updated += outcome.updated;
        run.report.failed_records.extend(outcome.failed);
        self.ctx.observer.handled(handled);
    }

    /// Enrich and persist chunk by chunk so finished work is durable before
    /// the next chunk starts. A chunk whose lookups already ran is written
    /// even when the run is interrupted meanwhile.
    async fn enrich_and_persist(&self, records: Vec<MovieRecord>, run: &mut Run) {
        let records = self.collapse(records, run);
        let mut remaining = records.into_iter().peekable();
        while remaining.peek().is_some() {
            if self.stop_requested(run) {
                break;
            }
            let chunk: Vec<MovieRecord> = remaining.by_ref().take(self.ctx.batch_size).collect();
            let enriched = self.enrich_chunk(chunk, run).await;
            self.write_chunk(enriched, run);
            if run.report.fatal.is_some() {
                break;
            }
        }
    }

    async fn enrich_all(&self, records: Vec<MovieRecord>, run: &mut Run) -> Vec<MovieRecord> {
        let records = self.collapse(records, run);
        let mut collected = Vec::with_capacity(records.len());
        let mut remaining = records.into_iter().peekable();
        while remaining.peek().is_some() {
            if self.stop_requested(run) {
                break;
            }
            let chunk: Vec<MovieRecord> = remaining.by_ref().take(self.ctx.batch_size).collect();
            collected.extend(self.enrich_chunk(chunk, run).await);
            if run.report.fatal.is_some() {
                break;
            }
        }
        collected
    }

    async fn enrich_chunk(&self, chunk: Vec<MovieRecord>, run: &mut Run) -> Vec<MovieRecord> {
        self.ctx.observer.stage(&format!("Fetching catalog details for {} movies", chunk.len()));
        let requested = chunk.len();
        let report = self.enricher.enrich(chunk, &self.ctx.cancel).await;
        self.ctx
            .observer
            .handled(requested.saturating_sub(report.records.len()));
        run.report.skipped += report.skipped;
        run.report.cancelled |= report.cancelled;
        if let Some(fatal) = report.fatal {
            run.report.fatal = Some(fatal.to_string());
        }
        report.records
    }

    fn save(
        &self,
        batch_files: &BatchFileStore,
        batch_type: BatchType,
        batch_id: &str,
        records: Vec<MovieRecord>,
        run: &mut Run,
    ) -> Result<()> {
        if records.is_empty() {
            info!(operation = %run.report.operation, batch_id, "Nothing to write");
            return Ok(());
        }
        let count = records.len();
        let path = batch_files.save_batch(batch_type, batch_id, records)?;
        run.report.fetched += count;
        self.ctx.observer.handled(count);
        run.report.files.push(path);
        Ok(())
    }
}

fn bare_record(tmdb_id: u64) -> MovieRecord {
    MovieRecord {
        tmdb_id: Some(tmdb_id),
        ..MovieRecord::default()
    }
}

fn local_records(loader: &MovieLensLoader, year: i32) -> Vec<MovieRecord> {
    loader
        .items_for_year(year)
        .map(|item| MovieRecord::from_local(&item))
        .collect()
}

fn run_batch_id() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{catalog_item, FakeCatalog};
    use cinesync_models::ChangeKind;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_movielens(dir: &Path) {
        fs::write(
            dir.join("movies.csv"),
            "movieId,title,genres\n\
             1,Toy Story (1995),Adventure|Animation\n\
             2,Jumanji (1995),Adventure|Fantasy\n\
             3,Heat (1995),Action|Crime\n\
             4,Inception (2010),Action|Sci-Fi\n",
        )
        .unwrap();
        fs::write(
            dir.join("links.csv"),
            "movieId,imdbId,tmdbId\n1,0114709,862\n2,0113497,8844\n3,0113277,\n4,1375666,27205\n",
        )
        .unwrap();
        fs::write(
            dir.join("ratings.csv"),
            "userId,movieId,rating,timestamp\n1,1,4.0,964982703\n1,4,5.0,964982703\n",
        )
        .unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        pipeline: SyncPipeline,
        fake: Arc<FakeCatalog>,
    }

    fn fixture(fake: FakeCatalog) -> Fixture {
        fixture_with_cancel(fake, CancellationToken::new())
    }

    fn fixture_with_cancel(fake: FakeCatalog, cancel: CancellationToken) -> Fixture {
        fixture_from(fake, cancel, write_movielens)
    }

    fn fixture_from(fake: FakeCatalog, cancel: CancellationToken, write: impl FnOnce(&Path)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ml_dir = dir.path().join("movielens");
        fs::create_dir_all(&ml_dir).unwrap();
        write(&ml_dir);

        let fake = Arc::new(fake);
        let ctx = SyncContext::new(
            fake.clone(),
            MovieStore::open_in_memory().unwrap(),
            Arc::new(FailureTally::new()),
        )
        .with_loader(Arc::new(MovieLensLoader::load(&ml_dir).unwrap()))
        .with_batch_files(BatchFileStore::new(dir.path().join("batches")).unwrap())
        .with_cancel(cancel)
        .with_batch_size(2)
        .with_max_workers(3);

        Fixture {
            _dir: dir,
            pipeline: SyncPipeline::new(ctx),
            fake,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_initial_load_without_enrichment() {
        let f = fixture(FakeCatalog::default());

        let report = f.pipeline.initial_load(1990, 2020, false).await.unwrap();
        assert_eq!(report.candidates, 4);
        assert_eq!(report.created, 3);
        assert_eq!(report.failures.rejected, 1);
        assert_eq!(f.fake.calls(), 0);

        let store = &f.pipeline.context().store;
        let toy_story = store.movie_by_tmdb_id(862).unwrap().unwrap();
        assert_eq!(toy_story.record.title.as_deref(), Some("Toy Story"));
        assert_eq!(toy_story.record.movielens_id, Some(1));
        assert_eq!(toy_story.record.movielens_num_ratings, 1);

        let again = f.pipeline.initial_load(1990, 2020, false).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.updated, 3);
        assert_eq!(store.counts().unwrap().movies, 3);
    }

    #[tokio::test]
    async fn test_initial_load_with_enrichment() {
        let mut inception = catalog_item(27205, "Inception", "2010-07-15");
        inception.runtime = Some(148);
        let f = fixture(FakeCatalog::with_movies([inception]));

        let report = f.pipeline.initial_load(2010, 2010, true).await.unwrap();
        assert_eq!(report.created, 1);

        let stored = f.pipeline.context().store.movie_by_tmdb_id(27205).unwrap().unwrap();
        assert_eq!(stored.record.runtime, Some(148));
        assert_eq!(stored.record.movielens_id, Some(4));
        assert_eq!(stored.record.movielens_rating, Some(5.0));
    }

    /// Two titles linked to the same catalog movie, one year apart.
    fn write_linked_twice(dir: &Path) {
        fs::write(
            dir.join("movies.csv"),
            "movieId,title,genres\n\
             1,Alpha (2001),Drama\n\
             2,Beta (2001),Comedy\n\
             3,Alpha Redux (2002),Drama\n",
        )
        .unwrap();
        fs::write(
            dir.join("links.csv"),
            "movieId,imdbId,tmdbId\n1,0000001,42\n2,0000002,7\n3,0000003,42\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_links_across_chunks_write_once() {
        let f = fixture_from(FakeCatalog::default(), CancellationToken::new(), write_linked_twice);

        let report = f.pipeline.initial_load(2001, 2002, false).await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 0);

        let store = &f.pipeline.context().store;
        assert_eq!(store.counts().unwrap().movies, 2);
        let alpha = store.movie_by_tmdb_id(42).unwrap().unwrap();
        assert_eq!(alpha.record.movielens_id, Some(3));
        assert_eq!(f.pipeline.history(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enriched_duplicates_keep_the_later_candidate() {
        let mut fake = FakeCatalog::with_movies([
            catalog_item(42, "Alpha", "2001-05-01"),
            catalog_item(7, "Beta", "2001-06-01"),
        ]);
        fake.delay = Some(std::time::Duration::from_millis(20));
        let f = fixture_from(fake, CancellationToken::new(), write_linked_twice);

        let report = f.pipeline.initial_load(2001, 2002, true).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 0);
        assert_eq!(f.fake.calls(), 2);

        let alpha = f.pipeline.context().store.movie_by_tmdb_id(42).unwrap().unwrap();
        assert_eq!(alpha.record.movielens_id, Some(3));
        assert_eq!(f.pipeline.history(1).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unlinked_title_is_only_rejected_when_enriching() {
        let f = fixture(FakeCatalog::default());

        let report = f.pipeline.initial_load(1995, 1995, true).await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.created, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failures.rejected, 1);
    }

    #[tokio::test]
    async fn test_interrupted_enrichment_keeps_finished_lookups() {
        let cancel = CancellationToken::new();
        let mut fake = FakeCatalog::with_movies([
            catalog_item(1, "One", "2020-01-01"),
            catalog_item(2, "Two", "2020-02-01"),
            catalog_item(3, "Three", "2020-03-01"),
        ]);
        fake.changed = vec![1, 2, 3];
        fake.cancel_on_lookup = Some((1, cancel.clone()));
        let f = fixture_with_cancel(fake, cancel);

        let report = f.pipeline.process_changes(1).await.unwrap();
        assert!(report.cancelled);
        assert!(report.created >= 1);

        let store = &f.pipeline.context().store;
        assert!(store.movie_by_tmdb_id(1).unwrap().is_some());
        assert!(store.movie_by_tmdb_id(3).unwrap().is_none());
        assert_eq!(store.counts().unwrap().movies, report.created);
    }

    #[tokio::test]
    async fn test_unreachable_catalog_aborts_before_any_work() {
        let fake = FakeCatalog {
            unreachable: true,
            changed: vec![1],
            ..FakeCatalog::default()
        };
        let f = fixture(fake);

        assert!(f.pipeline.process_changes(1).await.is_err());
        assert!(f.pipeline.initial_load(1995, 1995, true).await.is_err());
        assert_eq!(f.fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_process_changes_creates_found_movies() {
        let mut fake = FakeCatalog::with_movies([
            catalog_item(1, "One", "2020-01-01"),
            catalog_item(2, "Two", "2020-02-01"),
        ]);
        fake.changed = vec![1, 2, 3];
        let f = fixture(fake);

        let report = f.pipeline.process_changes(1).await.unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.created, 2);
        assert_eq!(f.fake.calls(), 3);

        let history = f.pipeline.history(1).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|c| c.kind == ChangeKind::Create));
    }

    #[tokio::test]
    async fn test_update_movie_updates_existing_row() {
        let f = fixture(FakeCatalog::with_movies([catalog_item(862, "Toy Story", "1995-10-30")]));
        f.pipeline.initial_load(1995, 1995, false).await.unwrap();

        let report = f.pipeline.update_movie(862).await.unwrap();
        assert_eq!(report.updated, 1);
        let stored = f.pipeline.context().store.movie_by_tmdb_id(862).unwrap().unwrap();
        assert_eq!(stored.record.release_date, Some(date("1995-10-30")));
        assert_eq!(stored.record.movielens_id, Some(1));
    }

    #[tokio::test]
    async fn test_missing_only_adds_newer_unknown_movies() {
        let f = fixture(FakeCatalog::with_movies([
            catalog_item(10, "Old", "2019-06-01"),
            catalog_item(11, "Same Day", "2020-01-01"),
            catalog_item(12, "New", "2021-03-01"),
            catalog_item(13, "Newer", "2022-03-01"),
        ]));

        // Nothing stored yet and no date given
        assert!(f.pipeline.missing(None, None).await.is_err());

        let seeded = f.pipeline.missing(Some(date("2021-12-31")), None).await.unwrap();
        assert_eq!(seeded.created, 1);

        let report = f.pipeline.missing(Some(date("2020-01-01")), Some(2022)).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.created, 1);
        assert!(f.pipeline.context().store.movie_by_tmdb_id(12).unwrap().is_some());
        assert!(f.pipeline.context().store.movie_by_tmdb_id(11).unwrap().is_none());

        // Default cutoff is the newest stored release date, 2022-03-01
        let nothing_new = f.pipeline.missing(None, None).await.unwrap();
        assert_eq!(nothing_new.candidates, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let f = fixture_with_cancel(FakeCatalog::default(), cancel);

        let report = f.pipeline.initial_load(1990, 2020, false).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.created, 0);
        assert_eq!(f.pipeline.context().store.counts().unwrap().movies, 0);
    }

    #[tokio::test]
    async fn test_fetch_then_load_round_trip() {
        let f = fixture(FakeCatalog::default());

        let fetched = f
            .pipeline
            .fetch_to_file(FetchRequest::Initial {
                start_year: 1995,
                end_year: 2010,
                enrich: false,
            })
            .await
            .unwrap();
        assert_eq!(fetched.files.len(), 2);
        assert_eq!(fetched.fetched, 4);
        assert_eq!(f.pipeline.context().store.counts().unwrap().movies, 0);

        let loaded = f.pipeline.load_from_files(None, Some(BatchType::Initial)).await.unwrap();
        assert_eq!(loaded.created, 3);
        assert_eq!(loaded.failures.rejected, 1);
        assert_eq!(loaded.files.len(), 2);

        let batch_files = f.pipeline.context().batch_files.as_ref().unwrap();
        assert!(batch_files.unprocessed(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_resolves_duplicates_across_files() {
        let f = fixture(FakeCatalog::default());
        let batch_files = f.pipeline.context().batch_files.as_ref().unwrap();
        let movie = |title: &str| MovieRecord {
            tmdb_id: Some(42),
            title: Some(title.to_string()),
            ..MovieRecord::default()
        };
        fs::write(
            batch_files.raw_dir().join("changes_a_20240101_000000.yaml"),
            serde_yaml::to_string(&crate::batch_file::BatchFile {
                metadata: crate::batch_file::BatchMetadata {
                    batch_type: BatchType::Changes,
                    batch_id: "a".to_string(),
                    timestamp: "20240101_000000".to_string(),
                    movie_count: 1,
                    schema_version: "1.0".to_string(),
                },
                movies: vec![movie("First")],
            })
            .unwrap(),
        )
        .unwrap();
        batch_files.save_batch(BatchType::Changes, "b", vec![movie("Second")]).unwrap();
        fs::write(batch_files.raw_dir().join("changes_c_20240101_000000.yaml"), "metadata: [broken").unwrap();

        let report = f.pipeline.load_from_files(None, None).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failures.validation, 1);
        let stored = f.pipeline.context().store.movie_by_tmdb_id(42).unwrap().unwrap();
        assert_eq!(stored.record.title.as_deref(), Some("Second"));

        // The unreadable file stays behind
        let left: Vec<_> = batch_files.unprocessed(None).unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].ends_with("changes_c_20240101_000000.yaml"));
    }

    #[tokio::test]
    async fn test_search_marks_stored_hits() {
        let f = fixture(FakeCatalog::with_movies([
            catalog_item(862, "Toy Story", "1995-10-30"),
            catalog_item(10193, "Toy Story 3", "2010-06-16"),
        ]));
        f.pipeline.initial_load(1995, 1995, false).await.unwrap();

        let hits = f.pipeline.search("toy story").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().find(|h| h.item.id == 862).unwrap().stored);
        assert!(!hits.iter().find(|h| h.item.id == 10193).unwrap().stored);
    }

    #[derive(Default)]
    struct CountingObserver {
        queued: std::sync::atomic::AtomicUsize,
        handled: std::sync::atomic::AtomicUsize,
    }

    impl ProgressObserver for CountingObserver {
        fn queued(&self, count: usize) {
            self.queued.fetch_add(count, std::sync::atomic::Ordering::SeqCst);
        }

        fn handled(&self, count: usize) {
            self.handled.fetch_add(count, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_progress_accounts_for_every_candidate() {
        let mut fake = FakeCatalog::with_movies([catalog_item(1, "One", "2020-01-01")]);
        fake.changed = vec![1, 2, 3];
        let observer = Arc::new(CountingObserver::default());
        let ctx = SyncContext::new(
            Arc::new(fake),
            MovieStore::open_in_memory().unwrap(),
            Arc::new(FailureTally::new()),
        )
        .with_observer(observer.clone())
        .with_batch_size(2);

        SyncPipeline::new(ctx).process_changes(1).await.unwrap();
        assert_eq!(observer.queued.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(observer.handled.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let f = fixture(FakeCatalog::default());
        f.pipeline.initial_load(1995, 1995, false).await.unwrap();

        let removed = f.pipeline.clear().unwrap();
        assert_eq!(removed.movies, 2);
        assert_eq!(f.pipeline.context().store.counts().unwrap().movies, 0);
    }
}
