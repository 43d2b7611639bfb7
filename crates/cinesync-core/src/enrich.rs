use cinesync_models::MovieRecord;
use cinesync_sources::{CatalogApi, ErrorCategory, ProgressTracker, SourceError};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing to look up; the record is passed through untouched and
    /// counted as rejected when it reaches the upsert engine.
    NoExternalId,
    /// The catalog flags the title as adult content.
    Adult,
    /// Not started because the run is shutting down.
    Cancelled,
}

/// Result of enriching one record.
#[derive(Debug)]
pub enum ItemOutcome {
    Success(MovieRecord),
    Skipped {
        record: Option<MovieRecord>,
        reason: SkipReason,
    },
    Failed {
        tmdb_id: u64,
        category: ErrorCategory,
        /// The unenriched record, kept when it can still be stored on its own.
        fallback: Option<MovieRecord>,
        error: Option<SourceError>,
    },
}

#[derive(Debug, Default)]
pub struct EnrichmentReport {
    /// Records ready for upsert, in completion order.
    pub records: Vec<MovieRecord>,
    pub enriched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// First error after which no further lookups were attempted.
    pub fatal: Option<SourceError>,
}

/// Fetches catalog details for many records through a bounded worker pool.
pub struct Enricher {
    api: Arc<dyn CatalogApi>,
    max_workers: usize,
}

impl Enricher {
    pub fn new(api: Arc<dyn CatalogApi>, max_workers: usize) -> Self {
        Self {
            api,
            max_workers: max_workers.max(1),
        }
    }

    /// Enrich `records` with up to `max_workers` lookups in flight.
    ///
    /// Cancelling `cancel` stops new lookups; ones already in flight finish and
    /// their results are returned. A fatal upstream error (bad credentials,
    /// unreachable API) stops the remaining work the same way.
    pub async fn enrich(&self, records: Vec<MovieRecord>, cancel: &CancellationToken) -> EnrichmentReport {
        let total = records.len();
        let stop = cancel.child_token();
        let mut tracker = ProgressTracker::new(total, 25);
        let mut report = EnrichmentReport::default();

        let api = self.api.as_ref();
        let mut outcomes = stream::iter(records.into_iter().map(|record| {
            let stop = stop.clone();
            async move { enrich_one(api, record, &stop).await }
        }))
        .buffer_unordered(self.max_workers);

        let mut seen = 0;
        while let Some(outcome) = outcomes.next().await {
            seen += 1;
            match outcome {
                ItemOutcome::Success(record) => {
                    report.enriched += 1;
                    tracker.record_success();
                    report.records.push(record);
                }
                ItemOutcome::Skipped { record, reason } => {
                    match reason {
                        SkipReason::Cancelled => report.cancelled = true,
                        SkipReason::NoExternalId => {}
                        SkipReason::Adult => {
                            report.skipped += 1;
                            tracker.record_skipped();
                        }
                    }
                    report.records.extend(record);
                }
                ItemOutcome::Failed {
                    tmdb_id,
                    category,
                    fallback,
                    error,
                } => {
                    report.failed += 1;
                    tracker.record_failed(category);
                    report.records.extend(fallback);
                    if let Some(e) = error {
                        if e.is_fatal() {
                            if report.fatal.is_none() {
                                error!(tmdb_id, error = %e, "Upstream failure, stopping enrichment");
                                report.fatal = Some(e);
                            }
                            stop.cancel();
                        } else {
                            warn!(tmdb_id, error = %e, "Enrichment failed");
                        }
                    }
                }
            }
            tracker.log_progress(seen);
        }

        // A fatal stop is reported through `fatal`, not as a user cancellation
        report.cancelled = report.cancelled && cancel.is_cancelled();
        tracker.log_summary("Enrichment");
        info!(
            total,
            enriched = report.enriched,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "Enrichment finished"
        );
        report
    }
}

async fn enrich_one(api: &dyn CatalogApi, mut record: MovieRecord, stop: &CancellationToken) -> ItemOutcome {
    if stop.is_cancelled() {
        return ItemOutcome::Skipped {
            record: None,
            reason: SkipReason::Cancelled,
        };
    }
    let Some(tmdb_id) = record.external_id() else {
        return ItemOutcome::Skipped {
            record: Some(record),
            reason: SkipReason::NoExternalId,
        };
    };

    match api.movie_details(tmdb_id).await {
        Ok(Some(item)) if item.adult => {
            debug!(tmdb_id, "Skipping adult title");
            ItemOutcome::Skipped {
                record: None,
                reason: SkipReason::Adult,
            }
        }
        Ok(Some(item)) => {
            record.overlay_catalog(item);
            ItemOutcome::Success(record)
        }
        Ok(None) => ItemOutcome::Failed {
            tmdb_id,
            category: ErrorCategory::NotFound,
            fallback: storable(record),
            error: None,
        },
        Err(e) => ItemOutcome::Failed {
            tmdb_id,
            category: e.category(),
            fallback: storable(record),
            error: Some(e),
        },
    }
}

/// A record that failed enrichment is still worth storing if it has a title
/// of its own (MovieLens rows do; bare catalog ids do not).
fn storable(record: MovieRecord) -> Option<MovieRecord> {
    record.valid_title().is_some().then_some(record)
}
