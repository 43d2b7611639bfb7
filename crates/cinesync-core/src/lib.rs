pub mod batch_file;
pub mod enrich;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod upsert;

#[cfg(test)]
mod testing;

pub use batch_file::{BatchFile, BatchFileStore, BatchMetadata, BatchType};
pub use enrich::{Enricher, EnrichmentReport};
pub use pipeline::{FetchRequest, NoProgress, ProgressObserver, RunReport, SearchHit, SyncContext, SyncPipeline};
pub use reconcile::{reconcile, Reconciliation};
pub use store::{MovieStore, StoreCounts, StoreError, StoredMovie};
pub use upsert::{BatchUpsertEngine, FailedRecord, UpsertOutcome};
