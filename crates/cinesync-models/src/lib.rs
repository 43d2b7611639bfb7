pub mod catalog;
pub mod change;
pub mod local;
pub mod movie;

pub use catalog::{CatalogItem, CreditEntry, CreditKind, KeywordEntry};
pub use change::{ChangeKind, ChangeRecord};
pub use local::LocalDatasetItem;
pub use movie::MovieRecord;
