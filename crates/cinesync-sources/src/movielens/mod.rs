pub mod loader;

pub use loader::{MovieLensLoader, extract_year, strip_year};
