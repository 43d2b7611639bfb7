pub mod clear;
pub mod config;
pub mod history;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod search;
pub mod session;
pub mod summary;

use std::path::PathBuf;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
}
