use crate::error::ErrorCategory;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

/// Progress tracker for operations that process many movies.
/// Logs every `progress_interval` items and once more at the end, so large
/// runs stay readable.
pub struct ProgressTracker {
    total: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    start_time: Instant,
    progress_interval: usize,
    last_progress_log: usize,
    error_counts: HashMap<ErrorCategory, usize>,
}

impl ProgressTracker {
    /// * `total` - items expected; 0 when unknown up front
    /// * `progress_interval` - log every N items (50 for cheap steps, 25 for slow ones)
    pub fn new(total: usize, progress_interval: usize) -> Self {
        if total > 10 {
            info!(total, "Starting operation");
        }
        Self {
            total,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            start_time: Instant::now(),
            progress_interval: progress_interval.max(1),
            last_progress_log: 0,
            error_counts: HashMap::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn record_failed(&mut self, category: ErrorCategory) {
        self.failed += 1;
        *self.error_counts.entry(category).or_insert(0) += 1;
    }

    /// `current` is 1-based.
    pub fn log_progress(&mut self, current: usize) {
        let at_end = self.total > 0 && current >= self.total;
        if current.saturating_sub(self.last_progress_log) < self.progress_interval && !at_end {
            return;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        // Cache-only passes finish instantly; no point logging them
        if elapsed < 0.5 && !at_end {
            return;
        }
        let rate = if elapsed > 0.0 { current as f64 / elapsed } else { 0.0 };

        info!(
            "Progress: {}/{} ({:.1} items/sec) | Succeeded: {} | Failed: {} | Skipped: {}",
            current, self.total, rate, self.succeeded, self.failed, self.skipped
        );
        self.last_progress_log = current;
    }

    /// Sorted by count, highest first.
    pub fn error_breakdown(&self) -> Vec<(ErrorCategory, usize)> {
        let mut entries: Vec<_> = self.error_counts.iter().map(|(c, n)| (*c, *n)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        entries
    }

    pub fn log_summary(&self, operation_name: &str) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if self.failed > 0 {
            warn!(
                "{} completed in {:.1}s | Succeeded: {} | Failed: {} | Skipped: {}",
                operation_name, elapsed, self.succeeded, self.failed, self.skipped
            );
            let breakdown: Vec<String> = self
                .error_breakdown()
                .iter()
                .map(|(category, count)| format!("{}: {}", category, count))
                .collect();
            if !breakdown.is_empty() {
                info!("Error breakdown: {}", breakdown.join(", "));
            }
        } else {
            info!(
                "{} completed in {:.1}s | Succeeded: {} | Skipped: {}",
                operation_name, elapsed, self.succeeded, self.skipped
            );
        }
    }
}
