use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Failure categories reported in the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Transient,
    Validation,
    Persistence,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::NotFound,
        ErrorCategory::Transient,
        ErrorCategory::Validation,
        ErrorCategory::Persistence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Persistence => "persistence",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{resource} failed after {attempts} attempt(s): {message}")]
    Transient {
        resource: String,
        attempts: u32,
        message: String,
    },

    #[error("invalid data from {resource}: {message}")]
    Validation { resource: String, message: String },

    #[error("upstream rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

impl SourceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SourceError::Transient { .. } | SourceError::Unreachable(_) => ErrorCategory::Transient,
            SourceError::Validation { .. } | SourceError::Unauthorized { .. } => ErrorCategory::Validation,
        }
    }

    /// Errors after which no further upstream work can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unauthorized { .. } | SourceError::Unreachable(_))
    }
}

/// Lock-free per-category failure counters shared by every worker in a run.
#[derive(Debug, Default)]
pub struct FailureTally {
    not_found: AtomicUsize,
    transient: AtomicUsize,
    validation: AtomicUsize,
    persistence: AtomicUsize,
    rejected: AtomicUsize,
}

impl FailureTally {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, category: ErrorCategory) -> &AtomicUsize {
        match category {
            ErrorCategory::NotFound => &self.not_found,
            ErrorCategory::Transient => &self.transient,
            ErrorCategory::Validation => &self.validation,
            ErrorCategory::Persistence => &self.persistence,
        }
    }

    pub fn record(&self, category: ErrorCategory) {
        self.record_many(category, 1);
    }

    pub fn record_many(&self, category: ErrorCategory, count: usize) {
        self.counter(category).fetch_add(count, Ordering::Relaxed);
    }

    /// Candidates dropped by reconciliation for lack of an external ID.
    pub fn record_rejected(&self, count: usize) {
        self.rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.counter(category).load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            not_found: self.count(ErrorCategory::NotFound),
            transient: self.count(ErrorCategory::Transient),
            validation: self.count(ErrorCategory::Validation),
            persistence: self.count(ErrorCategory::Persistence),
            rejected: self.rejected(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    pub not_found: usize,
    pub transient: usize,
    pub validation: usize,
    pub persistence: usize,
    pub rejected: usize,
}

impl TallySnapshot {
    pub fn failures(&self) -> usize {
        self.not_found + self.transient + self.validation + self.persistence
    }

    pub fn is_clean(&self) -> bool {
        self.failures() == 0 && self.rejected == 0
    }

    /// Counts accumulated since `earlier`, for per-run reporting off a shared tally.
    pub fn since(&self, earlier: &TallySnapshot) -> TallySnapshot {
        TallySnapshot {
            not_found: self.not_found.saturating_sub(earlier.not_found),
            transient: self.transient.saturating_sub(earlier.transient),
            validation: self.validation.saturating_sub(earlier.validation),
            persistence: self.persistence.saturating_sub(earlier.persistence),
            rejected: self.rejected.saturating_sub(earlier.rejected),
        }
    }

    pub fn get(&self, category: ErrorCategory) -> usize {
        match category {
            ErrorCategory::NotFound => self.not_found,
            ErrorCategory::Transient => self.transient,
            ErrorCategory::Validation => self.validation,
            ErrorCategory::Persistence => self.persistence,
        }
    }
}

impl fmt::Display for TallySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = ErrorCategory::ALL
            .iter()
            .map(|c| format!("{}: {}", c, self.get(*c)))
            .collect();
        write!(f, "{} | rejected: {}", parts.join(", "), self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_error_categories() {
        let transient = SourceError::Transient {
            resource: "movie/1".to_string(),
            attempts: 4,
            message: "HTTP 503".to_string(),
        };
        assert_eq!(transient.category(), ErrorCategory::Transient);
        assert!(!transient.is_fatal());

        let unauthorized = SourceError::Unauthorized { status: 401 };
        assert!(unauthorized.is_fatal());
        assert_eq!(unauthorized.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_tally_counts_across_threads() {
        let tally = Arc::new(FailureTally::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tally = Arc::clone(&tally);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tally.record(ErrorCategory::Transient);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        tally.record_rejected(2);

        let snapshot = tally.snapshot();
        assert_eq!(snapshot.transient, 800);
        assert_eq!(snapshot.rejected, 2);
        assert_eq!(snapshot.failures(), 800);
        assert!(!snapshot.is_clean());
    }

    #[test]
    fn test_snapshot_since() {
        let tally = FailureTally::new();
        tally.record(ErrorCategory::NotFound);
        let before = tally.snapshot();
        tally.record(ErrorCategory::NotFound);
        tally.record(ErrorCategory::Persistence);

        let delta = tally.snapshot().since(&before);
        assert_eq!(delta.not_found, 1);
        assert_eq!(delta.persistence, 1);
        assert_eq!(
            delta.to_string(),
            "not_found: 1, transient: 0, validation: 0, persistence: 1 | rejected: 0"
        );
    }
}
