use cinesync_models::MovieRecord;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Create-vs-update decision for one batch of candidates.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub to_create: Vec<MovieRecord>,
    /// Surrogate key of the existing row, paired with the new values.
    pub to_update: Vec<(i64, MovieRecord)>,
    /// Candidates with no external ID at all.
    pub rejected: Vec<MovieRecord>,
}

impl Reconciliation {
    pub fn accepted(&self) -> usize {
        self.to_create.len() + self.to_update.len()
    }
}

/// Distinct external IDs of `candidates`, in first-seen order. This is the
/// key set for the single bulk lookup that feeds [`reconcile`].
pub fn external_ids(candidates: &[MovieRecord]) -> Vec<u64> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .iter()
        .filter_map(MovieRecord::external_id)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Collapse candidates sharing an external ID into one entry: the slot of
/// the first sighting, holding the values of the last. Candidates without
/// an external ID keep their place.
pub fn collapse_duplicates(candidates: Vec<MovieRecord>) -> Vec<MovieRecord> {
    let mut merged: Vec<MovieRecord> = Vec::with_capacity(candidates.len());
    let mut position: HashMap<u64, usize> = HashMap::with_capacity(candidates.len());

    for candidate in candidates {
        let Some(external_id) = candidate.external_id() else {
            merged.push(candidate);
            continue;
        };
        match position.get(&external_id) {
            Some(&slot) => {
                debug!(tmdb_id = external_id, "Duplicate candidate, keeping the later one");
                merged[slot] = candidate;
            }
            None => {
                position.insert(external_id, merged.len());
                merged.push(candidate);
            }
        }
    }
    merged
}

/// Split candidates into creates and updates against `existing`
/// (external ID to surrogate key). Duplicates are collapsed first, see
/// [`collapse_duplicates`].
pub fn reconcile(candidates: Vec<MovieRecord>, existing: &HashMap<u64, i64>) -> Reconciliation {
    let mut result = Reconciliation::default();

    for mut record in collapse_duplicates(candidates) {
        let Some(external_id) = record.external_id() else {
            warn!(
                title = record.title.as_deref().unwrap_or("<untitled>"),
                movielens_id = ?record.movielens_id,
                "Rejecting candidate without an external ID"
            );
            result.rejected.push(record);
            continue;
        };

        // Persist under the resolved ID regardless of which field carried it
        record.tmdb_id = Some(external_id);
        match existing.get(&external_id) {
            Some(&row_id) => result.to_update.push((row_id, record)),
            None => result.to_create.push(record),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tmdb_id: Option<u64>, linked: Option<u64>, title: &str) -> MovieRecord {
        MovieRecord {
            tmdb_id,
            linked_tmdb_id: linked,
            title: Some(title.to_string()),
            ..MovieRecord::default()
        }
    }

    #[test]
    fn test_duplicate_ids_resolve_last_write_wins() {
        let batch = vec![
            candidate(Some(42), None, "A"),
            candidate(Some(7), None, "B"),
            candidate(None, Some(42), "C"),
        ];
        let result = reconcile(batch, &HashMap::new());

        assert_eq!(result.to_create.len(), 2);
        assert!(result.to_update.is_empty());
        let forty_two: Vec<_> = result.to_create.iter().filter(|r| r.tmdb_id == Some(42)).collect();
        assert_eq!(forty_two.len(), 1);
        assert_eq!(forty_two[0].title.as_deref(), Some("C"));
    }

    #[test]
    fn test_candidate_without_id_is_rejected() {
        let batch = vec![candidate(None, None, "Nobody"), candidate(Some(1), None, "One")];
        let result = reconcile(batch, &HashMap::new());

        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.accepted(), 1);
        assert!(result.to_create.iter().all(|r| r.title.as_deref() != Some("Nobody")));
    }

    #[test]
    fn test_existing_rows_become_updates() {
        let existing = HashMap::from([(10u64, 100i64)]);
        let batch = vec![candidate(Some(10), None, "Known"), candidate(Some(11), None, "New")];
        let result = reconcile(batch, &existing);

        assert_eq!(result.to_update.len(), 1);
        assert_eq!(result.to_update[0].0, 100);
        assert_eq!(result.to_create.len(), 1);
        assert_eq!(result.to_create[0].tmdb_id, Some(11));
    }

    #[test]
    fn test_catalog_field_wins_over_link_field() {
        let batch = vec![candidate(Some(1), Some(2), "Both")];
        let result = reconcile(batch, &HashMap::new());
        assert_eq!(result.to_create[0].tmdb_id, Some(1));
        assert_eq!(external_ids(&[candidate(Some(1), Some(2), "x"), candidate(None, Some(1), "y")]), vec![1]);
    }

    #[test]
    fn test_collapse_keeps_first_slot_and_unkeyed_records() {
        let batch = vec![
            candidate(None, Some(42), "first"),
            candidate(None, None, "unlinked"),
            candidate(Some(7), None, "seven"),
            candidate(Some(42), None, "last"),
        ];
        let merged = collapse_duplicates(batch);

        let titles: Vec<_> = merged.iter().filter_map(|r| r.title.as_deref()).collect();
        assert_eq!(titles, vec!["last", "unlinked", "seven"]);
    }
}
