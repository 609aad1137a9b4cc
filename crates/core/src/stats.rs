//! Run statistics
//!
//! Run-scoped counters mutated only through atomic adders. The snapshot
//! form is serializable for the end-of-run summary.

use crate::invariants::InvariantId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one run. Shared freely across components; every update
/// goes through an atomic adder, so no lock is required.
#[derive(Debug, Default)]
pub struct RunStats {
    videos_found: AtomicU64,
    videos_moved: AtomicU64,
    videos_rejected: AtomicU64,
    archives_extracted: AtomicU64,
    archives_failed: AtomicU64,
    parity_ok: AtomicU64,
    parity_failed: AtomicU64,
    folders_cleaned: AtomicU64,
    folders_preserved: AtomicU64,
    folders_skipped: AtomicU64,
    folders_errored: AtomicU64,
    junk_files_removed: AtomicU64,
    bytes_moved: AtomicU64,
    operations_executed: AtomicU64,
    operations_refused: AtomicU64,
    refusals: [AtomicU64; InvariantId::COUNT],
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub videos_found: u64,
    pub videos_moved: u64,
    pub videos_rejected: u64,
    pub archives_extracted: u64,
    pub archives_failed: u64,
    pub parity_ok: u64,
    pub parity_failed: u64,
    pub folders_cleaned: u64,
    pub folders_preserved: u64,
    pub folders_skipped: u64,
    pub folders_errored: u64,
    pub junk_files_removed: u64,
    pub bytes_moved: u64,
    pub operations_executed: u64,
    pub operations_refused: u64,
    pub refusals_by_invariant: BTreeMap<String, u64>,
}

macro_rules! adder {
    ($name:ident, $field:ident) => {
        pub fn $name(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    adder!(add_videos_found, videos_found);
    adder!(add_videos_moved, videos_moved);
    adder!(add_videos_rejected, videos_rejected);
    adder!(add_archives_extracted, archives_extracted);
    adder!(add_archives_failed, archives_failed);
    adder!(add_parity_ok, parity_ok);
    adder!(add_parity_failed, parity_failed);
    adder!(add_folders_cleaned, folders_cleaned);
    adder!(add_folders_preserved, folders_preserved);
    adder!(add_folders_skipped, folders_skipped);
    adder!(add_folders_errored, folders_errored);
    adder!(add_junk_files_removed, junk_files_removed);
    adder!(add_bytes_moved, bytes_moved);
    adder!(add_operations_executed, operations_executed);

    /// Record one refused operation under the invariant that refused it.
    pub fn record_refusal(&self, id: InvariantId) {
        self.operations_refused.fetch_add(1, Ordering::Relaxed);
        self.refusals[id.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let refusals_by_invariant = InvariantId::ALL
            .iter()
            .filter_map(|id| {
                let count = self.refusals[id.index()].load(Ordering::Relaxed);
                (count > 0).then(|| (id.as_str().to_string(), count))
            })
            .collect();

        StatsSnapshot {
            videos_found: self.videos_found.load(Ordering::Relaxed),
            videos_moved: self.videos_moved.load(Ordering::Relaxed),
            videos_rejected: self.videos_rejected.load(Ordering::Relaxed),
            archives_extracted: self.archives_extracted.load(Ordering::Relaxed),
            archives_failed: self.archives_failed.load(Ordering::Relaxed),
            parity_ok: self.parity_ok.load(Ordering::Relaxed),
            parity_failed: self.parity_failed.load(Ordering::Relaxed),
            folders_cleaned: self.folders_cleaned.load(Ordering::Relaxed),
            folders_preserved: self.folders_preserved.load(Ordering::Relaxed),
            folders_skipped: self.folders_skipped.load(Ordering::Relaxed),
            folders_errored: self.folders_errored.load(Ordering::Relaxed),
            junk_files_removed: self.junk_files_removed.load(Ordering::Relaxed),
            bytes_moved: self.bytes_moved.load(Ordering::Relaxed),
            operations_executed: self.operations_executed.load(Ordering::Relaxed),
            operations_refused: self.operations_refused.load(Ordering::Relaxed),
            refusals_by_invariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_stats_are_zero() {
        let snapshot = RunStats::new().snapshot();
        assert_eq!(snapshot.videos_found, 0);
        assert_eq!(snapshot.operations_refused, 0);
        assert!(snapshot.refusals_by_invariant.is_empty());
    }

    #[test]
    fn test_adders_accumulate() {
        let stats = RunStats::new();
        stats.add_videos_found(3);
        stats.add_videos_found(2);
        stats.add_bytes_moved(1024);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.videos_found, 5);
        assert_eq!(snapshot.bytes_moved, 1024);
    }

    #[test]
    fn test_refusals_counted_per_invariant() {
        let stats = RunStats::new();
        stats.record_refusal(InvariantId::Containment);
        stats.record_refusal(InvariantId::Containment);
        stats.record_refusal(InvariantId::SafeName);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.operations_refused, 3);
        assert_eq!(snapshot.refusals_by_invariant["containment"], 2);
        assert_eq!(snapshot.refusals_by_invariant["safe-name"], 1);
        assert!(!snapshot.refusals_by_invariant.contains_key("loop-bound"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RunStats::new();
        stats.add_folders_cleaned(1);
        stats.record_refusal(InvariantId::SourceConfinement);

        let json = serde_json::to_string(&stats.snapshot()).expect("serialization should succeed");
        let back: StatsSnapshot = serde_json::from_str(&json).expect("round trip should succeed");
        assert_eq!(back, stats.snapshot());
    }

    // *For any* sequence of adder calls, the snapshot SHALL report exactly
    // the sum that was added, independent of interleaving.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_snapshot_equals_sum(values in prop::collection::vec(0u64..1_000, 0..20)) {
            let stats = RunStats::new();
            for v in &values {
                stats.add_junk_files_removed(*v);
            }
            prop_assert_eq!(
                stats.snapshot().junk_files_removed,
                values.iter().sum::<u64>()
            );
        }
    }
}
