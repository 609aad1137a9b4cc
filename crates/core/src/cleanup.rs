//! Cleanup and retry pass
//!
//! A folder may be deleted only when, re-checked at the moment of
//! deletion, it holds no videos and no archives and its parity question
//! is settled. The re-check defeats the race between classification time
//! and delete time. Folders that fail deletion transiently are queued and
//! retried in a bounded number of passes with exponential backoff; leftovers
//! are reported, never force-deleted.

use crate::audit::folder_id;
use crate::invariants::{
    lexical_normalize, ExecutionStatus, FileOperation, OperationContext, OperationExecutor,
    ReasonCode, ValidationLedger,
};
use crate::parity::ParityOutcome;
use crate::pipeline::PipelinePhase;
use crate::runner::CancelFlag;
use crate::scan;
use crate::stats::RunStats;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use unpackr_config::Config;

/// Maximum number of retry passes over the failed-deletion queue.
pub const MAX_RETRY_PASSES: u32 = 3;

/// Cap on queued failed deletions; oldest entries drop beyond this.
pub const RETRY_QUEUE_CAP: usize = 64;

/// Delay before retry pass `pass` (1-based): doubles per pass.
pub fn backoff_delay(pass: u32, base: Duration) -> Duration {
    base.saturating_mul(1u32 << (pass.saturating_sub(1)).min(16))
}

/// A folder whose deletion failed transiently, with the proof needed to
/// re-attempt it later.
#[derive(Debug, Clone)]
pub struct PendingDelete {
    pub folder: PathBuf,
    pub parity: Option<ParityOutcome>,
    /// Paths already handled by executed or dry-run operations; excluded
    /// from the eligibility re-check.
    pub handled: BTreeSet<PathBuf>,
}

/// Bounded queue of failed deletions.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<PendingDelete>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PendingDelete) {
        if self.entries.len() >= RETRY_QUEUE_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn into_entries(self) -> VecDeque<PendingDelete> {
        self.entries
    }
}

/// Eligibility re-check, evaluated immediately before the delete syscall:
/// no unhandled videos, no unhandled archives, parity settled (or parity
/// files absent/handled).
pub fn folder_eligible(
    folder: &Path,
    config: &Config,
    parity: Option<ParityOutcome>,
    handled: &BTreeSet<PathBuf>,
) -> bool {
    let is_handled = |p: &Path| handled.contains(&lexical_normalize(p));

    let has_video = scan::find_videos(folder, config)
        .into_iter()
        .any(|v| !is_handled(&v));
    if has_video {
        return false;
    }

    let has_archive = scan::find_archive_files(folder, config)
        .into_iter()
        .any(|(p, _)| !is_handled(&p));
    if has_archive {
        return false;
    }

    match parity {
        Some(outcome) => outcome.is_conclusive(),
        None => scan::find_parity_files(folder)
            .into_iter()
            .all(|(p, _)| is_handled(&p)),
    }
}

/// Outcome of the retry passes.
#[derive(Debug, Default)]
pub struct RetryReport {
    pub deleted: Vec<PathBuf>,
    /// Still present after the final pass; reported, never forced.
    pub abandoned: Vec<PathBuf>,
}

/// Re-attempt queued deletions in up to `MAX_RETRY_PASSES` passes with
/// exponentially increasing backoff.
pub async fn run_retry_passes(
    executor: &OperationExecutor,
    stats: &RunStats,
    queue: RetryQueue,
    config: &Config,
    cancel: &CancelFlag,
    base_delay: Duration,
) -> RetryReport {
    let mut pending = queue.into_entries();
    let mut report = RetryReport::default();
    let ledger = ValidationLedger::new();

    for pass in 1..=MAX_RETRY_PASSES {
        if pending.is_empty() || cancel.is_cancelled() {
            break;
        }
        tokio::time::sleep(backoff_delay(pass, base_delay)).await;

        let mut next = VecDeque::new();
        while let Some(entry) = pending.pop_front() {
            if cancel.is_cancelled() {
                next.push_back(entry);
                continue;
            }
            if !entry.folder.exists() {
                report.deleted.push(entry.folder);
                continue;
            }
            if !folder_eligible(&entry.folder, config, entry.parity, &entry.handled) {
                // Contents changed since the folder was queued; leave it.
                report.abandoned.push(entry.folder);
                continue;
            }

            let ctx = OperationContext::new(PipelinePhase::Cleanup, &ledger)
                .parity_unrecoverable(entry.parity == Some(ParityOutcome::Unrecoverable));
            let op = FileOperation::delete_folder(&entry.folder, ReasonCode::EmptyAfterProcessing);
            match executor.execute(folder_id(&entry.folder), &op, &ctx) {
                ExecutionStatus::Executed | ExecutionStatus::DryRun => {
                    stats.add_folders_cleaned(1);
                    report.deleted.push(entry.folder);
                }
                ExecutionStatus::FailedTransient(_) => next.push_back(entry),
                ExecutionStatus::Refused(_) => report.abandoned.push(entry.folder),
            }
        }
        pending = next;
    }

    report
        .abandoned
        .extend(pending.into_iter().map(|e| e.folder));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::invariants::Invariants;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (OperationExecutor, Arc<RunStats>) {
        let source = dir.path().join("downloads");
        let dest = dir.path().join("library");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        let stats = Arc::new(RunStats::new());
        let executor = OperationExecutor::new(
            Invariants::new(Config::default(), &source, &dest),
            false,
            stats.clone(),
            Arc::new(AuditLog::new(false)),
        );
        (executor, stats)
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(1, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_queue_drops_oldest_at_cap() {
        let mut queue = RetryQueue::new();
        for i in 0..RETRY_QUEUE_CAP + 5 {
            queue.push(PendingDelete {
                folder: PathBuf::from(format!("/downloads/r{}", i)),
                parity: None,
                handled: BTreeSet::new(),
            });
        }
        assert_eq!(queue.len(), RETRY_QUEUE_CAP);
    }

    #[test]
    fn test_eligibility_blocks_on_video() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("movie.mkv"), "v").unwrap();

        let cfg = Config::default();
        let handled = BTreeSet::new();
        assert!(!folder_eligible(&folder, &cfg, None, &handled));

        // A handled video no longer blocks
        let mut handled = BTreeSet::new();
        handled.insert(lexical_normalize(&folder.join("movie.mkv")));
        assert!(folder_eligible(&folder, &cfg, None, &handled));
    }

    #[test]
    fn test_eligibility_blocks_on_archive() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("movie.part01.rar"), "a").unwrap();

        assert!(!folder_eligible(
            &folder,
            &Config::default(),
            Some(ParityOutcome::VerifiedClean),
            &BTreeSet::new()
        ));
    }

    #[test]
    fn test_eligibility_parity_conditions() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("left.nfo"), "x").unwrap();

        let cfg = Config::default();
        let handled = BTreeSet::new();

        assert!(folder_eligible(&folder, &cfg, None, &handled));
        for ok in [
            ParityOutcome::VerifiedClean,
            ParityOutcome::Repaired,
            ParityOutcome::Unrecoverable,
        ] {
            assert!(folder_eligible(&folder, &cfg, Some(ok), &handled));
        }
        assert!(!folder_eligible(
            &folder,
            &cfg,
            Some(ParityOutcome::Inconclusive),
            &handled
        ));
    }

    #[test]
    fn test_eligibility_unconsumed_parity_files_block() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("movie.par2"), "p").unwrap();

        // Parity never ran for this folder, so the files must be gone or
        // handled before deletion.
        assert!(!folder_eligible(
            &folder,
            &Config::default(),
            None,
            &BTreeSet::new()
        ));
    }

    #[tokio::test]
    async fn test_retry_pass_deletes_eligible_folder() {
        let dir = TempDir::new().unwrap();
        let (executor, stats) = setup(&dir);

        let folder = dir.path().join("downloads/r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("left.nfo"), "x").unwrap();

        let mut queue = RetryQueue::new();
        queue.push(PendingDelete {
            folder: folder.clone(),
            parity: None,
            handled: BTreeSet::new(),
        });

        let report = run_retry_passes(
            &executor,
            &stats,
            queue,
            &Config::default(),
            &CancelFlag::new(),
            Duration::ZERO,
        )
        .await;

        assert_eq!(report.deleted, vec![folder.clone()]);
        assert!(report.abandoned.is_empty());
        assert!(!folder.exists());
        assert_eq!(stats.snapshot().folders_cleaned, 1);
    }

    #[tokio::test]
    async fn test_retry_pass_abandons_changed_folder() {
        let dir = TempDir::new().unwrap();
        let (executor, stats) = setup(&dir);

        // A video appeared after the folder was queued
        let folder = dir.path().join("downloads/r1");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("late-arrival.mkv"), "v").unwrap();

        let mut queue = RetryQueue::new();
        queue.push(PendingDelete {
            folder: folder.clone(),
            parity: None,
            handled: BTreeSet::new(),
        });

        let report = run_retry_passes(
            &executor,
            &stats,
            queue,
            &Config::default(),
            &CancelFlag::new(),
            Duration::ZERO,
        )
        .await;

        assert!(report.deleted.is_empty());
        assert_eq!(report.abandoned, vec![folder.clone()]);
        assert!(folder.exists(), "ineligible folders are never forced");
    }

    #[tokio::test]
    async fn test_retry_pass_treats_vanished_folder_as_deleted() {
        let dir = TempDir::new().unwrap();
        let (executor, stats) = setup(&dir);

        let folder = dir.path().join("downloads/gone");
        let mut queue = RetryQueue::new();
        queue.push(PendingDelete {
            folder: folder.clone(),
            parity: None,
            handled: BTreeSet::new(),
        });

        let report = run_retry_passes(
            &executor,
            &stats,
            queue,
            &Config::default(),
            &CancelFlag::new(),
            Duration::ZERO,
        )
        .await;

        assert_eq!(report.deleted, vec![folder]);
    }
}
