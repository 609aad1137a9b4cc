//! Run orchestrator
//!
//! Drives one run end to end: root checks, tool-independent pre-scan and
//! classification, oldest-first ordering, strictly serial per-folder
//! dispatch, the failed-deletion retry pass, and the final summary.
//! Cancellation is checked at every folder boundary and the global
//! runtime budget caps the whole run.

use crate::audit::AuditLog;
use crate::classify::Classification;
use crate::cleanup::{self, RetryQueue};
use crate::invariants::{Invariants, OperationExecutor};
use crate::pipeline::{FolderPipeline, FolderReport};
use crate::runner::{CancelFlag, RunBudget};
use crate::scan;
use crate::stats::{RunStats, StatsSnapshot};
use crate::tools::ToolSuite;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use unpackr_config::Config;

/// Error type for run-level failures
#[derive(Debug, Error)]
pub enum RunError {
    /// The source root does not exist or is not a directory.
    #[error("Source root invalid: {0}")]
    SourceRoot(String),

    /// The destination root does not exist, is not a directory, or
    /// overlaps the source root.
    #[error("Destination root invalid: {0}")]
    DestinationRoot(String),

    /// IO error during the pre-scan.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-run options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Print the pre-flight plan and do nothing else.
    pub plan_only: bool,
    /// Verify after the run that every moved file exists in the
    /// destination.
    pub post_run_audit: bool,
    /// Base delay for the failed-deletion retry passes.
    pub retry_base_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            plan_only: false,
            post_run_audit: false,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// One pre-flight plan line.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedFolder {
    pub path: PathBuf,
    pub classification: Classification,
    pub videos: usize,
    pub archives: usize,
    pub parity: usize,
}

/// Aggregated result of one run.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub cancelled: bool,
    pub budget_exhausted: bool,
    pub plan: Vec<PlannedFolder>,
    pub reports: Vec<FolderReport>,
    /// Folders still undeletable after the retry passes.
    pub abandoned_folders: Vec<PathBuf>,
    /// Moved files missing from the destination at post-run audit time.
    pub audit_missing: Vec<PathBuf>,
}

/// Owns the run-wide shared state: config, statistics, audit journal,
/// cancellation flag, and the wall-clock budget.
pub struct Orchestrator {
    config: Config,
    stats: Arc<RunStats>,
    audit: Arc<AuditLog>,
    cancel: CancelFlag,
    budget: RunBudget,
}

impl Orchestrator {
    pub fn new(config: Config, cancel: CancelFlag, budget: RunBudget) -> Self {
        let audit = Arc::new(AuditLog::new(config.log_paths));
        Self {
            config,
            stats: Arc::new(RunStats::new()),
            audit,
            cancel,
            budget,
        }
    }

    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// Run the pipeline over every folder under `source`.
    pub async fn run<T: ToolSuite>(
        &self,
        tools: &T,
        source: &Path,
        destination: &Path,
        options: &RunOptions,
    ) -> Result<RunSummary, RunError> {
        let source = checked_root(source).map_err(RunError::SourceRoot)?;
        let destination = checked_root(destination).map_err(RunError::DestinationRoot)?;
        if destination.starts_with(&source) || source.starts_with(&destination) {
            return Err(RunError::DestinationRoot(
                "source and destination roots must not overlap".to_string(),
            ));
        }

        let mut folders = scan::scan_source(&source, &self.config)?;
        // Oldest first, so in-progress downloads at the newest timestamps
        // are least likely to be disturbed.
        folders.sort_by_key(|f| f.modified);

        let plan: Vec<PlannedFolder> = folders
            .iter()
            .map(|f| PlannedFolder {
                path: f.path.clone(),
                classification: f.classification,
                videos: f.census.videos,
                archives: f.census.archives,
                parity: f.census.parity,
            })
            .collect();

        if options.plan_only {
            return Ok(RunSummary {
                stats: self.stats.snapshot(),
                cancelled: false,
                budget_exhausted: false,
                plan,
                reports: Vec::new(),
                abandoned_folders: Vec::new(),
                audit_missing: Vec::new(),
            });
        }

        let executor = OperationExecutor::new(
            Invariants::new(self.config.clone(), &source, &destination),
            self.config.dry_run,
            self.stats.clone(),
            self.audit.clone(),
        );
        let pipeline = FolderPipeline::new(
            &self.config,
            tools,
            &executor,
            &self.stats,
            &self.cancel,
            &self.budget,
        );

        let mut reports: Vec<FolderReport> = Vec::new();
        let mut retry = RetryQueue::new();
        let mut cancelled = false;
        let mut budget_exhausted = false;

        for folder in &folders {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if self.budget.exhausted() {
                budget_exhausted = true;
                tracing::warn!("global runtime budget exhausted; stopping the run");
                break;
            }
            if folder.classification == Classification::Skip {
                self.stats.add_folders_skipped(1);
                continue;
            }

            tracing::info!(
                folder = %crate::audit::folder_id(&folder.path),
                classification = %folder.classification,
                "processing folder"
            );
            let mut report = pipeline.process(folder).await;
            if let Some(pending) = report.pending_delete.take() {
                retry.push(pending);
            }
            let was_cancelled = report.cancelled;
            reports.push(report);
            if was_cancelled {
                cancelled = true;
                break;
            }
        }

        let retry_report = if retry.is_empty() {
            cleanup::RetryReport::default()
        } else {
            cleanup::run_retry_passes(
                &executor,
                &self.stats,
                retry,
                &self.config,
                &self.cancel,
                options.retry_base_delay,
            )
            .await
        };

        let audit_missing = if options.post_run_audit && !self.config.dry_run {
            reports
                .iter()
                .flat_map(|r| r.moved.iter())
                .filter(|p| !p.exists())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Ok(RunSummary {
            stats: self.stats.snapshot(),
            cancelled,
            budget_exhausted,
            plan,
            reports,
            abandoned_folders: retry_report.abandoned,
            audit_missing,
        })
    }
}

fn checked_root(path: &Path) -> Result<PathBuf, String> {
    let canonical = path
        .canonicalize()
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    if !canonical.is_dir() {
        return Err(format!("{} is not a directory", canonical.display()));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelinePhase;
    use crate::tools::fake::FakeTools;
    use std::fs;
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    fn config() -> Config {
        Config {
            min_sample_size_mb: 2,
            ..Config::default()
        }
    }

    fn orchestrator(config: Config) -> Orchestrator {
        Orchestrator::new(
            config,
            CancelFlag::new(),
            RunBudget::new(Duration::from_secs(3600)),
        )
    }

    fn options() -> RunOptions {
        RunOptions {
            retry_base_delay: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    fn write_bytes(path: &Path, len: usize) {
        fs::write(path, vec![0u8; len]).unwrap();
    }

    struct Tree {
        dir: TempDir,
    }

    impl Tree {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("downloads")).unwrap();
            fs::create_dir_all(dir.path().join("library")).unwrap();
            Self { dir }
        }

        fn source(&self) -> PathBuf {
            self.dir.path().join("downloads")
        }

        fn dest(&self) -> PathBuf {
            self.dir.path().join("library")
        }

        fn folder(&self, name: &str) -> PathBuf {
            let path = self.source().join(name);
            fs::create_dir_all(&path).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_run_mixed_folders() {
        let tree = Tree::new();

        let release = tree.folder("release");
        write_bytes(&release.join("movie.mkv"), 3 * MIB);

        let junk = tree.folder("junk");
        write_bytes(&junk.join("stale.nfo"), 100);

        let album = tree.folder("album");
        for i in 0..12 {
            write_bytes(&album.join(format!("t{:02}.mp3", i)), 512);
        }

        let odd = tree.folder("odd");
        write_bytes(&odd.join("mystery.bin"), 100);

        let orch = orchestrator(config());
        let tools = FakeTools::healthy();
        let summary = orch
            .run(&tools, &tree.source(), &tree.dest(), &options())
            .await
            .expect("run should succeed");

        assert!(!summary.cancelled);
        assert_eq!(summary.plan.len(), 4);
        // Skip folders are never dispatched
        assert_eq!(summary.reports.len(), 3);

        let snapshot = &summary.stats;
        assert_eq!(snapshot.folders_skipped, 1);
        assert_eq!(snapshot.folders_preserved, 1);
        assert_eq!(snapshot.folders_cleaned, 2); // release + junk
        assert_eq!(snapshot.videos_moved, 1);

        assert!(!release.exists());
        assert!(!junk.exists());
        assert!(album.exists());
        assert!(odd.exists());
        assert!(tree.dest().join("movie.mkv").exists());
    }

    #[tokio::test]
    async fn test_folders_processed_oldest_first() {
        let tree = Tree::new();

        // Created first (oldest) but named last alphabetically
        let old = tree.folder("zzz-old");
        write_bytes(&old.join("a.mkv"), 3 * MIB);
        std::thread::sleep(Duration::from_millis(25));
        let new = tree.folder("aaa-new");
        write_bytes(&new.join("b.mkv"), 3 * MIB);

        let orch = orchestrator(config());
        let tools = FakeTools::healthy();
        let summary = orch
            .run(&tools, &tree.source(), &tree.dest(), &options())
            .await
            .unwrap();

        let order: Vec<String> = summary
            .reports
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(order, vec!["zzz-old".to_string(), "aaa-new".to_string()]);
    }

    #[tokio::test]
    async fn test_plan_only_mutates_nothing() {
        let tree = Tree::new();
        let folder = tree.folder("release");
        write_bytes(&folder.join("movie.mkv"), 3 * MIB);
        write_bytes(&folder.join("movie.nfo"), 100);

        let orch = orchestrator(config());
        let tools = FakeTools::healthy();
        let summary = orch
            .run(
                &tools,
                &tree.source(),
                &tree.dest(),
                &RunOptions {
                    plan_only: true,
                    ..options()
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.plan.len(), 1);
        assert_eq!(summary.plan[0].classification, Classification::ProcessRelease);
        assert!(summary.reports.is_empty());
        assert!(folder.join("movie.mkv").exists());
        assert!(folder.join("movie.nfo").exists());
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_root_refused() {
        let tree = Tree::new();
        let orch = orchestrator(config());
        let tools = FakeTools::healthy();

        let result = orch
            .run(
                &tools,
                &tree.dir.path().join("missing"),
                &tree.dest(),
                &options(),
            )
            .await;
        assert!(matches!(result, Err(RunError::SourceRoot(_))));
    }

    #[tokio::test]
    async fn test_overlapping_roots_refused() {
        let tree = Tree::new();
        let nested = tree.source().join("library");
        fs::create_dir_all(&nested).unwrap();

        let orch = orchestrator(config());
        let tools = FakeTools::healthy();

        let result = orch
            .run(&tools, &tree.source(), &nested, &options())
            .await;
        assert!(matches!(result, Err(RunError::DestinationRoot(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_dispatch() {
        let tree = Tree::new();
        let folder = tree.folder("release");
        write_bytes(&folder.join("movie.mkv"), 3 * MIB);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let orch = Orchestrator::new(config(), cancel, RunBudget::new(Duration::from_secs(3600)));

        let tools = FakeTools::healthy();
        let summary = orch
            .run(&tools, &tree.source(), &tree.dest(), &options())
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.reports.is_empty());
        assert!(folder.join("movie.mkv").exists());
    }

    #[tokio::test]
    async fn test_post_run_audit_reports_moved_files() {
        let tree = Tree::new();
        let folder = tree.folder("release");
        write_bytes(&folder.join("movie.mkv"), 3 * MIB);

        let orch = orchestrator(config());
        let tools = FakeTools::healthy();
        let summary = orch
            .run(
                &tools,
                &tree.source(),
                &tree.dest(),
                &RunOptions {
                    post_run_audit: true,
                    ..options()
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.videos_moved, 1);
        assert!(summary.audit_missing.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_summary_counts_match_decisions() {
        let tree = Tree::new();
        let folder = tree.folder("release");
        write_bytes(&folder.join("movie.mkv"), 3 * MIB);
        write_bytes(&folder.join("movie.nfo"), 100);

        let orch = orchestrator(Config {
            dry_run: true,
            ..config()
        });
        let tools = FakeTools::healthy();
        let summary = orch
            .run(&tools, &tree.source(), &tree.dest(), &options())
            .await
            .unwrap();

        assert_eq!(summary.stats.videos_moved, 1);
        assert_eq!(summary.stats.junk_files_removed, 1);
        assert_eq!(summary.stats.folders_cleaned, 1);
        assert_eq!(summary.stats.operations_executed, 0);
        assert!(folder.join("movie.mkv").exists());
        assert!(tree.dest().join("movie.mkv").exists() == false);

        let reports_final: Vec<PipelinePhase> =
            summary.reports.iter().map(|r| r.final_state).collect();
        assert_eq!(reports_final, vec![PipelinePhase::Deleted]);
    }
}
