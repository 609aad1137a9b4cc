//! Folder pipeline
//!
//! Per-release state machine: parity, extraction, video validation, move,
//! cleanup. Transitions are forward-only; an illegal transition is a
//! programmer error and panics. Every destructive step goes through the
//! operation executor, and the cleanup conditions are re-checked inside
//! the cleanup phase regardless of what the pre-scan believed.

use crate::archive::{self, ArchiveSet};
use crate::audit::{folder_id, FolderId};
use crate::classify::Classification;
use crate::cleanup::{self, PendingDelete};
use crate::invariants::{
    lexical_normalize, ExecutionStatus, FileOperation, OperationContext, OperationExecutor,
    ReasonCode, SpaceClaim, ValidationLedger,
};
use crate::parity::{collect_parity_set, interpret_parity_output, ParityOutcome};
use crate::runner::{CancelFlag, RunBudget, RunOutcome};
use crate::scan::{self, SourceFolder};
use crate::stats::RunStats;
use crate::tools::ToolSuite;
use crate::validate::{validate_video, VerdictKind};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use unpackr_config::Config;

/// Pipeline states, including the three terminal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Discovered,
    Scanning,
    Classified,
    Parity,
    Extract,
    Validate,
    Move,
    Cleanup,
    Deleted,
    Preserved,
    Errored,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Discovered => "discovered",
            PipelinePhase::Scanning => "scanning",
            PipelinePhase::Classified => "classified",
            PipelinePhase::Parity => "parity-phase",
            PipelinePhase::Extract => "extract-phase",
            PipelinePhase::Validate => "validate-phase",
            PipelinePhase::Move => "move-phase",
            PipelinePhase::Cleanup => "cleanup-phase",
            PipelinePhase::Deleted => "deleted",
            PipelinePhase::Preserved => "preserved",
            PipelinePhase::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Deleted | PipelinePhase::Preserved | PipelinePhase::Errored
        )
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-only transition table. Any non-terminal state may short-circuit
/// to `Errored`.
pub fn can_transition(from: PipelinePhase, to: PipelinePhase) -> bool {
    use PipelinePhase::*;
    if from.is_terminal() {
        return false;
    }
    if to == Errored {
        return true;
    }
    matches!(
        (from, to),
        (Discovered, Scanning)
            | (Scanning, Classified)
            | (Classified, Parity)
            | (Classified, Cleanup)
            | (Classified, Preserved)
            | (Parity, Extract)
            | (Parity, Cleanup)
            | (Extract, Validate)
            | (Extract, Cleanup)
            | (Validate, Move)
            | (Validate, Cleanup)
            | (Move, Cleanup)
            | (Cleanup, Deleted)
            | (Cleanup, Preserved)
    )
}

#[derive(Debug)]
struct Machine {
    state: PipelinePhase,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: PipelinePhase::Discovered,
        }
    }

    fn advance(&mut self, to: PipelinePhase) {
        assert!(
            can_transition(self.state, to),
            "illegal pipeline transition {} -> {}",
            self.state,
            to
        );
        self.state = to;
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Ok,
    /// Continue; the folder is marked errored at the end of the run.
    SoftFail(String),
    /// Stop the content phases immediately; cleanup still runs.
    HardFail(String),
    Cancelled,
}

/// Result of processing one folder.
#[derive(Debug)]
pub struct FolderReport {
    pub path: PathBuf,
    pub folder: FolderId,
    pub classification: Classification,
    pub final_state: PipelinePhase,
    pub phases: Vec<(PipelinePhase, PhaseOutcome)>,
    pub moved: Vec<PathBuf>,
    /// Set when the folder delete failed transiently and should be
    /// retried by the cleanup pass.
    pub pending_delete: Option<PendingDelete>,
    pub cancelled: bool,
}

struct FolderState {
    id: FolderId,
    path: PathBuf,
    ledger: ValidationLedger,
    parity: Option<ParityOutcome>,
    rounds: u32,
    verified_sets: BTreeSet<PathBuf>,
    handled: BTreeSet<PathBuf>,
    moved: Vec<PathBuf>,
    soft_failures: Vec<String>,
    hard_failure: Option<String>,
    /// Last transient syscall failure, drained by the phase loop.
    transient: Option<String>,
    cancelled: bool,
}

impl FolderState {
    fn new(id: FolderId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            ledger: ValidationLedger::new(),
            parity: None,
            rounds: 0,
            verified_sets: BTreeSet::new(),
            handled: BTreeSet::new(),
            moved: Vec::new(),
            soft_failures: Vec::new(),
            hard_failure: None,
            transient: None,
            cancelled: false,
        }
    }

    fn is_handled(&self, path: &Path) -> bool {
        self.handled.contains(&lexical_normalize(path))
    }

    fn mark_handled(&mut self, path: &Path) {
        self.handled.insert(lexical_normalize(path));
    }
}

/// Per-folder pipeline bound to the run's shared services.
pub struct FolderPipeline<'a, T: ToolSuite> {
    config: &'a Config,
    tools: &'a T,
    executor: &'a OperationExecutor,
    stats: &'a RunStats,
    cancel: &'a CancelFlag,
    budget: &'a RunBudget,
}

/// What an operation attempt means for the current phase.
enum OpFlow {
    Done,
    Skipped,
    Stop,
}

impl<'a, T: ToolSuite> FolderPipeline<'a, T> {
    pub fn new(
        config: &'a Config,
        tools: &'a T,
        executor: &'a OperationExecutor,
        stats: &'a RunStats,
        cancel: &'a CancelFlag,
        budget: &'a RunBudget,
    ) -> Self {
        Self {
            config,
            tools,
            executor,
            stats,
            cancel,
            budget,
        }
    }

    /// Run the state machine for one folder to a terminal state.
    pub async fn process(&self, folder: &SourceFolder) -> FolderReport {
        let id = folder_id(&folder.path);
        let mut machine = Machine::new();
        machine.advance(PipelinePhase::Scanning);
        machine.advance(PipelinePhase::Classified);

        let mut st = FolderState::new(id, folder.path.clone());
        let mut phases: Vec<(PipelinePhase, PhaseOutcome)> = Vec::new();

        match folder.classification {
            Classification::PreserveContent | Classification::Skip => {
                machine.advance(PipelinePhase::Preserved);
                if folder.classification == Classification::PreserveContent {
                    self.stats.add_folders_preserved(1);
                }
                return self.report(folder, st, machine.state, phases, None);
            }
            Classification::Junk => {
                machine.advance(PipelinePhase::Cleanup);
            }
            Classification::ProcessRelease => {
                machine.advance(PipelinePhase::Parity);
                let outcome = self.parity_phase(&mut st).await;
                let stop = self.absorb(&mut st, PipelinePhase::Parity, outcome, &mut phases);

                if !st.cancelled && !stop {
                    machine.advance(PipelinePhase::Extract);
                    let outcome = self.extract_phase(&mut st).await;
                    let stop = self.absorb(&mut st, PipelinePhase::Extract, outcome, &mut phases);

                    if !st.cancelled && !stop {
                        machine.advance(PipelinePhase::Validate);
                        let outcome = self.validate_phase(&mut st).await;
                        let stop =
                            self.absorb(&mut st, PipelinePhase::Validate, outcome, &mut phases);

                        let has_passing = st.ledger.passed_paths().next().is_some();
                        if !st.cancelled && !stop && has_passing {
                            machine.advance(PipelinePhase::Move);
                            let outcome = self.move_phase(&mut st).await;
                            self.absorb(&mut st, PipelinePhase::Move, outcome, &mut phases);
                        }
                    }
                }

                if st.cancelled {
                    machine.advance(PipelinePhase::Errored);
                    return self.report(folder, st, machine.state, phases, None);
                }
                machine.advance(PipelinePhase::Cleanup);
            }
        }

        // Cleanup runs for junk folders and for releases regardless of
        // earlier errors; its delete conditions are re-checked inside.
        let (outcome, folder_deleted, pending_delete) = self.cleanup_phase(&mut st).await;
        self.absorb(&mut st, PipelinePhase::Cleanup, outcome, &mut phases);

        let final_state = if st.cancelled {
            PipelinePhase::Errored
        } else if st.hard_failure.is_some() || !st.soft_failures.is_empty() {
            self.stats.add_folders_errored(1);
            PipelinePhase::Errored
        } else if folder_deleted {
            PipelinePhase::Deleted
        } else {
            self.stats.add_folders_preserved(1);
            PipelinePhase::Preserved
        };
        machine.advance(final_state);

        self.report(folder, st, machine.state, phases, pending_delete)
    }

    fn report(
        &self,
        folder: &SourceFolder,
        st: FolderState,
        final_state: PipelinePhase,
        phases: Vec<(PipelinePhase, PhaseOutcome)>,
        pending_delete: Option<PendingDelete>,
    ) -> FolderReport {
        FolderReport {
            path: folder.path.clone(),
            folder: st.id,
            classification: folder.classification,
            final_state,
            phases,
            moved: st.moved,
            pending_delete,
            cancelled: st.cancelled,
        }
    }

    /// Record a phase outcome; returns true when the remaining content
    /// phases must be skipped.
    fn absorb(
        &self,
        st: &mut FolderState,
        phase: PipelinePhase,
        outcome: PhaseOutcome,
        phases: &mut Vec<(PipelinePhase, PhaseOutcome)>,
    ) -> bool {
        let stop = match &outcome {
            PhaseOutcome::Ok => false,
            PhaseOutcome::SoftFail(reason) => {
                st.soft_failures.push(reason.clone());
                false
            }
            PhaseOutcome::HardFail(reason) => {
                st.hard_failure = Some(reason.clone());
                true
            }
            PhaseOutcome::Cancelled => {
                st.cancelled = true;
                true
            }
        };
        phases.push((phase, outcome));
        stop
    }

    async fn parity_phase(&self, st: &mut FolderState) -> PhaseOutcome {
        let files = scan::find_parity_files(&st.path);
        let Some(set) = collect_parity_set(&files) else {
            return PhaseOutcome::Ok;
        };

        if self.cancel.is_cancelled() {
            return PhaseOutcome::Cancelled;
        }

        match self.tools.repair_parity(&set, &st.path).await {
            Ok(RunOutcome::Completed(output)) => {
                let outcome = interpret_parity_output(&output.combined());
                st.parity = Some(outcome);
                match outcome {
                    ParityOutcome::VerifiedClean | ParityOutcome::Repaired => {
                        self.stats.add_parity_ok(1);
                        PhaseOutcome::Ok
                    }
                    // Unrecoverable is a normal outcome with a side
                    // effect: the archives are known broken and get
                    // removed during cleanup, without extraction.
                    ParityOutcome::Unrecoverable => {
                        self.stats.add_parity_failed(1);
                        PhaseOutcome::Ok
                    }
                    ParityOutcome::Inconclusive => {
                        self.stats.add_parity_failed(1);
                        PhaseOutcome::SoftFail("parity output was inconclusive".to_string())
                    }
                }
            }
            Ok(RunOutcome::TimedOut { .. }) => {
                self.stats.add_parity_failed(1);
                PhaseOutcome::SoftFail("parity repair timed out".to_string())
            }
            Ok(RunOutcome::Cancelled) => PhaseOutcome::Cancelled,
            Err(err) => {
                self.stats.add_parity_failed(1);
                PhaseOutcome::SoftFail(format!("parity repair failed to run: {}", err))
            }
        }
    }

    async fn extract_phase(&self, st: &mut FolderState) -> PhaseOutcome {
        // Known-broken archives are never extracted.
        if st.parity == Some(ParityOutcome::Unrecoverable) {
            return PhaseOutcome::Ok;
        }

        let mut soft: Vec<String> = Vec::new();

        loop {
            let files = scan::find_archive_files(&st.path, self.config);
            let sets = archive::group_archive_sets(&files, self.config);
            let pending: Vec<ArchiveSet> = sets
                .into_iter()
                .filter(|s| !st.verified_sets.contains(&s.first_part))
                .collect();
            if pending.is_empty() {
                break;
            }
            if st.rounds >= self.config.archive_extraction_loop_limit {
                soft.push(format!(
                    "extraction stopped after {} rounds with archives remaining",
                    st.rounds
                ));
                break;
            }
            st.rounds += 1;

            let mut progressed = false;
            for set in &pending {
                if self.cancel.is_cancelled() {
                    return PhaseOutcome::Cancelled;
                }

                if !set.complete {
                    self.stats.add_archives_failed(1);
                    soft.push(format!(
                        "archive set {} is missing parts",
                        set.first_part.display()
                    ));
                    continue;
                }

                match self.extract_one(st, set).await {
                    SetResult::Extracted => progressed = true,
                    SetResult::Authorized => {}
                    SetResult::Soft(reason) => soft.push(reason),
                    SetResult::Hard(reason) => return PhaseOutcome::HardFail(reason),
                    SetResult::Cancelled => return PhaseOutcome::Cancelled,
                }
            }

            if !progressed {
                break;
            }
        }

        match soft.into_iter().next() {
            Some(reason) => PhaseOutcome::SoftFail(reason),
            None => PhaseOutcome::Ok,
        }
    }

    async fn extract_one(&self, st: &mut FolderState, set: &ArchiveSet) -> SetResult {
        // Step 1: list and validate every entry path before anything is
        // written.
        match self.tools.list_archive(set).await {
            Ok(RunOutcome::Completed(output)) if output.success() => {
                let entries = archive::parse_listing(&output.stdout);
                if let Err(refusal) = archive::validate_listing(&entries, &st.path) {
                    self.stats.add_archives_failed(1);
                    return SetResult::Soft(format!(
                        "listing of {} refused: entry '{}' ({})",
                        set.first_part.display(),
                        refusal.entry,
                        refusal.violation
                    ));
                }
            }
            Ok(RunOutcome::Completed(output)) => {
                self.stats.add_archives_failed(1);
                return SetResult::Soft(format!(
                    "listing of {} failed with {:?}",
                    set.first_part.display(),
                    output.exit_code
                ));
            }
            Ok(RunOutcome::TimedOut { .. }) => {
                self.stats.add_archives_failed(1);
                return SetResult::Soft(format!(
                    "listing of {} timed out",
                    set.first_part.display()
                ));
            }
            Ok(RunOutcome::Cancelled) => return SetResult::Cancelled,
            Err(err) => {
                self.stats.add_archives_failed(1);
                return SetResult::Soft(format!("listing failed to run: {}", err));
            }
        }

        // Step 2: authorize the write with a free-space claim, then
        // extract.
        let required_bytes = archive::required_extraction_space(set.total_bytes);
        let available_bytes = match archive::available_space(&st.path) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!(
                    folder = %st.id,
                    "free space could not be determined for the extraction volume"
                );
                required_bytes
            }
        };
        let status = {
            let ctx = OperationContext::new(PipelinePhase::Extract, &st.ledger)
                .rounds(st.rounds)
                .budget_exhausted(self.budget.exhausted())
                .write_root(&st.path)
                .space(SpaceClaim {
                    required_bytes,
                    available_bytes,
                });
            let op = FileOperation::write_file(&st.path, ReasonCode::ArchiveExtraction);
            self.executor.execute(st.id, &op, &ctx)
        };

        match status {
            ExecutionStatus::Executed => {}
            ExecutionStatus::DryRun => {
                // The extractor itself is suppressed in dry-run; assume
                // the extraction would succeed so the downstream plan
                // (member deletion, folder deletion) matches a clean
                // live run.
                st.verified_sets.insert(set.first_part.clone());
                self.stats.add_archives_extracted(1);
                return SetResult::Authorized;
            }
            ExecutionStatus::Refused(violation) => {
                if self.executor.strict() {
                    return SetResult::Hard(violation.to_string());
                }
                return SetResult::Soft(violation.to_string());
            }
            ExecutionStatus::FailedTransient(reason) => return SetResult::Soft(reason),
        }

        match self.tools.extract_archive(set, &st.path).await {
            Ok(RunOutcome::Completed(output)) if output.success() => {
                st.verified_sets.insert(set.first_part.clone());
                self.stats.add_archives_extracted(1);
                SetResult::Extracted
            }
            Ok(RunOutcome::Completed(output)) => {
                self.stats.add_archives_failed(1);
                SetResult::Soft(format!(
                    "extraction of {} failed with {:?}",
                    set.first_part.display(),
                    output.exit_code
                ))
            }
            Ok(RunOutcome::TimedOut { .. }) => {
                self.stats.add_archives_failed(1);
                SetResult::Soft(format!(
                    "extraction of {} timed out",
                    set.first_part.display()
                ))
            }
            Ok(RunOutcome::Cancelled) => SetResult::Cancelled,
            Err(err) => {
                self.stats.add_archives_failed(1);
                SetResult::Soft(format!("extraction failed to run: {}", err))
            }
        }
    }

    async fn validate_phase(&self, st: &mut FolderState) -> PhaseOutcome {
        let videos = scan::find_videos(&st.path, self.config);
        self.stats.add_videos_found(videos.len() as u64);

        let mut soft: Vec<String> = Vec::new();

        for video in videos {
            if self.cancel.is_cancelled() {
                return PhaseOutcome::Cancelled;
            }

            let size = std::fs::metadata(&video).map(|m| m.len()).unwrap_or(0);
            let verdict = validate_video(self.tools, &video, size, self.config).await;

            let reason = match verdict.kind {
                VerdictKind::Pass => {
                    st.ledger.record_pass(&video);
                    continue;
                }
                VerdictKind::Unknown => {
                    // Fail-closed: the file stays in place, which also
                    // keeps the folder from being deleted.
                    tracing::warn!(
                        folder = %st.id,
                        reason = verdict.reason,
                        "video verdict unknown; leaving file untouched"
                    );
                    continue;
                }
                VerdictKind::Sample => ReasonCode::BelowSampleThreshold,
                VerdictKind::Corrupt => ReasonCode::ValidationFailedCorrupt,
                VerdictKind::Truncated => ReasonCode::ValidationFailedTruncated,
            };

            let op = FileOperation::delete_file(&video, reason);
            match self.run_op(st, PipelinePhase::Validate, op, false) {
                OpFlow::Done => {
                    st.mark_handled(&video);
                    self.stats.add_videos_rejected(1);
                }
                OpFlow::Skipped => {}
                OpFlow::Stop => {
                    return PhaseOutcome::HardFail(
                        st.hard_failure.clone().unwrap_or_default(),
                    )
                }
            }
            if let Some(last) = st.transient.take() {
                soft.push(last);
            }
        }

        match soft.into_iter().next() {
            Some(reason) => PhaseOutcome::SoftFail(reason),
            None => PhaseOutcome::Ok,
        }
    }

    async fn move_phase(&self, st: &mut FolderState) -> PhaseOutcome {
        let destination_root = self.executor.invariants().destination_root().to_path_buf();
        let passed: Vec<PathBuf> = st.ledger.passed_paths().cloned().collect();

        let mut soft: Vec<String> = Vec::new();

        for video in passed {
            if self.cancel.is_cancelled() {
                return PhaseOutcome::Cancelled;
            }

            let size = std::fs::metadata(&video).map(|m| m.len()).unwrap_or(0);
            let Some(name) = video.file_name() else {
                continue;
            };
            let destination = unique_destination(&destination_root, name);

            let op = FileOperation::move_file(&video, &destination, ReasonCode::ValidatedVideo);
            match self.run_op(st, PipelinePhase::Move, op, false) {
                OpFlow::Done => {
                    st.mark_handled(&video);
                    st.moved.push(destination);
                    self.stats.add_videos_moved(1);
                    self.stats.add_bytes_moved(size);
                }
                OpFlow::Skipped => {}
                OpFlow::Stop => {
                    return PhaseOutcome::HardFail(
                        st.hard_failure.clone().unwrap_or_default(),
                    )
                }
            }
            if let Some(last) = st.transient.take() {
                soft.push(last);
            }
        }

        match soft.into_iter().next() {
            Some(reason) => PhaseOutcome::SoftFail(reason),
            None => PhaseOutcome::Ok,
        }
    }

    async fn cleanup_phase(
        &self,
        st: &mut FolderState,
    ) -> (PhaseOutcome, bool, Option<PendingDelete>) {
        let mut soft: Vec<String> = Vec::new();

        // Junk files first.
        for file in scan::walk_files(&st.path) {
            if self.cancel.is_cancelled() {
                return (PhaseOutcome::Cancelled, false, None);
            }
            if st.is_handled(&file) || st.ledger.is_passed(&file) {
                continue;
            }
            if !self.config.is_removable(&file) {
                continue;
            }

            let op = FileOperation::delete_file(&file, ReasonCode::JunkExtension);
            match self.run_op(st, PipelinePhase::Cleanup, op, false) {
                OpFlow::Done => {
                    st.mark_handled(&file);
                    self.stats.add_junk_files_removed(1);
                }
                OpFlow::Skipped => {}
                OpFlow::Stop => {
                    return (
                        PhaseOutcome::HardFail(st.hard_failure.clone().unwrap_or_default()),
                        false,
                        None,
                    )
                }
            }
            if let Some(last) = st.transient.take() {
                soft.push(last);
            }
        }

        // Archive members: only with extraction or parity proof.
        let files = scan::find_archive_files(&st.path, self.config);
        for set in archive::group_archive_sets(&files, self.config) {
            let (verified, reason) = if st.verified_sets.contains(&set.first_part) {
                (true, ReasonCode::ExtractionComplete)
            } else if st.parity == Some(ParityOutcome::Unrecoverable) {
                (false, ReasonCode::ParityUnrecoverable)
            } else {
                continue;
            };

            for member in &set.members {
                if st.is_handled(member) {
                    continue;
                }
                let op = FileOperation::delete_file(member, reason);
                match self.run_op(st, PipelinePhase::Cleanup, op, verified) {
                    OpFlow::Done => st.mark_handled(member),
                    OpFlow::Skipped => {}
                    OpFlow::Stop => {
                        return (
                            PhaseOutcome::HardFail(st.hard_failure.clone().unwrap_or_default()),
                            false,
                            None,
                        )
                    }
                }
                if let Some(last) = st.transient.take() {
                    soft.push(last);
                }
            }
        }

        // Parity files, once the parity question is settled.
        if matches!(st.parity, Some(outcome) if outcome.is_conclusive()) {
            for (file, _) in scan::find_parity_files(&st.path) {
                if st.is_handled(&file) {
                    continue;
                }
                let op = FileOperation::delete_file(&file, ReasonCode::ParityConsumed);
                match self.run_op(st, PipelinePhase::Cleanup, op, false) {
                    OpFlow::Done => st.mark_handled(&file),
                    OpFlow::Skipped => {}
                    OpFlow::Stop => {
                        return (
                            PhaseOutcome::HardFail(st.hard_failure.clone().unwrap_or_default()),
                            false,
                            None,
                        )
                    }
                }
                if let Some(last) = st.transient.take() {
                    soft.push(last);
                }
            }
        }

        // The folder itself, with eligibility re-checked at the last
        // moment.
        if cleanup::folder_eligible(&st.path, self.config, st.parity, &st.handled) {
            let op = FileOperation::delete_folder(&st.path, ReasonCode::EmptyAfterProcessing);
            match self.run_op(st, PipelinePhase::Cleanup, op, false) {
                OpFlow::Done => {
                    self.stats.add_folders_cleaned(1);
                    let outcome = match soft.into_iter().next() {
                        Some(reason) => PhaseOutcome::SoftFail(reason),
                        None => PhaseOutcome::Ok,
                    };
                    return (outcome, true, None);
                }
                OpFlow::Skipped => {}
                OpFlow::Stop => {
                    return (
                        PhaseOutcome::HardFail(st.hard_failure.clone().unwrap_or_default()),
                        false,
                        None,
                    )
                }
            }
            if let Some(last) = st.transient.take() {
                soft.push(last.clone());
                let pending = PendingDelete {
                    folder: st.path.clone(),
                    parity: st.parity,
                    handled: st.handled.clone(),
                };
                let outcome = PhaseOutcome::SoftFail(last);
                return (outcome, false, Some(pending));
            }
        }

        let outcome = match soft.into_iter().next() {
            Some(reason) => PhaseOutcome::SoftFail(reason),
            None => PhaseOutcome::Ok,
        };
        (outcome, false, None)
    }

    /// Run one operation through the executor and fold its disposition
    /// into the folder state. `Stop` means strict-mode refusal.
    fn run_op(
        &self,
        st: &mut FolderState,
        phase: PipelinePhase,
        op: FileOperation,
        extraction_verified: bool,
    ) -> OpFlow {
        let status = {
            let ctx = OperationContext::new(phase, &st.ledger)
                .rounds(st.rounds)
                .budget_exhausted(self.budget.exhausted())
                .extraction_verified(extraction_verified)
                .parity_unrecoverable(st.parity == Some(ParityOutcome::Unrecoverable));
            self.executor.execute(st.id, &op, &ctx)
        };

        match status {
            ExecutionStatus::Executed | ExecutionStatus::DryRun => OpFlow::Done,
            ExecutionStatus::Refused(violation) => {
                if self.executor.strict() {
                    st.hard_failure = Some(violation.to_string());
                    OpFlow::Stop
                } else {
                    OpFlow::Skipped
                }
            }
            ExecutionStatus::FailedTransient(reason) => {
                st.transient = Some(reason);
                OpFlow::Skipped
            }
        }
    }
}

enum SetResult {
    Extracted,
    /// Dry-run: authorized but not performed.
    Authorized,
    Soft(String),
    Hard(String),
    Cancelled,
}

/// Pick a destination path that does not collide with an existing file,
/// appending `_N` before the extension when needed.
fn unique_destination(destination_root: &Path, name: &OsStr) -> PathBuf {
    let candidate = destination_root.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let unique = destination_root.join(format!("{}_{}{}", stem, counter, extension));
        if !unique.exists() {
            return unique;
        }
        counter += 1;
    }
}
