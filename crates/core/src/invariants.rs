//! Safety invariants
//!
//! Executable predicates gating every destructive operation. Each intended
//! action is described as a `FileOperation` with a reason code from a
//! closed enumeration, passed through the single `enforce` entry point of
//! the `OperationExecutor` before anything touches the filesystem. A
//! failed predicate refuses the operation; the policy is fail-closed.
//!
//! In dry-run mode every predicate still runs and the audit record is
//! emitted as if the operation would execute; only the syscall is
//! replaced by a no-op.

use crate::audit::{AuditLog, FolderId};
use crate::pipeline::PipelinePhase;
use crate::stats::RunStats;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use unpackr_config::Config;

/// Windows reserved device names; never acceptable as a file stem.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Kind of destructive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    DeleteFile,
    DeleteFolder,
    MoveFile,
    WriteFile,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::DeleteFile => "delete-file",
            OperationKind::DeleteFolder => "delete-folder",
            OperationKind::MoveFile => "move-file",
            OperationKind::WriteFile => "write-file",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed enumeration of reasons an operation may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    JunkExtension,
    BelowSampleThreshold,
    ValidationFailedCorrupt,
    ValidationFailedTruncated,
    ParityUnrecoverable,
    ExtractionComplete,
    ParityConsumed,
    EmptyAfterProcessing,
    ValidatedVideo,
    ArchiveExtraction,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::JunkExtension => "junk-extension",
            ReasonCode::BelowSampleThreshold => "below-sample-threshold",
            ReasonCode::ValidationFailedCorrupt => "validation-failed-corrupt",
            ReasonCode::ValidationFailedTruncated => "validation-failed-truncated",
            ReasonCode::ParityUnrecoverable => "parity-unrecoverable",
            ReasonCode::ExtractionComplete => "extraction-complete",
            ReasonCode::ParityConsumed => "parity-consumed",
            ReasonCode::EmptyAfterProcessing => "empty-after-processing",
            ReasonCode::ValidatedVideo => "validated-video",
            ReasonCode::ArchiveExtraction => "archive-extraction",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intended destructive action, constructed immediately before acting
/// and discarded right after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    pub kind: OperationKind,
    pub target: PathBuf,
    pub destination: Option<PathBuf>,
    pub reason: ReasonCode,
}

impl FileOperation {
    pub fn delete_file(target: impl Into<PathBuf>, reason: ReasonCode) -> Self {
        Self {
            kind: OperationKind::DeleteFile,
            target: target.into(),
            destination: None,
            reason,
        }
    }

    pub fn delete_folder(target: impl Into<PathBuf>, reason: ReasonCode) -> Self {
        Self {
            kind: OperationKind::DeleteFolder,
            target: target.into(),
            destination: None,
            reason,
        }
    }

    pub fn move_file(
        target: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        reason: ReasonCode,
    ) -> Self {
        Self {
            kind: OperationKind::MoveFile,
            target: target.into(),
            destination: Some(destination.into()),
            reason,
        }
    }

    pub fn write_file(target: impl Into<PathBuf>, reason: ReasonCode) -> Self {
        Self {
            kind: OperationKind::WriteFile,
            target: target.into(),
            destination: None,
            reason,
        }
    }
}

/// Identifier of a safety predicate, named by what it protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantId {
    Containment,
    NoDeleteValidated,
    ExtractVerified,
    LoopBound,
    SpaceBudget,
    SafeName,
    LegalState,
    BoundedSubprocess,
    SourceConfinement,
    ReasonCoded,
}

impl InvariantId {
    pub const ALL: [InvariantId; 10] = [
        InvariantId::Containment,
        InvariantId::NoDeleteValidated,
        InvariantId::ExtractVerified,
        InvariantId::LoopBound,
        InvariantId::SpaceBudget,
        InvariantId::SafeName,
        InvariantId::LegalState,
        InvariantId::BoundedSubprocess,
        InvariantId::SourceConfinement,
        InvariantId::ReasonCoded,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|id| id == self)
            .expect("every invariant id is listed")
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvariantId::Containment => "containment",
            InvariantId::NoDeleteValidated => "no-delete-validated",
            InvariantId::ExtractVerified => "extract-verified",
            InvariantId::LoopBound => "loop-bound",
            InvariantId::SpaceBudget => "space-budget",
            InvariantId::SafeName => "safe-name",
            InvariantId::LegalState => "legal-state",
            InvariantId::BoundedSubprocess => "bounded-subprocess",
            InvariantId::SourceConfinement => "source-confinement",
            InvariantId::ReasonCoded => "reason-coded",
        }
    }
}

impl std::fmt::Display for InvariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused operation: the invariant that failed and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub id: InvariantId,
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.detail)
    }
}

fn violation(id: InvariantId, detail: impl Into<String>) -> Violation {
    Violation {
        id,
        detail: detail.into(),
    }
}

/// Cache of videos that received a `Pass` verdict this run. Backs the
/// rule that a validated video is only ever moved, never deleted.
#[derive(Debug, Default)]
pub struct ValidationLedger {
    passed: BTreeSet<PathBuf>,
}

impl ValidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&mut self, path: &Path) {
        self.passed.insert(lexical_normalize(path));
    }

    pub fn is_passed(&self, path: &Path) -> bool {
        self.passed.contains(&lexical_normalize(path))
    }

    pub fn passed_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.passed.iter()
    }
}

/// Free-space assertion accompanying an extraction authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceClaim {
    pub required_bytes: u64,
    pub available_bytes: u64,
}

/// Caller-supplied proof context for one operation.
#[derive(Debug, Clone)]
pub struct OperationContext<'a> {
    pub phase: PipelinePhase,
    pub validated: &'a ValidationLedger,
    /// Set when the caller asserts the extractor reported success for the
    /// set this target belongs to.
    pub extraction_verified: bool,
    /// Set when the folder's parity set came back unrecoverable.
    pub parity_unrecoverable: bool,
    pub extraction_rounds: u32,
    pub budget_exhausted: bool,
    pub space: Option<SpaceClaim>,
    /// Containment root for write operations (the extraction root).
    pub write_root: Option<&'a Path>,
}

impl<'a> OperationContext<'a> {
    pub fn new(phase: PipelinePhase, validated: &'a ValidationLedger) -> Self {
        Self {
            phase,
            validated,
            extraction_verified: false,
            parity_unrecoverable: false,
            extraction_rounds: 0,
            budget_exhausted: false,
            space: None,
            write_root: None,
        }
    }

    pub fn extraction_verified(mut self, verified: bool) -> Self {
        self.extraction_verified = verified;
        self
    }

    pub fn parity_unrecoverable(mut self, unrecoverable: bool) -> Self {
        self.parity_unrecoverable = unrecoverable;
        self
    }

    pub fn rounds(mut self, rounds: u32) -> Self {
        self.extraction_rounds = rounds;
        self
    }

    pub fn budget_exhausted(mut self, exhausted: bool) -> Self {
        self.budget_exhausted = exhausted;
        self
    }

    pub fn space(mut self, claim: SpaceClaim) -> Self {
        self.space = Some(claim);
        self
    }

    pub fn write_root(mut self, root: &'a Path) -> Self {
        self.write_root = Some(root);
        self
    }
}

/// Normalize a path lexically: resolve `.` and `..` without touching the
/// filesystem, so containment can be decided for paths that do not exist
/// yet.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn within(root: &Path, path: &Path) -> bool {
    lexical_normalize(path).starts_with(root)
}

/// The predicate set, bound to the run's roots and limits.
#[derive(Debug, Clone)]
pub struct Invariants {
    config: Config,
    source_root: PathBuf,
    destination_root: PathBuf,
}

impl Invariants {
    pub fn new(config: Config, source_root: &Path, destination_root: &Path) -> Self {
        Self {
            config,
            source_root: lexical_normalize(source_root),
            destination_root: lexical_normalize(destination_root),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    /// Evaluate every applicable predicate; the first failure refuses the
    /// operation.
    pub fn check(&self, op: &FileOperation, ctx: &OperationContext) -> Result<(), Violation> {
        self.containment(op, ctx)?;
        self.no_delete_validated(op, ctx)?;
        self.extract_verified(op, ctx)?;
        self.loop_bound(ctx)?;
        self.space_budget(op, ctx)?;
        self.safe_name(op)?;
        self.legal_state(op, ctx)?;
        self.source_confinement(op)?;
        self.reason_coded(op)?;
        Ok(())
    }

    /// Moves land in the destination tree; writes land in the declared
    /// extraction root.
    fn containment(&self, op: &FileOperation, ctx: &OperationContext) -> Result<(), Violation> {
        match op.kind {
            OperationKind::MoveFile => {
                let Some(destination) = &op.destination else {
                    return Err(violation(
                        InvariantId::Containment,
                        "move operation without a destination",
                    ));
                };
                if !within(&self.destination_root, destination) {
                    return Err(violation(
                        InvariantId::Containment,
                        format!(
                            "destination {} is outside the destination root",
                            destination.display()
                        ),
                    ));
                }
                Ok(())
            }
            OperationKind::WriteFile => {
                let Some(root) = ctx.write_root else {
                    return Err(violation(
                        InvariantId::Containment,
                        "write operation without a declared extraction root",
                    ));
                };
                if !within(&lexical_normalize(root), &op.target) {
                    return Err(violation(
                        InvariantId::Containment,
                        format!(
                            "write target {} is outside the extraction root",
                            op.target.display()
                        ),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A video with a cached `Pass` verdict is only moved, never deleted.
    fn no_delete_validated(
        &self,
        op: &FileOperation,
        ctx: &OperationContext,
    ) -> Result<(), Violation> {
        if op.kind == OperationKind::DeleteFile
            && self.config.is_video(&op.target)
            && ctx.validated.is_passed(&op.target)
        {
            return Err(violation(
                InvariantId::NoDeleteValidated,
                format!(
                    "{} passed validation and must not be deleted",
                    op.target.display()
                ),
            ));
        }
        Ok(())
    }

    /// Archive members may go only after verified extraction, or when the
    /// parity set reported them unrecoverable.
    fn extract_verified(&self, op: &FileOperation, ctx: &OperationContext) -> Result<(), Violation> {
        if op.kind == OperationKind::DeleteFile
            && crate::archive::is_archive_file(&op.target, &self.config)
            && !ctx.extraction_verified
            && !ctx.parity_unrecoverable
        {
            return Err(violation(
                InvariantId::ExtractVerified,
                format!(
                    "{} is an archive member without extraction or parity proof",
                    op.target.display()
                ),
            ));
        }
        Ok(())
    }

    fn loop_bound(&self, ctx: &OperationContext) -> Result<(), Violation> {
        if ctx.extraction_rounds > self.config.archive_extraction_loop_limit {
            return Err(violation(
                InvariantId::LoopBound,
                format!(
                    "extraction round {} exceeds the limit of {}",
                    ctx.extraction_rounds, self.config.archive_extraction_loop_limit
                ),
            ));
        }
        if ctx.budget_exhausted {
            return Err(violation(
                InvariantId::LoopBound,
                "global runtime budget exhausted",
            ));
        }
        Ok(())
    }

    fn space_budget(&self, op: &FileOperation, ctx: &OperationContext) -> Result<(), Violation> {
        if op.kind != OperationKind::WriteFile {
            return Ok(());
        }
        match ctx.space {
            Some(claim) if claim.available_bytes >= claim.required_bytes => Ok(()),
            Some(claim) => Err(violation(
                InvariantId::SpaceBudget,
                format!(
                    "{} bytes available, {} required",
                    claim.available_bytes, claim.required_bytes
                ),
            )),
            None => Err(violation(
                InvariantId::SpaceBudget,
                "write operation without a free-space claim",
            )),
        }
    }

    fn safe_name(&self, op: &FileOperation) -> Result<(), Violation> {
        if !matches!(op.kind, OperationKind::MoveFile | OperationKind::WriteFile) {
            return Ok(());
        }
        let path = op.destination.as_deref().unwrap_or(&op.target);
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Err(violation(
                InvariantId::SafeName,
                format!("{} has no usable final component", path.display()),
            ));
        };

        if name.contains('\0') {
            return Err(violation(InvariantId::SafeName, "name contains a NUL byte"));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(violation(
                InvariantId::SafeName,
                "name contains a path separator",
            ));
        }
        let stem = name.split('.').next().unwrap_or(name).to_uppercase();
        if RESERVED_NAMES.contains(&stem.as_str()) {
            return Err(violation(
                InvariantId::SafeName,
                format!("'{}' is a reserved device name", name),
            ));
        }
        Ok(())
    }

    fn legal_state(&self, op: &FileOperation, ctx: &OperationContext) -> Result<(), Violation> {
        let allowed = match op.kind {
            OperationKind::DeleteFile => matches!(
                ctx.phase,
                PipelinePhase::Validate | PipelinePhase::Cleanup
            ),
            OperationKind::DeleteFolder => ctx.phase == PipelinePhase::Cleanup,
            OperationKind::MoveFile => ctx.phase == PipelinePhase::Move,
            OperationKind::WriteFile => ctx.phase == PipelinePhase::Extract,
        };
        if !allowed {
            return Err(violation(
                InvariantId::LegalState,
                format!("{} is not allowed in {}", op.kind, ctx.phase),
            ));
        }
        Ok(())
    }

    /// Deletions stay inside the source tree and never touch the
    /// destination tree.
    fn source_confinement(&self, op: &FileOperation) -> Result<(), Violation> {
        if !matches!(
            op.kind,
            OperationKind::DeleteFile | OperationKind::DeleteFolder
        ) {
            return Ok(());
        }
        if !within(&self.source_root, &op.target) {
            return Err(violation(
                InvariantId::SourceConfinement,
                format!("{} is outside the source root", op.target.display()),
            ));
        }
        if within(&self.destination_root, &op.target) {
            return Err(violation(
                InvariantId::SourceConfinement,
                format!("{} is inside the destination root", op.target.display()),
            ));
        }
        Ok(())
    }

    fn reason_coded(&self, op: &FileOperation) -> Result<(), Violation> {
        let allowed: &[ReasonCode] = match op.kind {
            OperationKind::DeleteFile => &[
                ReasonCode::JunkExtension,
                ReasonCode::BelowSampleThreshold,
                ReasonCode::ValidationFailedCorrupt,
                ReasonCode::ValidationFailedTruncated,
                ReasonCode::ParityUnrecoverable,
                ReasonCode::ExtractionComplete,
                ReasonCode::ParityConsumed,
            ],
            OperationKind::DeleteFolder => &[ReasonCode::EmptyAfterProcessing],
            OperationKind::MoveFile => &[ReasonCode::ValidatedVideo],
            OperationKind::WriteFile => &[ReasonCode::ArchiveExtraction],
        };
        if !allowed.contains(&op.reason) {
            return Err(violation(
                InvariantId::ReasonCoded,
                format!("reason '{}' is not valid for {}", op.reason, op.kind),
            ));
        }
        Ok(())
    }
}

/// Disposition of one operation after enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Executed,
    /// Predicates passed; the syscall was suppressed by dry-run.
    DryRun,
    Refused(Violation),
    /// The syscall failed in a way worth retrying later.
    FailedTransient(String),
}

/// Single gateway between decisions and the filesystem.
///
/// Every destructive operation flows through `execute`, which enforces
/// the invariants, emits exactly one audit record, and then performs (or
/// suppresses) the action.
#[derive(Debug)]
pub struct OperationExecutor {
    invariants: Invariants,
    dry_run: bool,
    strict: bool,
    stats: Arc<RunStats>,
    audit: Arc<AuditLog>,
}

impl OperationExecutor {
    pub fn new(
        invariants: Invariants,
        dry_run: bool,
        stats: Arc<RunStats>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            invariants,
            dry_run,
            strict: true,
            stats,
            audit,
        }
    }

    /// Permissive mode logs refusals and skips instead of hard-failing
    /// the folder.
    pub fn permissive(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn invariants(&self) -> &Invariants {
        &self.invariants
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn execute(
        &self,
        folder: FolderId,
        op: &FileOperation,
        ctx: &OperationContext,
    ) -> ExecutionStatus {
        if let Err(refusal) = self.invariants.check(op, ctx) {
            self.stats.record_refusal(refusal.id);
            self.emit(folder, op, ctx, Some(&refusal), false, "refused");
            return ExecutionStatus::Refused(refusal);
        }

        if self.dry_run {
            self.emit(folder, op, ctx, None, false, "dry-run");
            return ExecutionStatus::DryRun;
        }

        match self.perform(op) {
            Ok(()) => {
                self.stats.add_operations_executed(1);
                self.emit(folder, op, ctx, None, true, "executed");
                ExecutionStatus::Executed
            }
            Err(err) => {
                self.emit(folder, op, ctx, None, false, "failed");
                ExecutionStatus::FailedTransient(err.to_string())
            }
        }
    }

    fn perform(&self, op: &FileOperation) -> std::io::Result<()> {
        match op.kind {
            OperationKind::DeleteFile => match std::fs::remove_file(&op.target) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            OperationKind::DeleteFolder => std::fs::remove_dir_all(&op.target),
            OperationKind::MoveFile => {
                let destination = op
                    .destination
                    .as_ref()
                    .expect("containment already required a destination");
                move_file(&op.target, destination)
            }
            // The write is performed by the external extractor; the
            // operation records the authorization.
            OperationKind::WriteFile => Ok(()),
        }
    }

    fn emit(
        &self,
        folder: FolderId,
        op: &FileOperation,
        ctx: &OperationContext,
        refusal: Option<&Violation>,
        executed: bool,
        outcome: &str,
    ) {
        self.audit.emit(
            folder,
            ctx.phase.as_str(),
            op.kind.as_str(),
            op.reason.as_str(),
            refusal.map(|v| v.id.as_str()),
            executed,
            outcome,
            &op.target,
            op.destination.as_deref(),
        );
    }
}

/// Move with rename, falling back to copy-and-delete across filesystems.
fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
    if std::fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, destination)?;
    std::fs::remove_file(source)
}
