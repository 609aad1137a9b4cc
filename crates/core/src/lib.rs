//! unpackr core
//!
//! Policy and safety engine for the unattended post-download cleanup
//! pipeline: pre-scan and classification, the per-folder state machine,
//! parity/archive/video engines, the safety invariants gating every
//! destructive operation, and the bounded subprocess runner.

pub mod archive;
pub mod audit;
pub mod classify;
pub mod cleanup;
pub mod invariants;
pub mod orchestrator;
pub mod parity;
pub mod pipeline;
pub mod runner;
pub mod scan;
pub mod stats;
pub mod tools;
pub mod validate;

pub use unpackr_config as config;
pub use unpackr_config::Config;

pub use audit::{folder_id, AuditLog, AuditRecord, FolderId};
pub use classify::Classification;
pub use invariants::{
    FileOperation, InvariantId, Invariants, OperationContext, OperationExecutor, OperationKind,
    ReasonCode, ValidationLedger,
};
pub use orchestrator::{Orchestrator, RunError, RunOptions, RunSummary};
pub use parity::ParityOutcome;
pub use pipeline::{FolderPipeline, FolderReport, PhaseOutcome, PipelinePhase};
pub use runner::{CancelFlag, RunBudget, Runner};
pub use scan::SourceFolder;
pub use stats::{RunStats, StatsSnapshot};
pub use tools::{ExternalTools, ToolError, ToolSuite};
pub use validate::{ValidationVerdict, VerdictKind};
