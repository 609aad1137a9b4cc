//! Structured audit records
//!
//! Every executed or refused destructive operation produces exactly one
//! audit record. Records go to the `tracing` sink as structured events and
//! are retained in an in-memory journal for the run, which backs the
//! dry-run parity checks and the optional post-run audit.
//!
//! In the default privacy mode a record carries an opaque folder hash and
//! no raw source paths; `log_paths` in the config re-enables them.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier for a source folder, stable within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderId(u64);

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Derives the opaque folder id from a folder path.
pub fn folder_id(path: &Path) -> FolderId {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    FolderId(hasher.finish())
}

/// One audit record, emitted per operation decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp_ms: u64,
    pub run_id: String,
    pub folder: String,
    pub phase: String,
    pub kind: String,
    pub reason: String,
    /// Invariant that refused the operation, when it was refused.
    pub invariant: Option<String>,
    pub executed: bool,
    pub outcome: String,
    /// Raw target path; populated only when path logging is enabled.
    pub target: Option<String>,
    /// Raw destination path for moves; populated only when path logging
    /// is enabled.
    pub destination: Option<String>,
}

/// Sink and journal for audit records.
#[derive(Debug)]
pub struct AuditLog {
    run_id: String,
    log_paths: bool,
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new(log_paths: bool) -> Self {
        Self {
            run_id: new_run_id(),
            log_paths,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Build, store, and emit one record.
    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        folder: FolderId,
        phase: &str,
        kind: &str,
        reason: &str,
        invariant: Option<&str>,
        executed: bool,
        outcome: &str,
        target: &Path,
        destination: Option<&Path>,
    ) {
        let record = AuditRecord {
            timestamp_ms: now_ms(),
            run_id: self.run_id.clone(),
            folder: folder.to_string(),
            phase: phase.to_string(),
            kind: kind.to_string(),
            reason: reason.to_string(),
            invariant: invariant.map(|s| s.to_string()),
            executed,
            outcome: outcome.to_string(),
            target: self
                .log_paths
                .then(|| target.to_string_lossy().into_owned()),
            destination: destination
                .filter(|_| self.log_paths)
                .map(|p| p.to_string_lossy().into_owned()),
        };

        tracing::info!(
            target: "unpackr::audit",
            run = %record.run_id,
            folder = %record.folder,
            phase = %record.phase,
            kind = %record.kind,
            reason = %record.reason,
            invariant = record.invariant.as_deref().unwrap_or(""),
            executed = record.executed,
            outcome = %record.outcome,
        );

        self.records
            .lock()
            .expect("audit journal lock poisoned")
            .push(record);
    }

    /// Full journal for the run so far.
    pub fn journal(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .expect("audit journal lock poisoned")
            .clone()
    }

    /// The decision sequence: (kind, reason, folder, outcome-independent).
    ///
    /// Dry-run and live runs over the same tree must produce the same
    /// sequence; only the `executed` flag differs.
    pub fn decisions(&self) -> Vec<(String, String, String)> {
        self.journal()
            .into_iter()
            .map(|r| (r.kind, r.reason, r.folder))
            .collect()
    }
}

/// Generates a run id unique enough for correlating one process's records.
pub fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", nanos, std::process::id())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_folder_id_is_stable_and_distinct() {
        let a = folder_id(Path::new("/downloads/release-a"));
        let b = folder_id(Path::new("/downloads/release-b"));
        assert_eq!(a, folder_id(Path::new("/downloads/release-a")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_privacy_mode_strips_paths() {
        let log = AuditLog::new(false);
        log.emit(
            folder_id(Path::new("/downloads/r1")),
            "cleanup-phase",
            "delete-file",
            "junk-extension",
            None,
            true,
            "executed",
            &PathBuf::from("/downloads/r1/release.nfo"),
            None,
        );

        let journal = log.journal();
        assert_eq!(journal.len(), 1);
        assert!(journal[0].target.is_none());
        assert!(journal[0].destination.is_none());
    }

    #[test]
    fn test_path_logging_keeps_paths() {
        let log = AuditLog::new(true);
        log.emit(
            folder_id(Path::new("/downloads/r1")),
            "move-phase",
            "move-file",
            "validated-video",
            None,
            true,
            "executed",
            &PathBuf::from("/downloads/r1/movie.mkv"),
            Some(&PathBuf::from("/library/movie.mkv")),
        );

        let journal = log.journal();
        assert_eq!(
            journal[0].target.as_deref(),
            Some("/downloads/r1/movie.mkv")
        );
        assert_eq!(journal[0].destination.as_deref(), Some("/library/movie.mkv"));
    }

    #[test]
    fn test_refusal_record_carries_invariant() {
        let log = AuditLog::new(false);
        log.emit(
            folder_id(Path::new("/downloads/r1")),
            "cleanup-phase",
            "delete-folder",
            "empty-after-processing",
            Some("source-confinement"),
            false,
            "refused",
            &PathBuf::from("/library"),
            None,
        );

        let journal = log.journal();
        assert_eq!(journal[0].invariant.as_deref(), Some("source-confinement"));
        assert!(!journal[0].executed);
    }

    #[test]
    fn test_decisions_sequence_order() {
        let log = AuditLog::new(false);
        let folder = folder_id(Path::new("/downloads/r1"));
        for name in ["a.nfo", "b.nfo"] {
            log.emit(
                folder,
                "cleanup-phase",
                "delete-file",
                "junk-extension",
                None,
                true,
                "executed",
                &PathBuf::from(name),
                None,
            );
        }

        let decisions = log.decisions();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|(kind, reason, _)| {
            kind == "delete-file" && reason == "junk-extension"
        }));
    }

    #[test]
    fn test_run_ids_differ() {
        assert_ne!(new_run_id(), new_run_id());
    }
}
