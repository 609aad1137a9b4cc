//! Parity engine
//!
//! Groups `.par2` recovery files into a per-folder parity set and
//! interprets the repair tool's textual output. Real tool output often
//! contains both failure and success phrasing when a repair fails, so
//! failure keywords dominate: a false "ok" here would authorize deletion
//! of still-broken archives.

use std::path::PathBuf;

/// Failure keywords; any match makes the result `Unrecoverable`.
pub const FAILURE_KEYWORDS: &[&str] = &[
    "repair failed",
    "repair impossible",
    "cannot repair",
    "insufficient",
];

/// Success keywords, only consulted when no failure keyword matched.
pub const VERIFIED_KEYWORD: &str = "all files are correct";
pub const REPAIRED_KEYWORD: &str = "repaired";

/// A group of parity index and recovery volumes for one release folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParitySet {
    /// The main index file the repair tool is pointed at.
    pub index: PathBuf,
    /// Companion recovery volumes.
    pub volumes: Vec<PathBuf>,
    /// Combined size of index and volumes.
    pub total_bytes: u64,
}

impl ParitySet {
    /// All member paths, index first.
    pub fn members(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.index).chain(self.volumes.iter())
    }
}

/// Build the folder's parity set from `.par2` files with sizes.
///
/// The main index is the member without a `.volNN+NN` marker; when several
/// qualify the shortest name wins, which matches how the recovery volumes
/// extend the index file's name.
pub fn collect_parity_set(files: &[(PathBuf, u64)]) -> Option<ParitySet> {
    if files.is_empty() {
        return None;
    }

    let mut sorted: Vec<(PathBuf, u64)> = files.to_vec();
    sorted.sort();

    let is_volume = |path: &PathBuf| {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_lowercase().contains(".vol"))
            .unwrap_or(false)
    };

    let index = sorted
        .iter()
        .filter(|(p, _)| !is_volume(p))
        .min_by_key(|(p, _)| p.as_os_str().len())
        .map(|(p, _)| p.clone())
        .unwrap_or_else(|| sorted[0].0.clone());

    let volumes = sorted
        .iter()
        .filter(|(p, _)| *p != index)
        .map(|(p, _)| p.clone())
        .collect();
    let total_bytes = sorted.iter().map(|(_, b)| *b).sum();

    Some(ParitySet {
        index,
        volumes,
        total_bytes,
    })
}

/// Result of interpreting the repair tool's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityOutcome {
    /// All files verified intact; no repair was needed.
    VerifiedClean,
    /// Damage was found and repaired.
    Repaired,
    /// The set cannot be repaired; the archives are known broken.
    Unrecoverable,
    /// Output matched neither keyword class.
    Inconclusive,
}

impl std::fmt::Display for ParityOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParityOutcome::VerifiedClean => "verified-clean",
            ParityOutcome::Repaired => "repaired",
            ParityOutcome::Unrecoverable => "unrecoverable",
            ParityOutcome::Inconclusive => "inconclusive",
        };
        f.write_str(s)
    }
}

impl ParityOutcome {
    /// Whether the parity question is settled for this folder — the
    /// archives are either known good or known broken.
    pub fn is_conclusive(&self) -> bool {
        !matches!(self, ParityOutcome::Inconclusive)
    }
}

/// Interpret combined stdout/stderr of the repair tool.
///
/// Failure keywords are scanned first and win over any success phrasing
/// appearing in the same output.
pub fn interpret_parity_output(output: &str) -> ParityOutcome {
    let lower = output.to_lowercase();

    if FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return ParityOutcome::Unrecoverable;
    }

    if lower.contains(VERIFIED_KEYWORD) {
        return ParityOutcome::VerifiedClean;
    }
    if lower.contains(REPAIRED_KEYWORD) {
        return ParityOutcome::Repaired;
    }

    ParityOutcome::Inconclusive
}
