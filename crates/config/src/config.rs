//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on the whole-run wall clock, regardless of configuration.
pub const MAX_RUNTIME_CAP: Duration = Duration::from_secs(4 * 3600);

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantic validation failed; the run must not begin
    #[error("Invalid configuration:\n{}", problems.join("\n"))]
    Invalid { problems: Vec<String> },
}

/// Ordered candidate invocation paths for each external binary.
///
/// The first candidate that answers a version probe wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolPaths {
    #[serde(default = "default_extractor_candidates")]
    pub extractor: Vec<String>,
    #[serde(default = "default_parity_candidates")]
    pub parity: Vec<String>,
    #[serde(default = "default_probe_candidates")]
    pub probe: Vec<String>,
}

fn default_extractor_candidates() -> Vec<String> {
    vec!["7z".to_string()]
}

fn default_parity_candidates() -> Vec<String> {
    vec!["par2".to_string()]
}

fn default_probe_candidates() -> Vec<String> {
    vec!["ffmpeg".to_string()]
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            extractor: default_extractor_candidates(),
            parity: default_parity_candidates(),
            probe: default_probe_candidates(),
        }
    }
}

/// Main configuration record.
///
/// Loaded once per run from a JSON file and immutable afterwards. Every
/// field has a default, so an empty `{}` document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Lowercase video extensions, each including the leading dot.
    #[serde(default = "default_video_extensions")]
    pub video_extensions: BTreeSet<String>,

    /// Lowercase music extensions.
    #[serde(default = "default_music_extensions")]
    pub music_extensions: BTreeSet<String>,

    /// Lowercase image extensions.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: BTreeSet<String>,

    /// Lowercase document extensions.
    #[serde(default = "default_document_extensions")]
    pub document_extensions: BTreeSet<String>,

    /// Extensions that count as deletable junk.
    #[serde(default = "default_removable_extensions")]
    pub removable_extensions: BTreeSet<String>,

    /// Plain archive extensions. Multi-part volume patterns (`.r00`,
    /// `.7z.001`) are recognized separately by the archive engine.
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: BTreeSet<String>,

    /// Videos strictly smaller than this are treated as samples.
    #[serde(default = "default_min_sample_size_mb")]
    pub min_sample_size_mb: u64,

    /// Music file count that triggers folder preservation.
    #[serde(default = "default_min_collection_files")]
    pub min_music_files: usize,

    /// Image file count that triggers folder preservation.
    #[serde(default = "default_min_collection_files")]
    pub min_image_files: usize,

    /// Document count that triggers folder preservation.
    #[serde(default = "default_min_collection_files")]
    pub min_documents: usize,

    /// Size floor for an image collection, so a handful of cover-art
    /// thumbnails does not preserve a folder.
    #[serde(default = "default_min_image_folder_bytes")]
    pub min_image_folder_bytes: u64,

    /// Hard cap on nested-extraction rounds per folder.
    #[serde(default = "default_extraction_loop_limit")]
    pub archive_extraction_loop_limit: u32,

    /// Wall-clock limit for the whole run, in hours.
    #[serde(default = "default_max_runtime_hours")]
    pub max_runtime_hours: u64,

    /// Candidate invocation paths for the external binaries.
    #[serde(default)]
    pub tool_paths: ToolPaths,

    /// Suppress all destructive operations; decisions still run.
    #[serde(default)]
    pub dry_run: bool,

    /// Include raw filesystem paths in audit records. Off by default.
    #[serde(default)]
    pub log_paths: bool,

    /// Presentation hint consumed by the terminal frontend.
    #[serde(default = "default_true")]
    pub animations: bool,

    /// Presentation hint consumed by the terminal frontend.
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_video_extensions() -> BTreeSet<String> {
    to_set(&[
        ".mp4", ".avi", ".mkv", ".mov", ".wmv", ".flv", ".mpg", ".mpeg", ".m4v", ".3gp", ".webm",
    ])
}

fn default_music_extensions() -> BTreeSet<String> {
    to_set(&[".mp3", ".flac", ".wav", ".aac", ".m4a", ".ogg", ".wma"])
}

fn default_image_extensions() -> BTreeSet<String> {
    to_set(&[
        ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tiff", ".webp", ".raw", ".cr2", ".nef",
    ])
}

fn default_document_extensions() -> BTreeSet<String> {
    to_set(&[
        ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt", ".rtf", ".odt",
    ])
}

fn default_removable_extensions() -> BTreeSet<String> {
    to_set(&[
        ".sfv", ".nfo", ".srr", ".srs", ".url", ".db", ".nzb", ".txt", ".xml", ".dat", ".exe",
        ".htm", ".log",
    ])
}

fn default_archive_extensions() -> BTreeSet<String> {
    to_set(&[".zip", ".7z", ".rar"])
}

fn default_min_sample_size_mb() -> u64 {
    50
}

fn default_min_collection_files() -> usize {
    10
}

fn default_min_image_folder_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_extraction_loop_limit() -> u32 {
    5
}

fn default_max_runtime_hours() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

/// Extracts the lowercase extension of a path, including the leading dot.
///
/// Returns `None` for paths without an extension.
pub fn normalized_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

impl Config {
    /// Load configuration from a JSON file, apply environment overrides,
    /// and validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file without overrides or validation.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Overrides the following values if environment variables are set:
    /// - UNPACKR_DRY_RUN -> dry_run
    /// - UNPACKR_MAX_RUNTIME_HOURS -> max_runtime_hours
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("UNPACKR_DRY_RUN") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.dry_run = true,
                "false" | "0" | "no" => self.dry_run = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("UNPACKR_MAX_RUNTIME_HOURS") {
            if let Ok(hours) = val.parse::<u64>() {
                self.max_runtime_hours = hours;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// An invalid configuration refuses the run before any scanning starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let extension_lists: [(&str, &BTreeSet<String>); 6] = [
            ("video_extensions", &self.video_extensions),
            ("music_extensions", &self.music_extensions),
            ("image_extensions", &self.image_extensions),
            ("document_extensions", &self.document_extensions),
            ("removable_extensions", &self.removable_extensions),
            ("archive_extensions", &self.archive_extensions),
        ];

        for (name, set) in extension_lists {
            for ext in set {
                if !ext.starts_with('.') {
                    problems.push(format!("{}: extension '{}' must start with '.'", name, ext));
                } else if ext.len() < 2 {
                    problems.push(format!("{}: extension '{}' is empty", name, ext));
                } else if *ext != ext.to_lowercase() {
                    problems.push(format!("{}: extension '{}' must be lowercase", name, ext));
                }
            }
        }

        let numeric_ranges: [(&str, u64, u64, u64); 6] = [
            ("min_sample_size_mb", self.min_sample_size_mb, 1, 10_000),
            ("min_music_files", self.min_music_files as u64, 0, 1_000),
            ("min_image_files", self.min_image_files as u64, 0, 1_000),
            ("min_documents", self.min_documents as u64, 0, 1_000),
            (
                "archive_extraction_loop_limit",
                u64::from(self.archive_extraction_loop_limit),
                1,
                100,
            ),
            ("max_runtime_hours", self.max_runtime_hours, 1, 168),
        ];

        for (name, value, min, max) in numeric_ranges {
            if value < min || value > max {
                problems.push(format!(
                    "{}: value {} outside valid range {}..={}",
                    name, value, min, max
                ));
            }
        }

        let tool_lists: [(&str, &Vec<String>); 3] = [
            ("tool_paths.extractor", &self.tool_paths.extractor),
            ("tool_paths.parity", &self.tool_paths.parity),
            ("tool_paths.probe", &self.tool_paths.probe),
        ];

        for (name, list) in tool_lists {
            if list.is_empty() {
                problems.push(format!("{}: candidate list must not be empty", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Sample threshold in bytes.
    pub fn min_sample_size_bytes(&self) -> u64 {
        self.min_sample_size_mb * 1024 * 1024
    }

    /// Wall-clock budget for the whole run, clamped to the hard cap.
    pub fn global_runtime_budget(&self) -> Duration {
        Duration::from_secs(self.max_runtime_hours * 3600).min(MAX_RUNTIME_CAP)
    }

    pub fn is_video(&self, path: &Path) -> bool {
        self.has_extension_in(path, &self.video_extensions)
    }

    pub fn is_music(&self, path: &Path) -> bool {
        self.has_extension_in(path, &self.music_extensions)
    }

    pub fn is_image(&self, path: &Path) -> bool {
        self.has_extension_in(path, &self.image_extensions)
    }

    pub fn is_document(&self, path: &Path) -> bool {
        self.has_extension_in(path, &self.document_extensions)
    }

    pub fn is_removable(&self, path: &Path) -> bool {
        self.has_extension_in(path, &self.removable_extensions)
    }

    fn has_extension_in(&self, path: &Path, set: &BTreeSet<String>) -> bool {
        normalized_extension(path)
            .map(|ext| set.contains(&ext))
            .unwrap_or(false)
    }
}
