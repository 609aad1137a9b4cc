//! External tool seam
//!
//! The core needs three external capabilities: an archive extractor
//! (list + extract), a parity repairer, and a media probe/decoder. Each is
//! specified by capability rather than brand; substitution is by command
//! path. `ExternalTools` resolves each binary from the config's ordered
//! candidate list and drives the subprocess runner; tests use the
//! in-process fake.

use crate::archive::ArchiveSet;
use crate::parity::ParitySet;
use crate::runner::{
    extraction_timeout, parity_timeout, CaptureMode, CommandSpec, RunOutcome, Runner, RunnerError,
    PROBE_TIMEOUT,
};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use unpackr_config::Config;

/// Error type for tool operations
#[derive(Debug, Error)]
pub enum ToolError {
    /// No candidate for a required binary answered the version probe,
    /// or an optional tool is absent.
    #[error("Tool unavailable: {0}")]
    Unavailable(String),

    /// The runner failed underneath the tool.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Capability set the pipeline consumes.
///
/// Implementations return the raw process outcome; interpreting output
/// (keywords, listings, verdicts) is the engines' job, not the tools'.
#[allow(async_fn_in_trait)]
pub trait ToolSuite: Send + Sync {
    /// Whether the media probe/decoder is present. When it is not, video
    /// verdicts degrade to `Unknown` and nothing destructive happens to
    /// the affected files.
    fn probe_available(&self) -> bool;

    /// List the entries of an archive set, one path per line.
    async fn list_archive(&self, set: &ArchiveSet) -> Result<RunOutcome, ToolError>;

    /// Extract an archive set into `dest`.
    async fn extract_archive(&self, set: &ArchiveSet, dest: &Path)
        -> Result<RunOutcome, ToolError>;

    /// Verify and repair a parity set inside `folder`.
    async fn repair_parity(&self, set: &ParitySet, folder: &Path)
        -> Result<RunOutcome, ToolError>;

    /// Read container metadata for a video.
    async fn probe_video(&self, video: &Path) -> Result<RunOutcome, ToolError>;

    /// Decode a video to null output to surface corruption.
    async fn decode_video(&self, video: &Path) -> Result<RunOutcome, ToolError>;
}

/// Production tool suite backed by resolved command paths.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    runner: Runner,
    extractor: String,
    parity: String,
    probe: Option<String>,
}

impl ExternalTools {
    /// Resolve each binary from its ordered candidate list; the first
    /// candidate that starts at all wins. Extractor and parity tool are
    /// required; the probe is optional and degrades to `Unknown`
    /// verdicts.
    pub async fn resolve(config: &Config, runner: Runner) -> Result<Self, ToolError> {
        let extractor = resolve_candidate(&runner, &config.tool_paths.extractor)
            .await
            .ok_or_else(|| {
                ToolError::Unavailable(format!(
                    "no working archive extractor among {:?}",
                    config.tool_paths.extractor
                ))
            })?;

        let parity = resolve_candidate(&runner, &config.tool_paths.parity)
            .await
            .ok_or_else(|| {
                ToolError::Unavailable(format!(
                    "no working parity tool among {:?}",
                    config.tool_paths.parity
                ))
            })?;

        let probe = resolve_candidate(&runner, &config.tool_paths.probe).await;
        if probe.is_none() {
            tracing::warn!(
                candidates = ?config.tool_paths.probe,
                "media probe not found; video verdicts degrade to unknown"
            );
        }

        Ok(Self {
            runner,
            extractor,
            parity,
            probe,
        })
    }

    pub fn extractor_path(&self) -> &str {
        &self.extractor
    }

    pub fn parity_path(&self) -> &str {
        &self.parity
    }

    pub fn probe_path(&self) -> Option<&str> {
        self.probe.as_deref()
    }
}

/// Probe candidates with a bare `--help` invocation; any completed run
/// (regardless of exit code) proves the binary exists and starts.
async fn resolve_candidate(runner: &Runner, candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let spec = CommandSpec::new(candidate.clone(), Duration::from_secs(10)).arg("--help");
        match runner.run(spec).await {
            Ok(RunOutcome::Completed(_)) => return Some(candidate.clone()),
            Ok(_) | Err(_) => continue,
        }
    }
    None
}

fn spawn_as_unavailable(err: RunnerError) -> ToolError {
    match err {
        RunnerError::Spawn { program, .. } => ToolError::Unavailable(program),
        other => ToolError::Runner(other),
    }
}

impl ToolSuite for ExternalTools {
    fn probe_available(&self) -> bool {
        self.probe.is_some()
    }

    async fn list_archive(&self, set: &ArchiveSet) -> Result<RunOutcome, ToolError> {
        let spec = CommandSpec::new(self.extractor.clone(), extraction_timeout(set.total_bytes))
            .arg("l")
            .arg("-ba")
            .arg(&set.first_part)
            .capture(CaptureMode::TempFile);
        self.runner.run(spec).await.map_err(spawn_as_unavailable)
    }

    async fn extract_archive(
        &self,
        set: &ArchiveSet,
        dest: &Path,
    ) -> Result<RunOutcome, ToolError> {
        let mut out_flag = OsString::from("-o");
        out_flag.push(dest.as_os_str());

        let spec = CommandSpec::new(self.extractor.clone(), extraction_timeout(set.total_bytes))
            .arg("x")
            .arg(&set.first_part)
            .arg(out_flag)
            .arg("-aoa")
            .arg("-y")
            .cwd(dest)
            .capture(CaptureMode::TempFile);
        self.runner.run(spec).await.map_err(spawn_as_unavailable)
    }

    async fn repair_parity(
        &self,
        set: &ParitySet,
        folder: &Path,
    ) -> Result<RunOutcome, ToolError> {
        let spec = CommandSpec::new(self.parity.clone(), parity_timeout(set.total_bytes))
            .arg("r")
            .arg(&set.index)
            .cwd(folder)
            .capture(CaptureMode::TempFile);
        self.runner.run(spec).await.map_err(spawn_as_unavailable)
    }

    async fn probe_video(&self, video: &Path) -> Result<RunOutcome, ToolError> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| ToolError::Unavailable("media probe".to_string()))?;

        // The probe prints metadata on the diagnostic stream and exits
        // non-zero without an output file; both streams are scanned.
        let spec = CommandSpec::new(probe.clone(), PROBE_TIMEOUT)
            .arg("-i")
            .arg(video);
        self.runner.run(spec).await.map_err(spawn_as_unavailable)
    }

    async fn decode_video(&self, video: &Path) -> Result<RunOutcome, ToolError> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| ToolError::Unavailable("media decoder".to_string()))?;

        let spec = CommandSpec::new(probe.clone(), PROBE_TIMEOUT)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(video)
            .arg("-map")
            .arg("0:v:0")
            .arg("-c:v")
            .arg("copy")
            .arg("-f")
            .arg("null")
            .arg("-")
            .capture(CaptureMode::TempFile);
        self.runner.run(spec).await.map_err(spawn_as_unavailable)
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted in-process tool suite for pipeline tests.

    use super::*;
    use crate::runner::ProcessOutput;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct FakeTools {
        pub probe_available: bool,
        /// Combined output the parity repair returns.
        pub parity_output: String,
        /// Listing output per first-part path; when absent, the listing
        /// is derived from `extract_files`.
        pub listings: HashMap<PathBuf, String>,
        /// Files (relative name, size) the fake extractor writes per
        /// first-part path.
        pub extract_files: HashMap<PathBuf, Vec<(String, usize)>>,
        pub extract_exit: i32,
        /// Probe diagnostics per video path; `default_probe_output`
        /// otherwise.
        pub probe_outputs: HashMap<PathBuf, String>,
        pub default_probe_output: String,
        /// (exit code, diagnostics) per video path for the decode step.
        pub decode_results: HashMap<PathBuf, (i32, String)>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeTools {
        /// A suite where every tool exists and every file is healthy:
        /// one minute at 500 kb/s, so small test files clear the
        /// truncation gate.
        pub fn healthy() -> Self {
            Self {
                probe_available: true,
                parity_output: "All files are correct, repair is not needed.".to_string(),
                listings: HashMap::new(),
                extract_files: HashMap::new(),
                extract_exit: 0,
                probe_outputs: HashMap::new(),
                default_probe_output:
                    "  Duration: 00:01:00.00, start: 0.000000, bitrate: 500 kb/s".to_string(),
                decode_results: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn completed(exit_code: i32, stdout: String, stderr: String) -> RunOutcome {
            RunOutcome::Completed(ProcessOutput {
                exit_code: Some(exit_code),
                stdout,
                stderr,
            })
        }
    }

    impl ToolSuite for FakeTools {
        fn probe_available(&self) -> bool {
            self.probe_available
        }

        async fn list_archive(&self, set: &ArchiveSet) -> Result<RunOutcome, ToolError> {
            self.record(format!("list {}", set.first_part.display()));

            let listing = self
                .listings
                .get(&set.first_part)
                .cloned()
                .unwrap_or_else(|| {
                    self.extract_files
                        .get(&set.first_part)
                        .map(|files| {
                            files
                                .iter()
                                .map(|(name, _)| name.clone())
                                .collect::<Vec<_>>()
                                .join("\n")
                        })
                        .unwrap_or_default()
                });
            Ok(Self::completed(0, listing, String::new()))
        }

        async fn extract_archive(
            &self,
            set: &ArchiveSet,
            dest: &Path,
        ) -> Result<RunOutcome, ToolError> {
            self.record(format!("extract {}", set.first_part.display()));

            if self.extract_exit != 0 {
                return Ok(Self::completed(
                    self.extract_exit,
                    String::new(),
                    "extraction error".to_string(),
                ));
            }

            if let Some(files) = self.extract_files.get(&set.first_part) {
                for (name, size) in files {
                    let path = dest.join(name);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(RunnerError::Io)?;
                    }
                    std::fs::write(&path, vec![0u8; *size]).map_err(RunnerError::Io)?;
                }
            }
            Ok(Self::completed(0, String::new(), String::new()))
        }

        async fn repair_parity(
            &self,
            set: &ParitySet,
            _folder: &Path,
        ) -> Result<RunOutcome, ToolError> {
            self.record(format!("parity {}", set.index.display()));
            Ok(Self::completed(0, self.parity_output.clone(), String::new()))
        }

        async fn probe_video(&self, video: &Path) -> Result<RunOutcome, ToolError> {
            if !self.probe_available {
                return Err(ToolError::Unavailable("media probe".to_string()));
            }
            self.record(format!("probe {}", video.display()));

            let output = self
                .probe_outputs
                .get(video)
                .cloned()
                .unwrap_or_else(|| self.default_probe_output.clone());
            // Metadata lands on the diagnostic stream, exit code 1, as
            // real probes behave without an output file.
            Ok(Self::completed(1, String::new(), output))
        }

        async fn decode_video(&self, video: &Path) -> Result<RunOutcome, ToolError> {
            if !self.probe_available {
                return Err(ToolError::Unavailable("media decoder".to_string()));
            }
            self.record(format!("decode {}", video.display()));

            let (code, stderr) = self
                .decode_results
                .get(video)
                .cloned()
                .unwrap_or((0, String::new()));
            Ok(Self::completed(code, String::new(), stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CancelFlag, RunBudget};

    fn runner() -> Runner {
        Runner::new(CancelFlag::new(), RunBudget::new(Duration::from_secs(3600)))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_candidate_first_working_wins() {
        let candidates = vec![
            "definitely-not-a-real-binary-unpackr".to_string(),
            "echo".to_string(),
        ];
        let resolved = resolve_candidate(&runner(), &candidates).await;
        assert_eq!(resolved.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_resolve_candidate_none_working() {
        let candidates = vec!["no-such-binary-a".to_string(), "no-such-binary-b".to_string()];
        assert_eq!(resolve_candidate(&runner(), &candidates).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_requires_extractor() {
        let mut config = Config::default();
        config.tool_paths.extractor = vec!["no-such-binary".to_string()];
        config.tool_paths.parity = vec!["echo".to_string()];
        config.tool_paths.probe = vec!["echo".to_string()];

        let result = ExternalTools::resolve(&config, runner()).await;
        assert!(matches!(result, Err(ToolError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_probe_optional() {
        let mut config = Config::default();
        config.tool_paths.extractor = vec!["echo".to_string()];
        config.tool_paths.parity = vec!["echo".to_string()];
        config.tool_paths.probe = vec!["no-such-binary".to_string()];

        let tools = ExternalTools::resolve(&config, runner())
            .await
            .expect("probe is optional");
        assert!(!tools.probe_available());

        let result = tools.probe_video(Path::new("/tmp/x.mkv")).await;
        assert!(matches!(result, Err(ToolError::Unavailable(_))));
    }
}
