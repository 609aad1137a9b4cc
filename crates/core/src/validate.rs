//! Video validator
//!
//! Applies the health gates to one candidate video in a fixed order:
//! size floor, sample floor, metadata probe, duration floor, truncation
//! check, and finally a null-output decode probe. Only the probe and
//! decode steps invoke a subprocess.
//!
//! A missing probe tool yields `Unknown`, which is fail-closed for every
//! destructive outcome: the file is neither moved nor deleted.

use crate::runner::RunOutcome;
use crate::tools::{ToolError, ToolSuite};
use std::path::Path;
use unpackr_config::Config;

/// Videos smaller than this are rejected outright.
pub const MIN_VIDEO_BYTES: u64 = 1024 * 1024;

/// Videos shorter than this are rejected as corrupt.
pub const MIN_DURATION_SECS: f64 = 10.0;

/// Observed/expected size ratio below which a video counts as truncated.
pub const TRUNCATION_RATIO: f64 = 0.70;

/// Closed list of decode diagnostics that mark a file corrupt.
pub const DECODE_ERROR_KEYWORDS: &[&str] = &[
    "invalid data",
    "moov atom not found",
    "corrupt",
    "truncated",
    "error while decoding",
];

/// Verdict category for a candidate video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Pass,
    /// Smaller than the sample floor, or named as a sample.
    Sample,
    /// Failed a decode, metadata, or size gate.
    Corrupt,
    /// Observed size falls short of duration x bitrate.
    Truncated,
    /// The probe tool is unavailable; nothing may act on this file.
    Unknown,
}

/// A verdict with its machine-readable reason and a human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub kind: VerdictKind,
    pub reason: &'static str,
    pub message: String,
}

impl ValidationVerdict {
    fn new(kind: VerdictKind, reason: &'static str, message: String) -> Self {
        Self {
            kind,
            reason,
            message,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.kind == VerdictKind::Pass
    }
}

/// Metadata extracted from the probe tool's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeSummary {
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

/// Parse probe diagnostics for `Duration: HH:MM:SS.cc` and
/// `bitrate: N kb/s` lines.
pub fn parse_probe_output(text: &str) -> ProbeSummary {
    let mut summary = ProbeSummary::default();

    for line in text.lines() {
        if let Some(rest) = line.split("Duration:").nth(1) {
            if let Some(stamp) = rest.split(',').next() {
                summary.duration_secs = parse_timestamp(stamp.trim());
            }
        }
        if let Some(rest) = line.split("bitrate:").nth(1) {
            if let Some(value) = rest.trim().split_whitespace().next() {
                summary.bitrate_kbps = value.parse::<f64>().ok().filter(|v| *v > 0.0);
            }
        }
    }

    summary
}

fn parse_timestamp(stamp: &str) -> Option<f64> {
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}

/// Observed/expected size ratio; `None` without positive duration and
/// bitrate.
pub fn size_ratio(size_bytes: u64, duration_secs: f64, bitrate_kbps: f64) -> Option<f64> {
    if duration_secs <= 0.0 || bitrate_kbps <= 0.0 {
        return None;
    }
    let expected_bytes = duration_secs * bitrate_kbps * 1000.0 / 8.0;
    (expected_bytes > 0.0).then(|| size_bytes as f64 / expected_bytes)
}

/// First matching decode-error keyword in the diagnostics, if any.
pub fn find_decode_error(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    DECODE_ERROR_KEYWORDS
        .iter()
        .find(|kw| lower.contains(**kw))
        .copied()
}

/// Whether the file name marks the video as a sample regardless of size.
pub fn is_sample_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_lowercase().contains("sample"))
        .unwrap_or(false)
}

/// Run the full gate sequence for one video.
pub async fn validate_video<T: ToolSuite>(
    tools: &T,
    path: &Path,
    size_bytes: u64,
    config: &Config,
) -> ValidationVerdict {
    // Gate 1: absolute size floor
    if size_bytes < MIN_VIDEO_BYTES {
        return ValidationVerdict::new(
            VerdictKind::Corrupt,
            "too-small",
            format!("{} bytes is below the 1 MiB floor", size_bytes),
        );
    }

    // Gate 2: sample detection
    if is_sample_name(path) {
        return ValidationVerdict::new(
            VerdictKind::Sample,
            "sample-name",
            "file name marks this as a sample".to_string(),
        );
    }
    if size_bytes < config.min_sample_size_bytes() {
        return ValidationVerdict::new(
            VerdictKind::Sample,
            "below-sample-threshold",
            format!(
                "{} bytes is below the {} MiB sample threshold",
                size_bytes, config.min_sample_size_mb
            ),
        );
    }

    // Gate 3: metadata probe
    if !tools.probe_available() {
        return unknown("probe tool not available");
    }
    let probe = match tools.probe_video(path).await {
        Ok(RunOutcome::Completed(output)) => parse_probe_output(&output.combined()),
        Ok(RunOutcome::TimedOut { .. }) => return unknown("metadata probe timed out"),
        Ok(RunOutcome::Cancelled) => return unknown("metadata probe cancelled"),
        Err(ToolError::Unavailable(_)) => return unknown("probe tool not available"),
        Err(err) => return unknown(&format!("metadata probe failed: {}", err)),
    };

    let (duration, bitrate) = match (probe.duration_secs, probe.bitrate_kbps) {
        (Some(d), Some(b)) if d > 0.0 && b > 0.0 => (d, b),
        _ => {
            return ValidationVerdict::new(
                VerdictKind::Corrupt,
                "no-metadata",
                "probe returned no positive duration and bitrate".to_string(),
            )
        }
    };

    // Gate 4: duration floor
    if duration < MIN_DURATION_SECS {
        return ValidationVerdict::new(
            VerdictKind::Corrupt,
            "too-short",
            format!("duration {:.1}s is below the 10s floor", duration),
        );
    }

    // Gate 5: truncation
    if let Some(ratio) = size_ratio(size_bytes, duration, bitrate) {
        if ratio < TRUNCATION_RATIO {
            return ValidationVerdict::new(
                VerdictKind::Truncated,
                "truncated",
                format!(
                    "observed size is {:.0}% of the size implied by duration and bitrate",
                    ratio * 100.0
                ),
            );
        }
    }

    // Gate 6: decode probe
    match tools.decode_video(path).await {
        Ok(RunOutcome::Completed(output)) => {
            if !output.success() {
                return ValidationVerdict::new(
                    VerdictKind::Corrupt,
                    "decode-failed",
                    format!("decoder exited with {:?}", output.exit_code),
                );
            }
            if let Some(keyword) = find_decode_error(&output.combined()) {
                return ValidationVerdict::new(
                    VerdictKind::Corrupt,
                    "decode-failed",
                    format!("decoder diagnostics contain '{}'", keyword),
                );
            }
        }
        Ok(RunOutcome::TimedOut { .. }) => return unknown("decode probe timed out"),
        Ok(RunOutcome::Cancelled) => return unknown("decode probe cancelled"),
        Err(ToolError::Unavailable(_)) => return unknown("decode tool not available"),
        Err(err) => return unknown(&format!("decode probe failed: {}", err)),
    }

    ValidationVerdict::new(VerdictKind::Pass, "ok", "all gates passed".to_string())
}

fn unknown(message: &str) -> ValidationVerdict {
    ValidationVerdict::new(
        VerdictKind::Unknown,
        "probe-unavailable",
        message.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeTools;
    use proptest::prelude::*;
    use std::path::PathBuf;

    const MIB: u64 = 1024 * 1024;

    fn config() -> Config {
        Config {
            min_sample_size_mb: 50,
            ..Config::default()
        }
    }

    fn probe_text(duration: &str, bitrate_kbps: u32) -> String {
        format!(
            "Input #0, matroska,webm, from 'movie.mkv':\n  Duration: {}, start: 0.000000, bitrate: {} kb/s\n  Stream #0:0: Video: h264, 1920x1080",
            duration, bitrate_kbps
        )
    }

    #[test]
    fn test_parse_probe_output_full() {
        let summary = parse_probe_output(&probe_text("01:30:05.50", 5000));
        assert_eq!(summary.duration_secs, Some(5405.5));
        assert_eq!(summary.bitrate_kbps, Some(5000.0));
    }

    #[test]
    fn test_parse_probe_output_missing_fields() {
        let summary = parse_probe_output("no metadata here");
        assert_eq!(summary.duration_secs, None);
        assert_eq!(summary.bitrate_kbps, None);

        let na = parse_probe_output("  Duration: N/A, bitrate: N/A");
        assert_eq!(na.duration_secs, None);
        assert_eq!(na.bitrate_kbps, None);
    }

    #[test]
    fn test_size_ratio() {
        // 1000s at 8000 kb/s -> exactly 1 GB expected
        let ratio = size_ratio(500_000_000, 1000.0, 8000.0).unwrap();
        assert!((ratio - 0.5).abs() < 1e-9);

        assert_eq!(size_ratio(1000, 0.0, 8000.0), None);
        assert_eq!(size_ratio(1000, 100.0, 0.0), None);
    }

    #[test]
    fn test_find_decode_error_keywords() {
        for kw in DECODE_ERROR_KEYWORDS {
            let text = format!("some output\n{} detected\nmore", kw.to_uppercase());
            assert_eq!(find_decode_error(&text), Some(*kw));
        }
        assert_eq!(find_decode_error("frame= 1000 fps=200"), None);
    }

    #[test]
    fn test_is_sample_name() {
        assert!(is_sample_name(Path::new("/r1/movie-SAMPLE.mkv")));
        assert!(is_sample_name(Path::new("/r1/sample.mkv")));
        assert!(!is_sample_name(Path::new("/r1/movie.mkv")));
    }

    #[tokio::test]
    async fn test_size_floor_boundary() {
        let tools = FakeTools::healthy();
        let cfg = config();
        let path = PathBuf::from("/r1/movie.mkv");

        // Strictly below 1 MiB: corrupt
        let verdict = validate_video(&tools, &path, MIB - 1, &cfg).await;
        assert_eq!(verdict.kind, VerdictKind::Corrupt);
        assert_eq!(verdict.reason, "too-small");

        // Exactly 1 MiB passes the floor and proceeds (then becomes a
        // sample, being below the sample threshold)
        let verdict = validate_video(&tools, &path, MIB, &cfg).await;
        assert_eq!(verdict.kind, VerdictKind::Sample);
        assert_eq!(verdict.reason, "below-sample-threshold");
    }

    #[tokio::test]
    async fn test_sample_threshold_boundary() {
        let tools = FakeTools::healthy();
        let cfg = config();
        let path = PathBuf::from("/r1/movie.mkv");
        let threshold = cfg.min_sample_size_bytes();

        let verdict = validate_video(&tools, &path, threshold - 1, &cfg).await;
        assert_eq!(verdict.kind, VerdictKind::Sample);

        // Exactly at the threshold is not a sample
        let verdict = validate_video(&tools, &path, threshold, &cfg).await;
        assert_ne!(verdict.kind, VerdictKind::Sample);
    }

    #[tokio::test]
    async fn test_sample_name_wins_over_size() {
        let tools = FakeTools::healthy();
        let cfg = config();
        let verdict = validate_video(
            &tools,
            Path::new("/r1/movie.sample.mkv"),
            100 * MIB,
            &cfg,
        )
        .await;
        assert_eq!(verdict.kind, VerdictKind::Sample);
        assert_eq!(verdict.reason, "sample-name");
    }

    #[tokio::test]
    async fn test_probe_unavailable_is_unknown() {
        let mut tools = FakeTools::healthy();
        tools.probe_available = false;

        let verdict = validate_video(
            &tools,
            Path::new("/r1/movie.mkv"),
            100 * MIB,
            &config(),
        )
        .await;
        assert_eq!(verdict.kind, VerdictKind::Unknown);
        assert_eq!(verdict.reason, "probe-unavailable");
    }

    #[tokio::test]
    async fn test_missing_metadata_is_corrupt() {
        let mut tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        tools
            .probe_outputs
            .insert(path.clone(), "garbage with no metadata".to_string());

        let verdict = validate_video(&tools, &path, 100 * MIB, &config()).await;
        assert_eq!(verdict.kind, VerdictKind::Corrupt);
        assert_eq!(verdict.reason, "no-metadata");
    }

    #[tokio::test]
    async fn test_duration_floor() {
        let mut tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        tools
            .probe_outputs
            .insert(path.clone(), probe_text("00:00:09.90", 5000));

        let verdict = validate_video(&tools, &path, 100 * MIB, &config()).await;
        assert_eq!(verdict.kind, VerdictKind::Corrupt);
        assert_eq!(verdict.reason, "too-short");
    }

    #[tokio::test]
    async fn test_truncation_boundary() {
        let mut tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        // 1000s at 8000 kb/s -> expected exactly 1,000,000,000 bytes
        tools
            .probe_outputs
            .insert(path.clone(), probe_text("00:16:40.00", 8000));

        // Just below 70%: truncated
        let verdict = validate_video(&tools, &path, 699_999_999, &config()).await;
        assert_eq!(verdict.kind, VerdictKind::Truncated);

        // Exactly 70%: not truncated
        let verdict = validate_video(&tools, &path, 700_000_000, &config()).await;
        assert_ne!(verdict.kind, VerdictKind::Truncated);
    }

    #[tokio::test]
    async fn test_decode_failure_exit_code() {
        let mut tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        tools.decode_results.insert(path.clone(), (1, String::new()));

        let verdict = validate_video(&tools, &path, 100 * MIB, &config()).await;
        assert_eq!(verdict.kind, VerdictKind::Corrupt);
        assert_eq!(verdict.reason, "decode-failed");
    }

    #[tokio::test]
    async fn test_decode_failure_keyword() {
        let mut tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        tools.decode_results.insert(
            path.clone(),
            (0, "movie.mkv: Invalid data found when processing input".to_string()),
        );

        let verdict = validate_video(&tools, &path, 100 * MIB, &config()).await;
        assert_eq!(verdict.kind, VerdictKind::Corrupt);
        assert_eq!(verdict.reason, "decode-failed");
    }

    #[tokio::test]
    async fn test_healthy_video_passes() {
        let tools = FakeTools::healthy();
        let path = PathBuf::from("/r1/movie.mkv");
        // Default probe: one minute at 500 kb/s -> expected 3.75 MB
        let verdict = validate_video(&tools, &path, 100 * MIB, &config()).await;
        assert!(verdict.is_pass(), "got {:?}", verdict);
    }

    // *For any* positive duration and bitrate, the ratio comparison SHALL
    // classify exactly the sizes below 70% of expected as truncated.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_truncation_threshold(
            duration in 10.0f64..20_000.0,
            bitrate in 100.0f64..50_000.0,
            ratio_permille in 1u64..2_000,
        ) {
            let expected = duration * bitrate * 1000.0 / 8.0;
            let size = (expected * ratio_permille as f64 / 1000.0) as u64;
            let ratio = size_ratio(size, duration, bitrate).unwrap();

            prop_assert_eq!(ratio < TRUNCATION_RATIO, (size as f64) < expected * TRUNCATION_RATIO);
        }
    }
}
