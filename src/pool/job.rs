//! Conversion job types, deadlines, and the failure taxonomy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PoolConfig;

/// Canonical output formats the converter is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Pdf,
    Docx,
    Xlsx,
    Txt,
    Html,
}

impl TargetFormat {
    /// File extension, which is also the converter's format name.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
            Self::Txt => "txt",
            Self::Html => "html",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            "txt" => Some(Self::Txt),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// What the caller hands to the pool. The pool owns the job for its
/// lifetime; the caller only holds the returned future.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Full document content to convert.
    pub input: Vec<u8>,
    /// Extension used to name the scratch input file, e.g. `doc`.
    pub source_extension: String,
    pub target: TargetFormat,
}

/// A finished conversion.
#[derive(Debug)]
pub struct ConversionOutput {
    pub job_id: Uuid,
    pub data: Vec<u8>,
    pub target: TargetFormat,
    pub duration: Duration,
    pub from_cache: bool,
}

/// Closed set of conversion failures. None of these is retried internally;
/// retry policy belongs to the caller, and `UnsupportedFormat` must not be
/// retried against the same pool at all.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// A new slot failed to spawn or become healthy in time. Fails only the
    /// job that triggered the spawn; the pool continues.
    #[error("converter startup failed: {0}")]
    StartupTimeout(String),
    /// The conversion exceeded its computed deadline. The slot is killed and
    /// replaced; retry-eligible by the caller.
    #[error("conversion exceeded its deadline of {0:?}")]
    ConversionTimeout(Duration),
    /// The slot died mid-job for a reason other than timeout. The slot is
    /// replaced, the job is not auto-retried.
    #[error("converter process crashed: {0}")]
    ProcessCrash(String),
    /// The converter rejected the input. Terminal for this document.
    #[error("converter rejected the input: {0}")]
    UnsupportedFormat(String),
    /// No slot freed up within the job's deadline. Explicit backpressure
    /// rather than unbounded queueing.
    #[error("no slot became available within the job deadline of {0:?}")]
    PoolSaturated(Duration),
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("input of {size} bytes exceeds the limit of {limit} bytes")]
    InputTooLarge { size: u64, limit: u64 },
    /// Scratch-storage failure while staging the job.
    #[error("scratch I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Size-scaled baseline timeout: larger documents get proportionally more
/// time, bounded by an upper cap.
pub(crate) fn baseline_timeout(
    size_bytes: u64,
    default_timeout: Duration,
    config: &PoolConfig,
) -> Duration {
    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    let divisor = config.timeout_size_divisor_mb.max(f64::EPSILON);
    let scaled = default_timeout.as_secs_f64() * (1.0 + size_mb / divisor);
    Duration::from_secs_f64(scaled.min(config.max_baseline_timeout_secs.max(0.0)))
}

/// Full job deadline: the configured multiplier over the baseline.
pub(crate) fn deadline_for(
    size_bytes: u64,
    default_timeout: Duration,
    config: &PoolConfig,
) -> Duration {
    baseline_timeout(size_bytes, default_timeout, config)
        .mul_f64(config.conversion_timeout_multiplier.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_format_round_trip() {
        assert_eq!(TargetFormat::from_extension("pdf"), Some(TargetFormat::Pdf));
        assert_eq!(TargetFormat::from_extension(".HTML"), Some(TargetFormat::Html));
        assert_eq!(TargetFormat::from_extension("exe"), None);
        assert_eq!(TargetFormat::Docx.to_string(), "docx");
    }

    #[test]
    fn test_baseline_timeout_scales_with_size() {
        let config = PoolConfig::default();
        let base = Duration::from_secs(60);
        let small = baseline_timeout(1024, base, &config);
        let large = baseline_timeout(50 * 1024 * 1024, base, &config);
        assert!(large > small);
        assert!(small >= base);
    }

    #[test]
    fn test_baseline_timeout_is_capped() {
        let config = PoolConfig::default();
        let base = Duration::from_secs(60);
        let huge = baseline_timeout(100 * 1024 * 1024 * 1024, base, &config);
        assert_eq!(
            huge,
            Duration::from_secs_f64(config.max_baseline_timeout_secs)
        );
    }

    #[test]
    fn test_deadline_applies_multiplier() {
        let config = PoolConfig {
            conversion_timeout_multiplier: 2.0,
            ..PoolConfig::default()
        };
        let base = Duration::from_secs(10);
        let baseline = baseline_timeout(0, base, &config);
        assert_eq!(deadline_for(0, base, &config), baseline.mul_f64(2.0));
    }
}
