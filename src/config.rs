//! Configuration for the ingestion core.
//!
//! Explicit configuration structs, constructed once and passed by reference
//! into the detector and pool. Values come from the environment; invalid
//! values log a warning and fall back to the documented default so the
//! detection path stays infallible.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parse an environment variable, falling back to `default` when the variable
/// is unset or unparseable.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Invalid value {:?} for {}, using default {}", raw, key, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a boolean environment variable, accepting `1`/`0`/`yes`/`no` in
/// addition to `true`/`false`.
fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                tracing::warn!("Invalid value {:?} for {}, using default {}", other, key, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Settings shared between the detector, the pool, and scratch storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Maximum accepted document size in megabytes.
    pub max_document_size_mb: u64,
    /// How many leading bytes the detector reads by default.
    pub preferred_head_size: usize,
    /// Base timeout for document operations in seconds. Pool deadlines and
    /// idle eviction are expressed as multipliers of this value.
    pub default_timeout_secs: f64,
    /// Base directory for scratch storage. `None` means the system temp dir.
    pub temp_base_dir: Option<PathBuf>,
    /// Whether the periodic orphan sweep runs at all.
    pub enable_cleanup: bool,
    /// Age threshold (and sweep period) for orphaned scratch entries.
    pub cleanup_interval_secs: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            max_document_size_mb: 200,
            preferred_head_size: 16384,
            default_timeout_secs: 60.0,
            temp_base_dir: None,
            enable_cleanup: true,
            cleanup_interval_secs: 3600,
        }
    }
}

impl CommonConfig {
    /// Load from `DOCUMENTS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_document_size_mb: env_parse("DOCUMENTS_MAX_SIZE_MB", defaults.max_document_size_mb),
            preferred_head_size: env_parse(
                "DOCUMENTS_PREFERRED_HEAD_SIZE",
                defaults.preferred_head_size,
            ),
            default_timeout_secs: env_parse(
                "DOCUMENTS_DEFAULT_TIMEOUT",
                defaults.default_timeout_secs,
            ),
            temp_base_dir: std::env::var("DOCUMENTS_TEMP_BASE_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            enable_cleanup: env_bool("DOCUMENTS_ENABLE_CLEANUP", defaults.enable_cleanup),
            cleanup_interval_secs: env_parse(
                "DOCUMENTS_CLEANUP_INTERVAL",
                defaults.cleanup_interval_secs,
            ),
        }
    }

    pub fn max_document_size_bytes(&self) -> u64 {
        self.max_document_size_mb * 1024 * 1024
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_secs.max(0.0))
    }
}

/// Detector scoring parameters.
///
/// The base-confidence table documents the full scoring surface so the
/// algorithm is reproducible and testable on its own:
///
/// | signal                              | base  |
/// |-------------------------------------|-------|
/// | exact byte-signature match          | 0.98  |
/// | ZIP container + extension agreement | 0.85  |
/// | OLE container + extension agreement | 0.82  |
/// | extension only                      | 0.75  |
/// | content probe only                  | 0.75  |
/// | insufficient evidence               | 0.30  |
///
/// OOXML and OLE results are capped at their ceilings regardless of probe
/// agreement: the byte signature only proves "is a container".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Results below this confidence are reported as `unknown`.
    pub confidence_threshold: f64,
    /// Subtracted from the winning confidence when the signature and the
    /// probe (or the filename hint) disagree on format family.
    pub mime_conflict_penalty: f64,
    /// Ceiling for ZIP-container results (OOXML subtypes and bare ZIP).
    pub ooxml_confidence_cap: f64,
    /// Ceiling for OLE compound-file results.
    pub ole_confidence_cap: f64,
    /// Widens the container marker scan to this multiple of the head size.
    pub scan_limit_multiplier: f64,
    /// Whether to consult the content probe as a second opinion.
    pub use_content_probe: bool,
    pub enable_signature_cache: bool,
    pub signature_cache_size: usize,

    // Base confidence table.
    pub base_signature_confidence: f64,
    pub base_zip_container_confidence: f64,
    pub base_ole_container_confidence: f64,
    pub base_extension_only_confidence: f64,
    pub base_probe_only_confidence: f64,
    pub base_insufficient_evidence_confidence: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            mime_conflict_penalty: 0.2,
            ooxml_confidence_cap: 0.85,
            ole_confidence_cap: 0.8,
            scan_limit_multiplier: 4.0,
            use_content_probe: true,
            enable_signature_cache: true,
            signature_cache_size: 1000,
            base_signature_confidence: 0.98,
            base_zip_container_confidence: 0.85,
            base_ole_container_confidence: 0.82,
            base_extension_only_confidence: 0.75,
            base_probe_only_confidence: 0.75,
            base_insufficient_evidence_confidence: 0.3,
        }
    }
}

impl DetectorConfig {
    /// Load from `DETECTOR_*` environment variables. The base-confidence
    /// table is code-level tuning and is not exposed to the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            confidence_threshold: env_parse(
                "DETECTOR_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            mime_conflict_penalty: env_parse(
                "DETECTOR_MIME_CONFLICT_PENALTY",
                defaults.mime_conflict_penalty,
            ),
            ooxml_confidence_cap: env_parse(
                "DETECTOR_OOXML_CONFIDENCE_CAP",
                defaults.ooxml_confidence_cap,
            ),
            ole_confidence_cap: env_parse(
                "DETECTOR_OLE_CONFIDENCE_CAP",
                defaults.ole_confidence_cap,
            ),
            scan_limit_multiplier: env_parse(
                "DETECTOR_SCAN_LIMIT_MULTIPLIER",
                defaults.scan_limit_multiplier,
            ),
            use_content_probe: env_bool("DETECTOR_USE_CONTENT_PROBE", defaults.use_content_probe),
            enable_signature_cache: env_bool(
                "DETECTOR_ENABLE_SIGNATURE_CACHE",
                defaults.enable_signature_cache,
            ),
            signature_cache_size: env_parse(
                "DETECTOR_SIGNATURE_CACHE_SIZE",
                defaults.signature_cache_size,
            ),
            ..defaults
        }
    }

    /// Clamp all scores and penalties into [0, 1].
    pub fn clamped(mut self) -> Self {
        for value in [
            &mut self.confidence_threshold,
            &mut self.mime_conflict_penalty,
            &mut self.ooxml_confidence_cap,
            &mut self.ole_confidence_cap,
            &mut self.base_signature_confidence,
            &mut self.base_zip_container_confidence,
            &mut self.base_ole_container_confidence,
            &mut self.base_extension_only_confidence,
            &mut self.base_probe_only_confidence,
            &mut self.base_insufficient_evidence_confidence,
        ] {
            *value = value.clamp(0.0, 1.0);
        }
        if self.scan_limit_multiplier < 1.0 {
            self.scan_limit_multiplier = 1.0;
        }
        self
    }
}

/// Converter process pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_processes: usize,
    pub max_processes: usize,
    /// Idle eviction deadline as a multiple of the default timeout.
    pub process_idle_timeout_multiplier: f64,
    /// Job deadline as a multiple of the size-scaled baseline timeout.
    pub conversion_timeout_multiplier: f64,
    /// Explicit converter binary. `None` means discover on PATH.
    pub converter_binary: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    /// RSS ceiling per slot before recycling.
    pub max_memory_mb: u64,
    pub max_operations_per_process: u32,
    pub enable_conversion_cache: bool,
    pub conversion_cache_size: usize,
    /// The baseline timeout grows by one `default_timeout` for every this
    /// many megabytes of input.
    pub timeout_size_divisor_mb: f64,
    /// Upper cap on the size-scaled baseline, in seconds.
    pub max_baseline_timeout_secs: f64,
    /// Argv template for the long-lived slot process. `{profile}` expands to
    /// the slot's private profile directory.
    pub spawn_args: Vec<String>,
    /// Argv template for one conversion. `{input}`, `{outdir}`, `{format}`
    /// and `{profile}` are expanded per job.
    pub convert_args: Vec<String>,
    /// Period of the idle/dead-slot sweep.
    pub sweep_interval_secs: u64,
}

fn default_spawn_args() -> Vec<String> {
    [
        "--headless",
        "--invisible",
        "--norestore",
        "--nodefault",
        "--nolockcheck",
        "--nologo",
        "-env:UserInstallation=file://{profile}",
    ]
    .map(str::to_string)
    .to_vec()
}

fn default_convert_args() -> Vec<String> {
    [
        "--headless",
        "--norestore",
        "-env:UserInstallation=file://{profile}",
        "--convert-to",
        "{format}",
        "--outdir",
        "{outdir}",
        "{input}",
    ]
    .map(str::to_string)
    .to_vec()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_processes: 2,
            max_processes: 10,
            process_idle_timeout_multiplier: 30.0,
            conversion_timeout_multiplier: 5.0,
            converter_binary: None,
            startup_timeout_secs: 30,
            max_memory_mb: 512,
            max_operations_per_process: 100,
            enable_conversion_cache: false,
            conversion_cache_size: 64,
            timeout_size_divisor_mb: 10.0,
            max_baseline_timeout_secs: 600.0,
            spawn_args: default_spawn_args(),
            convert_args: default_convert_args(),
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    /// Load from `CONVERTER_*` environment variables. `max_processes` is
    /// raised to `min_processes` when the two are inconsistent.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let min_processes = env_parse("CONVERTER_MIN_PROCESSES", defaults.min_processes).max(1);
        let mut max_processes = env_parse("CONVERTER_MAX_PROCESSES", defaults.max_processes);
        if max_processes < min_processes {
            tracing::warn!(
                "CONVERTER_MAX_PROCESSES {} below min {}, raising to min",
                max_processes,
                min_processes
            );
            max_processes = min_processes;
        }
        Self {
            min_processes,
            max_processes,
            process_idle_timeout_multiplier: env_parse(
                "CONVERTER_PROCESS_IDLE_TIMEOUT_MULTIPLIER",
                defaults.process_idle_timeout_multiplier,
            ),
            conversion_timeout_multiplier: env_parse(
                "CONVERTER_CONVERSION_TIMEOUT_MULTIPLIER",
                defaults.conversion_timeout_multiplier,
            ),
            converter_binary: std::env::var("CONVERTER_BINARY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            startup_timeout_secs: env_parse(
                "CONVERTER_STARTUP_TIMEOUT",
                defaults.startup_timeout_secs,
            ),
            max_memory_mb: env_parse("CONVERTER_MAX_MEMORY_MB", defaults.max_memory_mb),
            max_operations_per_process: env_parse(
                "CONVERTER_MAX_OPERATIONS_PER_PROCESS",
                defaults.max_operations_per_process,
            ),
            enable_conversion_cache: env_bool(
                "CONVERTER_ENABLE_CONVERSION_CACHE",
                defaults.enable_conversion_cache,
            ),
            conversion_cache_size: env_parse(
                "CONVERTER_CONVERSION_CACHE_SIZE",
                defaults.conversion_cache_size,
            ),
            ..defaults
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Everything the ingestion core needs, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    pub common: CommonConfig,
    pub detector: DetectorConfig,
    pub pool: PoolConfig,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            common: CommonConfig::from_env(),
            detector: DetectorConfig::from_env(),
            pool: PoolConfig::from_env(),
        }
    }
}
