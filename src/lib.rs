//! DocuScope ingest: calibrated document format detection and a bounded
//! pool of external converter processes.
//!
//! Two independent front-door components:
//! - [`FormatDetector`] identifies a document's format from its bytes and
//!   reports a calibrated confidence with the evidence behind it.
//! - [`ConversionProcessPool`] converts documents through long-lived
//!   headless converter processes with deadlines, recycling, and
//!   backpressure.

pub mod config;
pub mod detect;
pub mod pool;
pub mod scratch;

pub use config::IngestConfig;
pub use detect::{DetectionResult, FormatDetector};
pub use pool::{
    ConversionError, ConversionOutput, ConversionProcessPool, ConversionRequest, PoolStatus,
    TargetFormat,
};
pub use scratch::TempFileManager;
