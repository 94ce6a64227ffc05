//! CLI commands implementation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use docuscope_ingest::config::IngestConfig;
use docuscope_ingest::detect::FormatDetector;
use docuscope_ingest::pool::{ConversionProcessPool, ConversionRequest, TargetFormat};

#[derive(Parser)]
#[command(name = "dsi")]
#[command(about = "Document format detection and conversion front end")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Detect a document's format and confidence
    Detect {
        /// Document to inspect
        file: PathBuf,
        /// Emit the full result as JSON, including the evidence trail
        #[arg(long)]
        json: bool,
    },

    /// Convert a document through the converter pool
    Convert {
        /// Document to convert
        file: PathBuf,
        /// Target format (pdf, docx, xlsx, txt, html)
        #[arg(short, long, default_value = "pdf")]
        to: String,
        /// Output path (default: input path with the target extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check that a converter binary is available
    Check,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Detect { file, json } => {
            let bytes = tokio::fs::read(&file).await?;
            let hint = file.file_name().and_then(|n| n.to_str());
            let detector = FormatDetector::new(&config.common, config.detector.clone());
            let result = detector.detect(&bytes, hint);
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}  (confidence {:.2})", result.mime_type, result.confidence);
            }
        }
        Commands::Convert { file, to, output } => {
            let target = TargetFormat::from_extension(&to)
                .ok_or_else(|| anyhow::anyhow!("unsupported target format: {to}"))?;
            let input = tokio::fs::read(&file).await?;
            let source_extension = file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("bin")
                .to_string();
            let pool = ConversionProcessPool::new(config).await?;
            let result = pool
                .submit(ConversionRequest {
                    input,
                    source_extension,
                    target,
                })
                .await;
            pool.shutdown().await;
            let converted = result?;
            let output = output.unwrap_or_else(|| file.with_extension(target.extension()));
            tokio::fs::write(&output, &converted.data).await?;
            println!(
                "Wrote {} ({} bytes in {:.1}s)",
                output.display(),
                converted.data.len(),
                converted.duration.as_secs_f64()
            );
        }
        Commands::Check => match config.pool.converter_binary.as_deref() {
            Some(path) if path.exists() => {
                println!("Converter binary: {}", path.display());
            }
            Some(path) => {
                anyhow::bail!("configured converter binary not found: {}", path.display())
            }
            None => {
                let found = ["libreoffice", "soffice"]
                    .iter()
                    .find_map(|name| which::which(name).ok());
                match found {
                    Some(path) => println!("Converter binary: {}", path.display()),
                    None => anyhow::bail!("no converter binary on PATH (tried libreoffice, soffice)"),
                }
            }
        },
    }
    Ok(())
}
