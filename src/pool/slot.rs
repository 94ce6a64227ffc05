//! A single converter slot: one long-lived headless process plus its
//! private profile directory, and the per-job child that runs one
//! conversion against that profile.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};

use crate::pool::job::{ConversionError, TargetFormat};
use crate::scratch::JobScratch;

/// Slot lifecycle: Starting while the process boots, Idle/Busy in service,
/// Draining once worn out (recycled after its current job), Dead once the
/// process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Starting,
    Idle,
    Busy,
    Draining,
    Dead,
}

/// One pooled converter process.
pub struct ProcessSlot {
    pub id: u64,
    child: Child,
    pub state: SlotState,
    pub operations_served: u32,
    pub spawned_at: Instant,
    pub last_used_at: Instant,
    /// Last observed RSS, refreshed after each job.
    pub memory_bytes: u64,
    /// Private profile directory, removed when the slot is dropped.
    profile: JobScratch,
}

/// Values substituted into argv templates. Empty fields expand to an empty
/// string, which only the spawn template relies on.
#[derive(Debug, Default)]
pub struct ArgContext<'a> {
    pub input: &'a str,
    pub outdir: &'a str,
    pub format: &'a str,
    pub profile: &'a str,
}

/// Expand `{input}`, `{outdir}`, `{format}` and `{profile}` placeholders in
/// an argv template.
pub fn render_args(template: &[String], ctx: &ArgContext<'_>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{input}", ctx.input)
                .replace("{outdir}", ctx.outdir)
                .replace("{format}", ctx.format)
                .replace("{profile}", ctx.profile)
        })
        .collect()
}

impl ProcessSlot {
    /// Spawn a new slot process and verify it survives its startup window.
    pub async fn spawn(
        id: u64,
        binary: &Path,
        spawn_args: &[String],
        profile: JobScratch,
        startup_timeout: Duration,
    ) -> Result<Self, ConversionError> {
        let profile_str = profile.path().to_string_lossy().into_owned();
        let args = render_args(
            spawn_args,
            &ArgContext {
                profile: &profile_str,
                ..ArgContext::default()
            },
        );
        tracing::debug!("Spawning converter slot {} ({:?})", id, binary);
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConversionError::StartupTimeout(format!("spawn failed: {e}")))?;

        // A process that dies within its startup window never becomes a
        // slot. The probe is short so prewarming stays cheap.
        let probe = Duration::from_millis(250).min(startup_timeout);
        tokio::time::sleep(probe).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(ConversionError::StartupTimeout(format!(
                    "converter exited during startup: {status}"
                )));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ConversionError::StartupTimeout(format!(
                    "startup probe failed: {e}"
                )));
            }
        }

        let now = Instant::now();
        Ok(Self {
            id,
            child,
            state: SlotState::Starting,
            operations_served: 0,
            spawned_at: now,
            last_used_at: now,
            memory_bytes: 0,
            profile,
        })
    }

    pub fn profile_path(&self) -> &Path {
        self.profile.path()
    }

    /// False once the underlying process has exited.
    pub fn poll_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Kill the slot process and reap it. Idempotent.
    pub async fn kill(&mut self) {
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
    }

    /// Re-read the slot's resident set size from the kernel.
    #[cfg(target_os = "linux")]
    pub fn refresh_memory(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
                if let Some(rss) = parse_vm_rss(&status) {
                    self.memory_bytes = rss;
                }
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn refresh_memory(&mut self) {}
}

/// Extract `VmRSS` (reported in kB) from `/proc/<pid>/status` content.
#[cfg(any(target_os = "linux", test))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())?;
    Some(kb * 1024)
}

/// Run one conversion as a dedicated child using the slot's profile, bounded
/// by `deadline`. Returns the path of the produced output file.
///
/// On timeout the child is dropped with `kill_on_drop` set, so the kernel
/// reaps it without a second wait here.
pub async fn run_conversion(
    binary: &Path,
    convert_args: &[String],
    input: &Path,
    outdir: &Path,
    target: TargetFormat,
    profile: &Path,
    deadline: Duration,
) -> Result<PathBuf, ConversionError> {
    let ctx = ArgContext {
        input: &input.to_string_lossy(),
        outdir: &outdir.to_string_lossy(),
        format: target.extension(),
        profile: &profile.to_string_lossy(),
    };
    let args = render_args(convert_args, &ctx);
    let mut command = Command::new(binary);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(deadline, command.output()).await {
        Ok(result) => result.map_err(|e| ConversionError::ProcessCrash(e.to_string()))?,
        Err(_) => return Err(ConversionError::ConversionTimeout(deadline)),
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        if is_rejection(&stderr) {
            return Err(ConversionError::UnsupportedFormat(trimmed(&stderr)));
        }
        return Err(ConversionError::ProcessCrash(format!(
            "converter exited with {}: {}",
            output.status,
            trimmed(&stderr)
        )));
    }
    if is_rejection(&stderr) {
        return Err(ConversionError::UnsupportedFormat(trimmed(&stderr)));
    }

    find_output(outdir, target.extension())?.ok_or_else(|| {
        // Exit 0 with no output is how the converter reports filterless
        // inputs, so it maps to rejection rather than crash.
        ConversionError::UnsupportedFormat(format!(
            "converter produced no .{} output",
            target.extension()
        ))
    })
}

/// Converter stderr patterns that mean "this input has no conversion path".
fn is_rejection(stderr: &str) -> bool {
    stderr.contains("no export filter") || stderr.contains("Error:")
}

fn trimmed(stderr: &str) -> String {
    let s = stderr.trim();
    if s.is_empty() {
        "no diagnostic output".to_string()
    } else {
        s.chars().take(500).collect()
    }
}

/// First file in `outdir` with the expected extension.
fn find_output(outdir: &Path, extension: &str) -> Result<Option<PathBuf>, ConversionError> {
    for entry in std::fs::read_dir(outdir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args_expands_all_placeholders() {
        let template = vec![
            "--convert-to".to_string(),
            "{format}".to_string(),
            "--outdir".to_string(),
            "{outdir}".to_string(),
            "-env:UserInstallation=file://{profile}".to_string(),
            "{input}".to_string(),
        ];
        let args = render_args(
            &template,
            &ArgContext {
                input: "/tmp/in.doc",
                outdir: "/tmp/out",
                format: "pdf",
                profile: "/tmp/profile",
            },
        );
        assert_eq!(
            args,
            vec![
                "--convert-to",
                "pdf",
                "--outdir",
                "/tmp/out",
                "-env:UserInstallation=file:///tmp/profile",
                "/tmp/in.doc",
            ]
        );
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsoffice\nVmPeak:\t  900000 kB\nVmRSS:\t  524288 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(524288 * 1024));
        assert_eq!(parse_vm_rss("Name:\tsoffice\n"), None);
    }

    #[test]
    fn test_rejection_patterns() {
        assert!(is_rejection("Error: no export filter for /tmp/x"));
        assert!(is_rejection("soffice: no export filter found"));
        assert!(!is_rejection("convert /tmp/in.doc -> /tmp/out/in.pdf"));
    }
}
