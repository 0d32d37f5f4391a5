//! Invoker module for running provisioning-tool subcommands.
//!
//! Key responsibilities:
//! - Spawn exactly one subprocess per call in the run's working directory
//! - Capture stdout/stderr into bounded buffers
//! - Enforce the per-invocation timeout and honour cancellation
//! - Report nonzero exits as data, never as errors

use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tflife_core::{Config, InvocationResult, Phase, RunConfig, CANCELLED_MARKER, TIMEOUT_MARKER};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a subcommand is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured per stream. Plan output for large stacks is big,
/// but anything past this is noise.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Read from an async reader with a maximum byte limit.
///
/// Returns the buffer truncated at `max_bytes`. Logs a warning if truncated.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep draining so the child never blocks on a full pipe.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

/// Collect a capture task's buffer, tolerating failures.
async fn collect_capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("provisioning tool not found: {0}")]
    ToolNotFound(String),
}

pub type Result<T> = std::result::Result<T, InvokerError>;

/// Invoker configuration.
#[derive(Debug, Clone)]
pub struct InvokerSettings {
    /// Provisioning tool binary.
    pub tool_bin: PathBuf,
    /// Per-invocation timeout (`None` = wait forever).
    pub timeout: Option<Duration>,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            tool_bin: PathBuf::from("terraform"),
            timeout: None,
        }
    }
}

impl InvokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool_bin: config.tool_bin.clone(),
            timeout: (config.phase_timeout_sec > 0)
                .then(|| Duration::from_secs(u64::from(config.phase_timeout_sec))),
        }
    }
}

/// Runs provisioning-tool subcommands as subprocesses.
#[derive(Debug, Clone)]
pub struct Invoker {
    settings: InvokerSettings,
}

impl Invoker {
    pub fn new(settings: InvokerSettings) -> Self {
        Self { settings }
    }

    pub fn with_defaults() -> Self {
        Self::new(InvokerSettings::default())
    }

    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Arguments (after the subcommand) for a lifecycle phase.
    pub fn phase_args(phase: Phase, config: &RunConfig) -> Vec<String> {
        let mut args: Vec<String> = match phase {
            Phase::Init => vec!["-input=false".into()],
            Phase::Plan => {
                let mut args = vec![
                    "-input=false".to_string(),
                    "-lock=false".to_string(),
                    "-detailed-exitcode".to_string(),
                ];
                if let Some(plan_file) = config.resolved_plan_file() {
                    args.push(format!("-out={}", plan_file.display()));
                }
                args
            }
            Phase::Apply | Phase::Destroy => {
                vec!["-input=false".into(), "-auto-approve".into()]
            }
            Phase::Validate => Vec::new(),
            Phase::Output => vec!["-json".into()],
        };

        if matches!(phase, Phase::Plan | Phase::Apply | Phase::Destroy) {
            for (name, value) in &config.variables {
                args.push("-var".to_string());
                args.push(format!("{name}={value}"));
            }
            for var_file in &config.var_files {
                args.push(format!("-var-file={}", var_file.display()));
            }
        }

        if config.no_color {
            args.push("-no-color".to_string());
        }
        args
    }

    /// Run the subcommand for a lifecycle phase.
    pub async fn run_phase(
        &self,
        phase: Phase,
        config: &RunConfig,
        cancel_token: CancellationToken,
    ) -> Result<InvocationResult> {
        let args = Self::phase_args(phase, config);
        self.run(phase.subcommand(), &args, config, cancel_token)
            .await
    }

    /// Run `<tool_bin> <subcommand> <args…>` in the configured working directory.
    ///
    /// A nonzero exit is returned as data. Timeout and cancellation kill the
    /// process and yield exit code -1 with a marker line appended to stderr.
    pub async fn run(
        &self,
        subcommand: &str,
        args: &[String],
        config: &RunConfig,
        cancel_token: CancellationToken,
    ) -> Result<InvocationResult> {
        let tool = self.settings.tool_bin.display().to_string();
        let mut command_line = Vec::with_capacity(args.len() + 2);
        command_line.push(tool.clone());
        command_line.push(subcommand.to_string());
        command_line.extend(args.iter().cloned());

        let mut cmd = Command::new(&self.settings.tool_bin);
        cmd.arg(subcommand)
            .args(args)
            .current_dir(&config.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            command = %command_line.join(" "),
            working_dir = %config.working_dir.display(),
            "spawning provisioning tool"
        );

        let started_at = Utc::now();
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InvokerError::ToolNotFound(tool.clone())
            } else {
                InvokerError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let outcome = loop {
            let elapsed = started.elapsed();

            if let Some(limit) = self.settings.timeout {
                if elapsed >= limit {
                    warn!(
                        command = %command_line.join(" "),
                        timeout_ms = limit.as_millis() as u64,
                        "process timed out; killing"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill timed-out process");
                    }
                    let _ = child.wait().await;
                    break ProcessOutcome::TimedOut;
                }
            }

            let remaining = self
                .settings
                .timeout
                .map_or(Duration::MAX, |limit| limit.saturating_sub(elapsed));
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(InvokerError::Io(e)),
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(command = %command_line.join(" "), "cancellation requested; killing process");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill cancelled process");
                    }
                    let _ = child.wait().await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        command = %command_line.join(" "),
                        elapsed_sec = started.elapsed().as_secs(),
                        working_dir = %config.working_dir.display(),
                        "provisioning tool still running"
                    );
                }
            }
        };

        let stdout = collect_capture(stdout_task, "stdout").await;
        let stderr = collect_capture(stderr_task, "stderr").await;
        let duration = started.elapsed();

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&stderr).into_owned();

        let exit_code = match outcome {
            ProcessOutcome::Completed(status) => status.code().unwrap_or(-1),
            ProcessOutcome::TimedOut => {
                let limit = self.settings.timeout.unwrap_or_default();
                append_marker(
                    &mut stderr,
                    &format!("{TIMEOUT_MARKER} {:.1}s", limit.as_secs_f64()),
                );
                -1
            }
            ProcessOutcome::Cancelled => {
                append_marker(&mut stderr, CANCELLED_MARKER);
                -1
            }
        };

        info!(
            command = %command_line.join(" "),
            exit_code,
            duration_ms = duration.as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "invocation complete"
        );

        Ok(InvocationResult {
            command: command_line,
            stdout,
            stderr,
            exit_code,
            duration,
            started_at,
        })
    }
}

fn append_marker(stderr: &mut String, marker: &str) {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(marker);
}
