//! Core types for the provisioning lifecycle harness.
//!
//! Phases, lifecycle states, invocation results and per-run configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Marker prefix appended to stderr when an invocation hits its timeout.
pub const TIMEOUT_MARKER: &str = "[tflife] timed out after";

/// Marker appended to stderr when an invocation is cancelled.
pub const CANCELLED_MARKER: &str = "[tflife] cancelled";

/// Unique identifier for runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// A single provisioning-tool invocation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Plan,
    Apply,
    Output,
    Validate,
    Destroy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Output => "output",
            Self::Validate => "validate",
            Self::Destroy => "destroy",
        }
    }

    /// CLI subcommand that runs this phase.
    pub fn subcommand(&self) -> &'static str {
        self.as_str()
    }

    /// Exit codes that count as success for this phase.
    ///
    /// `plan -detailed-exitcode` exits 2 when the plan contains changes.
    pub fn is_success_code(&self, exit_code: i32) -> bool {
        match self {
            Self::Plan => exit_code == 0 || exit_code == 2,
            _ => exit_code == 0,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state machine positions.
///
/// Every path ends in `Done`; `Destroying` is reachable from every state
/// that may have provisioned something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Init,
    Planned,
    Applied,
    Validating,
    Destroying,
    Done,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::Validating => "validating",
            Self::Destroying => "destroying",
            Self::Done => "done",
        }
    }
}

/// Aggregated status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Passed,
    AssertionFailed,
    ProvisioningFailed,
    /// Teardown failed; resources may still be live.
    TeardownLeaked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::TeardownLeaked => "TEARDOWN_LEAKED",
        }
    }

    /// Process exit status. A leak gets its own code so CI can page on it.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::AssertionFailed | Self::ProvisioningFailed => 1,
            Self::TeardownLeaked => 3,
        }
    }
}

/// Behaviour when a requested working directory is already leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Wait for the current holder to release it.
    #[default]
    Block,
    /// Return a conflict immediately.
    FailFast,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::FailFast => "fail_fast",
        }
    }
}

/// Where structured output is read from after a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// Run `output -json` after apply.
    #[default]
    Command,
    /// Parse the apply stdout directly.
    ApplyStdout,
}

impl OutputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::ApplyStdout => "apply_stdout",
        }
    }
}

// --- Records ---

/// Captured result of one subprocess call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Full argv, tool binary first.
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; -1 when killed by timeout/cancellation or signal.
    pub exit_code: i32,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == -1 && self.stderr.contains(TIMEOUT_MARKER)
    }

    pub fn cancelled(&self) -> bool {
        self.exit_code == -1 && self.stderr.contains(CANCELLED_MARKER)
    }

    /// Space-joined command line, for logs and reports.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Last `max_lines` lines of stderr, falling back to stdout when stderr is empty.
    pub fn tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Outcome of a phase after the retry policy is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Success {
        result: InvocationResult,
        attempts: u32,
    },
    /// Still failing with a transient error when attempts ran out.
    RetryableFailure {
        result: InvocationResult,
        attempts: u32,
    },
    FatalFailure {
        result: InvocationResult,
        attempts: u32,
    },
}

impl PhaseOutcome {
    pub fn result(&self) -> &InvocationResult {
        match self {
            Self::Success { result, .. }
            | Self::RetryableFailure { result, .. }
            | Self::FatalFailure { result, .. } => result,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::RetryableFailure { attempts, .. }
            | Self::FatalFailure { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RetryableFailure { .. } => "retryable_failure",
            Self::FatalFailure { .. } => "fatal_failure",
        }
    }
}

/// One executed phase in a run's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
}

/// Per-run invocation settings.
///
/// Owned by a run handle once the run starts and only lent out by reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub working_dir: PathBuf,
    /// Variable bindings in the order they are passed to the tool.
    pub variables: Vec<(String, String)>,
    pub var_files: Vec<PathBuf>,
    /// Where `plan -out` persists the plan artifact.
    pub plan_file: Option<PathBuf>,
    pub no_color: bool,
    /// Extra environment for the subprocess.
    pub env: Vec<(String, String)>,
}

impl RunConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            no_color: true,
            ..Default::default()
        }
    }

    /// Bind a variable, replacing any earlier binding with the same name.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.variables.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.variables.push((name, value));
        }
        self
    }

    pub fn with_var_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.var_files.push(path.into());
        self
    }

    pub fn with_plan_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.plan_file = Some(path.into());
        self
    }

    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Same bindings, different directory (used after copying to a private work dir).
    pub fn relocated(&self, working_dir: &Path) -> Self {
        let plan_file = self.plan_file.as_ref().map(|p| {
            if p.is_relative() {
                p.clone()
            } else {
                p.strip_prefix(&self.working_dir)
                    .map_or_else(|_| p.clone(), |rel| working_dir.join(rel))
            }
        });
        Self {
            working_dir: working_dir.to_path_buf(),
            plan_file,
            ..self.clone()
        }
    }

    /// Plan file resolved against the working directory.
    pub fn resolved_plan_file(&self) -> Option<PathBuf> {
        self.plan_file.as_ref().map(|p| {
            if p.is_relative() {
                self.working_dir.join(p)
            } else {
                p.clone()
            }
        })
    }
}

/// Parse a `name=value` variable binding.
pub fn parse_var_binding(s: &str) -> Option<(String, String)> {
    let (name, value) = s.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}
