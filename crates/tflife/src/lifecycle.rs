//! Lifecycle state machine: init → (plan) → apply → validate → destroy.
//!
//! Failures are recorded on the run handle as data and never short-circuit
//! the walk to `Destroying`. Every run passes through `Destroying` exactly
//! once; the destroy command itself only runs once apply has started.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tflife_core::{
    AssertionFailure, Config, Id, LifecycleState, OutputError, OutputSource, Phase, PhaseOutcome,
    PhaseRecord, ReportRow, ReportWriter, RunConfig, RunStatus, StructuredOutput,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::ErrorClassifier;
use crate::invoker::{Invoker, InvokerError, InvokerSettings};
use crate::isolation::WorkDirLease;
use crate::retry::{RetryPolicy, RetrySettings};

/// Lines of tool output kept in error details.
const DETAIL_LINES: usize = 20;

/// Caller-supplied check over the captured outputs.
pub type Assertion = Box<dyn Fn(&StructuredOutput) -> Result<(), AssertionFailure> + Send + Sync>;

/// A failure recorded during a run.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("{phase} failed with exit code {exit_code} after {attempts} attempt(s): {detail}")]
    Fatal {
        phase: Phase,
        exit_code: i32,
        attempts: u32,
        detail: String,
    },
    #[error("{phase} still failing with a retryable error after {attempts} attempt(s): {detail}")]
    RetriesExhausted {
        phase: Phase,
        exit_code: i32,
        attempts: u32,
        detail: String,
    },
    #[error("{phase} could not be started: {message}")]
    Invoker { phase: Phase, message: String },
    #[error("run cancelled before {phase}")]
    Cancelled { phase: Phase },
    #[error("run cancelled while {phase} was waiting to retry, after {attempts} attempt(s): {detail}")]
    CancelledDuringBackoff {
        phase: Phase,
        attempts: u32,
        detail: String,
    },
    #[error(transparent)]
    MalformedOutput(#[from] OutputError),
    #[error("assertion failed: {0}")]
    Assertion(#[from] AssertionFailure),
}

impl ProvisionError {
    /// Error for a non-success outcome; `None` for success.
    pub fn from_outcome(phase: Phase, outcome: &PhaseOutcome) -> Option<Self> {
        match outcome {
            PhaseOutcome::Success { .. } => None,
            PhaseOutcome::FatalFailure { result, attempts } => Some(Self::Fatal {
                phase,
                exit_code: result.exit_code,
                attempts: *attempts,
                detail: result.tail(DETAIL_LINES),
            }),
            PhaseOutcome::RetryableFailure { result, attempts } => Some(Self::RetriesExhausted {
                phase,
                exit_code: result.exit_code,
                attempts: *attempts,
                detail: result.tail(DETAIL_LINES),
            }),
        }
    }

    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Assertion(_))
    }
}

/// Destroy did not complete: infrastructure may still be live.
#[derive(Debug, Clone, Error)]
#[error(
    "teardown leak in {}: destroy failed after {attempts} attempt(s) (exit code {exit_code}); resources may still exist: {detail}",
    working_dir.display()
)]
pub struct TeardownLeakWarning {
    pub working_dir: PathBuf,
    pub attempts: u32,
    pub exit_code: i32,
    pub detail: String,
}

/// Which phases a run walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// init → (plan) → apply → output → assertions → destroy.
    Lifecycle,
    /// init → plan.
    PlanOnly,
    /// init → validate.
    ValidateOnly,
}

/// State of one run: config, lease, history and the teardown flag.
#[derive(Debug)]
pub struct RunHandle {
    id: Id,
    config: RunConfig,
    lease: Option<WorkDirLease>,
    state: LifecycleState,
    records: Vec<PhaseRecord>,
    errors: Vec<ProvisionError>,
    output: Option<StructuredOutput>,
    leak: Option<TeardownLeakWarning>,
    /// Set once apply has started; cleared when destroy has been attempted.
    teardown_pending: bool,
    teardown_entries: u32,
}

impl RunHandle {
    /// Handle for `config`, with the working directory already leased.
    ///
    /// The config's working directory is replaced by the lease path.
    pub fn new(config: RunConfig, lease: WorkDirLease) -> Self {
        let config = config.relocated(lease.path());
        Self::build(config, Some(lease))
    }

    /// Handle without an isolation lease, for callers that guarantee
    /// exclusivity themselves.
    pub fn unleased(config: RunConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: RunConfig, lease: Option<WorkDirLease>) -> Self {
        Self {
            id: Id::new(),
            config,
            lease,
            state: LifecycleState::Init,
            records: Vec::new(),
            errors: Vec::new(),
            output: None,
            leak: None,
            teardown_pending: false,
            teardown_entries: 0,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn teardown_pending(&self) -> bool {
        self.teardown_pending
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!(
            run_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "lifecycle transition"
        );
        self.state = next;
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome) -> bool {
        let success = outcome.is_success();
        if let Some(err) = ProvisionError::from_outcome(phase, &outcome) {
            self.errors.push(err);
        }
        self.records.push(PhaseRecord { phase, outcome });
        success
    }

    /// Record a retryable failure whose backoff was cut short by a cancel.
    fn record_cancelled_retry(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.errors.push(ProvisionError::CancelledDuringBackoff {
            phase,
            attempts: outcome.attempts(),
            detail: outcome.result().tail(DETAIL_LINES),
        });
        self.records.push(PhaseRecord { phase, outcome });
    }

    fn record_invoker_error(&mut self, phase: Phase, err: &InvokerError) {
        self.errors.push(ProvisionError::Invoker {
            phase,
            message: err.to_string(),
        });
    }

    fn last_stdout(&self, phase: Phase) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| r.phase == phase)
            .map(|r| r.outcome.result().stdout.as_str())
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.teardown_pending {
            error!(
                run_id = %self.id,
                working_dir = %self.config.working_dir.display(),
                "run handle dropped before teardown; resources may have leaked"
            );
        }
    }
}

/// Aggregated result of a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Id,
    pub working_dir: PathBuf,
    pub records: Vec<PhaseRecord>,
    pub output: Option<StructuredOutput>,
    /// Failures in the order they were recorded.
    pub errors: Vec<ProvisionError>,
    pub leak: Option<TeardownLeakWarning>,
    /// How many times the run entered `Destroying` (always 1).
    pub teardown_entries: u32,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.leak.is_some() {
            RunStatus::TeardownLeaked
        } else if self.errors.iter().any(|e| !e.is_assertion()) {
            RunStatus::ProvisioningFailed
        } else if self.errors.is_empty() {
            RunStatus::Passed
        } else {
            RunStatus::AssertionFailed
        }
    }

    pub fn first_error(&self) -> Option<&ProvisionError> {
        self.errors.first()
    }

    pub fn assertion_failures(&self) -> impl Iterator<Item = &AssertionFailure> {
        self.errors.iter().filter_map(|err| match err {
            ProvisionError::Assertion(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn phase_outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.records
            .iter()
            .rev()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    /// Number of times `phase` was executed (each counts all its attempts).
    pub fn phase_count(&self, phase: Phase) -> usize {
        self.records.iter().filter(|r| r.phase == phase).count()
    }

    pub fn apply_succeeded(&self) -> bool {
        self.phase_outcome(Phase::Apply)
            .is_some_and(PhaseOutcome::is_success)
    }

    /// Rows for the TSV report.
    pub fn report_rows(&self) -> Vec<ReportRow> {
        let run_id = self.run_id.to_string();
        let mut rows: Vec<ReportRow> = self
            .records
            .iter()
            .map(|record| ReportRow::from_record(&run_id, record))
            .collect();
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(leak) = &self.leak {
            rows.push(
                ReportRow::new(now, run_id.as_str(), "LEAK")
                    .with_phase(Phase::Destroy.as_str())
                    .with_attempts(leak.attempts)
                    .with_exit_code(leak.exit_code)
                    .with_message(leak.to_string()),
            );
        }
        let mut end = ReportRow::run_end(now, &run_id, self.status());
        if let Some(err) = self.first_error() {
            end = end.with_message(err.to_string());
        }
        rows.push(end);
        rows
    }

    /// Surface the first failure together with any leak.
    pub fn into_result(self) -> Result<Option<StructuredOutput>, RunFailure> {
        let status = self.status();
        if status == RunStatus::Passed {
            return Ok(self.output);
        }
        Err(RunFailure {
            status,
            primary: self.errors.into_iter().next(),
            leak: self.leak,
        })
    }
}

/// A run that did not pass.
#[derive(Debug, Error)]
pub struct RunFailure {
    pub status: RunStatus,
    pub primary: Option<ProvisionError>,
    pub leak: Option<TeardownLeakWarning>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {}", self.status.as_str())?;
        if let Some(primary) = &self.primary {
            write!(f, ": {primary}")?;
        }
        if let Some(leak) = &self.leak {
            write!(f, "; {leak}")?;
        }
        Ok(())
    }
}

/// Drives run handles through the lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleRunner {
    invoker: Invoker,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
    output_source: OutputSource,
    /// Overall budget per run; expiry cancels like an external abort.
    deadline: Option<Duration>,
    report_dir: Option<PathBuf>,
}

impl LifecycleRunner {
    pub fn new(invoker: Invoker, retry: RetryPolicy, classifier: ErrorClassifier) -> Self {
        Self {
            invoker,
            retry,
            classifier,
            output_source: OutputSource::Command,
            deadline: None,
            report_dir: None,
        }
    }

    pub fn from_config(config: &Config, classifier: ErrorClassifier) -> Self {
        Self::new(
            Invoker::new(InvokerSettings::from_config(config)),
            RetryPolicy::new(RetrySettings::from_config(config)),
            classifier,
        )
        .with_output_source(config.capture_output)
        .with_deadline(
            (config.run_timeout_sec > 0)
                .then(|| Duration::from_secs(u64::from(config.run_timeout_sec))),
        )
        .with_report_dir(config.report_dir.clone())
    }

    pub fn with_output_source(mut self, source: OutputSource) -> Self {
        self.output_source = source;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_report_dir(mut self, report_dir: Option<PathBuf>) -> Self {
        self.report_dir = report_dir;
        self
    }

    /// Run `handle` to `Done` and return the aggregated report.
    ///
    /// `cancel_token` aborts provisioning phases; teardown still runs its
    /// first destroy attempt and only its retries observe cancellation.
    pub async fn run(
        &self,
        mut handle: RunHandle,
        mode: RunMode,
        assertions: &[Assertion],
        cancel_token: &CancellationToken,
    ) -> RunReport {
        let run_token = cancel_token.child_token();
        let deadline_timer = self.deadline.map(|deadline| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            })
        });

        info!(
            run_id = %handle.id,
            mode = ?mode,
            working_dir = %handle.config.working_dir.display(),
            "starting run"
        );

        self.provision(&mut handle, mode, assertions, &run_token).await;
        self.teardown(&mut handle, &run_token).await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        let report = self.finish(handle);
        self.write_report(&report);
        report
    }

    /// Everything before teardown. Returns early on the first failure that
    /// makes later phases pointless.
    async fn provision(
        &self,
        handle: &mut RunHandle,
        mode: RunMode,
        assertions: &[Assertion],
        run_token: &CancellationToken,
    ) {
        if !self.step(handle, Phase::Init, run_token).await {
            return;
        }

        match mode {
            RunMode::ValidateOnly => {
                self.step(handle, Phase::Validate, run_token).await;
            }
            RunMode::PlanOnly => {
                handle.transition(LifecycleState::Planned);
                self.step(handle, Phase::Plan, run_token).await;
            }
            RunMode::Lifecycle => {
                if handle.config.plan_file.is_some() {
                    handle.transition(LifecycleState::Planned);
                    if !self.step(handle, Phase::Plan, run_token).await {
                        return;
                    }
                }

                if run_token.is_cancelled() {
                    handle.errors.push(ProvisionError::Cancelled { phase: Phase::Apply });
                    return;
                }

                handle.transition(LifecycleState::Applied);
                // Owed from the first apply attempt on, even a failed one.
                handle.teardown_pending = true;
                if !self.step(handle, Phase::Apply, run_token).await {
                    return;
                }

                let Some(output) = self.capture_output(handle, run_token).await else {
                    return;
                };

                handle.transition(LifecycleState::Validating);
                for failure in run_assertions(assertions, &output) {
                    warn!(run_id = %handle.id, error = %failure, "assertion failed");
                    handle.errors.push(ProvisionError::Assertion(failure));
                }
                handle.output = Some(output);
            }
        }
    }

    /// Run one phase through the retry policy and record it.
    async fn step(
        &self,
        handle: &mut RunHandle,
        phase: Phase,
        run_token: &CancellationToken,
    ) -> bool {
        if run_token.is_cancelled() {
            warn!(run_id = %handle.id, phase = %phase, "run cancelled; skipping phase");
            handle.errors.push(ProvisionError::Cancelled { phase });
            return false;
        }

        info!(run_id = %handle.id, phase = %phase, "phase starting");
        match self
            .execute_phase(&handle.config, phase, run_token, run_token)
            .await
        {
            Ok(outcome) => {
                let attempts = outcome.attempts();
                let exit_code = outcome.result().exit_code;
                let backoff_cancelled = run_token.is_cancelled()
                    && matches!(outcome, PhaseOutcome::RetryableFailure { .. })
                    && attempts < self.retry.max_attempts();
                let success = if backoff_cancelled {
                    handle.record_cancelled_retry(phase, outcome);
                    false
                } else {
                    handle.record(phase, outcome)
                };
                info!(
                    run_id = %handle.id,
                    phase = %phase,
                    success,
                    attempts,
                    exit_code,
                    "phase finished"
                );
                success
            }
            Err(err) => {
                warn!(run_id = %handle.id, phase = %phase, error = %err, "phase could not start");
                handle.record_invoker_error(phase, &err);
                false
            }
        }
    }

    async fn execute_phase(
        &self,
        config: &RunConfig,
        phase: Phase,
        invoke_token: &CancellationToken,
        retry_token: &CancellationToken,
    ) -> Result<PhaseOutcome, InvokerError> {
        let invoker = &self.invoker;
        self.retry
            .execute(phase, &self.classifier, retry_token, |_attempt| {
                let token = invoke_token.clone();
                async move { invoker.run_phase(phase, config, token).await }
            })
            .await
    }

    async fn capture_output(
        &self,
        handle: &mut RunHandle,
        run_token: &CancellationToken,
    ) -> Option<StructuredOutput> {
        let stdout = match self.output_source {
            OutputSource::ApplyStdout => handle.last_stdout(Phase::Apply)?.to_string(),
            OutputSource::Command => {
                if !self.step(handle, Phase::Output, run_token).await {
                    return None;
                }
                handle.last_stdout(Phase::Output)?.to_string()
            }
        };

        match StructuredOutput::parse(&stdout) {
            Ok(output) => {
                debug!(run_id = %handle.id, keys = output.len(), "captured structured output");
                Some(output)
            }
            Err(err) => {
                warn!(run_id = %handle.id, error = %err, "structured output could not be parsed");
                handle.errors.push(ProvisionError::MalformedOutput(err));
                None
            }
        }
    }

    /// Enter `Destroying` and run destroy if anything may have been provisioned.
    async fn teardown(&self, handle: &mut RunHandle, run_token: &CancellationToken) {
        handle.transition(LifecycleState::Destroying);
        handle.teardown_entries += 1;

        if !handle.teardown_pending {
            debug!(run_id = %handle.id, "nothing provisioned; teardown is a no-op");
            return;
        }

        info!(run_id = %handle.id, "destroying provisioned resources");
        // The destroy subprocess itself is never cancelled; only the waits
        // between retries are.
        let invoke_token = CancellationToken::new();
        let outcome = self
            .execute_phase(&handle.config, Phase::Destroy, &invoke_token, run_token)
            .await;
        handle.teardown_pending = false;

        let leak = match outcome {
            Ok(outcome) if outcome.is_success() => {
                info!(run_id = %handle.id, attempts = outcome.attempts(), "teardown complete");
                handle.records.push(PhaseRecord {
                    phase: Phase::Destroy,
                    outcome,
                });
                None
            }
            Ok(outcome) => {
                let result = outcome.result();
                let leak = TeardownLeakWarning {
                    working_dir: handle.config.working_dir.clone(),
                    attempts: outcome.attempts(),
                    exit_code: result.exit_code,
                    detail: result.tail(DETAIL_LINES),
                };
                handle.records.push(PhaseRecord {
                    phase: Phase::Destroy,
                    outcome,
                });
                Some(leak)
            }
            Err(err) => Some(TeardownLeakWarning {
                working_dir: handle.config.working_dir.clone(),
                attempts: 0,
                exit_code: -1,
                detail: err.to_string(),
            }),
        };

        if let Some(leak) = leak {
            error!(run_id = %handle.id, warning = %leak, "teardown leak");
            handle.leak = Some(leak);
        }
    }

    fn finish(&self, mut handle: RunHandle) -> RunReport {
        handle.transition(LifecycleState::Done);

        if let Some(lease) = handle.lease.take() {
            if handle.leak.is_some() {
                // Keep the directory: its state is needed for manual cleanup.
                lease.release();
            } else {
                lease.release_and_remove();
            }
        }

        let report = RunReport {
            run_id: handle.id.clone(),
            working_dir: handle.config.working_dir.clone(),
            records: std::mem::take(&mut handle.records),
            output: handle.output.take(),
            errors: std::mem::take(&mut handle.errors),
            leak: handle.leak.take(),
            teardown_entries: handle.teardown_entries,
        };

        info!(
            run_id = %report.run_id,
            status = report.status().as_str(),
            phases = report.records.len(),
            "run finished"
        );
        report
    }

    fn write_report(&self, report: &RunReport) {
        let Some(dir) = &self.report_dir else {
            return;
        };
        if let Err(err) = append_report(dir, report) {
            warn!(dir = %dir.display(), error = %err, "failed to write run report");
        }
    }
}

fn append_report(dir: &Path, report: &RunReport) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut writer = ReportWriter::new(&dir.join("report.tsv"))?;
    writer.write_rows(&report.report_rows())
}

/// Run every assertion; a panicking assertion counts as a failure.
fn run_assertions(assertions: &[Assertion], output: &StructuredOutput) -> Vec<AssertionFailure> {
    assertions
        .iter()
        .filter_map(|assertion| {
            match catch_unwind(AssertUnwindSafe(|| assertion(output))) {
                Ok(Ok(())) => None,
                Ok(Err(failure)) => Some(failure),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "assertion panicked".to_string());
                    Some(AssertionFailure::new(message))
                }
            }
        })
        .collect()
}

/// Assert that output `key` exists and is not empty.
pub fn expect_non_empty(key: &str) -> Assertion {
    let key = key.to_string();
    Box::new(move |output| output.assert_non_empty(&key))
}

/// Assert that output `key` is an object containing `nested`.
pub fn expect_contains_key(key: &str, nested: &str) -> Assertion {
    let key = key.to_string();
    let nested = nested.to_string();
    Box::new(move |output| output.assert_contains_key(&key, &nested))
}

/// Assert that output `key` exists.
pub fn expect_present(key: &str) -> Assertion {
    let key = key.to_string();
    Box::new(move |output| output.assert_present(&key))
}
