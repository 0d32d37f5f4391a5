//! tflife - provisioning lifecycle harness
//!
//! Drives an infrastructure-as-code tool through init → plan → apply →
//! output → destroy for a test, retrying transient failures and always
//! tearing down what it provisioned.

pub mod classifier;
pub mod invoker;
pub mod isolation;
pub mod lifecycle;
pub mod retry;

use std::sync::Arc;

use classifier::{ClassifierError, ErrorClassifier};
use isolation::{IsolationError, IsolationRegistry, IsolationSettings};
use lifecycle::{Assertion, LifecycleRunner, RunFailure, RunHandle, RunMode, RunReport};
use thiserror::Error;
use tflife_core::{Config, Phase, PhaseOutcome, RunConfig, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use lifecycle::{expect_contains_key, expect_non_empty, expect_present};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("isolation error: {0}")]
    Isolation(#[from] IsolationError),
    #[error("{0}")]
    Run(#[from] RunFailure),
    #[error("run cancelled while waiting for a working directory")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Entry point for tests: leases a working directory and runs the lifecycle.
#[derive(Debug, Clone)]
pub struct Harness {
    runner: LifecycleRunner,
    registry: Arc<IsolationRegistry>,
    private_copies: bool,
}

impl Harness {
    pub fn new(runner: LifecycleRunner, registry: Arc<IsolationRegistry>) -> Self {
        Self {
            runner,
            registry,
            private_copies: false,
        }
    }

    /// Build every component from a loaded config with a fresh registry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let classifier = ErrorClassifier::from_config(config)?;
        let runner = LifecycleRunner::from_config(config, classifier);
        let registry = IsolationRegistry::new(IsolationSettings::from_config(config));
        Ok(Self::new(runner, registry).with_private_copies(config.copy_to_work_root))
    }

    /// Share a registry with other harnesses in the same process.
    pub fn with_registry(mut self, registry: Arc<IsolationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Run each test against a private copy of the configuration.
    pub fn with_private_copies(mut self, enabled: bool) -> Self {
        self.private_copies = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<IsolationRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &LifecycleRunner {
        &self.runner
    }

    /// Lease the working directory (or a private copy) for a new run.
    ///
    /// Gives up with [`HarnessError::Cancelled`] if `cancel_token` fires
    /// before the lease is held, e.g. while waiting on a busy directory.
    pub async fn start(
        &self,
        config: RunConfig,
        cancel_token: &CancellationToken,
    ) -> Result<RunHandle> {
        let acquire = async {
            if self.private_copies {
                let base_name = config
                    .working_dir
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("run")
                    .to_string();
                self.registry
                    .acquire_copy(&config.working_dir, &base_name)
                    .await
            } else {
                self.registry.acquire_work_dir(&config.working_dir).await
            }
        };

        let lease = tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                debug!(path = %config.working_dir.display(), "cancelled before lease");
                return Err(HarnessError::Cancelled);
            }
            lease = acquire => lease?,
        };
        debug!(path = %lease.path().display(), "working directory leased");
        Ok(RunHandle::new(config, lease))
    }

    /// Lease, run in `mode`, and return the report.
    ///
    /// Only a failure to lease (or a cancel before the lease) is an `Err`;
    /// everything after that is recorded in the report.
    pub async fn run(
        &self,
        config: RunConfig,
        mode: RunMode,
        assertions: &[Assertion],
        cancel_token: &CancellationToken,
    ) -> Result<RunReport> {
        let handle = self.start(config, cancel_token).await?;
        Ok(self
            .runner
            .run(handle, mode, assertions, cancel_token)
            .await)
    }

    /// Full lifecycle: init, optional plan, apply, output capture,
    /// assertions, then destroy no matter what happened before.
    pub async fn run_lifecycle(
        &self,
        config: RunConfig,
        assertions: &[Assertion],
    ) -> Result<RunReport> {
        self.run(
            config,
            RunMode::Lifecycle,
            assertions,
            &CancellationToken::new(),
        )
        .await
    }

    /// Init and plan without provisioning. Returns the plan exit code:
    /// 0 for no changes, 2 for pending changes.
    pub async fn plan_only(&self, config: RunConfig) -> Result<i32> {
        let report = self
            .run(config, RunMode::PlanOnly, &[], &CancellationToken::new())
            .await?;
        match report.phase_outcome(Phase::Plan) {
            Some(PhaseOutcome::Success { result, .. }) => Ok(result.exit_code),
            _ => Err(failure(report)),
        }
    }

    /// Init and validate without provisioning.
    ///
    /// `Ok(false)` means validate ran and rejected the configuration; an
    /// init failure is an `Err`.
    pub async fn validate_only(&self, config: RunConfig) -> Result<bool> {
        let report = self
            .run(config, RunMode::ValidateOnly, &[], &CancellationToken::new())
            .await?;
        match report.phase_outcome(Phase::Validate) {
            Some(outcome) => Ok(outcome.is_success()),
            None => Err(failure(report)),
        }
    }
}

fn failure(report: RunReport) -> HarnessError {
    match report.into_result() {
        Err(failure) => HarnessError::Run(failure),
        Ok(_) => HarnessError::Run(RunFailure {
            status: RunStatus::ProvisioningFailed,
            primary: None,
            leak: None,
        }),
    }
}

