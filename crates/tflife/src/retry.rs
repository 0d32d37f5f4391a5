//! Bounded exponential backoff around invoker calls.
//!
//! Every phase goes through `RetryPolicy::execute`: success short-circuits,
//! failures are classified, transient ones are retried after a delay that
//! depends only on the attempt number.

use std::future::Future;
use std::time::Duration;
use tflife_core::{Config, InvocationResult, Phase, PhaseOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classifier::{Classification, ErrorClassifier};
use crate::invoker::InvokerError;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts including the first (clamped to at least 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetrySettings::default())
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }

    /// Delay before the attempt following `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.settings
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.settings.max_delay)
            .min(self.settings.max_delay)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Spawn failures from the
    /// invoker are returned as `Err` immediately; they are not provisioning
    /// results. Cancelling `cancel_token` cuts the backoff sleep short and
    /// returns the last failure.
    pub async fn execute<F, Fut>(
        &self,
        phase: Phase,
        classifier: &ErrorClassifier,
        cancel_token: &CancellationToken,
        mut op: F,
    ) -> Result<PhaseOutcome, InvokerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<InvocationResult, InvokerError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            let result = op(attempt).await?;

            if phase.is_success_code(result.exit_code) {
                return Ok(PhaseOutcome::Success {
                    result,
                    attempts: attempt,
                });
            }

            let Classification::Retryable {
                description,
                wait_hint,
                ..
            } = classifier.classify(&result)
            else {
                warn!(
                    phase = %phase,
                    attempt,
                    exit_code = result.exit_code,
                    "fatal provisioning error"
                );
                return Ok(PhaseOutcome::FatalFailure {
                    result,
                    attempts: attempt,
                });
            };

            if attempt >= max_attempts {
                warn!(
                    phase = %phase,
                    attempts = attempt,
                    reason = %description,
                    "retryable error persisted; attempts exhausted"
                );
                return Ok(PhaseOutcome::RetryableFailure {
                    result,
                    attempts: attempt,
                });
            }

            let delay = wait_hint.map_or_else(
                || self.delay_for(attempt),
                |hint| hint.max(self.delay_for(attempt)),
            );
            info!(
                phase = %phase,
                attempt,
                max_attempts,
                reason = %description,
                backoff_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel_token.cancelled() => {
                    warn!(phase = %phase, attempt, "retry cancelled during backoff");
                    return Ok(PhaseOutcome::RetryableFailure {
                        result,
                        attempts: attempt,
                    });
                }
            }

            attempt += 1;
        }
    }
}
