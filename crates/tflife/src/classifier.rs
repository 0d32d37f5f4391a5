//! Classification of failed invocations into retryable vs fatal.
//!
//! The retryable set is an ordered list of regular expressions matched
//! against stdout and stderr; the first match wins. Anything unmatched is
//! fatal so a genuine configuration error never loops.

use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use tflife_core::{Config, InvocationResult};

/// Retryable patterns the harness ships with, paired with a description.
///
/// Covers provider registry and plugin download hiccups, TLS and connection
/// resets, API rate limiting and invocations killed by the phase timeout.
pub const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    (
        r".*read: connection reset by peer.*",
        "connection reset by remote endpoint",
    ),
    (
        r".*transport is closing.*",
        "transport closed while talking to the provider API",
    ),
    (
        r".*unable to verify signature.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*unable to verify checksum.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*no provider exists with the given name.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*registry service is unreachable.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*Error installing provider.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*Failed to query available provider packages.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*timeout while waiting for plugin to start.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r".*timed out waiting for server handshake.*",
        "failed to retrieve plugin due to transient network error",
    ),
    (
        r"could not query provider registry for",
        "failed to retrieve plugin due to transient network error",
    ),
    (r".*TLS handshake timeout.*", "TLS handshake timed out"),
    (
        r".*Client\.Timeout exceeded while awaiting headers.*",
        "HTTP client timeout",
    ),
    (r".*429 Too Many Requests.*", "rate limited by the remote API"),
    (
        r"\[tflife\] timed out after",
        "invocation exceeded the phase timeout",
    ),
];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid retryable pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// One configured retryable error.
#[derive(Debug, Clone)]
pub struct RetryableError {
    pub pattern: Regex,
    pub description: String,
    /// Minimum wait before the next attempt.
    pub wait_hint: Option<Duration>,
}

/// Classifier decision for a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Retryable {
        pattern: String,
        description: String,
        wait_hint: Option<Duration>,
    },
    Fatal,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Decides whether a failed invocation is worth retrying.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    retryable: Vec<RetryableError>,
}

impl ErrorClassifier {
    /// A classifier with no retryable patterns: every failure is fatal.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_retryable_errors() -> Self {
        let mut classifier = Self::new();
        for (pattern, description) in DEFAULT_RETRYABLE_ERRORS {
            // Built-in patterns are covered by tests; skip rather than panic.
            if let Ok(regex) = Regex::new(pattern) {
                classifier.retryable.push(RetryableError {
                    pattern: regex,
                    description: (*description).to_string(),
                    wait_hint: None,
                });
            }
        }
        classifier
    }

    /// Build from config: `retryable_errors` replaces the defaults,
    /// `extra_retryable_errors` is appended.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut classifier = match &config.retryable_errors {
            Some(patterns) => {
                let mut classifier = Self::new();
                for pattern in patterns {
                    classifier = classifier.with_pattern(pattern, "configured retryable error", None)?;
                }
                classifier
            }
            None => Self::with_default_retryable_errors(),
        };
        for pattern in &config.extra_retryable_errors {
            classifier = classifier.with_pattern(pattern, "configured retryable error", None)?;
        }
        Ok(classifier)
    }

    /// Append a retryable pattern.
    pub fn with_pattern(
        mut self,
        pattern: &str,
        description: impl Into<String>,
        wait_hint: Option<Duration>,
    ) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| ClassifierError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.retryable.push(RetryableError {
            pattern: regex,
            description: description.into(),
            wait_hint,
        });
        Ok(self)
    }

    pub fn patterns(&self) -> &[RetryableError] {
        &self.retryable
    }

    /// Classify a result. Exit code 0 is never retryable.
    pub fn classify(&self, result: &InvocationResult) -> Classification {
        if result.exit_code == 0 {
            return Classification::Fatal;
        }

        self.retryable
            .iter()
            .find(|entry| {
                entry.pattern.is_match(&result.stderr) || entry.pattern.is_match(&result.stdout)
            })
            .map_or(Classification::Fatal, |entry| Classification::Retryable {
                pattern: entry.pattern.as_str().to_string(),
                description: entry.description.clone(),
                wait_hint: entry.wait_hint,
            })
    }
}
