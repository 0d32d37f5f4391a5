//! Configuration parsing for the lifecycle harness.
//!
//! Plain `key=value` file (`.tflife/config` by default), `#` comments,
//! optionally quoted values, pipe-separated lists.
//! Precedence: CLI flags > `--config` file > `.tflife/config` > defaults.

use crate::types::{IsolationMode, OutputSource};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config location relative to the directory under test.
pub const DEFAULT_CONFIG_PATH: &str = ".tflife/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Harness configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Tool
    pub tool_bin: PathBuf,
    pub no_color: bool,

    // Retry
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-invocation timeout (0 = no timeout).
    pub phase_timeout_sec: u32,
    /// Overall budget for one run; expiry starts teardown (0 = no limit).
    pub run_timeout_sec: u32,
    /// Replaces the built-in retryable error list when set.
    pub retryable_errors: Option<Vec<String>>,
    /// Appended to whichever retryable list is active.
    pub extra_retryable_errors: Vec<String>,

    // Isolation
    pub isolation_mode: IsolationMode,
    /// How long a blocking acquire may wait (0 = forever).
    pub acquire_timeout_sec: u32,
    /// Copy the configuration into a private directory under `work_root`.
    pub copy_to_work_root: bool,
    pub work_root: PathBuf,

    // Outputs
    pub capture_output: OutputSource,
    pub plan_file: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool_bin: PathBuf::from("terraform"),
            no_color: true,
            max_attempts: 3,
            retry_base_delay_ms: 5000,
            retry_max_delay_ms: 60_000,
            phase_timeout_sec: 0,
            run_timeout_sec: 0,
            retryable_errors: None,
            extra_retryable_errors: Vec::new(),
            isolation_mode: IsolationMode::Block,
            acquire_timeout_sec: 0,
            copy_to_work_root: false,
            work_root: dirs::temp_dir().join("tflife"),
            capture_output: OutputSource::Command,
            plan_file: None,
            report_dir: None,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.tflife/config` under `dir` if it exists, else defaults.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(DEFAULT_CONFIG_PATH);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "tool_bin" => self.tool_bin = PathBuf::from(value),
            "no_color" => self.no_color = Self::parse_bool(key, value)?,
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            "retry_base_delay_ms" => self.retry_base_delay_ms = Self::parse_int(key, value)?,
            "retry_max_delay_ms" => self.retry_max_delay_ms = Self::parse_int(key, value)?,
            "phase_timeout_sec" => self.phase_timeout_sec = Self::parse_int(key, value)?,
            "run_timeout_sec" => self.run_timeout_sec = Self::parse_int(key, value)?,
            "retryable_errors" => self.retryable_errors = Some(Self::split_list(value)),
            "extra_retryable_errors" => self.extra_retryable_errors = Self::split_list(value),
            "isolation_mode" => {
                self.isolation_mode = match value {
                    "block" => IsolationMode::Block,
                    "fail_fast" => IsolationMode::FailFast,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "isolation_mode must be 'block' or 'fail_fast', got '{value}'"
                        )))
                    }
                }
            }
            "acquire_timeout_sec" => self.acquire_timeout_sec = Self::parse_int(key, value)?,
            "copy_to_work_root" => self.copy_to_work_root = Self::parse_bool(key, value)?,
            "work_root" => self.work_root = PathBuf::from(value),
            "capture_output" => {
                self.capture_output = match value {
                    "command" => OutputSource::Command,
                    "apply_stdout" => OutputSource::ApplyStdout,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "capture_output must be 'command' or 'apply_stdout', got '{value}'"
                        )))
                    }
                }
            }
            "plan_file" => {
                self.plan_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "report_dir" => {
                self.report_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            _ => {
                // Unknown keys warn rather than fail so older binaries accept newer files.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Pipe-separated list; regexes rarely need a literal `|` at the top level.
    fn split_list(value: &str) -> Vec<String> {
        value
            .split(" | ")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against the directory under test.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.work_root.is_relative() {
            self.work_root = base.join(&self.work_root);
        }
        if let Some(ref report_dir) = self.report_dir {
            if report_dir.is_relative() {
                self.report_dir = Some(base.join(report_dir));
            }
        }
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn temp_dir() -> PathBuf {
        std::env::var_os("TFLIFE_WORK_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}
