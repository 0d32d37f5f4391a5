//! tflife-core - shared types for the provisioning lifecycle harness
//!
//! Data model, structured output parsing, config file loading and the TSV
//! run report. No async runtime and no logging.

pub mod config;
pub mod output;
pub mod report;
pub mod types;

pub use config::Config;
pub use output::{AssertionFailure, OutputError, StructuredOutput};
pub use report::{ReportRow, ReportWriter};
pub use types::*;
