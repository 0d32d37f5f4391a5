//! Run report TSV generation.
//!
//! One row per executed phase plus a summary row, so CI can archive how a
//! lifecycle run went without scraping logs.
//!
//! Columns: `timestamp_ms`, `run_id`, kind, phase, attempts, `duration_ms`,
//!          `exit_code`, outcome, message

use crate::types::{PhaseRecord, RunStatus};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A single row in a report.tsv file.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub run_id: String,
    /// Row kind (`PHASE`, `LEAK`, `RUN_END`).
    pub kind: String,
    pub phase: String,
    pub attempts: Option<u32>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    /// Phase outcome or run status.
    pub outcome: String,
    pub message: String,
}

impl ReportRow {
    /// Create a new report row with required fields.
    pub fn new(timestamp_ms: i64, run_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            run_id: run_id.into(),
            kind: kind.into(),
            phase: String::new(),
            attempts: None,
            duration_ms: None,
            exit_code: None,
            outcome: String::new(),
            message: String::new(),
        }
    }

    /// Row describing one phase record.
    pub fn from_record(run_id: &str, record: &PhaseRecord) -> Self {
        let result = record.outcome.result();
        Self::new(result.started_at.timestamp_millis(), run_id, "PHASE")
            .with_phase(record.phase.as_str())
            .with_attempts(record.outcome.attempts())
            .with_duration_ms(result.duration.as_millis() as u64)
            .with_exit_code(result.exit_code)
            .with_outcome(record.outcome.as_str())
            .with_message(result.command_line())
    }

    /// Closing row carrying the aggregated status.
    pub fn run_end(timestamp_ms: i64, run_id: &str, status: RunStatus) -> Self {
        Self::new(timestamp_ms, run_id, "RUN_END").with_outcome(status.as_str())
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set duration in milliseconds.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        let attempts = self.attempts.map(|a| a.to_string()).unwrap_or_default();
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let exit_code = self.exit_code.map(|c| c.to_string()).unwrap_or_default();

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.run_id,
            self.kind,
            self.phase,
            attempts,
            duration,
            exit_code,
            sanitize_field(&self.outcome),
            sanitize_field(&self.message),
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str =
    "timestamp_ms\trun_id\tkind\tphase\tattempts\tduration_ms\texit_code\toutcome\tmessage";

/// Appending writer for report.tsv files shared by several runs.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Create a new report writer, writing header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())
    }

    /// Write all rows and flush.
    pub fn write_rows(&mut self, rows: &[ReportRow]) -> std::io::Result<()> {
        for row in rows {
            self.write_row(row)?;
        }
        self.flush()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
