//! Validation runs: per-table results, run summary, state machine and
//! rendered artifacts.

pub mod store;

use std::fmt;
use std::io::Write;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{ShiftError, ShiftResult};
use crate::reconcile::{DiffRecord, DifferenceSamples, TableReconciliation, Value};

pub use store::{RunListing, RunStore};

/// Lifecycle of a validation run.
///
/// `pending -> running -> {completed | completed_with_errors | failed}`;
/// terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next == RunStatus::Running,
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
}

/// Result for one table of a run. Failed tables keep their names and the
/// error, with zero counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableValidationResult {
    pub table_name: String,
    pub source_table: String,
    pub target_table: String,
    pub status: TableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub key_columns: Vec<String>,
    pub source_rows: u64,
    pub target_rows: u64,
    pub rows_not_in_target: u64,
    pub rows_not_in_source: u64,
    pub fields_mismatch: u64,
    pub has_differences: bool,
    #[serde(default)]
    pub compared_columns: Vec<String>,
    #[serde(default)]
    pub columns_only_in_source: Vec<String>,
    #[serde(default)]
    pub columns_only_in_target: Vec<String>,
    #[serde(default)]
    pub field_mismatch_counts: std::collections::BTreeMap<String, u64>,
    #[serde(default)]
    pub source_checksum: Option<String>,
    #[serde(default)]
    pub target_checksum: Option<String>,
    pub checksum_match: bool,
    pub source_seconds: f64,
    pub target_seconds: f64,
    #[serde(default)]
    pub samples: DifferenceSamples,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TableValidationResult {
    pub fn completed(reconciliation: TableReconciliation, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        let has_differences = reconciliation.has_differences();
        Self {
            table_name: reconciliation.source_table.clone(),
            source_table: reconciliation.source_table,
            target_table: reconciliation.target_table,
            status: TableStatus::Completed,
            error: None,
            error_code: None,
            key_columns: reconciliation.key_columns,
            source_rows: reconciliation.source.rows,
            target_rows: reconciliation.target.rows,
            rows_not_in_target: reconciliation.rows_not_in_target,
            rows_not_in_source: reconciliation.rows_not_in_source,
            fields_mismatch: reconciliation.fields_mismatch,
            has_differences,
            compared_columns: reconciliation.compared_columns,
            columns_only_in_source: reconciliation.columns_only_in_source,
            columns_only_in_target: reconciliation.columns_only_in_target,
            field_mismatch_counts: reconciliation.field_mismatch_counts,
            source_checksum: Some(reconciliation.source.checksum),
            target_checksum: Some(reconciliation.target.checksum),
            checksum_match: reconciliation.checksum_match,
            source_seconds: reconciliation.source.elapsed_seconds,
            target_seconds: reconciliation.target.elapsed_seconds,
            samples: reconciliation.samples,
            started_at,
            finished_at,
        }
    }

    pub fn failed(
        source_table: &str,
        target_table: &str,
        key_columns: &[String],
        error: &ShiftError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            table_name: source_table.to_string(),
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
            status: TableStatus::Failed,
            error: Some(error.to_string()),
            error_code: Some(error.code().to_string()),
            key_columns: key_columns.to_vec(),
            source_rows: 0,
            target_rows: 0,
            rows_not_in_target: 0,
            rows_not_in_source: 0,
            fields_mismatch: 0,
            has_differences: false,
            compared_columns: Vec::new(),
            columns_only_in_source: Vec::new(),
            columns_only_in_target: Vec::new(),
            field_mismatch_counts: Default::default(),
            source_checksum: None,
            target_checksum: None,
            checksum_match: false,
            source_seconds: 0.0,
            target_seconds: 0.0,
            samples: DifferenceSamples::default(),
            started_at,
            finished_at,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TableStatus::Failed
    }

    /// Rows whose key appears on both sides.
    pub fn common_rows(&self) -> u64 {
        self.source_rows.saturating_sub(self.rows_not_in_target)
    }
}

/// Aggregate counts over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_tables: usize,
    pub tables_completed: usize,
    pub tables_failed: usize,
    pub tables_cancelled: usize,
    pub tables_with_differences: usize,
    pub total_source_rows: u64,
    pub total_target_rows: u64,
    pub total_rows_not_in_target: u64,
    pub total_rows_not_in_source: u64,
    pub total_fields_mismatch: u64,
    pub duration_seconds: f64,
}

impl RunSummary {
    pub fn compute(total_tables: usize, tables: &[TableValidationResult], cancelled: usize, duration_seconds: f64) -> Self {
        let mut summary = Self {
            total_tables,
            tables_cancelled: cancelled,
            duration_seconds,
            ..Self::default()
        };
        for table in tables {
            if table.is_failed() {
                summary.tables_failed += 1;
                continue;
            }
            summary.tables_completed += 1;
            if table.has_differences {
                summary.tables_with_differences += 1;
            }
            summary.total_source_rows += table.source_rows;
            summary.total_target_rows += table.target_rows;
            summary.total_rows_not_in_target += table.rows_not_in_target;
            summary.total_rows_not_in_source += table.rows_not_in_source;
            summary.total_fields_mismatch += table.fields_mismatch;
        }
        summary
    }
}

/// One validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub run_id: String,
    pub status: RunStatus,
    pub source_schema: String,
    pub target_schema: String,
    /// Finished tables, in completion order.
    pub tables: Vec<TableValidationResult>,
    /// Tables never started or interrupted by cancellation.
    pub cancelled_tables: Vec<String>,
    pub summary: RunSummary,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// `run_YYYYMMDD_HHMMSS_<6 hex>`
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..6])
}

impl ValidationRun {
    pub fn new(source_schema: impl Into<String>, target_schema: impl Into<String>, total_tables: usize) -> Self {
        let mut run = Self {
            run_id: new_run_id(),
            status: RunStatus::Pending,
            source_schema: source_schema.into(),
            target_schema: target_schema.into(),
            tables: Vec::new(),
            cancelled_tables: Vec::new(),
            summary: RunSummary {
                total_tables,
                ..RunSummary::default()
            },
            start_time: Utc::now(),
            end_time: None,
            error: None,
            events: Vec::new(),
        };
        run.log(format!("run created with {} table(s)", total_tables));
        run
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a timestamped line to the event log.
    pub fn log(&mut self, message: impl AsRef<str>) {
        self.events
            .push(format!("{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), message.as_ref()));
    }

    pub fn transition(&mut self, next: RunStatus) -> ShiftResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ShiftError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            let end = Utc::now();
            self.end_time = Some(end);
            self.refresh_summary();
        }
        self.log(format!("status {}", next));
        Ok(())
    }

    fn ensure_open(&self) -> ShiftResult<()> {
        if self.is_terminal() {
            return Err(ShiftError::InvalidTransition {
                from: self.status.to_string(),
                to: self.status.to_string(),
            });
        }
        Ok(())
    }

    pub fn record_table(&mut self, result: TableValidationResult) -> ShiftResult<()> {
        self.ensure_open()?;
        match &result.error {
            Some(error) => self.log(format!("table {} failed: {}", result.table_name, error)),
            None => self.log(format!(
                "table {} completed: {} source rows, {} target rows, {} not in target, {} not in source, {} mismatched",
                result.table_name,
                result.source_rows,
                result.target_rows,
                result.rows_not_in_target,
                result.rows_not_in_source,
                result.fields_mismatch
            )),
        }
        self.tables.push(result);
        self.refresh_summary();
        Ok(())
    }

    pub fn record_cancelled(&mut self, table: &str) -> ShiftResult<()> {
        self.ensure_open()?;
        self.log(format!("table {} cancelled", table));
        self.cancelled_tables.push(table.to_string());
        self.refresh_summary();
        Ok(())
    }

    /// Move a running run to its terminal state based on what was recorded:
    /// everything completed -> `completed`; nothing completed -> `failed`;
    /// otherwise `completed_with_errors`.
    pub fn finish(&mut self) -> ShiftResult<RunStatus> {
        self.refresh_summary();
        let completed = self.summary.tables_completed;
        let next = if completed == 0 {
            RunStatus::Failed
        } else if completed == self.summary.total_tables && self.summary.tables_failed == 0 && self.cancelled_tables.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        self.transition(next)?;
        Ok(next)
    }

    /// Fail a run that could not proceed at all.
    pub fn fail(&mut self, error: &ShiftError) -> ShiftResult<()> {
        self.error = Some(error.to_string());
        self.log(format!("run failed: {}", error));
        self.transition(RunStatus::Failed)
    }

    fn refresh_summary(&mut self) {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let duration = (end - self.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        self.summary = RunSummary::compute(self.summary.total_tables, &self.tables, self.cancelled_tables.len(), duration);
    }

    pub fn table(&self, name: &str) -> Option<&TableValidationResult> {
        self.tables
            .iter()
            .find(|t| t.table_name.eq_ignore_ascii_case(name) || t.target_table.eq_ignore_ascii_case(name))
    }

    /// Plain-text report.
    pub fn formatted_report(&self) -> String {
        let mut out = String::new();
        out.push_str("DATA VALIDATION REPORT\n");
        out.push_str("======================\n");
        out.push_str(&format!("Run ID:         {}\n", self.run_id));
        out.push_str(&format!("Status:         {}\n", self.status));
        out.push_str(&format!("Source schema:  {}\n", self.source_schema));
        out.push_str(&format!("Target schema:  {}\n", self.target_schema));
        out.push_str(&format!("Started:        {}\n", self.start_time.format("%Y-%m-%d %H:%M:%S UTC")));
        if let Some(end) = self.end_time {
            out.push_str(&format!("Finished:       {}\n", end.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        out.push_str(&format!("Duration:       {:.2}s\n", self.summary.duration_seconds));
        if let Some(error) = &self.error {
            out.push_str(&format!("Error:          {}\n", error));
        }

        for table in &self.tables {
            out.push('\n');
            out.push_str(&format!("TABLE: {} -> {}\n", table.source_table, table.target_table));
            if let Some(error) = &table.error {
                out.push_str("  Status:              FAILED\n");
                out.push_str(&format!("  Error:               {}\n", error));
                continue;
            }
            out.push_str(&format!("  Key columns:         {}\n", table.key_columns.join(", ")));
            out.push_str(&format!("  Source rows:         {}\n", table.source_rows));
            out.push_str(&format!("  Target rows:         {}\n", table.target_rows));
            out.push_str(&format!("  Rows not in target:  {}\n", table.rows_not_in_target));
            out.push_str(&format!("  Rows not in source:  {}\n", table.rows_not_in_source));
            out.push_str(&format!("  Field mismatches:    {}\n", table.fields_mismatch));
            out.push_str(&format!(
                "  Checksums:           {} / {} ({})\n",
                table.source_checksum.as_deref().map(short_hash).unwrap_or("-"),
                table.target_checksum.as_deref().map(short_hash).unwrap_or("-"),
                if table.checksum_match { "match" } else { "differ" }
            ));
            if !table.columns_only_in_source.is_empty() {
                out.push_str(&format!("  Only in source:      {}\n", table.columns_only_in_source.join(", ")));
            }
            if !table.columns_only_in_target.is_empty() {
                out.push_str(&format!("  Only in target:      {}\n", table.columns_only_in_target.join(", ")));
            }
            write_samples(&mut out, "Sample rows not in target", &table.samples.not_in_target);
            write_samples(&mut out, "Sample rows not in source", &table.samples.not_in_source);
            write_samples(&mut out, "Sample field mismatches", &table.samples.fields_mismatch);
        }

        if !self.cancelled_tables.is_empty() {
            out.push_str(&format!("\nCANCELLED TABLES: {}\n", self.cancelled_tables.join(", ")));
        }

        out.push_str("\nSUMMARY\n-------\n");
        out.push_str(&format!(
            "{:<30} {:>10} {:>10} {:>10} {:>10} {:>10}  {}\n",
            "Table", "Source", "Target", "NotInTgt", "NotInSrc", "Mismatch", "Result"
        ));
        for table in &self.tables {
            let result = if table.is_failed() {
                "failed"
            } else if table.has_differences {
                "differences"
            } else {
                "match"
            };
            out.push_str(&format!(
                "{:<30} {:>10} {:>10} {:>10} {:>10} {:>10}  {}\n",
                table.table_name,
                table.source_rows,
                table.target_rows,
                table.rows_not_in_target,
                table.rows_not_in_source,
                table.fields_mismatch,
                result
            ));
        }
        let s = &self.summary;
        out.push_str(&format!(
            "\nTables: {} total, {} completed, {} failed, {} cancelled, {} with differences\n",
            s.total_tables, s.tables_completed, s.tables_failed, s.tables_cancelled, s.tables_with_differences
        ));
        out.push_str(&format!(
            "Rows: {} source, {} target, {} not in target, {} not in source, {} mismatched\n",
            s.total_source_rows, s.total_target_rows, s.total_rows_not_in_target, s.total_rows_not_in_source, s.total_fields_mismatch
        ));
        out
    }

    /// Gzip-compressed report plus event log.
    pub fn artifact(&self) -> ShiftResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.formatted_report().as_bytes())?;
        encoder.write_all(b"\nEVENT LOG\n---------\n")?;
        for event in &self.events {
            encoder.write_all(event.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        Ok(encoder.finish()?)
    }

    pub fn artifact_name(&self) -> String {
        format!("{}.log.gz", self.run_id)
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

fn describe_map(map: &std::collections::BTreeMap<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_samples(out: &mut String, title: &str, samples: &[DiffRecord]) {
    if samples.is_empty() {
        return;
    }
    out.push_str(&format!("  {}:\n", title));
    for sample in samples {
        let key = describe_map(&sample.key);
        if sample.fields.is_empty() {
            let row = sample.source.as_ref().or(sample.target.as_ref()).map(describe_map).unwrap_or_default();
            out.push_str(&format!("    [{}] {}\n", key, row));
        } else {
            let fields: Vec<String> = sample
                .fields
                .iter()
                .map(|f| format!("{}: '{}' vs '{}'", f.column, f.source, f.target))
                .collect();
            out.push_str(&format!("    [{}] {}\n", key, fields.join("; ")));
        }
    }
}
