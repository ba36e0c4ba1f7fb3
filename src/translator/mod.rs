//! Teradata to DB2 dialect translator.
//!
//! ```
//! use dbshift::translator::{ConversionRequest, Translator};
//!
//! let result = Translator::new()
//!     .convert(&ConversionRequest::new("SEL a,b FROM t;"))
//!     .unwrap();
//! assert_eq!(result.target_sql, "SELECT a,b FROM t;");
//! assert_eq!(result.issues[0].line, 1);
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod procedure;
pub mod rewrite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ShiftError, ShiftResult};

pub use procedure::SAMPLE_PROCEDURE;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Teradata,
    Db2,
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Teradata => write!(f, "Teradata"),
            SqlDialect::Db2 => write!(f, "Db2"),
        }
    }
}

impl FromStr for SqlDialect {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teradata" | "td" => Ok(SqlDialect::Teradata),
            "db2" | "ibm db2" | "db2luw" => Ok(SqlDialect::Db2),
            other => Err(ShiftError::InvalidRequest(format!("unknown SQL dialect '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A finding attached to a 1-based line of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub line: usize,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

fn default_target() -> SqlDialect {
    SqlDialect::Db2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub source_sql: String,
    #[serde(default)]
    pub source_dialect: SqlDialect,
    #[serde(default = "default_target")]
    pub target_dialect: SqlDialect,
    /// End procedure definitions with `@` (DB2 CLP convention).
    #[serde(default)]
    pub procedure_terminator: bool,
}

impl ConversionRequest {
    /// Teradata to DB2 request.
    pub fn new(source_sql: impl Into<String>) -> Self {
        Self {
            source_sql: source_sql.into(),
            source_dialect: SqlDialect::Teradata,
            target_dialect: SqlDialect::Db2,
            procedure_terminator: false,
        }
    }

    pub fn with_procedure_terminator(mut self, enabled: bool) -> Self {
        self.procedure_terminator = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub target_sql: String,
    /// Ordered by line, then by the order the rules fired.
    pub issues: Vec<Issue>,
    /// False only when a construct was left behind an `UNSUPPORTED` marker.
    pub success: bool,
}

impl ConversionResult {
    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    /// Plain-text conversion report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str("SQL CONVERSION REPORT\n");
        out.push_str("=====================\n");
        out.push_str(&format!(
            "Status: {}\n",
            if self.success { "converted" } else { "manual review required" }
        ));
        out.push_str(&format!(
            "Warnings: {}  Errors: {}\n",
            self.warnings().count(),
            self.errors().count()
        ));

        let sections = [
            ("Applied conversions", Severity::Warning),
            ("Manual review", Severity::Error),
        ];
        for (title, severity) in sections {
            let issues: Vec<&Issue> = self.issues.iter().filter(|i| i.severity == severity).collect();
            if issues.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{}:\n", title));
            for issue in issues {
                out.push_str(&format!("  line {}: {}", issue.line, issue.message));
                if let Some(solution) = &issue.solution {
                    out.push_str(&format!(" ({})", solution));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Stateless dialect translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Translator;

impl Translator {
    pub fn new() -> Self {
        Self
    }

    /// Convert a script. Only tokenizer failures (unterminated strings or
    /// comments) and unsupported dialect pairs are errors; everything else is
    /// reported through [`Issue`]s.
    pub fn convert(&self, request: &ConversionRequest) -> ShiftResult<ConversionResult> {
        match (request.source_dialect, request.target_dialect) {
            (from, to) if from == to => {
                return Ok(ConversionResult {
                    target_sql: request.source_sql.clone(),
                    issues: Vec::new(),
                    success: true,
                });
            }
            (SqlDialect::Teradata, SqlDialect::Db2) => {}
            (from, to) => {
                return Err(ShiftError::InvalidRequest(format!(
                    "conversion from {} to {} is not supported",
                    from, to
                )));
            }
        }

        let mut script = parser::parse(&request.source_sql)?;
        let mut rewriter = rewrite::Rewriter::new();
        for statement in &mut script.statements {
            rewriter.rewrite_statement(statement);
            if request.procedure_terminator {
                procedure::terminate(statement);
            }
        }

        let (mut issues, unsupported) = rewriter.finish();
        issues.sort_by_key(|issue| issue.line);
        let target_sql = script.render();

        tracing::debug!(
            statements = script.statements.len(),
            issues = issues.len(),
            unsupported,
            "converted script"
        );

        Ok(ConversionResult {
            target_sql,
            issues,
            success: unsupported == 0,
        })
    }

    /// Teradata to DB2 with default options.
    pub fn translate(&self, source_sql: &str) -> ShiftResult<ConversionResult> {
        self.convert(&ConversionRequest::new(source_sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_input() {
        let result = Translator::new().translate("").unwrap();
        assert_eq!(result.target_sql, "");
        assert!(result.issues.is_empty());
        assert!(result.success);
    }

    #[test]
    fn test_issues_sorted_by_line() {
        let result = Translator::new()
            .translate("SELECT a\nFROM t\nSAMPLE 5;\nSEL b FROM u;")
            .unwrap();
        let lines: Vec<usize> = result.issues.iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![3, 4]);
        assert!(!result.success);
    }

    #[test]
    fn test_same_dialect_is_identity() {
        let request = ConversionRequest {
            source_sql: "SEL 1".to_string(),
            source_dialect: SqlDialect::Db2,
            target_dialect: SqlDialect::Db2,
            procedure_terminator: false,
        };
        let result = Translator::new().convert(&request).unwrap();
        assert_eq!(result.target_sql, "SEL 1");
    }

    #[test]
    fn test_unsupported_pair() {
        let request = ConversionRequest {
            source_sql: "SELECT 1".to_string(),
            source_dialect: SqlDialect::Db2,
            target_dialect: SqlDialect::Teradata,
            procedure_terminator: false,
        };
        assert!(Translator::new().convert(&request).is_err());
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("teradata".parse::<SqlDialect>().unwrap(), SqlDialect::Teradata);
        assert_eq!("DB2".parse::<SqlDialect>().unwrap(), SqlDialect::Db2);
        assert!("oracle".parse::<SqlDialect>().is_err());
    }

    #[test]
    fn test_report_lists_issues() {
        let result = Translator::new().translate("SEL a FROM t SAMPLE 5;").unwrap();
        let report = result.report();
        assert!(report.contains("manual review required"));
        assert!(report.contains("line 1: SEL abbreviation is not supported in Db2 (Converted SEL to SELECT)"));
        assert!(report.contains("SAMPLE clause"));
    }
}
