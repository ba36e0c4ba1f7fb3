//! Error types for dbshift.

use thiserror::Error;

/// Which side of a table comparison an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// The main error type for dbshift operations.
#[derive(Debug, Error)]
pub enum ShiftError {
    /// Source or target unreachable, or credentials rejected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The translator could not tokenize its input at all.
    #[error("Translation error at line {line}: {message}")]
    Translation { line: usize, message: String },

    /// No matching table or column was found.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The chosen key columns do not uniquely identify rows.
    #[error("Key columns ({key}) do not uniquely identify rows in {side} table {table}: duplicate key {duplicate}")]
    KeyUniqueness {
        table: String,
        side: Side,
        key: String,
        duplicate: String,
    },

    /// A row stream was not ordered by its key columns.
    #[error("Rows of {side} table {table} are not ordered by key: {found} after {previous}")]
    KeyOrder {
        table: String,
        side: Side,
        previous: String,
        found: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A run, table or artifact that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Statement execution failed on a live connection.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The operation was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Illegal run state change.
    #[error("Invalid run transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShiftError {
    /// Create a translation error at the given line.
    pub fn translation(line: usize, message: impl Into<String>) -> Self {
        Self::Translation {
            line,
            message: message.into(),
        }
    }

    /// Create a key uniqueness error.
    pub fn duplicate_key(
        table: impl Into<String>,
        side: Side,
        key_columns: &[String],
        duplicate: impl Into<String>,
    ) -> Self {
        Self::KeyUniqueness {
            table: table.into(),
            side,
            key: key_columns.join(", "),
            duplicate: duplicate.into(),
        }
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Translation { .. } => "TRANSLATION_ERROR",
            Self::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            Self::KeyUniqueness { .. } => "KEY_UNIQUENESS",
            Self::KeyOrder { .. } => "KEY_ORDER",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Connection(_) => 502,
            Self::Translation { .. } => 400,
            Self::SchemaMismatch(_) => 404,
            Self::KeyUniqueness { .. } => 422,
            Self::KeyOrder { .. } => 422,
            Self::Config(_) => 400,
            Self::InvalidRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Execution(_) => 400,
            Self::Cancelled(_) => 409,
            Self::InvalidTransition { .. } => 409,
            Self::Io(_) => 500,
            Self::Json(_) => 500,
        }
    }
}

/// Result type alias for dbshift operations.
pub type ShiftResult<T> = Result<T, ShiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShiftError::translation(3, "unterminated string literal");
        assert_eq!(
            err.to_string(),
            "Translation error at line 3: unterminated string literal"
        );
    }

    #[test]
    fn test_duplicate_key_message() {
        let err = ShiftError::duplicate_key(
            "ORDERS",
            Side::Source,
            &["ORDER_ID".to_string(), "LINE_NO".to_string()],
            "(7, 1)",
        );
        assert_eq!(err.code(), "KEY_UNIQUENESS");
        assert_eq!(err.status_code(), 422);
        assert!(err.to_string().contains("source table ORDERS"));
        assert!(err.to_string().contains("ORDER_ID, LINE_NO"));
    }
}
