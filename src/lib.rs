//! # dbshift: Teradata to DB2 migration toolkit
//!
//! > **Convert the SQL. Prove the data.**
//!
//! dbshift translates Teradata SQL and stored procedures to DB2 and checks
//! that migrated tables hold the same rows as their source.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use dbshift::prelude::*;
//!
//! // Translate a Teradata statement
//! let result = dbshift::translate("SEL a, b FROM t;")?;
//! assert_eq!(result.target_sql, "SELECT a, b FROM t;");
//!
//! // Reconcile two key-ordered row streams
//! let report = Reconciler::new(ReconcileOptions::new(vec!["id".into()]))
//!     .reconcile("T", "T", source, target, None, &CancellationToken::new())
//!     .await?;
//! ```
//!
//! ## Pieces
//!
//! | Module       | Function                                         |
//! |--------------|--------------------------------------------------|
//! | `translator` | Teradata → DB2 rewrite with per-line issues      |
//! | `schema`     | Table pairing across schemas, key suggestion     |
//! | `reconcile`  | Merge-join row comparison with samples           |
//! | `runner`     | Bounded, cancellable runs over many tables       |
//! | `report`     | Run state, summaries, text report, artifacts     |
//! | `server`     | HTTP API under `/api`                            |

pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod reconcile;
pub mod report;
pub mod runner;
pub mod schema;
pub mod server;
pub mod translator;

pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::engine::{Connector, ConnectorFactory, RowRequest};
    pub use crate::error::*;
    pub use crate::memory::{MemoryCatalog, MemoryConnector, MemoryTable};
    pub use crate::reconcile::{
        DiffRecord, DiffSink, Predicate, Projection, ReconcileOptions, Reconciler, Row, RowSource,
        TableReconciliation, Value, VecSource,
    };
    pub use crate::report::{RunStatus, RunStore, TableValidationResult, ValidationRun};
    pub use crate::runner::{RunnerSettings, ValidationPlan, ValidationRunner};
    pub use crate::schema::{
        ColumnInfo, DatabaseConnectionConfig, DbType, SchemaMatch, SchemaMatcher, TableInfo, TableMatch,
    };
    pub use crate::translator::{ConversionRequest, ConversionResult, Issue, Severity, Translator};
    pub use tokio_util::sync::CancellationToken;
}

/// Translate Teradata SQL text to DB2.
///
/// # Example
///
/// ```
/// let result = dbshift::translate("SEL a FROM t;").unwrap();
/// assert_eq!(result.target_sql, "SELECT a FROM t;");
/// ```
pub fn translate(source_sql: &str) -> error::ShiftResult<translator::ConversionResult> {
    translator::Translator::new().translate(source_sql)
}
