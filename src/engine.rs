//! Database connectors.
//!
//! A [`Connector`] is a request- or run-scoped handle to one database. The
//! sqlx-backed implementation covers PostgreSQL, MySQL and SQLite through
//! the `Any` driver; the in-process catalog lives in [`crate::memory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Executor, Row as _};

use crate::error::{ShiftError, ShiftResult};
use crate::memory::{MemoryCatalog, MemoryConnector};
use crate::reconcile::source::key_positions;
use crate::reconcile::{ChannelSource, Row, RowSource, Value};
use crate::schema::{ColumnInfo, DatabaseConnectionConfig, DbType};

/// What to stream from a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRequest {
    pub schema: String,
    pub table: String,
    pub key_columns: Vec<String>,
    pub batch_size: usize,
}

impl RowRequest {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, key_columns: Vec<String>, batch_size: usize) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            key_columns,
            batch_size: batch_size.max(1),
        }
    }
}

/// Result of running SQL text on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub rows_affected: u64,
    pub output: String,
}

/// Operations the service needs from a database.
#[async_trait]
pub trait Connector: Send + Sync {
    fn db_type(&self) -> DbType;

    /// Check the connection is usable.
    async fn validate(&self) -> ShiftResult<()>;

    async fn list_schemas(&self) -> ShiftResult<Vec<String>>;

    async fn list_tables(&self, schema: &str) -> ShiftResult<Vec<String>>;

    /// Columns in catalog order, with key and uniqueness flags where known.
    async fn list_columns(&self, schema: &str, table: &str) -> ShiftResult<Vec<ColumnInfo>>;

    /// Stream all rows ordered by `key_columns` (canonical text, binary
    /// collation, NULLs first).
    async fn open_rows(&self, request: &RowRequest) -> ShiftResult<Box<dyn RowSource>>;

    /// Run SQL text (one or more statements).
    async fn execute(&self, sql: &str) -> ShiftResult<ExecutionOutcome>;
}

/// Opens connectors from connection configs.
#[derive(Clone)]
pub struct ConnectorFactory {
    memory: Arc<MemoryCatalog>,
    connect_timeout: Duration,
}

impl ConnectorFactory {
    pub fn new(memory: Arc<MemoryCatalog>, connect_timeout: Duration) -> Self {
        Self {
            memory,
            connect_timeout,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryCatalog> {
        &self.memory
    }

    pub async fn connect(&self, config: &DatabaseConnectionConfig) -> ShiftResult<Arc<dyn Connector>> {
        config.validate()?;
        tracing::debug!(target_db = %config.describe(), "opening connection");
        match config.db_type {
            DbType::Memory => Ok(Arc::new(MemoryConnector::open(Arc::clone(&self.memory), &config.database)?)),
            _ => Ok(Arc::new(SqlxConnector::connect(config, self.connect_timeout).await?)),
        }
    }
}

/// PostgreSQL, MySQL or SQLite through sqlx.
#[derive(Clone)]
pub struct SqlxConnector {
    db_type: DbType,
    pool: AnyPool,
}

impl SqlxConnector {
    pub async fn connect(config: &DatabaseConnectionConfig, timeout: Duration) -> ShiftResult<Self> {
        let url = config.connection_url()?;
        sqlx::any::install_default_drivers();

        let connecting = AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(timeout)
            .connect(&url);
        let pool = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ShiftError::Connection(format!("timed out connecting to {}", config.describe())))?
            .map_err(|e| ShiftError::Connection(format!("{}: {}", config.describe(), e)))?;

        Ok(Self {
            db_type: config.db_type,
            pool,
        })
    }

    /// Close pooled connections now instead of on drop.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn quote(&self, ident: &str) -> String {
        match self.db_type {
            DbType::Mysql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn qualified(&self, schema: &str, table: &str) -> String {
        if schema.is_empty() || (self.db_type == DbType::Sqlite && schema.eq_ignore_ascii_case("main")) {
            self.quote(table)
        } else {
            format!("{}.{}", self.quote(schema), self.quote(table))
        }
    }

    fn as_text(&self, expr: &str) -> String {
        match self.db_type {
            DbType::Mysql => format!("CAST({} AS CHAR)", expr),
            _ => format!("CAST({} AS TEXT)", expr),
        }
    }

    fn order_key(&self, column: &str) -> String {
        let quoted = self.quote(column);
        match self.db_type {
            DbType::Postgres => format!("CAST({} AS TEXT) COLLATE \"C\" NULLS FIRST", quoted),
            DbType::Mysql => format!("CAST({} AS BINARY)", quoted),
            _ => format!("CAST({} AS TEXT)", quoted),
        }
    }

    /// Every column as text, ordered by the key columns.
    fn row_query(&self, schema: &str, table: &str, columns: &[String], keys: &[String]) -> String {
        let select: Vec<String> = columns.iter().map(|c| self.as_text(&self.quote(c))).collect();
        let order: Vec<String> = keys.iter().map(|k| self.order_key(k)).collect();
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            select.join(", "),
            self.qualified(schema, table),
            order.join(", ")
        )
    }

    async fn fetch_strings(&self, sql: &str) -> ShiftResult<Vec<Vec<Option<String>>>> {
        let rows: Vec<AnyRow> = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ShiftError::Execution(e.to_string()))?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map_err(|e| ShiftError::Execution(e.to_string())))
                    .collect()
            })
            .collect()
    }

    async fn first_column(&self, sql: &str) -> ShiftResult<Vec<String>> {
        Ok(self
            .fetch_strings(sql)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn decode_row(row: &AnyRow, width: usize) -> ShiftResult<Row> {
    (0..width)
        .map(|i| {
            row.try_get::<Option<String>, _>(i)
                .map(Value::from)
                .map_err(|e| ShiftError::Execution(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl Connector for SqlxConnector {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    async fn validate(&self) -> ShiftResult<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| ShiftError::Connection(e.to_string()))
    }

    async fn list_schemas(&self) -> ShiftResult<Vec<String>> {
        match self.db_type {
            DbType::Sqlite => Ok(vec!["main".to_string()]),
            DbType::Mysql => {
                self.first_column(
                    "SELECT CAST(schema_name AS CHAR) FROM information_schema.schemata \
                     WHERE schema_name NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
                     ORDER BY schema_name",
                )
                .await
            }
            _ => {
                self.first_column(
                    "SELECT CAST(schema_name AS TEXT) FROM information_schema.schemata \
                     WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
                     AND schema_name NOT LIKE 'pg_toast%' AND schema_name NOT LIKE 'pg_temp%' \
                     ORDER BY schema_name",
                )
                .await
            }
        }
    }

    async fn list_tables(&self, schema: &str) -> ShiftResult<Vec<String>> {
        let sql = match self.db_type {
            DbType::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' \
                               AND name NOT LIKE 'sqlite_%' ORDER BY name"
                .to_string(),
            _ => format!(
                "SELECT {} FROM information_schema.tables WHERE table_schema = {} \
                 AND table_type = 'BASE TABLE' ORDER BY table_name",
                self.as_text("table_name"),
                literal(schema)
            ),
        };
        self.first_column(&sql).await
    }

    async fn list_columns(&self, schema: &str, table: &str) -> ShiftResult<Vec<ColumnInfo>> {
        if self.db_type == DbType::Sqlite {
            let sql = format!(
                "SELECT name, type, CAST(\"notnull\" AS TEXT), CAST(pk AS TEXT) FROM pragma_table_info({}) ORDER BY cid",
                literal(table)
            );
            return Ok(self
                .fetch_strings(&sql)
                .await?
                .into_iter()
                .map(|row| {
                    let field = |i: usize| row.get(i).cloned().flatten().unwrap_or_default();
                    ColumnInfo {
                        name: field(0),
                        data_type: field(1),
                        nullable: field(2) == "0",
                        primary_key: field(3) != "0" && !field(3).is_empty(),
                        unique: false,
                    }
                })
                .collect());
        }

        let columns_sql = format!(
            "SELECT {}, {}, {} FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
            self.as_text("column_name"),
            self.as_text("data_type"),
            self.as_text("is_nullable"),
            literal(schema),
            literal(table)
        );
        let constraints_sql = format!(
            "SELECT {}, {} FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
             ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             AND tc.table_name = kcu.table_name \
             WHERE tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') \
             AND tc.table_schema = {} AND tc.table_name = {}",
            self.as_text("kcu.column_name"),
            self.as_text("tc.constraint_type"),
            literal(schema),
            literal(table)
        );

        let constraints = self.fetch_strings(&constraints_sql).await?;
        let flagged = |column: &str, kind: &str| {
            constraints.iter().any(|row| {
                row.first().cloned().flatten().as_deref() == Some(column)
                    && row.get(1).cloned().flatten().as_deref() == Some(kind)
            })
        };

        Ok(self
            .fetch_strings(&columns_sql)
            .await?
            .into_iter()
            .map(|row| {
                let field = |i: usize| row.get(i).cloned().flatten().unwrap_or_default();
                let name = field(0);
                ColumnInfo {
                    primary_key: flagged(&name, "PRIMARY KEY"),
                    unique: flagged(&name, "UNIQUE"),
                    data_type: field(1),
                    nullable: field(2).eq_ignore_ascii_case("YES"),
                    name,
                }
            })
            .collect())
    }

    async fn open_rows(&self, request: &RowRequest) -> ShiftResult<Box<dyn RowSource>> {
        let columns = self.list_columns(&request.schema, &request.table).await?;
        if columns.is_empty() {
            return Err(ShiftError::SchemaMismatch(format!(
                "table {}.{} does not exist or has no columns",
                request.schema, request.table
            )));
        }
        let names: Vec<String> = columns.into_iter().map(|c| c.name).collect();
        let keys: Vec<String> = key_positions(&names, &request.key_columns)?
            .into_iter()
            .map(|i| names[i].clone())
            .collect();
        let sql = self.row_query(&request.schema, &request.table, &names, &keys);
        tracing::debug!(table = %request.table, %sql, "streaming rows");

        let width = names.len();
        let batch_size = request.batch_size.max(1);
        let (sender, source) = ChannelSource::channel(names, 2);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut stream = sqlx::query(&sql).fetch(&pool);
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(next) = stream.next().await {
                let row = next
                    .map_err(|e| ShiftError::Execution(e.to_string()))
                    .and_then(|row| decode_row(&row, width));
                match row {
                    Ok(row) => {
                        batch.push(row);
                        if batch.len() >= batch_size {
                            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                            if sender.send(Ok(full)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = sender.send(Err(e)).await;
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = sender.send(Ok(batch)).await;
            }
        });

        Ok(Box::new(source))
    }

    async fn execute(&self, sql: &str) -> ShiftResult<ExecutionOutcome> {
        let text = sql.trim().trim_end_matches('@').trim_end();
        if text.is_empty() {
            return Err(ShiftError::InvalidRequest("no SQL to execute".to_string()));
        }
        let result = (&self.pool)
            .execute(text)
            .await
            .map_err(|e| ShiftError::Execution(e.to_string()))?;
        Ok(ExecutionOutcome {
            rows_affected: result.rows_affected(),
            output: format!(
                "Statement executed successfully on {} ({} row(s) affected)",
                self.db_type,
                result.rows_affected()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite() -> SqlxConnector {
        sqlx::any::install_default_drivers();
        SqlxConnector {
            db_type: DbType::Sqlite,
            pool: AnyPoolOptions::new().connect_lazy("sqlite::memory:").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_row_query_orders_by_text() {
        let connector = sqlite();
        let sql = connector.row_query("main", "orders", &["ID".to_string(), "NAME".to_string()], &["ID".to_string()]);
        assert_eq!(
            sql,
            "SELECT CAST(\"ID\" AS TEXT), CAST(\"NAME\" AS TEXT) FROM \"orders\" ORDER BY CAST(\"ID\" AS TEXT)"
        );
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(literal("o'brien"), "'o''brien'");
    }

    #[tokio::test]
    async fn test_unsupported_driver() {
        let mut config = DatabaseConnectionConfig::new(DbType::Db2, "SAMPLE");
        config.host = "db2.local".to_string();
        let err = SqlxConnector::connect(&config, Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, ShiftError::Connection(_)));
    }
}
