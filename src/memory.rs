//! In-process catalog of tables, addressed as `memory://<database>`.
//!
//! Used for offline runs, demos and tests. Identifier lookup is
//! case-insensitive.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{Connector, ExecutionOutcome, RowRequest};
use crate::error::{ShiftError, ShiftResult};
use crate::reconcile::{Row, RowSource, VecSource};
use crate::schema::{ColumnInfo, DbType};
use crate::translator::parser;

/// A table held in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

type Schemas = BTreeMap<String, BTreeMap<String, MemoryTable>>;

/// Databases, schemas and tables.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    databases: RwLock<BTreeMap<String, Schemas>>,
    executed: Mutex<Vec<String>>,
    batch_delay: Option<Duration>,
}

fn find<'a, V>(map: &'a BTreeMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every batch; makes long-running tables observable.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    pub fn create_database(&self, database: &str) {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        databases.entry(database.to_string()).or_default();
    }

    pub fn insert_table(&self, database: &str, schema: &str, name: &str, table: MemoryTable) {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        databases
            .entry(database.to_string())
            .or_default()
            .entry(schema.to_string())
            .or_default()
            .insert(name.to_string(), table);
    }

    pub fn has_database(&self, database: &str) -> bool {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        find(&databases, database).is_some()
    }

    /// SQL text accepted by [`Connector::execute`], oldest first.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn with_database<T>(&self, database: &str, f: impl FnOnce(&Schemas) -> T) -> ShiftResult<T> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        find(&databases, database)
            .map(f)
            .ok_or_else(|| ShiftError::Connection(format!("memory database '{}' does not exist", database)))
    }

    fn table(&self, database: &str, schema: &str, table: &str) -> ShiftResult<MemoryTable> {
        self.with_database(database, |schemas| {
            find(schemas, schema).and_then(|tables| find(tables, table)).cloned()
        })?
        .ok_or_else(|| ShiftError::SchemaMismatch(format!("table {}.{} does not exist", schema, table)))
    }
}

/// Connector over one database of a [`MemoryCatalog`].
pub struct MemoryConnector {
    catalog: Arc<MemoryCatalog>,
    database: String,
}

impl MemoryConnector {
    pub fn open(catalog: Arc<MemoryCatalog>, database: &str) -> ShiftResult<Self> {
        if !catalog.has_database(database) {
            return Err(ShiftError::Connection(format!(
                "memory database '{}' does not exist",
                database
            )));
        }
        Ok(Self {
            catalog,
            database: database.to_string(),
        })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn db_type(&self) -> DbType {
        DbType::Memory
    }

    async fn validate(&self) -> ShiftResult<()> {
        self.catalog.with_database(&self.database, |_| ())
    }

    async fn list_schemas(&self) -> ShiftResult<Vec<String>> {
        self.catalog
            .with_database(&self.database, |schemas| schemas.keys().cloned().collect())
    }

    async fn list_tables(&self, schema: &str) -> ShiftResult<Vec<String>> {
        self.catalog.with_database(&self.database, |schemas| {
            find(schemas, schema)
                .map(|tables| tables.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn list_columns(&self, schema: &str, table: &str) -> ShiftResult<Vec<ColumnInfo>> {
        Ok(self.catalog.table(&self.database, schema, table)?.columns)
    }

    async fn open_rows(&self, request: &RowRequest) -> ShiftResult<Box<dyn RowSource>> {
        let table = self.catalog.table(&self.database, &request.schema, &request.table)?;
        let names = table.column_names();
        let mut source = VecSource::sorted(names, table.rows, &request.key_columns, request.batch_size)?;
        if let Some(delay) = self.catalog.batch_delay {
            source = source.with_delay(delay);
        }
        Ok(Box::new(source))
    }

    /// Statements are checked lexically and recorded, not run.
    async fn execute(&self, sql: &str) -> ShiftResult<ExecutionOutcome> {
        let text = sql.trim().trim_end_matches('@').trim_end();
        let script = parser::parse(text).map_err(|e| ShiftError::Execution(e.to_string()))?;
        let statements = script.statements.iter().filter(|s| !s.is_blank()).count();
        if statements == 0 {
            return Err(ShiftError::InvalidRequest("no SQL to execute".to_string()));
        }
        self.catalog
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        Ok(ExecutionOutcome {
            rows_affected: 0,
            output: format!("{} statement(s) accepted by memory database {}", statements, self.database),
        })
    }
}
