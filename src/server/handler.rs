//! HTTP request handlers.
//!
//! Request bodies use the field names the web UI sends (`sourceSchema`,
//! `source_db`, `keys` as text or list). Retrieval endpoints take an
//! optional `run_id` query parameter and default to the latest run.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::engine::{Connector, ExecutionOutcome};
use crate::error::ShiftError;
use crate::reconcile::{DiffCategory, DiffRecord, Projection};
use crate::report::{RunListing, RunStatus, RunSummary, TableStatus, ValidationRun};
use crate::runner::ValidationPlan;
use crate::schema::{ColumnInfo, DatabaseConnectionConfig, SchemaMatch, TableMatch};
use crate::translator::{ConversionRequest, Issue, SAMPLE_PROCEDURE};

type Payload<T> = Result<Json<T>, JsonRejection>;

// ============================================================================
// Request types
// ============================================================================

/// Column names as a comma-separated string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnList {
    Text(String),
    List(Vec<String>),
}

impl ColumnList {
    pub fn into_vec(self) -> Vec<String> {
        let items = match self {
            ColumnList::Text(text) => text.split(',').map(str::to_string).collect(),
            ColumnList::List(items) => items,
        };
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn columns(list: Option<ColumnList>) -> Vec<String> {
    list.map(ColumnList::into_vec).unwrap_or_default()
}

/// A connection plus the schema/table being browsed.
#[derive(Debug, Deserialize)]
pub struct ConnectionRequest {
    #[serde(flatten)]
    pub connection: DatabaseConnectionConfig,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    pub source_db: Option<DatabaseConnectionConfig>,
    pub target_db: Option<DatabaseConnectionConfig>,
    #[serde(rename = "sourceSchema", alias = "source_schema")]
    pub source_schema: Option<String>,
    #[serde(rename = "targetSchema", alias = "target_schema")]
    pub target_schema: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunValidationRequest {
    pub source_db: Option<DatabaseConnectionConfig>,
    pub target_db: Option<DatabaseConnectionConfig>,
    #[serde(rename = "sourceSchema", alias = "source_schema")]
    pub source_schema: Option<String>,
    #[serde(rename = "targetSchema", alias = "target_schema")]
    pub target_schema: Option<String>,
    #[serde(rename = "sourceTable", alias = "source_table")]
    pub source_table: Option<String>,
    #[serde(rename = "targetTable", alias = "target_table")]
    pub target_table: Option<String>,
    pub keys: Option<ColumnList>,
    pub predicate: Option<String>,
    #[serde(rename = "includeColumns", alias = "include_fields", alias = "include_columns")]
    pub include: Option<ColumnList>,
    #[serde(rename = "excludeColumns", alias = "exclude_fields", alias = "exclude_columns")]
    pub exclude: Option<ColumnList>,
    #[serde(rename = "comparisonType", alias = "comparison_type")]
    pub comparison_type: Option<String>,
    pub matched_tables: Option<Vec<TableMatch>>,
    pub max_concurrent_tables: Option<usize>,
    /// Await the run regardless of its size.
    pub wait: Option<bool>,
}

impl RunValidationRequest {
    fn is_full(&self) -> bool {
        self.comparison_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("full"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunQuery {
    pub run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DetailsQuery {
    pub run_id: Option<String>,
    /// Cap on rows returned per category.
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    #[serde(alias = "source_sql", alias = "sql")]
    pub input_sql: Option<String>,
    pub procedure_terminator: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateSqlRequest {
    pub converted_sql: Option<String>,
    pub target_db: Option<DatabaseConnectionConfig>,
}

fn require(fields: &[(&str, bool)]) -> ApiResult<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, present)| !present)
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )))
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemasResponse {
    pub success: bool,
    pub schemas: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TablesResponse {
    pub success: bool,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ColumnsResponse {
    pub success: bool,
    pub columns: Vec<String>,
    pub column_info: Vec<ColumnInfo>,
}

#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: SchemaMatch,
}

#[derive(Debug, Serialize)]
pub struct RunStartedResponse {
    pub success: bool,
    pub run_id: String,
    pub status: RunStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(flatten)]
    pub run: ValidationRun,
}

#[derive(Debug, Serialize)]
pub struct TableOverview {
    pub table_name: String,
    pub source_table: String,
    pub target_table: String,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source_rows: u64,
    pub target_rows: u64,
    pub rows_not_in_target: u64,
    pub rows_not_in_source: u64,
    pub fields_mismatch: u64,
    pub has_differences: bool,
    pub checksum_match: bool,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub success: bool,
    pub run_id: String,
    pub status: RunStatus,
    pub source_schema: String,
    pub target_schema: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub tables: Vec<TableOverview>,
    pub cancelled_tables: Vec<String>,
}

impl From<&ValidationRun> for ReportResponse {
    fn from(run: &ValidationRun) -> Self {
        Self {
            success: true,
            run_id: run.run_id.clone(),
            status: run.status,
            source_schema: run.source_schema.clone(),
            target_schema: run.target_schema.clone(),
            start_time: run.start_time,
            end_time: run.end_time,
            summary: run.summary.clone(),
            tables: run
                .tables
                .iter()
                .map(|t| TableOverview {
                    table_name: t.table_name.clone(),
                    source_table: t.source_table.clone(),
                    target_table: t.target_table.clone(),
                    status: t.status,
                    error: t.error.clone(),
                    source_rows: t.source_rows,
                    target_rows: t.target_rows,
                    rows_not_in_target: t.rows_not_in_target,
                    rows_not_in_source: t.rows_not_in_source,
                    fields_mismatch: t.fields_mismatch,
                    has_differences: t.has_differences,
                    checksum_match: t.checksum_match,
                })
                .collect(),
            cancelled_tables: run.cancelled_tables.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FormattedReportResponse {
    pub success: bool,
    pub run_id: String,
    pub formatted_report: String,
}

#[derive(Debug, Serialize)]
pub struct TableTimings {
    pub source_rows: u64,
    pub target_rows: u64,
    pub source_time: f64,
    pub target_time: f64,
}

#[derive(Debug, Serialize)]
pub struct DifferenceRows {
    pub count: u64,
    pub rows: Vec<DiffRecord>,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct DifferenceDetails {
    pub source_not_in_target: DifferenceRows,
    pub target_not_in_source: DifferenceRows,
    pub field_mismatches: DifferenceRows,
}

#[derive(Debug, Serialize)]
pub struct TableDetailsResponse {
    pub success: bool,
    pub run_id: String,
    pub table_name: String,
    pub source_table: String,
    pub target_table: String,
    pub summary: TableTimings,
    pub differences: DifferenceDetails,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub success: bool,
    pub runs: Vec<RunListing>,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub success: bool,
    pub input_sql: String,
    pub converted_sql: String,
    pub conversion_report: String,
    pub issues: Vec<Issue>,
    pub warnings: Vec<String>,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub conversion_id: String,
}

#[derive(Debug, Serialize)]
pub struct SampleResponse {
    pub success: bool,
    pub sample_sql: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceMessage {
    pub success: bool,
    pub message: String,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateSqlResponse {
    pub success: bool,
    pub db2_execution_success: bool,
    pub validation_output: String,
    pub error_message: String,
    pub validation_id: String,
    pub timestamp: DateTime<Utc>,
}

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "dbshift".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Connections and catalogs
// ============================================================================

async fn connect(state: &AppState, config: &DatabaseConnectionConfig) -> ApiResult<Arc<dyn Connector>> {
    Ok(state.factory.connect(config).await?)
}

pub async fn validate_connection(
    State(state): State<Arc<AppState>>,
    payload: Payload<ConnectionRequest>,
) -> ApiResult<Json<ValidateResponse>> {
    let Json(request) = payload?;
    let connector = connect(&state, &request.connection).await?;
    connector.validate().await?;
    tracing::info!(target_db = %request.connection.describe(), "connection validated");
    Ok(Json(ValidateResponse {
        success: true,
        message: Some(format!("Connected to {}", request.connection.describe())),
    }))
}

pub async fn list_schemas(
    State(state): State<Arc<AppState>>,
    payload: Payload<ConnectionRequest>,
) -> ApiResult<Json<SchemasResponse>> {
    let Json(request) = payload?;
    let connector = connect(&state, &request.connection).await?;
    let schemas = connector.list_schemas().await?;
    Ok(Json(SchemasResponse { success: true, schemas }))
}

pub async fn list_tables(
    State(state): State<Arc<AppState>>,
    payload: Payload<ConnectionRequest>,
) -> ApiResult<Json<TablesResponse>> {
    let Json(request) = payload?;
    let Some(schema) = request.schema.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(ApiError::bad_request("Missing schema name"));
    };
    let connector = connect(&state, &request.connection).await?;
    let tables = connector.list_tables(schema).await?;
    Ok(Json(TablesResponse { success: true, tables }))
}

pub async fn list_columns(
    State(state): State<Arc<AppState>>,
    payload: Payload<ConnectionRequest>,
) -> ApiResult<Json<ColumnsResponse>> {
    let Json(request) = payload?;
    if !present(&request.schema) || !present(&request.table) {
        return Err(ApiError::bad_request("Missing schema or table name"));
    }
    let schema = request.schema.as_deref().unwrap_or_default();
    let table = request.table.as_deref().unwrap_or_default();
    let connector = connect(&state, &request.connection).await?;
    let column_info = connector.list_columns(schema, table).await?;
    Ok(Json(ColumnsResponse {
        success: true,
        columns: column_info.iter().map(|c| c.name.clone()).collect(),
        column_info,
    }))
}

pub async fn discover_schema_tables(
    State(state): State<Arc<AppState>>,
    payload: Payload<DiscoverRequest>,
) -> ApiResult<Json<DiscoverResponse>> {
    let Json(request) = payload?;
    require(&[
        ("source_db", request.source_db.is_some()),
        ("target_db", request.target_db.is_some()),
        ("sourceSchema", present(&request.source_schema)),
        ("targetSchema", present(&request.target_schema)),
    ])?;
    let (Some(source_db), Some(target_db), Some(source_schema), Some(target_schema)) = (
        request.source_db.as_ref(),
        request.target_db.as_ref(),
        request.source_schema.as_deref(),
        request.target_schema.as_deref(),
    ) else {
        return Err(ApiError::bad_request("Missing required fields"));
    };

    let source = connect(&state, source_db).await?;
    let target = connect(&state, target_db).await?;
    let result = state
        .matcher
        .discover(source.as_ref(), source_schema, target.as_ref(), target_schema)
        .await?;
    Ok(Json(DiscoverResponse { success: true, result }))
}

// ============================================================================
// Validation runs
// ============================================================================

pub async fn run_validation(
    State(state): State<Arc<AppState>>,
    payload: Payload<RunValidationRequest>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let full = request.is_full();
    let mut required = vec![
        ("sourceSchema", present(&request.source_schema)),
        ("targetSchema", present(&request.target_schema)),
        ("keys", request.keys.is_some() || (full && request.matched_tables.is_some())),
    ];
    if !full {
        required.push(("sourceTable", present(&request.source_table)));
        required.push(("targetTable", present(&request.target_table)));
    }
    required.push(("source_db", request.source_db.is_some()));
    required.push(("target_db", request.target_db.is_some()));
    require(&required)?;

    let RunValidationRequest {
        source_db: Some(source_db),
        target_db: Some(target_db),
        source_schema: Some(source_schema),
        target_schema: Some(target_schema),
        source_table,
        target_table,
        keys,
        predicate,
        include,
        exclude,
        matched_tables,
        max_concurrent_tables,
        wait,
        ..
    } = request
    else {
        return Err(ApiError::bad_request("Missing required fields"));
    };
    let keys = columns(keys);

    let source = connect(&state, &source_db).await?;
    let target = connect(&state, &target_db).await?;

    let tables = if full {
        let matched = match matched_tables {
            Some(tables) => tables,
            None => {
                state
                    .matcher
                    .discover(source.as_ref(), &source_schema, target.as_ref(), &target_schema)
                    .await?
                    .matched_tables
            }
        };
        matched
            .into_iter()
            .map(|table| {
                if table.primary_keys.is_empty() && !keys.is_empty() {
                    table.with_primary_keys(keys.clone())
                } else {
                    table
                }
            })
            .collect()
    } else {
        vec![TableMatch::manual(
            source_table.unwrap_or_default(),
            target_table.unwrap_or_default(),
            keys,
        )]
    };

    let table_count = tables.len();
    let plan = ValidationPlan::new(source, source_schema, target, target_schema, tables)
        .with_predicate(predicate)
        .with_projection(Projection::new(columns(include), columns(exclude)))
        .with_max_concurrent_tables(max_concurrent_tables);

    let handle = state.runner.start(plan)?;
    let awaited = wait.unwrap_or(table_count <= state.config.sync_run_table_limit);
    if !awaited {
        return Ok(Json(RunStartedResponse {
            success: true,
            run_id: handle.run_id.clone(),
            status: RunStatus::Running,
            message: format!("Validation of {} tables started", table_count),
        })
        .into_response());
    }

    let run = handle.wait().await?;
    Ok(Json(RunResponse {
        success: run.status != RunStatus::Failed,
        run,
    })
    .into_response())
}

pub async fn validation_report(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> ApiResult<Json<ReportResponse>> {
    let Query(query) = query?;
    let run = state.runner.store().resolve(query.run_id.as_deref())?;
    Ok(Json(ReportResponse::from(&run)))
}

pub async fn validation_results_detailed(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> ApiResult<Json<RunResponse>> {
    let Query(query) = query?;
    let run = state.runner.store().resolve(query.run_id.as_deref())?;
    Ok(Json(RunResponse { success: true, run }))
}

pub async fn formatted_validation_report(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> ApiResult<Json<FormattedReportResponse>> {
    let Query(query) = query?;
    let run = state.runner.store().resolve(query.run_id.as_deref())?;
    Ok(Json(FormattedReportResponse {
        success: true,
        formatted_report: run.formatted_report(),
        run_id: run.run_id,
    }))
}

/// Rows per category returned by the table details endpoint unless `limit` is given.
pub const DEFAULT_DETAIL_ROWS: usize = 1000;

fn difference_rows(records: &[DiffRecord], category: DiffCategory, count: u64) -> DifferenceRows {
    let rows: Vec<DiffRecord> = records.iter().filter(|r| r.category == category).cloned().collect();
    DifferenceRows {
        count,
        truncated: (rows.len() as u64) < count,
        rows,
    }
}

pub async fn validation_table_details(
    State(state): State<Arc<AppState>>,
    table_name: Result<Path<String>, PathRejection>,
    query: Result<Query<DetailsQuery>, QueryRejection>,
) -> ApiResult<Json<TableDetailsResponse>> {
    let Path(table_name) = table_name?;
    let Query(query) = query?;
    let store = state.runner.store();
    let run = store.resolve(query.run_id.as_deref())?;
    let Some(table) = run.table(&table_name) else {
        return Err(ApiError(ShiftError::NotFound(format!(
            "Table {} not found in validation results",
            table_name
        ))));
    };
    let limit = query.limit.unwrap_or(DEFAULT_DETAIL_ROWS);
    let records = store.table_details(&run.run_id, &table.table_name, Some(limit))?;

    Ok(Json(TableDetailsResponse {
        success: true,
        run_id: run.run_id.clone(),
        table_name: table.table_name.clone(),
        source_table: table.source_table.clone(),
        target_table: table.target_table.clone(),
        summary: TableTimings {
            source_rows: table.source_rows,
            target_rows: table.target_rows,
            source_time: table.source_seconds,
            target_time: table.target_seconds,
        },
        differences: DifferenceDetails {
            source_not_in_target: difference_rows(&records, DiffCategory::NotInTarget, table.rows_not_in_target),
            target_not_in_source: difference_rows(&records, DiffCategory::NotInSource, table.rows_not_in_source),
            field_mismatches: difference_rows(&records, DiffCategory::FieldsMismatch, table.fields_mismatch),
        },
    }))
}

pub async fn download_report(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let run = state.runner.store().resolve(query.run_id.as_deref())?;
    let artifact = run.artifact()?;
    let disposition = format!("attachment; filename=\"{}\"", run.artifact_name());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact,
    )
        .into_response())
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<RunsResponse>> {
    let runs = state.runner.store().list()?;
    Ok(Json(RunsResponse { success: true, runs }))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    run_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<RunResponse>> {
    let Path(run_id) = run_id?;
    let run = state.runner.store().get(&run_id)?;
    Ok(Json(RunResponse { success: true, run }))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    run_id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<RunStartedResponse>> {
    let Path(run_id) = run_id?;
    state.runner.cancel(&run_id)?;
    let run = state.runner.store().get(&run_id)?;
    Ok(Json(RunStartedResponse {
        success: true,
        run_id,
        status: run.status,
        message: "Cancellation requested".to_string(),
    }))
}

// ============================================================================
// SQL conversion
// ============================================================================

pub async fn convert_sql(
    State(state): State<Arc<AppState>>,
    payload: Payload<ConvertRequest>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let Some(input_sql) = request.input_sql else {
        return Err(ApiError::bad_request("Missing required field: input_sql"));
    };
    let input_sql = input_sql.trim().to_string();
    if input_sql.is_empty() {
        return Err(ApiError::bad_request("input_sql cannot be empty"));
    }

    tracing::info!(length = input_sql.len(), "converting SQL");
    let conversion = ConversionRequest::new(input_sql.as_str())
        .with_procedure_terminator(request.procedure_terminator.unwrap_or(true));
    let result = state.translator.convert(&conversion)?;

    let error_message = if result.success {
        String::new()
    } else {
        "Some constructs have no DB2 rewrite and are marked UNSUPPORTED; see the conversion report".to_string()
    };
    let response = ConvertResponse {
        success: result.success,
        input_sql,
        conversion_report: result.report(),
        warnings: result.warnings().map(|i| format!("Line {}: {}", i.line, i.message)).collect(),
        converted_sql: result.target_sql,
        issues: result.issues,
        error_message,
        timestamp: Utc::now(),
        conversion_id: short_id(),
    };
    tracing::info!(
        conversion_id = %response.conversion_id,
        success = response.success,
        issues = response.issues.len(),
        "conversion finished"
    );

    let status = if response.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    Ok((status, Json(response)).into_response())
}

pub async fn sample_sql() -> Json<SampleResponse> {
    Json(SampleResponse {
        success: true,
        sample_sql: SAMPLE_PROCEDURE.to_string(),
    })
}

pub async fn converter_ready(State(state): State<Arc<AppState>>) -> ApiResult<Json<ServiceMessage>> {
    state.translator.translate(SAMPLE_PROCEDURE)?;
    Ok(Json(ServiceMessage {
        success: true,
        message: "SQL Converter is properly configured and ready".to_string(),
        service: "sql_conversion".to_string(),
    }))
}

pub async fn validate_sql(
    State(state): State<Arc<AppState>>,
    payload: Payload<ValidateSqlRequest>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let Some(converted_sql) = request.converted_sql else {
        return Err(ApiError::bad_request("Missing required field: converted_sql"));
    };
    if converted_sql.trim().is_empty() {
        return Err(ApiError::bad_request("converted_sql cannot be empty"));
    }
    let Some(target_db) = request.target_db else {
        return Err(ApiError::bad_request("Missing required field: target_db"));
    };

    let connector = connect(&state, &target_db).await?;
    let validation_id = short_id();
    let (success, validation_output, error_message) = match connector.execute(&converted_sql).await {
        Ok(ExecutionOutcome { output, .. }) => (true, output, String::new()),
        Err(e) => {
            tracing::warn!(validation_id = %validation_id, error = %e, "converted SQL rejected by target");
            (false, String::new(), e.to_string())
        }
    };

    let status = if success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    Ok((
        status,
        Json(ValidateSqlResponse {
            success,
            db2_execution_success: success,
            validation_output,
            error_message,
            validation_id,
            timestamp: Utc::now(),
        }),
    )
        .into_response())
}

pub async fn conversion_health() -> Json<ServiceMessage> {
    Json(ServiceMessage {
        success: true,
        message: "SQL Conversion service is running".to_string(),
        service: "sql_conversion".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_list_forms() {
        let text: ColumnList = serde_json::from_str(r#"" id , code ,""#).unwrap();
        assert_eq!(text.into_vec(), vec!["id", "code"]);
        let list: ColumnList = serde_json::from_str(r#"["id", " "]"#).unwrap();
        assert_eq!(list.into_vec(), vec!["id"]);
    }

    #[test]
    fn test_require_lists_missing_fields() {
        let err = require(&[("sourceSchema", true), ("keys", false), ("sourceTable", false)]).unwrap_err();
        assert_eq!(err.message(), "Missing required fields: keys, sourceTable");
    }

    #[test]
    fn test_run_request_field_names() {
        let request: RunValidationRequest = serde_json::from_str(
            r#"{"sourceSchema":"S","targetSchema":"T","keys":"id","comparisonType":"full",
                "includeColumns":["a"],"source_db":{"db_type":"memory","database":"src"}}"#,
        )
        .unwrap();
        assert!(request.is_full());
        assert_eq!(columns(request.include), vec!["a"]);
        assert_eq!(request.source_db.map(|d| d.database).as_deref(), Some("src"));
    }

    #[test]
    fn test_connection_request_flattened() {
        let request: ConnectionRequest = serde_json::from_str(
            r#"{"db_type":"postgres","host":"h","port":"5432","database":"d","schema":"public"}"#,
        )
        .unwrap();
        assert_eq!(request.connection.port, Some(5432));
        assert_eq!(request.schema.as_deref(), Some("public"));
    }
}
