//! HTTP router
//!
//! Every endpoint is mounted under `/api`.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::AppState;
use super::handler::{
    cancel_run, conversion_health, convert_sql, converter_ready, discover_schema_tables, download_report,
    formatted_validation_report, get_run, health_check, list_columns, list_runs, list_schemas, list_tables,
    run_validation, sample_sql, validate_connection, validate_sql, validation_report, validation_results_detailed,
    validation_table_details,
};

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        // Connections and catalogs
        .route("/validate", post(validate_connection))
        .route("/schemas", post(list_schemas))
        .route("/tables", post(list_tables))
        .route("/columns", post(list_columns))
        .route("/discover-schema-tables", post(discover_schema_tables))
        // Validation runs
        .route("/run-validation", post(run_validation))
        .route("/validation-report", get(validation_report))
        .route("/validation-results-detailed", get(validation_results_detailed))
        .route("/formatted-validation-report", get(formatted_validation_report))
        .route("/validation-table-details/{table_name}", get(validation_table_details))
        .route("/download-report", get(download_report))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        // SQL conversion
        .route("/sql-conversion/convert", post(convert_sql))
        .route("/sql-conversion/sample", get(sample_sql))
        .route("/sql-conversion/validate", get(converter_ready).post(validate_sql))
        .route("/sql-conversion/health", get(conversion_health))
}

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors_enabled = state.config.cors_enabled;

    // Tracing layer for request logging
    let trace = TraceLayer::new_for_http();

    let router = Router::new().nest("/api", api_routes()).layer(trace);
    let router = if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    };
    router.with_state(state)
}
