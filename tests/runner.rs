//! Validation runs over the in-memory catalog.

use std::sync::Arc;
use std::time::Duration;

use dbshift::prelude::*;
use dbshift::report::TableStatus;
use pretty_assertions::assert_eq;

fn connector(catalog: &Arc<MemoryCatalog>, database: &str) -> Arc<dyn Connector> {
    Arc::new(MemoryConnector::open(Arc::clone(catalog), database).unwrap())
}

fn orders(ids: impl IntoIterator<Item = i64>) -> MemoryTable {
    MemoryTable::new(vec![
        ColumnInfo::new("ORDER_ID", "INTEGER").primary_key(),
        ColumnInfo::new("STATUS", "VARCHAR(10)"),
    ])
    .with_rows(
        ids.into_iter()
            .map(|id| vec![Value::Int(id), Value::from(if id % 2 == 0 { "open" } else { "closed" })])
            .collect(),
    )
}

fn keys() -> Vec<String> {
    vec!["ORDER_ID".to_string()]
}

fn plan(catalog: &Arc<MemoryCatalog>, tables: &[&str]) -> ValidationPlan {
    ValidationPlan::new(
        connector(catalog, "td"),
        "SALES",
        connector(catalog, "db2"),
        "SALES",
        tables.iter().map(|t| TableMatch::manual(*t, *t, keys())).collect(),
    )
}

#[tokio::test]
async fn test_duplicate_source_key_fails_only_that_table() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_table("td", "SALES", "DUPES", orders([1, 2, 2, 3]));
    catalog.insert_table("db2", "SALES", "DUPES", orders([1, 2, 3]));
    catalog.insert_table("td", "SALES", "CLEAN", orders([1, 2, 3]));
    catalog.insert_table("db2", "SALES", "CLEAN", orders([1, 2, 3]));

    let runner = ValidationRunner::new(Arc::new(RunStore::memory()), RunnerSettings::default());
    let run = runner.run(plan(&catalog, &["DUPES", "CLEAN"])).await.unwrap();

    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    let dupes = run.table("DUPES").unwrap();
    assert_eq!(dupes.status, TableStatus::Failed);
    assert_eq!(dupes.error_code.as_deref(), Some("KEY_UNIQUENESS"));
    assert!(dupes.error.as_deref().unwrap_or_default().contains("ORDER_ID"));

    let clean = run.table("CLEAN").unwrap();
    assert_eq!(clean.status, TableStatus::Completed);
    assert!(!clean.has_differences);
    assert_eq!(run.summary.tables_completed, 1);
    assert_eq!(run.summary.tables_failed, 1);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_finished_tables() {
    let catalog = Arc::new(MemoryCatalog::new().with_batch_delay(Duration::from_millis(25)));
    let tables = ["T1", "T2", "T3", "T4", "T5"];
    for table in tables {
        catalog.insert_table("td", "SALES", table, orders(0..20));
        catalog.insert_table("db2", "SALES", table, orders(0..20));
    }

    let settings = RunnerSettings {
        batch_size: 2,
        ..RunnerSettings::default()
    };
    let runner = ValidationRunner::new(Arc::new(RunStore::memory()), settings);
    let handle = runner
        .start(plan(&catalog, &tables).with_max_concurrent_tables(Some(1)))
        .unwrap();
    let run_id = handle.run_id.clone();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let run = runner.store().get(&run_id).unwrap();
        if run.tables.len() >= 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run made no progress");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runner.cancel(&run_id).unwrap();

    let run = handle.wait().await.unwrap();
    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    assert_eq!(run.tables.len(), 2);
    assert!(run.tables.iter().all(|t| t.status == TableStatus::Completed));
    assert_eq!(run.cancelled_tables.len(), 3);
    assert_eq!(run.summary.tables_cancelled, 3);
    assert!(!runner.is_active(&run_id));
    assert!(matches!(
        runner.cancel(&run_id),
        Err(ShiftError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let catalog = Arc::new(MemoryCatalog::new().with_batch_delay(Duration::from_millis(5)));
    let tables = ["A", "B", "C", "D"];
    for table in tables {
        catalog.insert_table("td", "SALES", table, orders(0..6));
        catalog.insert_table("db2", "SALES", table, orders(0..6));
    }

    let runner = ValidationRunner::new(Arc::new(RunStore::memory()), RunnerSettings::default());
    let run = runner
        .run(plan(&catalog, &tables).with_max_concurrent_tables(Some(1)))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.tables.len(), 4);
    // With one permit no table starts before the previous one finished.
    let mut spans: Vec<_> = run.tables.iter().map(|t| (t.started_at, t.finished_at)).collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }
}

#[tokio::test]
async fn test_run_is_listed_and_reported() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_table("td", "SALES", "ORDERS", orders([1, 2, 3, 4]));
    catalog.insert_table("db2", "SALES", "ORDERS", orders([1, 2, 3]));

    let store = Arc::new(RunStore::memory());
    let runner = ValidationRunner::new(Arc::clone(&store), RunnerSettings::default());
    let run = runner.run(plan(&catalog, &["ORDERS"])).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let table = run.table("ORDERS").unwrap();
    assert_eq!(table.rows_not_in_target, 1);
    assert!(table.has_differences);

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, run.run_id);
    assert_eq!(store.latest().unwrap().run_id, run.run_id);

    let report = run.formatted_report();
    assert!(report.contains("ORDERS"));
    assert_eq!(store.table_details(&run.run_id, "ORDERS", None).unwrap().len(), 1);
}
