//! Validation runs over many tables.
//!
//! Each table pair is an independent job. Jobs run on a [`JoinSet`] with at
//! most `max_concurrent_tables` holding a semaphore permit at once, and the
//! run becomes terminal only after every dispatched job has been joined.
//! Cancelling a run stops dispatch and interrupts in-flight jobs between
//! batches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::engine::{Connector, RowRequest};
use crate::error::{ShiftError, ShiftResult};
use crate::reconcile::{Predicate, Projection, ReconcileOptions, Reconciler};
use crate::report::{RunStatus, RunStore, TableValidationResult, ValidationRun};
use crate::schema::TableMatch;

/// Limits applied to every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub max_concurrent_tables: usize,
    pub batch_size: usize,
    pub sample_limit: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RunnerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent_tables: config.max_concurrent_tables.max(1),
            batch_size: config.batch_size.max(1),
            sample_limit: config.sample_limit,
        }
    }
}

/// Everything needed to start a run.
pub struct ValidationPlan {
    pub source: Arc<dyn Connector>,
    pub target: Arc<dyn Connector>,
    pub source_schema: String,
    pub target_schema: String,
    pub tables: Vec<TableMatch>,
    pub predicate: Option<String>,
    pub projection: Projection,
    /// Overrides the runner's limit for this run.
    pub max_concurrent_tables: Option<usize>,
}

impl ValidationPlan {
    pub fn new(
        source: Arc<dyn Connector>,
        source_schema: impl Into<String>,
        target: Arc<dyn Connector>,
        target_schema: impl Into<String>,
        tables: Vec<TableMatch>,
    ) -> Self {
        Self {
            source,
            target,
            source_schema: source_schema.into(),
            target_schema: target_schema.into(),
            tables,
            predicate: None,
            projection: Projection::default(),
            max_concurrent_tables: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<String>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_max_concurrent_tables(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_tables = limit;
        self
    }
}

/// A started run.
pub struct RunHandle {
    pub run_id: String,
    handle: JoinHandle<ShiftResult<ValidationRun>>,
}

impl RunHandle {
    /// Wait for the run to become terminal.
    pub async fn wait(self) -> ShiftResult<ValidationRun> {
        self.handle
            .await
            .map_err(|e| ShiftError::Execution(format!("validation run {} aborted: {}", self.run_id, e)))?
    }
}

type ActiveRuns = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Starts, tracks and cancels validation runs.
pub struct ValidationRunner {
    store: Arc<RunStore>,
    settings: RunnerSettings,
    active: ActiveRuns,
}

impl ValidationRunner {
    pub fn new(store: Arc<RunStore>, settings: RunnerSettings) -> Self {
        Self {
            store,
            settings,
            active: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn settings(&self) -> RunnerSettings {
        self.settings
    }

    /// Validate the plan, register a running run and start it in the
    /// background. Must be called within a tokio runtime.
    pub fn start(&self, plan: ValidationPlan) -> ShiftResult<RunHandle> {
        if plan.tables.is_empty() {
            return Err(ShiftError::InvalidRequest("No tables to validate".to_string()));
        }
        if let Some(table) = plan.tables.iter().find(|t| t.primary_keys.is_empty()) {
            return Err(ShiftError::InvalidRequest(format!(
                "No key columns given for table {}",
                table.source_table
            )));
        }
        let predicate = plan
            .predicate
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(Predicate::parse)
            .transpose()?;

        let limit = plan
            .max_concurrent_tables
            .unwrap_or(self.settings.max_concurrent_tables)
            .max(1);
        let mut run = ValidationRun::new(&plan.source_schema, &plan.target_schema, plan.tables.len());
        run.transition(RunStatus::Running)?;
        run.log(format!(
            "max concurrent tables {}, batch size {}, sample limit {}",
            limit, self.settings.batch_size, self.settings.sample_limit
        ));
        if let Some(predicate) = &predicate {
            run.log(format!("predicate: {}", predicate.text()));
        }
        let run_id = run.run_id.clone();
        self.store.insert(run);

        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), token.clone());

        tracing::info!(
            run_id = %run_id,
            tables = plan.tables.len(),
            max_concurrent = limit,
            "validation run started"
        );

        let job = RunJob {
            run_id: run_id.clone(),
            plan,
            predicate,
            limit,
            settings: self.settings,
            store: Arc::clone(&self.store),
            token,
        };
        let inner = tokio::spawn(job.execute());

        let handle = tokio::spawn(supervise(
            inner,
            Arc::clone(&self.store),
            Arc::clone(&self.active),
            run_id.clone(),
        ));

        Ok(RunHandle { run_id, handle })
    }

    /// Start a run and wait for it.
    pub async fn run(&self, plan: ValidationPlan) -> ShiftResult<ValidationRun> {
        self.start(plan)?.wait().await
    }

    /// Request cancellation of an active run.
    pub fn cancel(&self, run_id: &str) -> ShiftResult<()> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                self.store.update(run_id, |run| {
                    if !run.is_terminal() {
                        run.log("cancellation requested");
                    }
                    Ok(())
                })?;
                tracing::info!(run_id, "validation run cancellation requested");
                Ok(())
            }
            None => {
                let run = self.store.get(run_id)?;
                Err(ShiftError::InvalidTransition {
                    from: run.status.to_string(),
                    to: "cancelled".to_string(),
                })
            }
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }
}

/// Join a run task; a run whose task errored or panicked is marked failed
/// so it never stays `running`.
async fn supervise(
    inner: JoinHandle<ShiftResult<ValidationRun>>,
    store: Arc<RunStore>,
    active: ActiveRuns,
    run_id: String,
) -> ShiftResult<ValidationRun> {
    let outcome = match inner.await {
        Ok(outcome) => outcome,
        Err(e) => Err(ShiftError::Execution(format!("validation run task failed: {}", e))),
    };
    if let Err(error) = &outcome {
        tracing::error!(run_id = %run_id, error = %error, "validation run aborted");
        if let Err(e) = store.update(&run_id, |run| if run.is_terminal() { Ok(()) } else { run.fail(error) }) {
            tracing::error!(run_id = %run_id, error = %e, "failed to mark run as failed");
        }
    }
    active.lock().unwrap_or_else(PoisonError::into_inner).remove(&run_id);
    outcome
}

struct RunJob {
    run_id: String,
    plan: ValidationPlan,
    predicate: Option<Predicate>,
    limit: usize,
    settings: RunnerSettings,
    store: Arc<RunStore>,
    token: CancellationToken,
}

type JobOutcome = (usize, DateTime<Utc>, ShiftResult<TableValidationResult>);

impl RunJob {
    async fn execute(self) -> ShiftResult<ValidationRun> {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut jobs: JoinSet<JobOutcome> = JoinSet::new();
        let total = self.plan.tables.len();
        let mut settled = vec![false; total];
        let mut next = 0;
        let mut dispatching = true;

        // Results are settled as jobs finish, so a poller sees completed
        // tables while later ones are still queued.
        while dispatching && next < total {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => dispatching = false,
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => self.settle_joined(joined, &mut settled)?,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => {
                        self.dispatch(&mut jobs, next, permit);
                        next += 1;
                    }
                    Err(_) => dispatching = false,
                },
            }
        }

        while let Some(joined) = jobs.join_next().await {
            self.settle_joined(joined, &mut settled)?;
        }

        for (index, table) in self.plan.tables.iter().enumerate() {
            if index >= next {
                self.store
                    .update(&self.run_id, |run| run.record_cancelled(&table.source_table))?;
            } else if !settled[index] {
                let error = ShiftError::Execution("table job aborted unexpectedly".to_string());
                self.settle(table, Utc::now(), Err(error))?;
            }
        }

        let run = self.store.update(&self.run_id, |run| {
            run.finish()?;
            Ok(run.clone())
        })?;
        tracing::info!(
            run_id = %run.run_id,
            status = %run.status,
            completed = run.summary.tables_completed,
            failed = run.summary.tables_failed,
            cancelled = run.summary.tables_cancelled,
            "validation run finished"
        );
        Ok(run)
    }

    fn dispatch(&self, jobs: &mut JoinSet<JobOutcome>, index: usize, permit: OwnedSemaphorePermit) {
        let table = &self.plan.tables[index];
        let job = TableJob {
            source: Arc::clone(&self.plan.source),
            target: Arc::clone(&self.plan.target),
            source_schema: self.plan.source_schema.clone(),
            target_schema: self.plan.target_schema.clone(),
            table: table.clone(),
            options: ReconcileOptions::new(table.primary_keys.clone())
                .with_predicate(self.predicate.clone())
                .with_projection(self.plan.projection.clone())
                .with_sample_limit(self.settings.sample_limit),
            batch_size: self.settings.batch_size,
            store: Arc::clone(&self.store),
            run_id: self.run_id.clone(),
            token: self.token.clone(),
        };
        jobs.spawn(async move {
            let _permit = permit;
            let started = Utc::now();
            (index, started, job.run().await)
        });
    }

    fn settle_joined(&self, joined: Result<JobOutcome, JoinError>, settled: &mut [bool]) -> ShiftResult<()> {
        match joined {
            Ok((index, started, outcome)) => {
                settled[index] = true;
                self.settle(&self.plan.tables[index], started, outcome)
            }
            Err(e) => {
                // Recorded as failed once all jobs are joined.
                tracing::error!(run_id = %self.run_id, error = %e, "table job aborted");
                Ok(())
            }
        }
    }

    fn settle(&self, table: &TableMatch, started: DateTime<Utc>, outcome: ShiftResult<TableValidationResult>) -> ShiftResult<()> {
        match outcome {
            Ok(result) => self.store.update(&self.run_id, |run| run.record_table(result)),
            Err(ShiftError::Cancelled(_)) => {
                self.discard_details(table);
                self.store
                    .update(&self.run_id, |run| run.record_cancelled(&table.source_table))
            }
            Err(error) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    table = %table.source_table,
                    error = %error,
                    "table validation failed"
                );
                self.discard_details(table);
                let failed = TableValidationResult::failed(
                    &table.source_table,
                    &table.target_table,
                    &table.primary_keys,
                    &error,
                    started,
                    Utc::now(),
                );
                self.store.update(&self.run_id, |run| run.record_table(failed))
            }
        }
    }

    fn discard_details(&self, table: &TableMatch) {
        if let Err(e) = self.store.discard_details(&self.run_id, &table.source_table) {
            tracing::warn!(
                run_id = %self.run_id,
                table = %table.source_table,
                error = %e,
                "failed to discard difference rows"
            );
        }
    }
}

struct TableJob {
    source: Arc<dyn Connector>,
    target: Arc<dyn Connector>,
    source_schema: String,
    target_schema: String,
    table: TableMatch,
    options: ReconcileOptions,
    batch_size: usize,
    store: Arc<RunStore>,
    run_id: String,
    token: CancellationToken,
}

impl TableJob {
    async fn run(self) -> ShiftResult<TableValidationResult> {
        let started = Utc::now();
        let keys = self.table.primary_keys.clone();
        let source_rows = self
            .source
            .open_rows(&RowRequest::new(&self.source_schema, &self.table.source_table, keys.clone(), self.batch_size))
            .await?;
        let target_rows = self
            .target
            .open_rows(&RowRequest::new(&self.target_schema, &self.table.target_table, keys, self.batch_size))
            .await?;

        let mut sink = self.store.diff_sink(&self.run_id, &self.table.source_table)?;
        let reconciliation = Reconciler::new(self.options)
            .reconcile(
                &self.table.source_table,
                &self.table.target_table,
                source_rows,
                target_rows,
                Some(sink.as_mut()),
                &self.token,
            )
            .await?;
        Ok(TableValidationResult::completed(reconciliation, started, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCatalog, MemoryConnector, MemoryTable};
    use crate::reconcile::Value;
    use crate::schema::ColumnInfo;
    use std::time::Duration;

    fn connector(catalog: &Arc<MemoryCatalog>, database: &str) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector::open(Arc::clone(catalog), database).unwrap())
    }

    fn table(rows: &[(i64, &str)]) -> MemoryTable {
        MemoryTable::new(vec![ColumnInfo::new("ID", "INTEGER"), ColumnInfo::new("NAME", "VARCHAR")])
            .with_rows(rows.iter().map(|(id, name)| vec![Value::Int(*id), Value::from(*name)]).collect())
    }

    fn runner() -> ValidationRunner {
        ValidationRunner::new(Arc::new(RunStore::memory()), RunnerSettings::default())
    }

    #[tokio::test]
    async fn test_single_table_run() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_table("src", "S", "T1", table(&[(1, "a"), (2, "b")]));
        catalog.insert_table("dst", "S", "T1", table(&[(1, "a"), (2, "c")]));

        let plan = ValidationPlan::new(
            connector(&catalog, "src"),
            "S",
            connector(&catalog, "dst"),
            "S",
            vec![TableMatch::manual("T1", "T1", vec!["ID".to_string()])],
        );
        let runner = runner();
        let run = runner.run(plan).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.tables[0].fields_mismatch, 1);
        assert!(!runner.is_active(&run.run_id));
        assert_eq!(runner.store().table_details(&run.run_id, "T1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_validation() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.create_database("db");
        let runner = runner();
        let empty = ValidationPlan::new(connector(&catalog, "db"), "S", connector(&catalog, "db"), "S", Vec::new());
        assert!(matches!(runner.start(empty), Err(ShiftError::InvalidRequest(_))));

        let no_keys = ValidationPlan::new(
            connector(&catalog, "db"),
            "S",
            connector(&catalog, "db"),
            "S",
            vec![TableMatch::manual("A", "A", Vec::new())],
        );
        assert!(matches!(runner.start(no_keys), Err(ShiftError::InvalidRequest(_))));

        let bad_predicate = ValidationPlan::new(
            connector(&catalog, "db"),
            "S",
            connector(&catalog, "db"),
            "S",
            vec![TableMatch::manual("A", "A", vec!["ID".to_string()])],
        )
        .with_predicate(Some("ID = ".to_string()));
        assert!(matches!(runner.start(bad_predicate), Err(ShiftError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_missing_table_fails_run() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.create_database("db");
        let plan = ValidationPlan::new(
            connector(&catalog, "db"),
            "S",
            connector(&catalog, "db"),
            "S",
            vec![TableMatch::manual("NOPE", "NOPE", vec!["ID".to_string()])],
        );
        let run = runner().run(plan).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tables[0].error_code.as_deref(), Some("SCHEMA_MISMATCH"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let runner = runner();
        assert!(matches!(runner.cancel("run_missing"), Err(ShiftError::NotFound(_))));

        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_table("db", "S", "T", table(&[(1, "a")]));
        let plan = ValidationPlan::new(
            connector(&catalog, "db"),
            "S",
            connector(&catalog, "db"),
            "S",
            vec![TableMatch::manual("T", "T", vec!["ID".to_string()])],
        );
        let run = runner.run(plan).await.unwrap();
        assert!(matches!(runner.cancel(&run.run_id), Err(ShiftError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_finished_tables_visible_while_run_continues() {
        let catalog = Arc::new(MemoryCatalog::new().with_batch_delay(Duration::from_millis(20)));
        let rows: Vec<(i64, &str)> = (0..6).map(|i| (i, "x")).collect();
        for name in ["A", "B", "C"] {
            catalog.insert_table("db", "S", name, table(&rows));
        }
        let settings = RunnerSettings {
            batch_size: 2,
            ..RunnerSettings::default()
        };
        let runner = ValidationRunner::new(Arc::new(RunStore::memory()), settings);
        let plan = ValidationPlan::new(
            connector(&catalog, "db"),
            "S",
            connector(&catalog, "db"),
            "S",
            ["A", "B", "C"]
                .iter()
                .map(|t| TableMatch::manual(*t, *t, vec!["ID".to_string()]))
                .collect(),
        )
        .with_max_concurrent_tables(Some(1));
        let handle = runner.start(plan).unwrap();
        let run_id = handle.run_id.clone();

        let mut seen_partial = false;
        for _ in 0..2000 {
            let run = runner.store().get(&run_id).unwrap();
            if run.is_terminal() {
                break;
            }
            if !run.tables.is_empty() {
                seen_partial = true;
                assert_eq!(run.status, RunStatus::Running);
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(seen_partial, "no table was recorded before the run ended");

        let run = handle.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.tables.len(), 3);
    }

    #[tokio::test]
    async fn test_errored_run_task_marks_run_failed() {
        let store = Arc::new(RunStore::memory());
        let mut run = ValidationRun::new("S", "T", 1);
        run.transition(RunStatus::Running).unwrap();
        let run_id = run.run_id.clone();
        store.insert(run);

        let active: ActiveRuns = Arc::default();
        active
            .lock()
            .unwrap()
            .insert(run_id.clone(), CancellationToken::new());
        let inner = tokio::spawn(async { Err(ShiftError::Io(std::io::Error::other("disk gone"))) });

        let outcome = supervise(inner, Arc::clone(&store), Arc::clone(&active), run_id.clone()).await;
        assert!(outcome.is_err());
        let run = store.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap_or_default().contains("disk gone"));
        assert!(active.lock().unwrap().is_empty());
    }
}
