//! Run persistence keyed by `run_id`.
//!
//! Runs live in memory for the life of the process, up to a retention
//! limit; the oldest finished runs are dropped first. With a runs directory
//! configured, terminal runs are also written to `<dir>/<run_id>/run.json`
//! so they survive restarts. Full difference rows always go to
//! `<root>/<run_id>/tables/<table>-<hash>.jsonl`, where the root is the runs
//! directory or, without one, a private temporary directory removed with the
//! store.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::{ShiftError, ShiftResult};
use crate::reconcile::{DiffCategory, DiffRecord, DiffSink};

use super::{RunStatus, ValidationRun};

/// Runs kept in memory unless configured otherwise.
pub const DEFAULT_RETAINED_RUNS: usize = 100;

/// Row of the run listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunListing {
    pub run_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub total_tables: usize,
    pub tables_completed: usize,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, ValidationRun>,
    /// Insertion order; the last entry is the latest run.
    order: Vec<String>,
}

#[derive(Debug)]
pub struct RunStore {
    inner: RwLock<Inner>,
    dir: Option<PathBuf>,
    /// Detail root used when no runs directory is configured.
    spill: Mutex<Option<TempDir>>,
    retention: usize,
}

impl Default for RunStore {
    fn default() -> Self {
        Self {
            inner: RwLock::default(),
            dir: None,
            spill: Mutex::default(),
            retention: DEFAULT_RETAINED_RUNS,
        }
    }
}

fn check_run_id(run_id: &str) -> ShiftResult<()> {
    let valid = !run_id.is_empty() && run_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ShiftError::NotFound(format!("run {} not found", run_id)))
    }
}

/// File name for a table's details. Lookup is case-insensitive; the hash
/// keeps names that sanitize alike (`A.B`, `A_B`) apart.
fn file_stem(table: &str) -> String {
    let lowered = table.to_ascii_lowercase();
    let readable: String = lowered
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(lowered.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", readable, suffix)
}

fn details_path(root: &Path, run_id: &str, table: &str) -> PathBuf {
    root.join(run_id).join("tables").join(format!("{}.jsonl", file_stem(table)))
}

impl RunStore {
    /// Store without a runs directory.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Store that also persists under `dir` (created if missing).
    pub fn new(dir: Option<PathBuf>) -> ShiftResult<Self> {
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dir,
            ..Self::default()
        })
    }

    /// Keep at most `runs` runs in memory (minimum 1).
    pub fn with_retention(mut self, runs: usize) -> Self {
        self.retention = runs.max(1);
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn insert(&self, run: ValidationRun) {
        let evicted = {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let inner = &mut *guard;
            inner.order.push(run.run_id.clone());
            inner.runs.insert(run.run_id.clone(), run);

            let mut evicted = Vec::new();
            while inner.order.len() > self.retention {
                let runs = &inner.runs;
                let Some(pos) = inner
                    .order
                    .iter()
                    .position(|id| runs.get(id).is_some_and(ValidationRun::is_terminal))
                else {
                    break;
                };
                let id = inner.order.remove(pos);
                inner.runs.remove(&id);
                evicted.push(id);
            }
            evicted
        };
        for run_id in evicted {
            tracing::debug!(run_id = %run_id, "evicted run from memory");
            self.drop_spilled(&run_id);
        }
    }

    /// Apply `f` to a stored run; a run that ends up terminal is persisted.
    pub fn update<T>(&self, run_id: &str, f: impl FnOnce(&mut ValidationRun) -> ShiftResult<T>) -> ShiftResult<T> {
        let (value, snapshot) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let run = inner
                .runs
                .get_mut(run_id)
                .ok_or_else(|| ShiftError::NotFound(format!("run {} not found", run_id)))?;
            let value = f(run)?;
            let snapshot = run.is_terminal().then(|| run.clone());
            (value, snapshot)
        };
        if let Some(run) = snapshot {
            self.persist(&run)?;
        }
        Ok(value)
    }

    pub fn get(&self, run_id: &str) -> ShiftResult<ValidationRun> {
        check_run_id(run_id)?;
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(run) = inner.runs.get(run_id) {
                return Ok(run.clone());
            }
        }
        self.load(run_id)
    }

    /// Most recently started run.
    pub fn latest(&self) -> ShiftResult<ValidationRun> {
        let last = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.order.last().and_then(|id| inner.runs.get(id)).cloned()
        };
        if let Some(run) = last {
            return Ok(run);
        }
        match self.persisted_ids()?.pop() {
            Some(id) => self.load(&id),
            None => Err(ShiftError::NotFound("No validation runs found".to_string())),
        }
    }

    /// The named run, or the latest when `run_id` is absent.
    pub fn resolve(&self, run_id: Option<&str>) -> ShiftResult<ValidationRun> {
        match run_id {
            Some(id) if !id.is_empty() => self.get(id),
            _ => self.latest(),
        }
    }

    /// All known runs, oldest first.
    pub fn list(&self) -> ShiftResult<Vec<RunListing>> {
        let mut listings: Vec<RunListing> = Vec::new();
        let in_memory: Vec<ValidationRun> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.order.iter().filter_map(|id| inner.runs.get(id)).cloned().collect()
        };
        for id in self.persisted_ids()? {
            if in_memory.iter().any(|r| r.run_id == id) {
                continue;
            }
            if let Ok(run) = self.load(&id) {
                listings.push(listing(&run));
            }
        }
        listings.extend(in_memory.iter().map(listing));
        Ok(listings)
    }

    /// Sink for the full difference rows of one table, written as JSON lines.
    pub fn diff_sink(&self, run_id: &str, table: &str) -> ShiftResult<Box<dyn DiffSink>> {
        check_run_id(run_id)?;
        let path = details_path(&self.details_root()?, run_id, table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Box::new(FileDiffSink {
            writer: BufWriter::new(file),
        }))
    }

    /// Difference rows recorded for a table, at most `per_category` of each
    /// category when given. Rows are streamed from disk, so memory follows
    /// the limit rather than the table size.
    pub fn table_details(&self, run_id: &str, table: &str, per_category: Option<usize>) -> ShiftResult<Vec<DiffRecord>> {
        check_run_id(run_id)?;
        let not_found = || ShiftError::NotFound(format!("no details for table {} in run {}", table, run_id));
        let root = self.existing_details_root().ok_or_else(not_found)?;
        let path = details_path(&root, run_id, table);
        if !path.exists() {
            return Err(not_found());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut taken: HashMap<DiffCategory, usize> = HashMap::new();
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DiffRecord = serde_json::from_str(&line)?;
            let count = taken.entry(record.category).or_default();
            if per_category.is_some_and(|limit| *count >= limit) {
                continue;
            }
            *count += 1;
            records.push(record);
        }
        Ok(records)
    }

    /// Drop recorded difference rows, e.g. for a table that failed midway.
    pub fn discard_details(&self, run_id: &str, table: &str) -> ShiftResult<()> {
        check_run_id(run_id)?;
        if let Some(root) = self.existing_details_root() {
            let path = details_path(&root, run_id, table);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Root for difference files, creating the temporary one on first use.
    fn details_root(&self) -> ShiftResult<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let mut spill = self.spill.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tmp) = spill.as_ref() {
            return Ok(tmp.path().to_path_buf());
        }
        let tmp = tempfile::Builder::new().prefix("dbshift-runs-").tempdir()?;
        let path = tmp.path().to_path_buf();
        tracing::debug!(dir = %path.display(), "spilling difference rows to temporary directory");
        *spill = Some(tmp);
        Ok(path)
    }

    fn existing_details_root(&self) -> Option<PathBuf> {
        match &self.dir {
            Some(dir) => Some(dir.clone()),
            None => self
                .spill
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|tmp| tmp.path().to_path_buf()),
        }
    }

    /// Remove the temporary details of an evicted run. Runs under a
    /// configured directory stay on disk.
    fn drop_spilled(&self, run_id: &str) {
        if self.dir.is_some() {
            return;
        }
        let Some(root) = self.existing_details_root() else {
            return;
        };
        let run_dir = root.join(run_id);
        if run_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&run_dir) {
                tracing::warn!(run_id, error = %e, "failed to remove difference rows of evicted run");
            }
        }
    }

    fn persist(&self, run: &ValidationRun) -> ShiftResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let run_dir = dir.join(&run.run_id);
        fs::create_dir_all(&run_dir)?;
        fs::write(run_dir.join("run.json"), serde_json::to_vec_pretty(run)?)?;
        tracing::debug!(run_id = %run.run_id, dir = %run_dir.display(), "persisted run");
        Ok(())
    }

    fn load(&self, run_id: &str) -> ShiftResult<ValidationRun> {
        let path = self
            .dir
            .as_ref()
            .map(|dir| dir.join(run_id).join("run.json"))
            .filter(|path| path.exists())
            .ok_or_else(|| ShiftError::NotFound(format!("run {} not found", run_id)))?;
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persisted run ids, oldest first (ids sort by start time).
    fn persisted_ids(&self) -> ShiftResult<Vec<String>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().join("run.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn listing(run: &ValidationRun) -> RunListing {
    RunListing {
        run_id: run.run_id.clone(),
        status: run.status,
        start_time: run.start_time,
        total_tables: run.summary.total_tables,
        tables_completed: run.summary.tables_completed,
    }
}

struct FileDiffSink {
    writer: BufWriter<File>,
}

impl DiffSink for FileDiffSink {
    fn record(&mut self, diff: &DiffRecord) -> ShiftResult<()> {
        serde_json::to_writer(&mut self.writer, diff)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> ShiftResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Value;
    use std::collections::BTreeMap;

    fn finished_run() -> ValidationRun {
        let mut run = ValidationRun::new("S", "T", 1);
        run.transition(RunStatus::Running).unwrap();
        run.record_cancelled("A").unwrap();
        run.finish().unwrap();
        run
    }

    fn record(category: DiffCategory, id: i64) -> DiffRecord {
        DiffRecord {
            category,
            key: BTreeMap::from([("ID".to_string(), Value::Int(id))]),
            source: None,
            target: None,
            fields: Vec::new(),
        }
    }

    fn write_details(store: &RunStore, run_id: &str, table: &str, records: &[DiffRecord]) {
        let mut sink = store.diff_sink(run_id, table).unwrap();
        for r in records {
            sink.record(r).unwrap();
        }
        sink.finish().unwrap();
    }

    #[test]
    fn test_latest_and_resolve() {
        let store = RunStore::memory();
        assert!(matches!(store.latest(), Err(ShiftError::NotFound(_))));
        let first = ValidationRun::new("S", "T", 1);
        let mut second = ValidationRun::new("S", "T", 1);
        second.run_id = format!("{}x", second.run_id);
        let (first_id, second_id) = (first.run_id.clone(), second.run_id.clone());
        store.insert(first);
        store.insert(second);
        assert_eq!(store.latest().unwrap().run_id, second_id);
        assert_eq!(store.resolve(Some(&first_id)).unwrap().run_id, first_id);
        assert!(matches!(store.get("../etc"), Err(ShiftError::NotFound(_))));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_details_without_runs_dir_go_to_disk() {
        let store = RunStore::memory();
        assert!(store.table_details("run_1", "ORDERS", None).is_err());
        write_details(
            &store,
            "run_1",
            "ORDERS",
            &[record(DiffCategory::NotInTarget, 1), record(DiffCategory::NotInTarget, 2)],
        );
        let root = store.existing_details_root().unwrap();
        assert!(details_path(&root, "run_1", "orders").exists());
        assert_eq!(store.table_details("run_1", "orders", None).unwrap().len(), 2);
        store.discard_details("run_1", "ORDERS").unwrap();
        assert!(store.table_details("run_1", "ORDERS", None).is_err());
    }

    #[test]
    fn test_details_limited_per_category() {
        let store = RunStore::memory();
        let mut records: Vec<DiffRecord> = (0..10).map(|i| record(DiffCategory::NotInTarget, i)).collect();
        records.push(record(DiffCategory::NotInSource, 99));
        write_details(&store, "run_1", "T", &records);

        let limited = store.table_details("run_1", "T", Some(3)).unwrap();
        assert_eq!(limited.len(), 4);
        assert_eq!(limited.iter().filter(|r| r.category == DiffCategory::NotInSource).count(), 1);
    }

    #[test]
    fn test_similar_table_names_do_not_collide() {
        assert_ne!(file_stem("A.B"), file_stem("A_B"));
        assert_eq!(file_stem("Orders"), file_stem("ORDERS"));

        let store = RunStore::memory();
        write_details(&store, "run_1", "A.B", &[record(DiffCategory::NotInTarget, 1)]);
        write_details(&store, "run_1", "A_B", &[record(DiffCategory::NotInSource, 2)]);
        assert_eq!(
            store.table_details("run_1", "A.B", None).unwrap(),
            vec![record(DiffCategory::NotInTarget, 1)]
        );
        assert_eq!(
            store.table_details("run_1", "A_B", None).unwrap(),
            vec![record(DiffCategory::NotInSource, 2)]
        );
    }

    #[test]
    fn test_retention_evicts_oldest_finished_runs() {
        let store = RunStore::memory().with_retention(2);
        let mut running = ValidationRun::new("S", "T", 1);
        running.run_id = "run_a".to_string();
        running.transition(RunStatus::Running).unwrap();
        store.insert(running);

        let mut ids = Vec::new();
        for suffix in ["b", "c", "d"] {
            let mut run = finished_run();
            run.run_id = format!("run_{}", suffix);
            write_details(&store, &run.run_id, "T", &[record(DiffCategory::NotInTarget, 1)]);
            ids.push(run.run_id.clone());
            store.insert(run);
        }

        // The running run is never evicted.
        assert!(store.get("run_a").is_ok());
        assert!(store.get("run_b").is_err());
        assert!(store.get("run_c").is_err());
        assert_eq!(store.latest().unwrap().run_id, "run_d");
        assert!(store.table_details("run_b", "T", None).is_err());
        assert_eq!(store.table_details("run_d", "T", None).unwrap().len(), 1);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_persisted_runs_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let run = finished_run();
        let run_id = run.run_id.clone();
        {
            let store = RunStore::new(Some(dir.path().to_path_buf())).unwrap();
            let mut open = run.clone();
            open.status = RunStatus::Running;
            store.insert(open);
            store
                .update(&run_id, |r| {
                    *r = run.clone();
                    Ok(())
                })
                .unwrap();
            write_details(&store, &run_id, "Sales.Orders", &[record(DiffCategory::NotInTarget, 7)]);
        }

        let reopened = RunStore::new(Some(dir.path().to_path_buf())).unwrap();
        let loaded = reopened.latest().unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.status, RunStatus::Failed);
        let details = reopened.table_details(&run_id, "Sales.Orders", None).unwrap();
        assert_eq!(details, vec![record(DiffCategory::NotInTarget, 7)]);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
