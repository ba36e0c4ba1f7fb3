//! Row-level reconciliation of a source table against a target table.
//!
//! Both sides arrive as key-ordered batch streams and are walked with a
//! sorted merge join, so memory use depends on the batch size and sample
//! limit, never on table size.

pub mod predicate;
pub mod source;
pub mod value;

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::{ShiftError, ShiftResult, Side};

pub use predicate::{BoundPredicate, Predicate};
pub use source::{ChannelSource, Projection, RowSource, VecSource};
pub use value::{Key, Row, Value};

use source::{key_of, key_positions};
use value::describe_key;

/// How a pair of tables is compared.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub key_columns: Vec<String>,
    pub predicate: Option<Predicate>,
    pub projection: Projection,
    pub sample_limit: usize,
}

impl ReconcileOptions {
    pub fn new(key_columns: Vec<String>) -> Self {
        Self {
            key_columns,
            predicate: None,
            projection: Projection::default(),
            sample_limit: 5,
        }
    }

    pub fn with_predicate(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffCategory {
    NotInTarget,
    NotInSource,
    FieldsMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub column: String,
    pub source: Value,
    pub target: Value,
}

/// One differing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub category: DiffCategory,
    pub key: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDiff>,
}

/// The first few differences of each category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifferenceSamples {
    pub not_in_target: Vec<DiffRecord>,
    pub not_in_source: Vec<DiffRecord>,
    pub fields_mismatch: Vec<DiffRecord>,
}

impl DifferenceSamples {
    fn bucket_mut(&mut self, category: DiffCategory) -> &mut Vec<DiffRecord> {
        match category {
            DiffCategory::NotInTarget => &mut self.not_in_target,
            DiffCategory::NotInSource => &mut self.not_in_source,
            DiffCategory::FieldsMismatch => &mut self.fields_mismatch,
        }
    }

    fn len(&self, category: DiffCategory) -> usize {
        match category {
            DiffCategory::NotInTarget => self.not_in_target.len(),
            DiffCategory::NotInSource => self.not_in_source.len(),
            DiffCategory::FieldsMismatch => self.fields_mismatch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.not_in_target.is_empty() && self.not_in_source.is_empty() && self.fields_mismatch.is_empty()
    }
}

/// Receives every difference, unsampled.
pub trait DiffSink: Send {
    fn record(&mut self, diff: &DiffRecord) -> ShiftResult<()>;

    /// Flush buffered output.
    fn finish(&mut self) -> ShiftResult<()> {
        Ok(())
    }
}

impl DiffSink for Vec<DiffRecord> {
    fn record(&mut self, diff: &DiffRecord) -> ShiftResult<()> {
        self.push(diff.clone());
        Ok(())
    }
}

/// Per-side statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    /// Rows after the predicate.
    pub rows: u64,
    /// Order-independent checksum over key and compared columns.
    pub checksum: String,
    /// Time spent waiting on this side's stream.
    pub elapsed_seconds: f64,
}

/// Outcome of reconciling one table pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReconciliation {
    pub source_table: String,
    pub target_table: String,
    pub key_columns: Vec<String>,
    /// Non-key columns present on both sides and kept by the projection.
    pub compared_columns: Vec<String>,
    pub columns_only_in_source: Vec<String>,
    pub columns_only_in_target: Vec<String>,
    pub source: SideStats,
    pub target: SideStats,
    pub rows_not_in_target: u64,
    pub rows_not_in_source: u64,
    /// Rows present on both sides with at least one differing field.
    pub fields_mismatch: u64,
    /// Mismatch count per compared column.
    pub field_mismatch_counts: BTreeMap<String, u64>,
    pub checksum_match: bool,
    pub samples: DifferenceSamples,
}

impl TableReconciliation {
    /// Rows whose key appears on both sides.
    pub fn common_rows(&self) -> u64 {
        self.source.rows - self.rows_not_in_target
    }

    pub fn has_differences(&self) -> bool {
        self.rows_not_in_target > 0 || self.rows_not_in_source > 0 || self.fields_mismatch > 0
    }
}

/// 256-bit wrapping sum of SHA-256 row digests.
#[derive(Debug, Clone, Default)]
struct Checksum([u8; 32]);

impl Checksum {
    fn add(&mut self, row: &[Value], positions: &[usize]) {
        let mut hasher = Sha256::new();
        for &i in positions {
            match row.get(i).and_then(Value::normalized) {
                Some(text) => {
                    hasher.update([1u8]);
                    hasher.update(text.as_bytes());
                }
                None => hasher.update([0u8]),
            }
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        let mut carry = 0u16;
        for i in (0..32).rev() {
            let sum = self.0[i] as u16 + digest[i] as u16 + carry;
            self.0[i] = sum as u8;
            carry = sum >> 8;
        }
    }

    fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

struct Cursor<'a> {
    stream: Box<dyn RowSource>,
    side: Side,
    table: &'a str,
    key_columns: &'a [String],
    key_positions: Vec<usize>,
    digest_positions: Vec<usize>,
    predicate: Option<BoundPredicate>,
    buffer: VecDeque<Row>,
    exhausted: bool,
    last_key: Option<Key>,
    rows: u64,
    batches: u64,
    checksum: Checksum,
    elapsed: Duration,
}

impl<'a> Cursor<'a> {
    fn new(
        stream: Box<dyn RowSource>,
        side: Side,
        table: &'a str,
        key_columns: &'a [String],
        key_positions: Vec<usize>,
        digest_positions: Vec<usize>,
        predicate: Option<BoundPredicate>,
    ) -> Self {
        Self {
            stream,
            side,
            table,
            key_columns,
            key_positions,
            digest_positions,
            predicate,
            buffer: VecDeque::new(),
            exhausted: false,
            last_key: None,
            rows: 0,
            batches: 0,
            checksum: Checksum::default(),
            elapsed: Duration::ZERO,
        }
    }

    /// Next row passing the predicate, with its key. Fails on keys that go
    /// backwards or repeat.
    async fn next(&mut self, cancel: &CancellationToken) -> ShiftResult<Option<(Key, Row)>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                if let Some(predicate) = &self.predicate {
                    if !predicate.matches(&row) {
                        continue;
                    }
                }
                let key = key_of(&row, &self.key_positions);
                if let Some(last) = &self.last_key {
                    match key.cmp(last) {
                        Ordering::Less => {
                            return Err(ShiftError::KeyOrder {
                                table: self.table.to_string(),
                                side: self.side,
                                previous: describe_key(last),
                                found: describe_key(&key),
                            });
                        }
                        Ordering::Equal => {
                            return Err(ShiftError::duplicate_key(
                                self.table,
                                self.side,
                                self.key_columns,
                                describe_key(&key),
                            ));
                        }
                        Ordering::Greater => {}
                    }
                }
                self.last_key = Some(key.clone());
                self.rows += 1;
                self.checksum.add(&row, &self.digest_positions);
                return Ok(Some((key, row)));
            }

            if self.exhausted {
                return Ok(None);
            }
            let table = self.table;
            if cancel.is_cancelled() {
                return Err(ShiftError::Cancelled(format!("reconciliation of {} was cancelled", table)));
            }

            let started = Instant::now();
            let batch = tokio::select! {
                batch = self.stream.next_batch() => batch?,
                _ = cancel.cancelled() => {
                    return Err(ShiftError::Cancelled(format!("reconciliation of {} was cancelled", table)));
                }
            };
            self.elapsed += started.elapsed();

            match batch {
                Some(rows) => {
                    self.batches += 1;
                    tracing::debug!(table, side = %self.side, batch = self.batches, rows = rows.len(), "fetched batch");
                    self.buffer.extend(rows);
                }
                None => self.exhausted = true,
            }
        }
    }

    fn stats(&self) -> SideStats {
        SideStats {
            rows: self.rows,
            checksum: self.checksum.hex(),
            elapsed_seconds: self.elapsed.as_secs_f64(),
        }
    }
}

/// Column alignment between the two sides.
struct Layout {
    source_keys: Vec<usize>,
    target_keys: Vec<usize>,
    /// (source position, target position, name)
    compared: Vec<(usize, usize, String)>,
    only_in_source: Vec<String>,
    only_in_target: Vec<String>,
}

impl Layout {
    fn build(source: &[String], target: &[String], options: &ReconcileOptions) -> ShiftResult<Self> {
        let source_keys = key_positions(source, &options.key_columns)
            .map_err(|e| ShiftError::SchemaMismatch(format!("source side: {}", detail(&e))))?;
        let target_keys = key_positions(target, &options.key_columns)
            .map_err(|e| ShiftError::SchemaMismatch(format!("target side: {}", detail(&e))))?;
        let is_key = |name: &str| options.key_columns.iter().any(|k| k.eq_ignore_ascii_case(name));

        let mut compared = Vec::new();
        let mut only_in_source = Vec::new();
        for (si, name) in source.iter().enumerate() {
            if is_key(name.as_str()) || !options.projection.keeps(name) {
                continue;
            }
            match target.iter().position(|t| t.eq_ignore_ascii_case(name)) {
                Some(ti) => compared.push((si, ti, name.clone())),
                None => only_in_source.push(name.clone()),
            }
        }
        let only_in_target = target
            .iter()
            .filter(|name| !is_key(name.as_str()) && options.projection.keeps(name))
            .filter(|name| !source.iter().any(|s| s.eq_ignore_ascii_case(name)))
            .cloned()
            .collect();

        Ok(Self {
            source_keys,
            target_keys,
            compared,
            only_in_source,
            only_in_target,
        })
    }

    fn source_digest(&self) -> Vec<usize> {
        self.source_keys.iter().copied().chain(self.compared.iter().map(|c| c.0)).collect()
    }

    fn target_digest(&self) -> Vec<usize> {
        self.target_keys.iter().copied().chain(self.compared.iter().map(|c| c.1)).collect()
    }
}

fn detail(error: &ShiftError) -> String {
    match error {
        ShiftError::SchemaMismatch(message) => message.clone(),
        other => other.to_string(),
    }
}

fn row_map(columns: &[String], row: &[Value]) -> BTreeMap<String, Value> {
    columns.iter().cloned().zip(row.iter().cloned()).collect()
}

/// Merge-join reconciliation of two key-ordered streams.
#[derive(Debug, Clone)]
pub struct Reconciler {
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Compare `source` against `target`.
    ///
    /// Duplicate or out-of-order keys on either side abort the comparison
    /// with [`ShiftError::KeyUniqueness`] or [`ShiftError::KeyOrder`]; no
    /// partial result is returned.
    pub async fn reconcile(
        &self,
        source_table: &str,
        target_table: &str,
        source: Box<dyn RowSource>,
        target: Box<dyn RowSource>,
        mut sink: Option<&mut dyn DiffSink>,
        cancel: &CancellationToken,
    ) -> ShiftResult<TableReconciliation> {
        let options = &self.options;
        if options.key_columns.is_empty() {
            return Err(ShiftError::Config(format!(
                "no key columns given for {}",
                source_table
            )));
        }

        let source_columns = source.columns().to_vec();
        let target_columns = target.columns().to_vec();
        let layout = Layout::build(&source_columns, &target_columns, options)?;
        let (source_predicate, target_predicate) = match &options.predicate {
            Some(predicate) => (
                Some(predicate.bind(&source_columns)?),
                Some(predicate.bind(&target_columns)?),
            ),
            None => (None, None),
        };

        tracing::info!(
            source_table,
            target_table,
            keys = %options.key_columns.join(","),
            compared = layout.compared.len(),
            "reconciling table"
        );

        let mut src = Cursor::new(
            source,
            Side::Source,
            source_table,
            &options.key_columns,
            layout.source_keys.clone(),
            layout.source_digest(),
            source_predicate,
        );
        let mut tgt = Cursor::new(
            target,
            Side::Target,
            target_table,
            &options.key_columns,
            layout.target_keys.clone(),
            layout.target_digest(),
            target_predicate,
        );

        let mut samples = DifferenceSamples::default();
        let mut rows_not_in_target = 0u64;
        let mut rows_not_in_source = 0u64;
        let mut fields_mismatch = 0u64;
        let mut field_mismatch_counts: BTreeMap<String, u64> = BTreeMap::new();

        let mut emit = |record: DiffRecord, samples: &mut DifferenceSamples| -> ShiftResult<()> {
            if let Some(sink) = sink.as_deref_mut() {
                sink.record(&record)?;
            }
            if samples.len(record.category) < options.sample_limit {
                samples.bucket_mut(record.category).push(record);
            }
            Ok(())
        };
        let key_map = |positions: &[usize], columns: &[String], row: &[Value]| -> BTreeMap<String, Value> {
            positions
                .iter()
                .map(|&i| (columns[i].clone(), row.get(i).cloned().unwrap_or(Value::Null)))
                .collect()
        };

        let mut next_source = src.next(cancel).await?;
        let mut next_target = tgt.next(cancel).await?;
        loop {
            let ordering = match (&next_source, &next_target) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((source_key, _)), Some((target_key, _))) => source_key.cmp(target_key),
            };

            match ordering {
                Ordering::Less => {
                    if let Some((_, row)) = next_source.take() {
                        rows_not_in_target += 1;
                        emit(
                            DiffRecord {
                                category: DiffCategory::NotInTarget,
                                key: key_map(&layout.source_keys, &source_columns, &row),
                                source: Some(row_map(&source_columns, &row)),
                                target: None,
                                fields: Vec::new(),
                            },
                            &mut samples,
                        )?;
                    }
                    next_source = src.next(cancel).await?;
                }
                Ordering::Greater => {
                    if let Some((_, row)) = next_target.take() {
                        rows_not_in_source += 1;
                        emit(
                            DiffRecord {
                                category: DiffCategory::NotInSource,
                                key: key_map(&layout.target_keys, &target_columns, &row),
                                source: None,
                                target: Some(row_map(&target_columns, &row)),
                                fields: Vec::new(),
                            },
                            &mut samples,
                        )?;
                    }
                    next_target = tgt.next(cancel).await?;
                }
                Ordering::Equal => {
                    let (Some((_, source_row)), Some((_, target_row))) = (next_source.take(), next_target.take()) else {
                        break;
                    };
                    let fields: Vec<FieldDiff> = layout
                        .compared
                        .iter()
                        .filter_map(|(si, ti, name)| {
                            let s = source_row.get(*si).cloned().unwrap_or(Value::Null);
                            let t = target_row.get(*ti).cloned().unwrap_or(Value::Null);
                            (!s.same_as(&t)).then(|| FieldDiff {
                                column: name.clone(),
                                source: s,
                                target: t,
                            })
                        })
                        .collect();
                    if !fields.is_empty() {
                        fields_mismatch += 1;
                        for field in &fields {
                            *field_mismatch_counts.entry(field.column.clone()).or_default() += 1;
                        }
                        emit(
                            DiffRecord {
                                category: DiffCategory::FieldsMismatch,
                                key: key_map(&layout.source_keys, &source_columns, &source_row),
                                source: Some(row_map(&source_columns, &source_row)),
                                target: Some(row_map(&target_columns, &target_row)),
                                fields,
                            },
                            &mut samples,
                        )?;
                    }
                    next_source = src.next(cancel).await?;
                    next_target = tgt.next(cancel).await?;
                }
            }
        }
        drop(emit);
        if let Some(sink) = sink.as_deref_mut() {
            sink.finish()?;
        }

        let source_stats = src.stats();
        let target_stats = tgt.stats();
        let result = TableReconciliation {
            source_table: source_table.to_string(),
            target_table: target_table.to_string(),
            key_columns: options.key_columns.clone(),
            compared_columns: layout.compared.iter().map(|c| c.2.clone()).collect(),
            columns_only_in_source: layout.only_in_source,
            columns_only_in_target: layout.only_in_target,
            checksum_match: source_stats.checksum == target_stats.checksum,
            source: source_stats,
            target: target_stats,
            rows_not_in_target,
            rows_not_in_source,
            fields_mismatch,
            field_mismatch_counts,
            samples,
        };

        tracing::info!(
            source_table,
            source_rows = result.source.rows,
            target_rows = result.target.rows,
            not_in_target = result.rows_not_in_target,
            not_in_source = result.rows_not_in_source,
            fields_mismatch = result.fields_mismatch,
            "table reconciled"
        );
        Ok(result)
    }
}
