//! Batched, key-ordered row streams.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ShiftError, ShiftResult};

use super::value::{Key, Row, Value};

/// A stream of rows ordered by the requested key columns.
///
/// Implementations must yield rows in non-decreasing key order using the
/// canonical text form of the key values; the reconciler verifies this.
#[async_trait]
pub trait RowSource: Send {
    /// Column names, in row order.
    fn columns(&self) -> &[String];

    /// Next batch of rows, or `None` when the stream is exhausted.
    async fn next_batch(&mut self) -> ShiftResult<Option<Vec<Row>>>;
}

/// Row source fed by a producer task through a bounded channel.
///
/// Dropping the source closes the channel, which stops the producer and
/// releases whatever connection it holds.
pub struct ChannelSource {
    columns: Vec<String>,
    receiver: mpsc::Receiver<ShiftResult<Vec<Row>>>,
}

impl ChannelSource {
    /// Create the source and the sender half for the producer. `depth` is the
    /// number of batches allowed in flight.
    pub fn channel(columns: Vec<String>, depth: usize) -> (mpsc::Sender<ShiftResult<Vec<Row>>>, Self) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        (sender, Self { columns, receiver })
    }
}

#[async_trait]
impl RowSource for ChannelSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_batch(&mut self) -> ShiftResult<Option<Vec<Row>>> {
        match self.receiver.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Row source over rows already in memory, served in fixed-size batches.
pub struct VecSource {
    columns: Vec<String>,
    rows: VecDeque<Row>,
    batch_size: usize,
    delay: Option<Duration>,
}

impl VecSource {
    /// Rows are served in the given order.
    pub fn new(columns: Vec<String>, rows: Vec<Row>, batch_size: usize) -> Self {
        Self {
            columns,
            rows: rows.into(),
            batch_size: batch_size.max(1),
            delay: None,
        }
    }

    /// Rows are sorted by `key_columns` first, the way `ORDER BY` would.
    pub fn sorted(columns: Vec<String>, mut rows: Vec<Row>, key_columns: &[String], batch_size: usize) -> ShiftResult<Self> {
        let positions = key_positions(&columns, key_columns)?;
        rows.sort_by_cached_key(|row| key_of(row, &positions));
        Ok(Self::new(columns, rows, batch_size))
    }

    /// Sleep before each batch; simulates a slow database.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl RowSource for VecSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_batch(&mut self) -> ShiftResult<Option<Vec<Row>>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let take = self.batch_size.min(self.rows.len());
        Ok(Some(self.rows.drain(..take).collect()))
    }
}

/// Positions of `names` within `columns`, matched case-insensitively.
pub fn key_positions(columns: &[String], names: &[String]) -> ShiftResult<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(name))
                .ok_or_else(|| ShiftError::SchemaMismatch(format!("key column '{}' does not exist", name)))
        })
        .collect()
}

/// Canonical key of a row.
pub fn key_of(row: &[Value], positions: &[usize]) -> Key {
    positions
        .iter()
        .map(|&i| row.get(i).and_then(Value::canonical))
        .collect()
}

/// Column include/exclude lists applied to non-key columns before comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Projection {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Whether a non-key column takes part in the comparison.
    pub fn keeps(&self, column: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|c| c.eq_ignore_ascii_case(column));
        included && !self.exclude.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_vec_source_batches() {
        let rows: Vec<Row> = (0..5).map(|i| vec![Value::Int(i)]).collect();
        let mut source = VecSource::new(names(&["ID"]), rows, 2);
        let mut sizes = Vec::new();
        while let Some(batch) = source.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_sorted_uses_text_order() {
        let rows: Vec<Row> = [9, 10, 1].iter().map(|i| vec![Value::Int(*i)]).collect();
        let mut source = VecSource::sorted(names(&["ID"]), rows, &names(&["id"]), 10).unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch, vec![vec![Value::Int(1)], vec![Value::Int(10)], vec![Value::Int(9)]]);
    }

    #[tokio::test]
    async fn test_channel_source() {
        let (sender, mut source) = ChannelSource::channel(names(&["A"]), 1);
        tokio::spawn(async move {
            let _ = sender.send(Ok(vec![vec![Value::Int(1)]])).await;
            let _ = sender.send(Err(ShiftError::Execution("boom".into()))).await;
        });
        assert_eq!(source.next_batch().await.unwrap().unwrap().len(), 1);
        assert!(source.next_batch().await.is_err());
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[test]
    fn test_projection() {
        let all = Projection::default();
        assert!(all.keeps("NAME"));
        let some = Projection::new(names(&["name", "amount"]), names(&["AMOUNT"]));
        assert!(some.keeps("NAME"));
        assert!(!some.keeps("AMOUNT"));
        assert!(!some.keeps("OTHER"));
    }

    #[test]
    fn test_missing_key_column() {
        assert!(key_positions(&names(&["A"]), &names(&["B"])).is_err());
    }
}
