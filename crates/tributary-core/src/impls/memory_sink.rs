//! InMemorySink - keyed record store for tests and the demo binary.
//!
//! Mirrors a table with a unique key: a second insert for the same key is an
//! idempotent no-op reported as `AlreadyPresent`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Item, RecordKey, StoredRecord};
use crate::ports::{InsertOutcome, Sink, SinkError};

#[derive(Default)]
struct Table {
    rows: Vec<StoredRecord>,
    index: HashMap<RecordKey, usize>,
}

pub struct InMemorySink {
    table: Mutex<Table>,
    available: AtomicBool,
    insert_calls: AtomicU64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::default()),
            available: AtomicBool::new(true),
            insert_calls: AtomicU64::new(0),
        }
    }

    /// Simulate an unreachable store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Rows in insertion order.
    pub async fn records(&self) -> Vec<StoredRecord> {
        self.table.lock().await.rows.clone()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, key: &RecordKey) -> Option<StoredRecord> {
        let table = self.table.lock().await;
        table.index.get(key).map(|&i| table.rows[i].clone())
    }

    /// Number of `insert` calls, duplicates included.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), SinkError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SinkError::Connection("in-memory sink unavailable".to_string()))
        }
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn insert(&self, item: &Item) -> Result<InsertOutcome, SinkError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let record = StoredRecord::from_item(item);
        let mut table = self.table.lock().await;
        if table.index.contains_key(&record.key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        let at = table.rows.len();
        table.index.insert(record.key.clone(), at);
        table.rows.push(record);
        Ok(InsertOutcome::Inserted)
    }

    async fn ping(&self) -> Result<(), SinkError> {
        self.check_available()
    }
}
