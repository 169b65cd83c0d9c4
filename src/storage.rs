use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::model::{MetaEntry, Page, Record, RecordId};

pub const DEFAULT_MAX_RECORDS: usize = 10_000_000;

/// Read-only view of the records, the only handle the execution engine gets.
pub trait RecordSource: Send + Sync {
    fn get(&self, id: RecordId) -> Option<Arc<Record>>;

    /// All live records, ascending by id.
    fn snapshot(&self) -> Vec<Arc<Record>>;
}

/// Concurrent record store.
///
/// Records live behind `Arc` in a sharded map: a reader clones the `Arc` and
/// never sees a half-written record, and writers only lock the shard that
/// owns the id.
///
/// Lock order is record shard, then index shard. Nothing takes them the other
/// way round.
#[derive(Debug)]
pub struct RecordStore {
    records: DashMap<RecordId, Arc<Record>>,
    meta_index: MetaIndex,
    next_id: AtomicU64,
    live: AtomicUsize,
    max_records: usize,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl RecordStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            meta_index: MetaIndex::default(),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            max_records,
        }
    }

    pub fn create(&self, data: Vec<f64>, meta: Vec<MetaEntry>) -> Result<RecordId> {
        validate_vector(&data)?;
        validate_meta(&meta)?;
        self.reserve(1)?;

        let id = self.insert(data, meta);
        tracing::debug!(id, "record created");
        Ok(id)
    }

    /// Creates a batch of records. Every entry is validated and capacity for
    /// all of them is reserved before the first one is stored, so a bad entry
    /// leaves the store untouched.
    pub fn create_many(&self, batch: Vec<(Vec<f64>, Vec<MetaEntry>)>) -> Result<Vec<RecordId>> {
        for (pos, (data, meta)) in batch.iter().enumerate() {
            validate_vector(data)
                .and_then(|_| validate_meta(meta))
                .map_err(|e| match e {
                    Error::Validation(msg) => Error::Validation(format!("record {} of batch: {}", pos, msg)),
                    other => other,
                })?;
        }
        self.reserve(batch.len())?;

        let ids: Vec<RecordId> = batch.into_iter().map(|(data, meta)| self.insert(data, meta)).collect();
        tracing::debug!(count = ids.len(), "records created");
        Ok(ids)
    }

    fn reserve(&self, count: usize) -> Result<()> {
        let max = self.max_records;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(count).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|_| Error::ResourceExhausted(format!("record store is full ({} records)", max)))
    }

    fn insert(&self, data: Vec<f64>, meta: Vec<MetaEntry>) -> RecordId {
        // Ids come from a monotonic counter and are never handed out twice.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // index entries exist before the record is visible to updates
        self.meta_index.add(id, &meta);
        self.records.insert(id, Arc::new(Record::new(id, data, meta)));
        id
    }

    pub fn read(&self, id: RecordId) -> Result<Record> {
        self.records
            .get(&id)
            .map(|r| r.as_ref().clone())
            .ok_or(Error::RecordNotFound(id))
    }

    /// Replaces whichever parts are given. The swap happens under the shard
    /// lock so readers get either the old or the new record.
    pub fn update(&self, id: RecordId, data: Option<Vec<f64>>, meta: Option<Vec<MetaEntry>>) -> Result<()> {
        if let Some(data) = &data {
            validate_vector(data)?;
        }
        if let Some(meta) = &meta {
            validate_meta(meta)?;
        }

        let mut slot = self.records.get_mut(&id).ok_or(Error::RecordNotFound(id))?;
        let current = slot.value();
        if let Some(meta) = &meta {
            self.meta_index.remove(id, &current.meta);
            self.meta_index.add(id, meta);
        }
        let next = Record::new(
            id,
            data.unwrap_or_else(|| current.data.clone()),
            meta.unwrap_or_else(|| current.meta.clone()),
        );
        *slot.value_mut() = Arc::new(next);

        tracing::debug!(id, "record updated");
        Ok(())
    }

    pub fn delete(&self, id: RecordId) -> Result<()> {
        match self.records.remove(&id) {
            Some((_, record)) => {
                self.meta_index.remove(id, &record.meta);
                self.live.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(id, "record deleted");
                Ok(())
            }
            None => Err(Error::RecordNotFound(id)),
        }
    }

    /// Deletes every listed record that exists and returns how many were
    /// removed. Unknown ids are skipped.
    pub fn delete_many(&self, ids: &[RecordId]) -> usize {
        ids.iter().filter(|id| self.delete(**id).is_ok()).count()
    }

    /// Records whose metadata `name` equals `value`, ascending by id.
    ///
    /// Fails with `MetaNotIndexed` when no record has ever carried `name`.
    /// A name that was indexed once stays known after its records go.
    pub fn find_by_meta(&self, name: &str, value: &str) -> Result<Vec<Record>> {
        let ids = self
            .meta_index
            .lookup(name, value)
            .ok_or_else(|| Error::MetaNotIndexed(name.to_string()))?;

        Ok(ids
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| Arc::clone(r.value())))
            .filter(|r| r.meta(name) == Some(value))
            .map(|r| r.as_ref().clone())
            .collect())
    }

    pub fn list(&self, page: u64, per_page: u64) -> Page<Record> {
        let all: Vec<Record> = self.snapshot().iter().map(|r| r.as_ref().clone()).collect();
        Page::slice(&all, page, per_page)
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSource for RecordStore {
    fn get(&self, id: RecordId) -> Option<Arc<Record>> {
        self.records.get(&id).map(|r| Arc::clone(r.value()))
    }

    fn snapshot(&self) -> Vec<Arc<Record>> {
        let mut all: Vec<Arc<Record>> = self.records.iter().map(|r| Arc::clone(r.value())).collect();
        all.sort_unstable_by_key(|r| r.id);
        all
    }
}

/// Secondary index from a metadata name and value to the ids carrying it.
#[derive(Debug, Default)]
struct MetaIndex {
    by_name: DashMap<String, HashMap<String, BTreeSet<RecordId>>>,
}

impl MetaIndex {
    fn add(&self, id: RecordId, meta: &[MetaEntry]) {
        for entry in meta {
            self.by_name
                .entry(entry.name.clone())
                .or_default()
                .entry(entry.value.clone())
                .or_default()
                .insert(id);
        }
    }

    fn remove(&self, id: RecordId, meta: &[MetaEntry]) {
        for entry in meta {
            if let Some(mut values) = self.by_name.get_mut(&entry.name) {
                if let Some(ids) = values.get_mut(&entry.value) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        values.remove(&entry.value);
                    }
                }
            }
        }
    }

    fn lookup(&self, name: &str, value: &str) -> Option<Vec<RecordId>> {
        let values = self.by_name.get(name)?;
        Some(values.get(value).map(|ids| ids.iter().copied().collect()).unwrap_or_default())
    }
}

fn validate_vector(data: &[f64]) -> Result<()> {
    if data.is_empty() {
        return Err(Error::Validation("vector must not be empty".into()));
    }
    if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
        return Err(Error::Validation(format!("vector element {} is not a finite number", pos)));
    }
    Ok(())
}

fn validate_meta(meta: &[MetaEntry]) -> Result<()> {
    let mut seen = HashSet::with_capacity(meta.len());
    for entry in meta {
        if entry.name.is_empty() {
            return Err(Error::Validation("metadata names must not be empty".into()));
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(Error::Validation(format!("duplicate metadata name '{}'", entry.name)));
        }
    }
    Ok(())
}
