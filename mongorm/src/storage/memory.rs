use super::{record_size, CappedOptions, Filter, ObjectId, Position, Record, Storage, ID_KEY};
use crate::error::{MongormError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// In-process storage. Tailing readers are woken as soon as a record is appended.
#[derive(Default)]
pub struct MemoryStorage {
    collections: Mutex<HashMap<String, CollectionState>>,
    appended: Condvar,
}

#[derive(Default)]
struct CollectionState {
    records: VecDeque<StoredRecord>,
    last_position: u64,
    capped: Option<CappedOptions>,
    bytes: u64,
}

struct StoredRecord {
    position: Position,
    id: ObjectId,
    size: u64,
    record: Record,
}

impl CollectionState {
    fn index_of(&self, id: &ObjectId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    fn evict_overflow(&mut self, collection: &str) {
        let Some(capped) = self.capped else { return };
        while self.records.len() > 1 && capped.is_exceeded(self.records.len() as u64, self.bytes) {
            if let Some(evicted) = self.records.pop_front() {
                self.bytes -= evicted.size;
                log::debug!(
                    "Evicted {collection}/{} at position {} from capped collection",
                    evicted.id,
                    evicted.position
                );
            }
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CollectionState>>> {
        self.collections
            .lock()
            .map_err(|_| MongormError::Persistence("memory storage lock poisoned".into()))
    }
}

fn record_id(record: &Record) -> Result<Option<ObjectId>> {
    match record.get(ID_KEY) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => ObjectId::parse(s).map(Some),
        Some(other) => Err(MongormError::Persistence(format!(
            "Record _id must be a string, got {other}"
        ))),
    }
}

impl Storage for MemoryStorage {
    fn insert(&self, collection: &str, mut record: Record) -> Result<ObjectId> {
        let mut collections = self.lock()?;
        let state = collections.entry(collection.to_string()).or_default();

        let id = match record_id(&record)? {
            Some(id) => {
                if state.index_of(&id).is_some() {
                    return Err(MongormError::Persistence(format!(
                        "Duplicate key: {collection}/{id}"
                    )));
                }
                id
            }
            None => ObjectId::generate(),
        };
        record.insert(ID_KEY.into(), serde_json::Value::String(id.to_string()));

        let size = record_size(&record);
        if let Some(max) = state.capped.and_then(|c| c.max_bytes) {
            if size > max {
                return Err(MongormError::Persistence(format!(
                    "Record of {size} bytes exceeds capped collection '{collection}' bound of {max} bytes"
                )));
            }
        }

        state.last_position += 1;
        state.records.push_back(StoredRecord {
            position: Position(state.last_position),
            id: id.clone(),
            size,
            record,
        });
        state.bytes += size;
        state.evict_overflow(collection);
        drop(collections);

        self.appended.notify_all();
        Ok(id)
    }

    fn replace(&self, collection: &str, id: &ObjectId, mut record: Record) -> Result<()> {
        let mut collections = self.lock()?;
        let state = collections.get_mut(collection);
        let Some((state, index)) = state.and_then(|s| s.index_of(id).map(|i| (s, i))) else {
            return Err(MongormError::Persistence(format!(
                "No record {collection}/{id} to replace"
            )));
        };

        record.insert(ID_KEY.into(), serde_json::Value::String(id.to_string()));
        let size = record_size(&record);
        let stored = &mut state.records[index];
        if state.capped.is_some() && size > stored.size {
            return Err(MongormError::Persistence(format!(
                "Cannot grow record {collection}/{id} in a capped collection"
            )));
        }
        state.bytes = state.bytes - stored.size + size;
        stored.size = size;
        stored.record = record;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &ObjectId) -> Result<()> {
        let mut collections = self.lock()?;
        let state = collections.get_mut(collection);
        let Some((state, index)) = state.and_then(|s| s.index_of(id).map(|i| (s, i))) else {
            return Err(MongormError::Persistence(format!(
                "No record {collection}/{id} to delete"
            )));
        };
        if let Some(removed) = state.records.remove(index) {
            state.bytes -= removed.size;
        }
        Ok(())
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|state| {
                state
                    .records
                    .iter()
                    .filter(|r| filter.matches(&r.record))
                    .map(|r| r.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get(&self, collection: &str, id: &ObjectId) -> Result<Option<Record>> {
        let collections = self.lock()?;
        Ok(collections.get(collection).and_then(|state| {
            state
                .index_of(id)
                .map(|index| state.records[index].record.clone())
        }))
    }

    fn ensure_capped(&self, collection: &str, options: &CappedOptions) -> Result<()> {
        options.check()?;
        let mut collections = self.lock()?;
        match collections.get_mut(collection) {
            None => {
                collections.insert(
                    collection.to_string(),
                    CollectionState {
                        capped: Some(*options),
                        ..CollectionState::default()
                    },
                );
                log::debug!("Created capped collection '{collection}' ({options:?})");
                Ok(())
            }
            Some(state) => match state.capped {
                Some(existing) => {
                    if existing != *options {
                        log::warn!(
                            "Capped collection '{collection}' already exists with {existing:?}; ignoring {options:?}"
                        );
                    }
                    Ok(())
                }
                None => Err(MongormError::Persistence(format!(
                    "Collection '{collection}' already exists and is not capped"
                ))),
            },
        }
    }

    fn is_capped(&self, collection: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .get(collection)
            .map_or(false, |state| state.capped.is_some()))
    }

    fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(collection))
    }

    fn last_position(&self, collection: &str) -> Result<Position> {
        Ok(self
            .lock()?
            .get(collection)
            .map_or(Position::START, |state| Position(state.last_position)))
    }

    fn tail(&self, collection: &str, after: Position, wait: Duration) -> Result<Vec<(Position, Record)>> {
        let deadline = Instant::now() + wait;
        let mut collections = self.lock()?;
        loop {
            if let Some(state) = collections.get(collection) {
                let batch: Vec<(Position, Record)> = state
                    .records
                    .iter()
                    .filter(|r| r.position > after)
                    .map(|r| (r.position, r.record.clone()))
                    .collect();
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            collections = self
                .appended
                .wait_timeout(collections, deadline - now)
                .map_err(|_| MongormError::Persistence("memory storage lock poisoned".into()))?
                .0;
        }
    }
}
