use super::{record_size, CappedOptions, Filter, ObjectId, Position, Record, Storage, ID_KEY};
use crate::error::{MongormError, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// SQLite-backed storage. Every collection lives in one `documents` table;
/// the autoincrement `seq` column is the insertion position.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    poll_interval: Duration,
}

impl SqliteStorage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let storage = SqliteStorage {
            conn: Mutex::new(conn),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        storage.initialize_tables()?;
        Ok(storage)
    }

    /// Upper bound on the sleep between re-polls while tailing.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MongormError::Persistence("sqlite connection lock poisoned".into()))
    }

    fn initialize_tables(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                capped INTEGER NOT NULL DEFAULT 0,
                max_records INTEGER,
                max_bytes INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                size INTEGER NOT NULL,
                data_json TEXT NOT NULL,
                UNIQUE (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, seq);
            ",
        )?;
        Ok(())
    }
}

fn capped_options(conn: &Connection, collection: &str) -> Result<Option<Option<CappedOptions>>> {
    let row = conn
        .query_row(
            "SELECT capped, max_records, max_bytes FROM collections WHERE name = ?1",
            params![collection],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((capped, max_records, max_bytes)) = row else {
        return Ok(None);
    };
    if !capped {
        return Ok(Some(None));
    }
    Ok(Some(Some(CappedOptions {
        max_records: max_records.map(from_sql_int).transpose()?,
        max_bytes: max_bytes.map(from_sql_int).transpose()?,
    })))
}

/// SQLite integers are signed; bounds and sizes above `i64::MAX` do not fit.
fn to_sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        MongormError::Persistence(format!("{what} {value} is too large for SQLite storage"))
    })
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| MongormError::Persistence(format!("negative value {value} in SQLite storage")))
}

fn evict_overflow(tx: &Transaction<'_>, collection: &str, capped: &CappedOptions) -> Result<()> {
    loop {
        let (count, bytes): (i64, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM documents WHERE collection = ?1",
            params![collection],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if count <= 1 || !capped.is_exceeded(from_sql_int(count)?, from_sql_int(bytes)?) {
            return Ok(());
        }
        tx.execute(
            "DELETE FROM documents WHERE seq = (SELECT MIN(seq) FROM documents WHERE collection = ?1)",
            params![collection],
        )?;
        log::debug!("Evicted oldest record from capped collection '{collection}'");
    }
}

fn parse_record(data_json: &str) -> Result<Record> {
    Ok(serde_json::from_str(data_json)?)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

impl Storage for SqliteStorage {
    fn insert(&self, collection: &str, mut record: Record) -> Result<ObjectId> {
        let id = match record.get(ID_KEY) {
            Some(serde_json::Value::String(s)) => ObjectId::parse(s)?,
            None | Some(serde_json::Value::Null) => ObjectId::generate(),
            Some(other) => {
                return Err(MongormError::Persistence(format!(
                    "Record _id must be a string, got {other}"
                )))
            }
        };
        record.insert(ID_KEY.into(), serde_json::Value::String(id.to_string()));
        let size = record_size(&record);
        let data_json = serde_json::to_string(&record)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
            params![collection],
        )?;
        let capped = capped_options(&tx, collection)?.flatten();
        if let Some(max) = capped.and_then(|c| c.max_bytes) {
            if size > max {
                return Err(MongormError::Persistence(format!(
                    "Record of {size} bytes exceeds capped collection '{collection}' bound of {max} bytes"
                )));
            }
        }

        let inserted = tx.execute(
            "INSERT INTO documents (collection, id, size, data_json) VALUES (?1, ?2, ?3, ?4)",
            params![collection, id.as_str(), to_sql_int(size, "record size")?, data_json],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(MongormError::Persistence(format!(
                    "Duplicate key: {collection}/{id}"
                )))
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(capped) = &capped {
            evict_overflow(&tx, collection, capped)?;
        }
        tx.commit()?;
        Ok(id)
    }

    fn replace(&self, collection: &str, id: &ObjectId, mut record: Record) -> Result<()> {
        record.insert(ID_KEY.into(), serde_json::Value::String(id.to_string()));
        let size = record_size(&record);
        let data_json = serde_json::to_string(&record)?;

        let conn = self.lock()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT size FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing_size) = existing else {
            return Err(MongormError::Persistence(format!(
                "No record {collection}/{id} to replace"
            )));
        };
        let capped = capped_options(&conn, collection)?.flatten();
        if capped.is_some() && size > from_sql_int(existing_size)? {
            return Err(MongormError::Persistence(format!(
                "Cannot grow record {collection}/{id} in a capped collection"
            )));
        }

        conn.execute(
            "UPDATE documents SET data_json = ?1, size = ?2 WHERE collection = ?3 AND id = ?4",
            params![data_json, to_sql_int(size, "record size")?, collection, id.as_str()],
        )?;
        Ok(())
    }

    fn delete(&self, collection: &str, id: &ObjectId) -> Result<()> {
        let removed = self.lock()?.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id.as_str()],
        )?;
        if removed == 0 {
            return Err(MongormError::Persistence(format!(
                "No record {collection}/{id} to delete"
            )));
        }
        Ok(())
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let rows: Vec<String> = match filter.id() {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT data_json FROM documents WHERE collection = ?1 AND id = ?2 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![collection, id], |row| row.get(0))?;
                let collected = rows.collect::<rusqlite::Result<Vec<String>>>()?;
                collected
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT data_json FROM documents WHERE collection = ?1 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![collection], |row| row.get(0))?;
                let collected = rows.collect::<rusqlite::Result<Vec<String>>>()?;
                collected
            }
        };
        drop(conn);

        let mut records = Vec::new();
        for data_json in &rows {
            let record = parse_record(data_json)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn get(&self, collection: &str, id: &ObjectId) -> Result<Option<Record>> {
        let data_json: Option<String> = self
            .lock()?
            .query_row(
                "SELECT data_json FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data_json.as_deref().map(parse_record).transpose()
    }

    fn ensure_capped(&self, collection: &str, options: &CappedOptions) -> Result<()> {
        options.check()?;
        let max_records = options
            .max_records
            .map(|n| to_sql_int(n, "max_records"))
            .transpose()?;
        let max_bytes = options
            .max_bytes
            .map(|n| to_sql_int(n, "max_bytes"))
            .transpose()?;
        let conn = self.lock()?;
        match capped_options(&conn, collection)? {
            None => {
                conn.execute(
                    "INSERT INTO collections (name, capped, max_records, max_bytes) VALUES (?1, 1, ?2, ?3)",
                    params![collection, max_records, max_bytes],
                )?;
                log::debug!("Created capped collection '{collection}' ({options:?})");
                Ok(())
            }
            Some(Some(existing)) => {
                if existing != *options {
                    log::warn!(
                        "Capped collection '{collection}' already exists with {existing:?}; ignoring {options:?}"
                    );
                }
                Ok(())
            }
            Some(None) => Err(MongormError::Persistence(format!(
                "Collection '{collection}' already exists and is not capped"
            ))),
        }
    }

    fn is_capped(&self, collection: &str) -> Result<bool> {
        let conn = self.lock()?;
        Ok(matches!(capped_options(&conn, collection)?, Some(Some(_))))
    }

    fn collection_exists(&self, collection: &str) -> Result<bool> {
        let conn = self.lock()?;
        Ok(capped_options(&conn, collection)?.is_some())
    }

    fn last_position(&self, collection: &str) -> Result<Position> {
        let seq: i64 = self.lock()?.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(Position(from_sql_int(seq)?))
    }

    fn tail(&self, collection: &str, after: Position, wait: Duration) -> Result<Vec<(Position, Record)>> {
        let deadline = Instant::now() + wait;
        loop {
            let rows: Vec<(i64, String)> = {
                let conn = self.lock()?;
                let mut stmt = conn.prepare(
                    "SELECT seq, data_json FROM documents WHERE collection = ?1 AND seq > ?2 ORDER BY seq",
                )?;
                let after = to_sql_int(after.0, "position")?;
                let rows = stmt.query_map(params![collection, after], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                let collected = rows.collect::<rusqlite::Result<Vec<(i64, String)>>>()?;
                collected
            };

            if !rows.is_empty() {
                let mut batch = Vec::with_capacity(rows.len());
                for (seq, data_json) in &rows {
                    batch.push((Position(from_sql_int(*seq)?), parse_record(data_json)?));
                }
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_oversized_capped_bound_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let result = storage.ensure_capped("events", &CappedOptions::records(u64::MAX));
        assert!(matches!(result, Err(MongormError::Persistence(_))));
        assert!(!storage.collection_exists("events").unwrap());

        let result = storage.ensure_capped("events", &CappedOptions::bytes(i64::MAX as u64 + 1));
        assert!(matches!(result, Err(MongormError::Persistence(_))));

        storage
            .ensure_capped("events", &CappedOptions::records(i64::MAX as u64))
            .unwrap();
        assert!(storage.is_capped("events").unwrap());
    }

    #[test]
    fn test_insert_get_replace_delete() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let id = storage.insert("users", record(json!({ "name": "Alice" }))).unwrap();

        let stored = storage.get("users", &id).unwrap().unwrap();
        assert_eq!(stored["name"], json!("Alice"));
        assert_eq!(stored["_id"], json!(id.as_str()));

        storage
            .replace("users", &id, record(json!({ "name": "Alicia" })))
            .unwrap();
        let found = storage
            .find("users", &Filter::new().eq("name", "Alicia"))
            .unwrap();
        assert_eq!(found.len(), 1);

        storage.delete("users", &id).unwrap();
        assert!(storage.get("users", &id).unwrap().is_none());
        assert!(storage.delete("users", &id).is_err());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let id = storage.insert("users", record(json!({}))).unwrap();
        let result = storage.insert("users", record(json!({ "_id": id.as_str() })));
        assert!(matches!(result, Err(MongormError::Persistence(_))));
    }

    #[test]
    fn test_capped_evicts_oldest() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.ensure_capped("events", &CappedOptions::records(2)).unwrap();
        for n in 0..4 {
            storage.insert("events", record(json!({ "n": n }))).unwrap();
        }
        let all = storage.find("events", &Filter::new()).unwrap();
        let ns: Vec<i64> = all.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[test]
    fn test_capped_rejects_growth() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.ensure_capped("events", &CappedOptions::records(5)).unwrap();
        let id = storage.insert("events", record(json!({ "n": 1 }))).unwrap();
        let result = storage.replace("events", &id, record(json!({ "n": 1, "extra": "longer" })));
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_capped_on_plain_collection_fails() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.insert("users", record(json!({}))).unwrap();
        assert!(storage
            .ensure_capped("users", &CappedOptions::records(5))
            .is_err());
        assert!(!storage.is_capped("users").unwrap());
        assert!(storage.collection_exists("users").unwrap());
        assert!(!storage.collection_exists("nope").unwrap());
    }

    #[test]
    fn test_tail_positions() {
        let storage = SqliteStorage::open_in_memory()
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        storage.ensure_capped("events", &CappedOptions::records(10)).unwrap();
        storage.insert("events", record(json!({ "n": 0 }))).unwrap();
        let last = storage.last_position("events").unwrap();

        let empty = storage.tail("events", last, Duration::from_millis(20)).unwrap();
        assert!(empty.is_empty());

        storage.insert("events", record(json!({ "n": 1 }))).unwrap();
        let batch = storage.tail("events", last, Duration::from_millis(20)).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].0 > last);
        assert_eq!(batch[0].1["n"], json!(1));
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_system.db");
        let id = {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.ensure_capped("events", &CappedOptions::records(3)).unwrap();
            storage.insert("events", record(json!({ "n": 1 }))).unwrap()
        };
        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.is_capped("events").unwrap());
        assert!(storage.get("events", &id).unwrap().is_some());
    }
}
