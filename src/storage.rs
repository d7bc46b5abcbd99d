//! Key-value shard persistence
//!
//! Backs the exchange-info cache, candle history, and trader resume state.
//! Values are stored as JSON; time series rows are keyed by millisecond
//! timestamp with explicit coverage spans so readers can distinguish "no
//! data" from "not yet fetched".

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::time::Timestamp;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A contiguous `[start, end)` range a time series has been fetched for.
pub type Span = (Timestamp, Timestamp);

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, shard: &str, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, shard: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Fetched coverage spans overlapping `[start, end)`, in order.
    async fn stream_time_series_spans(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Span>>;

    /// Stored items with `start <= time < end`, in time order.
    async fn stream_time_series(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, serde_json::Value)>>;

    /// Stores items and records `[start, end)` as fetched, atomically from
    /// the point of view of later readers.
    async fn store_time_series_and_span(
        &self,
        shard: &str,
        key: &str,
        items: Vec<(Timestamp, serde_json::Value)>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<()>;
}

/// Typed convenience wrapper over [`Storage::get`].
pub async fn get_typed<T: DeserializeOwned>(
    storage: &dyn Storage,
    shard: &str,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(shard, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed convenience wrapper over [`Storage::set`].
pub async fn set_typed<T: Serialize>(
    storage: &dyn Storage,
    shard: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    storage.set(shard, key, serde_json::to_value(value)?).await
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Process-local backend for backtests and tests.
#[derive(Default)]
pub struct Memory {
    values: Mutex<HashMap<(String, String), serde_json::Value>>,
    series: Mutex<HashMap<(String, String), BTreeMap<Timestamp, serde_json::Value>>>,
    spans: Mutex<HashMap<(String, String), Vec<Span>>>,
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }
}

#[async_trait]
impl Storage for Memory {
    async fn get(&self, shard: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.lock().get(&(shard.to_owned(), key.to_owned())).cloned())
    }

    async fn set(&self, shard: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.lock().insert((shard.to_owned(), key.to_owned()), value);
        Ok(())
    }

    async fn stream_time_series_spans(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Span>> {
        let spans = self.spans.lock();
        let mut result: Vec<Span> = spans
            .get(&(shard.to_owned(), key.to_owned()))
            .map(|spans| {
                spans
                    .iter()
                    .filter(|(s, e)| *s < end && *e > start)
                    .map(|(s, e)| ((*s).max(start), (*e).min(end)))
                    .collect()
            })
            .unwrap_or_default();
        result.sort_unstable();
        Ok(result)
    }

    async fn stream_time_series(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, serde_json::Value)>> {
        let series = self.series.lock();
        Ok(series
            .get(&(shard.to_owned(), key.to_owned()))
            .map(|items| items.range(start..end).map(|(t, v)| (*t, v.clone())).collect())
            .unwrap_or_default())
    }

    async fn store_time_series_and_span(
        &self,
        shard: &str,
        key: &str,
        items: Vec<(Timestamp, serde_json::Value)>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<()> {
        let full_key = (shard.to_owned(), key.to_owned());
        {
            let mut series = self.series.lock();
            let entry = series.entry(full_key.clone()).or_default();
            for (time, value) in items {
                entry.insert(time, value);
            }
        }
        self.spans.lock().entry(full_key).or_default().push((start, end));
        Ok(())
    }
}

// =============================================================================
// SQLite backend
// =============================================================================

/// Durable backend; one database file, one table family per shard.
pub struct Sqlite {
    conn: Mutex<Connection>,
}

impl Sqlite {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(&conn)?;
        Ok(Sqlite { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Sqlite { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                shard TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (shard, key)
            );
            CREATE TABLE IF NOT EXISTS time_series (
                shard TEXT NOT NULL,
                key TEXT NOT NULL,
                time INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (shard, key, time)
            );
            CREATE TABLE IF NOT EXISTS time_series_span (
                shard TEXT NOT NULL,
                key TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl Storage for Sqlite {
    async fn get(&self, shard: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE shard = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![shard, key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, shard: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (shard, key, value) VALUES (?1, ?2, ?3)",
            params![shard, key, serde_json::to_string(&value)?],
        )?;
        Ok(())
    }

    async fn stream_time_series_spans(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Span>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT start_time, end_time FROM time_series_span
             WHERE shard = ?1 AND key = ?2 AND start_time < ?3 AND end_time > ?4
             ORDER BY start_time",
        )?;
        let rows = stmt.query_map(params![shard, key, end as i64, start as i64], |row| {
            let s: i64 = row.get(0)?;
            let e: i64 = row.get(1)?;
            Ok((s as Timestamp, e as Timestamp))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (s, e) = row?;
            result.push((s.max(start), e.min(end)));
        }
        Ok(result)
    }

    async fn stream_time_series(
        &self,
        shard: &str,
        key: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, serde_json::Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, value FROM time_series
             WHERE shard = ?1 AND key = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time",
        )?;
        let rows = stmt.query_map(params![shard, key, start as i64, end as i64], |row| {
            let time: i64 = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((time as Timestamp, raw))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (time, raw) = row?;
            result.push((time, serde_json::from_str(&raw)?));
        }
        Ok(result)
    }

    async fn store_time_series_and_span(
        &self,
        shard: &str,
        key: &str,
        items: Vec<(Timestamp, serde_json::Value)>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO time_series (shard, key, time, value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (time, value) in &items {
                stmt.execute(params![shard, key, *time as i64, serde_json::to_string(value)?])?;
            }
        }
        tx.execute(
            "INSERT INTO time_series_span (shard, key, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
            params![shard, key, start as i64, end as i64],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn roundtrip(storage: &dyn Storage) {
        assert!(storage.get("shard", "key").await.unwrap().is_none());
        storage.set("shard", "key", json!({"a": 1})).await.unwrap();
        assert_eq!(storage.get("shard", "key").await.unwrap(), Some(json!({"a": 1})));

        storage
            .store_time_series_and_span(
                "candle",
                "eth-btc",
                vec![(1000, json!(1)), (2000, json!(2)), (3000, json!(3))],
                1000,
                4000,
            )
            .await
            .unwrap();
        let items = storage.stream_time_series("candle", "eth-btc", 1000, 3000).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], (1000, json!(1)));

        let spans = storage
            .stream_time_series_spans("candle", "eth-btc", 0, 10_000)
            .await
            .unwrap();
        assert_eq!(spans, vec![(1000, 4000)]);
        // Clamped to the queried window.
        let spans = storage
            .stream_time_series_spans("candle", "eth-btc", 2000, 3000)
            .await
            .unwrap();
        assert_eq!(spans, vec![(2000, 3000)]);
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        roundtrip(&Memory::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        roundtrip(&Sqlite::open_in_memory().unwrap()).await;
    }
}
