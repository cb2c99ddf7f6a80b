//! `rusqlite`-backed `Storage` implementation. All connection access runs
//! through `spawn_blocking` so the async engine never stalls on file IO.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::model::{
    AddChunkRecord, AddRow, FullHash, FullHashErrorState, FullHashRow, HostKey, MacKeys,
    SubChunkRecord, SubRow, UpdateCursor,
};

use super::Storage;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;

             CREATE TABLE IF NOT EXISTS add_chunks (
                 list TEXT NOT NULL,
                 chunknum INTEGER NOT NULL,
                 hostkey BLOB NOT NULL,
                 prefix BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS ix_add_chunks_hostkey ON add_chunks(hostkey);
             CREATE INDEX IF NOT EXISTS ix_add_chunks_list_chunknum ON add_chunks(list, chunknum);

             CREATE TABLE IF NOT EXISTS sub_chunks (
                 list TEXT NOT NULL,
                 chunknum INTEGER NOT NULL,
                 add_chunknum INTEGER NOT NULL,
                 hostkey BLOB NOT NULL,
                 prefix BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS ix_sub_chunks_hostkey ON sub_chunks(hostkey);
             CREATE INDEX IF NOT EXISTS ix_sub_chunks_list_chunknum ON sub_chunks(list, chunknum);

             CREATE TABLE IF NOT EXISTS full_hashes (
                 list TEXT NOT NULL,
                 chunknum INTEGER NOT NULL,
                 hash BLOB NOT NULL,
                 timestamp INTEGER NOT NULL,
                 UNIQUE(list, chunknum, hash)
             );
             CREATE INDEX IF NOT EXISTS ix_full_hashes_list_chunknum ON full_hashes(list, chunknum);

             CREATE TABLE IF NOT EXISTS update_cursor (
                 list TEXT PRIMARY KEY,
                 last_update_time INTEGER NOT NULL,
                 next_wait_seconds INTEGER NOT NULL,
                 consecutive_errors INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS full_hash_errors (
                 prefix BLOB PRIMARY KEY,
                 errors INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS mac_keys (
                 id INTEGER PRIMARY KEY CHECK(id = 1),
                 client_key BLOB NOT NULL,
                 wrapped_key TEXT NOT NULL
             );",
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task panicked: {e}")))?
        .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

fn to_hostkey(v: Vec<u8>) -> HostKey {
    let mut h = [0u8; 4];
    let n = v.len().min(4);
    h[..n].copy_from_slice(&v[..n]);
    h
}

fn to_full_hash(v: Vec<u8>) -> FullHash {
    let mut h = [0u8; 32];
    let n = v.len().min(32);
    h[..n].copy_from_slice(&v[..n]);
    h
}

fn in_clause_placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl Storage for SqliteStore {
    async fn get_add_chunks(&self, hostkey: HostKey) -> Result<Vec<AddRow>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunknum, hostkey, prefix, list FROM add_chunks WHERE hostkey = ?1",
            )?;
            let rows = stmt.query_map(params![&hostkey[..]], |row| {
                Ok(AddRow {
                    chunknum: row.get(0)?,
                    hostkey: to_hostkey(row.get(1)?),
                    prefix: row.get(2)?,
                    list: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn get_sub_chunks(&self, hostkey: HostKey) -> Result<Vec<SubRow>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunknum, add_chunknum, hostkey, prefix, list FROM sub_chunks WHERE hostkey = ?1",
            )?;
            let rows = stmt.query_map(params![&hostkey[..]], |row| {
                Ok(SubRow {
                    chunknum: row.get(0)?,
                    add_chunknum: row.get(1)?,
                    hostkey: to_hostkey(row.get(2)?),
                    prefix: row.get(3)?,
                    list: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn get_add_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT chunknum FROM add_chunks WHERE list = ?1 ORDER BY chunknum",
            )?;
            let rows = stmt.query_map(params![list], |row| Ok(row.get::<_, i64>(0)? as u32))?;
            rows.collect()
        })
        .await
    }

    async fn get_sub_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT chunknum FROM sub_chunks WHERE list = ?1 ORDER BY chunknum",
            )?;
            let rows = stmt.query_map(params![list], |row| Ok(row.get::<_, i64>(0)? as u32))?;
            rows.collect()
        })
        .await
    }

    async fn store_add_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[AddChunkRecord],
    ) -> Result<(), StorageError> {
        let list = list.to_string();
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO add_chunks (list, chunknum, hostkey, prefix) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for r in &records {
                    stmt.execute(params![list, chunknum, &r.hostkey[..], &r.prefix])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn store_sub_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[SubChunkRecord],
    ) -> Result<(), StorageError> {
        let list = list.to_string();
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sub_chunks (list, chunknum, add_chunknum, hostkey, prefix) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for r in &records {
                    stmt.execute(params![list, chunknum, r.add_chunknum, &r.hostkey[..], &r.prefix])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        if nums.is_empty() {
            return Ok(());
        }
        let list = list.to_string();
        let nums = nums.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM add_chunks WHERE list = ? AND chunknum IN ({})",
                in_clause_placeholders(nums.len())
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&list];
            for n in &nums {
                params.push(n);
            }
            conn.execute(&sql, params_from_iter(params))?;
            Ok(())
        })
        .await
    }

    async fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        if nums.is_empty() {
            return Ok(());
        }
        let list = list.to_string();
        let nums = nums.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM sub_chunks WHERE list = ? AND chunknum IN ({})",
                in_clause_placeholders(nums.len())
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&list];
            for n in &nums {
                params.push(n);
            }
            conn.execute(&sql, params_from_iter(params))?;
            Ok(())
        })
        .await
    }

    async fn get_full_hashes(&self, list: &str, chunknum: i32, min_timestamp: u64) -> Result<Vec<FullHash>, StorageError> {
        let list = list.to_string();
        let min_timestamp = min_timestamp as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT hash FROM full_hashes WHERE list = ?1 AND chunknum = ?2 AND timestamp >= ?3",
            )?;
            let rows = stmt.query_map(params![list, chunknum, min_timestamp], |row| {
                Ok(to_full_hash(row.get(0)?))
            })?;
            rows.collect()
        })
        .await
    }

    async fn add_full_hashes(&self, rows: &[FullHashRow]) -> Result<(), StorageError> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO full_hashes (list, chunknum, hash, timestamp) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(list, chunknum, hash) DO UPDATE SET timestamp = excluded.timestamp",
                )?;
                for r in &rows {
                    stmt.execute(params![r.list, r.chunknum, &r.hash[..], r.timestamp as i64])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        if nums.is_empty() {
            return Ok(());
        }
        let list = list.to_string();
        let nums = nums.to_vec();
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM full_hashes WHERE list = ? AND chunknum IN ({})",
                in_clause_placeholders(nums.len())
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&list];
            for n in &nums {
                params.push(n);
            }
            conn.execute(&sql, params_from_iter(params))?;
            Ok(())
        })
        .await
    }

    async fn delete_stale_full_hashes(&self, cutoff_timestamp: u64) -> Result<(), StorageError> {
        let cutoff = cutoff_timestamp as i64;
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM full_hashes WHERE timestamp < ?1", params![cutoff])?;
            Ok(())
        })
        .await
    }

    async fn last_update(&self, list: &str) -> Result<UpdateCursor, StorageError> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT last_update_time, next_wait_seconds, consecutive_errors FROM update_cursor WHERE list = ?1",
                params![list],
                |row| {
                    Ok(UpdateCursor {
                        last_update_time: row.get::<_, i64>(0)? as u64,
                        next_wait_seconds: row.get::<_, i64>(1)? as u64,
                        consecutive_errors: row.get::<_, i64>(2)? as u32,
                    })
                },
            )
            .optional()
            .map(|opt| opt.unwrap_or_default())
        })
        .await
    }

    async fn record_update(&self, list: &str, time: u64, wait: u64) -> Result<(), StorageError> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO update_cursor (list, last_update_time, next_wait_seconds, consecutive_errors)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(list) DO UPDATE SET
                     last_update_time = excluded.last_update_time,
                     next_wait_seconds = excluded.next_wait_seconds,
                     consecutive_errors = 0",
                params![list, time as i64, wait as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_update_error(&self, list: &str, time: u64, wait: u64, errors: u32) -> Result<(), StorageError> {
        let list = list.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO update_cursor (list, last_update_time, next_wait_seconds, consecutive_errors)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(list) DO UPDATE SET
                     last_update_time = excluded.last_update_time,
                     next_wait_seconds = excluded.next_wait_seconds,
                     consecutive_errors = excluded.consecutive_errors",
                params![list, time as i64, wait as i64, errors],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_full_hash_error(&self, prefix: &[u8]) -> Result<Option<FullHashErrorState>, StorageError> {
        let prefix = prefix.to_vec();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT errors, timestamp FROM full_hash_errors WHERE prefix = ?1",
                params![prefix],
                |row| {
                    Ok(FullHashErrorState {
                        errors: row.get::<_, i64>(0)? as u32,
                        timestamp: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn full_hash_error(&self, prefix: &[u8], timestamp: u64) -> Result<(), StorageError> {
        let prefix = prefix.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO full_hash_errors (prefix, errors, timestamp) VALUES (?1, 1, ?2)
                 ON CONFLICT(prefix) DO UPDATE SET errors = errors + 1, timestamp = excluded.timestamp",
                params![prefix, timestamp as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn full_hash_ok(&self, prefix: &[u8]) -> Result<(), StorageError> {
        let prefix = prefix.to_vec();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM full_hash_errors WHERE prefix = ?1", params![prefix])?;
            Ok(())
        })
        .await
    }

    async fn get_mac_keys(&self) -> Result<Option<MacKeys>, StorageError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT client_key, wrapped_key FROM mac_keys WHERE id = 1",
                [],
                |row| Ok(MacKeys { client_key: row.get(0)?, wrapped_key: row.get(1)? }),
            )
            .optional()
        })
        .await
    }

    async fn set_mac_keys(&self, client_key: &[u8], wrapped_key: &str) -> Result<(), StorageError> {
        let client_key = client_key.to_vec();
        let wrapped_key = wrapped_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mac_keys (id, client_key, wrapped_key) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET client_key = excluded.client_key, wrapped_key = excluded.wrapped_key",
                params![client_key, wrapped_key],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_mac_keys(&self) -> Result<(), StorageError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM mac_keys WHERE id = 1", [])?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let cutoff = crate::model::now_unix().saturating_sub(crate::model::FULL_HASH_FRESHNESS_SECONDS);
        self.delete_stale_full_hashes(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(hostkey: [u8; 4], prefix: &[u8]) -> AddChunkRecord {
        AddChunkRecord { hostkey, prefix: prefix.to_vec() }
    }

    #[tokio::test]
    async fn schema_is_created_and_chunk_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.store_add_chunk("goog-malware-shavar", 1, &[rec([1, 2, 3, 4], b"abcd")]).await.unwrap();
        let rows = store.get_add_chunks([1, 2, 3, 4]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunknum, 1);
        assert_eq!(rows[0].prefix, b"abcd");
    }

    #[tokio::test]
    async fn delete_add_chunks_requires_matching_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.store_add_chunk("list-a", 5, &[rec([9, 9, 9, 9], b"x")]).await.unwrap();
        store.delete_add_chunks("list-b", &[5]).await.unwrap();
        assert_eq!(store.get_add_chunks([9, 9, 9, 9]).await.unwrap().len(), 1);
        store.delete_add_chunks("list-a", &[5]).await.unwrap();
        assert!(store.get_add_chunks([9, 9, 9, 9]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_hash_ok_removes_the_row_instead_of_zeroing_it() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.full_hash_error(b"pfx1", 1000).await.unwrap();
        store.full_hash_error(b"pfx1", 1001).await.unwrap();
        assert_eq!(store.get_full_hash_error(b"pfx1").await.unwrap().unwrap().errors, 2);
        store.full_hash_ok(b"pfx1").await.unwrap();
        assert!(store.get_full_hash_error(b"pfx1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_cursor_persists_per_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.record_update("list-a", 5000, 1800).await.unwrap();
        store.record_update_error("list-b", 5000, 60, 1).await.unwrap();
        assert_eq!(store.last_update("list-a").await.unwrap().consecutive_errors, 0);
        assert_eq!(store.last_update("list-b").await.unwrap().consecutive_errors, 1);
        assert_eq!(store.last_update("list-c").await.unwrap(), UpdateCursor::default());
    }

    #[tokio::test]
    async fn stale_full_hashes_are_evicted_on_close() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_full_hashes(&[FullHashRow { list: "list-a".into(), chunknum: 1, hash: [7u8; 32], timestamp: 1 }])
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(store.get_full_hashes("list-a", 1, 0).await.unwrap().is_empty());
    }
}
