//! In-memory `Storage` backend. Used by the test suite and by anything that
//! wants a disposable list cache; no file ever touches disk.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{
    AddChunkRecord, AddRow, FullHash, FullHashErrorState, FullHashRow, HostKey, MacKeys,
    SubChunkRecord, SubRow, UpdateCursor,
};

use super::Storage;

#[derive(Default)]
struct Inner {
    add_rows: Vec<AddRow>,
    sub_rows: Vec<SubRow>,
    full_hashes: Vec<FullHashRow>,
    cursors: HashMap<String, UpdateCursor>,
    full_hash_errors: HashMap<Vec<u8>, FullHashErrorState>,
    mac_keys: Option<MacKeys>,
}

pub struct MemoryStore(Mutex<Inner>);

impl MemoryStore {
    pub fn new() -> Self {
        Self(Mutex::new(Inner::default()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_add_chunks(&self, hostkey: HostKey) -> Result<Vec<AddRow>, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner.add_rows.iter().filter(|r| r.hostkey == hostkey).cloned().collect())
    }

    async fn get_sub_chunks(&self, hostkey: HostKey) -> Result<Vec<SubRow>, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner.sub_rows.iter().filter(|r| r.hostkey == hostkey).cloned().collect())
    }

    async fn get_add_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError> {
        let inner = self.0.lock().unwrap();
        let mut nums: Vec<u32> = inner
            .add_rows
            .iter()
            .filter(|r| r.list == list)
            .map(|r| r.chunknum as u32)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        Ok(nums)
    }

    async fn get_sub_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError> {
        let inner = self.0.lock().unwrap();
        let mut nums: Vec<u32> = inner
            .sub_rows
            .iter()
            .filter(|r| r.list == list)
            .map(|r| r.chunknum as u32)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        Ok(nums)
    }

    async fn store_add_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[AddChunkRecord],
    ) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        for r in records {
            inner.add_rows.push(AddRow {
                chunknum,
                hostkey: r.hostkey,
                prefix: r.prefix.clone(),
                list: list.to_string(),
            });
        }
        Ok(())
    }

    async fn store_sub_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[SubChunkRecord],
    ) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        for r in records {
            inner.sub_rows.push(SubRow {
                chunknum,
                add_chunknum: r.add_chunknum,
                hostkey: r.hostkey,
                prefix: r.prefix.clone(),
                list: list.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.add_rows.retain(|r| !(r.list == list && nums.contains(&r.chunknum)));
        Ok(())
    }

    async fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.sub_rows.retain(|r| !(r.list == list && nums.contains(&r.chunknum)));
        Ok(())
    }

    async fn get_full_hashes(&self, list: &str, chunknum: i32, min_timestamp: u64) -> Result<Vec<FullHash>, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .full_hashes
            .iter()
            .filter(|r| r.list == list && r.chunknum == chunknum && r.timestamp >= min_timestamp)
            .map(|r| r.hash)
            .collect())
    }

    async fn add_full_hashes(&self, rows: &[FullHashRow]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        for row in rows {
            if let Some(existing) = inner
                .full_hashes
                .iter_mut()
                .find(|r| r.list == row.list && r.chunknum == row.chunknum && r.hash == row.hash)
            {
                existing.timestamp = row.timestamp;
            } else {
                inner.full_hashes.push(row.clone());
            }
        }
        Ok(())
    }

    async fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.full_hashes.retain(|r| !(r.list == list && nums.contains(&r.chunknum)));
        Ok(())
    }

    async fn delete_stale_full_hashes(&self, cutoff_timestamp: u64) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.full_hashes.retain(|r| r.timestamp >= cutoff_timestamp);
        Ok(())
    }

    async fn last_update(&self, list: &str) -> Result<UpdateCursor, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner.cursors.get(list).copied().unwrap_or_default())
    }

    async fn record_update(&self, list: &str, time: u64, wait: u64) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.cursors.insert(
            list.to_string(),
            UpdateCursor { last_update_time: time, next_wait_seconds: wait, consecutive_errors: 0 },
        );
        Ok(())
    }

    async fn record_update_error(&self, list: &str, time: u64, wait: u64, errors: u32) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.cursors.insert(
            list.to_string(),
            UpdateCursor { last_update_time: time, next_wait_seconds: wait, consecutive_errors: errors },
        );
        Ok(())
    }

    async fn get_full_hash_error(&self, prefix: &[u8]) -> Result<Option<FullHashErrorState>, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner.full_hash_errors.get(prefix).copied())
    }

    async fn full_hash_error(&self, prefix: &[u8], timestamp: u64) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        let entry = inner.full_hash_errors.entry(prefix.to_vec()).or_insert(FullHashErrorState { errors: 0, timestamp });
        entry.errors += 1;
        entry.timestamp = timestamp;
        Ok(())
    }

    async fn full_hash_ok(&self, prefix: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.full_hash_errors.remove(prefix);
        Ok(())
    }

    async fn get_mac_keys(&self) -> Result<Option<MacKeys>, StorageError> {
        let inner = self.0.lock().unwrap();
        Ok(inner.mac_keys.clone())
    }

    async fn set_mac_keys(&self, client_key: &[u8], wrapped_key: &str) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.mac_keys = Some(MacKeys { client_key: client_key.to_vec(), wrapped_key: wrapped_key.to_string() });
        Ok(())
    }

    async fn clear_mac_keys(&self) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.mac_keys = None;
        Ok(())
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
    async fn stores_and_retrieves_add_chunk_rows_by_hostkey() {
        let store = MemoryStore::new();
        store.store_add_chunk("goog-malware-shavar", 1, &[rec([1, 2, 3, 4], b"abcd")]).await.unwrap();
        let rows = store.get_add_chunks([1, 2, 3, 4]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].prefix, b"abcd");

        assert!(store.get_add_chunks([9, 9, 9, 9]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_add_chunks_is_scoped_to_list() {
        let store = MemoryStore::new();
        store.store_add_chunk("list-a", 1, &[rec([1, 1, 1, 1], b"a")]).await.unwrap();
        store.store_add_chunk("list-b", 1, &[rec([1, 1, 1, 1], b"b")]).await.unwrap();
        store.delete_add_chunks("list-a", &[1]).await.unwrap();
        let rows = store.get_add_chunks([1, 1, 1, 1]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].list, "list-b");
    }

    #[tokio::test]
    async fn full_hash_ok_deletes_the_error_row_entirely() {
        let store = MemoryStore::new();
        store.full_hash_error(b"abcd", 1000).await.unwrap();
        assert!(store.get_full_hash_error(b"abcd").await.unwrap().is_some());
        store.full_hash_ok(b"abcd").await.unwrap();
        assert!(store.get_full_hash_error(b"abcd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_update_error_does_not_leak_across_lists() {
        let store = MemoryStore::new();
        store.record_update("list-a", 1000, 1800).await.unwrap();
        store.record_update_error("list-b", 1000, 60, 1).await.unwrap();
        assert_eq!(store.last_update("list-a").await.unwrap().consecutive_errors, 0);
        assert_eq!(store.last_update("list-b").await.unwrap().consecutive_errors, 1);
    }

    #[tokio::test]
    async fn mac_keys_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_mac_keys().await.unwrap().is_none());
        store.set_mac_keys(b"key-bytes", "wrapped").await.unwrap();
        let keys = store.get_mac_keys().await.unwrap().unwrap();
        assert_eq!(keys.client_key, b"key-bytes");
        store.clear_mac_keys().await.unwrap();
        assert!(store.get_mac_keys().await.unwrap().is_none());
    }
}
