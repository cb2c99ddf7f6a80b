//! Storage interface: the engine depends only on this capability set, never
//! on a concrete backend. Concrete backends (SQLite here, an in-memory one
//! for tests) implement it; text/BLOB columns in a backend must be
//! treated as opaque, binary-safe data -- hash and prefix bytes are never
//! assumed to be valid UTF-8.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{
    AddChunkRecord, AddRow, FullHash, FullHashErrorState, FullHashRow, MacKeys, SubChunkRecord, SubRow,
    UpdateCursor, HostKey,
};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_add_chunks(&self, hostkey: HostKey) -> Result<Vec<AddRow>, StorageError>;
    async fn get_sub_chunks(&self, hostkey: HostKey) -> Result<Vec<SubRow>, StorageError>;
    async fn get_add_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError>;
    async fn get_sub_chunk_nums(&self, list: &str) -> Result<Vec<u32>, StorageError>;

    async fn store_add_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[AddChunkRecord],
    ) -> Result<(), StorageError>;
    async fn store_sub_chunk(
        &self,
        list: &str,
        chunknum: i32,
        records: &[SubChunkRecord],
    ) -> Result<(), StorageError>;

    async fn delete_add_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError>;
    async fn delete_sub_chunks(&self, list: &str, nums: &[i32]) -> Result<(), StorageError>;

    async fn get_full_hashes(&self, list: &str, chunknum: i32, min_timestamp: u64) -> Result<Vec<FullHash>, StorageError>;
    async fn add_full_hashes(&self, rows: &[FullHashRow]) -> Result<(), StorageError>;
    async fn delete_full_hashes(&self, list: &str, nums: &[i32]) -> Result<(), StorageError>;
    /// Evict every full-hash row older than `cutoff_timestamp`.
    async fn delete_stale_full_hashes(&self, cutoff_timestamp: u64) -> Result<(), StorageError>;

    async fn last_update(&self, list: &str) -> Result<UpdateCursor, StorageError>;
    async fn record_update(&self, list: &str, time: u64, wait: u64) -> Result<(), StorageError>;
    async fn record_update_error(&self, list: &str, time: u64, wait: u64, errors: u32) -> Result<(), StorageError>;

    async fn get_full_hash_error(&self, prefix: &[u8]) -> Result<Option<FullHashErrorState>, StorageError>;
    async fn full_hash_error(&self, prefix: &[u8], timestamp: u64) -> Result<(), StorageError>;
    async fn full_hash_ok(&self, prefix: &[u8]) -> Result<(), StorageError>;

    async fn get_mac_keys(&self) -> Result<Option<MacKeys>, StorageError>;
    async fn set_mac_keys(&self, client_key: &[u8], wrapped_key: &str) -> Result<(), StorageError>;
    async fn clear_mac_keys(&self) -> Result<(), StorageError>;

    /// Evict stale full hashes, then release any resources held.
    async fn close(&self) -> Result<(), StorageError>;
}
