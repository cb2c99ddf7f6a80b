//! Core data-model types shared between the engine and storage backends.
//!
//! Mirrors the record shapes in the protocol's data model: add/sub chunk
//! rows, full-hash rows, per-list update cursors, and MAC keys. Hash and
//! prefix fields are plain byte buffers throughout -- never text columns --
//! so storage backends stay binary-safe.

use std::time::{SystemTime, UNIX_EPOCH};

pub type ListName = String;

/// 4-byte SHA-256 prefix of a canonical host suffix.
pub type HostKey = [u8; 4];

/// SHA-256 prefix of a canonical URL string, normally 4 bytes but the wire
/// format allows other lengths (and an empty prefix means "whole host").
pub type Prefix = Vec<u8>;

/// A complete 32-byte SHA-256 hash.
pub type FullHash = [u8; 32];

pub const DEFAULT_POLL_SECONDS: u64 = 1800;
pub const FULL_HASH_FRESHNESS_SECONDS: u64 = 45 * 60;
pub const DEFAULT_PREFIX_LEN: usize = 4;
pub const DEFAULT_REQUEST_DEADLINE_SECONDS: u64 = 60;

pub const LIST_MALWARE: &str = "goog-malware-shavar";
pub const LIST_PHISHING: &str = "googpub-phish-shavar";

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A single add-chunk record as read back from storage (one row per
/// prefix, or a single empty-prefix row for an "empty a-chunk").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRow {
    pub chunknum: i32,
    pub hostkey: HostKey,
    pub prefix: Prefix,
    pub list: ListName,
}

/// A single sub-chunk record as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRow {
    pub chunknum: i32,
    pub add_chunknum: i32,
    pub hostkey: HostKey,
    pub prefix: Prefix,
    pub list: ListName,
}

/// One decoded record from an a-chunk body, not yet attached to a list or
/// chunk number (those are supplied by the caller persisting it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddChunkRecord {
    pub hostkey: HostKey,
    pub prefix: Prefix,
}

/// One decoded record from an s-chunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChunkRecord {
    pub hostkey: HostKey,
    pub prefix: Prefix,
    pub add_chunknum: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHashRow {
    pub list: ListName,
    pub chunknum: i32,
    pub hash: FullHash,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    pub last_update_time: u64,
    pub next_wait_seconds: u64,
    pub consecutive_errors: u32,
}

impl Default for UpdateCursor {
    fn default() -> Self {
        Self {
            last_update_time: 0,
            next_wait_seconds: DEFAULT_POLL_SECONDS,
            consecutive_errors: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacKeys {
    pub client_key: Vec<u8>,
    pub wrapped_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullHashErrorState {
    pub errors: u32,
    pub timestamp: u64,
}

/// Which half of a chunk pair a stream entry or storage write concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Add,
    Sub,
}
