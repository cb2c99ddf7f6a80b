//! A client library for Safe-Browsing-v2-style reputation list distribution:
//! incremental chunk sync, URL canonicalization, and local prefix/full-hash
//! lookups against a pluggable storage backend.

pub mod backoff;
pub mod canon;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod mac;
pub mod model;
pub mod storage;

mod lookup;
mod update;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, UpdateOutcome};
pub use model::ListName;
pub use storage::memory::MemoryStore;
pub use storage::sqlite::SqliteStore;
pub use storage::Storage;
