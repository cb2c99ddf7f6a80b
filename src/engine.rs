//! Public entry point: ties a `Storage` backend, an HTTP client and an
//! `EngineConfig` together behind `update`/`lookup`/`close`.

use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::{EngineError, UpdateOutcome};
use crate::lookup::run_lookup;
use crate::model::ListName;
use crate::storage::Storage;
use crate::update::run_update;

pub struct Engine<S: Storage> {
    storage: S,
    http: reqwest::Client,
    config: EngineConfig,
}

impl<S: Storage> Engine<S> {
    pub fn new(storage: S, config: EngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_deadline())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { storage, http, config }
    }

    /// Run one update cycle against every configured list that is due.
    #[instrument(skip(self))]
    pub async fn update(&self) -> UpdateOutcome {
        run_update(&self.storage, &self.http, &self.config).await
    }

    /// Check whether `url` matches any of `lists` (defaults to every
    /// configured list when empty).
    #[instrument(skip(self))]
    pub async fn lookup(&self, url: &str, lists: &[String]) -> Result<Option<ListName>, EngineError> {
        let lists = if lists.is_empty() { self.config.lists.as_slice() } else { lists };
        run_lookup(&self.storage, &self.http, &self.config, url, lists).await
    }

    /// Number of add/sub chunk numbers currently on file for `list`, for
    /// diagnostics.
    pub async fn chunk_counts(&self, list: &str) -> Result<(usize, usize), EngineError> {
        let add = self.storage.get_add_chunk_nums(list).await?;
        let sub = self.storage.get_sub_chunk_nums(list).await?;
        Ok((add.len(), sub.len()))
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.storage.close().await?;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn chunk_counts_reflect_stored_chunks() {
        let engine = Engine::new(MemoryStore::new(), EngineConfig::default());
        let list = engine.config().lists[0].clone();
        engine
            .lookup("http://example.com/", &[])
            .await
            .unwrap();
        let (add, sub) = engine.chunk_counts(&list).await.unwrap();
        assert_eq!((add, sub), (0, 0));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = Engine::new(MemoryStore::new(), EngineConfig::default());
        engine.close().await.unwrap();
        engine.close().await.unwrap();
    }
}
