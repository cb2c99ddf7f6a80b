//! The lookup path: canonicalize a URL, probe the local chunk cache, and
//! fall back to an on-demand full-hash request when a prefix matches but
//! nothing cached confirms or refutes it yet.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, warn};

use crate::backoff::is_full_hash_throttled;
use crate::canon::canonicalize;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{now_unix, FullHash, FullHashRow, ListName, Prefix, FULL_HASH_FRESHNESS_SECONDS};
use crate::storage::Storage;

/// A candidate match surfaced by the local chunk tables: a list whose
/// add-chunk prefix matched a canonicalized hash, not yet sub-cancelled
/// and not yet confirmed by a full hash.
#[derive(Debug, Clone)]
struct Candidate {
    list: ListName,
    chunknum: i32,
    prefix: Prefix,
}

#[instrument(skip(storage, http, cfg))]
pub(crate) async fn run_lookup<S: Storage>(
    storage: &S,
    http: &reqwest::Client,
    cfg: &EngineConfig,
    url: &str,
    lists: &[String],
) -> Result<Option<ListName>, EngineError> {
    let canon = canonicalize(url);

    let mut candidates: Vec<Candidate> = Vec::new();
    for hostkey in &canon.hostkey_probes {
        let add_rows = storage.get_add_chunks(*hostkey).await?;
        let sub_rows = storage.get_sub_chunks(*hostkey).await?;

        for add_row in add_rows.iter().filter(|r| lists.contains(&r.list)) {
            let matches = add_row.prefix.is_empty()
                || canon.full_hashes.iter().any(|fh| fh.starts_with(add_row.prefix.as_slice()));
            if !matches {
                continue;
            }
            let cancelled = sub_rows.iter().any(|s| {
                s.list == add_row.list
                    && s.add_chunknum == add_row.chunknum
                    && (s.prefix.is_empty() || s.prefix == add_row.prefix)
            });
            if cancelled {
                continue;
            }
            candidates.push(Candidate { list: add_row.list.clone(), chunknum: add_row.chunknum, prefix: add_row.prefix.clone() });
        }
    }

    if candidates.is_empty() {
        return Ok(None);
    }

    let freshness_floor = now_unix().saturating_sub(FULL_HASH_FRESHNESS_SECONDS);
    let mut unresolved: Vec<&Candidate> = Vec::new();
    for candidate in &candidates {
        let cached = storage.get_full_hashes(&candidate.list, candidate.chunknum, freshness_floor).await?;
        if cached.iter().any(|h| canon.full_hashes.contains(h)) {
            debug!(list = %candidate.list, "confirmed by cached full hash");
            return Ok(Some(candidate.list.clone()));
        }
        unresolved.push(candidate);
    }

    let mut to_fetch: Vec<&Candidate> = Vec::new();
    for candidate in unresolved {
        let throttled = match storage.get_full_hash_error(&candidate.prefix).await? {
            Some(state) => is_full_hash_throttled(state.errors, state.timestamp, now_unix()),
            None => false,
        };
        if throttled {
            debug!(list = %candidate.list, "skipping throttled full-hash prefix");
            continue;
        }
        to_fetch.push(candidate);
    }

    if to_fetch.is_empty() {
        return Ok(None);
    }

    let requested_prefixes: HashSet<Prefix> = to_fetch.iter().map(|c| c.prefix.clone()).collect();
    let response = match fetch_full_hashes(http, cfg, requested_prefixes.iter()).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "gethash request failed");
            let now = now_unix();
            for prefix in &requested_prefixes {
                let _ = storage.full_hash_error(prefix, now).await;
            }
            return Err(e);
        }
    };

    for prefix in &requested_prefixes {
        let _ = storage.full_hash_ok(prefix).await;
    }

    let mut rows_by_key: HashMap<(String, i32), Vec<FullHash>> = HashMap::new();
    for entry in &response {
        rows_by_key.entry((entry.list.clone(), entry.chunknum)).or_default().push(entry.hash);
    }
    if !response.is_empty() {
        let now = now_unix();
        let rows: Vec<FullHashRow> = response
            .iter()
            .map(|e| FullHashRow { list: e.list.clone(), chunknum: e.chunknum, hash: e.hash, timestamp: now })
            .collect();
        storage.add_full_hashes(&rows).await?;
    }

    for candidate in &to_fetch {
        if let Some(hashes) = rows_by_key.get(&(candidate.list.clone(), candidate.chunknum)) {
            if hashes.iter().any(|h| canon.full_hashes.contains(h)) {
                return Ok(Some(candidate.list.clone()));
            }
        }
    }

    Ok(None)
}

struct GetHashEntry {
    list: ListName,
    chunknum: i32,
    hash: FullHash,
}

/// `gethash` request body: `prefix_len:total_bytes\n` followed by the raw
/// concatenated prefix bytes, all the same length.
async fn fetch_full_hashes<'a>(
    http: &reqwest::Client,
    cfg: &EngineConfig,
    prefixes: impl Iterator<Item = &'a Prefix>,
) -> Result<Vec<GetHashEntry>, EngineError> {
    let prefixes: Vec<&Prefix> = prefixes.collect();
    if prefixes.is_empty() {
        return Ok(Vec::new());
    }
    let prefix_len = prefixes[0].len();
    let mut payload = Vec::with_capacity(prefixes.len() * prefix_len);
    for prefix in &prefixes {
        payload.extend_from_slice(prefix);
    }
    let mut body = format!("{prefix_len}:{}\n", payload.len()).into_bytes();
    body.extend(payload);

    let mut request = http.post(&cfg.gethash_url).query(&[("client", cfg.client.as_str())]).body(body);
    if let Some(apikey) = &cfg.apikey {
        request = request.query(&[("apikey", apikey.as_str())]);
    }
    let response = request.timeout(cfg.request_deadline()).send().await?;
    if !response.status().is_success() {
        return Err(EngineError::Http(format!("gethash endpoint returned {}", response.status())));
    }
    let bytes = response.bytes().await?;
    parse_gethash_response(&bytes)
}

/// Each block is `LIST:CHUNKNUM:LEN\n` followed by exactly `LEN` raw hash
/// bytes; a list/chunknum with more than one matching hash repeats the
/// whole block.
fn parse_gethash_response(data: &[u8]) -> Result<Vec<GetHashEntry>, EngineError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let nl = data[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| EngineError::Http("truncated gethash header".into()))?
            + pos;
        let header = std::str::from_utf8(&data[pos..nl])
            .map_err(|_| EngineError::Http("non-utf8 gethash header".into()))?;
        let mut parts = header.splitn(3, ':');
        let list = parts.next().ok_or_else(|| EngineError::Http("malformed gethash header".into()))?.to_string();
        let chunknum: i32 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::Http("malformed gethash header".into()))?;
        let hash_len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::Http("malformed gethash header".into()))?;

        pos = nl + 1;
        if pos + hash_len > data.len() {
            return Err(EngineError::Http("truncated gethash body".into()));
        }
        let mut hash = [0u8; 32];
        let n = hash_len.min(32);
        hash[..n].copy_from_slice(&data[pos..pos + n]);
        pos += hash_len;
        entries.push(GetHashEntry { list, chunknum, hash });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AddChunkRecord;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn parses_gethash_response_bodies() {
        let mut body = Vec::new();
        body.extend(b"goog-malware-shavar:7:32\n");
        body.extend([9u8; 32]);
        let entries = parse_gethash_response(&body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].list, "goog-malware-shavar");
        assert_eq!(entries[0].chunknum, 7);
        assert_eq!(entries[0].hash, [9u8; 32]);
    }

    #[tokio::test]
    async fn lookup_returns_none_with_empty_cache() {
        let store = MemoryStore::new();
        let http = reqwest::Client::new();
        let cfg = EngineConfig::default();
        let result = run_lookup(&store, &http, &cfg, "http://evil.example.com/malware", &cfg.lists).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn lookup_confirms_via_cached_full_hash() {
        let store = MemoryStore::new();
        let cfg = EngineConfig::default();
        let canon = canonicalize("http://evil.example.com/malware");
        let hostkey = canon.hostkey_probes[0];
        let prefix = canon.prefixes[0].clone();
        let full_hash = canon.full_hashes[0];

        store
            .store_add_chunk(&cfg.lists[0], 1, &[AddChunkRecord { hostkey, prefix: prefix.clone() }])
            .await
            .unwrap();
        store
            .add_full_hashes(&[FullHashRow { list: cfg.lists[0].clone(), chunknum: 1, hash: full_hash, timestamp: now_unix() }])
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let result = run_lookup(&store, &http, &cfg, "http://evil.example.com/malware", &cfg.lists).await.unwrap();
        assert_eq!(result, Some(cfg.lists[0].clone()));
    }

    #[tokio::test]
    async fn sub_chunk_cancels_matching_add_prefix() {
        use crate::model::SubChunkRecord;

        let store = MemoryStore::new();
        let cfg = EngineConfig::default();
        let canon = canonicalize("http://evil.example.com/malware");
        let hostkey = canon.hostkey_probes[0];
        let prefix = canon.prefixes[0].clone();

        store
            .store_add_chunk(&cfg.lists[0], 1, &[AddChunkRecord { hostkey, prefix: prefix.clone() }])
            .await
            .unwrap();
        store
            .store_sub_chunk(&cfg.lists[0], 1, &[SubChunkRecord { hostkey, prefix, add_chunknum: 1 }])
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let result = run_lookup(&store, &http, &cfg, "http://evil.example.com/malware", &cfg.lists).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn sub_chunk_with_empty_prefix_cancels_whole_add_chunk() {
        use crate::model::SubChunkRecord;

        let store = MemoryStore::new();
        let cfg = EngineConfig::default();
        let canon = canonicalize("http://evil.example.com/malware");
        let hostkey = canon.hostkey_probes[0];
        let prefix = canon.prefixes[0].clone();

        store
            .store_add_chunk(&cfg.lists[0], 1, &[AddChunkRecord { hostkey, prefix: prefix.clone() }])
            .await
            .unwrap();
        store
            .store_sub_chunk(&cfg.lists[0], 1, &[SubChunkRecord { hostkey, prefix: Vec::new(), add_chunknum: 1 }])
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let result = run_lookup(&store, &http, &cfg, "http://evil.example.com/malware", &cfg.lists).await.unwrap();
        assert_eq!(result, None);
    }
}
