//! The update cycle: ask the service which chunks changed since our last
//! cursor, fetch redirected chunk data, and persist it.

use std::collections::HashMap;

use tracing::{debug, error, info, instrument, warn};

use crate::codec::{decode_add_chunk_body, decode_chunk_stream, decode_sub_chunk_body, encode_ranges, parse_ranges};
use crate::config::EngineConfig;
use crate::error::UpdateOutcome;
use crate::mac::{parse_key_response, verify_mac};
use crate::model::{now_unix, AddChunkRecord, ChunkKind, DEFAULT_POLL_SECONDS, SubChunkRecord};
use crate::storage::Storage;

/// A chunk-data redirection the server asked us to follow, scoped to the
/// list context active when the `u:` line was read.
struct Redirection {
    list: String,
    url: String,
    mac: Option<String>,
}

/// `u:` lines carry a schemeless host/path (the service never sends one) and
/// an optional trailing `,MAC` that must be split off before the URL is fit
/// to fetch.
fn parse_redirection_url(rest: &str) -> (String, Option<String>) {
    let (url_part, mac) = match rest.split_once(',') {
        Some((u, m)) => (u, Some(m.to_string())),
        None => (rest, None),
    };
    let url = if url_part.contains("://") { url_part.to_string() } else { format!("http://{url_part}") };
    (url, mac)
}

/// An `e:pleaserekey` line asks the caller to discard its MAC keys and
/// rerun the whole cycle once with fresh ones.
const MAX_REKEY_ATTEMPTS: u32 = 2;

#[instrument(skip(storage, http, cfg))]
pub(crate) async fn run_update<S: Storage>(
    storage: &S,
    http: &reqwest::Client,
    cfg: &EngineConfig,
) -> UpdateOutcome {
    let now = now_unix();
    let mut due_lists = Vec::new();
    for list in &cfg.lists {
        let cursor = match storage.last_update(list).await {
            Ok(c) => c,
            Err(e) => return UpdateOutcome::InternalError(e.to_string()),
        };
        if now >= cursor.last_update_time + cursor.next_wait_seconds {
            due_lists.push(list.clone());
        }
    }
    if due_lists.is_empty() {
        debug!("no list is due for an update cycle");
        return UpdateOutcome::NoUpdate;
    }

    for attempt in 0..MAX_REKEY_ATTEMPTS {
        match run_update_attempt(storage, http, cfg, &due_lists, now).await {
            AttemptOutcome::Rekey if attempt + 1 < MAX_REKEY_ATTEMPTS => {
                info!("server asked for a new MAC key, retrying the cycle");
                continue;
            }
            AttemptOutcome::Rekey => return UpdateOutcome::MacKeyError,
            AttemptOutcome::Done(outcome) => return outcome,
        }
    }
    UpdateOutcome::MacKeyError
}

enum AttemptOutcome {
    Done(UpdateOutcome),
    Rekey,
}

async fn run_update_attempt<S: Storage>(
    storage: &S,
    http: &reqwest::Client,
    cfg: &EngineConfig,
    due_lists: &[String],
    now: u64,
) -> AttemptOutcome {
    let mac_key = if cfg.use_mac {
        match ensure_mac_keys(storage, http, cfg).await {
            Ok(key) => Some(key),
            Err(_) => {
                warn!("could not acquire MAC keys, aborting update cycle");
                return AttemptOutcome::Done(UpdateOutcome::MacKeyError);
            }
        }
    } else {
        None
    };

    let body = match build_request_body(storage, due_lists, mac_key.is_some()).await {
        Ok(b) => b,
        Err(e) => return AttemptOutcome::Done(UpdateOutcome::InternalError(e.to_string())),
    };

    let mut request = http
        .post(&cfg.update_url)
        .query(&[("client", cfg.client.as_str()), ("appver", cfg.appver.as_str()), ("pver", cfg.pver.as_str())])
        .body(body.clone());
    if let Some(apikey) = &cfg.apikey {
        request = request.query(&[("apikey", apikey.as_str())]);
    }
    if let Some(key) = &mac_key {
        request = request.query(&[("wrkey", key.wrapped_key.as_str())]);
    }

    let response = match request.timeout(cfg.request_deadline()).send().await {
        Ok(r) => r,
        Err(e) => {
            record_failure(storage, due_lists, now).await;
            return AttemptOutcome::Done(UpdateOutcome::ServerError(e.to_string()));
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        record_failure(storage, due_lists, now).await;
        return AttemptOutcome::Done(UpdateOutcome::ServerError(format!("update endpoint returned {status}")));
    }

    let text = match response.text().await {
        Ok(t) => t,
        Err(e) => {
            record_failure(storage, due_lists, now).await;
            return AttemptOutcome::Done(UpdateOutcome::ServerError(e.to_string()));
        }
    };

    if let Some(key) = &mac_key {
        let header = text.lines().find_map(|l| l.strip_prefix("m:").map(str::to_string));
        match header {
            Some(h) => {
                let body_without_mac: String =
                    text.lines().filter(|l| !l.starts_with("m:")).collect::<Vec<_>>().join("\n");
                if verify_mac(body_without_mac.as_bytes(), &h, &key.client_key).is_err() {
                    error!("MAC verification failed on update response, discarding cycle");
                    return AttemptOutcome::Done(UpdateOutcome::MacError);
                }
            }
            None => {
                error!("MAC requested but response carried no m: line");
                return AttemptOutcome::Done(UpdateOutcome::MacError);
            }
        }
    }

    if text.trim().is_empty() {
        for list in due_lists {
            let _ = storage.record_update(list, now, DEFAULT_POLL_SECONDS).await;
        }
        return AttemptOutcome::Done(UpdateOutcome::NoData);
    }

    match apply_response(storage, http, cfg, &text, due_lists, mac_key.as_ref()).await {
        Ok(ApplyResult::Outcome(outcome)) => AttemptOutcome::Done(outcome),
        Ok(ApplyResult::Rekey) => AttemptOutcome::Rekey,
        Err(e) => {
            record_failure(storage, due_lists, now).await;
            AttemptOutcome::Done(UpdateOutcome::InternalError(e))
        }
    }
}

async fn record_failure<S: Storage>(storage: &S, due_lists: &[String], now: u64) {
    for list in due_lists {
        let cursor = storage.last_update(list).await.unwrap_or_default();
        let errors = cursor.consecutive_errors + 1;
        let wait = crate::backoff::update_backoff_wait(errors).as_secs();
        let _ = storage.record_update_error(list, now, wait, errors).await;
    }
}

async fn ensure_mac_keys<S: Storage>(
    storage: &S,
    http: &reqwest::Client,
    cfg: &EngineConfig,
) -> Result<crate::model::MacKeys, crate::error::MacError> {
    if let Ok(Some(keys)) = storage.get_mac_keys().await {
        return Ok(keys);
    }
    let response = http
        .get(&cfg.newkey_url)
        .query(&[("client", cfg.client.as_str())])
        .send()
        .await
        .map_err(|e| crate::error::MacError::KeyRequest(e.to_string()))?;
    let text = response
        .text()
        .await
        .map_err(|e| crate::error::MacError::KeyRequest(e.to_string()))?;
    let keys = parse_key_response(&text)?;
    let _ = storage.set_mac_keys(&keys.client_key, &keys.wrapped_key).await;
    Ok(crate::model::MacKeys { client_key: keys.client_key, wrapped_key: keys.wrapped_key })
}

async fn build_request_body<S: Storage>(
    storage: &S,
    lists: &[String],
    use_mac: bool,
) -> Result<String, crate::error::StorageError> {
    let mut body = String::new();
    for list in lists {
        let add_nums: Vec<u32> = storage.get_add_chunk_nums(list).await?;
        let sub_nums: Vec<u32> = storage.get_sub_chunk_nums(list).await?;
        body.push_str(list);
        body.push(';');
        if !add_nums.is_empty() {
            body.push_str("a:");
            body.push_str(&encode_ranges(&add_nums));
        }
        if !sub_nums.is_empty() {
            if !add_nums.is_empty() {
                body.push(':');
            }
            body.push_str("s:");
            body.push_str(&encode_ranges(&sub_nums));
        }
        if use_mac {
            body.push_str(":mac");
        }
        body.push('\n');
    }
    Ok(body)
}

pub(crate) enum ApplyResult {
    Outcome(UpdateOutcome),
    /// `e:pleaserekey` was seen: keys are already cleared, caller should
    /// retry the whole cycle once with freshly acquired ones.
    Rekey,
}

/// Parse and apply the `n:`/`i:`/`u:`/`ad:`/`sd:`/`r:pleasereset`/`e:pleaserekey`
/// command stream, fetching and persisting any redirected chunk data.
async fn apply_response<S: Storage>(
    storage: &S,
    http: &reqwest::Client,
    cfg: &EngineConfig,
    text: &str,
    due_lists: &[String],
    mac_key: Option<&crate::model::MacKeys>,
) -> Result<ApplyResult, String> {
    let mut current_list: Option<String> = None;
    let mut next_wait = DEFAULT_POLL_SECONDS;
    let mut redirections = Vec::new();
    let mut pending_deletes: HashMap<String, (Vec<i32>, Vec<i32>)> = HashMap::new();
    let mut applied_anything = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("m:") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("n:") {
            next_wait = rest.parse().unwrap_or(DEFAULT_POLL_SECONDS);
        } else if let Some(rest) = line.strip_prefix("i:") {
            current_list = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("u:") {
            let list = current_list.clone().ok_or_else(|| "u: line with no preceding i:".to_string())?;
            let (url, mac) = parse_redirection_url(rest);
            redirections.push(Redirection { list, url, mac });
        } else if let Some(rest) = line.strip_prefix("ad:") {
            let list = current_list.clone().ok_or_else(|| "ad: line with no preceding i:".to_string())?;
            let nums = parse_ranges(rest).map_err(|e| e.to_string())?;
            let entry = pending_deletes.entry(list).or_default();
            entry.0.extend(nums.into_iter().map(|n| n as i32));
        } else if let Some(rest) = line.strip_prefix("sd:") {
            let list = current_list.clone().ok_or_else(|| "sd: line with no preceding i:".to_string())?;
            let nums = parse_ranges(rest).map_err(|e| e.to_string())?;
            let entry = pending_deletes.entry(list).or_default();
            entry.1.extend(nums.into_iter().map(|n| n as i32));
        } else if line == "e:pleaserekey" {
            let _ = storage.clear_mac_keys().await;
            info!("server asked for a new MAC key");
            return Ok(ApplyResult::Rekey);
        } else if line == "r:pleasereset" {
            for list in &cfg.lists {
                let add_nums = storage.get_add_chunk_nums(list).await.map_err(|e| e.to_string())?;
                let sub_nums = storage.get_sub_chunk_nums(list).await.map_err(|e| e.to_string())?;
                let add_nums: Vec<i32> = add_nums.into_iter().map(|n| n as i32).collect();
                let sub_nums: Vec<i32> = sub_nums.into_iter().map(|n| n as i32).collect();
                storage.delete_add_chunks(list, &add_nums).await.map_err(|e| e.to_string())?;
                storage.delete_sub_chunks(list, &sub_nums).await.map_err(|e| e.to_string())?;
                storage.delete_full_hashes(list, &add_nums).await.map_err(|e| e.to_string())?;
                storage.record_update(list, now_unix(), DEFAULT_POLL_SECONDS).await.map_err(|e| e.to_string())?;
            }
            info!("server requested a full reset, all chunks cleared");
            applied_anything = true;
        } else {
            debug!(%line, "ignoring unrecognized update command line");
        }
    }

    for (list, (add_nums, sub_nums)) in &pending_deletes {
        if !add_nums.is_empty() {
            storage.delete_add_chunks(list, add_nums).await.map_err(|e| e.to_string())?;
            storage.delete_full_hashes(list, add_nums).await.map_err(|e| e.to_string())?;
            applied_anything = true;
        }
        if !sub_nums.is_empty() {
            storage.delete_sub_chunks(list, sub_nums).await.map_err(|e| e.to_string())?;
            applied_anything = true;
        }
    }

    for redirection in &redirections {
        let fetched = http
            .get(&redirection.url)
            .timeout(cfg.request_deadline())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !fetched.status().is_success() {
            return Err(format!("chunk redirection {} returned {}", redirection.url, fetched.status()));
        }
        let bytes = fetched.bytes().await.map_err(|e| e.to_string())?;

        if let (Some(digest), Some(key)) = (&redirection.mac, mac_key) {
            if verify_mac(&bytes, digest, &key.client_key).is_err() {
                error!(list = %redirection.list, "MAC verification failed on chunk redirection, discarding cycle");
                return Ok(ApplyResult::Outcome(UpdateOutcome::MacError));
            }
        }

        let entries = decode_chunk_stream(&bytes).map_err(|e| e.to_string())?;
        for entry in entries {
            match entry.kind {
                ChunkKind::Add => {
                    let records: Vec<AddChunkRecord> =
                        decode_add_chunk_body(entry.hash_len, &entry.body).map_err(|e| e.to_string())?;
                    storage
                        .store_add_chunk(&redirection.list, entry.chunknum, &records)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                ChunkKind::Sub => {
                    let records: Vec<SubChunkRecord> =
                        decode_sub_chunk_body(entry.hash_len, &entry.body).map_err(|e| e.to_string())?;
                    storage
                        .store_sub_chunk(&redirection.list, entry.chunknum, &records)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }
        applied_anything = true;
    }

    for list in due_lists {
        storage.record_update(list, now_unix(), next_wait).await.map_err(|e| e.to_string())?;
    }

    if applied_anything {
        Ok(ApplyResult::Outcome(UpdateOutcome::Successful))
    } else {
        Ok(ApplyResult::Outcome(UpdateOutcome::NoData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AddChunkRecord as Rec;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn request_body_includes_ranges_for_both_chunk_kinds() {
        let store = MemoryStore::new();
        store.store_add_chunk("list-a", 1, &[Rec { hostkey: [1, 2, 3, 4], prefix: b"abcd".to_vec() }]).await.unwrap();
        store.store_add_chunk("list-a", 2, &[Rec { hostkey: [5, 6, 7, 8], prefix: b"efgh".to_vec() }]).await.unwrap();

        let body = build_request_body(&store, &["list-a".to_string()], false).await.unwrap();
        assert_eq!(body, "list-a;a:1-2\n");
    }

    #[tokio::test]
    async fn request_body_is_empty_marker_for_list_with_no_chunks() {
        let store = MemoryStore::new();
        let body = build_request_body(&store, &["fresh-list".to_string()], false).await.unwrap();
        assert_eq!(body, "fresh-list;\n");
    }

    #[tokio::test]
    async fn request_body_appends_mac_suffix_when_mac_is_on() {
        let store = MemoryStore::new();
        store.store_add_chunk("list-a", 1, &[Rec { hostkey: [1, 2, 3, 4], prefix: b"abcd".to_vec() }]).await.unwrap();

        let body = build_request_body(&store, &["list-a".to_string()], true).await.unwrap();
        assert_eq!(body, "list-a;a:1:mac\n");
    }

    #[test]
    fn redirection_url_gets_http_scheme_prepended_when_missing() {
        let (url, mac) = parse_redirection_url("safebrowsing-cache.google.com/safebrowsing/rd/a,b");
        assert_eq!(url, "http://safebrowsing-cache.google.com/safebrowsing/rd/a");
        assert_eq!(mac, Some("b".to_string()));
    }

    #[test]
    fn redirection_url_with_scheme_is_left_alone_and_mac_is_split_off() {
        let (url, mac) = parse_redirection_url("https://cache.example.com/rd/a,deadbeef");
        assert_eq!(url, "https://cache.example.com/rd/a");
        assert_eq!(mac, Some("deadbeef".to_string()));
    }

    #[test]
    fn redirection_url_without_mac_suffix_has_none_mac() {
        let (url, mac) = parse_redirection_url("cache.example.com/rd/a");
        assert_eq!(url, "http://cache.example.com/rd/a");
        assert_eq!(mac, None);
    }
}
