//! URL canonicalization: turns an arbitrary input URL into the canonical
//! form used for signaling plus the set of (host-suffix x path-prefix)
//! permutations whose SHA-256 hashes are the lookup keys.
//!
//! This is deliberately hand-rolled rather than built on a general `url`
//! crate: the rules here are the service's own idiosyncratic ones (integer
//! hosts, repeated unescaping, a fixed suffix/prefix cap), not RFC 3986.

use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

use crate::model::{FullHash, HostKey, Prefix, DEFAULT_PREFIX_LEN};

use percent_encoding::{percent_decode, percent_encode, AsciiSet, CONTROLS};

/// Bytes that must stay percent-escaped after the unescape/re-escape pass:
/// the standard C0 controls + DEL (via `CONTROLS`), plus space, `#` and `%`
/// themselves so a decoded `#` can never reintroduce a fragment and a
/// decoded `%` can never be mistaken for the start of a fresh escape.
const PATH_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'#').add(b'%');

const MAX_PATH_PREFIXES: usize = 6;
const MAX_HOSTKEY_PROBES: usize = 3;
const UNESCAPE_ITERATION_CAP: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonResult {
    pub canonical_url: String,
    pub host_suffixes: Vec<String>,
    pub path_prefixes: Vec<String>,
    pub full_hashes: Vec<FullHash>,
    pub prefixes: Vec<Prefix>,
    pub hostkey_probes: Vec<HostKey>,
}

pub fn canonicalize(input: &str) -> CanonResult {
    let trimmed = input.trim();
    let stripped = strip_control_before_query(trimmed);
    let with_scheme = ensure_scheme(&stripped);
    let no_fragment = drop_fragment(&with_scheme);

    let (scheme, rest) = split_scheme(&no_fragment);
    let auth_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..auth_end];
    let path_and_query = &rest[auth_end..];

    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let (host_raw, port) = split_host_port(host_port);

    let (path_raw, query) = match path_and_query.find('?') {
        Some(pos) => (&path_and_query[..pos], Some(path_and_query[pos + 1..].to_string())),
        None => (path_and_query, None),
    };
    let path_raw = if path_raw.is_empty() { "/" } else { path_raw };

    let host = normalize_host(host_raw);

    let unescaped = unescape_to_fixed_point(path_raw.as_bytes());
    let reescaped = percent_encode(&unescaped, PATH_ESCAPE).to_string();
    let collapsed = collapse_slashes(&reescaped);
    let mut path = resolve_dot_segments(&collapsed);
    if path.is_empty() {
        path = "/".to_string();
    }

    let canonical_url = build_canonical_url(scheme, &host, port.as_deref(), &path, query.as_deref());

    let suffixes = host_suffixes(&host);
    let prefixes = path_prefixes(&path, query.as_deref());
    let full_hashes = compute_full_hashes(&suffixes, &prefixes);
    let prefix4: Vec<Prefix> = full_hashes
        .iter()
        .map(|h| h[..DEFAULT_PREFIX_LEN].to_vec())
        .collect();
    let hostkey_probes = suffixes
        .iter()
        .take(MAX_HOSTKEY_PROBES)
        .map(|s| hostkey_probe(s))
        .collect();

    CanonResult {
        canonical_url,
        host_suffixes: suffixes,
        path_prefixes: prefixes,
        full_hashes,
        prefixes: prefix4,
        hostkey_probes,
    }
}

/// Strip tab/CR/LF occurring before the query portion (or everywhere, if
/// there is no query at all).
fn strip_control_before_query(input: &str) -> String {
    match input.find('?') {
        Some(pos) => {
            let (head, tail) = input.split_at(pos);
            let cleaned: String = head.chars().filter(|c| !matches!(c, '\t' | '\r' | '\n')).collect();
            format!("{cleaned}{tail}")
        }
        None => input.chars().filter(|c| !matches!(c, '\t' | '\r' | '\n')).collect(),
    }
}

fn ensure_scheme(s: &str) -> String {
    if s.contains("://") {
        s.to_string()
    } else {
        format!("http://{s}")
    }
}

fn drop_fragment(s: &str) -> String {
    match s.find('#') {
        Some(pos) => s[..pos].to_string(),
        None => s.to_string(),
    }
}

fn split_scheme(s: &str) -> (&str, &str) {
    match s.find("://") {
        Some(pos) => (&s[..pos], &s[pos + 3..]),
        None => ("http", s),
    }
}

fn split_host_port(host_port: &str) -> (&str, Option<String>) {
    match host_port.rfind(':') {
        Some(pos) if pos + 1 < host_port.len() && host_port[pos + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            (&host_port[..pos], Some(host_port[pos + 1..].to_string()))
        }
        _ => (host_port, None),
    }
}

fn normalize_host(host: &str) -> String {
    let lowered = host.to_ascii_lowercase();
    let candidate = if !lowered.is_empty() && lowered.bytes().all(|b| b.is_ascii_digit()) {
        match lowered.parse::<u32>() {
            Ok(n) => Ipv4Addr::from(n).to_string(),
            Err(_) => lowered,
        }
    } else {
        lowered
    };
    escape_host(&candidate)
}

fn escape_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for b in host.bytes() {
        let allowed = b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-' | b':' | b'/');
        if allowed {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn unescape_to_fixed_point(input: &[u8]) -> Vec<u8> {
    let mut current = input.to_vec();
    for _ in 0..UNESCAPE_ITERATION_CAP {
        let next: Vec<u8> = percent_decode(&current).collect();
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn resolve_dot_segments(path: &str) -> String {
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    let mut result = String::from("/");
    result.push_str(&stack.join("/"));
    if trailing_slash && !result.ends_with('/') {
        result.push('/');
    }
    result
}

fn build_canonical_url(scheme: &str, host: &str, port: Option<&str>, path: &str, query: Option<&str>) -> String {
    let mut s = format!("{scheme}://{host}");
    if let Some(p) = port {
        s.push(':');
        s.push_str(p);
    }
    s.push_str(path);
    if let Some(q) = query {
        if !q.is_empty() {
            s.push('?');
            s.push_str(q);
        }
    }
    s
}

fn is_ipv4_literal(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

/// Host suffixes, most-specific first: the exact host itself, then
/// successively shorter suffixes drawn from its last 5 labels down to 2
/// labels, capped at 5 total. IPv4 hosts contribute a single suffix,
/// themselves.
pub fn host_suffixes(host: &str) -> Vec<String> {
    if is_ipv4_literal(host) {
        return vec![host.to_string()];
    }
    let labels: Vec<&str> = host.split('.').filter(|s| !s.is_empty()).collect();
    if labels.len() <= 2 {
        return vec![host.to_string()];
    }
    let mut suffixes = vec![host.to_string()];
    let start = labels.len().saturating_sub(5);
    let window = &labels[start..];
    for drop in 0..=(window.len() - 2) {
        let suffix = window[drop..].join(".");
        if !suffixes.contains(&suffix) {
            suffixes.push(suffix);
        }
    }
    suffixes.truncate(5);
    suffixes
}

/// Path prefixes, from most- to least-specific, capped at
/// `MAX_PATH_PREFIXES`: the full path+query, the full path alone, then
/// progressively shorter prefixes truncated at each `/`.
pub fn path_prefixes(path: &str, query: Option<&str>) -> Vec<String> {
    let mut prefixes = Vec::new();
    let full = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };
    prefixes.push(full.clone());
    if full != path {
        prefixes.push(path.to_string());
    }

    let bytes = path.as_bytes();
    let mut cuts: Vec<usize> = Vec::new();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'/' && i != 0 {
            cuts.push(i);
        }
    }
    for cut in cuts {
        if prefixes.len() >= MAX_PATH_PREFIXES {
            break;
        }
        let candidate = path[..=cut].to_string();
        if !prefixes.contains(&candidate) {
            prefixes.push(candidate);
        }
    }
    prefixes.truncate(MAX_PATH_PREFIXES);
    prefixes
}

pub fn compute_full_hashes(suffixes: &[String], prefixes: &[String]) -> Vec<FullHash> {
    let mut hashes = Vec::with_capacity(suffixes.len() * prefixes.len());
    for suffix in suffixes {
        for prefix in prefixes {
            let mut hasher = Sha256::new();
            hasher.update(suffix.as_bytes());
            hasher.update(prefix.as_bytes());
            let digest = hasher.finalize();
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            hashes.push(out);
        }
    }
    hashes
}

pub fn hostkey_probe(suffix: &str) -> HostKey {
    let mut hasher = Sha256::new();
    hasher.update(suffix.as_bytes());
    hasher.update(b"/");
    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_slashes_and_resolves_dot_segments() {
        let result = canonicalize("http://evil.com/foo//bar/../baz?x=1");
        assert_eq!(result.canonical_url, "http://evil.com/foo/baz?x=1");
    }

    #[test]
    fn integer_host_becomes_dotted_quad() {
        let result = canonicalize("http://3232235521/");
        assert_eq!(result.canonical_url, "http://192.168.0.1/");
    }

    #[test]
    fn missing_scheme_gets_http_prepended() {
        let result = canonicalize("host.com/a/b");
        assert!(result.canonical_url.starts_with("http://host.com"));
    }

    #[test]
    fn trailing_fragment_is_dropped() {
        let a = canonicalize("http://host.com/a#frag");
        let b = canonicalize("http://host.com/a");
        assert_eq!(a.canonical_url, b.canonical_url);
        assert_eq!(a.full_hashes, b.full_hashes);
    }

    #[test]
    fn tab_cr_lf_before_query_are_stripped() {
        let a = canonicalize("http://host.com/a\t\r\n?x=1");
        let b = canonicalize("http://host.com/a?x=1");
        assert_eq!(a.canonical_url, b.canonical_url);
    }

    #[test]
    fn host_is_lowercased() {
        let a = canonicalize("http://HOST.COM/a");
        let b = canonicalize("http://host.com/a");
        assert_eq!(a.full_hashes, b.full_hashes);
    }

    #[test]
    fn host_suffix_set_caps_at_five_for_long_hosts() {
        let suffixes = host_suffixes("a.b.c.d.e.f.com");
        assert!(suffixes.len() <= 5);
        assert_eq!(suffixes.last().unwrap().matches('.').count(), 1);
    }

    #[test]
    fn host_suffix_set_always_includes_the_exact_host() {
        let suffixes = host_suffixes("a.b.c.d.e.f.com");
        assert_eq!(suffixes[0], "a.b.c.d.e.f.com");
        assert_eq!(suffixes, vec!["a.b.c.d.e.f.com", "c.d.e.f.com", "d.e.f.com", "e.f.com", "f.com"]);
    }

    #[test]
    fn host_suffix_set_for_ipv4_is_singleton() {
        let suffixes = host_suffixes("192.168.0.1");
        assert_eq!(suffixes, vec!["192.168.0.1".to_string()]);
    }

    #[test]
    fn path_prefix_set_is_capped() {
        let prefixes = path_prefixes("/a/b/c/d/e/f/g", None);
        assert!(prefixes.len() <= MAX_PATH_PREFIXES);
        assert!(prefixes.contains(&"/a/b/c/d/e/f/g".to_string()));
    }

    #[test]
    fn hostkey_probe_is_four_bytes_of_sha256() {
        let probe = hostkey_probe("host.com");
        assert_eq!(probe.len(), 4);
    }
}
