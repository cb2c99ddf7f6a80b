//! Engine configuration. Plain data plus a `clap` CLI layer so the binaries
//! and the library share one source of truth for defaults.

use std::time::Duration;

use clap::Parser;

use crate::model::{DEFAULT_PREFIX_LEN, DEFAULT_REQUEST_DEADLINE_SECONDS, LIST_MALWARE, LIST_PHISHING};

pub const DEFAULT_UPDATE_URL: &str = "https://safebrowsing.example.com/safebrowsing/downloads";
pub const DEFAULT_GETHASH_URL: &str = "https://safebrowsing.example.com/safebrowsing/gethash";
pub const DEFAULT_NEWKEY_URL: &str = "https://safebrowsing.example.com/safebrowsing/newkey";
const DEFAULT_LISTS: &str = "goog-malware-shavar,googpub-phish-shavar";

/// Everything the engine needs to identify itself to the service and to
/// locate its endpoints. Cloned cheaply and held by `Engine` for the
/// lifetime of the process.
#[derive(Debug, Clone, Parser)]
#[command(name = "shavar-client", about = "Safe-Browsing-style reputation list client")]
pub struct EngineConfig {
    /// Registered client identifier sent as the `client` request parameter.
    #[arg(long, env = "SHAVAR_CLIENT")]
    pub client: String,

    /// API key sent as the `apikey` request parameter, if the service requires one.
    #[arg(long, env = "SHAVAR_APIKEY")]
    pub apikey: Option<String>,

    /// Client application version string.
    #[arg(long, env = "SHAVAR_APPVER", default_value = "1.0")]
    pub appver: String,

    /// Protocol version string.
    #[arg(long, env = "SHAVAR_PVER", default_value = "2.2")]
    pub pver: String,

    #[arg(long, env = "SHAVAR_UPDATE_URL", default_value = DEFAULT_UPDATE_URL)]
    pub update_url: String,

    #[arg(long, env = "SHAVAR_GETHASH_URL", default_value = DEFAULT_GETHASH_URL)]
    pub gethash_url: String,

    #[arg(long, env = "SHAVAR_NEWKEY_URL", default_value = DEFAULT_NEWKEY_URL)]
    pub newkey_url: String,

    /// Lists this client tracks, comma-separated.
    #[arg(long, env = "SHAVAR_LISTS", value_delimiter = ',', default_value = DEFAULT_LISTS)]
    pub lists: Vec<String>,

    /// Whether to request and validate MAC-protected responses.
    #[arg(long, env = "SHAVAR_USE_MAC", default_value_t = false)]
    pub use_mac: bool,

    /// Hash prefix length used when requesting new chunks.
    #[arg(long, env = "SHAVAR_PREFIX_LEN", default_value_t = DEFAULT_PREFIX_LEN)]
    pub prefix_len: usize,

    /// Deadline for any single HTTP request.
    #[arg(long, env = "SHAVAR_REQUEST_DEADLINE_SECONDS", default_value_t = DEFAULT_REQUEST_DEADLINE_SECONDS)]
    pub request_deadline_seconds: u64,
}

impl EngineConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_seconds)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: "shavar-client".to_string(),
            apikey: None,
            appver: "1.0".to_string(),
            pver: "2.2".to_string(),
            update_url: DEFAULT_UPDATE_URL.to_string(),
            gethash_url: DEFAULT_GETHASH_URL.to_string(),
            newkey_url: DEFAULT_NEWKEY_URL.to_string(),
            lists: vec![LIST_MALWARE.to_string(), LIST_PHISHING.to_string()],
            use_mac: false,
            prefix_len: DEFAULT_PREFIX_LEN,
            request_deadline_seconds: DEFAULT_REQUEST_DEADLINE_SECONDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_both_stock_lists() {
        let cfg = EngineConfig::default();
        assert!(cfg.lists.contains(&LIST_MALWARE.to_string()));
        assert!(cfg.lists.contains(&LIST_PHISHING.to_string()));
        assert_eq!(cfg.request_deadline(), Duration::from_secs(60));
    }
}
