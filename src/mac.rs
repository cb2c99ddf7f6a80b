//! Request/response authentication: client-key acquisition and HMAC-SHA1
//! digest computation/verification for MAC-protected update exchanges.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac as HmacMac};
use sha1::Sha1;
use tracing::{debug, instrument};

use crate::error::MacError;

type HmacSha1 = Hmac<Sha1>;

/// Keys returned by the key-acquisition endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredKeys {
    pub client_key: Vec<u8>,
    pub wrapped_key: String,
}

/// Parse a `newkey` response body:
/// ```text
/// clientkey:<len>:<base64 bytes>
/// wrappedkey:<len>:<opaque bytes>
/// ```
/// one field per line, `<len>` the byte length of the field that follows.
pub fn parse_key_response(body: &str) -> Result<AcquiredKeys, MacError> {
    let mut client_key: Option<Vec<u8>> = None;
    let mut wrapped_key: Option<String> = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let name = parts.next().ok_or_else(|| MacError::MalformedKeyResponse(line.to_string()))?;
        let len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MacError::MalformedKeyResponse(line.to_string()))?;
        let value = parts.next().ok_or_else(|| MacError::MalformedKeyResponse(line.to_string()))?;
        if value.len() != len {
            return Err(MacError::MalformedKeyResponse(format!(
                "declared length {len} does not match field length {}",
                value.len()
            )));
        }
        match name {
            "clientkey" => {
                client_key = Some(
                    base64::engine::general_purpose::STANDARD
                        .decode(value)
                        .map_err(|e| MacError::MalformedKeyResponse(e.to_string()))?,
                );
            }
            "wrappedkey" => wrapped_key = Some(value.to_string()),
            _ => {}
        }
    }

    match (client_key, wrapped_key) {
        (Some(client_key), Some(wrapped_key)) => Ok(AcquiredKeys { client_key, wrapped_key }),
        _ => Err(MacError::MalformedKeyResponse("missing clientkey or wrappedkey field".into())),
    }
}

/// Digest a request/response body the way the wire format expects it:
/// `BASE64URL(HMAC-SHA1(body, key))` with a literal trailing `=`.
pub fn mac_digest(body: &[u8], client_key: &[u8]) -> Result<String, MacError> {
    let mut mac = HmacSha1::new_from_slice(client_key).map_err(|_| MacError::DigestMismatch)?;
    mac.update(body);
    let tag = mac.finalize().into_bytes();
    Ok(format!("{}=", URL_SAFE_NO_PAD.encode(tag)))
}

/// Verify a MAC header against a response body. The header carries the
/// same `BASE64URL(...)=` shape `mac_digest` produces.
#[instrument(skip(body, client_key))]
pub fn verify_mac(body: &[u8], header: &str, client_key: &[u8]) -> Result<(), MacError> {
    let trimmed = header.trim().trim_end_matches('=');
    let expected = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| MacError::MalformedKeyResponse(e.to_string()))?;

    let mut mac = HmacSha1::new_from_slice(client_key).map_err(|_| MacError::DigestMismatch)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| {
        debug!("HMAC verification failed");
        MacError::DigestMismatch
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clientkey_and_wrappedkey_lines() {
        let client_key_b64 = base64::engine::general_purpose::STANDARD.encode(b"abcdefgh");
        let body = format!(
            "clientkey:{}:{}\nwrappedkey:7:opaque1\n",
            client_key_b64.len(),
            client_key_b64
        );
        let keys = parse_key_response(&body).unwrap();
        assert_eq!(keys.client_key, b"abcdefgh");
        assert_eq!(keys.wrapped_key, "opaque1");
    }

    #[test]
    fn rejects_mismatched_declared_length() {
        let body = "clientkey:999:short\n";
        assert!(parse_key_response(body).is_err());
    }

    #[test]
    fn digest_round_trips_through_verify() {
        let key = b"supersecretkey";
        let body = b"a:1-3\ns:\n";
        let header = mac_digest(body, key).unwrap();
        verify_mac(body, &header, key).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let key = b"supersecretkey";
        let header = mac_digest(b"original body", key).unwrap();
        assert!(matches!(verify_mac(b"tampered body", &header, key), Err(MacError::DigestMismatch)));
    }
}
