//! Binary chunk codec: decodes add/sub chunk bodies and the outer
//! `TYPE:CHUNKNUM:HASHLEN:CHUNKLEN\nBODY` framing a redirection response
//! carries, plus the comma-separated range encoder/parser used to report
//! which chunk numbers are already on file.

use crate::error::CodecError;
use crate::model::{AddChunkRecord, ChunkKind, SubChunkRecord};

/// One framed entry from a chunk-file response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStreamEntry {
    pub kind: ChunkKind,
    pub chunknum: i32,
    pub hash_len: usize,
    pub body: Vec<u8>,
}

/// Decode the outer chunk-file framing:
/// `("a:" | "s:") CHUNKNUM ":" HASHLEN ":" CHUNKLEN "\n" BODY[CHUNKLEN]`
/// repeated until the buffer is exhausted.
pub fn decode_chunk_stream(data: &[u8]) -> Result<Vec<ChunkStreamEntry>, CodecError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(CodecError::Truncated);
        }
        let kind = match &data[pos..pos + 2] {
            b"a:" => ChunkKind::Add,
            b"s:" => ChunkKind::Sub,
            other => {
                return Err(CodecError::InvalidHeader(format!(
                    "unrecognized chunk type marker {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        pos += 2;

        let nl = data[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(CodecError::Truncated)?
            + pos;
        let header = std::str::from_utf8(&data[pos..nl])
            .map_err(|_| CodecError::InvalidHeader("non-utf8 chunk header".into()))?;

        let mut parts = header.splitn(3, ':');
        let chunknum: i32 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CodecError::InvalidHeader(header.to_string()))?;
        let hash_len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CodecError::InvalidHeader(header.to_string()))?;
        let chunklen: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CodecError::InvalidHeader(header.to_string()))?;

        pos = nl + 1;
        if pos + chunklen > data.len() {
            return Err(CodecError::Truncated);
        }
        let body = data[pos..pos + chunklen].to_vec();
        pos += chunklen;

        entries.push(ChunkStreamEntry { kind, chunknum, hash_len, body });
    }
    Ok(entries)
}

/// Decode an a-chunk body: `HOSTKEY[4] COUNT[1] (PREFIX[hash_len]){COUNT}`
/// repeated. `COUNT == 0` yields a single empty-prefix record that still
/// must be persisted -- it is the only evidence the chunk number exists.
pub fn decode_add_chunk_body(hash_len: usize, body: &[u8]) -> Result<Vec<AddChunkRecord>, CodecError> {
    if hash_len == 0 {
        return Err(CodecError::InvalidHashLen(hash_len));
    }
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        if pos + 5 > body.len() {
            return Err(CodecError::Truncated);
        }
        let mut hostkey = [0u8; 4];
        hostkey.copy_from_slice(&body[pos..pos + 4]);
        pos += 4;
        let count = body[pos] as usize;
        pos += 1;

        if count == 0 {
            records.push(AddChunkRecord { hostkey, prefix: Vec::new() });
            continue;
        }
        for _ in 0..count {
            if pos + hash_len > body.len() {
                return Err(CodecError::Truncated);
            }
            let prefix = body[pos..pos + hash_len].to_vec();
            pos += hash_len;
            records.push(AddChunkRecord { hostkey, prefix });
        }
    }
    Ok(records)
}

/// Decode an s-chunk body: `HOSTKEY[4] COUNT[1] (ADDCHUNKNUM_be32
/// PREFIX[hash_len]){COUNT}` repeated. `COUNT == 0` yields a single
/// empty-prefix record carrying just the revoked add-chunk number.
pub fn decode_sub_chunk_body(hash_len: usize, body: &[u8]) -> Result<Vec<SubChunkRecord>, CodecError> {
    if hash_len == 0 {
        return Err(CodecError::InvalidHashLen(hash_len));
    }
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        if pos + 5 > body.len() {
            return Err(CodecError::Truncated);
        }
        let mut hostkey = [0u8; 4];
        hostkey.copy_from_slice(&body[pos..pos + 4]);
        pos += 4;
        let count = body[pos] as usize;
        pos += 1;

        if count == 0 {
            if pos + 4 > body.len() {
                return Err(CodecError::Truncated);
            }
            let add_chunknum = i32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
            pos += 4;
            records.push(SubChunkRecord { hostkey, prefix: Vec::new(), add_chunknum });
            continue;
        }
        for _ in 0..count {
            if pos + 4 > body.len() {
                return Err(CodecError::Truncated);
            }
            let add_chunknum = i32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
            pos += 4;
            if pos + hash_len > body.len() {
                return Err(CodecError::Truncated);
            }
            let prefix = body[pos..pos + hash_len].to_vec();
            pos += hash_len;
            records.push(SubChunkRecord { hostkey, prefix, add_chunknum });
        }
    }
    Ok(records)
}

/// Encode a sorted, distinct set of chunk numbers as comma-separated
/// tokens, each either `N` or `A-B`. No trailing comma.
pub fn encode_ranges(nums: &[u32]) -> String {
    if nums.is_empty() {
        return String::new();
    }
    let mut sorted = nums.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut tokens = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == end + 1 {
            end = sorted[j];
            j += 1;
        }
        if end == start {
            tokens.push(start.to_string());
        } else {
            tokens.push(format!("{start}-{end}"));
        }
        i = j;
    }
    tokens.join(",")
}

/// Inverse of [`encode_ranges`].
pub fn parse_ranges(s: &str) -> Result<Vec<u32>, CodecError> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for token in s.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(CodecError::InvalidRange(s.to_string()));
        }
        if let Some((a, b)) = token.split_once('-') {
            let a: u32 = a.parse().map_err(|_| CodecError::InvalidRange(token.to_string()))?;
            let b: u32 = b.parse().map_err(|_| CodecError::InvalidRange(token.to_string()))?;
            if b < a {
                return Err(CodecError::InvalidRange(token.to_string()));
            }
            out.extend(a..=b);
        } else {
            let n: u32 = token.parse().map_err(|_| CodecError::InvalidRange(token.to_string()))?;
            out.push(n);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_roundtrip() {
        let nums = vec![1, 2, 3, 5, 7, 8, 9];
        let encoded = encode_ranges(&nums);
        assert_eq!(encoded, "1-3,5,7-9");
        assert_eq!(parse_ranges(&encoded).unwrap(), nums);
    }

    #[test]
    fn range_parse_single_values() {
        assert_eq!(parse_ranges("1-3,5,7-9").unwrap(), vec![1, 2, 3, 5, 7, 8, 9]);
    }

    #[test]
    fn range_encode_empty() {
        assert_eq!(encode_ranges(&[]), "");
        assert_eq!(parse_ranges("").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn empty_add_chunk_is_one_record() {
        let mut body = vec![0xAA, 0xBB, 0xCC, 0xDD];
        body.push(0); // COUNT == 0
        let records = decode_add_chunk_body(4, &body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].hostkey, [0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(records[0].prefix.is_empty());
    }

    #[test]
    fn add_chunk_with_prefixes() {
        let mut body = vec![1, 2, 3, 4, 2]; // hostkey + count=2
        body.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        body.extend([0x11, 0x22, 0x33, 0x44]);
        let records = decode_add_chunk_body(4, &body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prefix, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(records[1].prefix, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn sub_chunk_empty_prefix_carries_add_chunknum() {
        let mut body = vec![9, 9, 9, 9, 0]; // hostkey + count=0
        body.extend(100i32.to_be_bytes());
        let records = decode_sub_chunk_body(4, &body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].add_chunknum, 100);
        assert!(records[0].prefix.is_empty());
    }

    #[test]
    fn chunk_stream_decodes_mixed_entries() {
        let a_body = vec![1, 2, 3, 4, 0];
        let s_body = {
            let mut b = vec![5, 6, 7, 8, 0];
            b.extend(42i32.to_be_bytes());
            b
        };
        let mut stream = Vec::new();
        stream.extend(format!("a:42:4:{}\n", a_body.len()).into_bytes());
        stream.extend(&a_body);
        stream.extend(format!("s:7:4:{}\n", s_body.len()).into_bytes());
        stream.extend(&s_body);

        let entries = decode_chunk_stream(&stream).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ChunkKind::Add);
        assert_eq!(entries[0].chunknum, 42);
        assert_eq!(entries[1].kind, ChunkKind::Sub);
        assert_eq!(entries[1].chunknum, 7);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let body = vec![1, 2, 3, 4, 5]; // count=5 but no prefixes follow
        assert_eq!(decode_add_chunk_body(4, &body), Err(CodecError::Truncated));
    }
}
