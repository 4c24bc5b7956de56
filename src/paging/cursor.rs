//! Opaque page cursors.
//!
//! A cursor is URL-safe base64 (no padding) over a compact JSON document:
//!
//! ```text
//! {"v":1,"r":"Sheet1!A1:Z100000","s":1000,"p":3,"c":"9f86d081884c7d65"}
//! ```
//!
//! `c` is the first 16 hex characters of SHA-256 over the resource id, range,
//! page size and page index. The resource id is not stored in the token; the
//! caller supplies it again on every page, and a token presented for another
//! resource fails its checksum. Nothing is kept server-side.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::range::CellRange;

const CURSOR_VERSION: u8 = 1;
const CHECKSUM_HEX_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is not a valid token")]
    Malformed,

    #[error("cursor version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("cursor checksum does not match its contents")]
    ChecksumMismatch,

    #[error("cursor was issued for a different {field}")]
    BasisMismatch { field: &'static str },
}

/// What a cursor is bound to: the logical request being paged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorBasis {
    pub resource_id: String,
    pub range: CellRange,
    pub page_size: u32,
}

impl CursorBasis {
    pub fn new(resource_id: &str, range: CellRange, page_size: u32) -> Self {
        Self {
            resource_id: resource_id.trim().to_string(),
            range,
            page_size,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Token {
    v: u8,
    r: String,
    s: u32,
    p: u64,
    c: String,
}

/// Decoded, not yet verified, cursor contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub range: CellRange,
    pub page_size: u32,
    pub page_index: u64,
    checksum: String,
}

fn checksum(resource_id: &str, range: &CellRange, page_size: u32, page_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_id.as_bytes());
    hasher.update(b"|");
    hasher.update(range.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(page_size.to_be_bytes());
    hasher.update(page_index.to_be_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CHECKSUM_HEX_LEN);
    digest
}

/// Encode a cursor for page `page_index` (0-based) of `basis`.
pub fn encode_cursor(page_index: u64, basis: &CursorBasis) -> String {
    let token = Token {
        v: CURSOR_VERSION,
        r: basis.range.to_string(),
        s: basis.page_size,
        p: page_index,
        c: checksum(&basis.resource_id, &basis.range, basis.page_size, page_index),
    };
    // Serializing a struct of strings and integers cannot fail.
    let json = serde_json::to_vec(&token).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode and verify in one step, returning the page index.
pub fn decode_cursor(token: &str, expected: &CursorBasis) -> Result<u64, CursorError> {
    Cursor::decode(token)?.verify(expected)
}

impl Cursor {
    /// Parse a token without checking it against a basis.
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CursorError::Malformed)?;
        let token: Token = serde_json::from_slice(&bytes).map_err(|_| CursorError::Malformed)?;
        if token.v != CURSOR_VERSION {
            return Err(CursorError::UnsupportedVersion(token.v));
        }
        let range = CellRange::parse(&token.r).map_err(|_| CursorError::Malformed)?;
        Ok(Self {
            range,
            page_size: token.s,
            page_index: token.p,
            checksum: token.c,
        })
    }

    /// Check the cursor against the basis the caller re-specified.
    pub fn verify(&self, expected: &CursorBasis) -> Result<u64, CursorError> {
        let computed = checksum(&expected.resource_id, &self.range, self.page_size, self.page_index);
        if computed != self.checksum {
            return Err(CursorError::ChecksumMismatch);
        }
        if self.range != expected.range {
            return Err(CursorError::BasisMismatch { field: "range" });
        }
        if self.page_size != expected.page_size {
            return Err(CursorError::BasisMismatch { field: "page size" });
        }
        Ok(self.page_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(range: &str, page_size: u32) -> CursorBasis {
        CursorBasis::new("book", CellRange::parse(range).unwrap(), page_size)
    }

    #[test]
    fn test_roundtrip() {
        let b = basis("Sheet1!A1:Z100000", 1_000);
        let token = encode_cursor(42, &b);
        assert!(!token.contains('='));
        assert_eq!(decode_cursor(&token, &b), Ok(42));
    }

    #[test]
    fn test_equivalent_range_spelling_still_matches() {
        let token = encode_cursor(3, &basis("a1:c10", 5));
        assert_eq!(decode_cursor(&token, &basis("$C$10:$A$1", 5)), Ok(3));
    }

    #[test]
    fn test_other_resource_fails_checksum() {
        let token = encode_cursor(1, &basis("A1:C10", 5));
        let other = CursorBasis::new("other", CellRange::parse("A1:C10").unwrap(), 5);
        assert_eq!(decode_cursor(&token, &other), Err(CursorError::ChecksumMismatch));
    }

    #[test]
    fn test_changed_basis_is_rejected() {
        let token = encode_cursor(1, &basis("A1:C10", 5));
        assert_eq!(
            decode_cursor(&token, &basis("A1:C11", 5)),
            Err(CursorError::BasisMismatch { field: "range" })
        );
        assert_eq!(
            decode_cursor(&token, &basis("A1:C10", 6)),
            Err(CursorError::BasisMismatch { field: "page size" })
        );
    }

    #[test]
    fn test_tampered_page_index_is_rejected() {
        let b = basis("A1:C10", 5);
        let token = encode_cursor(1, &b);
        let json = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let tampered = String::from_utf8(json).unwrap().replace("\"p\":1", "\"p\":2");
        let tampered = URL_SAFE_NO_PAD.encode(tampered);
        assert_eq!(decode_cursor(&tampered, &b), Err(CursorError::ChecksumMismatch));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let b = basis("A1:C10", 5);
        assert_eq!(decode_cursor("not a cursor!", &b), Err(CursorError::Malformed));
        let no_json = URL_SAFE_NO_PAD.encode("hello");
        assert_eq!(decode_cursor(&no_json, &b), Err(CursorError::Malformed));
    }
}
