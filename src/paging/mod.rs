//! Range chunking and stateless pagination.
//!
//! - [`chunker`]: splits a range into provider-limit-safe row chunks
//! - [`cursor`]: opaque page cursors carrying their own integrity checksum

pub mod chunker;
pub mod cursor;

pub use chunker::{plan_chunks, rows_per_chunk, total_pages};
pub use cursor::{decode_cursor, encode_cursor, Cursor, CursorBasis, CursorError};
