//! Chunk files: immutable-once-written runs of entities for one range.
//!
//! A chunk file is named by the exact range of grouping numbers it may hold
//! (`"<start>_<end>"`) and lives directly inside its segment directory.
//!
//! ## Chunk File Format
//!
//! ```text
//! | magic "CHNK" (4) | version (2) | record* |
//!
//! record:
//! | record_len (4) | key_start (8) | key_end (8) | id_len (4) | id (N) | value (M) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. Records are sorted by key. A bad header,
//! truncated record or checksum mismatch is reported as
//! [`CoreError::ChunkReadFailure`](crate::CoreError::ChunkReadFailure).

mod file;
mod record;

pub use file::{
    decode_chunk, encode_chunk, list_chunk_ranges, list_temp_ranges, ChunkFile, CHUNK_MAGIC,
    CHUNK_VERSION, TEMP_SUFFIX,
};
pub use record::compute_crc32;
