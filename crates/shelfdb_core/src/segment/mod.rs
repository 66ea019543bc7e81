//! Segment log holding every stored document version.
//!
//! ## Record format
//!
//! ```text
//! | len (4) | collection (4) | flags (1) | sequence (8) | revision (8) |
//! | expiration (8) | id_len (2) | id (N) | cbor body (M) | crc32 (4) |
//! ```
//!
//! Flags: `0x01` tombstone, `0x04` purge. Expiration `0` means none.

mod compaction;
mod record;
mod store;

pub use compaction::{CompactionResult, Compactor};
pub use record::SegmentRecord;
pub(crate) use record::{decode_body, encode_body};
pub use store::{AppendError, SegmentStore};
