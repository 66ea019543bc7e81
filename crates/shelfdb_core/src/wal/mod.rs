//! Write-ahead log.
//!
//! Every commit is logged and flushed before its records reach the segment
//! log. On open, committed transactions whose records may be missing from
//! the segments are replayed.
//!
//! ## Frame format
//!
//! ```text
//! | magic "SWAL" (4) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! A partial frame at the end of the log is a crash mid-write and is
//! discarded. A complete frame with a bad checksum, magic or type stops
//! the open.

mod record;
mod writer;

pub use writer::WalManager;
