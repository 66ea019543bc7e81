//! Collection indexes.
//!
//! An index is a definition ([`IndexSpec`]) plus a table mapping derived
//! keys to document ids. Tables are rebuilt from the segment log on open
//! and updated in the same critical section that applies a commit.

mod spec;
mod table;

pub use spec::IndexSpec;
pub(crate) use table::IndexTable;
