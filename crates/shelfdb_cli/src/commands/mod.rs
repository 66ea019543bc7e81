//! CLI command implementations.

pub mod files;
pub mod inspect;
pub mod maintain;
