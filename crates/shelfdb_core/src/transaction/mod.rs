//! Write transactions.
//!
//! A transaction collects staged segment records for one commit. The
//! [`TransactionManager`] owns the writer lock, the WAL and the commit path.

mod manager;
mod state;

pub(crate) use manager::{holds_writer, TransactionManager};
pub(crate) use state::{StoredState, Transaction};
