//! Change notifications.
//!
//! Listeners register per collection, either for one document id or for
//! the whole collection. After each commit the bus builds one
//! [`DocumentChange`] per matching document listener and one
//! [`CollectionChange`] (listing every changed id) per collection
//! listener, and hands them to the listener's [`Executor`].

mod bus;
mod change;
mod executor;

pub(crate) use bus::{ChangeBus, Target};
pub use bus::ListenerToken;
pub use change::{ChangeKind, CollectionChange, DocumentChange};
pub use executor::{DispatchQueue, Executor, InlineExecutor, Task};
