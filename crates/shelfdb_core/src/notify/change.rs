//! Change events.

/// What a commit did to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Saved with no live prior version.
    Inserted,
    /// Saved over a live prior version.
    Updated,
    /// Replaced by a tombstone.
    Deleted,
    /// Removed without a trace, explicitly or by expiration.
    Purged,
}

/// Delivered to a document listener, once per commit that touched its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Sequence of the commit.
    pub sequence: u64,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
    /// The document.
    pub document_id: String,
    /// Last change the commit made to the document.
    pub kind: ChangeKind,
}

/// Delivered to a collection listener, once per commit that touched the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChange {
    /// Sequence of the commit.
    pub sequence: u64,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
    /// Changed documents, in the order the commit first touched them.
    pub document_ids: Vec<String>,
}
