//! Scopes and collection naming.

use crate::collection::Collection;
use crate::database::DbInner;
use crate::error::{DbError, DbResult};
use crate::manifest::DEFAULT_NAME;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 251;

/// Checks a scope or collection name.
///
/// Names are 1 to 251 characters from `A-Z a-z 0-9 _ - %` and may not start
/// with `_` or `%`, except for `_default` itself.
pub(crate) fn validate_name(kind: &str, name: &str) -> DbResult<()> {
    if name == DEFAULT_NAME {
        return Ok(());
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DbError::invalid_argument(format!(
            "{kind} name must be 1 to {MAX_NAME_LEN} characters: {name:?}"
        )));
    }
    if name.starts_with(['_', '%']) {
        return Err(DbError::invalid_argument(format!(
            "{kind} name may not start with '_' or '%': {name:?}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '%')))
    {
        return Err(DbError::invalid_argument(format!(
            "{kind} name contains {bad:?}: {name:?}"
        )));
    }
    Ok(())
}

/// Maps an empty scope name to the default scope.
pub(crate) fn scope_or_default(scope: &str) -> &str {
    if scope.is_empty() {
        DEFAULT_NAME
    } else {
        scope
    }
}

/// A named group of collections.
///
/// The default scope always exists; any other scope exists while it holds
/// at least one collection.
#[derive(Clone)]
pub struct Scope {
    name: String,
    db: Arc<DbInner>,
}

impl Scope {
    pub(crate) fn new(name: String, db: Arc<DbInner>) -> Self {
        Self { name, db }
    }

    /// The scope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collections currently in this scope.
    ///
    /// # Errors
    ///
    /// `NotOpen` once the database is closed.
    pub fn collections(&self) -> DbResult<Vec<Collection>> {
        self.db.collections(&self.name)
    }

    /// One collection of this scope.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist, `NotOpen` once the database is closed.
    pub fn collection(&self, name: &str) -> DbResult<Collection> {
        self.db.collection(name, &self.name)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("name", &self.name).finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.db, &other.db)
    }
}
