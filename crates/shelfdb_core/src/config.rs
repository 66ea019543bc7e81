//! Database configuration.

use crate::notify::Executor;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Options for opening a database.
///
/// ```rust
/// use shelfdb_core::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .directory("/tmp/shelf")
///     .sync_on_commit(false)
///     .expiration_sweep_interval(Duration::from_millis(250));
/// assert!(!config.sync_on_commit);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Parent directory of `<name>.shelfdb`. Defaults to the current directory.
    pub directory: PathBuf,

    /// Create the database when it does not exist.
    pub create_if_missing: bool,

    /// `fsync` the write-ahead log on every commit instead of only flushing it.
    pub sync_on_commit: bool,

    /// Pause between two expiration sweeps. Zero disables the background
    /// sweep; `Database::purge_expired_documents` still works.
    pub expiration_sweep_interval: Duration,

    /// Keep tombstones when compacting.
    pub tombstone_retention: bool,

    /// Executor used for listeners registered without one. `None` gives each
    /// database its own serial dispatch queue.
    pub executor: Option<Arc<dyn Executor>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            create_if_missing: true,
            sync_on_commit: true,
            expiration_sweep_interval: Duration::from_secs(1),
            tombstone_retention: true,
            executor: None,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the parent directory.
    #[must_use]
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    /// Sets whether a missing database is created.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether every commit is synced to disk.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the expiration sweep interval.
    #[must_use]
    pub const fn expiration_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiration_sweep_interval = interval;
        self
    }

    /// Sets whether compaction keeps tombstones.
    #[must_use]
    pub const fn tombstone_retention(mut self, value: bool) -> Self {
        self.tombstone_retention = value;
        self
    }

    /// Sets the default listener executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("directory", &self.directory)
            .field("create_if_missing", &self.create_if_missing)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("expiration_sweep_interval", &self.expiration_sweep_interval)
            .field("tombstone_retention", &self.tombstone_retention)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}
