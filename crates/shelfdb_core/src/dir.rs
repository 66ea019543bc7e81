//! Database directory management.
//!
//! Each database is a directory named `<name>.shelfdb`:
//!
//! ```text
//! <name>.shelfdb/
//! ├─ MANIFEST          # collection registry, indexes, last checkpoint
//! ├─ LOCK              # advisory lock, one writable handle at a time
//! ├─ wal.log           # write-ahead log
//! ├─ segments.dat      # segment log
//! └─ blobs/            # content-addressed blob files
//! ```

use crate::error::{DbError, DbResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const SEGMENT_FILE: &str = "segments.dat";
const BLOBS_DIR: &str = "blobs";

/// Extension of a database directory.
pub(crate) const EXTENSION: &str = "shelfdb";

/// Path of the database `name` inside `directory`.
pub(crate) fn bundle_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.{EXTENSION}"))
}

/// Holds the lock on an open database directory.
///
/// The lock is released when this value drops.
#[derive(Debug)]
pub(crate) struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens (or creates) a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// `NotFound` if it is missing and `create_if_missing` is false, `Busy`
    /// if another handle holds the lock.
    pub(crate) fn open(path: &Path, create_if_missing: bool) -> DbResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(DbError::not_found(format!("database {}", path.display())));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(DbError::invalid_argument(format!(
                "not a database directory: {}",
                path.display()
            )));
        }
        let lock_file = try_lock(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    pub(crate) fn segment_path(&self) -> PathBuf {
        self.path.join(SEGMENT_FILE)
    }

    pub(crate) fn blobs_path(&self) -> PathBuf {
        self.path.join(BLOBS_DIR)
    }

    fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest; `None` for a new database.
    pub(crate) fn load_manifest(&self) -> DbResult<Option<Manifest>> {
        match fs::read(self.manifest_path()) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Manifest::decode(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the manifest with write, sync, rename, then a directory sync.
    pub(crate) fn save_manifest(&self, manifest: &Manifest) -> DbResult<()> {
        let temp_path = self.path.join(MANIFEST_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&manifest.encode()?)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, self.manifest_path())?;
        sync_directory(&self.path)
    }
}

fn try_lock(path: &Path) -> DbResult<File> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.join(LOCK_FILE))?;
    if lock_file.try_lock_exclusive().is_err() {
        return Err(DbError::busy(format!(
            "database {} is open elsewhere",
            path.display()
        )));
    }
    Ok(lock_file)
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> DbResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> DbResult<()> {
    Ok(())
}

/// Removes a closed database directory.
///
/// # Errors
///
/// `NotFound` if there is none, `Busy` if it is open.
pub(crate) fn remove(path: &Path) -> DbResult<()> {
    if !path.is_dir() {
        return Err(DbError::not_found(format!("database {}", path.display())));
    }
    let lock = try_lock(path)?;
    drop(lock);
    fs::remove_dir_all(path)?;
    Ok(())
}

/// Copies a closed database directory byte for byte, lock file excluded.
///
/// # Errors
///
/// `NotFound` if `from` is missing, `InvalidArgument` if `to` exists,
/// `Busy` if `from` is open.
pub(crate) fn copy(from: &Path, to: &Path) -> DbResult<()> {
    if !from.is_dir() {
        return Err(DbError::not_found(format!("database {}", from.display())));
    }
    if to.exists() {
        return Err(DbError::invalid_argument(format!(
            "{} already exists",
            to.display()
        )));
    }
    let lock = try_lock(from)?;
    let result = copy_tree(from, to);
    drop(lock);
    if result.is_err() {
        let _ = fs::remove_dir_all(to);
    }
    result
}

fn copy_tree(from: &Path, to: &Path) -> DbResult<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == LOCK_FILE {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
