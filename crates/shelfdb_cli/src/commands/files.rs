//! Whole-database file commands.

use shelfdb_core::{Config, Database};
use std::path::Path;

/// Copies the database at `from` to `name`.
pub fn copy(from: &Path, name: &str, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    Database::copy(from, name, config)?;
    println!("Copied {} to {name}", from.display());
    Ok(())
}

/// Deletes the database `name`.
pub fn delete(name: &str, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    Database::delete_database(name, dir)?;
    println!("Deleted {name}");
    Ok(())
}

/// Prints whether the database `name` exists.
pub fn exists(name: &str, dir: &Path) {
    if Database::exists(name, dir) {
        println!("{name} exists");
    } else {
        println!("{name} does not exist");
    }
}
