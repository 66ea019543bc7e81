//! Maintenance commands.

use shelfdb_core::{Config, Database, MaintenanceType};
use tracing::info;

/// Runs one maintenance pass on a closed database.
pub fn run(name: &str, config: Config, kind: &str) -> Result<(), Box<dyn std::error::Error>> {
    let kind: MaintenanceType = kind.parse()?;
    let db = Database::open(name, config)?;
    db.perform_maintenance(kind)?;
    db.close()?;
    info!(?kind, "maintenance finished");
    println!("{kind:?}: ok");
    Ok(())
}

/// Purges expired documents once.
pub fn purge_expired(name: &str, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(name, config)?;
    let purged = db.purge_expired_documents()?;
    db.close()?;
    println!("Purged {purged} expired documents");
    Ok(())
}
