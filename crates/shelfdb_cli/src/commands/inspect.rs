//! Inspect command implementation.

use serde::Serialize;
use shelfdb_core::{Config, Database, MaintenanceType, StoreStatistics};

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database name.
    pub name: String,
    /// Database directory.
    pub path: String,
    /// Sequence of the last commit.
    pub last_sequence: u64,
    /// Live documents.
    pub documents: u64,
    /// Deletion markers still stored.
    pub tombstones: u64,
    /// Documents with an expiration.
    pub expiring: u64,
    /// Segment log size in bytes.
    pub segment_bytes: u64,
    /// Segment log records, present after a full scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_records: Option<u64>,
    /// Per-collection details.
    pub collections: Vec<CollectionInfo>,
}

/// Details of one collection.
#[derive(Debug, Serialize)]
pub struct CollectionInfo {
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub name: String,
    /// Live documents.
    pub documents: u64,
    /// Index names.
    pub indexes: Vec<String>,
}

/// Gathers the inspection result of an open database.
pub fn inspect(db: &Database, full: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let kind = if full {
        MaintenanceType::FullOptimize
    } else {
        MaintenanceType::Optimize
    };
    db.perform_maintenance(kind)?;
    let StoreStatistics {
        documents,
        tombstones,
        expiring,
        segment_bytes,
        segment_records,
        ..
    } = db.statistics();

    let mut collections = Vec::new();
    for scope in db.scopes()? {
        for collection in scope.collections()? {
            collections.push(CollectionInfo {
                scope: scope.name().to_owned(),
                name: collection.name().to_owned(),
                documents: collection.count()?,
                indexes: collection.indexes()?,
            });
        }
    }

    Ok(InspectResult {
        name: db.name().to_owned(),
        path: db
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        last_sequence: db.last_sequence(),
        documents,
        tombstones,
        expiring,
        segment_bytes,
        segment_records,
        collections,
    })
}

/// Runs the inspect command.
pub fn run(
    name: &str,
    config: Config,
    full: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(name, config)?;
    let result = inspect(&db, full)?;
    db.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("ShelfDB Database: {} ({})", result.name, result.path);
    println!("==================");
    println!("Last sequence:  {}", result.last_sequence);
    println!("Documents:      {}", result.documents);
    println!("Tombstones:     {}", result.tombstones);
    println!("Expiring:       {}", result.expiring);
    println!("Segment bytes:  {}", result.segment_bytes);
    if let Some(records) = result.segment_records {
        println!("Segment records: {records}");
    }
    println!();
    println!("Collections:");
    for c in &result.collections {
        println!("  {}.{}: {} documents", c.scope, c.name, c.documents);
        for index in &c.indexes {
            println!("    index {index}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfdb_core::Document;
    use tempfile::tempdir;

    #[test]
    fn inspect_reports_collections() {
        let temp = tempdir().unwrap();
        let db = Database::open("app", Config::new().directory(temp.path())).unwrap();
        let users = db.create_collection("users", "app").unwrap();
        for i in 0..3 {
            users.save(&mut Document::with_id(format!("u{i}"))).unwrap();
        }

        let result = inspect(&db, true).unwrap();
        assert_eq!(result.documents, 3);
        assert_eq!(result.last_sequence, 3);
        assert_eq!(result.segment_records, Some(3));
        let users = result
            .collections
            .iter()
            .find(|c| c.scope == "app" && c.name == "users")
            .unwrap();
        assert_eq!(users.documents, 3);
    }
}
