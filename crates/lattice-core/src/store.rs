//! Thin wrapper around the embedded store: one redb database file holds
//! every sheet, with each sheet getting its own table for cell records
//! (see [`crate::serializer`]) and its own table for the dependency graph
//! (see [`crate::graph`]).

use std::path::Path;

use redb::Database;

use crate::error::Result;

/// Table holding a sheet's cell records, keyed by canonical cell id. Each
/// caller builds its own `TableDefinition::new(&cells_table_name(id))`
/// scoped to its transaction, since redb table names are plain runtime
/// strings rather than a registry of static definitions.
pub fn cells_table_name(sheet_id: &str) -> String {
    sheet_id.to_string()
}

/// Open (creating if absent) the redb database backing the whole service.
pub fn open(path: impl AsRef<Path>) -> Result<Database> {
    let db = Database::create(path)?;
    Ok(db)
}
