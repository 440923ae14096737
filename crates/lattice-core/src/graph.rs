//! Persisted dependency graph: for a sheet, which cells a formula in cell
//! `X` depends on, and (the inverse, used to know what to re-evaluate when
//! `X` changes) which cells depend on `X`.
//!
//! Each sheet gets its own redb table, separate from the table holding the
//! cells themselves, storing two kinds of keys:
//!
//! - an edge key `<depending-on-id> 0x00 <dependant-id>` (presence-only,
//!   value is empty) for each `dependant-id` that currently references
//!   `depending-on-id`
//! - a reverse-index key `0x00 0x00 <dependant-id>` whose value is the
//!   dependant's last-known depending-on list, joined by `0x00`, kept
//!   alongside the edges so that the next [`set_depends_on`] call can diff
//!   against it without a table scan
//!
//! A prefix scan over `<depending-on-id> 0x00` therefore yields exactly the
//! direct dependants of `depending-on-id`, in key order.

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::error::Result;

const DEPENDENCY_TABLE_PREFIX: &str = "__d_";
const DELIMITER: u8 = 0x00;

fn table_name(sheet_id: &str) -> String {
    format!("{DEPENDENCY_TABLE_PREFIX}{sheet_id}")
}

fn dependant_key(depending_on_id: &str, dependant_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(depending_on_id.len() + 1 + dependant_id.len());
    key.extend_from_slice(depending_on_id.as_bytes());
    key.push(DELIMITER);
    key.extend_from_slice(dependant_id.as_bytes());
    key
}

fn depending_on_prefix(depending_on_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(depending_on_id.len() + 1);
    key.extend_from_slice(depending_on_id.as_bytes());
    key.push(DELIMITER);
    key
}

fn depending_list_key(dependant_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(dependant_id.len() + 2);
    key.push(DELIMITER);
    key.push(DELIMITER);
    key.extend_from_slice(dependant_id.as_bytes());
    key
}

fn encode_list(ids: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(DELIMITER);
        }
        out.extend_from_slice(id.as_bytes());
    }
    out
}

fn decode_list(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes
        .split(|&b| b == DELIMITER)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

/// Record that `dependant_cell_id`'s formula now depends on exactly
/// `depending_on_cell_ids`, replacing whatever it depended on before, as
/// part of `write_txn`. Lets a caller (the sheet repository) fold this
/// update into the same transaction that writes the cell's bytes, so a
/// reader never observes one without the other.
pub fn set_depends_on_in_txn(
    write_txn: &WriteTransaction,
    sheet_id: &str,
    dependant_cell_id: &str,
    depending_on_cell_ids: &[String],
) -> Result<()> {
    let name = table_name(sheet_id);
    let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
    let mut table = write_txn.open_table(def)?;

    let old_list = table
        .get(depending_list_key(dependant_cell_id).as_slice())?
        .map(|v| decode_list(v.value()))
        .unwrap_or_default();

    for old_id in &old_list {
        if !depending_on_cell_ids.contains(old_id) {
            table.remove(dependant_key(old_id, dependant_cell_id).as_slice())?;
        }
    }
    for new_id in depending_on_cell_ids {
        if !old_list.contains(new_id) {
            table.insert(dependant_key(new_id, dependant_cell_id).as_slice(), &[][..])?;
        }
    }

    let list_key = depending_list_key(dependant_cell_id);
    if depending_on_cell_ids.is_empty() {
        table.remove(list_key.as_slice())?;
    } else {
        table.insert(list_key.as_slice(), encode_list(depending_on_cell_ids).as_slice())?;
    }
    Ok(())
}

/// Convenience wrapper over [`set_depends_on_in_txn`] that opens and
/// commits its own transaction, for callers that aren't already combining
/// this update with another write.
pub fn set_depends_on(
    db: &Database,
    sheet_id: &str,
    dependant_cell_id: &str,
    depending_on_cell_ids: &[String],
) -> Result<()> {
    let write_txn = db.begin_write()?;
    set_depends_on_in_txn(&write_txn, sheet_id, dependant_cell_id, depending_on_cell_ids)?;
    write_txn.commit()?;
    Ok(())
}

/// All cells that transitively depend on `depending_on_cell_id`, in
/// breadth-first discovery order, each appearing exactly once.
pub fn get_dependants(db: &Database, sheet_id: &str, depending_on_cell_id: &str) -> Result<Vec<String>> {
    let name = table_name(sheet_id);
    let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(def) {
        Ok(table) => table,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut visited = std::collections::HashSet::new();
    let mut result = Vec::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(depending_on_cell_id.to_string());

    while let Some(id) = queue.pop_front() {
        let prefix = depending_on_prefix(&id);
        let mut direct = Vec::new();
        for entry in table.range(prefix.as_slice()..)? {
            let (key, _) = entry?;
            let key_bytes = key.value();
            if !key_bytes.starts_with(prefix.as_slice()) {
                break;
            }
            direct.push(String::from_utf8_lossy(&key_bytes[prefix.len()..]).into_owned());
        }
        for dependant in direct {
            if visited.insert(dependant.clone()) {
                result.push(dependant.clone());
                queue.push_back(dependant);
            }
        }
    }
    Ok(result)
}
