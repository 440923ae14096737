//! Transactional sheet repository: binds the canonicalizer, serializer,
//! formula engine and dependency graph to the embedded store, enforcing
//! the write protocol and invariants described in the component design
//! (read-check, recompute, commit, in that order, never observing a
//! partial graph).

use std::collections::HashMap;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::canonical::canonicalize;
use crate::error::{Error, Result};
use crate::expr::{
    extract_depending_on_list, extract_external_refs, EmptyValuesGetter, Evaluator, ValuesGetter,
    ValuesGetterChain,
};
use crate::graph;
use crate::model::{is_formula, Cell, EvalValue, FORMULA_PREFIX};
use crate::serializer::{marshal, unmarshal};

type CellTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// `sheet_id` is assumed already canonical; the table name is exactly the
/// id, per [`crate::store::cells_table_name`].
fn cells_table(sheet_id: &str) -> CellTable<'_> {
    TableDefinition::new(sheet_id)
}

/// Whether a [`SheetRepository::set_cell`] call actually changed the store.
/// Only [`WriteOutcome::Applied`] writes trigger webhook notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `skip_if_unchanged` was set and the serialized bytes were identical
    /// to what's already stored; `result` was still refreshed.
    Unchanged,
    /// The cell (and its dependants' depends-on edges) were committed.
    Applied,
}

/// The result of a successful [`SheetRepository::set_cell`] call: the
/// written cell plus every dependant that was recomputed as a side effect,
/// each ready to hand to the webhook dispatcher.
#[derive(Debug, Clone)]
pub struct CellOutcome {
    pub cell: Cell,
    pub recomputed_dependants: Vec<Cell>,
    pub outcome: WriteOutcome,
    /// Literal URL arguments to `external_ref(...)` calls newly present in
    /// `cell.value`, for the external-reference subscriber to act on.
    pub external_refs: Vec<String>,
}

/// Reads already-persisted cell values out of one sheet's table, resolving
/// formulas it encounters along the way. Used as the "fall back to the
/// store" half of the values-getter chain consulted while evaluating an
/// in-flight batch, and as the sole getter for a plain `get_cell` read.
///
/// Guards against a reference cycle that never touches the in-flight batch
/// (e.g. two persisted cells that reference only each other) with its own
/// in-progress set, independent of whatever cache the in-flight batch's
/// [`Evaluator`] is using.
struct StoreValuesGetter<'a> {
    db: &'a Database,
    sheet_id: &'a str,
    in_progress: std::cell::RefCell<std::collections::HashSet<String>>,
}

impl<'a> StoreValuesGetter<'a> {
    fn new(db: &'a Database, sheet_id: &'a str) -> Self {
        StoreValuesGetter { db, sheet_id, in_progress: std::cell::RefCell::new(Default::default()) }
    }

    fn read_raw(&self, cell_id: &str) -> Result<Option<String>> {
        Ok(self.read_record(cell_id)?.map(|(_, value)| value))
    }

    /// Reads `(original_key, value)` for `cell_id` as currently committed.
    fn read_record(&self, cell_id: &str) -> Result<Option<(String, String)>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(cells_table(self.sheet_id)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(guard) = table.get(cell_id.as_bytes())? else {
            return Ok(None);
        };
        let (original_key, value_bytes) = unmarshal(guard.value())?;
        let value = String::from_utf8(value_bytes)
            .map_err(|e| Error::Serializer(format!("value is not valid utf-8: {e}")))?;
        Ok(Some((original_key, value)))
    }
}

impl ValuesGetter for StoreValuesGetter<'_> {
    fn get_values(&self, cell_ids: &[String]) -> Result<Vec<Option<EvalValue>>> {
        let mut out = Vec::with_capacity(cell_ids.len());
        for id in cell_ids {
            if self.in_progress.borrow().contains(id) {
                return Err(Error::CircularReference(id.clone()));
            }
            let Some(raw) = self.read_raw(id)? else {
                out.push(None);
                continue;
            };
            if is_formula(&raw) {
                self.in_progress.borrow_mut().insert(id.clone());
                let body = &raw[FORMULA_PREFIX.len_utf8()..];
                let mut single = HashMap::new();
                single.insert(id.clone(), format!("={body}"));
                let value = {
                    let evaluator = Evaluator::new(&single, self);
                    evaluator.evaluate_one(id)
                };
                self.in_progress.borrow_mut().remove(id);
                out.push(Some(value?));
            } else {
                out.push(Some(EvalValue::coerce_str(&raw)));
            }
        }
        Ok(out)
    }
}

/// Binds the canonicalizer, serializer, formula engine, dependency graph
/// and embedded store into the write/read protocol described in the
/// component design.
pub struct SheetRepository {
    db: Arc<Database>,
}

impl SheetRepository {
    pub fn new(db: Arc<Database>) -> Self {
        SheetRepository { db }
    }

    /// The canonical form of a sheet identifier; exposed so callers that
    /// key their own registries on a sheet (the webhook dispatcher, the
    /// external-reference subscriber) agree with the store on identity.
    pub fn canonical_sheet_id(&self, sheet_id: &str) -> String {
        canonicalize(sheet_id)
    }

    /// Write `value` into `(sheet_id, cell_id)`.
    ///
    /// Follows the seven-step protocol: case-fold the sheet id, reject a
    /// blacklisted cell id, canonicalize and serialize, read dependants
    /// under a read transaction, recompute the target plus its dependants
    /// together (so a single evaluation pass sees a consistent view),
    /// then commit the new value and depends-on edges under a write
    /// transaction. Only a committed write returns [`WriteOutcome::Applied`].
    pub fn set_cell(
        &self,
        sheet_id: &str,
        cell_id: &str,
        value: &str,
        skip_if_unchanged: bool,
    ) -> Result<CellOutcome> {
        if let Some(bad) = cell_id.chars().find(|c| crate::model::CELL_ID_BLACKLIST.contains(c)) {
            return Err(Error::CellIdBlacklisted(format!("{cell_id} (contains {bad:?})")));
        }

        let sheet_id = canonicalize(sheet_id);
        let canonical_cell_id = canonicalize(cell_id);
        let new_record = marshal(cell_id, value.as_bytes());

        let store_getter = StoreValuesGetter::new(&self.db, &sheet_id);

        let (dependants, unchanged) = {
            let read_txn = self.db.begin_read()?;
            match read_txn.open_table(cells_table(&sheet_id)) {
                Ok(table) => {
                    let stored = table
                        .get(canonical_cell_id.as_bytes())?
                        .map(|g| g.value().to_vec());
                    let unchanged =
                        skip_if_unchanged && stored.as_deref() == Some(new_record.as_slice());
                    drop(table);
                    let dependants = if unchanged {
                        Vec::new()
                    } else {
                        graph::get_dependants(&self.db, &sheet_id, &canonical_cell_id)?
                    };
                    (dependants, unchanged)
                }
                Err(redb::TableError::TableDoesNotExist(_)) => (Vec::new(), false),
                Err(e) => return Err(e.into()),
            }
        };

        if unchanged {
            let result = evaluate_single(&canonical_cell_id, value, &store_getter)?;
            return Ok(CellOutcome {
                cell: Cell {
                    original_key: cell_id.to_string(),
                    canonical_key: canonical_cell_id,
                    value: value.to_string(),
                    result,
                },
                recomputed_dependants: Vec::new(),
                outcome: WriteOutcome::Unchanged,
                external_refs: Vec::new(),
            });
        }

        let mut expressions = HashMap::with_capacity(dependants.len() + 1);
        expressions.insert(canonical_cell_id.clone(), value.to_string());
        let mut dependant_records = HashMap::with_capacity(dependants.len());
        for dependant_id in &dependants {
            if let Some((original_key, raw)) = store_getter.read_record(dependant_id)? {
                expressions.insert(dependant_id.clone(), raw.clone());
                dependant_records.insert(dependant_id.clone(), (original_key, raw));
            }
        }

        let chained = ValuesGetterChain::new(&EmptyValuesGetter, &store_getter);
        let evaluator = Evaluator::new(&expressions, &chained);
        let results = evaluator.evaluate_all(true)?;

        let new_cell_result = results
            .get(&canonical_cell_id)
            .cloned()
            .unwrap_or(EvalValue::Null)
            .to_string();

        let ast = if is_formula(value) {
            crate::expr::parse(&value[FORMULA_PREFIX.len_utf8()..]).ok()
        } else {
            None
        };
        let new_depending_on = ast.as_ref().map(extract_depending_on_list).unwrap_or_default();
        let external_refs = ast.as_ref().map(extract_external_refs).unwrap_or_default();

        {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(cells_table(&sheet_id))?;
                table.insert(canonical_cell_id.as_bytes(), new_record.as_slice())?;
            }
            graph::set_depends_on_in_txn(&write_txn, &sheet_id, &canonical_cell_id, &new_depending_on)?;
            write_txn.commit()?;
        }

        let mut recomputed_dependants = Vec::with_capacity(dependants.len());
        for dependant_id in &dependants {
            let Some((original_key, raw)) = dependant_records.get(dependant_id) else { continue };
            let result = results.get(dependant_id).cloned().unwrap_or(EvalValue::Null).to_string();
            recomputed_dependants.push(Cell {
                original_key: original_key.clone(),
                canonical_key: dependant_id.clone(),
                value: raw.clone(),
                result,
            });
        }

        Ok(CellOutcome {
            cell: Cell {
                original_key: cell_id.to_string(),
                canonical_key: canonical_cell_id,
                value: value.to_string(),
                result: new_cell_result,
            },
            recomputed_dependants,
            outcome: WriteOutcome::Applied,
            external_refs,
        })
    }

    /// Read a single cell, evaluating its `result` on the fly against the
    /// currently committed values of whatever it transitively references.
    pub fn get_cell(&self, sheet_id: &str, cell_id: &str) -> Result<Cell> {
        let sheet_id = canonicalize(sheet_id);
        let canonical_cell_id = canonicalize(cell_id);

        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(cells_table(&sheet_id)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(Error::SheetNotFound(sheet_id))
            }
            Err(e) => return Err(e.into()),
        };
        let guard = table
            .get(canonical_cell_id.as_bytes())?
            .ok_or_else(|| Error::CellNotFound(canonical_cell_id.clone()))?;
        let (original_key, value_bytes) = unmarshal(guard.value())?;
        let value = String::from_utf8(value_bytes)
            .map_err(|e| Error::Serializer(format!("value is not valid utf-8: {e}")))?;
        drop(guard);
        drop(table);

        let store_getter = StoreValuesGetter::new(&self.db, &sheet_id);
        let result = evaluate_single(&canonical_cell_id, &value, &store_getter)?;

        Ok(Cell { original_key, canonical_key: canonical_cell_id, value, result })
    }

    /// Read every cell in a sheet, evaluating every formula together in
    /// one batch so cross-references within the sheet are resolved from
    /// each other rather than round-tripping through the store per cell.
    /// Returns the sheet even if some cells fail to evaluate; a failing
    /// cell's `result` carries its error message instead.
    pub fn get_cell_list(&self, sheet_id: &str) -> Result<Vec<Cell>> {
        let sheet_id = canonicalize(sheet_id);

        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(cells_table(&sheet_id)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(Error::SheetNotFound(sheet_id))
            }
            Err(e) => return Err(e.into()),
        };

        let mut expressions = HashMap::new();
        let mut originals = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let canonical_key = String::from_utf8_lossy(key.value()).into_owned();
            let (original_key, value_bytes) = unmarshal(value.value())?;
            let value_str = String::from_utf8(value_bytes)
                .map_err(|e| Error::Serializer(format!("value is not valid utf-8: {e}")))?;
            originals.insert(canonical_key.clone(), (original_key, value_str.clone()));
            expressions.insert(canonical_key, value_str);
        }
        drop(table);

        let empty = EmptyValuesGetter;
        let evaluator = Evaluator::new(&expressions, &empty);
        let results = evaluator.evaluate_all(false)?;

        let mut out = Vec::with_capacity(originals.len());
        for (canonical_key, (original_key, value)) in originals {
            let result = results.get(&canonical_key).cloned().unwrap_or(EvalValue::Null).to_string();
            out.push(Cell { original_key, canonical_key, value, result });
        }
        Ok(out)
    }
}

/// Evaluates one cell's raw `value` against `getter`: a non-formula is
/// returned verbatim, a formula is parsed and evaluated with its own
/// single-entry expressions map.
fn evaluate_single(canonical_cell_id: &str, value: &str, getter: &dyn ValuesGetter) -> Result<String> {
    if !is_formula(value) {
        return Ok(value.to_string());
    }
    let mut single = HashMap::new();
    single.insert(canonical_cell_id.to_string(), value.to_string());
    let evaluator = Evaluator::new(&single, getter);
    match evaluator.evaluate_one(canonical_cell_id) {
        Ok(v) => Ok(v.to_string()),
        Err(e) => Ok(format!("ERROR: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_repo() -> SheetRepository {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path()).unwrap();
        SheetRepository::new(Arc::new(db))
    }

    #[test]
    fn literal_round_trips() {
        let repo = temp_repo();
        let outcome = repo.set_cell("s1", "a1", "10", false).unwrap();
        assert_eq!(outcome.cell.result, "10");
        assert_eq!(outcome.outcome, WriteOutcome::Applied);
    }

    #[test]
    fn formula_reads_another_cell() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "10", false).unwrap();
        let outcome = repo.set_cell("s1", "a2", "=A1*2", false).unwrap();
        assert_eq!(outcome.cell.result, "20");
    }

    #[test]
    fn changing_a_dependency_recomputes_dependants() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "10", false).unwrap();
        repo.set_cell("s1", "a2", "=A1*2", false).unwrap();
        repo.set_cell("s1", "a1", "7", false).unwrap();
        let cell = repo.get_cell("s1", "a2").unwrap();
        assert_eq!(cell.result, "14");
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "=A2", false).unwrap();
        let err = repo.set_cell("s1", "a2", "=A1", false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("circular reference detected"), "got: {msg}");
    }

    #[test]
    fn numeric_cell_id_requires_numeric_value() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "hello", false).unwrap();
        let err = repo.set_cell("s1", "1", "=A1", false).unwrap_err();
        assert!(matches!(err, Error::CellIdNumericViolation));
    }

    #[test]
    fn blacklisted_cell_id_is_rejected() {
        let repo = temp_repo();
        let err = repo.set_cell("s1", "a+1", "10", false).unwrap_err();
        assert!(matches!(err, Error::CellIdBlacklisted(_)));
    }

    #[test]
    fn sheet_and_cell_ids_are_case_insensitive() {
        let repo = temp_repo();
        repo.set_cell("S1", "A1", "1", false).unwrap();
        let cell = repo.get_cell("s1", "a1").unwrap();
        assert_eq!(cell.result, "1");
    }

    #[test]
    fn numeric_literal_rebinds_to_existing_cell_name() {
        let repo = temp_repo();
        repo.set_cell("s1", "1", "40", false).unwrap();
        let outcome = repo.set_cell("s1", "a2", "=1+2", false).unwrap();
        assert_eq!(outcome.cell.result, "42");
    }

    #[test]
    fn unknown_sheet_is_reported() {
        let repo = temp_repo();
        let err = repo.get_cell("nope", "a1").unwrap_err();
        assert!(matches!(err, Error::SheetNotFound(_)));
    }

    #[test]
    fn unknown_cell_in_known_sheet_is_reported() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "1", false).unwrap();
        let err = repo.get_cell("s1", "a2").unwrap_err();
        assert!(matches!(err, Error::CellNotFound(_)));
    }

    #[test]
    fn get_cell_list_returns_every_cell() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "1", false).unwrap();
        repo.set_cell("s1", "a2", "=A1+1", false).unwrap();
        let mut cells = repo.get_cell_list("s1").unwrap();
        cells.sort_by(|a, b| a.canonical_key.cmp(&b.canonical_key));
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[1].result, "2");
    }

    #[test]
    fn skip_if_unchanged_leaves_store_untouched_but_refreshes_result() {
        let repo = temp_repo();
        repo.set_cell("s1", "a1", "5", false).unwrap();
        repo.set_cell("s1", "a2", "=A1", false).unwrap();
        let outcome = repo.set_cell("s1", "a2", "=A1", true).unwrap();
        assert_eq!(outcome.outcome, WriteOutcome::Unchanged);
        assert_eq!(outcome.cell.result, "5");
    }
}
