//! Lattice core: canonicalization, the cell wire format, the formula
//! engine, the persisted dependency graph, and the transactional sheet
//! repository that binds them to an embedded `redb` store.
//!
//! Everything outside this crate (HTTP routing, webhook delivery,
//! external-reference subscription, CLI/process plumbing) lives in
//! `lattice-server` and `lattice-cli`; this crate owns only the hard core
//! described in the project's component design.

pub mod canonical;
pub mod error;
pub mod expr;
pub mod graph;
pub mod model;
pub mod repository;
pub mod serializer;
pub mod store;

pub use error::{Error, Result};
pub use model::{Cell, EvalValue};
pub use repository::{CellOutcome, SheetRepository, WriteOutcome};
