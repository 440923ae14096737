//! Wire DTOs for the HTTP API, kept separate from `lattice_core::Cell` the
//! way the teacher splits its domain types from `protocol`'s client/server
//! message types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use lattice_core::Cell;

/// `{"value": ..., "result": ...}`, returned by every cell-facing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellResponse {
    pub value: String,
    pub result: String,
}

impl From<Cell> for CellResponse {
    fn from(cell: Cell) -> Self {
        CellResponse { value: cell.value, result: cell.result }
    }
}

/// `GET /{sheet}` response body: original (non-canonical) key to cell.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SheetResponse(pub HashMap<String, CellResponse>);

impl FromIterator<Cell> for SheetResponse {
    fn from_iter<I: IntoIterator<Item = Cell>>(iter: I) -> Self {
        SheetResponse(
            iter.into_iter()
                .map(|cell| (cell.original_key.clone(), CellResponse::from(cell)))
                .collect(),
        )
    }
}

/// `POST /{sheet}/{cell}` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SetCellRequest {
    pub value: String,
}

/// `POST /{sheet}/{cell}/subscribe` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub webhook_url: String,
}

/// `POST /{sheet}/{cell}/subscribe` response body.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub webhook_url: String,
}
