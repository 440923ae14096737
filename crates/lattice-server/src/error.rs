//! Error types for the Lattice HTTP server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

/// Server error type: wraps the core repository error and adds the
/// HTTP-only failure modes (bad path params, bad request bodies).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Core repository/engine error.
    #[error("{0}")]
    Core(#[from] lattice_core::Error),

    /// The request body was not valid JSON for the expected shape.
    #[error("invalid request body: {0}")]
    BadRequest(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ServerError::Core(lattice_core::Error::SheetNotFound(_))
            | ServerError::Core(lattice_core::Error::CellNotFound(_)) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::Core(lattice_core::Error::CellIdBlacklisted(_))
            | ServerError::Core(lattice_core::Error::CellIdNumericViolation)
            | ServerError::Core(lattice_core::Error::Compile { .. })
            | ServerError::Core(lattice_core::Error::Eval { .. })
            | ServerError::Core(lattice_core::Error::CircularReference(_))
            | ServerError::Core(lattice_core::Error::Batch { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            ServerError::Core(lattice_core::Error::Serializer(_))
            | ServerError::Core(lattice_core::Error::Storage(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
