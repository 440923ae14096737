//! HTTP routes for the Lattice API: one shared, `Arc`-wrapped `AppState`,
//! one `axum::Router` built once at startup.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lattice_core::{Cell, Error as CoreError, SheetRepository, WriteOutcome};

use crate::error::ServerError;
use crate::external_ref;
use crate::protocol::{CellResponse, SetCellRequest, SheetResponse, SubscribeRequest, WebhookResponse};
use crate::webhook::WebhookDispatcher;

/// State shared across every handler: the sheet repository, the webhook
/// dispatcher, a reusable HTTP client for external-ref subscribe calls, and
/// this service's own externally-reachable base URL (used to build the
/// `externalRefWebhook` callback URL handed to peer services).
pub struct AppState {
    pub repository: SheetRepository,
    pub webhooks: WebhookDispatcher,
    pub http_client: reqwest::Client,
    pub base_url: String,
}

/// Builds the full `axum::Router`, wired with request tracing and a
/// permissive CORS layer (the teacher's `routes.rs` precedent; the original
/// Go service has no CORS middleware, but a browser-facing API without one
/// would be unusable from a companion frontend).
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck_handler))
        .route("/api/v1/{sheet_id}/{cell_id}", post(set_cell_handler).get(get_cell_handler))
        .route("/api/v1/{sheet_id}", get(get_sheet_handler))
        .route("/api/v1/{sheet_id}/{cell_id}/subscribe", post(subscribe_handler))
        .route("/api/v1/{sheet_id}/{cell_id}/externalRefWebhook", post(external_ref_webhook_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthcheck_handler() -> &'static str {
    "health"
}

/// Runs a repository call on the blocking-task pool: `redb` transactions do
/// synchronous disk I/O and `EXTERNAL_REF` dispatches a synchronous `reqwest`
/// call, either of which would otherwise stall the worker thread driving
/// every other in-flight request (the teacher's `routes.rs` spawns
/// `execute_cell` the same way, since it does blocking IPC).
async fn blocking<T, F>(f: F) -> Result<T, CoreError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!(%join_error, "blocking repository task panicked");
            Err(CoreError::Storage(join_error.to_string()))
        }
    }
}

async fn set_cell_handler(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_id)): Path<(String, String)>,
    Json(request): Json<SetCellRequest>,
) -> Response {
    let blocking_state = state.clone();
    let sheet_id_for_write = sheet_id.clone();
    let value = request.value.clone();
    let result =
        blocking(move || blocking_state.repository.set_cell(&sheet_id_for_write, &cell_id, &value, true)).await;
    match result {
        Ok(outcome) => {
            if outcome.outcome == WriteOutcome::Applied {
                dispatch_side_effects(&state, &sheet_id, &outcome.cell, outcome.recomputed_dependants, outcome.external_refs);
            }
            (StatusCode::CREATED, Json(CellResponse::from(outcome.cell))).into_response()
        }
        Err(error) => set_cell_error_response(&request.value, error),
    }
}

async fn get_cell_handler(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_id)): Path<(String, String)>,
) -> Response {
    let blocking_state = state.clone();
    let result = blocking(move || blocking_state.repository.get_cell(&sheet_id, &cell_id)).await;
    match result {
        Ok(cell) => (StatusCode::OK, Json(CellResponse::from(cell))).into_response(),
        Err(error) => ServerError::from(error).into_response(),
    }
}

async fn get_sheet_handler(State(state): State<Arc<AppState>>, Path(sheet_id): Path<String>) -> Response {
    let blocking_state = state.clone();
    let result = blocking(move || blocking_state.repository.get_cell_list(&sheet_id)).await;
    match result {
        Ok(cells) => (StatusCode::OK, Json(SheetResponse::from_iter(cells))).into_response(),
        Err(error) => ServerError::from(error).into_response(),
    }
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_id)): Path<(String, String)>,
    Json(request): Json<SubscribeRequest>,
) -> Response {
    let blocking_state = state.clone();
    let sheet_id_for_lookup = sheet_id.clone();
    let cell_id_for_lookup = cell_id.clone();
    let result =
        blocking(move || blocking_state.repository.get_cell(&sheet_id_for_lookup, &cell_id_for_lookup)).await;
    match result {
        Ok(cell) => {
            let canonical_sheet_id = state.repository.canonical_sheet_id(&sheet_id);
            state.webhooks.set_webhook_url(&canonical_sheet_id, &cell.canonical_key, &request.webhook_url).await;
            (StatusCode::CREATED, Json(WebhookResponse { webhook_url: request.webhook_url })).into_response()
        }
        Err(error) => ServerError::from(error).into_response(),
    }
}

/// Re-evaluates the cell using its own stored value without accepting a new
/// one, per §4.7: a remote cell changed, so this cell (and anything that
/// depends on it) must recompute and re-notify its own subscribers.
async fn external_ref_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_id)): Path<(String, String)>,
) -> Response {
    let blocking_state = state.clone();
    let sheet_id_for_lookup = sheet_id.clone();
    let cell_id_for_lookup = cell_id.clone();
    let stored_value = match blocking(move || blocking_state.repository.get_cell(&sheet_id_for_lookup, &cell_id_for_lookup)).await
    {
        Ok(cell) => cell.value,
        Err(error) => return ServerError::from(error).into_response(),
    };

    let blocking_state = state.clone();
    let sheet_id_for_write = sheet_id.clone();
    let cell_id_for_write = cell_id.clone();
    let result = blocking(move || {
        blocking_state.repository.set_cell(&sheet_id_for_write, &cell_id_for_write, &stored_value, false)
    })
    .await;
    match result {
        Ok(outcome) => {
            dispatch_side_effects(&state, &sheet_id, &outcome.cell, outcome.recomputed_dependants, outcome.external_refs);
            (StatusCode::OK, Json(CellResponse::from(outcome.cell))).into_response()
        }
        Err(error) => ServerError::from(error).into_response(),
    }
}

/// Fans a committed write out to the webhook dispatcher and, if the new
/// value introduced fresh `external_ref(...)` calls, the external-ref
/// subscriber. Both are fire-and-forget: this never blocks the response.
fn dispatch_side_effects(
    state: &AppState,
    sheet_id: &str,
    cell: &Cell,
    recomputed_dependants: Vec<Cell>,
    external_refs: Vec<String>,
) {
    let canonical_sheet_id = state.repository.canonical_sheet_id(sheet_id);
    let mut changed = Vec::with_capacity(1 + recomputed_dependants.len());
    changed.push(cell.clone());
    changed.extend(recomputed_dependants);
    state.webhooks.notify(&canonical_sheet_id, changed);

    if !external_refs.is_empty() {
        let client = state.http_client.clone();
        let callback = external_ref::callback_url(&state.base_url, sheet_id, &cell.original_key);
        tokio::spawn(async move {
            external_ref::subscribe_to_external_refs(client, external_refs, callback).await;
        });
    }
}

/// `true` for the error kinds spec.md §6 says must echo `{value, result}`
/// on the `set_cell` endpoint rather than the generic `{"error": ...}` body
/// every other endpoint uses.
fn is_evaluation_or_blacklist_error(error: &CoreError) -> bool {
    matches!(
        error,
        CoreError::CellIdBlacklisted(_)
            | CoreError::CellIdNumericViolation
            | CoreError::Compile { .. }
            | CoreError::Eval { .. }
            | CoreError::CircularReference(_)
            | CoreError::Batch { .. }
    )
}

/// `set_cell`'s error response body echoes the submitted `value` with the
/// error folded into `result`, per spec.md §6/§7, rather than the generic
/// `{"error": ...}` shape [`ServerError`] produces for every other endpoint.
fn set_cell_error_response(submitted_value: &str, error: CoreError) -> Response {
    if is_evaluation_or_blacklist_error(&error) {
        let result = format!("ERROR: {error}");
        (StatusCode::UNPROCESSABLE_ENTITY, Json(CellResponse { value: submitted_value.to_string(), result }))
            .into_response()
    } else {
        ServerError::from(error).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use redb::Database;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path()).unwrap();
        Arc::new(AppState {
            repository: SheetRepository::new(Arc::new(db)),
            webhooks: WebhookDispatcher::new(),
            http_client: reqwest::Client::new(),
            base_url: "http://localhost:8080".to_string(),
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthcheck_returns_plain_text() {
        let app = create_router(test_state());
        let response =
            app.oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"health");
    }

    #[tokio::test]
    async fn set_then_get_cell_round_trips() {
        let app = create_router(test_state());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"value":"10"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["result"], "10");

        let response = app
            .oneshot(Request::builder().uri("/api/v1/s1/a1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "10");
    }

    #[tokio::test]
    async fn circular_reference_returns_422_with_error_result() {
        let app = create_router(test_state());
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"value":"=A2"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a2")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"value":"=A1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["result"].as_str().unwrap().starts_with("ERROR: "));
        assert!(body["result"].as_str().unwrap().contains("circular reference detected"));
    }

    #[tokio::test]
    async fn get_unknown_sheet_is_404() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/v1/nope/a1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_cell_is_404() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a1/subscribe")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"webhook_url":"http://x/cb"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subscribe_then_notify_on_dependency_change() {
        let app = create_router(test_state());
        for (method, uri, body) in [
            ("POST", "/api/v1/s1/a1", r#"{"value":"5"}"#),
            ("POST", "/api/v1/s1/a2", r#"{"value":"=A1+3"}"#),
        ] {
            app.clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a2/subscribe")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"webhook_url":"http://x/cb"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/s1/a1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"value":"6"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
