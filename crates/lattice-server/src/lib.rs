//! Lattice HTTP server: routes, webhook dispatch, and external-reference
//! subscription built on top of `lattice-core`'s repository.
//!
//! This crate owns HTTP framing and the two background delivery
//! pipelines (webhook dispatch, external-reference subscription);
//! `lattice-core` owns the formula engine and persisted state.

pub mod error;
pub mod external_ref;
pub mod protocol;
pub mod routes;
pub mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;

pub use error::{ServerError, ServerResult};
pub use routes::{create_router, AppState};
pub use webhook::WebhookDispatcher;

use lattice_core::SheetRepository;

/// Server configuration: where to listen and the base URL this instance is
/// reachable at (handed to peer services as the external-ref callback
/// origin).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { host: "0.0.0.0".to_string(), port: 8080, base_url: "http://localhost:8080".to_string() }
    }
}

/// Builds the shared state, router, and listener, then serves until a
/// `Ctrl+C` signal is received.
pub async fn serve(repository: SheetRepository, config: ServerConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        repository,
        webhooks: WebhookDispatcher::new(),
        http_client: reqwest::Client::new(),
        base_url: config.base_url.clone(),
    });

    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(%addr, "starting lattice server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    state.webhooks.close().await;
    tracing::info!("lattice server shutdown complete");
    Ok(())
}
