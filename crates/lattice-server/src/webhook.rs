//! Webhook subscription registry plus a bounded worker pool that delivers
//! change notifications, mirroring `original_source/WebhookDispatcher.go`'s
//! goroutine-and-channel shape translated to `tokio::spawn` + `mpsc`.
//!
//! `notify` never blocks the caller: it spawns a task that looks up
//! subscriptions and feeds the bounded channel, so backpressure from a full
//! channel lands on that spawned task rather than on the request handler
//! that triggered the notification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use lattice_core::Cell;

const QUEUE_CAPACITY: usize = 20;
const WORKER_COUNT: usize = 5;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// `sheet -> cell -> url` registry, one URL per cell.
type Registry = HashMap<String, HashMap<String, String>>;

struct WebhookSendCommand {
    url: String,
    cell: Cell,
}

/// Subscription registry plus the worker pool that drains the delivery
/// queue. Cloned cheaply (`Arc` internals); every clone shares the same
/// registry and queue.
#[derive(Clone)]
pub struct WebhookDispatcher {
    registry: Arc<RwLock<Registry>>,
    sender: Arc<Mutex<Option<mpsc::Sender<WebhookSendCommand>>>>,
}

impl WebhookDispatcher {
    /// Builds the registry, spawns [`WORKER_COUNT`] worker tasks, and
    /// returns a dispatcher handle ready to accept subscriptions.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("building the webhook http client");

        for worker_id in 0..WORKER_COUNT {
            let rx = rx.clone();
            let client = client.clone();
            tokio::spawn(async move { run_worker(worker_id, rx, client).await });
        }

        WebhookDispatcher { registry: Arc::new(RwLock::new(Registry::new())), sender: Arc::new(Mutex::new(Some(tx))) }
    }

    /// Sets the webhook URL for `(sheet, cell)`; an empty `url` removes the
    /// subscription.
    pub async fn set_webhook_url(&self, canonical_sheet_id: &str, canonical_cell_id: &str, url: &str) {
        let mut registry = self.registry.write().await;
        let sheet_webhooks = registry.entry(canonical_sheet_id.to_string()).or_default();
        if url.is_empty() {
            sheet_webhooks.remove(canonical_cell_id);
        } else {
            sheet_webhooks.insert(canonical_cell_id.to_string(), url.to_string());
        }
    }

    /// The subscribed URL for `(sheet, cell)`, or `""` if none.
    pub async fn get_webhook_url(&self, canonical_sheet_id: &str, canonical_cell_id: &str) -> String {
        self.registry
            .read()
            .await
            .get(canonical_sheet_id)
            .and_then(|sheet| sheet.get(canonical_cell_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Fire-and-forget notification of every cell in `cells` that has a
    /// subscription in `sheet`. Returns immediately; the lookup and the
    /// (potentially blocking, since the queue is bounded) enqueue happen on
    /// a spawned task.
    pub fn notify(&self, canonical_sheet_id: &str, cells: Vec<Cell>) {
        let registry = self.registry.clone();
        let sender = self.sender.clone();
        let sheet_id = canonical_sheet_id.to_string();
        tokio::spawn(async move {
            let tx = {
                let guard = sender.lock().await;
                match guard.as_ref() {
                    Some(tx) => tx.clone(),
                    None => return,
                }
            };
            let subscribed = {
                let registry = registry.read().await;
                registry.get(&sheet_id).cloned()
            };
            let Some(subscribed) = subscribed else { return };
            for cell in cells {
                if let Some(url) = subscribed.get(&cell.canonical_key) {
                    if tx.send(WebhookSendCommand { url: url.clone(), cell }).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Stops accepting new items; workers finish draining whatever is
    /// already queued, then exit.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WebhookSendCommand>>>,
    client: reqwest::Client,
) {
    loop {
        let command = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(command) = command else { break };

        let payload = WebhookCellPayload::from(&command.cell);
        match client.post(&command.url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    worker_id,
                    url = %command.url,
                    status = %response.status(),
                    "webhook delivery rejected"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(worker_id, url = %command.url, %error, "webhook delivery failed");
            }
        }
    }
}

/// Wire shape posted to a subscriber: the same `{value, result}` shape the
/// HTTP API returns for a cell.
#[derive(serde::Serialize)]
struct WebhookCellPayload {
    value: String,
    result: String,
}

impl From<&Cell> for WebhookCellPayload {
    fn from(cell: &Cell) -> Self {
        WebhookCellPayload { value: cell.value.clone(), result: cell.result.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cell(canonical_key: &str, value: &str, result: &str) -> Cell {
        Cell {
            original_key: canonical_key.to_string(),
            canonical_key: canonical_key.to_string(),
            value: value.to_string(),
            result: result.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_to_subscribed_cell() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new();
        dispatcher.set_webhook_url("S1", "A2", &format!("{}/cb", server.uri())).await;
        dispatcher.notify("S1", vec![cell("A2", "=A1+3", "9")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn unsubscribed_cell_receives_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

        let dispatcher = WebhookDispatcher::new();
        dispatcher.notify("S1", vec![cell("A2", "1", "1")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn empty_url_removes_subscription() {
        let dispatcher = WebhookDispatcher::new();
        dispatcher.set_webhook_url("S1", "A1", "http://example.test/cb").await;
        assert_eq!(dispatcher.get_webhook_url("S1", "A1").await, "http://example.test/cb");
        dispatcher.set_webhook_url("S1", "A1", "").await;
        assert_eq!(dispatcher.get_webhook_url("S1", "A1").await, "");
    }

    #[tokio::test]
    async fn absent_subscription_returns_empty_string() {
        let dispatcher = WebhookDispatcher::new();
        assert_eq!(dispatcher.get_webhook_url("S1", "A1").await, "");
    }
}
