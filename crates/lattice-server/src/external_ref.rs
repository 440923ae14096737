//! External-reference subscriber: when a committed cell's formula calls
//! `external_ref("<url>")`, asks that URL's `/subscribe` sibling endpoint to
//! notify this service whenever the remote cell changes, so the local cell
//! can be recomputed.
//!
//! Grounded on `original_source/ExternalRefFunction.go`'s 4-second client
//! timeout; the subscribe request/response shape itself is not present in
//! original_source (its router never wires a `/subscribe` handler) and is
//! realized here exactly as spec.md §4.7/§9 pins it: `POST
//! <referenced-url>/../subscribe` with `{"webhook_url": "<callback>"}`.

use std::time::Duration;

use serde::Serialize;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(4);

/// POSTs a subscribe request to each URL in `external_urls`' `/subscribe`
/// sibling endpoint, asking it to call `callback_url` (this service's own
/// `externalRefWebhook` endpoint for the referencing cell) on change.
/// Fire-and-forget: failures are logged and otherwise ignored, never
/// propagated to the write that triggered them.
pub async fn subscribe_to_external_refs(client: reqwest::Client, external_urls: Vec<String>, callback_url: String) {
    for url in external_urls {
        let Some(subscribe_url) = sibling_subscribe_url(&url) else {
            tracing::warn!(url, "external_ref url has no path segment to rewrite into /subscribe");
            continue;
        };
        let body = SubscribeRequest { webhook_url: callback_url.clone() };
        let client = client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&subscribe_url)
                .timeout(SUBSCRIBE_TIMEOUT)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        url = %subscribe_url,
                        status = %response.status(),
                        "external-ref subscribe request rejected"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(url = %subscribe_url, %error, "external-ref subscribe request failed");
                }
            }
        });
    }
}

#[derive(Serialize)]
struct SubscribeRequest {
    webhook_url: String,
}

/// Rewrites `<scheme>://<host>/api/v1/<sheet>/<cell>` into its `/subscribe`
/// sibling: same origin, `/subscribe` appended to the referenced cell's own
/// path.
fn sibling_subscribe_url(referenced_cell_url: &str) -> Option<String> {
    let trimmed = referenced_cell_url.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("{trimmed}/subscribe"))
}

/// Builds the callback URL this service hands a remote service so it knows
/// where to POST when the cell it owns changes.
pub fn callback_url(own_base_url: &str, sheet_id: &str, cell_id: &str) -> String {
    let base = own_base_url.trim_end_matches('/');
    format!("{base}/api/v1/{sheet_id}/{cell_id}/externalRefWebhook")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn rewrites_path_to_subscribe_sibling() {
        assert_eq!(
            sibling_subscribe_url("http://peer/api/v1/s1/a1"),
            Some("http://peer/api/v1/s1/a1/subscribe".to_string())
        );
    }

    #[test]
    fn builds_externalrefwebhook_callback_url() {
        assert_eq!(
            callback_url("http://me:8080", "S1", "A2"),
            "http://me:8080/api/v1/S1/A2/externalRefWebhook"
        );
    }

    #[tokio::test]
    async fn posts_subscribe_request_with_callback_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/s1/a1/subscribe"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/s1/a1", server.uri());
        subscribe_to_external_refs(client, vec![url], "http://me/cb".to_string()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn failed_subscribe_request_is_swallowed() {
        let client = reqwest::Client::new();
        subscribe_to_external_refs(client, vec!["http://127.0.0.1:0/nope".to_string()], "http://me/cb".to_string())
            .await;
    }
}
