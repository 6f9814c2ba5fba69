//! HTTP delivery of Slack events (the Events API).
//!
//! Slack delivers events at least once and re-sends anything it considers
//! unacknowledged, tagging the retry with `x-slack-retry-num`. Retries are
//! acknowledged before anything else happens so a slow turn never runs twice.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use slack_morphism::{prelude::*, signature_verifier::SlackEventSignatureVerifier};
use tracing::{info, instrument, warn};

use crate::{
    base::types::{Res, Void},
    interaction::mention::TurnServices,
};

use super::slack::dispatch_app_mention;

pub const EVENTS_PATH: &str = "/slack/events";
pub const RETRY_NUM_HEADER: &str = "x-slack-retry-num";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Shared state for the events endpoint.
#[derive(Clone)]
pub struct EventsState {
    pub services: TurnServices,
    pub signing_secret: String,
}

/// Build the events router.
pub fn router(state: Arc<EventsState>) -> Router {
    Router::new().route(EVENTS_PATH, post(handle_events)).with_state(state)
}

/// Serve the events endpoint until Ctrl-C.
pub async fn serve(addr: &str, services: TurnServices) -> Void {
    let state = Arc::new(EventsState {
        signing_secret: services.config.slack_signing_secret.clone(),
        services,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Events endpoint listening on http://{}{}", listener.local_addr()?, EVENTS_PATH);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

/// Whether this request is Slack re-sending an event it already delivered.
pub fn is_retry_delivery(headers: &HeaderMap) -> bool {
    headers.contains_key(RETRY_NUM_HEADER)
}

/// Check the request signature against the signing secret.
fn verify_signature(signing_secret: &str, headers: &HeaderMap, body: &str) -> Res<()> {
    let header = |name: &str| -> Res<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Missing `{name}` header."))
    };

    let signature = header(SIGNATURE_HEADER)?;
    let timestamp = header(TIMESTAMP_HEADER)?;

    let secret: SlackSigningSecret = signing_secret.to_string().into();
    let verifier = SlackEventSignatureVerifier::new(&secret);

    verifier.verify(&signature, body, &timestamp).map_err(|e| anyhow::anyhow!("Invalid signature: {}", e))
}

/// Handles `POST /slack/events`.
#[instrument(skip_all)]
pub async fn handle_events(State(state): State<Arc<EventsState>>, headers: HeaderMap, body: String) -> Response {
    if is_retry_delivery(&headers) {
        info!("Acknowledging retried delivery without processing.");
        return StatusCode::OK.into_response();
    }

    if let Err(err) = verify_signature(&state.signing_secret, &headers, &body) {
        warn!("Rejecting event: {}", err);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let event: SlackPushEvent = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!("Failed to parse event: {}", err);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match event {
        SlackPushEvent::UrlVerification(verification) => verification.challenge.into_response(),
        SlackPushEvent::EventCallback(callback) => {
            match callback.event {
                SlackEventCallbackBody::AppMention(slack_app_mention_event) => {
                    info!("Received app mention event ...");
                    dispatch_app_mention(&slack_app_mention_event, &state.services);
                }
                _ => warn!("Received unhandled push event."),
            }

            StatusCode::OK.into_response()
        }
        _ => StatusCode::OK.into_response(),
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_is_retry_delivery() {
        let mut headers = HeaderMap::new();
        assert!(!is_retry_delivery(&headers));

        headers.insert(RETRY_NUM_HEADER, HeaderValue::from_static("1"));
        assert!(is_retry_delivery(&headers));
    }

    #[test]
    fn test_verify_signature_requires_headers() {
        let headers = HeaderMap::new();

        assert!(verify_signature("secret", &headers, "{}").is_err());
    }

    #[test]
    fn test_verify_signature_rejects_bad_hash() {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("v0=deadbeef"));
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static("1700000000"));

        assert!(verify_signature("secret", &headers, "{}").is_err());
    }
}
