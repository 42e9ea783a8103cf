//! Inbound interaction endpoint.
//!
//! Each request is verified, routed, and answered synchronously: pings get a
//! pong, autocomplete gets the configured choices, everything else is
//! published to the owning agent and acknowledged as deferred.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broker::{EnvelopePublisher, PublishError};
use crate::interaction::{Interaction, InteractionResponse};
use crate::protocol::Envelope;
use crate::routing::{Dispatcher, Route};
use crate::signature::{Verifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};

pub const INTERACTIONS_PATH: &str = "/interactions";
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Whether requests must carry a valid signature.
#[derive(Debug, Clone)]
pub enum Verification {
    Required(Verifier),
    /// Development only: accept unsigned requests.
    Disabled,
}

#[derive(Clone)]
pub struct InteractionState {
    inner: Arc<StateInner>,
}

struct StateInner {
    verification: Verification,
    dispatcher: Dispatcher,
    publisher: Arc<dyn EnvelopePublisher>,
    interaction_timeout: Duration,
}

impl InteractionState {
    pub fn new(
        verification: Verification,
        dispatcher: Dispatcher,
        publisher: Arc<dyn EnvelopePublisher>,
        interaction_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                verification,
                dispatcher,
                publisher,
                interaction_timeout,
            }),
        }
    }

    pub fn dry_run(&self) -> bool {
        matches!(self.inner.verification, Verification::Disabled)
    }
}

pub fn interaction_router(state: InteractionState) -> Router {
    Router::new()
        .route(INTERACTIONS_PATH, routing::post(handle_interaction))
        .route("/health", routing::get(health))
        .with_state(state)
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
                "retryable": status.is_server_error(),
                "statusCode": status.as_u16(),
            }
        })),
    )
        .into_response()
}

async fn health(State(state): State<InteractionState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "discord-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "dry_run": state.dry_run(),
    }))
}

async fn handle_interaction(
    State(state): State<InteractionState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Verification::Required(verifier) = &state.inner.verification {
        let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
        if let Err(error) = verifier.verify(header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER), &body)
        {
            tracing::warn!(target = "discord_relay::server", error = %error, "rejected interaction signature");
            return api_error(
                StatusCode::UNAUTHORIZED,
                "invalid_signature",
                "invalid request signature",
            );
        }
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(interaction) => interaction,
        Err(error) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                format!("invalid interaction payload: {error}"),
            );
        }
    };

    let Some(interaction_type) = interaction.interaction_type() else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "unsupported_type",
            format!("unsupported interaction type {}", interaction.kind),
        );
    };
    let Some(kind) = interaction_type.handler_kind() else {
        return Json(InteractionResponse::pong()).into_response();
    };
    let Some(key) = interaction.route_key(kind) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "missing_key",
            format!("{kind} interaction has no route key"),
        );
    };

    let binding = match state.inner.dispatcher.lookup(kind, key) {
        Ok(binding) => binding,
        Err(error) => {
            tracing::info!(target = "discord_relay::server", kind = %kind, key = %key, "no handler for interaction");
            return api_error(StatusCode::NOT_FOUND, "unknown_route", error.to_string());
        }
    };

    let agent = match &binding.route {
        Route::Choices(choices) => {
            return Json(InteractionResponse::autocomplete(choices)).into_response();
        }
        Route::Agent(agent) => agent,
    };

    let envelope = match Envelope::new(
        agent,
        binding.kind,
        &binding.key,
        &body,
        state.inner.interaction_timeout,
    ) {
        Ok(envelope) => envelope,
        Err(error) => {
            return api_error(StatusCode::BAD_REQUEST, "invalid_payload", error.to_string());
        }
    };

    if let Err(error) = state.inner.publisher.publish(&envelope).await {
        tracing::error!(
            target = "discord_relay::server",
            agent = %agent,
            kind = %kind,
            key = %binding.key,
            channel = error.channel().unwrap_or_default(),
            error = %error,
            "failed to publish interaction"
        );
        let status = match error {
            PublishError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        return api_error(status, "publish_failed", error.to_string());
    }

    tracing::info!(
        target = "discord_relay::server",
        agent = %agent,
        kind = %kind,
        key = %binding.key,
        interaction_id = %interaction.id,
        "relayed interaction"
    );
    Json(InteractionResponse::deferred()).into_response()
}

/// Serve until `shutdown` fires, then drain in-flight requests for at most
/// `grace` before dropping them.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let signal = shutdown.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { signal.cancelled().await });
    let mut task = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut task => {
            return joined.context("interaction server task panicked")?.context("interaction server failed");
        }
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => joined
            .context("interaction server task panicked")?
            .context("interaction server failed"),
        Err(_) => {
            tracing::warn!(
                target = "discord_relay::server",
                grace_ms = grace.as_millis() as u64,
                "graceful shutdown timed out; dropping open connections"
            );
            task.abort();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use ed25519_dalek::SigningKey;
    use tower::ServiceExt;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Settings;
    use crate::signature::tests::{sign, test_signing_key};

    const CONFIG: &str = r#"
interactions:
  timeout: 60s
  handlers:
    commands:
      help: { agent: claude }
    components:
      approve: { agent: codex }
    autocomplete:
      model:
        choices:
          - { name: Fast, value: fast }
          - { name: Careful, value: careful }
"#;

    struct FailingPublisher;

    #[async_trait]
    impl EnvelopePublisher for FailingPublisher {
        async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
            Err(PublishError::Broker {
                channel: envelope.channel("p"),
                reason: "connection refused".into(),
            })
        }
    }

    fn state_with(publisher: Arc<dyn EnvelopePublisher>, verification: Verification) -> InteractionState {
        let settings = Settings::from_yaml(CONFIG).unwrap();
        let dispatcher = Dispatcher::from_settings(&settings.interactions).unwrap();
        InteractionState::new(
            verification,
            dispatcher,
            publisher,
            settings.interaction_timeout().unwrap(),
        )
    }

    fn signed_state(broker: &MemoryBroker) -> InteractionState {
        let key = test_signing_key();
        state_with(
            Arc::new(broker.clone()),
            Verification::Required(Verifier::from_key(key.verifying_key())),
        )
    }

    fn signed_request(key: &SigningKey, body: &str) -> Request<Body> {
        let timestamp = "1700000000";
        Request::builder()
            .uri(INTERACTIONS_PATH)
            .method("POST")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign(key, timestamp, body.as_bytes()))
            .header(TIMESTAMP_HEADER, timestamp)
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    async fn response_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        serde_json::from_slice(&body).expect("body should be json")
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_without_publishing() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let body = r#"{"type":2,"token":"t","data":{"name":"help"}}"#;

        let response = router.oneshot(signed_request(&other, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn missing_signature_headers_are_rejected() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let response = router
            .oneshot(
                Request::builder()
                    .uri(INTERACTIONS_PATH)
                    .method("POST")
                    .body(Body::from(r#"{"type":1}"#))
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response_json(response).await;
        assert_eq!(body["error"]["code"], "invalid_signature");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let response = router
            .oneshot(signed_request(&test_signing_key(), r#"{"type":1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"type": 1}));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn routed_command_publishes_one_envelope_and_defers() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let body = r#"{"type":2,"id":"i1","token":"t","data":{"name":"Help"}}"#;

        let response = router
            .oneshot(signed_request(&test_signing_key(), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"type": 5}));

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].channel, "p:agent:claude");
        let envelope = Envelope::from_slice(&published[0].payload).unwrap();
        assert_eq!(envelope.agent(), "claude");
        assert_eq!(envelope.key(), "help");
        assert_eq!(envelope.kind().as_str(), "command");
        assert_eq!(envelope.timeout_seconds(), 60);
        assert_eq!(envelope.interaction_bytes(), body.as_bytes());
    }

    #[tokio::test]
    async fn component_custom_id_prefix_routes_to_agent() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let body = r#"{"type":3,"token":"t","data":{"custom_id":"approve:42"}}"#;
        let response = router
            .oneshot(signed_request(&test_signing_key(), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(broker.published()[0].channel, "p:agent:codex");
    }

    #[tokio::test]
    async fn autocomplete_returns_choices_without_publishing() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let body = r#"{"type":4,"token":"t","data":{"name":"model"}}"#;
        let response = router
            .oneshot(signed_request(&test_signing_key(), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({
                "type": 8,
                "data": {"choices": [
                    {"name": "Fast", "value": "fast"},
                    {"name": "Careful", "value": "careful"}
                ]}
            })
        );
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_not_published() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(signed_state(&broker));
        let body = r#"{"type":2,"token":"t","data":{"name":"deploy"}}"#;
        let response = router
            .oneshot(signed_request(&test_signing_key(), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_and_unknown_type_are_bad_requests() {
        let broker = MemoryBroker::new("p");
        let state = signed_state(&broker);
        for body in ["{not json", r#"{"type":42}"#, r#"{"type":2,"data":{}}"#] {
            let response = interaction_router(state.clone())
                .oneshot(signed_request(&test_signing_key(), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
        }
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_surfaces_to_caller() {
        let router = interaction_router(state_with(
            Arc::new(FailingPublisher),
            Verification::Disabled,
        ));
        let response = router
            .oneshot(
                Request::builder()
                    .uri(INTERACTIONS_PATH)
                    .method("POST")
                    .body(Body::from(r#"{"type":2,"token":"t","data":{"name":"help"}}"#))
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("p:agent:claude"));
    }

    #[tokio::test]
    async fn dry_run_skips_verification() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(state_with(Arc::new(broker.clone()), Verification::Disabled));
        let response = router
            .oneshot(
                Request::builder()
                    .uri(INTERACTIONS_PATH)
                    .method("POST")
                    .body(Body::from(r#"{"type":2,"token":"t","data":{"name":"help"}}"#))
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn health_reports_mode_and_unknown_paths_404() {
        let broker = MemoryBroker::new("p");
        let router = interaction_router(state_with(Arc::new(broker), Verification::Disabled));
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["dry_run"], true);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = interaction_router(state_with(
            Arc::new(MemoryBroker::new("p")),
            Verification::Disabled,
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            router,
            shutdown.clone(),
            Duration::from_millis(200),
        ));
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
