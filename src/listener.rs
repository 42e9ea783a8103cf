//! Worker-side handling of envelopes pulled off the agent's channel.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::{EnvelopeSubscriber, PayloadHandler};
use crate::discord_api::{InteractionResponder, MessageParams};
use crate::interaction::Interaction;
use crate::protocol::Envelope;
use crate::registry::{AgentInfo, AgentRegistry, DEFAULT_HEARTBEAT_INTERVAL};
use crate::supervisor::{supervise, RestartPolicy};

/// Budget for both outbound calls of a single event.
pub const EVENT_DEADLINE: Duration = Duration::from_secs(10);

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    Processed,
    /// Not an envelope; logged and skipped.
    Malformed,
    /// Envelope for a different agent.
    OtherAgent(String),
    /// Shutdown arrived while responding.
    Cancelled,
}

pub struct AgentListener {
    agent: String,
    application_id: String,
    responder: Arc<dyn InteractionResponder>,
    deadline: Duration,
}

impl AgentListener {
    pub fn new(
        agent: &str,
        application_id: &str,
        responder: Arc<dyn InteractionResponder>,
    ) -> Result<Self> {
        let agent = agent.trim();
        if agent.is_empty() {
            anyhow::bail!("agent id is required");
        }
        let application_id = application_id.trim();
        if application_id.is_empty() {
            anyhow::bail!("application id is required");
        }
        Ok(Self {
            agent: agent.to_string(),
            application_id: application_id.to_string(),
            responder,
            deadline: EVENT_DEADLINE,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub async fn handle_payload(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<ListenOutcome> {
        let envelope = match Envelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(
                    target = "discord_relay::listener",
                    agent = %self.agent,
                    error = %error,
                    "ignoring malformed envelope"
                );
                return Ok(ListenOutcome::Malformed);
            }
        };

        if !envelope.is_for(&self.agent) {
            tracing::debug!(
                target = "discord_relay::listener",
                agent = %self.agent,
                addressed_to = %envelope.agent(),
                "skipping envelope for another agent"
            );
            return Ok(ListenOutcome::OtherAgent(envelope.agent().to_string()));
        }

        let interaction: Interaction = serde_json::from_str(envelope.interaction_json())
            .with_context(|| format!("decode interaction for {} `{}`", envelope.kind(), envelope.key()))?;
        let token = interaction.token.trim();
        if token.is_empty() {
            anyhow::bail!("interaction missing token");
        }

        let work = self.respond(&envelope, token);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(
                    target = "discord_relay::listener",
                    agent = %self.agent,
                    key = %envelope.key(),
                    "shutdown while responding; abandoning event"
                );
                return Ok(ListenOutcome::Cancelled);
            }
            outcome = tokio::time::timeout(self.deadline, work) => outcome,
        };

        match outcome {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "{} `{}` exceeded the {:?} response deadline",
                envelope.kind(),
                envelope.key(),
                self.deadline
            ),
        }

        tracing::info!(
            target = "discord_relay::listener",
            agent = %self.agent,
            kind = %envelope.kind(),
            key = %envelope.key(),
            interaction_id = %interaction.id,
            "processed interaction"
        );
        Ok(ListenOutcome::Processed)
    }

    async fn respond(&self, envelope: &Envelope, token: &str) -> Result<()> {
        let status = MessageParams::content(format!(
            "Agent {} received {} `{}` at {}",
            self.agent,
            envelope.kind(),
            envelope.key(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        self.responder
            .edit_original(&self.application_id, token, &status)
            .await
            .context("edit original response")?;

        let done = MessageParams::content(format!(
            "Follow-up: {} completed {} `{}`",
            self.agent, envelope.kind(), envelope.key()
        ));
        self.responder
            .create_followup(&self.application_id, token, &done)
            .await
            .context("create followup response")?;
        Ok(())
    }
}

#[async_trait]
impl PayloadHandler for AgentListener {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        self.handle_payload(cancel, payload).await.map(|_| ())
    }
}

/// Register `info`, keep it alive with a heartbeat and run the supervised
/// subscription until `shutdown` fires or the policy gives up. The entry is
/// removed on the way out. A failed registration aborts before subscribing.
pub async fn run_listener(
    listener: &AgentListener,
    subscriber: &dyn EnvelopeSubscriber,
    registry: &AgentRegistry,
    info: AgentInfo,
    policy: RestartPolicy,
    shutdown: &CancellationToken,
) -> Result<()> {
    let agent = info.agent.clone();
    registry
        .register(&info)
        .await
        .with_context(|| format!("register agent {agent}"))?;

    let heartbeat_cancel = shutdown.child_token();
    let heartbeat = tokio::spawn({
        let registry = registry.clone();
        let cancel = heartbeat_cancel.clone();
        async move {
            registry
                .heartbeat(info, DEFAULT_HEARTBEAT_INTERVAL, cancel)
                .await
        }
    });

    let result = supervise("agent-listen", policy, shutdown, || {
        subscriber.subscribe(shutdown, listener)
    })
    .await;

    heartbeat_cancel.cancel();
    let _ = heartbeat.await;
    if let Err(error) = registry.unregister(&agent).await {
        tracing::warn!(
            target = "discord_relay::listener",
            agent = %agent,
            error = %format!("{error:#}"),
            "failed to unregister agent"
        );
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::broker::{EnvelopePublisher, MemoryBroker, RegistryStore};
    use crate::discord_api::DiscordApiError;
    use crate::protocol::agent_channel;
    use crate::routing::HandlerKind;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Edit { app: String, token: String, content: String },
        Followup { app: String, token: String, content: String },
    }

    #[derive(Default)]
    pub(crate) struct RecordingResponder {
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) fail_edit: bool,
        pub(crate) delay: Option<Duration>,
    }

    #[async_trait]
    impl InteractionResponder for RecordingResponder {
        async fn edit_original(
            &self,
            application_id: &str,
            token: &str,
            params: &MessageParams,
        ) -> Result<(), DiscordApiError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_edit {
                return Err(DiscordApiError::Api {
                    status: 404,
                    body: "Unknown Webhook".into(),
                });
            }
            self.calls.lock().push(Call::Edit {
                app: application_id.into(),
                token: token.into(),
                content: params.content.clone().unwrap_or_default(),
            });
            Ok(())
        }

        async fn create_followup(
            &self,
            application_id: &str,
            token: &str,
            params: &MessageParams,
        ) -> Result<(), DiscordApiError> {
            self.calls.lock().push(Call::Followup {
                app: application_id.into(),
                token: token.into(),
                content: params.content.clone().unwrap_or_default(),
            });
            Ok(())
        }
    }

    fn payload(agent: &str, interaction: &str) -> Vec<u8> {
        Envelope::new(
            agent,
            HandlerKind::Command,
            "help",
            interaction.as_bytes(),
            Duration::from_secs(900),
        )
        .unwrap()
        .to_bytes()
        .unwrap()
    }

    fn listener(agent: &str, responder: Arc<RecordingResponder>) -> AgentListener {
        AgentListener::new(agent, "app-1", responder).unwrap()
    }

    #[tokio::test]
    async fn processes_own_envelope_with_edit_then_followup() {
        let responder = Arc::new(RecordingResponder::default());
        let listener = listener("Claude", responder.clone());

        let outcome = listener
            .handle_payload(
                &CancellationToken::new(),
                &payload("claude", r#"{"type":2,"token":"tok-1"}"#),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Processed);

        let calls = responder.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Edit { app, token, content } => {
                assert_eq!(app, "app-1");
                assert_eq!(token, "tok-1");
                assert!(content.starts_with("Agent Claude received command `help` at "));
            }
            other => panic!("expected edit first, got {other:?}"),
        }
        assert_eq!(
            calls[1],
            Call::Followup {
                app: "app-1".into(),
                token: "tok-1".into(),
                content: "Follow-up: Claude completed command `help`".into(),
            }
        );
    }

    #[tokio::test]
    async fn envelope_for_other_agent_is_ignored() {
        let responder = Arc::new(RecordingResponder::default());
        let listener = listener("codex", responder.clone());
        let outcome = listener
            .handle_payload(
                &CancellationToken::new(),
                &payload("claude", r#"{"type":2,"token":"tok"}"#),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::OtherAgent("claude".into()));
        assert!(responder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn non_ascii_agent_name_matches_case_insensitively() {
        let responder = Arc::new(RecordingResponder::default());
        let listener = listener("ÉLAN", responder.clone());
        let outcome = listener
            .handle_payload(
                &CancellationToken::new(),
                &payload("élan", r#"{"type":2,"token":"tok-e"}"#),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Processed);
        assert_eq!(responder.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_is_not_an_error() {
        let responder = Arc::new(RecordingResponder::default());
        let listener = listener("codex", responder.clone());
        let outcome = listener
            .handle_payload(&CancellationToken::new(), b"not json")
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Malformed);
        assert!(responder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_token_is_an_error() {
        let responder = Arc::new(RecordingResponder::default());
        let listener = listener("claude", responder.clone());
        let err = listener
            .handle_payload(&CancellationToken::new(), &payload("claude", r#"{"type":2}"#))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "interaction missing token");
    }

    #[tokio::test]
    async fn edit_failure_aborts_before_followup() {
        let responder = Arc::new(RecordingResponder {
            fail_edit: true,
            ..Default::default()
        });
        let listener = listener("claude", responder.clone());
        let err = listener
            .handle_payload(
                &CancellationToken::new(),
                &payload("claude", r#"{"type":2,"token":"tok"}"#),
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").starts_with("edit original response"));
        assert!(responder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn slow_platform_hits_deadline() {
        let responder = Arc::new(RecordingResponder {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let listener = listener("claude", responder).with_deadline(Duration::from_millis(50));
        let err = listener
            .handle_payload(
                &CancellationToken::new(),
                &payload("claude", r#"{"type":2,"token":"tok"}"#),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[tokio::test]
    async fn cancellation_abandons_event() {
        let responder = Arc::new(RecordingResponder {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let listener = listener("claude", responder);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = listener
            .handle_payload(&cancel, &payload("claude", r#"{"type":2,"token":"tok"}"#))
            .await
            .unwrap();
        assert_eq!(outcome, ListenOutcome::Cancelled);
    }

    #[test]
    fn constructor_requires_identity() {
        let responder = Arc::new(RecordingResponder::default());
        assert!(AgentListener::new(" ", "app", responder.clone()).is_err());
        assert!(AgentListener::new("claude", "", responder).is_err());
    }

    struct UnavailableStore;

    #[async_trait]
    impl RegistryStore for UnavailableStore {
        async fn put(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
            anyhow::bail!("connection refused")
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn info(agent: &str) -> AgentInfo {
        AgentInfo::for_current_process(agent, &Default::default(), &agent_channel("p", agent))
    }

    #[tokio::test]
    async fn registration_failure_stops_before_subscribing() {
        let broker = MemoryBroker::new("p");
        let listener = listener("claude", Arc::new(RecordingResponder::default()));
        let registry = AgentRegistry::new(Arc::new(UnavailableStore), "p");

        let err = run_listener(
            &listener,
            &broker.subscriber("claude"),
            &registry,
            info("claude"),
            RestartPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("register agent claude"));
        assert_eq!(broker.subscriber_count("p:agent:claude"), 0);
    }

    #[tokio::test]
    async fn run_listener_registers_serves_and_unregisters() {
        let broker = MemoryBroker::new("p");
        let responder = Arc::new(RecordingResponder::default());
        let registry = AgentRegistry::new(Arc::new(broker.clone()), "p");
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let broker = broker.clone();
            let responder = responder.clone();
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            async move {
                let listener = listener("claude", responder);
                run_listener(
                    &listener,
                    &broker.subscriber("claude"),
                    &registry,
                    info("claude"),
                    RestartPolicy::default(),
                    &shutdown,
                )
                .await
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count("p:agent:claude") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener should subscribe");
        assert!(broker.get("p:registry:claude").is_some());

        broker
            .publish(&Envelope::from_slice(&payload("claude", r#"{"type":2,"token":"t"}"#)).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while responder.calls.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("interaction should be answered");

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(broker.get("p:registry:claude").is_none());
    }
}
