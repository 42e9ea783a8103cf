//! Envelope wire format exchanged over the broker, plus channel naming.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::routing::HandlerKind;

pub const ENVELOPE_SOURCE: &str = "discord-relay.server";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope agent is required")]
    MissingAgent,
    #[error("interaction payload is not valid json: {0}")]
    InvalidInteraction(#[source] serde_json::Error),
}

/// One routed interaction on its way to an agent. Read-only once built.
///
/// `interaction` is carried as raw JSON so the agent sees exactly the bytes
/// the platform sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    agent: String,
    kind: HandlerKind,
    key: String,
    interaction: Box<RawValue>,
    received_at: DateTime<Utc>,
    timeout_seconds: u64,
    source: String,
}

impl Envelope {
    pub fn new(
        agent: &str,
        kind: HandlerKind,
        key: &str,
        interaction: &[u8],
        timeout: Duration,
    ) -> Result<Self, EnvelopeError> {
        let agent = agent.trim();
        if agent.is_empty() {
            return Err(EnvelopeError::MissingAgent);
        }
        let interaction: Box<RawValue> =
            serde_json::from_slice(interaction).map_err(EnvelopeError::InvalidInteraction)?;

        Ok(Self {
            agent: agent.to_string(),
            kind,
            key: key.to_string(),
            interaction,
            received_at: Utc::now(),
            timeout_seconds: timeout.as_secs(),
            source: ENVELOPE_SOURCE.to_string(),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the envelope is addressed to `agent`.
    pub fn is_for(&self, agent: &str) -> bool {
        same_agent(&self.agent, agent)
    }

    pub fn channel(&self, prefix: &str) -> String {
        agent_channel(prefix, &self.agent)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn interaction_json(&self) -> &str {
        self.interaction.get()
    }

    pub fn interaction_bytes(&self) -> &[u8] {
        self.interaction.get().as_bytes()
    }
}

/// Agent names compare the way channels are named: trimmed and lowercased.
pub fn same_agent(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// `{prefix}:agent:{agent}` with the agent lowercased.
pub fn agent_channel(prefix: &str, agent: &str) -> String {
    format!("{prefix}:agent:{}", agent.trim().to_lowercase())
}

/// `{prefix}:registry:{agent}` with the agent lowercased.
pub fn registry_key(prefix: &str, agent: &str) -> String {
    format!("{prefix}:registry:{}", agent.trim().to_lowercase())
}
