//! Ephemeral directory of running agent processes.
//!
//! Each listener writes its own entry with a TTL and renews it on a heartbeat.
//! Entries are for discovery and liveness only; routing never reads them.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::RegistryStore;
use crate::config::HandlersConfig;
use crate::protocol::{registry_key, same_agent};

pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub process_id: u32,
    pub updated_at: DateTime<Utc>,
}

impl AgentInfo {
    /// Entry describing the current process serving `agent` on `channel`.
    pub fn for_current_process(agent: &str, handlers: &HandlersConfig, channel: &str) -> Self {
        Self {
            agent: agent.to_string(),
            capabilities: resolve_capabilities(agent, handlers),
            channels: vec![channel.to_string()],
            hostname: hostname_or_unknown(),
            process_id: std::process::id(),
            updated_at: Utc::now(),
        }
    }
}

/// `kind:key` tags for every configured route owned by `agent`, sorted.
pub fn resolve_capabilities(agent: &str, handlers: &HandlersConfig) -> Vec<String> {
    let agent = agent.trim();
    let mut capabilities: Vec<String> = [
        ("command", &handlers.commands),
        ("component", &handlers.components),
        ("modal", &handlers.modals),
        ("autocomplete", &handlers.autocomplete),
    ]
    .into_iter()
    .flat_map(|(kind, table)| {
        table
            .iter()
            .filter(|(_, route)| same_agent(&route.agent, agent))
            .map(move |(key, _)| format!("{kind}:{key}"))
    })
    .collect();
    capabilities.sort();
    capabilities
}

fn hostname_or_unknown() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn RegistryStore>,
    prefix: String,
    ttl: Duration,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            ttl: DEFAULT_REGISTRY_TTL,
        }
    }

    pub fn key(&self, agent: &str) -> String {
        registry_key(&self.prefix, agent)
    }

    /// Write (or refresh) the entry, stamping `updated_at`.
    pub async fn register(&self, info: &AgentInfo) -> Result<()> {
        if info.agent.trim().is_empty() {
            anyhow::bail!("agent is required for registry entry");
        }
        let mut info = info.clone();
        info.updated_at = Utc::now();
        let payload = serde_json::to_vec(&info).context("encode agent info")?;
        self.store
            .put(&self.key(&info.agent), &payload, self.ttl)
            .await
            .context("store registry info")
    }

    /// Remove the entry. Blank agents and missing entries are fine.
    pub async fn unregister(&self, agent: &str) -> Result<()> {
        if agent.trim().is_empty() {
            return Ok(());
        }
        self.store
            .delete(&self.key(agent))
            .await
            .context("remove registry entry")
    }

    /// Re-register every `interval` until cancelled. Failures are logged and
    /// the loop keeps going; the entry simply expires if they persist.
    pub async fn heartbeat(&self, info: AgentInfo, interval: Duration, cancel: CancellationToken) {
        let interval = if interval.is_zero() {
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(error) = self.register(&info).await {
                        tracing::warn!(
                            target = "discord_relay::registry",
                            agent = %info.agent,
                            error = %format!("{error:#}"),
                            "registry heartbeat failed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Settings;

    fn handlers() -> HandlersConfig {
        Settings::from_yaml(
            r#"
interactions:
  handlers:
    commands:
      help: { agent: Claude }
      deploy: { agent: codex }
    components:
      approve: { agent: claude }
    modals:
      feedback: { agent: CLAUDE }
"#,
        )
        .unwrap()
        .interactions
        .handlers
    }

    #[test]
    fn capabilities_are_sorted_and_case_insensitive() {
        assert_eq!(
            resolve_capabilities("claude", &handlers()),
            vec!["command:help", "component:approve", "modal:feedback"]
        );
        assert_eq!(resolve_capabilities("codex", &handlers()), vec!["command:deploy"]);
        assert!(resolve_capabilities("nobody", &handlers()).is_empty());
    }

    #[test]
    fn capabilities_match_non_ascii_agent_names() {
        let handlers = Settings::from_yaml(
            r#"
interactions:
  handlers:
    commands:
      ship: { agent: élan }
"#,
        )
        .unwrap()
        .interactions
        .handlers;
        assert_eq!(resolve_capabilities("ÉLAN", &handlers), vec!["command:ship"]);
    }

    #[test]
    fn current_process_info() {
        let info = AgentInfo::for_current_process("claude", &handlers(), "p:agent:claude");
        assert_eq!(info.process_id, std::process::id());
        assert!(!info.hostname.is_empty());
        assert_eq!(info.channels, vec!["p:agent:claude"]);
    }

    #[tokio::test]
    async fn register_writes_entry_under_registry_key() {
        let broker = MemoryBroker::new("p");
        let registry = AgentRegistry::new(Arc::new(broker.clone()), "p");
        let info = AgentInfo::for_current_process("Claude", &handlers(), "p:agent:claude");
        registry.register(&info).await.unwrap();

        let stored = broker.get("p:registry:claude").expect("entry stored");
        let decoded: AgentInfo = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded.agent, "Claude");
        assert_eq!(decoded.capabilities.len(), 3);
    }

    #[tokio::test]
    async fn register_requires_agent() {
        let registry = AgentRegistry::new(Arc::new(MemoryBroker::new("p")), "p");
        let info = AgentInfo::for_current_process(" ", &HandlersConfig::default(), "c");
        assert!(registry.register(&info).await.is_err());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let broker = MemoryBroker::new("p");
        let registry = AgentRegistry::new(Arc::new(broker.clone()), "p");
        let info = AgentInfo::for_current_process("claude", &handlers(), "c");
        registry.register(&info).await.unwrap();

        registry.unregister("claude").await.unwrap();
        registry.unregister("claude").await.unwrap();
        registry.unregister("").await.unwrap();
        assert!(broker.get("p:registry:claude").is_none());
    }

    #[tokio::test]
    async fn heartbeat_renews_until_cancelled() {
        let broker = MemoryBroker::new("p");
        let registry = AgentRegistry::new(Arc::new(broker.clone()), "p");
        let info = AgentInfo::for_current_process("claude", &handlers(), "c");
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move {
                registry
                    .heartbeat(info, Duration::from_millis(10), cancel)
                    .await
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.get("p:registry:claude").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat should register");

        cancel.cancel();
        task.await.unwrap();
    }
}
