//! Pub/sub seam between the interaction server and agent processes.
//!
//! The server publishes one [`Envelope`] per routed interaction on the
//! agent's channel. Agent processes subscribe to their own channel and hand
//! each raw payload to a [`PayloadHandler`], one at a time.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::protocol::Envelope;

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

/// Upper bound on a single publish, so a slow broker cannot hold the HTTP
/// acknowledgement hostage.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("envelope agent is required")]
    MissingAgent,
    #[error("publish channel {channel}: encode envelope: {source}")]
    Encode {
        channel: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("publish channel {channel}: {reason}")]
    Broker { channel: String, reason: String },
    #[error("publish channel {channel}: timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
}

impl PublishError {
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::MissingAgent => None,
            Self::Encode { channel, .. }
            | Self::Broker { channel, .. }
            | Self::Timeout { channel, .. } => Some(channel),
        }
    }
}

#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError>;
}

#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()>;
}

#[async_trait]
pub trait EnvelopeSubscriber: Send + Sync {
    /// Block delivering messages to `handler` until cancelled, the broker
    /// closes the subscription, or the handler fails.
    ///
    /// Cancellation and broker close return `Ok(())`. A handler error or a
    /// lost broker connection is returned as an error; resubscribing is the
    /// caller's decision.
    async fn subscribe(&self, cancel: &CancellationToken, handler: &dyn PayloadHandler)
        -> Result<()>;
}

/// Key/value storage with expiry, used by the agent registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Result of waiting on an open subscription.
#[derive(Debug)]
pub enum Delivery {
    Message(Vec<u8>),
    /// Receiver fell behind and `n` messages were dropped.
    Lagged(u64),
    /// Message arrived but had no byte payload.
    Unreadable,
    Closed,
    /// The connection under the subscription failed.
    Lost(String),
}

#[async_trait]
pub trait MessageSource: Send {
    async fn next(&mut self) -> Delivery;
}

/// Sequential receive loop shared by every subscriber implementation.
pub async fn drive_subscription(
    source: &mut dyn MessageSource,
    channel: &str,
    cancel: &CancellationToken,
    handler: &dyn PayloadHandler,
) -> Result<()> {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(target = "discord_relay::broker", channel = %channel, "subscription cancelled");
                return Ok(());
            }
            delivery = source.next() => delivery,
        };

        match delivery {
            Delivery::Message(payload) => handler.handle(cancel, &payload).await?,
            Delivery::Lagged(skipped) => {
                tracing::warn!(
                    target = "discord_relay::broker",
                    channel = %channel,
                    skipped = skipped,
                    "subscriber lagged; messages dropped"
                );
            }
            Delivery::Unreadable => {
                tracing::warn!(
                    target = "discord_relay::broker",
                    channel = %channel,
                    "ignoring message without a byte payload"
                );
            }
            Delivery::Closed => {
                tracing::info!(target = "discord_relay::broker", channel = %channel, "subscription closed by broker");
                return Ok(());
            }
            Delivery::Lost(reason) => {
                tracing::warn!(
                    target = "discord_relay::broker",
                    channel = %channel,
                    reason = %reason,
                    "subscription connection lost"
                );
                anyhow::bail!("subscription {channel} lost: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    struct ScriptedSource {
        deliveries: VecDeque<Delivery>,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn next(&mut self) -> Delivery {
            match self.deliveries.pop_front() {
                Some(delivery) => delivery,
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        fail_on: Option<Vec<u8>>,
    }

    #[async_trait]
    impl PayloadHandler for Recorder {
        async fn handle(&self, _cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
            if self.fail_on.as_deref() == Some(payload) {
                anyhow::bail!("handler rejected payload");
            }
            self.seen.lock().push(payload.to_vec());
            Ok(())
        }
    }

    fn source(deliveries: Vec<Delivery>) -> ScriptedSource {
        ScriptedSource {
            deliveries: deliveries.into(),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_stops_on_close() {
        let mut src = source(vec![
            Delivery::Message(b"one".to_vec()),
            Delivery::Lagged(3),
            Delivery::Unreadable,
            Delivery::Message(b"two".to_vec()),
            Delivery::Closed,
            Delivery::Message(b"never".to_vec()),
        ]);
        let handler = Recorder::default();
        drive_subscription(&mut src, "c", &CancellationToken::new(), &handler)
            .await
            .unwrap();
        assert_eq!(*handler.seen.lock(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn handler_error_aborts_loop() {
        let mut src = source(vec![
            Delivery::Message(b"bad".to_vec()),
            Delivery::Message(b"after".to_vec()),
        ]);
        let handler = Recorder {
            fail_on: Some(b"bad".to_vec()),
            ..Default::default()
        };
        let err = drive_subscription(&mut src, "c", &CancellationToken::new(), &handler)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn lost_connection_ends_loop_with_error() {
        let mut src = source(vec![
            Delivery::Message(b"one".to_vec()),
            Delivery::Lost("IO: connection reset".into()),
            Delivery::Message(b"never".to_vec()),
        ]);
        let handler = Recorder::default();
        let err = drive_subscription(&mut src, "p:agent:claude", &CancellationToken::new(), &handler)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("p:agent:claude lost"));
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(*handler.seen.lock(), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn cancellation_returns_cleanly() {
        let mut src = source(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        drive_subscription(&mut src, "c", &cancel, &Recorder::default())
            .await
            .unwrap();
    }

    #[test]
    fn publish_errors_name_the_channel() {
        let err = PublishError::Timeout {
            channel: "p:agent:claude".into(),
            timeout: PUBLISH_TIMEOUT,
        };
        assert_eq!(err.channel(), Some("p:agent:claude"));
        assert!(err.to_string().starts_with("publish channel p:agent:claude"));
    }
}
