//! In-process broker with the same delivery contract as Redis pub/sub:
//! at-most-once, no replay, messages to a channel nobody listens on are lost.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{
    drive_subscription, Delivery, EnvelopePublisher, EnvelopeSubscriber, MessageSource,
    PayloadHandler, PublishError, RegistryStore,
};
use crate::protocol::{agent_channel, Envelope};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: Vec<u8>,
    pub receivers: usize,
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
    entries: HashMap<String, (Vec<u8>, Instant)>,
    published: Vec<PublishedMessage>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    prefix: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscriber bound to `agent`'s channel.
    pub fn subscriber(&self, agent: &str) -> MemorySubscriber {
        MemorySubscriber {
            broker: self.clone(),
            channel: agent_channel(&self.prefix, agent),
        }
    }

    /// Every publish so far, including ones no subscriber received.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a channel, ending every open subscription on it.
    pub fn close_channel(&self, channel: &str) {
        self.state.lock().channels.remove(channel);
    }

    /// Live (unexpired) registry value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let expired = matches!(
            state.entries.get(key),
            Some((_, expires)) if *expires <= Instant::now()
        );
        if expired {
            state.entries.remove(key);
            return None;
        }
        state.entries.get(key).map(|(value, _)| value.clone())
    }

    fn publish_raw(&self, channel: &str, payload: Vec<u8>) -> usize {
        let mut state = self.state.lock();
        let receivers = state
            .channels
            .get(channel)
            .and_then(|sender| sender.send(payload.clone()).ok())
            .unwrap_or(0);
        state.published.push(PublishedMessage {
            channel: channel.to_string(),
            payload,
            receivers,
        });
        receivers
    }

    fn open(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut state = self.state.lock();
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl EnvelopePublisher for MemoryBroker {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if envelope.agent().trim().is_empty() {
            return Err(PublishError::MissingAgent);
        }
        let channel = envelope.channel(&self.prefix);
        let payload = envelope.to_bytes().map_err(|source| PublishError::Encode {
            channel: channel.clone(),
            source,
        })?;
        self.publish_raw(&channel, payload);
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for MemoryBroker {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.state
            .lock()
            .entries
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().entries.remove(key);
        Ok(())
    }
}

pub struct MemorySubscriber {
    broker: MemoryBroker,
    channel: String,
}

impl MemorySubscriber {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct MemorySource {
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Delivery {
        match self.rx.recv().await {
            Ok(payload) => Delivery::Message(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Delivery::Lagged(skipped),
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }
}

#[async_trait]
impl EnvelopeSubscriber for MemorySubscriber {
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        handler: &dyn PayloadHandler,
    ) -> Result<()> {
        let mut source = MemorySource {
            rx: self.broker.open(&self.channel),
        };
        // The receiver is dropped on return, releasing the subscription.
        drive_subscription(&mut source, &self.channel, cancel, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::HandlerKind;

    struct Forward(tokio::sync::mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl PayloadHandler for Forward {
        async fn handle(&self, _cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
            let _ = self.0.send(payload.to_vec());
            Ok(())
        }
    }

    fn envelope(agent: &str) -> Envelope {
        Envelope::new(
            agent,
            HandlerKind::Command,
            "help",
            br#"{"type":2,"token":"t"}"#,
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let broker = MemoryBroker::new("p");
        broker.publish(&envelope("claude")).await.unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].channel, "p:agent:claude");
        assert_eq!(published[0].receivers, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_and_releases_on_cancel() {
        let broker = MemoryBroker::new("p");
        let subscriber = broker.subscriber("Claude");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.subscribe(&cancel, &Forward(tx)).await })
        };
        while broker.subscriber_count("p:agent:claude") == 0 {
            tokio::task::yield_now().await;
        }

        broker.publish(&envelope("CLAUDE")).await.unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(Envelope::from_slice(&payload).unwrap().agent(), "CLAUDE");

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(broker.subscriber_count("p:agent:claude"), 0);
    }

    #[tokio::test]
    async fn closing_channel_ends_subscription_cleanly() {
        let broker = MemoryBroker::new("p");
        let subscriber = broker.subscriber("codex");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            subscriber
                .subscribe(&CancellationToken::new(), &Forward(tx))
                .await
        });
        while broker.subscriber_count("p:agent:codex") == 0 {
            tokio::task::yield_now().await;
        }
        broker.close_channel("p:agent:codex");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn registry_entries_expire_and_delete_is_idempotent() {
        let broker = MemoryBroker::new("p");
        broker.put("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(broker.get("k"), Some(b"v".to_vec()));

        broker.put("short", b"v", Duration::ZERO).await.unwrap();
        assert_eq!(broker.get("short"), None);

        broker.delete("k").await.unwrap();
        broker.delete("k").await.unwrap();
        assert_eq!(broker.get("k"), None);
    }
}
