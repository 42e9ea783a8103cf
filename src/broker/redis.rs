//! Redis pub/sub and key/value backend built on `fred`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::interfaces::PubsubInterface;
use fred::prelude::*;
use fred::types::Message;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{
    drive_subscription, Delivery, EnvelopePublisher, EnvelopeSubscriber, MessageSource,
    PayloadHandler, PublishError, RegistryStore, PUBLISH_TIMEOUT,
};
use crate::config::RedisSettings;
use crate::protocol::{agent_channel, Envelope};

/// Build a client config from settings. `addr` may be `host:port` or a URL.
pub fn redis_config(settings: &RedisSettings) -> Result<Config> {
    let addr = settings.addr.trim();
    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    };
    let mut config =
        Config::from_url(&url).with_context(|| format!("invalid redis address {addr:?}"))?;
    if !settings.password.is_empty() {
        config.password = Some(settings.password.clone());
    }
    if settings.db != 0 {
        config.database = Some(settings.db);
    }
    Ok(config)
}

/// Publishing connections retry forever with capped exponential backoff.
fn reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy::new_exponential(0, 100, 5_000, 2)
}

async fn connect_client(client: &Client, timeout: Duration) -> Result<()> {
    let _connection = client.connect();
    match tokio::time::timeout(timeout, client.wait_for_connect()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => {
            let _ = client.quit().await;
            Err(error).context("connect redis")
        }
        Err(_) => {
            let _ = client.quit().await;
            anyhow::bail!("connect redis: timed out after {timeout:?}")
        }
    }
}

/// Shared connection used for publishing and registry writes.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    prefix: String,
    publish_timeout: Duration,
}

impl RedisBroker {
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        Self::connect_with_timeout(settings, PUBLISH_TIMEOUT).await
    }

    pub async fn connect_with_timeout(settings: &RedisSettings, timeout: Duration) -> Result<Self> {
        let client = Client::new(redis_config(settings)?, None, None, Some(reconnect_policy()));
        connect_client(&client, timeout)
            .await
            .with_context(|| format!("redis at {}", settings.addr))?;
        tracing::debug!(target = "discord_relay::broker", addr = %settings.addr, "connected to redis");
        Ok(Self {
            client,
            prefix: settings.channel_prefix.clone(),
            publish_timeout: PUBLISH_TIMEOUT,
        })
    }

    /// Subscriber for `agent`'s channel. Each `subscribe` call opens its own
    /// connection.
    pub fn subscriber(&self, agent: &str) -> RedisSubscriber {
        RedisSubscriber {
            client: self.client.clone(),
            channel: agent_channel(&self.prefix, agent),
            connect_timeout: self.publish_timeout,
        }
    }

    pub async fn close(&self) {
        let _ = self.client.quit().await;
    }
}

#[async_trait]
impl EnvelopePublisher for RedisBroker {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if envelope.agent().trim().is_empty() {
            return Err(PublishError::MissingAgent);
        }
        let channel = envelope.channel(&self.prefix);
        let payload = envelope.to_bytes().map_err(|source| PublishError::Encode {
            channel: channel.clone(),
            source,
        })?;

        let publish = self.client.publish::<i64, _, _>(channel.as_str(), payload);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(receivers)) => {
                tracing::debug!(
                    target = "discord_relay::broker",
                    channel = %channel,
                    receivers = receivers,
                    "published envelope"
                );
                Ok(())
            }
            Ok(Err(error)) => Err(PublishError::Broker {
                channel,
                reason: error.to_string(),
            }),
            Err(_) => Err(PublishError::Timeout {
                channel,
                timeout: self.publish_timeout,
            }),
        }
    }
}

#[async_trait]
impl RegistryStore for RedisBroker {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let seconds = ttl.as_secs().max(1) as i64;
        self.client
            .set::<(), _, _>(key, value.to_vec(), Some(Expiration::EX(seconds)), None, false)
            .await
            .with_context(|| format!("set registry key {key}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .del::<i64, _>(key)
            .await
            .map(|_| ())
            .with_context(|| format!("delete registry key {key}"))
    }
}

pub struct RedisSubscriber {
    client: Client,
    channel: String,
    connect_timeout: Duration,
}

/// Pub/sub messages plus the connection's error stream. The message sender
/// outlives a dropped connection; only the error stream reports it.
struct RedisSource {
    messages: broadcast::Receiver<Message>,
    errors: broadcast::Receiver<(Error, Option<Server>)>,
}

impl RedisSource {
    fn for_client(client: &Client) -> Self {
        Self {
            messages: client.message_rx(),
            errors: client.error_rx(),
        }
    }
}

#[async_trait]
impl MessageSource for RedisSource {
    async fn next(&mut self) -> Delivery {
        tokio::select! {
            message = self.messages.recv() => match message {
                Ok(message) => match message.value.as_bytes() {
                    Some(bytes) => Delivery::Message(bytes.to_vec()),
                    None => Delivery::Unreadable,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => Delivery::Lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
            },
            error = self.errors.recv() => match error {
                Ok((error, Some(server))) => Delivery::Lost(format!("{server}: {error}")),
                Ok((error, None)) => Delivery::Lost(error.to_string()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    Delivery::Lost(format!("{skipped} connection errors"))
                }
                Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
            },
        }
    }
}

#[async_trait]
impl EnvelopeSubscriber for RedisSubscriber {
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        handler: &dyn PayloadHandler,
    ) -> Result<()> {
        let subscriber = self.client.clone_new();
        connect_client(&subscriber, self.connect_timeout)
            .await
            .with_context(|| format!("subscribe redis channel {}", self.channel))?;

        let mut source = RedisSource::for_client(&subscriber);
        let result = match subscriber.subscribe(self.channel.as_str()).await {
            Ok(()) => {
                tracing::info!(target = "discord_relay::broker", channel = %self.channel, "subscribed");
                drive_subscription(&mut source, &self.channel, cancel, handler).await
            }
            Err(error) => {
                Err(error).with_context(|| format!("subscribe redis channel {}", self.channel))
            }
        };

        let _ = subscriber.unsubscribe(self.channel.as_str()).await;
        let _ = subscriber.quit().await;
        result
    }
}
