//! Publish/subscribe message bus used to talk to strategy processes
//!
//! [`RedisMessageBus`] is the production transport. [`InMemoryMessageBus`]
//! keeps everything inside the process for local runs and tests; only a
//! bus built with [`InMemoryMessageBus::recording`] keeps a history of
//! what was published.

use super::error::BridgeError;
use crate::config;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

pub type BusStream = BoxStream<'static, BusMessage>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError>;

    /// Open a subscription delivering messages for any of `topics`.
    ///
    /// Dropping the stream ends the subscription.
    async fn subscribe(&self, topics: &[String]) -> Result<BusStream, BridgeError>;

    /// Address handed to child processes so they can join the same bus
    fn endpoint(&self) -> String;
}

pub struct RedisMessageBus {
    url: String,
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisMessageBus {
    /// Connect to the Redis instance named by `REDIS_URL`
    pub async fn from_env() -> Result<Self, BridgeError> {
        Self::connect(&config::get_redis_url()).await
    }

    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::Connectivity(format!("invalid redis url {}: {}", url, e)))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BridgeError::Connectivity(format!("redis at {}: {}", url, e)))?;
        debug!(url = %url, "RedisMessageBus: connected");
        Ok(Self {
            url: url.to_string(),
            client,
            publisher,
        })
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<BusStream, BridgeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::Connectivity(format!("redis pubsub at {}: {}", self.url, e)))?;
        for topic in topics {
            pubsub
                .subscribe(topic)
                .await
                .map_err(|e| BridgeError::Connectivity(format!("subscribe {}: {}", topic, e)))?;
        }

        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            topic: msg.get_channel_name().to_string(),
            payload: String::from_utf8_lossy(msg.get_payload_bytes()).into_owned(),
        });
        Ok(stream.boxed())
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct InMemoryState {
    subscribers: Vec<Subscriber>,
    record: bool,
    published: Vec<BusMessage>,
}

/// Process-local bus; clones share the same subscribers and history
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that also keeps every published message. The history is
    /// never trimmed, so keep this to tests and short runs.
    pub fn recording() -> Self {
        let bus = Self::default();
        bus.lock().record = true;
        bus
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everything published so far, in order. Always empty unless the bus
    /// was built with [`InMemoryMessageBus::recording`].
    pub fn published(&self) -> Vec<BusMessage> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Live subscriptions (closed ones are pruned on the next publish)
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        let mut state = self.lock();
        if state.record {
            state.published.push(message.clone());
        }
        state.subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                return false;
            }
            if subscriber.topics.iter().any(|t| t == topic)
                && subscriber.tx.send(message.clone()).is_err()
            {
                warn!(topic = %topic, "InMemoryMessageBus: dropping closed subscriber");
                return false;
            }
            true
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<BusStream, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(Subscriber {
            topics: topics.to_vec(),
            tx,
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}
