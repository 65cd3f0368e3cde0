use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;

use crate::server::error::ChatResult;
use crate::server::events::{ChatEvent, EVENTS_CHANNEL, NOTIFICATIONS_CHANNEL};

const CHANNEL_CAPACITY: usize = 1000;

/// Publish/subscribe fan-out decoupling the process that accepts a message
/// from the processes holding its recipients' connections.
///
/// Delivery is at-most-once: a dropped event only delays real-time delivery,
/// the persistence layer already holds the authoritative copy. Subscribers
/// unsubscribe by dropping their receiver.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, event: &ChatEvent) -> ChatResult<()>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChatEvent>;
}

/// In-process dispatcher for single-instance deployments and tests.
#[derive(Default)]
pub struct LocalEventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ChatEvent>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<ChatEvent> {
        let mut channels = self.channels.lock().expect("bus channel map poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, channel: &str, event: &ChatEvent) -> ChatResult<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender_for(channel).send(event.clone());
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChatEvent> {
        self.sender_for(channel).subscribe()
    }
}

/// Redis-backed bus for multi-instance deployments. Publishes go out over
/// PUBLISH; a background task bridges the Redis subscription back into local
/// broadcast channels, so subscribers on every instance (including the
/// publishing one) see the same stream.
pub struct RedisEventBus {
    manager: Arc<tokio::sync::Mutex<ConnectionManager>>,
    local: Arc<LocalEventBus>,
}

impl RedisEventBus {
    pub async fn connect(redis_url: &str) -> ChatResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        let bus = Self {
            manager: Arc::new(tokio::sync::Mutex::new(manager)),
            local: Arc::new(LocalEventBus::new()),
        };
        bus.start_subscriber(redis_url.to_string());
        Ok(bus)
    }

    fn start_subscriber(&self, redis_url: String) {
        let local = self.local.clone();

        tokio::spawn(async move {
            info!("starting redis event subscriber");
            loop {
                match Self::run_subscription(&redis_url, &local).await {
                    Ok(()) => warn!("redis event stream ended, reconnecting"),
                    Err(e) => error!("redis event subscriber error: {}", e),
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    async fn run_subscription(
        redis_url: &str,
        local: &Arc<LocalEventBus>,
    ) -> Result<(), redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        pubsub.subscribe(NOTIFICATIONS_CHANNEL).await?;
        info!(
            "subscribed to channels: {}, {}",
            EVENTS_CHANNEL, NOTIFICATIONS_CHANNEL
        );

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            match serde_json::from_str::<ChatEvent>(&payload) {
                Ok(event) => {
                    debug!("event on {}: {:?}", channel, event);
                    let _ = local.sender_for(&channel).send(event);
                }
                Err(e) => warn!("unparseable event on {}: {}", channel, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, event: &ChatEvent) -> ChatResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.lock().await;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChatEvent> {
        self.local.sender_for(channel).subscribe()
    }
}
