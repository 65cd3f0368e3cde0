use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use crate::server::error::ChatResult;

/// Ephemeral presence and room-membership state.
///
/// Online markers expire on their own after the TTL: a connection that
/// vanishes without a clean close simply stops heartbeating and the marker
/// decays, so presence never becomes permanently stale. Losing this state
/// only degrades real-time delivery; the relational store stays authoritative.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, user_id: &str) -> ChatResult<()>;
    async fn set_offline(&self, user_id: &str) -> ChatResult<()>;
    async fn is_online(&self, user_id: &str) -> ChatResult<bool>;
    async fn add_to_room(&self, room_id: &str, user_id: &str) -> ChatResult<()>;
    async fn remove_from_room(&self, room_id: &str, user_id: &str) -> ChatResult<()>;
    async fn members_of(&self, room_id: &str) -> ChatResult<HashSet<String>>;
}

fn online_key(user_id: &str) -> String {
    format!("presence:online:{}", user_id)
}

fn room_key(room_id: &str) -> String {
    format!("presence:room:{}", room_id)
}

/// Redis-backed store shared by every gateway instance.
pub struct RedisPresenceStore {
    manager: Arc<Mutex<ConnectionManager>>,
    ttl_secs: u64,
}

impl RedisPresenceStore {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> ChatResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
            ttl_secs,
        })
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: &str) -> ChatResult<()> {
        let mut conn = self.manager.lock().await;
        let _: () = redis::cmd("SETEX")
            .arg(online_key(user_id))
            .arg(self.ttl_secs)
            .arg(1)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_offline(&self, user_id: &str) -> ChatResult<()> {
        let mut conn = self.manager.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(online_key(user_id))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> ChatResult<bool> {
        let mut conn = self.manager.lock().await;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(online_key(user_id))
            .query_async(&mut *conn)
            .await?;
        Ok(exists > 0)
    }

    async fn add_to_room(&self, room_id: &str, user_id: &str) -> ChatResult<()> {
        let mut conn = self.manager.lock().await;
        let key = room_key(room_id);
        let _: () = redis::cmd("SADD")
            .arg(&key)
            .arg(user_id)
            .query_async(&mut *conn)
            .await?;
        // Membership sets decay with the same TTL so an instance crash
        // cannot leave a room set behind forever.
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .query_async(&mut *conn)
            .await?;
        debug!("user {} joined room set {}", user_id, room_id);
        Ok(())
    }

    async fn remove_from_room(&self, room_id: &str, user_id: &str) -> ChatResult<()> {
        let mut conn = self.manager.lock().await;
        let _: () = redis::cmd("SREM")
            .arg(room_key(room_id))
            .arg(user_id)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn members_of(&self, room_id: &str) -> ChatResult<HashSet<String>> {
        let mut conn = self.manager.lock().await;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(room_key(room_id))
            .query_async(&mut *conn)
            .await?;
        Ok(members.into_iter().collect())
    }
}

/// Single-process store with the same expiry semantics, used by tests and
/// deployments without Redis. Expiry is checked on read rather than by a
/// reaper task.
#[derive(Clone, Default)]
pub struct MemoryPresenceStore {
    online: Arc<Mutex<HashMap<String, Instant>>>,
    rooms: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    ttl: Duration,
}

impl MemoryPresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            online: Arc::new(Mutex::new(HashMap::new())),
            rooms: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: &str) -> ChatResult<()> {
        let mut online = self.online.lock().await;
        online.insert(user_id.to_string(), Instant::now() + self.ttl);
        Ok(())
    }

    async fn set_offline(&self, user_id: &str) -> ChatResult<()> {
        let mut online = self.online.lock().await;
        online.remove(user_id);
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> ChatResult<bool> {
        let mut online = self.online.lock().await;
        match online.get(user_id) {
            Some(deadline) if *deadline > Instant::now() => Ok(true),
            Some(_) => {
                online.remove(user_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn add_to_room(&self, room_id: &str, user_id: &str) -> ChatResult<()> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn remove_from_room(&self, room_id: &str, user_id: &str) -> ChatResult<()> {
        let mut rooms = self.rooms.lock().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(user_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
        Ok(())
    }

    async fn members_of(&self, room_id: &str) -> ChatResult<HashSet<String>> {
        let rooms = self.rooms.lock().await;
        Ok(rooms.get(room_id).cloned().unwrap_or_default())
    }
}
