use std::time::Duration;

use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde_json::Value;
use strand_types::{
    events::{control_channel, instance_control_channel, lease_key},
    AgentError, ControlSignal, PubSub, Subscription,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{lease_lock_key, responses_key};

const CHANNEL_CAPACITY: usize = 1024;

/// Cross-process pub/sub on redis: PUBLISH/SUBSCRIBE for live frames,
/// RPUSH + EXPIRE lists for replay, SET NX EX for leases.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
    response_list_ttl: Duration,
}

impl RedisPubSub {
    pub async fn connect(
        url: &str,
        prefix: Option<String>,
        response_list_ttl: Duration,
    ) -> Result<Self, AgentError> {
        let client = redis::Client::open(url)
            .map_err(|e| AgentError::InvalidConfiguration(format!("bad redis url: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        Ok(Self {
            client,
            manager,
            prefix: prefix.unwrap_or_else(|| "strand".to_string()),
            response_list_ttl,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }
}

fn map_err(err: redis::RedisError) -> AgentError {
    if err.is_io_error() || err.is_timeout() {
        AgentError::Transient(format!("redis: {err}"))
    } else {
        AgentError::Storage(format!("redis: {err}"))
    }
}

#[async_trait::async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), AgentError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .publish(self.key(channel), payload.to_string())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AgentError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.subscribe(self.key(channel)).await.map_err(map_err)?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("dropping undecodable pubsub payload: {e}");
                        continue;
                    }
                };
                let value = serde_json::from_str(&payload)
                    .unwrap_or_else(|_| Value::String(payload.clone()));
                if tx.send(value).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn push_response(&self, run_id: Uuid, payload: Value) -> Result<(), AgentError> {
        let key = self.key(&responses_key(run_id));
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .rpush(&key, payload.to_string())
            .await
            .map_err(map_err)?;
        let _: bool = conn
            .expire(&key, self.response_list_ttl.as_secs() as i64)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn replay(&self, run_id: Uuid, from_offset: usize) -> Result<Vec<Value>, AgentError> {
        let key = self.key(&responses_key(run_id));
        let mut conn = self.manager.clone();
        let raw: Vec<String> = conn
            .lrange(&key, from_offset as isize, -1)
            .await
            .map_err(map_err)?;
        Ok(raw
            .into_iter()
            .map(|item| serde_json::from_str(&item).unwrap_or(Value::String(item)))
            .collect())
    }

    async fn send_control(
        &self,
        run_id: Uuid,
        signal: ControlSignal,
        instance_id: Option<&str>,
    ) -> Result<(), AgentError> {
        let payload = serde_json::to_value(signal)?;
        let channel = match instance_id {
            Some(instance_id) => instance_control_channel(run_id, instance_id),
            None => control_channel(run_id),
        };
        self.publish(&channel, payload).await
    }

    async fn acquire_lease(
        &self,
        run_id: Uuid,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, AgentError> {
        let lock = self.key(&lease_lock_key(run_id));
        let mut conn = self.manager.clone();

        let current: Option<String> = conn.get(&lock).await.map_err(map_err)?;
        let acquired = match current {
            Some(owner) if owner != instance_id => false,
            Some(_) => {
                // Reentrant refresh for the holder.
                let _: bool = conn
                    .expire(&lock, ttl.as_secs() as i64)
                    .await
                    .map_err(map_err)?;
                true
            }
            None => {
                let reply: Option<String> = redis::cmd("SET")
                    .arg(&lock)
                    .arg(instance_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await
                    .map_err(map_err)?;
                reply.is_some()
            }
        };

        if acquired {
            // Instance-scoped liveness marker alongside the lock.
            let marker = self.key(&lease_key(run_id, instance_id));
            let _: () = conn
                .set_ex(&marker, "1", ttl.as_secs())
                .await
                .map_err(map_err)?;
        }
        Ok(acquired)
    }

    async fn refresh_lease(
        &self,
        run_id: Uuid,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, AgentError> {
        self.acquire_lease(run_id, instance_id, ttl).await
    }

    async fn release_lease(&self, run_id: Uuid, instance_id: &str) -> Result<(), AgentError> {
        let lock = self.key(&lease_lock_key(run_id));
        let marker = self.key(&lease_key(run_id, instance_id));
        let mut conn = self.manager.clone();

        let current: Option<String> = conn.get(&lock).await.map_err(map_err)?;
        if current.as_deref() == Some(instance_id) {
            let _: i64 = conn.del(&lock).await.map_err(map_err)?;
        }
        let _: i64 = conn.del(&marker).await.map_err(map_err)?;
        Ok(())
    }
}
