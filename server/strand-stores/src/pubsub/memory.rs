use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use strand_types::{
    events::{control_channel, instance_control_channel},
    AgentError, ControlSignal, PubSub, Subscription,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{lease_lock_key, responses_key};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct ReplayList {
    items: Vec<Value>,
    expires_at: Instant,
}

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Single-process pub/sub with the same semantics as the redis backend:
/// at-least-once delivery to live subscribers, TTL-bounded replay lists, and
/// TTL leases. Used by tests and single-node deployments.
#[derive(Debug)]
pub struct InMemoryPubSub {
    channels: DashMap<String, broadcast::Sender<Value>>,
    replay: DashMap<String, ReplayList>,
    leases: DashMap<String, Lease>,
    response_list_ttl: Duration,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl InMemoryPubSub {
    pub fn new(response_list_ttl: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            replay: DashMap::new(),
            leases: DashMap::new(),
            response_list_ttl,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), AgentError> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AgentError> {
        let mut rx = self.sender(channel).subscribe();
        let (tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "pubsub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(out_rx))
    }

    async fn push_response(&self, run_id: Uuid, payload: Value) -> Result<(), AgentError> {
        let key = responses_key(run_id);
        let mut list = self.replay.entry(key).or_insert_with(|| ReplayList {
            items: Vec::new(),
            expires_at: Instant::now() + self.response_list_ttl,
        });
        if list.expires_at <= Instant::now() {
            list.items.clear();
        }
        list.items.push(payload);
        list.expires_at = Instant::now() + self.response_list_ttl;
        Ok(())
    }

    async fn replay(&self, run_id: Uuid, from_offset: usize) -> Result<Vec<Value>, AgentError> {
        let key = responses_key(run_id);
        let Some(list) = self.replay.get(&key) else {
            return Ok(Vec::new());
        };
        if list.expires_at <= Instant::now() {
            return Ok(Vec::new());
        }
        Ok(list.items.iter().skip(from_offset).cloned().collect())
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
        let key = lease_lock_key(run_id);
        let now = Instant::now();
        let mut entry = self.leases.entry(key).or_insert_with(|| Lease {
            owner: instance_id.to_string(),
            expires_at: now + ttl,
        });
        if entry.owner != instance_id && entry.expires_at > now {
            return Ok(false);
        }
        entry.owner = instance_id.to_string();
        entry.expires_at = now + ttl;
        Ok(true)
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
        let key = lease_lock_key(run_id);
        self.leases
            .remove_if(&key, |_, lease| lease.owner == instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_live_subscribers() {
        let pubsub = InMemoryPubSub::default();
        let mut sub = pubsub.subscribe("chan").await.unwrap();
        pubsub.publish("chan", json!({"n": 1})).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn replay_preserves_order_and_offset() {
        let pubsub = InMemoryPubSub::default();
        let run_id = Uuid::new_v4();
        for i in 0..4 {
            pubsub.push_response(run_id, json!(i)).await.unwrap();
        }
        assert_eq!(
            pubsub.replay(run_id, 0).await.unwrap(),
            vec![json!(0), json!(1), json!(2), json!(3)]
        );
        assert_eq!(
            pubsub.replay(run_id, 2).await.unwrap(),
            vec![json!(2), json!(3)]
        );
    }

    #[tokio::test]
    async fn expired_replay_list_is_empty() {
        let pubsub = InMemoryPubSub::new(Duration::from_millis(0));
        let run_id = Uuid::new_v4();
        pubsub.push_response(run_id, json!("x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pubsub.replay(run_id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let pubsub = InMemoryPubSub::default();
        let run_id = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        assert!(pubsub.acquire_lease(run_id, "a", ttl).await.unwrap());
        assert!(!pubsub.acquire_lease(run_id, "b", ttl).await.unwrap());
        // Reentrant for the holder.
        assert!(pubsub.acquire_lease(run_id, "a", ttl).await.unwrap());
        assert!(pubsub.refresh_lease(run_id, "a", ttl).await.unwrap());

        pubsub.release_lease(run_id, "a").await.unwrap();
        assert!(pubsub.acquire_lease(run_id, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let pubsub = InMemoryPubSub::default();
        let run_id = Uuid::new_v4();
        assert!(pubsub
            .acquire_lease(run_id, "a", Duration::from_millis(0))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pubsub
            .acquire_lease(run_id, "b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn control_goes_to_targeted_channel() {
        let pubsub = InMemoryPubSub::default();
        let run_id = Uuid::new_v4();
        let mut global = pubsub
            .subscribe(&control_channel(run_id))
            .await
            .unwrap();
        let mut targeted = pubsub
            .subscribe(&instance_control_channel(run_id, "w1"))
            .await
            .unwrap();

        pubsub
            .send_control(run_id, ControlSignal::Stop, None)
            .await
            .unwrap();
        assert_eq!(global.recv().await.unwrap(), json!("STOP"));

        pubsub
            .send_control(run_id, ControlSignal::Error, Some("w1"))
            .await
            .unwrap();
        assert_eq!(targeted.recv().await.unwrap(), json!("ERROR"));
    }
}
