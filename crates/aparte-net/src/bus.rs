//! The `SignalBus` seam between the realtime substrate and its consumers.
//!
//! Signaling and consent traffic is plain topic-scoped broadcast: publish
//! bytes to a topic, receive the bytes every other subscriber published.
//! [`GossipBus`] backs the trait with the libp2p swarm task; [`MemoryBus`]
//! backs it with an in-process topic map for tests and single-host use.
//!
//! Subscriptions end when the returned receiver is dropped; publishers
//! prune closed subscribers on the next delivery. Delivery is ordered per
//! sender. No ordering is guaranteed across senders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libp2p::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::swarm::{spawn_swarm, BusCommand, BusNotification, SwarmConfig};

/// Subscriber channel capacity. A full subscriber loses messages rather
/// than stalling the dispatcher.
const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Bus channel closed")]
    ChannelClosed,

    #[error("Swarm error: {0}")]
    Swarm(String),
}

/// A raw message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

/// Topic-scoped broadcast transport.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publish bytes to every subscriber of `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError>;

    /// Subscribe to `topic`. Dropping the receiver ends the subscription.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, NetError>;
}

type TopicMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>;

/// Deliver to every live subscriber of `topic`, pruning closed ones.
/// Returns whether any subscriber for the topic remains registered.
fn dispatch(map: &TopicMap, topic: &str, data: &[u8]) -> bool {
    let mut guard = map.lock().expect("bus topic map poisoned");
    let Some(subs) = guard.get_mut(topic) else {
        return false;
    };

    subs.retain(|tx| {
        match tx.try_send(BusMessage {
            topic: topic.to_string(),
            data: data.to_vec(),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %topic, "Bus subscriber full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });

    if subs.is_empty() {
        guard.remove(topic);
        false
    } else {
        true
    }
}

// ---------------------------------------------------------------------------
// GossipBus
// ---------------------------------------------------------------------------

/// `SignalBus` backed by the libp2p GossipSub swarm task.
///
/// Holds the command channel into the swarm and fans incoming messages out
/// to per-topic subscribers. The bus keypair is ephemeral: bus identity is
/// unlinkable to the application-level user id.
pub struct GossipBus {
    cmd_tx: mpsc::Sender<BusCommand>,
    subscribers: TopicMap,
}

impl GossipBus {
    /// Spawn the swarm and the notification dispatcher.
    pub async fn spawn(config: SwarmConfig) -> anyhow::Result<(Arc<Self>, PeerId)> {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let (cmd_tx, mut notif_rx, local_peer_id) = spawn_swarm(keypair, config).await?;

        let subscribers: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let bus = Arc::new(Self {
            cmd_tx: cmd_tx.clone(),
            subscribers: subscribers.clone(),
        });

        tokio::spawn(async move {
            while let Some(notif) = notif_rx.recv().await {
                if let BusNotification::Message { topic, data, .. } = notif {
                    if !dispatch(&subscribers, &topic, &data) {
                        // Last local subscriber went away; leave the mesh topic.
                        let _ = cmd_tx.try_send(BusCommand::Unsubscribe(topic));
                    }
                }
            }
            debug!("Bus dispatcher terminated");
        });

        Ok((bus, local_peer_id))
    }
}

#[async_trait]
impl SignalBus for GossipBus {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        self.cmd_tx
            .send(BusCommand::Publish {
                topic: topic.to_string(),
                data,
            })
            .await
            .map_err(|_| NetError::ChannelClosed)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, NetError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        {
            let mut guard = self.subscribers.lock().expect("bus topic map poisoned");
            guard.entry(topic.to_string()).or_default().push(tx);
        }
        self.cmd_tx
            .send(BusCommand::Subscribe(topic.to_string()))
            .await
            .map_err(|_| NetError::ChannelClosed)?;
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// In-process `SignalBus` for tests and single-host deployments.
///
/// Unlike GossipSub, it delivers messages back to their own publisher when
/// the publisher is subscribed — consumers must run their own self-echo
/// filtering, which is the contract the signaling layer implements anyway.
#[derive(Default)]
pub struct MemoryBus {
    topics: TopicMap,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SignalBus for MemoryBus {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetError> {
        dispatch(&self.topics, topic, &data);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, NetError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut guard = self.topics.lock().expect("bus topic map poisoned");
        guard.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bus_delivers_to_topic_subscribers() {
        let bus = MemoryBus::new();
        let mut rx1 = bus.subscribe("room:a").await.unwrap();
        let mut rx2 = bus.subscribe("room:a").await.unwrap();

        bus.publish("room:a", vec![1, 2, 3]).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().data, vec![1, 2, 3]);
        assert_eq!(rx2.recv().await.unwrap().data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn memory_bus_isolates_topics() {
        let bus = MemoryBus::new();
        let mut rx_a = bus.subscribe("room:a").await.unwrap();
        let _rx_b = bus.subscribe("room:b").await.unwrap();

        bus.publish("room:b", vec![9]).await.unwrap();
        bus.publish("room:a", vec![1]).await.unwrap();

        // Only the room:a message arrives on the room:a subscription.
        let msg = rx_a.recv().await.unwrap();
        assert_eq!(msg.topic, "room:a");
        assert_eq!(msg.data, vec![1]);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn memory_bus_prunes_dropped_subscribers() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("room:a").await.unwrap();
        drop(rx);

        // Publishing after the receiver is gone must not error, and the
        // topic entry is cleaned up.
        bus.publish("room:a", vec![1]).await.unwrap();
        assert!(bus.topics.lock().unwrap().get("room:a").is_none());
    }
}
