//! Room-scoped signaling channel.
//!
//! A [`RoomChannel`] binds one room's topic on the bus: outbound helpers
//! wrap signals in envelopes; the inbound side decodes, then drops
//! envelopes for other rooms and everything the local user published
//! itself. The room id is the only scope — exactly two parties know it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use aparte_net::{NetError, SignalBus};
use aparte_shared::protocol::{RoomSignal, SdpKind, SignalEnvelope};
use aparte_shared::types::{RoomId, UserId};

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Bus error: {0}")]
    Bus(#[from] NetError),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Filtered room events handed to the session runtime.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub sender: UserId,
    pub signal: RoomSignal,
}

pub struct RoomChannel {
    room_id: RoomId,
    local_user: UserId,
    bus: Arc<dyn SignalBus>,
    topic: String,
}

impl RoomChannel {
    /// Subscribe to the room topic and announce presence.
    ///
    /// Returns the channel plus the filtered inbound event stream. The
    /// subscription ends when the receiver (and the forwarding task with
    /// it) is dropped.
    pub async fn open(
        bus: Arc<dyn SignalBus>,
        room_id: RoomId,
        local_user: UserId,
    ) -> Result<(Self, mpsc::Receiver<RoomEvent>), SignalingError> {
        let topic = room_id.to_topic();
        let mut bus_rx = bus.subscribe(&topic).await?;

        let (event_tx, event_rx) = mpsc::channel(64);
        {
            let room_id = room_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = bus_rx.recv().await {
                    let envelope = match SignalEnvelope::from_bytes(&msg.data) {
                        Ok(env) => env,
                        Err(e) => {
                            debug!(error = %e, "Dropping undecodable signaling message");
                            continue;
                        }
                    };

                    if envelope.room_id != room_id {
                        debug!(
                            got = %envelope.room_id,
                            "Dropping signal for another room"
                        );
                        continue;
                    }
                    if envelope.sender == local_user {
                        // Self-echo suppression
                        continue;
                    }

                    if event_tx
                        .send(RoomEvent {
                            sender: envelope.sender,
                            signal: envelope.signal,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                debug!("Room signal forwarding ended");
            });
        }

        let channel = Self {
            room_id,
            local_user,
            bus,
            topic,
        };

        // Presence announcement so an already-listening initiator can
        // re-send its offer to us.
        channel.send(RoomSignal::Ready).await?;

        Ok((channel, event_rx))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn send_ready(&self) -> Result<(), SignalingError> {
        self.send(RoomSignal::Ready).await
    }

    pub async fn send_offer(&self, sdp: String) -> Result<(), SignalingError> {
        self.send(RoomSignal::Sdp {
            kind: SdpKind::Offer,
            sdp,
        })
        .await
    }

    pub async fn send_answer(&self, sdp: String) -> Result<(), SignalingError> {
        self.send(RoomSignal::Sdp {
            kind: SdpKind::Answer,
            sdp,
        })
        .await
    }

    pub async fn send_ice(&self, candidate: String) -> Result<(), SignalingError> {
        self.send(RoomSignal::Ice { candidate }).await
    }

    pub async fn send_end(&self) -> Result<(), SignalingError> {
        self.send(RoomSignal::EndSession).await
    }

    async fn send(&self, signal: RoomSignal) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope {
            room_id: self.room_id.clone(),
            sender: self.local_user,
            signal,
        };
        let bytes = envelope
            .to_bytes()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        if let Err(e) = self.bus.publish(&self.topic, bytes).await {
            warn!(room = %self.room_id, error = %e, "Signal publish failed");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aparte_net::MemoryBus;
    use aparte_shared::types::ChatMode;

    fn room() -> RoomId {
        RoomId::mint(&UserId([1u8; 32]), &UserId([2u8; 32]), ChatMode::Chat)
    }

    #[tokio::test]
    async fn self_echo_is_suppressed() {
        let bus = MemoryBus::new();
        let alice = UserId([1u8; 32]);
        let room_id = room();

        let (channel, mut events) =
            RoomChannel::open(bus.clone(), room_id, alice).await.unwrap();

        // The MemoryBus loops every publish back to all subscribers,
        // including the publisher itself — nothing may surface locally.
        channel.send_ready().await.unwrap();
        channel.send_offer("v=0".into()).await.unwrap();

        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peers_exchange_signals() {
        let bus = MemoryBus::new();
        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);
        let room_id = room();

        let (alice_channel, mut alice_events) =
            RoomChannel::open(bus.clone(), room_id.clone(), alice)
                .await
                .unwrap();
        let (_bob_channel, mut bob_events) =
            RoomChannel::open(bus.clone(), room_id, bob).await.unwrap();

        // Bob's open() announced readiness; Alice sees it.
        let event = alice_events.recv().await.unwrap();
        assert_eq!(event.sender, bob);
        assert!(matches!(event.signal, RoomSignal::Ready));

        alice_channel.send_offer("v=0 offer".into()).await.unwrap();
        let event = bob_events.recv().await.unwrap();
        assert_eq!(event.sender, alice);
        match event.signal {
            RoomSignal::Sdp { kind, sdp } => {
                assert_eq!(kind, SdpKind::Offer);
                assert_eq!(sdp, "v=0 offer");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_rooms_are_filtered() {
        let bus = MemoryBus::new();
        let alice = UserId([1u8; 32]);
        let bob = UserId([2u8; 32]);

        let room_a = room();
        let room_b = RoomId::mint(&alice, &bob, ChatMode::Voice);

        let (_alice_channel, mut alice_events) =
            RoomChannel::open(bus.clone(), room_a.clone(), alice)
                .await
                .unwrap();

        // A mislabeled envelope published raw on room A's topic but
        // claiming room B must be dropped by the room filter.
        let forged = SignalEnvelope {
            room_id: room_b,
            sender: bob,
            signal: RoomSignal::EndSession,
        };
        bus.publish(&room_a.to_topic(), forged.to_bytes().unwrap())
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(alice_events.try_recv().is_err());
    }
}
