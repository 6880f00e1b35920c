//! Composed libp2p `NetworkBehaviour` for the Aparté signaling bus.
//!
//! Combines GossipSub (topic-scoped broadcast for signaling and consent
//! messages) with Identify (protocol negotiation). The bus carries only
//! small control-plane payloads; media flows peer-to-peer over WebRTC and
//! never touches the swarm.

use libp2p::{gossipsub, identify, swarm::NetworkBehaviour};

/// Composed network behaviour for Aparté bus nodes.
///
/// All sub-behaviours are driven by the single swarm event loop.
/// Construction is handled by [`super::transport::build_swarm`] via
/// `SwarmBuilder`.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BusBehaviourEvent")]
pub struct BusBehaviour {
    /// Pub/sub messaging for room signaling and consent handshakes
    pub gossipsub: gossipsub::Behaviour,
    /// Protocol identification and capability advertisement
    pub identify: identify::Behaviour,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum BusBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
}

impl From<gossipsub::Event> for BusBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        BusBehaviourEvent::Gossipsub(event)
    }
}

impl From<identify::Event> for BusBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        BusBehaviourEvent::Identify(event)
    }
}
