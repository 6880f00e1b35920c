// Realtime publish/subscribe substrate client, built on libp2p GossipSub
// over QUIC. The rest of the workspace talks to it through the `SignalBus`
// trait; `MemoryBus` provides the same contract in-process for tests and
// single-host deployments.

pub mod behaviour;
pub mod bus;
pub mod discovery;
pub mod swarm;
pub mod transport;

pub use behaviour::{BusBehaviour, BusBehaviourEvent};
pub use bus::{BusMessage, GossipBus, MemoryBus, NetError, SignalBus};
pub use discovery::load_bootstrap_peers;
pub use swarm::{spawn_swarm, BusCommand, BusNotification, SwarmConfig};
pub use transport::build_swarm;
