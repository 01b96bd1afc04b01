#![forbid(unsafe_code)]
//! Peer colocation: session discovery over a short-range radio, shared
//! spatial anchors replicated between peers, and tracking-space alignment.

pub mod anchor;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod guard;
pub mod registry;
pub mod replication;
pub mod transport;
pub mod world_lock;

pub use anchor::NetworkedAnchor;
pub use config::{AnchorConfig, ColocationConfig, CoordinatorConfig, DiscoveryConfig};
pub use coordinator::{ColocationCoordinator, StartOutcome};
#[cfg(feature = "mdns")]
pub use discovery::MdnsDiscovery;
pub use discovery::{DiscoverySession, RadioActivity, SessionDiscovery, SessionDiscoveryState};
pub use error::{AnchorError, Interrupted, RadioError, RadioResult, ReplicationError};
pub use guard::{retry_until_success, Attempt, Liveness};
pub use registry::AnchorRegistry;
pub use replication::{
    EntityId, LifecycleEvent, LoopbackNetwork, LoopbackReplication, PeerId, ReplicaLink,
    Replication,
};
pub use transport::{
    advertisement_payload, ConnectionState, ManualTransport, TransportKind, TransportState,
    TransportStatus,
};
pub use world_lock::WorldLockAnchor;
