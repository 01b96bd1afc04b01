//! Short-range session discovery: the radio primitive and the state machine
//! that drives it from the network connection state.

#[cfg(feature = "mdns")]
pub mod mdns;
pub mod state_machine;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::RadioResult;

#[cfg(feature = "mdns")]
pub use mdns::MdnsDiscovery;
pub use state_machine::{SessionDiscovery, SessionDiscoveryState};

/// Broadcast/scan primitive (Bluetooth/Wi-Fi style advertisement).
#[async_trait]
pub trait DiscoverySession: Send + Sync {
    async fn start_advertising(&self, payload: Bytes) -> RadioResult;
    async fn stop_advertising(&self) -> RadioResult;
    async fn start_scanning(&self) -> RadioResult;
    async fn stop_scanning(&self) -> RadioResult;
    /// Payloads advertised by other peers, delivered while scanning.
    fn subscribe_discovered(&self) -> broadcast::Receiver<Bytes>;
}

/// What the state machine believes the radio is doing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioActivity {
    pub advertising: Option<Bytes>,
    pub scanning: bool,
}

impl RadioActivity {
    pub fn is_advertising(&self) -> bool {
        self.advertising.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.advertising.is_none() && !self.scanning
    }
}
