//! Network transport as seen by discovery.

use std::sync::{Mutex, MutexGuard};

use anaglyph_common::{DiscoveryPayload, Error, JoinStrategy, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStatus {
    pub state: ConnectionState,
    /// This peer currently owns the multiplayer session.
    pub session_owner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Peers connect to each other's addresses.
    Direct,
    /// Peers meet through a relay session.
    Relay,
}

/// Current network transport; external collaborator.
#[async_trait]
pub trait TransportState: Send + Sync {
    fn status(&self) -> TransportStatus;

    fn connection_state(&self) -> ConnectionState {
        self.status().state
    }

    /// Changes to connection state or session ownership.
    fn subscribe(&self) -> watch::Receiver<TransportStatus>;

    fn kind(&self) -> TransportKind;
    fn local_address(&self) -> String;
    fn session_identifier(&self) -> Option<String>;

    /// Starts joining the session named by a discovered payload.
    async fn join(&self, target: &DiscoveryPayload) -> Result<()>;
}

/// Payload a connected peer advertises for late joiners.
pub fn advertisement_payload(transport: &dyn TransportState) -> Result<DiscoveryPayload> {
    let payload = match transport.kind() {
        TransportKind::Direct => DiscoveryPayload::lan(transport.local_address()),
        TransportKind::Relay => {
            let session = transport
                .session_identifier()
                .ok_or_else(|| Error::config("relay transport has no session identifier"))?;
            DiscoveryPayload::relay(session)
        }
    };
    payload.validate_target()?;
    Ok(payload)
}

/// Transport driven by hand; joins are recorded and move it to `Connecting`.
#[derive(Debug)]
pub struct ManualTransport {
    kind: TransportKind,
    local_address: String,
    session: Mutex<Option<String>>,
    joins: Mutex<Vec<DiscoveryPayload>>,
    status: watch::Sender<TransportStatus>,
}

impl ManualTransport {
    pub fn new(kind: TransportKind, local_address: impl Into<String>) -> Self {
        let (status, _) = watch::channel(TransportStatus::default());
        Self {
            kind,
            local_address: local_address.into(),
            session: Mutex::new(None),
            joins: Mutex::new(Vec::new()),
            status,
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    pub fn set_session_owner(&self, owner: bool) {
        self.status.send_if_modified(|status| {
            let changed = status.session_owner != owner;
            status.session_owner = owner;
            changed
        });
    }

    pub fn set_session_identifier(&self, session: Option<String>) {
        *lock(&self.session) = session;
    }

    pub fn joins(&self) -> Vec<DiscoveryPayload> {
        lock(&self.joins).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl TransportState for ManualTransport {
    fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn session_identifier(&self) -> Option<String> {
        lock(&self.session).clone()
    }

    async fn join(&self, target: &DiscoveryPayload) -> Result<()> {
        target.validate_target()?;
        if self.connection_state() != ConnectionState::Disconnected {
            return Err(Error::protocol("already connected or connecting"));
        }
        match target.strategy() {
            JoinStrategy::Lan => info!(address = target.target(), "joining LAN session"),
            JoinStrategy::Relay => info!(session = target.target(), "joining relay session"),
        }
        lock(&self.joins).push(target.clone());
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }
}
