//! Session discovery state machine.
//!
//! Maps the transport's connection state onto radio work:
//! - DISCONNECTED: stop advertising, back off, start scanning
//! - CONNECTING: stop scanning (and any leftover advertisement)
//! - CONNECTED: stop scanning, advertise this session for late joiners
//! - DISABLED: stop both (component disabled or app paused)
//!
//! Each transition runs as its own sequence of radio calls. A new transition
//! cancels the token of the previous one and is chained after it, so radio
//! calls never overlap and a superseded sequence skips its remaining steps.

use std::sync::{Arc, Mutex, MutexGuard};

use anaglyph_common::DiscoveryPayload;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DiscoverySession, RadioActivity};
use crate::config::DiscoveryConfig;
use crate::error::Interrupted;
use crate::guard::Liveness;
use crate::transport::{advertisement_payload, ConnectionState, TransportState, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionDiscoveryState {
    #[default]
    Disabled,
    Disconnected,
    Connecting,
    Connected,
}

impl SessionDiscoveryState {
    /// Target state for the given inputs.
    pub fn evaluate(
        enabled: bool,
        paused: bool,
        status: TransportStatus,
        advertise_as_session_owner_only: bool,
    ) -> Self {
        if !enabled || paused {
            return Self::Disabled;
        }
        match status.state {
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => {
                if advertise_as_session_owner_only && !status.session_owner {
                    Self::Disabled
                } else {
                    Self::Connected
                }
            }
        }
    }
}

#[derive(Debug)]
struct Control {
    enabled: bool,
    paused: bool,
    state: SessionDiscoveryState,
    generation: u64,
    token: CancellationToken,
    tail: Option<JoinHandle<()>>,
}

/// Everything a transition sequence needs, detached from `SessionDiscovery`.
#[derive(Clone)]
struct Sequencer {
    radio: Arc<dyn DiscoverySession>,
    transport: Arc<dyn TransportState>,
    activity: Arc<Mutex<RadioActivity>>,
    config: DiscoveryConfig,
}

pub struct SessionDiscovery {
    sequencer: Sequencer,
    control: Mutex<Control>,
    completed: Arc<watch::Sender<u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionDiscovery {
    /// Starts enabled and in `Disabled`; call [`update_state`](Self::update_state)
    /// or [`run`](Self::run) to begin.
    pub fn new(
        radio: Arc<dyn DiscoverySession>,
        transport: Arc<dyn TransportState>,
        config: DiscoveryConfig,
    ) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            sequencer: Sequencer {
                radio,
                transport,
                activity: Arc::new(Mutex::new(RadioActivity::default())),
                config,
            },
            control: Mutex::new(Control {
                enabled: true,
                paused: false,
                state: SessionDiscoveryState::Disabled,
                generation: 0,
                token: CancellationToken::new(),
                tail: None,
            }),
            completed: Arc::new(completed),
        }
    }

    pub fn state(&self) -> SessionDiscoveryState {
        lock(&self.control).state
    }

    /// Radio work as last confirmed by the radio.
    pub fn radio_activity(&self) -> RadioActivity {
        lock(&self.sequencer.activity).clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.control).enabled = enabled;
        self.update_state();
    }

    pub fn set_paused(&self, paused: bool) {
        lock(&self.control).paused = paused;
        self.update_state();
    }

    /// Re-evaluates the target state and schedules its sequence if it changed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update_state(&self) {
        let status = self.sequencer.transport.status();
        let mut control = lock(&self.control);
        let target = SessionDiscoveryState::evaluate(
            control.enabled,
            control.paused,
            status,
            self.sequencer.config.advertise_as_session_owner_only,
        );
        if target == control.state {
            return;
        }

        debug!(from = ?control.state, to = ?target, "discovery state change");
        control.state = target;
        control.token.cancel();
        control.token = CancellationToken::new();
        control.generation += 1;

        let generation = control.generation;
        let liveness = Liveness::from_token(control.token.clone());
        let previous = control.tail.take();
        let sequencer = self.sequencer.clone();
        let completed = self.completed.clone();

        control.tail = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(reason) = sequencer.run(target, &liveness).await {
                debug!(state = ?target, %reason, "discovery transition superseded");
            }
            completed.send_if_modified(|done| {
                let advanced = *done < generation;
                if advanced {
                    *done = generation;
                }
                advanced
            });
        }));
    }

    /// Resolves once the most recently scheduled transition has finished.
    pub async fn settled(&self) {
        let generation = lock(&self.control).generation;
        let mut completed = self.completed.subscribe();
        let _ = completed.wait_for(|done| *done >= generation).await;
    }

    /// Joins the session a scanning peer just discovered.
    pub async fn handle_discovered(&self, raw: &[u8]) {
        let state = self.state();
        if state != SessionDiscoveryState::Disconnected {
            debug!(?state, "ignoring discovered session outside of scanning");
            return;
        }

        let payload = match DiscoveryPayload::from_bytes(raw) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable discovery payload");
                return;
            }
        };
        info!(%payload, "discovered session");

        let transport = &self.sequencer.transport;
        if transport.connection_state() != ConnectionState::Disconnected {
            return;
        }
        if let Err(err) = transport.join(&payload).await {
            warn!(%payload, error = %err, "couldn't join discovered session");
        }
    }

    /// Follows transport changes and discovered sessions until `shutdown`.
    ///
    /// On shutdown the machine is disabled and its radio work wound down.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut status = self.sequencer.transport.subscribe();
        let mut discovered = self.sequencer.radio.subscribe_discovered();
        let mut status_open = true;
        let mut radio_open = true;

        self.update_state();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        warn!("transport status channel closed");
                        status_open = false;
                    }
                    self.update_state();
                }
                received = discovered.recv(), if radio_open => match received {
                    Ok(raw) => self.handle_discovered(&raw).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "discovery events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("discovery event channel closed");
                        radio_open = false;
                    }
                },
            }
        }

        self.set_enabled(false);
        self.settled().await;
    }
}

impl Drop for SessionDiscovery {
    fn drop(&mut self) {
        lock(&self.control).token.cancel();
    }
}

impl Sequencer {
    async fn run(
        &self,
        target: SessionDiscoveryState,
        liveness: &Liveness,
    ) -> Result<(), Interrupted> {
        match target {
            SessionDiscoveryState::Disconnected => {
                self.halt_advertising(liveness).await?;
                liveness.sleep(self.config.scan_backoff()).await?;
                self.start_scanning(liveness).await?;
            }
            SessionDiscoveryState::Connecting => {
                self.halt_scanning(liveness).await?;
                self.halt_advertising(liveness).await?;
            }
            SessionDiscoveryState::Connected => {
                self.halt_scanning(liveness).await?;
                match advertisement_payload(self.transport.as_ref()) {
                    Ok(payload) => self.start_advertising(&payload, liveness).await?,
                    Err(err) => warn!(error = %err, "nothing to advertise"),
                }
            }
            SessionDiscoveryState::Disabled => {
                self.halt_advertising(liveness).await?;
                self.halt_scanning(liveness).await?;
            }
        }
        Ok(())
    }

    fn activity(&self) -> MutexGuard<'_, RadioActivity> {
        lock(&self.activity)
    }

    async fn start_scanning(&self, liveness: &Liveness) -> Result<(), Interrupted> {
        if self.activity().scanning {
            return Ok(());
        }
        liveness.check()?;
        match self.radio.start_scanning().await {
            Ok(()) => {
                self.activity().scanning = true;
                info!("scanning started");
            }
            Err(err) => warn!(error = %err, "couldn't start scanning"),
        }
        Ok(())
    }

    async fn halt_scanning(&self, liveness: &Liveness) -> Result<(), Interrupted> {
        if !self.activity().scanning {
            return Ok(());
        }
        liveness.check()?;
        match self.radio.stop_scanning().await {
            Ok(()) => {
                self.activity().scanning = false;
                info!("scanning halted");
            }
            Err(err) => warn!(error = %err, "couldn't halt scanning"),
        }
        Ok(())
    }

    async fn start_advertising(
        &self,
        payload: &DiscoveryPayload,
        liveness: &Liveness,
    ) -> Result<(), Interrupted> {
        let bytes = payload.to_bytes();
        let current = self.activity().advertising.clone();
        match current {
            Some(active) if active == bytes => return Ok(()),
            Some(_) => self.halt_advertising(liveness).await?,
            None => {}
        }
        liveness.check()?;
        match self.radio.start_advertising(bytes.clone()).await {
            Ok(()) => {
                self.activity().advertising = Some(bytes);
                info!(%payload, "advertisement started");
            }
            Err(err) => warn!(%payload, error = %err, "couldn't start advertisement"),
        }
        Ok(())
    }

    async fn halt_advertising(&self, liveness: &Liveness) -> Result<(), Interrupted> {
        if self.activity().advertising.is_none() {
            return Ok(());
        }
        liveness.check()?;
        match self.radio.stop_advertising().await {
            Ok(()) => {
                self.activity().advertising = None::<Bytes>;
                info!("advertisement halted");
            }
            Err(err) => warn!(error = %err, "couldn't halt advertisement"),
        }
        Ok(())
    }
}
