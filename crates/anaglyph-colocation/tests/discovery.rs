//! Session discovery state machine against a recording radio.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anaglyph_colocation::{
    ConnectionState, DiscoveryConfig, DiscoverySession, ManualTransport, RadioError,
    RadioResult, SessionDiscovery, SessionDiscoveryState, TransportKind,
};
use anaglyph_common::DiscoveryPayload;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LOCAL_ADDRESS: &str = "192.168.1.5";

#[derive(Debug, Clone, PartialEq, Eq)]
enum RadioCall {
    StartAdvertising(String),
    StopAdvertising,
    StartScanning,
    StopScanning,
}

struct RecordingRadio {
    latency: Duration,
    calls: Mutex<Vec<RadioCall>>,
    fail_advertising: AtomicBool,
    busy: AtomicBool,
    overlaps: AtomicUsize,
    discovered: broadcast::Sender<Bytes>,
}

impl RecordingRadio {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            calls: Mutex::new(Vec::new()),
            fail_advertising: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            discovered: broadcast::channel(8).0,
        })
    }

    fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    async fn perform(&self, call: RadioCall) -> RadioResult {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        self.busy.store(false, Ordering::SeqCst);

        let fail = matches!(call, RadioCall::StartAdvertising(_))
            && self.fail_advertising.swap(false, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);
        if fail {
            Err(RadioError::new(7, "advertiser unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DiscoverySession for RecordingRadio {
    async fn start_advertising(&self, payload: Bytes) -> RadioResult {
        let text = String::from_utf8(payload.to_vec()).unwrap();
        self.perform(RadioCall::StartAdvertising(text)).await
    }

    async fn stop_advertising(&self) -> RadioResult {
        self.perform(RadioCall::StopAdvertising).await
    }

    async fn start_scanning(&self) -> RadioResult {
        self.perform(RadioCall::StartScanning).await
    }

    async fn stop_scanning(&self) -> RadioResult {
        self.perform(RadioCall::StopScanning).await
    }

    fn subscribe_discovered(&self) -> broadcast::Receiver<Bytes> {
        self.discovered.subscribe()
    }
}

struct Fixture {
    radio: Arc<RecordingRadio>,
    transport: Arc<ManualTransport>,
    discovery: Arc<SessionDiscovery>,
}

fn fixture_with(latency: Duration, config: DiscoveryConfig) -> Fixture {
    let radio = RecordingRadio::new(latency);
    let transport = Arc::new(ManualTransport::new(TransportKind::Direct, LOCAL_ADDRESS));
    let discovery = Arc::new(SessionDiscovery::new(
        radio.clone(),
        transport.clone(),
        config,
    ));
    Fixture {
        radio,
        transport,
        discovery,
    }
}

fn fixture() -> Fixture {
    fixture_with(Duration::ZERO, DiscoveryConfig::default())
}

impl Fixture {
    fn set_state(&self, state: ConnectionState) {
        self.transport.set_state(state);
        self.discovery.update_state();
    }

    fn assert_settled_in(&self, state: SessionDiscoveryState) {
        let activity = self.discovery.radio_activity();
        assert_eq!(self.discovery.state(), state);
        match state {
            SessionDiscoveryState::Disconnected => {
                assert!(activity.scanning);
                assert!(!activity.is_advertising());
            }
            SessionDiscoveryState::Connected => {
                assert!(!activity.scanning);
                assert_eq!(
                    activity.advertising,
                    Some(DiscoveryPayload::lan(LOCAL_ADDRESS).to_bytes())
                );
            }
            SessionDiscoveryState::Connecting | SessionDiscoveryState::Disabled => {
                assert!(activity.is_idle());
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_scans_after_backoff() {
    let fx = fixture();
    let started = Instant::now();
    fx.discovery.update_state();
    assert_eq!(fx.discovery.state(), SessionDiscoveryState::Disconnected);

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert!(fx.radio.calls().is_empty());

    fx.discovery.settled().await;
    assert_eq!(fx.radio.calls(), vec![RadioCall::StartScanning]);
    assert!(started.elapsed() >= Duration::from_secs(3));
    fx.assert_settled_in(SessionDiscoveryState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connected_advertises_lan_payload() {
    let fx = fixture();
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;

    assert_eq!(
        fx.radio.calls(),
        vec![RadioCall::StartAdvertising("IP:192.168.1.5".into())]
    );
    fx.assert_settled_in(SessionDiscoveryState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_backoff_never_scans() {
    let fx = fixture();
    let started = Instant::now();
    fx.set_state(ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(1)).await;

    fx.set_state(ConnectionState::Connecting);
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;

    assert!(!fx.radio.calls().contains(&RadioCall::StartScanning));
    assert_eq!(
        fx.radio.calls(),
        vec![RadioCall::StartAdvertising("IP:192.168.1.5".into())]
    );
    assert!(started.elapsed() < Duration::from_secs(3));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!fx.radio.calls().contains(&RadioCall::StartScanning));
}

#[tokio::test(start_paused = true)]
async fn test_equal_state_is_noop() {
    let fx = fixture();
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;

    for _ in 0..3 {
        fx.discovery.update_state();
    }
    fx.discovery.settled().await;
    assert_eq!(fx.radio.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connecting_halts_scanning_and_advertising() {
    let fx = fixture();
    fx.set_state(ConnectionState::Disconnected);
    fx.discovery.settled().await;
    fx.set_state(ConnectionState::Connecting);
    fx.discovery.settled().await;
    assert_eq!(
        fx.radio.calls(),
        vec![RadioCall::StartScanning, RadioCall::StopScanning]
    );
    fx.assert_settled_in(SessionDiscoveryState::Connecting);

    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;
    fx.set_state(ConnectionState::Connecting);
    fx.discovery.settled().await;
    assert_eq!(fx.radio.calls().last(), Some(&RadioCall::StopAdvertising));
    fx.assert_settled_in(SessionDiscoveryState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_disable_and_pause_stop_everything() {
    let fx = fixture();
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;

    fx.discovery.set_enabled(false);
    fx.discovery.settled().await;
    assert_eq!(fx.radio.calls().last(), Some(&RadioCall::StopAdvertising));
    fx.assert_settled_in(SessionDiscoveryState::Disabled);

    fx.discovery.set_enabled(true);
    fx.discovery.settled().await;
    fx.assert_settled_in(SessionDiscoveryState::Connected);

    fx.discovery.set_paused(true);
    fx.discovery.settled().await;
    fx.assert_settled_in(SessionDiscoveryState::Disabled);
}

#[tokio::test(start_paused = true)]
async fn test_radio_failure_is_logged_not_retried() {
    let fx = fixture();
    fx.radio.fail_advertising.store(true, Ordering::SeqCst);
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;

    assert!(!fx.discovery.radio_activity().is_advertising());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fx.radio.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_owner_only_advertising() {
    let config = DiscoveryConfig {
        advertise_as_session_owner_only: true,
        ..DiscoveryConfig::default()
    };
    let fx = fixture_with(Duration::ZERO, config);
    fx.set_state(ConnectionState::Connected);
    fx.discovery.settled().await;
    assert!(fx.radio.calls().is_empty());
    assert_eq!(fx.discovery.state(), SessionDiscoveryState::Disabled);

    fx.transport.set_session_owner(true);
    fx.discovery.update_state();
    fx.discovery.settled().await;
    fx.assert_settled_in(SessionDiscoveryState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_transitions_never_overlap_and_settle_on_last_state() {
    let states = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
    ];

    // Small LCG so every run walks a different but reproducible schedule.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move |bound: u64| {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (seed >> 33) % bound
    };

    for _ in 0..40 {
        let fx = fixture_with(Duration::from_millis(150), DiscoveryConfig::default());
        let steps = 1 + next(8);
        let mut enabled = true;
        for _ in 0..steps {
            match next(5) {
                4 => {
                    enabled = !enabled;
                    fx.discovery.set_enabled(enabled);
                }
                pick => fx.set_state(states[pick as usize]),
            }
            match next(3) {
                0 => {}
                1 => tokio::time::sleep(Duration::from_millis(200)).await,
                _ => tokio::time::sleep(Duration::from_secs(4)).await,
            }
        }
        fx.discovery.settled().await;

        assert_eq!(fx.radio.overlaps(), 0);
        fx.assert_settled_in(fx.discovery.state());
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovered_session_is_joined_while_disconnected() {
    let fx = fixture();
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(fx.discovery.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(fx.discovery.radio_activity().scanning);

    fx.radio
        .discovered
        .send(DiscoveryPayload::lan("10.0.0.7").to_bytes())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fx.transport.joins(), vec![DiscoveryPayload::lan("10.0.0.7")]);
    assert_eq!(fx.discovery.state(), SessionDiscoveryState::Connecting);
    fx.discovery.settled().await;
    fx.assert_settled_in(SessionDiscoveryState::Connecting);

    shutdown.cancel();
    runner.await.unwrap();
    assert_eq!(fx.discovery.state(), SessionDiscoveryState::Disabled);
    assert!(fx.discovery.radio_activity().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_discovered_payloads_outside_scanning_or_garbled_are_ignored() {
    let fx = fixture();
    fx.set_state(ConnectionState::Connected);
    fx.discovery.handle_discovered(b"IP:10.0.0.8").await;
    assert!(fx.transport.joins().is_empty());

    fx.set_state(ConnectionState::Disconnected);
    fx.discovery.handle_discovered(b"Bogus:10.0.0.8").await;
    fx.discovery.handle_discovered(b"IP:").await;
    assert!(fx.transport.joins().is_empty());

    fx.discovery.handle_discovered(b"Relay:room-42").await;
    assert_eq!(
        fx.transport.joins(),
        vec![DiscoveryPayload::relay("room-42")]
    );
}
