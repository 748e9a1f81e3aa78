//! Shared fixtures for the integration suite: a scripted mock adapter, a
//! planning factory, and context/preference builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ranging_core::adapter::{
    AdapterError, AdapterEvent, AdapterEventTx, AdapterFactory, CloseReason, RangingAdapter,
};
use ranging_core::context::{CoreContext, MonotonicClock, ServiceOptions, SessionKeyRng};
use ranging_core::event::SessionEvent;
use ranging_core::metrics::NullMetricsSink;
use ranging_core::oob::{OobConnector, UnsupportedOobConnector};
use ranging_core::CapabilityRegistry;
use ranging_types::{
    DeviceRole, PeerId, PeerTopology, PerTechnologyConfig, PreferenceBundle, RawMeasurement,
    RssiParams, RttParams, SecurityLevel, SessionConfig, SessionPreference, Technology,
    TechnologyConfig,
    UpdateRate, UwbConfigId, UwbParams,
};

pub const P1: PeerId = PeerId::from_u128(0x01);
pub const P2: PeerId = PeerId::from_u128(0x02);

// ── Mock adapter ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    /// Emit `Closed(FailedToStart)` instead of `Started`
    pub fail_start: bool,
    /// Acknowledge `stop()` but never emit `Stopped`/`Closed` (watchdog bait)
    pub ignore_stop: bool,
    pub dynamic_peers: bool,
}

/// Test-side grip on one mock adapter: inject events, inspect calls.
pub struct MockControl {
    tx: Mutex<Option<AdapterEventTx>>,
    started_config: Mutex<Option<TechnologyConfig>>,
    peers: Mutex<HashSet<PeerId>>,
    stop_calls: AtomicUsize,
    reconfigure_calls: Mutex<Vec<u32>>,
    background_timeouts: AtomicUsize,
}

impl MockControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            started_config: Mutex::new(None),
            peers: Mutex::new(HashSet::new()),
            stop_calls: AtomicUsize::new(0),
            reconfigure_calls: Mutex::new(Vec::new()),
            background_timeouts: AtomicUsize::new(0),
        })
    }

    /// The session actor creates and starts adapters asynchronously; wait
    /// until `start` has handed over the event channel.
    pub async fn wait_for_start(&self) -> AdapterEventTx {
        for _ in 0..200 {
            if let Some(tx) = self.tx.lock().unwrap().clone() {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("adapter was never started");
    }

    pub async fn emit(&self, event: AdapterEvent) {
        let tx = self.wait_for_start().await;
        tx.send(event).await.expect("session mailbox gone");
    }

    pub async fn emit_started(&self, peers: Vec<PeerId>) {
        *self.peers.lock().unwrap() = peers.iter().copied().collect();
        self.emit(AdapterEvent::Started { peers }).await;
    }

    pub async fn emit_data(&self, peer: PeerId, timestamp_ms: u64, distance_m: f64) {
        self.wait_for_start().await;
        let technology = self
            .started_config
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.technology())
            .expect("adapter was never started");
        self.emit(AdapterEvent::Data {
            peer,
            measurement: RawMeasurement::distance_only(technology, timestamp_ms, distance_m),
        })
        .await;
    }

    pub async fn emit_closed(&self, reason: CloseReason) {
        self.emit(AdapterEvent::Closed { reason }).await;
    }

    pub async fn emit_stopped(&self, peers: Vec<PeerId>) {
        for peer in &peers {
            self.peers.lock().unwrap().remove(peer);
        }
        self.emit(AdapterEvent::Stopped { peers }).await;
    }

    pub fn started_config(&self) -> Option<TechnologyConfig> {
        self.started_config.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn reconfigure_calls(&self) -> Vec<u32> {
        self.reconfigure_calls.lock().unwrap().clone()
    }

    pub fn background_timeouts(&self) -> usize {
        self.background_timeouts.load(Ordering::SeqCst)
    }

    /// Wait until the session has called `stop()` on this adapter.
    pub async fn wait_for_stop(&self) {
        for _ in 0..200 {
            if self.stop_calls() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never called stop()");
    }
}

struct MockAdapter {
    technology: Technology,
    behavior: MockBehavior,
    control: Arc<MockControl>,
}

#[async_trait]
impl RangingAdapter for MockAdapter {
    fn technology(&self) -> Technology {
        self.technology
    }

    async fn start(
        &self,
        config: TechnologyConfig,
        events: AdapterEventTx,
    ) -> Result<(), AdapterError> {
        {
            let mut tx = self.control.tx.lock().unwrap();
            if tx.is_some() {
                return Err(AdapterError::AlreadyStarted);
            }
            *tx = Some(events.clone());
        }
        *self.control.started_config.lock().unwrap() = Some(config);

        if self.behavior.fail_start {
            let events = events.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(AdapterEvent::Closed {
                        reason: CloseReason::FailedToStart,
                    })
                    .await;
            });
        }
        // Well-behaved mocks leave `Started` to the test script
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.control.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.ignore_stop {
            return Ok(());
        }
        let peers: Vec<PeerId> = self.control.peers.lock().unwrap().drain().collect();
        let tx = self.control.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(AdapterEvent::Stopped { peers }).await;
            let _ = tx
                .send(AdapterEvent::Closed {
                    reason: CloseReason::LocalRequest,
                })
                .await;
        }
        Ok(())
    }

    fn supports_dynamic_peers(&self) -> bool {
        self.behavior.dynamic_peers
    }

    async fn add_peer(&self, config: TechnologyConfig) -> Result<(), AdapterError> {
        if !self.behavior.dynamic_peers {
            return Err(AdapterError::Unsupported);
        }
        let mut peers = self.control.peers.lock().unwrap();
        for peer in config.peers() {
            peers.insert(peer);
        }
        Ok(())
    }

    async fn remove_peer(&self, peer: PeerId) -> Result<(), AdapterError> {
        if !self.behavior.dynamic_peers {
            return Err(AdapterError::Unsupported);
        }
        self.control.peers.lock().unwrap().remove(&peer);
        let tx = self.control.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(AdapterEvent::Stopped { peers: vec![peer] }).await;
        }
        Ok(())
    }

    async fn reconfigure_interval(&self, interval_ms: u32) -> Result<(), AdapterError> {
        self.control.reconfigure_calls.lock().unwrap().push(interval_ms);
        Ok(())
    }

    fn background_timeout(&self) {
        self.control.background_timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Planning factory ──────────────────────────────────────────────────────────

/// Hands out mock adapters in plan order per technology; unplanned
/// technologies are "not supported on this device".
pub struct MockFactory {
    plans: Mutex<Vec<(Technology, MockBehavior, Arc<MockControl>)>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(Vec::new()),
        })
    }

    pub fn plan(&self, technology: Technology, behavior: MockBehavior) -> Arc<MockControl> {
        let control = MockControl::new();
        self.plans
            .lock()
            .unwrap()
            .push((technology, behavior, control.clone()));
        control
    }
}

impl AdapterFactory for MockFactory {
    fn create(&self, technology: Technology) -> Option<Box<dyn RangingAdapter>> {
        let mut plans = self.plans.lock().unwrap();
        let idx = plans.iter().position(|(tech, _, _)| *tech == technology)?;
        let (technology, behavior, control) = plans.remove(idx);
        Some(Box::new(MockAdapter {
            technology,
            behavior,
            control,
        }))
    }
}

// ── Context & preference builders ─────────────────────────────────────────────

/// Fixed key source so OOB selections are reproducible in tests.
pub struct FixedKeyRng(pub u8);

impl SessionKeyRng for FixedKeyRng {
    fn fill(&self, buf: &mut [u8]) {
        buf.fill(self.0);
    }
}

pub fn test_options() -> ServiceOptions {
    ServiceOptions {
        watchdog_ms: 10_000,
        min_fusion_window: 3,
        max_fusion_window: 5,
        default_update_rate: UpdateRate::Normal,
        background_timeout_ms: 15_000,
        measurement_queue_depth: 64,
        max_sessions_per_client: 8,
    }
}

pub fn test_context(factory: Arc<MockFactory>, options: ServiceOptions) -> CoreContext {
    test_context_with_oob(factory, Arc::new(UnsupportedOobConnector), options)
}

pub fn test_context_with_oob(
    factory: Arc<MockFactory>,
    oob: Arc<dyn OobConnector>,
    options: ServiceOptions,
) -> CoreContext {
    CoreContext {
        clock: Arc::new(MonotonicClock::new()),
        key_rng: Arc::new(FixedKeyRng(0x5A)),
        capabilities: Arc::new(CapabilityRegistry::new()),
        adapters: factory,
        oob,
        metrics: Arc::new(NullMetricsSink),
        options,
    }
}

pub fn uwb_unicast_config(peer: PeerId) -> TechnologyConfig {
    TechnologyConfig::new(
        PeerTopology::Unicast(peer),
        PerTechnologyConfig::Uwb(UwbParams {
            session_id: 1,
            config_id: UwbConfigId::UnicastDsTwr,
            channel: 9,
            preamble_index: 10,
            slot_duration_ms: 2,
            update_rate: UpdateRate::Normal,
            security: SecurityLevel::Basic,
            session_key: None,
            device_role: DeviceRole::Initiator,
        }),
    )
    .expect("valid test config")
}

pub fn rtt_unicast_config(peer: PeerId) -> TechnologyConfig {
    TechnologyConfig::new(
        PeerTopology::Unicast(peer),
        PerTechnologyConfig::Rtt(RttParams {
            service_name: "ranging".into(),
            update_rate: UpdateRate::Normal,
            periodic: true,
        }),
    )
    .expect("valid test config")
}

pub fn rssi_unicast_config(peer: PeerId) -> TechnologyConfig {
    TechnologyConfig::new(
        PeerTopology::Unicast(peer),
        PerTechnologyConfig::Rssi(RssiParams {
            update_rate: UpdateRate::Normal,
        }),
    )
    .expect("valid test config")
}

pub fn raw_preference(configs: Vec<TechnologyConfig>, config: SessionConfig) -> SessionPreference {
    SessionPreference {
        role: DeviceRole::Initiator,
        config,
        bundle: PreferenceBundle::Raw { configs },
    }
}

// ── Event helpers ─────────────────────────────────────────────────────────────

pub async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    // Generous bound: paused-clock tests auto-advance through the 10s
    // watchdog before this fires
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream closed")
}

/// Skip Data events until the next lifecycle event.
pub async fn next_lifecycle(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match next_event(rx).await {
            SessionEvent::Data { .. } => continue,
            other => return other,
        }
    }
}
