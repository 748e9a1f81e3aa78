//! # session
//!
//! The per-client session state machine.
//!
//! Each session is an actor: one spawned task owns every piece of mutable
//! state and drains a single mailbox. Client commands arrive on one channel,
//! adapter callbacks are forwarded onto another, and `tokio::select!` over
//! both (plus the watchdog and background timers) is the serial execution
//! context the concurrency model requires — no lock is ever held across an
//! await.
//!
//! ## States
//! `Created → [OobDiscovering →] Starting → Running → Stopping → Closed`
//!
//! - first adapter `Started` flips `Starting → Running` and emits
//!   `SessionStarted`
//! - every adapter `Started` emits `TechnologyStarted`
//! - all adapters failing before any start ends in `SessionStopped(Unsupported)`
//! - `stop` fans out to every adapter and waits for each `Closed` under a
//!   watchdog; stragglers are force-closed with reason `Error`
//!
//! A closed client event channel means the client is gone; that drives the
//! same stop path as an explicit request.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ranging_types::{
    DeviceHandle, DeviceRole, IntervalRange, PeerId, PreferenceBundle, RawMeasurement,
    SecurityLevel, SessionConfig, SessionPreference, Technology, TechnologyCapabilities,
    TechnologyConfig, Measurement, NotificationKind,
};

use crate::adapter::{AdapterEvent, CloseReason, RangingAdapter};
use crate::context::CoreContext;
use crate::error::RangingError;
use crate::event::{SessionEvent, StopReason};
use crate::filter::FilterParams;
use crate::fusion::{Fuser, FusionEngine};
use crate::metrics::{MetricKind, MetricRecord};
use crate::oob::{local_envelope, select_uwb, SelectionRequest};

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; the full uuid is in the serialized record
        let hex = self.0.simple().to_string();
        write!(f, "sess:{}", &hex[..8])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum Command {
    Stop,
    AddPeer {
        config: TechnologyConfig,
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    RemovePeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    ReconfigureInterval {
        interval_ms: u32,
        reply: oneshot::Sender<Result<(), RangingError>>,
    },
    SetForeground {
        foreground: bool,
    },
}

/// Client-side grip on a running session. Cloneable; the registry keeps one.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Always accepted; drives the session to Closed. Safe to call twice.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    pub async fn add_peer(&self, config: TechnologyConfig) -> Result<(), RangingError> {
        self.request(|reply| Command::AddPeer { config, reply }).await
    }

    pub async fn remove_peer(&self, peer: PeerId) -> Result<(), RangingError> {
        self.request(|reply| Command::RemovePeer { peer, reply }).await
    }

    pub async fn reconfigure_interval(&self, interval_ms: u32) -> Result<(), RangingError> {
        self.request(|reply| Command::ReconfigureInterval { interval_ms, reply })
            .await
    }

    pub(crate) async fn set_foreground(&self, foreground: bool) {
        let _ = self
            .commands
            .send(Command::SetForeground { foreground })
            .await;
    }

    async fn request<F>(&self, make: F) -> Result<(), RangingError>
    where
        F: FnOnce(oneshot::Sender<Result<(), RangingError>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| RangingError::SessionClosed)?;
        reply_rx.await.map_err(|_| RangingError::SessionClosed)?
    }
}

// ── Preference validation ─────────────────────────────────────────────────────

/// Synchronous checks before anything is spawned.
pub(crate) fn validate_preference(preference: &SessionPreference) -> Result<(), RangingError> {
    match &preference.bundle {
        PreferenceBundle::Raw { configs } => {
            if configs.is_empty() {
                return Err(RangingError::InvalidArgument(
                    "raw preference carries no technology configs".into(),
                ));
            }
        }
        PreferenceBundle::Oob { peers, .. } => {
            if peers.is_empty() {
                return Err(RangingError::InvalidArgument(
                    "oob preference carries no device handles".into(),
                ));
            }
            let mut seen = HashSet::new();
            for handle in peers {
                if !seen.insert(handle.peer_id) {
                    return Err(RangingError::InvalidArgument(format!(
                        "duplicate oob peer {}",
                        handle.peer_id
                    )));
                }
            }
        }
    }
    let notification = &preference.config.notification;
    if notification.near_cm > notification.far_cm {
        return Err(RangingError::InvalidArgument(format!(
            "proximity band is inverted ({} > {})",
            notification.near_cm, notification.far_cm
        )));
    }
    Ok(())
}

// ── Actor internals ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    OobDiscovering,
    Starting,
    Running,
    Stopping,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Starting,
    Running,
    Stopping,
    Closed,
}

struct AdapterSlot {
    technology: Technology,
    adapter: Box<dyn RangingAdapter>,
    state: SlotState,
    /// Peers currently served by this adapter
    peers: HashSet<PeerId>,
    /// Peers to name in TechnologyStopped — last known non-empty set
    reported_peers: Vec<PeerId>,
}

/// Far-future stand-in so disabled timer branches still have a deadline.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

pub(crate) struct SessionActor {
    id: SessionId,
    ctx: CoreContext,
    role: DeviceRole,
    config: SessionConfig,
    state: SessionState,
    adapters: HashMap<usize, AdapterSlot>,
    engines: HashMap<PeerId, FusionEngine>,
    /// Proximity-notification edge state per peer
    in_band: HashMap<PeerId, bool>,
    emitted_count: u32,
    stop_reason: Option<StopReason>,
    watchdog_forced: bool,
    commands: mpsc::Receiver<Command>,
    adapter_tx: mpsc::Sender<(usize, AdapterEvent)>,
    adapter_rx: mpsc::Receiver<(usize, AdapterEvent)>,
    events: mpsc::Sender<SessionEvent>,
    client_gone: bool,
    stop_deadline: Option<Instant>,
    background_deadline: Option<Instant>,
    /// Tells the registry reaper this id is done
    done: mpsc::Sender<SessionId>,
}

/// Build the session actor. Returns the handle, the client's event stream,
/// and the actor future — the caller registers the handle first, then spawns
/// the future, so a session that dies instantly cannot race its own reaping.
pub(crate) fn build(
    ctx: CoreContext,
    id: SessionId,
    preference: SessionPreference,
    done: mpsc::Sender<SessionId>,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    impl std::future::Future<Output = ()> + Send,
) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(ctx.options.measurement_queue_depth.max(1));
    let (adapter_tx, adapter_rx) = mpsc::channel(64);

    let actor = SessionActor {
        id,
        ctx,
        role: preference.role,
        config: preference.config.clone(),
        state: SessionState::Created,
        adapters: HashMap::new(),
        engines: HashMap::new(),
        in_band: HashMap::new(),
        emitted_count: 0,
        stop_reason: None,
        watchdog_forced: false,
        commands: command_rx,
        adapter_tx,
        adapter_rx,
        events: event_tx,
        client_gone: false,
        stop_deadline: None,
        background_deadline: None,
        done,
    };

    (
        SessionHandle {
            id,
            commands: command_tx,
        },
        event_rx,
        actor.run(preference.bundle),
    )
}

impl SessionActor {
    async fn run(mut self, bundle: PreferenceBundle) {
        info!("{}: session created (role {:?})", self.id, self.role);

        let configs = match bundle {
            PreferenceBundle::Raw { configs } => configs,
            PreferenceBundle::Oob {
                peers,
                interval,
                security,
            } => match self.run_oob_discovery(&peers, interval, security).await {
                Ok(configs) => configs,
                Err(reason) => {
                    self.stop_reason = Some(reason);
                    self.finish().await;
                    return;
                }
            },
        };

        self.start_adapters(configs).await;
        if self.state == SessionState::Closed {
            return;
        }

        loop {
            let stop_at = self.stop_deadline.unwrap_or_else(far_future);
            let background_at = self.background_deadline.unwrap_or_else(far_future);

            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Every handle dropped — nobody can stop us anymore, so
                    // stop ourselves
                    None => self.begin_stop(StopReason::LocalRequest).await,
                },
                maybe_event = self.adapter_rx.recv() => {
                    if let Some((key, event)) = maybe_event {
                        self.handle_adapter_event(key, event).await;
                    }
                },
                _ = sleep_until(stop_at), if self.stop_deadline.is_some() => {
                    self.on_watchdog_expired().await;
                },
                _ = sleep_until(background_at), if self.background_deadline.is_some() => {
                    self.on_background_timeout();
                },
            }

            // A dead client gets the same teardown as an explicit stop
            if self.client_gone
                && !matches!(self.state, SessionState::Stopping | SessionState::Closed)
            {
                self.begin_stop(StopReason::LocalRequest).await;
            }

            if self.state == SessionState::Closed {
                break;
            }
        }
    }

    // ── OOB discovery ──

    async fn run_oob_discovery(
        &mut self,
        peers: &[DeviceHandle],
        interval: IntervalRange,
        security: SecurityLevel,
    ) -> Result<Vec<TechnologyConfig>, StopReason> {
        self.state = SessionState::OobDiscovering;

        let local = match self.ctx.capabilities.enabled_capabilities(Technology::Uwb) {
            Some(TechnologyCapabilities::Uwb(caps)) => caps,
            _ => {
                warn!("{}: oob session but UWB is not enabled locally", self.id);
                return Err(StopReason::Unsupported);
            }
        };

        let envelope = local_envelope(self.role, &local);
        let mut advertised = Vec::with_capacity(peers.len());
        for handle in peers {
            match self.ctx.oob.exchange_capabilities(*handle, &envelope).await {
                Ok(peer_envelope) => advertised.push((handle.peer_id, peer_envelope.uwb)),
                Err(e) => {
                    warn!("{}: capability exchange with {} failed: {e}", self.id, handle.peer_id);
                    return Err(StopReason::Error);
                }
            }
        }

        let request = SelectionRequest {
            session_config: &self.config,
            role: self.role,
            interval,
            security,
            local: &local,
            peers: &advertised,
        };
        let selection = match select_uwb(&request, self.ctx.key_rng.as_ref()) {
            Ok(selection) => {
                self.emit_metric(MetricRecord::new(MetricKind::OobSelectionSucceeded));
                selection
            }
            Err(e) => {
                warn!("{}: config selection failed: {e}", self.id);
                self.emit_metric(
                    MetricRecord::new(MetricKind::OobSelectionFailed)
                        .detail(serde_json::json!({ "error": e.to_string() })),
                );
                return Err(StopReason::Unsupported);
            }
        };

        for (peer, reply) in &selection.replies {
            let handle = peers
                .iter()
                .find(|h| h.peer_id == *peer)
                .copied()
                .ok_or(StopReason::Error)?;
            if let Err(e) = self.ctx.oob.send_config(handle, reply).await {
                warn!("{}: delivering config to {peer} failed: {e}", self.id);
                return Err(StopReason::Error);
            }
        }

        Ok(selection.configs)
    }

    // ── Startup ──

    async fn start_adapters(&mut self, configs: Vec<TechnologyConfig>) {
        self.state = SessionState::Starting;

        for (key, config) in configs.into_iter().enumerate() {
            let technology = config.technology();
            let config_peers = config.peers();

            let adapter = match self.ctx.adapters.create(technology) {
                Some(adapter) => adapter,
                None => {
                    debug!("{}: no adapter stack for {technology}", self.id);
                    self.emit_event(SessionEvent::TechnologyStopped {
                        technology,
                        peers: config_peers,
                        reason: StopReason::Unsupported,
                    })
                    .await;
                    continue;
                }
            };

            // Per-adapter channel, forwarded into the session mailbox so the
            // actor observes this adapter's events in emission order
            let (tx, mut rx) = mpsc::channel::<AdapterEvent>(32);
            let forward = self.adapter_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if forward.send((key, event)).await.is_err() {
                        break;
                    }
                }
            });

            let slot = AdapterSlot {
                technology,
                adapter,
                state: SlotState::Starting,
                peers: HashSet::new(),
                reported_peers: config_peers.clone(),
            };
            self.adapters.insert(key, slot);

            let slot = self.adapters.get_mut(&key).expect("slot just inserted");
            if let Err(e) = slot.adapter.start(config, tx).await {
                warn!("{}: {technology} adapter refused to start: {e}", self.id);
                slot.state = SlotState::Closed;
                self.emit_event(SessionEvent::TechnologyStopped {
                    technology,
                    peers: config_peers,
                    reason: StopReason::Unsupported,
                })
                .await;
            }
        }

        if !self.adapters.values().any(|s| s.state != SlotState::Closed) {
            // Nothing even began starting
            self.stop_reason = Some(StopReason::Unsupported);
            self.finish().await;
        }
    }

    // ── Commands ──

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Stop => self.begin_stop(StopReason::LocalRequest).await,
            Command::AddPeer { config, reply } => {
                let _ = reply.send(self.add_peer(config).await);
            }
            Command::RemovePeer { peer, reply } => {
                let _ = reply.send(self.remove_peer(peer).await);
            }
            Command::ReconfigureInterval { interval_ms, reply } => {
                let _ = reply.send(self.reconfigure_interval(interval_ms).await);
            }
            Command::SetForeground { foreground } => self.set_foreground(foreground),
        }
    }

    async fn add_peer(&mut self, config: TechnologyConfig) -> Result<(), RangingError> {
        if self.state != SessionState::Running {
            return Err(RangingError::SessionClosed);
        }
        let technology = config.technology();
        let slot = self
            .adapters
            .values()
            .find(|s| {
                s.technology == technology
                    && s.state == SlotState::Running
                    && s.adapter.supports_dynamic_peers()
            })
            .ok_or(RangingError::Unsupported)?;
        slot.adapter
            .add_peer(config)
            .await
            .map_err(|e| RangingError::InvalidArgument(e.to_string()))
    }

    async fn remove_peer(&mut self, peer: PeerId) -> Result<(), RangingError> {
        if self.state != SessionState::Running {
            return Err(RangingError::SessionClosed);
        }
        let slot = self
            .adapters
            .values()
            .find(|s| {
                s.peers.contains(&peer)
                    && s.state == SlotState::Running
                    && s.adapter.supports_dynamic_peers()
            })
            .ok_or(RangingError::Unsupported)?;
        slot.adapter
            .remove_peer(peer)
            .await
            .map_err(|e| RangingError::InvalidArgument(e.to_string()))
    }

    async fn reconfigure_interval(&mut self, interval_ms: u32) -> Result<(), RangingError> {
        if self.state != SessionState::Running {
            return Err(RangingError::SessionClosed);
        }
        let mut any = false;
        for slot in self.adapters.values() {
            if slot.state != SlotState::Running {
                continue;
            }
            match slot.adapter.reconfigure_interval(interval_ms).await {
                Ok(()) => any = true,
                Err(e) => debug!(
                    "{}: {} ignored reconfigure: {e}",
                    self.id, slot.technology
                ),
            }
        }
        if any {
            Ok(())
        } else {
            Err(RangingError::Unsupported)
        }
    }

    fn set_foreground(&mut self, foreground: bool) {
        for slot in self.adapters.values() {
            if slot.state != SlotState::Closed {
                slot.adapter.app_foreground_changed(foreground);
            }
        }
        self.background_deadline = if foreground {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(self.ctx.options.background_timeout_ms))
        };
    }

    fn on_background_timeout(&mut self) {
        self.background_deadline = None;
        debug!("{}: background timeout, throttling adapters", self.id);
        for slot in self.adapters.values() {
            if slot.state != SlotState::Closed {
                slot.adapter.background_timeout();
            }
        }
    }

    // ── Adapter events ──

    async fn handle_adapter_event(&mut self, key: usize, event: AdapterEvent) {
        if self.state == SessionState::Closed {
            return;
        }
        let Some(technology) = self.adapters.get(&key).map(|s| s.technology) else {
            return;
        };

        match event {
            AdapterEvent::Started { peers } => {
                if let Some(slot) = self.adapters.get_mut(&key) {
                    if slot.state == SlotState::Starting {
                        slot.state = SlotState::Running;
                    }
                    slot.peers = peers.iter().copied().collect();
                    if !peers.is_empty() {
                        slot.reported_peers = peers.clone();
                    }
                }
                for peer in &peers {
                    if let Some(engine) = self.engines.get_mut(peer) {
                        engine.activate(technology);
                    }
                }

                if self.state == SessionState::Starting {
                    self.state = SessionState::Running;
                    info!("{}: running ({technology} up first)", self.id);
                    self.emit_metric(MetricRecord::new(MetricKind::SessionStarted));
                    self.emit_event(SessionEvent::SessionStarted).await;
                }
                self.emit_metric(
                    MetricRecord::new(MetricKind::TechnologyStarted).technology(technology),
                );
                self.emit_event(SessionEvent::TechnologyStarted { technology, peers })
                    .await;
            }

            AdapterEvent::Stopped { peers } => {
                if let Some(slot) = self.adapters.get_mut(&key) {
                    for peer in &peers {
                        slot.peers.remove(peer);
                    }
                }
                for peer in &peers {
                    self.drop_peer_stream(*peer, technology);
                }
                debug!(
                    "{}: {technology} stopped {} peer(s)",
                    self.id,
                    peers.len()
                );
                self.check_peer_drain(StopReason::NoPeersFound).await;
            }

            AdapterEvent::Data { peer, measurement } => {
                // A peer the adapter ranges with is a peer it serves
                if let Some(slot) = self.adapters.get_mut(&key) {
                    slot.peers.insert(peer);
                }
                self.handle_data(peer, measurement).await;
            }

            AdapterEvent::Closed { reason } => {
                let (already_closed, was_stopping, peers) = {
                    let Some(slot) = self.adapters.get_mut(&key) else {
                        return;
                    };
                    let already_closed = slot.state == SlotState::Closed;
                    let was_stopping = slot.state == SlotState::Stopping;
                    slot.state = SlotState::Closed;
                    slot.peers.clear();
                    (
                        already_closed,
                        was_stopping,
                        std::mem::take(&mut slot.reported_peers),
                    )
                };

                if already_closed {
                    // Watchdog got here first; nothing left to report
                    self.maybe_finish_stopping().await;
                    return;
                }

                for peer in &peers {
                    self.drop_peer_stream(*peer, technology);
                }

                let stop_reason = if was_stopping && reason == CloseReason::LocalRequest {
                    StopReason::LocalRequest
                } else {
                    reason.to_stop_reason()
                };
                self.emit_metric(
                    MetricRecord::new(MetricKind::TechnologyStopped)
                        .technology(technology)
                        .reason(stop_reason),
                );
                self.emit_event(SessionEvent::TechnologyStopped {
                    technology,
                    peers,
                    reason: stop_reason,
                })
                .await;

                match self.state {
                    SessionState::Starting => {
                        // All adapters dead before anything started?
                        if self
                            .adapters
                            .values()
                            .all(|s| s.state == SlotState::Closed)
                        {
                            self.stop_reason = Some(StopReason::Unsupported);
                            self.finish().await;
                        }
                    }
                    SessionState::Running => {
                        self.check_peer_drain(stop_reason).await;
                    }
                    SessionState::Stopping => self.maybe_finish_stopping().await,
                    _ => {}
                }
            }
        }
    }

    async fn handle_data(&mut self, peer: PeerId, raw: RawMeasurement) {
        if self.state != SessionState::Running {
            return;
        }

        let fuser = Fuser::for_session(&self.config);
        let params = FilterParams::new(self.ctx.fusion_window());
        let engine = self
            .engines
            .entry(peer)
            .or_insert_with(|| FusionEngine::new(fuser, params));

        let Some(measurement) = engine.feed(raw) else {
            return;
        };
        if !self.notification_allows(peer, &measurement) {
            return;
        }

        self.emit_data(peer, measurement).await;

        let limit = self.config.measurement_limit;
        if limit > 0 && self.emitted_count >= limit {
            info!("{}: measurement limit {limit} reached", self.id);
            self.emit_metric(MetricRecord::new(MetricKind::MeasurementLimitReached));
            self.begin_stop(StopReason::LocalRequest).await;
        }
    }

    /// Apply the session's notification policy. Proximity mode is
    /// edge-triggered on the [near, far] band per peer.
    fn notification_allows(&mut self, peer: PeerId, measurement: &Measurement) -> bool {
        let notification = self.config.notification;
        match notification.kind {
            NotificationKind::Enable => true,
            NotificationKind::Disable => false,
            NotificationKind::Proximity => {
                let distance_cm = measurement.distance_m * 100.0;
                let inside = distance_cm >= f64::from(notification.near_cm)
                    && distance_cm <= f64::from(notification.far_cm);
                match self.in_band.insert(peer, inside) {
                    // First observation: only report if the peer is in band
                    None => inside,
                    Some(previous) => previous != inside,
                }
            }
        }
    }

    fn drop_peer_stream(&mut self, peer: PeerId, technology: Technology) {
        if let Some(engine) = self.engines.get_mut(&peer) {
            engine.deactivate(technology);
            if engine.is_idle() {
                self.engines.remove(&peer);
                self.in_band.remove(&peer);
            }
        }
    }

    /// Active set drained with nothing still starting ⇒ stop.
    async fn check_peer_drain(&mut self, reason: StopReason) {
        if self.state != SessionState::Running {
            return;
        }
        let any_peers = self
            .adapters
            .values()
            .any(|s| s.state != SlotState::Closed && !s.peers.is_empty());
        let any_starting = self
            .adapters
            .values()
            .any(|s| s.state == SlotState::Starting);
        if !any_peers && !any_starting {
            info!("{}: peer set drained", self.id);
            self.begin_stop(reason).await;
        }
    }

    // ── Teardown ──

    async fn begin_stop(&mut self, reason: StopReason) {
        if matches!(self.state, SessionState::Stopping | SessionState::Closed) {
            return;
        }
        info!("{}: stopping ({reason:?})", self.id);
        self.state = SessionState::Stopping;
        self.stop_reason = Some(reason);
        self.background_deadline = None;

        let keys: Vec<usize> = self.adapters.keys().copied().collect();
        let mut pending = false;
        for key in keys {
            let slot = self.adapters.get_mut(&key).expect("known slot");
            if slot.state == SlotState::Closed {
                continue;
            }
            slot.state = SlotState::Stopping;
            match slot.adapter.stop().await {
                Ok(()) => pending = true,
                Err(e) => {
                    let technology = slot.technology;
                    warn!("{}: {technology} stop failed: {e}", self.id);
                    slot.state = SlotState::Closed;
                    let peers = std::mem::take(&mut slot.reported_peers);
                    self.emit_event(SessionEvent::TechnologyStopped {
                        technology,
                        peers,
                        reason: StopReason::Error,
                    })
                    .await;
                }
            }
        }

        if pending {
            self.stop_deadline =
                Some(Instant::now() + Duration::from_millis(self.ctx.options.watchdog_ms));
        } else {
            self.finish().await;
        }
    }

    async fn maybe_finish_stopping(&mut self) {
        if self.state == SessionState::Stopping
            && self
                .adapters
                .values()
                .all(|s| s.state == SlotState::Closed)
        {
            self.finish().await;
        }
    }

    /// The watchdog expired with adapters still not Closed: force them.
    async fn on_watchdog_expired(&mut self) {
        self.stop_deadline = None;
        if self.state != SessionState::Stopping {
            return;
        }
        self.watchdog_forced = true;
        let keys: Vec<usize> = self.adapters.keys().copied().collect();
        for key in keys {
            let slot = self.adapters.get_mut(&key).expect("known slot");
            if slot.state == SlotState::Closed {
                continue;
            }
            let technology = slot.technology;
            warn!(
                "{}: {technology} ignored stop for {}ms, forcing close",
                self.id, self.ctx.options.watchdog_ms
            );
            slot.state = SlotState::Closed;
            let peers = std::mem::take(&mut slot.reported_peers);
            self.emit_metric(
                MetricRecord::new(MetricKind::WatchdogFired).technology(technology),
            );
            self.emit_event(SessionEvent::TechnologyStopped {
                technology,
                peers,
                reason: StopReason::Error,
            })
            .await;
        }
        self.finish().await;
    }

    async fn finish(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.stop_deadline = None;

        let reason = if self.watchdog_forced {
            StopReason::Error
        } else {
            self.stop_reason.unwrap_or(StopReason::Error)
        };
        info!("{}: closed ({reason:?})", self.id);
        self.emit_metric(MetricRecord::new(MetricKind::SessionStopped).reason(reason));
        self.emit_event(SessionEvent::SessionStopped { reason }).await;

        self.engines.clear();
        self.in_band.clear();
        // Dropping the slots drops the adapters; their forwarder tasks end
        // when the per-adapter channels close
        self.adapters.clear();

        let _ = self.done.send(self.id).await;
    }

    // ── Emission ──

    /// Lifecycle events must arrive; await queue space. A closed channel is
    /// client death.
    async fn emit_event(&mut self, event: SessionEvent) {
        if self.client_gone {
            return;
        }
        if self.events.send(event).await.is_err() {
            self.on_client_gone();
        }
    }

    /// Data is load-shed, never awaited: a slow client loses samples, not
    /// lifecycle events.
    async fn emit_data(&mut self, peer: PeerId, measurement: Measurement) {
        if self.client_gone {
            return;
        }
        match self.events.try_send(SessionEvent::Data { peer, measurement }) {
            Ok(()) => self.emitted_count += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("{}: client queue full, dropping sample for {peer}", self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.on_client_gone(),
        }
    }

    fn on_client_gone(&mut self) {
        if self.client_gone {
            return;
        }
        warn!("{}: client event channel closed, treating as client death", self.id);
        self.client_gone = true;
        self.emit_metric(MetricRecord::new(MetricKind::ClientDeath));
    }

    fn emit_metric(&self, record: MetricRecord) {
        self.ctx.metrics.emit(record.session(self.id));
    }
}
