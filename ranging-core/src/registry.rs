//! # registry
//!
//! Process-wide session table. Allocates handles, enforces per-client
//! quotas, fans app foreground/background transitions out to a client's
//! sessions, and guarantees a client crash stops everything that client
//! owns — the death notification walks the exact same stop path as an
//! explicit request. Closed sessions report back on a reaper channel and
//! are dropped from the table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use ranging_types::{PeerId, SessionPreference, TechnologyConfig};

use crate::capability::{AvailabilityObserver, CapabilityRegistry};
use crate::context::CoreContext;
use crate::error::RangingError;
use crate::event::SessionEvent;
use crate::metrics::{MetricKind, MetricRecord};
use crate::session::{self, SessionHandle, SessionId};

// ── Client identity ───────────────────────────────────────────────────────────

/// Opaque client identity assigned by the host (uid, binder cookie, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct SessionEntry {
    handle: SessionHandle,
    client: ClientId,
}

pub struct SessionRegistry {
    ctx: CoreContext,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    done_tx: mpsc::Sender<SessionId>,
}

impl SessionRegistry {
    pub fn new(ctx: CoreContext) -> Arc<Self> {
        let (done_tx, mut done_rx) = mpsc::channel::<SessionId>(32);
        let registry = Arc::new(Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            done_tx,
        });

        // Reaper: drop table entries as sessions close. Weak so the registry
        // can actually be dropped.
        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(id) = done_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                if registry.sessions.write().await.remove(&id).is_some() {
                    debug!("registry: reaped {id}");
                }
            }
        });

        registry
    }

    /// Create and start a session for `preference`. The returned receiver is
    /// the client's event stream; dropping it counts as client death for
    /// that session.
    pub async fn start_session(
        &self,
        client: ClientId,
        preference: SessionPreference,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), RangingError> {
        session::validate_preference(&preference)?;

        let mut sessions = self.sessions.write().await;
        let held = sessions.values().filter(|e| e.client == client).count();
        let quota = self.ctx.options.max_sessions_per_client;
        if held >= quota {
            return Err(RangingError::QuotaExceeded(quota));
        }

        let id = SessionId::new();
        info!("registry: {client} starting {id}");
        self.ctx
            .metrics
            .emit(MetricRecord::new(MetricKind::SessionCreated).session(id));

        let (handle, events, actor) =
            session::build(self.ctx.clone(), id, preference, self.done_tx.clone());
        sessions.insert(
            id,
            SessionEntry {
                handle: handle.clone(),
                client,
            },
        );
        drop(sessions);
        tokio::spawn(actor);
        Ok((handle, events))
    }

    pub async fn stop_session(&self, id: SessionId) -> Result<(), RangingError> {
        self.lookup(id).await?.stop().await;
        Ok(())
    }

    pub async fn add_peer(
        &self,
        id: SessionId,
        config: TechnologyConfig,
    ) -> Result<(), RangingError> {
        self.lookup(id).await?.add_peer(config).await
    }

    pub async fn remove_peer(&self, id: SessionId, peer: PeerId) -> Result<(), RangingError> {
        self.lookup(id).await?.remove_peer(peer).await
    }

    pub async fn reconfigure_interval(
        &self,
        id: SessionId,
        interval_ms: u32,
    ) -> Result<(), RangingError> {
        self.lookup(id).await?.reconfigure_interval(interval_ms).await
    }

    /// The host observed the client's app move between foreground and
    /// background; every session the client owns gets the hint.
    pub async fn client_foreground_changed(&self, client: ClientId, foreground: bool) {
        for handle in self.handles_of(client).await {
            handle.set_foreground(foreground).await;
        }
    }

    /// Death notification: stop every session the client owns.
    pub async fn client_closed(&self, client: ClientId) {
        let handles = self.handles_of(client).await;
        if !handles.is_empty() {
            info!("registry: {client} gone, stopping {} session(s)", handles.len());
        }
        for handle in handles {
            handle.stop().await;
        }
    }

    pub fn register_capabilities_observer(&self, observer: &Arc<dyn AvailabilityObserver>) {
        self.ctx.capabilities.subscribe(observer);
    }

    pub fn unregister_capabilities_observer(&self, observer: &Arc<dyn AvailabilityObserver>) {
        self.ctx.capabilities.unsubscribe(observer);
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.ctx.capabilities
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lookup(&self, id: SessionId) -> Result<SessionHandle, RangingError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|e| e.handle.clone())
            .ok_or(RangingError::UnknownSession)
    }

    async fn handles_of(&self, client: ClientId) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|e| e.client == client)
            .map(|e| e.handle.clone())
            .collect()
    }
}
