//! # adapter
//!
//! The uniform contract every ranging technology implements.
//!
//! An adapter wraps one radio stack for one peer set. It owns whatever
//! threads or driver handles it needs, but every callback is delivered as an
//! [`AdapterEvent`] posted to the channel handed to `start` — the session
//! forwards that channel into its serial mailbox, so adapter code never
//! touches session state directly.
//!
//! ## Lifecycle
//! - `start` / `stop` are idempotent: a duplicate `start` on a running
//!   adapter fails with `AlreadyStarted`, a `stop` on a stopped adapter is a
//!   no-op.
//! - On successful start the adapter emits `Started(peers)`; a failed start
//!   emits `Closed(FailedToStart)` with no `Started` and releases all
//!   resources first.
//! - `Closed` is terminal. Nothing may be emitted after it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use ranging_types::{PeerId, RawMeasurement, Technology, TechnologyConfig};

use crate::event::StopReason;

// ── Events ────────────────────────────────────────────────────────────────────

/// Why an adapter reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The session asked it to stop
    LocalRequest,
    FailedToStart,
    /// The radio link to the peer set dropped
    LostConnection,
    /// Platform policy (airplane mode, background restriction)
    SystemPolicy,
    Error,
}

impl CloseReason {
    /// Collapse onto the client-visible reason set. `FailedToStart` means the
    /// technology was effectively unsupported for this config;
    /// `LostConnection` is an error from the client's point of view.
    pub fn to_stop_reason(self) -> StopReason {
        match self {
            Self::LocalRequest => StopReason::LocalRequest,
            Self::FailedToStart => StopReason::Unsupported,
            Self::LostConnection => StopReason::Error,
            Self::SystemPolicy => StopReason::SystemPolicy,
            Self::Error => StopReason::Error,
        }
    }
}

/// Callback events, ordered per adapter, single producer into the session.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Started { peers: Vec<PeerId> },
    Stopped { peers: Vec<PeerId> },
    Data { peer: PeerId, measurement: RawMeasurement },
    /// Terminal for the adapter
    Closed { reason: CloseReason },
}

/// Channel the session hands to `start`; adapters post every event here.
pub type AdapterEventTx = mpsc::Sender<AdapterEvent>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("adapter is already started")]
    AlreadyStarted,
    /// Operation not offered by this technology (dynamic peers, reconfigure)
    #[error("operation not supported by this adapter")]
    Unsupported,
    #[error("config rejected: {0}")]
    InvalidConfig(String),
    /// Driver-level failure; the adapter is expected to close itself
    #[error("radio error: {0}")]
    Radio(String),
}

// ── The contract ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait RangingAdapter: Send + Sync {
    fn technology(&self) -> Technology;

    /// Begin ranging against the config's peer set. Events flow to `events`
    /// until `Closed`.
    async fn start(
        &self,
        config: TechnologyConfig,
        events: AdapterEventTx,
    ) -> Result<(), AdapterError>;

    /// Stop ranging. Emits `Stopped(peers)` then `Closed(LocalRequest)`.
    /// No-op when already stopped.
    async fn stop(&self) -> Result<(), AdapterError>;

    /// Whether `add_peer` / `remove_peer` work after start.
    fn supports_dynamic_peers(&self) -> bool {
        false
    }

    async fn add_peer(&self, _config: TechnologyConfig) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    async fn remove_peer(&self, _peer: PeerId) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    async fn reconfigure_interval(&self, _interval_ms: u32) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    /// Duty-cycle hint. Must never fail; default is to ignore it.
    fn app_foreground_changed(&self, _foreground: bool) {}

    /// The app stayed backgrounded past the configured timeout. Hint only.
    fn background_timeout(&self) {}
}

/// Allocates adapters per technology. Returns None when the technology has no
/// backing stack on this device — the session treats that config as failed to
/// start.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, technology: Technology) -> Option<Box<dyn RangingAdapter>>;
}
