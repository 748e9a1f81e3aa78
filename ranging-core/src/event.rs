//! Client-visible session events.
//!
//! Delivered in order per session over a bounded channel. Lifecycle events
//! are never dropped; `Data` may be shed under backpressure (the queue depth
//! comes from `ServiceOptions::measurement_queue_depth`).

use serde::Serialize;

use ranging_types::{Measurement, PeerId, Technology};

/// Reasons surfaced to clients. Internal adapter close reasons collapse into
/// this smaller set (see `CloseReason::to_stop_reason`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// The client asked, the measurement limit was reached, or the client
    /// went away
    LocalRequest,
    /// Every peer drained out of the session
    NoPeersFound,
    /// Nothing could start
    Unsupported,
    /// Platform policy shut ranging down
    SystemPolicy,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    /// First adapter came up; the session is Running
    SessionStarted,
    TechnologyStarted {
        technology: Technology,
        peers: Vec<PeerId>,
    },
    Data {
        peer: PeerId,
        measurement: Measurement,
    },
    TechnologyStopped {
        technology: Technology,
        peers: Vec<PeerId>,
        reason: StopReason,
    },
    /// Terminal. Exactly one per started session.
    SessionStopped { reason: StopReason },
}
