//! Error taxonomy for the orchestration core.
//!
//! Everything is a typed result. Errors local to one adapter are recovered
//! inside the session (logged + surfaced as a per-technology stop); errors
//! that invalidate the session as a whole drive it to Closed.

use thiserror::Error;

use ranging_types::ConfigError;

/// Top-level error surfaced through the client API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangingError {
    /// No technology can satisfy the preference. Terminal for the session.
    #[error("no technology can satisfy the session preference")]
    Unsupported,
    /// OOB selection failed before any adapter started.
    #[error("config selection failed: {0}")]
    ConfigSelection(#[from] SelectionError),
    /// Rejected synchronously, before any state transition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("client exceeded its session quota of {0}")]
    QuotaExceeded(usize),
    #[error("unknown session handle")]
    UnknownSession,
    /// The session is no longer accepting requests.
    #[error("session is closed")]
    SessionClosed,
}

impl From<ConfigError> for RangingError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

/// Why the OOB config selector could not produce a usable UWB config.
/// Selection runs across all peers at once — one incompatible peer fails the
/// whole selection rather than being silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("secure session requested but no provisioned-STS config is supported locally")]
    SecurityIncompatible,
    #[error("ranging interval ranges do not overlap")]
    IntervalDisjoint,
    #[error("a peer does not support the complementary device role")]
    RoleIncompatible,
    #[error("no config id supported by every peer and locally")]
    NoCommonConfigId,
    #[error("no channel supported by every peer and locally")]
    NoCommonChannel,
    #[error("no preamble index supported by every peer and locally")]
    NoCommonPreamble,
    #[error("angle of arrival requested but unavailable locally")]
    AoaUnavailable,
}
