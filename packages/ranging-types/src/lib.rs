//! # ranging-types
//!
//! Shared data model for the multi-technology ranging service.
//!
//! These types are used by:
//! - `ranging-core`: session orchestration, OOB config selection, fusion
//! - `ranging-simulator`: synthetic adapters producing measurement streams
//! - host bindings: the IPC surface maps its parcels onto these structs
//!
//! ## Conventions
//!
//! - Distances in meters (`f64`), angles in radians, intervals in
//!   milliseconds, RSSI in dBm.
//! - Timestamps are monotonic milliseconds from the service clock, strictly
//!   increasing per (peer, technology) stream.
//! - Every closed enum that crosses a process or radio boundary carries a
//!   bidirectional u8 wire mapping; unknown discriminants are rejected at the
//!   boundary, never propagated as an `UNKNOWN` variant.

use serde::{Deserialize, Serialize};

pub mod capabilities;
pub mod config;
pub mod measurement;
pub mod oob_wire;

pub use capabilities::{
    Availability, CsCapabilities, RoleSet, RssiCapabilities, RttCapabilities,
    TechnologyCapabilities, UwbCapabilities,
};
pub use config::{
    ConfigError, CsParams, DeviceHandle, DeviceRole, IntervalRange, NotificationConfig,
    NotificationKind, PeerTopology, PerTechnologyConfig, PreferenceBundle, RssiParams, RttParams,
    SecurityLevel, SessionConfig, SessionPreference, TechnologyConfig, UpdateRate, UwbConfigId,
    UwbParams,
};
pub use measurement::{Measurement, MeasurementError, RawMeasurement};
pub use oob_wire::{CapabilityEnvelope, ConfigReplyEnvelope, UwbCapabilityPayload, WireError};

// ── Technology ────────────────────────────────────────────────────────────────

/// One ranging radio technology.
///
/// The derived ordering is the service-wide preference order (UWB first) and
/// is used for fusion tie-breaks — keep the variants sorted by preference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Technology {
    /// Ultra-wideband (FiRa DS-TWR profiles)
    Uwb = 0,
    /// Bluetooth Channel Sounding
    Cs = 1,
    /// WiFi round-trip time over NAN
    Rtt = 2,
    /// Bluetooth RSSI distance estimation
    Rssi = 3,
}

impl Technology {
    /// All technologies, in preference order.
    pub const ALL: [Technology; 4] = [
        Technology::Uwb,
        Technology::Cs,
        Technology::Rtt,
        Technology::Rssi,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Wire mapping. Unknown values are a boundary error.
    pub fn try_from_u8(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::Uwb),
            1 => Ok(Self::Cs),
            2 => Ok(Self::Rtt),
            3 => Ok(Self::Rssi),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uwb => "UWB",
            Self::Cs => "CS",
            Self::Rtt => "RTT",
            Self::Rssi => "RSSI",
        };
        write!(f, "{s}")
    }
}

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Opaque 128-bit peer identifier. Unique within a session, immutable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(v.to_be_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 4 bytes, enough to tell peers apart in logs
        write!(f, "peer:{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technology_order_is_preference_order() {
        assert!(Technology::Uwb < Technology::Cs);
        assert!(Technology::Cs < Technology::Rtt);
        assert!(Technology::Rtt < Technology::Rssi);
    }

    #[test]
    fn technology_wire_mapping_rejects_unknown() {
        for tech in Technology::ALL {
            assert_eq!(Technology::try_from_u8(tech.as_u8()), Ok(tech));
        }
        assert_eq!(Technology::try_from_u8(4), Err(4));
        assert_eq!(Technology::try_from_u8(255), Err(255));
    }

    #[test]
    fn peer_id_display_is_stable() {
        let peer = PeerId::from_u128(0xdead_beef_0000_0000_0000_0000_0000_0001);
        assert_eq!(peer.to_string(), "peer:deadbeef");
    }
}
