//! Local and advertised radio capabilities.
//!
//! The capability registry publishes one of these per technology; the OOB
//! selector intersects the UWB variant against peer-advertised payloads.

use serde::{Deserialize, Serialize};

use crate::config::{DeviceRole, UpdateRate, UwbConfigId};
use crate::Technology;

// ── Availability ──────────────────────────────────────────────────────────────

/// Whether a technology can currently range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Availability {
    /// Hardware absent
    NotSupported = 0,
    /// Hardware present, radio switched off
    Disabled = 1,
    Enabled = 2,
    /// Stack fault; may recover without user action
    SystemError = 3,
    /// Policy (airplane mode, user restriction) blocks ranging
    UserRestricted = 4,
}

impl Availability {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn try_from_u8(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::NotSupported),
            1 => Ok(Self::Disabled),
            2 => Ok(Self::Enabled),
            3 => Ok(Self::SystemError),
            4 => Ok(Self::UserRestricted),
            other => Err(other),
        }
    }
}

// ── Role bitmask ──────────────────────────────────────────────────────────────

/// Supported device roles. Wire form: bit0 = INITIATOR, bit1 = RESPONDER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const INITIATOR: u8 = 0b01;
    pub const RESPONDER: u8 = 0b10;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn both() -> Self {
        Self(Self::INITIATOR | Self::RESPONDER)
    }

    pub fn only(role: DeviceRole) -> Self {
        let mut set = Self::empty();
        set.insert(role);
        set
    }

    /// Unknown bits are a boundary error.
    pub fn try_from_bits(bits: u8) -> Result<Self, u8> {
        if bits & !(Self::INITIATOR | Self::RESPONDER) != 0 {
            return Err(bits);
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, role: DeviceRole) {
        self.0 |= match role {
            DeviceRole::Initiator => Self::INITIATOR,
            DeviceRole::Responder => Self::RESPONDER,
        };
    }

    pub fn contains(self, role: DeviceRole) -> bool {
        let bit = match role {
            DeviceRole::Initiator => Self::INITIATOR,
            DeviceRole::Responder => Self::RESPONDER,
        };
        self.0 & bit != 0
    }
}

// ── Per-technology capability sets ────────────────────────────────────────────

/// Local UWB stack capabilities, as reported by the UCI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UwbCapabilities {
    pub config_ids: Vec<UwbConfigId>,
    /// Supported channels, subset of {5, 9}
    pub channels: Vec<u8>,
    /// Supported preamble code indexes (BPRF 9–24, HPRF 25–32)
    pub preamble_indexes: Vec<u8>,
    /// Fastest ranging interval the stack sustains, milliseconds
    pub min_interval_ms: u32,
    /// Supported slot durations, subset of {1, 2} ms
    pub slot_durations_ms: Vec<u8>,
    pub update_rates: Vec<UpdateRate>,
    /// Azimuth (and with a 3D antenna, elevation) angle of arrival
    pub supports_aoa: bool,
    pub supported_roles: RoleSet,
    /// Local UWB MAC address, zero-padded to 16 bytes
    pub address: [u8; 16],
}

impl UwbCapabilities {
    pub fn has_provisioned_config(&self) -> bool {
        self.config_ids.iter().any(|c| c.is_provisioned_sts())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsCapabilities {
    pub min_interval_ms: u32,
    pub supports_secure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RttCapabilities {
    pub min_interval_ms: u32,
    pub supports_periodic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssiCapabilities {
    pub min_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technology", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TechnologyCapabilities {
    Uwb(UwbCapabilities),
    Cs(CsCapabilities),
    Rtt(RttCapabilities),
    Rssi(RssiCapabilities),
}

impl TechnologyCapabilities {
    pub fn technology(&self) -> Technology {
        match self {
            Self::Uwb(_) => Technology::Uwb,
            Self::Cs(_) => Technology::Cs,
            Self::Rtt(_) => Technology::Rtt,
            Self::Rssi(_) => Technology::Rssi,
        }
    }

    pub fn as_uwb(&self) -> Option<&UwbCapabilities> {
        match self {
            Self::Uwb(caps) => Some(caps),
            _ => None,
        }
    }
}
