//! Session and per-technology configuration.
//!
//! Parameter objects are plain tagged variants validated at construction —
//! `TechnologyConfig::new` is the single choke point, so a config that exists
//! is a config that is usable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PeerId, Technology};

// ── Roles & security ──────────────────────────────────────────────────────────

/// Which side of the ranging exchange this device drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DeviceRole {
    Initiator = 0,
    Responder = 1,
}

impl DeviceRole {
    /// The role a peer must support to range against us.
    pub fn complement(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn try_from_u8(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::Initiator),
            1 => Ok(Self::Responder),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    /// Static STS — no out-of-band key material
    Basic,
    /// Provisioned STS — 16-byte session key exchanged over OOB
    Secure,
}

// ── Update rate ───────────────────────────────────────────────────────────────

/// Ranging update cadence. Each rate has one defined interval; the OOB
/// selector picks the fastest rate whose interval fits the negotiated range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateRate {
    Fast,
    Normal,
    Infrequent,
}

impl UpdateRate {
    /// Fastest first — selection walks this in order.
    pub const ALL: [UpdateRate; 3] = [UpdateRate::Fast, UpdateRate::Normal, UpdateRate::Infrequent];

    /// Defined ranging interval for this rate, milliseconds.
    pub fn interval_ms(self) -> u32 {
        match self {
            Self::Fast => 96,
            Self::Normal => 200,
            Self::Infrequent => 600,
        }
    }
}

// ── UWB config IDs ────────────────────────────────────────────────────────────

/// FiRa-defined PHY/MAC profile selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum UwbConfigId {
    UnicastDsTwr = 0,
    MulticastDsTwr = 1,
    ProvisionedUnicastDsTwr = 2,
    ProvisionedMulticastDsTwr = 3,
    /// Provisioned-STS unicast profile with the 96 ms interval unlocked
    UnicastDsTwrVeryFast = 4,
}

impl UwbConfigId {
    /// Profiles that require an out-of-band provisioned STS key (Secure).
    pub fn is_provisioned_sts(self) -> bool {
        matches!(
            self,
            Self::ProvisionedUnicastDsTwr
                | Self::ProvisionedMulticastDsTwr
                | Self::UnicastDsTwrVeryFast
        )
    }

    /// Profiles that put several peers in one radio session.
    pub fn is_multicast(self) -> bool {
        matches!(self, Self::MulticastDsTwr | Self::ProvisionedMulticastDsTwr)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn try_from_u8(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Self::UnicastDsTwr),
            1 => Ok(Self::MulticastDsTwr),
            2 => Ok(Self::ProvisionedUnicastDsTwr),
            3 => Ok(Self::ProvisionedMulticastDsTwr),
            4 => Ok(Self::UnicastDsTwrVeryFast),
            other => Err(other),
        }
    }
}

// ── Per-technology parameters ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UwbParams {
    /// UCI session id, unique per radio session on this device
    pub session_id: u32,
    pub config_id: UwbConfigId,
    /// UWB channel, 5 or 9
    pub channel: u8,
    /// Preamble code index: BPRF 9–24, HPRF 25–32
    pub preamble_index: u8,
    /// Slot duration, 1 or 2 ms
    pub slot_duration_ms: u8,
    pub update_rate: UpdateRate,
    pub security: SecurityLevel,
    /// Provisioned STS key — required iff the config id is provisioned-STS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<[u8; 16]>,
    pub device_role: DeviceRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsParams {
    pub security: SecurityLevel,
    pub update_rate: UpdateRate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RttParams {
    /// NAN publish/subscribe service name
    pub service_name: String,
    pub update_rate: UpdateRate,
    /// Periodic ranging vs one-shot on demand
    pub periodic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssiParams {
    pub update_rate: UpdateRate,
}

/// Sum type: exactly one set of radio parameters per technology config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technology", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerTechnologyConfig {
    Uwb(UwbParams),
    Cs(CsParams),
    Rtt(RttParams),
    Rssi(RssiParams),
}

impl PerTechnologyConfig {
    pub fn technology(&self) -> Technology {
        match self {
            Self::Uwb(_) => Technology::Uwb,
            Self::Cs(_) => Technology::Cs,
            Self::Rtt(_) => Technology::Rtt,
            Self::Rssi(_) => Technology::Rssi,
        }
    }

    pub fn update_rate(&self) -> UpdateRate {
        match self {
            Self::Uwb(p) => p.update_rate,
            Self::Cs(p) => p.update_rate,
            Self::Rtt(p) => p.update_rate,
            Self::Rssi(p) => p.update_rate,
        }
    }
}

// ── Technology config (peers + parameters) ────────────────────────────────────

/// Peers addressed by one radio session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerTopology {
    Unicast(PeerId),
    /// All peers share a single radio session
    Multicast(Vec<PeerId>),
}

impl PeerTopology {
    pub fn peers(&self) -> Vec<PeerId> {
        match self {
            Self::Unicast(p) => vec![*p],
            Self::Multicast(ps) => ps.clone(),
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, Self::Multicast(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Unicast(_) => 1,
            Self::Multicast(ps) => ps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One startable unit: a peer topology plus exactly one parameter set.
/// Only constructible through [`TechnologyConfig::new`], which validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnologyConfig {
    topology: PeerTopology,
    params: PerTechnologyConfig,
}

impl TechnologyConfig {
    pub fn new(topology: PeerTopology, params: PerTechnologyConfig) -> Result<Self, ConfigError> {
        if topology.is_empty() {
            return Err(ConfigError::EmptyPeerSet);
        }
        if let PeerTopology::Multicast(peers) = &topology {
            let mut sorted = peers.clone();
            sorted.sort();
            sorted.dedup();
            if sorted.len() != peers.len() {
                return Err(ConfigError::DuplicatePeer);
            }
        }
        if let PerTechnologyConfig::Uwb(uwb) = &params {
            if !matches!(uwb.channel, 5 | 9) {
                return Err(ConfigError::BadChannel(uwb.channel));
            }
            if !(9..=32).contains(&uwb.preamble_index) {
                return Err(ConfigError::BadPreamble(uwb.preamble_index));
            }
            if !matches!(uwb.slot_duration_ms, 1 | 2) {
                return Err(ConfigError::BadSlotDuration(uwb.slot_duration_ms));
            }
            if topology.is_multicast() && !uwb.config_id.is_multicast() {
                return Err(ConfigError::UnicastConfigWithMulticastPeers(uwb.config_id));
            }
            if uwb.config_id.is_provisioned_sts() != uwb.session_key.is_some() {
                return Err(ConfigError::KeyMismatch(uwb.config_id));
            }
            if uwb.security == SecurityLevel::Secure && !uwb.config_id.is_provisioned_sts() {
                return Err(ConfigError::SecureNeedsProvisionedSts(uwb.config_id));
            }
        }
        if let PerTechnologyConfig::Rtt(rtt) = &params {
            if rtt.service_name.is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }
        }
        Ok(Self { topology, params })
    }

    pub fn topology(&self) -> &PeerTopology {
        &self.topology
    }

    pub fn params(&self) -> &PerTechnologyConfig {
        &self.params
    }

    pub fn technology(&self) -> Technology {
        self.params.technology()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.topology.peers()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("peer set is empty")]
    EmptyPeerSet,
    #[error("duplicate peer in multicast set")]
    DuplicatePeer,
    #[error("UWB channel must be 5 or 9, got {0}")]
    BadChannel(u8),
    #[error("preamble index must be in 9..=32, got {0}")]
    BadPreamble(u8),
    #[error("slot duration must be 1 or 2 ms, got {0}")]
    BadSlotDuration(u8),
    #[error("config {0:?} is unicast but multiple peers were given")]
    UnicastConfigWithMulticastPeers(UwbConfigId),
    #[error("config {0:?} and session key presence disagree")]
    KeyMismatch(UwbConfigId),
    #[error("secure session requires a provisioned-STS config, got {0:?}")]
    SecureNeedsProvisionedSts(UwbConfigId),
    #[error("RTT service name is empty")]
    EmptyServiceName,
    #[error("interval range has fastest {fastest_ms} > slowest {slowest_ms}")]
    BadIntervalRange { fastest_ms: u32, slowest_ms: u32 },
}

// ── Session-level configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// Stream every fused measurement
    Enable,
    /// Edge-triggered: emit only when a peer enters or leaves the
    /// [near_cm, far_cm] band
    Proximity,
    /// Suppress Data events entirely (lifecycle events still flow)
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub kind: NotificationKind,
    pub near_cm: u32,
    pub far_cm: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            kind: NotificationKind::Enable,
            near_cm: 50,
            far_cm: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Client needs azimuth/elevation; OOB selection fails without local AoA
    pub aoa_needed: bool,
    /// Enable the preferential fuser across concurrent technologies
    pub sensor_fusion: bool,
    /// Total Data events to emit before the session stops itself. 0 = unlimited.
    pub measurement_limit: u32,
    pub notification: NotificationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aoa_needed: false,
            sensor_fusion: true,
            measurement_limit: 0,
            notification: NotificationConfig::default(),
        }
    }
}

// ── Session preference ────────────────────────────────────────────────────────

/// Acceptable ranging interval window for OOB negotiation, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalRange {
    pub fastest_ms: u32,
    pub slowest_ms: u32,
}

impl IntervalRange {
    pub fn new(fastest_ms: u32, slowest_ms: u32) -> Result<Self, ConfigError> {
        if fastest_ms > slowest_ms {
            return Err(ConfigError::BadIntervalRange {
                fastest_ms,
                slowest_ms,
            });
        }
        Ok(Self {
            fastest_ms,
            slowest_ms,
        })
    }

    pub fn contains(&self, interval_ms: u32) -> bool {
        (self.fastest_ms..=self.slowest_ms).contains(&interval_ms)
    }

    /// Clamp the lower bound up to `min_ms` (a device's minimum interval).
    /// Returns None when the result is empty.
    pub fn raise_floor(&self, min_ms: u32) -> Option<Self> {
        let fastest = self.fastest_ms.max(min_ms);
        if fastest > self.slowest_ms {
            None
        } else {
            Some(Self {
                fastest_ms: fastest,
                slowest_ms: self.slowest_ms,
            })
        }
    }
}

/// Handle to a peer discovered over the OOB transport. The token routes back
/// to the transport connection; the core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHandle {
    pub peer_id: PeerId,
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreferenceBundle {
    /// Client supplies ready-made technology configs
    Raw { configs: Vec<TechnologyConfig> },
    /// Service negotiates UWB parameters over the OOB transport first
    Oob {
        peers: Vec<DeviceHandle>,
        interval: IntervalRange,
        security: SecurityLevel,
    },
}

/// The declarative session request a client hands to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPreference {
    pub role: DeviceRole,
    pub config: SessionConfig,
    pub bundle: PreferenceBundle,
}
