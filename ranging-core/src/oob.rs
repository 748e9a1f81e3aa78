//! # oob
//!
//! Out-of-band UWB config negotiation.
//!
//! Discovery hands the session one capability envelope per peer; the
//! selector intersects them with local capabilities and produces one usable
//! UWB parameter set per radio session plus the reply envelope each peer
//! gets back. Selection is deterministic — every tie-break is fixed — and
//! runs once across all peers: an incompatible peer fails the whole
//! selection rather than being silently dropped.
//!
//! ## Selection order
//! 1. config id (Secure: VeryFast > ProvisionedUnicast > ProvisionedMulticast;
//!    Basic: Unicast > Multicast)
//! 2. channel (9, falling back to 5 when any peer lacks 9)
//! 3. preamble (smallest mutual HPRF >= 25, else smallest mutual BPRF)
//! 4. slot duration (largest mutual <= 2 ms ceiling, default 2)
//! 5. update rate (fastest whose defined interval fits the intersected range)
//! 6. Secure only: one 16-byte session key shared by every peer reply

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use ranging_types::{
    CapabilityEnvelope, ConfigReplyEnvelope, DeviceHandle, DeviceRole, IntervalRange, PeerId,
    PeerTopology, PerTechnologyConfig, SecurityLevel, SessionConfig, TechnologyConfig, UpdateRate,
    UwbCapabilities, UwbCapabilityPayload, UwbConfigId, UwbParams, WireError,
    oob_wire::OOB_PROTO_VERSION,
};

use crate::context::SessionKeyRng;
use crate::error::SelectionError;

// ── OOB transport contract ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OobError {
    #[error("oob transport failure: {0}")]
    Transport(String),
    #[error("peer rejected the exchange")]
    PeerRejected,
    #[error("malformed peer payload: {0}")]
    Decode(#[from] WireError),
    #[error("oob transport not available")]
    Unavailable,
}

/// The host's OOB transport (GATT, NAN follow-up, …). The core only ever
/// speaks envelopes; framing and addressing stay behind this trait.
#[async_trait]
pub trait OobConnector: Send + Sync {
    /// Send our capability advertisement to one discovered peer and return
    /// its advertisement.
    async fn exchange_capabilities(
        &self,
        handle: DeviceHandle,
        local: &CapabilityEnvelope,
    ) -> Result<CapabilityEnvelope, OobError>;

    /// Deliver the selected config (and Secure key) to a peer.
    async fn send_config(
        &self,
        handle: DeviceHandle,
        reply: &ConfigReplyEnvelope,
    ) -> Result<(), OobError>;
}

/// For hosts without an OOB transport: raw sessions only.
pub struct UnsupportedOobConnector;

#[async_trait]
impl OobConnector for UnsupportedOobConnector {
    async fn exchange_capabilities(
        &self,
        _handle: DeviceHandle,
        _local: &CapabilityEnvelope,
    ) -> Result<CapabilityEnvelope, OobError> {
        Err(OobError::Unavailable)
    }

    async fn send_config(
        &self,
        _handle: DeviceHandle,
        _reply: &ConfigReplyEnvelope,
    ) -> Result<(), OobError> {
        Err(OobError::Unavailable)
    }
}

// ── Selection input / output ──────────────────────────────────────────────────

pub struct SelectionRequest<'a> {
    pub session_config: &'a SessionConfig,
    /// Our role; peers must advertise the complement
    pub role: DeviceRole,
    pub interval: IntervalRange,
    pub security: SecurityLevel,
    pub local: &'a UwbCapabilities,
    pub peers: &'a [(PeerId, UwbCapabilityPayload)],
}

/// What selection produced: ready-to-start local configs and the per-peer
/// reply envelopes. A multicast config covers all peers in one entry.
#[derive(Debug, Clone)]
pub struct UwbSelection {
    pub configs: Vec<TechnologyConfig>,
    pub replies: Vec<(PeerId, ConfigReplyEnvelope)>,
    pub update_rate: UpdateRate,
    pub interval_ms: u32,
}

// ── Selector ──────────────────────────────────────────────────────────────────

/// Config-id preference order for a security level. Secure rejects any
/// unprovisioned profile outright.
fn config_id_candidates(security: SecurityLevel) -> &'static [UwbConfigId] {
    match security {
        SecurityLevel::Secure => &[
            UwbConfigId::UnicastDsTwrVeryFast,
            UwbConfigId::ProvisionedUnicastDsTwr,
            UwbConfigId::ProvisionedMulticastDsTwr,
        ],
        SecurityLevel::Basic => &[UwbConfigId::UnicastDsTwr, UwbConfigId::MulticastDsTwr],
    }
}

fn is_hprf(preamble: u8) -> bool {
    preamble >= 25
}

pub fn select_uwb(
    request: &SelectionRequest<'_>,
    key_rng: &dyn SessionKeyRng,
) -> Result<UwbSelection, SelectionError> {
    let local = request.local;
    let peers = request.peers;

    // ── Preconditions ──
    if request.security == SecurityLevel::Secure && !local.has_provisioned_config() {
        return Err(SelectionError::SecurityIncompatible);
    }
    if request.session_config.aoa_needed && !local.supports_aoa {
        return Err(SelectionError::AoaUnavailable);
    }
    let complement = request.role.complement();
    if peers
        .iter()
        .any(|(_, p)| !p.supported_roles.contains(complement))
    {
        return Err(SelectionError::RoleIncompatible);
    }
    let mut range = request
        .interval
        .raise_floor(local.min_interval_ms)
        .ok_or(SelectionError::IntervalDisjoint)?;
    for (_, peer) in peers {
        range = range
            .raise_floor(u32::from(peer.min_interval_ms))
            .ok_or(SelectionError::IntervalDisjoint)?;
    }

    // ── 1. Config id ──
    let config_id = config_id_candidates(request.security)
        .iter()
        .copied()
        .find(|id| {
            local.config_ids.contains(id)
                && peers.iter().all(|(_, p)| p.config_ids.contains(id))
        })
        .ok_or(SelectionError::NoCommonConfigId)?;

    // ── 2. Channel: 9 preferred, 5 only when someone lacks 9 ──
    let channel = [9u8, 5]
        .into_iter()
        .find(|ch| {
            local.channels.contains(ch) && peers.iter().all(|(_, p)| p.channels.contains(ch))
        })
        .ok_or(SelectionError::NoCommonChannel)?;

    // ── 3. Preamble: smallest mutual HPRF, BPRF fallback ──
    let mutual_preambles: Vec<u8> = local
        .preamble_indexes
        .iter()
        .copied()
        .filter(|idx| peers.iter().all(|(_, p)| p.preamble_indexes.contains(idx)))
        .collect();
    let preamble_index = mutual_preambles
        .iter()
        .copied()
        .filter(|idx| is_hprf(*idx))
        .min()
        .or_else(|| {
            mutual_preambles
                .iter()
                .copied()
                .filter(|idx| !is_hprf(*idx))
                .min()
        })
        .ok_or(SelectionError::NoCommonPreamble)?;

    // ── 4. Slot duration: largest mutual under the 2 ms session ceiling ──
    const SLOT_CEILING_MS: u8 = 2;
    let slot_duration_ms = local
        .slot_durations_ms
        .iter()
        .copied()
        .filter(|slot| {
            *slot <= SLOT_CEILING_MS
                && peers
                    .iter()
                    .all(|(_, p)| p.slot_durations_ms().contains(slot))
        })
        .max()
        .unwrap_or(SLOT_CEILING_MS);

    // ── 5. Update rate: fastest defined interval inside the range ──
    let update_rate = UpdateRate::ALL
        .into_iter()
        .find(|rate| local.update_rates.contains(rate) && range.contains(rate.interval_ms()))
        .ok_or(SelectionError::IntervalDisjoint)?;
    let interval_ms = update_rate.interval_ms();

    // ── 6. Session key, shared by every peer of this session ──
    let session_key = match request.security {
        SecurityLevel::Secure => {
            let mut key = [0u8; 16];
            key_rng.fill(&mut key);
            Some(key)
        }
        SecurityLevel::Basic => None,
    };

    let mut next_session_id = || {
        let mut bytes = [0u8; 4];
        key_rng.fill(&mut bytes);
        u32::from_le_bytes(bytes)
    };

    let params = |session_id: u32| UwbParams {
        session_id,
        config_id,
        channel,
        preamble_index,
        slot_duration_ms,
        update_rate,
        security: request.security,
        session_key,
        device_role: request.role,
    };

    // Multicast profile: every peer shares one radio session. Unicast: one
    // session per peer.
    let configs = if config_id.is_multicast() {
        let topology = PeerTopology::Multicast(peers.iter().map(|(id, _)| *id).collect());
        vec![
            TechnologyConfig::new(topology, PerTechnologyConfig::Uwb(params(next_session_id())))
                .expect("selected multicast config failed validation"),
        ]
    } else {
        peers
            .iter()
            .map(|(id, _)| {
                TechnologyConfig::new(
                    PeerTopology::Unicast(*id),
                    PerTechnologyConfig::Uwb(params(next_session_id())),
                )
                .expect("selected unicast config failed validation")
            })
            .collect()
    };

    let replies = peers
        .iter()
        .map(|(id, _)| {
            (
                *id,
                ConfigReplyEnvelope {
                    proto_version: OOB_PROTO_VERSION,
                    config_id,
                    channel,
                    preamble_index,
                    slot_duration_ms,
                    interval_ms: interval_ms as u16,
                    session_key,
                },
            )
        })
        .collect();

    info!(
        "oob: selected {config_id:?} ch={channel} preamble={preamble_index} \
         slot={slot_duration_ms}ms rate={update_rate:?} ({interval_ms}ms) for {} peer(s)",
        peers.len()
    );
    debug!("oob: negotiated interval window {range:?}");

    Ok(UwbSelection {
        configs,
        replies,
        update_rate,
        interval_ms,
    })
}

/// Build our own advertisement from local capabilities.
pub fn local_envelope(role: DeviceRole, local: &UwbCapabilities) -> CapabilityEnvelope {
    CapabilityEnvelope {
        proto_version: OOB_PROTO_VERSION,
        role,
        uwb: UwbCapabilityPayload {
            config_ids: local.config_ids.clone(),
            channels: local.channels.clone(),
            preamble_indexes: local.preamble_indexes.clone(),
            min_interval_ms: local.min_interval_ms.min(u32::from(u16::MAX)) as u16,
            min_slot_ms: local
                .slot_durations_ms
                .iter()
                .copied()
                .min()
                .unwrap_or(2),
            supported_roles: local.supported_roles,
            address: local.address,
        },
    }
}
