//! Out-of-band message envelopes.
//!
//! Capability exchange runs over whatever OOB transport the host provides
//! (GATT, NAN follow-up, …). The payload is a fixed-order binary layout, not
//! serde — both ends may be different stacks entirely.
//!
//! ## Wire layout (version 1)
//!
//! `CapabilityEnvelope`:
//! ```text
//! u8  proto_version
//! u8  sender role            (0 = INITIATOR, 1 = RESPONDER)
//! u8  n, then n × u8         config id list
//! u8  n, then n × u8         channel list
//! u8  n, then n × u8         preamble index list
//! u16 LE                     min ranging interval, ms
//! u8                         min slot duration, ms (1 or 2)
//! u8                         supported-roles bitmask (bit0 = INITIATOR)
//! [u8; 16]                   UWB address, zero-padded
//! ```
//!
//! `ConfigReplyEnvelope` carries the single selected config:
//! ```text
//! u8  proto_version
//! u8  config id
//! u8  channel
//! u8  preamble index
//! u8  slot duration, ms
//! u16 LE                     ranging interval, ms
//! u8  key flag, then [u8;16] session key iff flag == 1 (Secure)
//! ```
//!
//! Unknown discriminants and truncated input are decode errors; nothing is
//! coerced to a default.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::capabilities::RoleSet;
use crate::config::{DeviceRole, UwbConfigId};

pub const OOB_PROTO_VERSION: u8 = 1;

/// Lists are u8-length-prefixed; 255 entries is far above any real set.
const MAX_LIST_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown config id {0}")]
    UnknownConfigId(u8),
    #[error("unknown device role {0}")]
    UnknownRole(u8),
    #[error("unknown role bits {0:#04x}")]
    UnknownRoleBits(u8),
    #[error("slot duration must be 1 or 2 ms, got {0}")]
    BadSlotDuration(u8),
    #[error("list longer than {MAX_LIST_LEN} entries")]
    Oversized,
}

// ── Buf helpers ───────────────────────────────────────────────────────────────

fn take_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16_le(buf: &mut impl Buf) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn take_array16(buf: &mut impl Buf) -> Result<[u8; 16], WireError> {
    if buf.remaining() < 16 {
        return Err(WireError::Truncated);
    }
    let mut out = [0u8; 16];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_u8_list(buf: &mut impl Buf) -> Result<Vec<u8>, WireError> {
    let len = take_u8(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn put_u8_list(buf: &mut BytesMut, items: &[u8]) -> Result<(), WireError> {
    if items.len() > MAX_LIST_LEN {
        return Err(WireError::Oversized);
    }
    buf.put_u8(items.len() as u8);
    buf.put_slice(items);
    Ok(())
}

// ── Capability advertisement ──────────────────────────────────────────────────

/// The UWB section of a peer's capability advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct UwbCapabilityPayload {
    pub config_ids: Vec<UwbConfigId>,
    pub channels: Vec<u8>,
    pub preamble_indexes: Vec<u8>,
    pub min_interval_ms: u16,
    /// Shortest slot the peer supports; it can run any slot >= this
    pub min_slot_ms: u8,
    pub supported_roles: RoleSet,
    pub address: [u8; 16],
}

impl UwbCapabilityPayload {
    /// Slot durations the peer can run, subset of {1, 2}.
    pub fn slot_durations_ms(&self) -> Vec<u8> {
        [1u8, 2].iter().copied().filter(|s| *s >= self.min_slot_ms).collect()
    }
}

/// Capability advertisement exchanged during OOB discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEnvelope {
    pub proto_version: u8,
    /// The role the sender intends to take
    pub role: DeviceRole,
    pub uwb: UwbCapabilityPayload,
}

impl CapabilityEnvelope {
    pub fn encode(&self) -> Result<BytesMut, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.proto_version);
        buf.put_u8(self.role.as_u8());
        let ids: Vec<u8> = self.uwb.config_ids.iter().map(|c| c.as_u8()).collect();
        put_u8_list(&mut buf, &ids)?;
        put_u8_list(&mut buf, &self.uwb.channels)?;
        put_u8_list(&mut buf, &self.uwb.preamble_indexes)?;
        buf.put_u16_le(self.uwb.min_interval_ms);
        buf.put_u8(self.uwb.min_slot_ms);
        buf.put_u8(self.uwb.supported_roles.bits());
        buf.put_slice(&self.uwb.address);
        Ok(buf)
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let proto_version = take_u8(buf)?;
        if proto_version != OOB_PROTO_VERSION {
            return Err(WireError::BadVersion(proto_version));
        }
        let role = DeviceRole::try_from_u8(take_u8(buf)?).map_err(WireError::UnknownRole)?;
        let config_ids = take_u8_list(buf)?
            .into_iter()
            .map(|v| UwbConfigId::try_from_u8(v).map_err(WireError::UnknownConfigId))
            .collect::<Result<Vec<_>, _>>()?;
        let channels = take_u8_list(buf)?;
        let preamble_indexes = take_u8_list(buf)?;
        let min_interval_ms = take_u16_le(buf)?;
        let min_slot_ms = take_u8(buf)?;
        if !matches!(min_slot_ms, 1 | 2) {
            return Err(WireError::BadSlotDuration(min_slot_ms));
        }
        let supported_roles =
            RoleSet::try_from_bits(take_u8(buf)?).map_err(WireError::UnknownRoleBits)?;
        let address = take_array16(buf)?;
        Ok(Self {
            proto_version,
            role,
            uwb: UwbCapabilityPayload {
                config_ids,
                channels,
                preamble_indexes,
                min_interval_ms,
                min_slot_ms,
                supported_roles,
                address,
            },
        })
    }
}

// ── Selected-config reply ─────────────────────────────────────────────────────

/// The reply each peer receives once selection succeeds. All peers of one
/// Secure session carry the same 16-byte key.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigReplyEnvelope {
    pub proto_version: u8,
    pub config_id: UwbConfigId,
    pub channel: u8,
    pub preamble_index: u8,
    pub slot_duration_ms: u8,
    pub interval_ms: u16,
    pub session_key: Option<[u8; 16]>,
}

impl ConfigReplyEnvelope {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(self.proto_version);
        buf.put_u8(self.config_id.as_u8());
        buf.put_u8(self.channel);
        buf.put_u8(self.preamble_index);
        buf.put_u8(self.slot_duration_ms);
        buf.put_u16_le(self.interval_ms);
        match &self.session_key {
            Some(key) => {
                buf.put_u8(1);
                buf.put_slice(key);
            }
            None => buf.put_u8(0),
        }
        buf
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let proto_version = take_u8(buf)?;
        if proto_version != OOB_PROTO_VERSION {
            return Err(WireError::BadVersion(proto_version));
        }
        let config_id =
            UwbConfigId::try_from_u8(take_u8(buf)?).map_err(WireError::UnknownConfigId)?;
        let channel = take_u8(buf)?;
        let preamble_index = take_u8(buf)?;
        let slot_duration_ms = take_u8(buf)?;
        if !matches!(slot_duration_ms, 1 | 2) {
            return Err(WireError::BadSlotDuration(slot_duration_ms));
        }
        let interval_ms = take_u16_le(buf)?;
        let session_key = match take_u8(buf)? {
            0 => None,
            _ => Some(take_array16(buf)?),
        };
        Ok(Self {
            proto_version,
            config_id,
            channel,
            preamble_index,
            slot_duration_ms,
            interval_ms,
            session_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> CapabilityEnvelope {
        CapabilityEnvelope {
            proto_version: OOB_PROTO_VERSION,
            role: DeviceRole::Responder,
            uwb: UwbCapabilityPayload {
                config_ids: vec![
                    UwbConfigId::ProvisionedUnicastDsTwr,
                    UwbConfigId::UnicastDsTwr,
                ],
                channels: vec![5, 9],
                preamble_indexes: vec![9, 10, 29],
                min_interval_ms: 96,
                min_slot_ms: 2,
                supported_roles: RoleSet::both(),
                address: [0xAB; 16],
            },
        }
    }

    #[test]
    fn capability_envelope_roundtrip() {
        let env = sample_envelope();
        let bytes = env.encode().unwrap();
        let decoded = CapabilityEnvelope::decode(&mut bytes.freeze()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn truncated_envelope_is_an_error() {
        let bytes = sample_envelope().encode().unwrap();
        for cut in 0..bytes.len() {
            let mut partial = bytes.clone().freeze();
            partial.truncate(cut);
            assert_eq!(
                CapabilityEnvelope::decode(&mut partial),
                Err(WireError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unknown_config_id_rejected() {
        let mut bytes = sample_envelope().encode().unwrap();
        // First config id byte sits after version, role, and the list length
        bytes[3] = 0x7F;
        assert_eq!(
            CapabilityEnvelope::decode(&mut bytes.freeze()),
            Err(WireError::UnknownConfigId(0x7F))
        );
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = sample_envelope().encode().unwrap();
        bytes[0] = 9;
        assert_eq!(
            CapabilityEnvelope::decode(&mut bytes.freeze()),
            Err(WireError::BadVersion(9))
        );
    }

    #[test]
    fn reply_roundtrip_with_key() {
        let reply = ConfigReplyEnvelope {
            proto_version: OOB_PROTO_VERSION,
            config_id: UwbConfigId::ProvisionedUnicastDsTwr,
            channel: 9,
            preamble_index: 29,
            slot_duration_ms: 2,
            interval_ms: 200,
            session_key: Some([0x42; 16]),
        };
        let decoded = ConfigReplyEnvelope::decode(&mut reply.encode().freeze()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn reply_roundtrip_without_key() {
        let reply = ConfigReplyEnvelope {
            proto_version: OOB_PROTO_VERSION,
            config_id: UwbConfigId::UnicastDsTwr,
            channel: 5,
            preamble_index: 9,
            slot_duration_ms: 1,
            interval_ms: 600,
            session_key: None,
        };
        let decoded = ConfigReplyEnvelope::decode(&mut reply.encode().freeze()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn min_slot_filters_slot_set() {
        let mut env = sample_envelope();
        assert_eq!(env.uwb.slot_durations_ms(), vec![2]);
        env.uwb.min_slot_ms = 1;
        assert_eq!(env.uwb.slot_durations_ms(), vec![1, 2]);
    }
}
