//! OOB sessions end to end: capability exchange over a loopback transport,
//! selection, config delivery, and the failure paths.

mod common;

use common::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ranging_core::event::{SessionEvent, StopReason};
use ranging_core::oob::{OobConnector, OobError};
use ranging_core::registry::{ClientId, SessionRegistry};
use ranging_types::{
    oob_wire::OOB_PROTO_VERSION, Availability, CapabilityEnvelope, ConfigReplyEnvelope,
    DeviceHandle, DeviceRole, IntervalRange, PeerId, PreferenceBundle, PerTechnologyConfig,
    RoleSet, SecurityLevel, SessionConfig, SessionPreference, Technology,
    TechnologyCapabilities, UpdateRate, UwbCapabilities, UwbCapabilityPayload, UwbConfigId,
};

const CLIENT: ClientId = ClientId(3);

/// In-process OOB transport. Every envelope round-trips through the real
/// binary codec, so the wire layout is exercised too.
struct LoopbackOob {
    peers: HashMap<PeerId, UwbCapabilityPayload>,
    sent: Mutex<Vec<(PeerId, ConfigReplyEnvelope)>>,
}

impl LoopbackOob {
    fn new(peers: Vec<(PeerId, UwbCapabilityPayload)>) -> Arc<Self> {
        Arc::new(Self {
            peers: peers.into_iter().collect(),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(PeerId, ConfigReplyEnvelope)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OobConnector for LoopbackOob {
    async fn exchange_capabilities(
        &self,
        handle: DeviceHandle,
        local: &CapabilityEnvelope,
    ) -> Result<CapabilityEnvelope, OobError> {
        // Exercise the codec on our own advertisement as a peer would see it
        let local_wire = local.encode()?;
        CapabilityEnvelope::decode(&mut local_wire.freeze())?;

        let payload = self
            .peers
            .get(&handle.peer_id)
            .cloned()
            .ok_or(OobError::PeerRejected)?;
        let envelope = CapabilityEnvelope {
            proto_version: OOB_PROTO_VERSION,
            role: DeviceRole::Responder,
            uwb: payload,
        };
        let wire = envelope.encode()?;
        Ok(CapabilityEnvelope::decode(&mut wire.freeze())?)
    }

    async fn send_config(
        &self,
        handle: DeviceHandle,
        reply: &ConfigReplyEnvelope,
    ) -> Result<(), OobError> {
        // Wire round-trip here too
        let decoded = ConfigReplyEnvelope::decode(&mut reply.encode().freeze())?;
        self.sent.lock().unwrap().push((handle.peer_id, decoded));
        Ok(())
    }
}

fn local_uwb_caps() -> UwbCapabilities {
    UwbCapabilities {
        config_ids: vec![
            UwbConfigId::UnicastDsTwr,
            UwbConfigId::MulticastDsTwr,
            UwbConfigId::ProvisionedUnicastDsTwr,
            UwbConfigId::UnicastDsTwrVeryFast,
        ],
        channels: vec![5, 9],
        preamble_indexes: vec![9, 10, 25, 29],
        min_interval_ms: 96,
        slot_durations_ms: vec![1, 2],
        update_rates: vec![UpdateRate::Fast, UpdateRate::Normal, UpdateRate::Infrequent],
        supports_aoa: true,
        supported_roles: RoleSet::both(),
        address: [0x11; 16],
    }
}

fn peer_payload(config_ids: Vec<UwbConfigId>, min_interval_ms: u16) -> UwbCapabilityPayload {
    UwbCapabilityPayload {
        config_ids,
        channels: vec![9],
        preamble_indexes: vec![9, 29],
        min_interval_ms,
        min_slot_ms: 2,
        supported_roles: RoleSet::both(),
        address: [0x22; 16],
    }
}

fn oob_preference(peers: Vec<DeviceHandle>, security: SecurityLevel) -> SessionPreference {
    SessionPreference {
        role: DeviceRole::Initiator,
        config: SessionConfig::default(),
        bundle: PreferenceBundle::Oob {
            peers,
            interval: IntervalRange::new(100, 500).unwrap(),
            security,
        },
    }
}

#[tokio::test]
async fn secure_oob_session_negotiates_and_starts() {
    let factory = MockFactory::new();
    let uwb_a = factory.plan(Technology::Uwb, MockBehavior::default());
    let uwb_b = factory.plan(Technology::Uwb, MockBehavior::default());

    let oob = LoopbackOob::new(vec![
        (
            P1,
            peer_payload(
                vec![
                    UwbConfigId::ProvisionedUnicastDsTwr,
                    UwbConfigId::UnicastDsTwr,
                ],
                96,
            ),
        ),
        (P2, peer_payload(vec![UwbConfigId::ProvisionedUnicastDsTwr], 96)),
    ]);
    let ctx = test_context_with_oob(factory, oob.clone(), test_options());
    ctx.capabilities.update(
        Technology::Uwb,
        Availability::Enabled,
        Some(TechnologyCapabilities::Uwb(local_uwb_caps())),
    );
    let registry = SessionRegistry::new(ctx);

    let handles = vec![
        DeviceHandle { peer_id: P1, token: 1 },
        DeviceHandle { peer_id: P2, token: 2 },
    ];
    let (_handle, mut events) = registry
        .start_session(CLIENT, oob_preference(handles, SecurityLevel::Secure))
        .await
        .unwrap();

    // Both unicast adapters come up with the negotiated secure config
    for control in [&uwb_a, &uwb_b] {
        control.wait_for_start().await;
        let config = control.started_config().expect("adapter started");
        match config.params() {
            PerTechnologyConfig::Uwb(params) => {
                assert_eq!(params.config_id, UwbConfigId::ProvisionedUnicastDsTwr);
                assert_eq!(params.channel, 9);
                assert_eq!(params.preamble_index, 29);
                assert_eq!(params.slot_duration_ms, 2);
                assert_eq!(params.update_rate, UpdateRate::Normal);
                assert_eq!(params.security, SecurityLevel::Secure);
                assert!(params.session_key.is_some());
            }
            other => panic!("expected UWB params, got {other:?}"),
        }
        control.emit_started(config.peers()).await;
    }

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::SessionStarted
    ));

    // Every peer received the same selected config and the same key
    let sent = oob.sent();
    assert_eq!(sent.len(), 2);
    let keys: Vec<[u8; 16]> = sent
        .iter()
        .map(|(_, r)| r.session_key.expect("secure reply carries the key"))
        .collect();
    assert_eq!(keys[0], keys[1]);
    for (_, reply) in &sent {
        assert_eq!(reply.config_id, UwbConfigId::ProvisionedUnicastDsTwr);
        assert_eq!(reply.interval_ms, 200);
    }
}

#[tokio::test]
async fn incompatible_peer_fails_the_whole_selection() {
    let factory = MockFactory::new();
    let _unused = factory.plan(Technology::Uwb, MockBehavior::default());

    // Second peer cannot range faster than 800ms; the window is [100, 500]
    let oob = LoopbackOob::new(vec![
        (P1, peer_payload(vec![UwbConfigId::UnicastDsTwr], 96)),
        (P2, peer_payload(vec![UwbConfigId::UnicastDsTwr], 800)),
    ]);
    let ctx = test_context_with_oob(factory, oob.clone(), test_options());
    ctx.capabilities.update(
        Technology::Uwb,
        Availability::Enabled,
        Some(TechnologyCapabilities::Uwb(local_uwb_caps())),
    );
    let registry = SessionRegistry::new(ctx);

    let handles = vec![
        DeviceHandle { peer_id: P1, token: 1 },
        DeviceHandle { peer_id: P2, token: 2 },
    ];
    let (_handle, mut events) = registry
        .start_session(CLIENT, oob_preference(handles, SecurityLevel::Basic))
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::SessionStopped {
            reason: StopReason::Unsupported
        }
    ));
    assert!(oob.sent().is_empty(), "no config may reach any peer");
}

#[tokio::test]
async fn oob_session_without_enabled_uwb_is_unsupported() {
    let factory = MockFactory::new();
    let oob = LoopbackOob::new(vec![(P1, peer_payload(vec![UwbConfigId::UnicastDsTwr], 96))]);
    // Capability registry never reports UWB as Enabled
    let registry = SessionRegistry::new(test_context_with_oob(factory, oob, test_options()));

    let handles = vec![DeviceHandle { peer_id: P1, token: 1 }];
    let (_handle, mut events) = registry
        .start_session(CLIENT, oob_preference(handles, SecurityLevel::Basic))
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::SessionStopped {
            reason: StopReason::Unsupported
        }
    ));
}
