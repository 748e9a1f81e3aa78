//! # ranging-sim
//!
//! Drives a real ranging session against synthetic adapters: noisy UWB / CS /
//! RTT / RSSI streams, the full session state machine, per-peer fusion, and
//! the event stream a client would see. Useful for eyeballing fusion
//! behavior and as an end-to-end smoke rig.
//!
//! ```text
//! ranging-sim --peers 3 --technologies uwb,cs --duration-secs 10
//! ```

mod sim_adapter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use ranging_core::context::{CoreContext, MonotonicClock, OsKeyRng, ServiceOptions};
use ranging_core::event::SessionEvent;
use ranging_core::metrics::LogMetricsSink;
use ranging_core::oob::UnsupportedOobConnector;
use ranging_core::registry::{ClientId, SessionRegistry};
use ranging_core::CapabilityRegistry;
use ranging_types::{
    DeviceRole, PeerId, PeerTopology, PerTechnologyConfig, PreferenceBundle, RssiParams, RttParams,
    CsParams, SecurityLevel, SessionConfig, SessionPreference, Technology, TechnologyConfig,
    UpdateRate, UwbConfigId, UwbParams,
};

use sim_adapter::{NoiseProfile, SimAdapterFactory, SimProfileFile};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "ranging-sim", about = "Synthetic ranging session driver")]
struct Args {
    /// Number of simulated peers
    #[arg(long, default_value_t = 2)]
    peers: u8,

    /// Comma-separated technologies: uwb, cs, rtt, rssi
    #[arg(long, default_value = "uwb,cs")]
    technologies: String,

    /// How long to range before stopping
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Disable the preferential fuser (stream every technology)
    #[arg(long)]
    no_fusion: bool,

    /// Optional TOML noise-profile overrides
    #[arg(long)]
    profile: Option<PathBuf>,
}

fn parse_technologies(list: &str) -> anyhow::Result<Vec<Technology>> {
    let mut out = Vec::new();
    for part in list.split(',') {
        let tech = match part.trim().to_ascii_lowercase().as_str() {
            "uwb" => Technology::Uwb,
            "cs" => Technology::Cs,
            "rtt" => Technology::Rtt,
            "rssi" => Technology::Rssi,
            other => bail!("unknown technology {other:?}"),
        };
        if !out.contains(&tech) {
            out.push(tech);
        }
    }
    if out.is_empty() {
        bail!("no technologies selected");
    }
    Ok(out)
}

fn profile_key(technology: Technology) -> &'static str {
    match technology {
        Technology::Uwb => "uwb",
        Technology::Cs => "cs",
        Technology::Rtt => "rtt",
        Technology::Rssi => "rssi",
    }
}

fn config_for(technology: Technology, peer: PeerId) -> anyhow::Result<TechnologyConfig> {
    let params = match technology {
        Technology::Uwb => PerTechnologyConfig::Uwb(UwbParams {
            session_id: u32::from(peer.as_bytes()[15]),
            config_id: UwbConfigId::UnicastDsTwr,
            channel: 9,
            preamble_index: 10,
            slot_duration_ms: 2,
            update_rate: UpdateRate::Normal,
            security: SecurityLevel::Basic,
            session_key: None,
            device_role: DeviceRole::Initiator,
        }),
        Technology::Cs => PerTechnologyConfig::Cs(CsParams {
            security: SecurityLevel::Basic,
            update_rate: UpdateRate::Normal,
        }),
        Technology::Rtt => PerTechnologyConfig::Rtt(RttParams {
            service_name: "ranging-sim".into(),
            update_rate: UpdateRate::Normal,
            periodic: true,
        }),
        Technology::Rssi => PerTechnologyConfig::Rssi(RssiParams {
            update_rate: UpdateRate::Normal,
        }),
    };
    TechnologyConfig::new(PeerTopology::Unicast(peer), params)
        .context("building simulated config")
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ranging_sim=info,ranging_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let technologies = parse_technologies(&args.technologies)?;
    info!(
        "📡 ranging-sim: {} peer(s) over {technologies:?} for {}s",
        args.peers, args.duration_secs
    );

    // Noise profiles: defaults, then TOML overrides
    let overrides: SimProfileFile = match &args.profile {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).context("parsing noise profile")?
        }
        None => SimProfileFile::default(),
    };
    let mut profiles: HashMap<Technology, NoiseProfile> = HashMap::new();
    for tech in &technologies {
        let profile = overrides
            .profiles
            .get(profile_key(*tech))
            .cloned()
            .unwrap_or_else(|| NoiseProfile::default_for(*tech));
        profiles.insert(*tech, profile);
    }

    // Context wiring — the same shape a host process would build
    let clock = Arc::new(MonotonicClock::new());
    let factory = Arc::new(SimAdapterFactory::new(profiles, clock.clone()));
    let ctx = CoreContext {
        clock,
        key_rng: Arc::new(OsKeyRng),
        capabilities: Arc::new(CapabilityRegistry::new()),
        adapters: factory,
        oob: Arc::new(UnsupportedOobConnector),
        metrics: Arc::new(LogMetricsSink),
        options: ServiceOptions::default(),
    };
    let registry = SessionRegistry::new(ctx);

    // One unicast config per (technology, peer)
    let peers: Vec<PeerId> = (1..=u128::from(args.peers)).map(PeerId::from_u128).collect();
    let mut configs = Vec::new();
    for tech in &technologies {
        for peer in &peers {
            configs.push(config_for(*tech, *peer)?);
        }
    }

    let mut session_config = SessionConfig::default();
    session_config.sensor_fusion = !args.no_fusion;
    let preference = SessionPreference {
        role: DeviceRole::Initiator,
        config: session_config,
        bundle: PreferenceBundle::Raw { configs },
    };

    let client = ClientId(1);
    let (handle, mut events) = registry
        .start_session(client, preference)
        .await
        .context("starting session")?;

    // Stop after the requested duration
    let stopper = handle.clone();
    let duration = Duration::from_secs(args.duration_secs);
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        info!("⏱  duration elapsed, stopping");
        stopper.stop().await;
    });

    let mut per_tech: HashMap<Technology, u64> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::SessionStarted => info!("session running"),
            SessionEvent::TechnologyStarted { technology, peers } => {
                info!("{technology} started with {} peer(s)", peers.len());
            }
            SessionEvent::Data { peer, measurement } => {
                *per_tech.entry(measurement.technology).or_default() += 1;
                info!(
                    "{peer} {tech} {dist:.2}m conf={conf:.2}{aoa}",
                    tech = measurement.technology,
                    dist = measurement.distance_m,
                    conf = measurement.confidence.unwrap_or(0.0),
                    aoa = measurement
                        .azimuth_rad
                        .map(|a| format!(" az={:.2}rad", a))
                        .unwrap_or_default(),
                );
            }
            SessionEvent::TechnologyStopped {
                technology, reason, ..
            } => info!("{technology} stopped ({reason:?})"),
            SessionEvent::SessionStopped { reason } => {
                info!("session stopped ({reason:?})");
                break;
            }
        }
    }

    if per_tech.is_empty() {
        warn!("no measurements were produced");
    } else {
        for (tech, count) in &per_tech {
            info!("{tech}: {count} fused measurement(s)");
        }
    }
    Ok(())
}
