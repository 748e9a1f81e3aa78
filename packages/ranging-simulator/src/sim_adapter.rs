//! sim_adapter.rs — synthetic ranging adapters
//!
//! One `SimAdapter` per technology config, implementing the real
//! `RangingAdapter` contract: peers move on a slow sinusoidal track, every
//! tick draws a Gaussian range sample (with an occasional positive NLOS
//! bias), and UWB additionally reports noisy azimuth/elevation. Background
//! hints stretch the tick interval the way a duty-cycled radio would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info};

use ranging_core::adapter::{
    AdapterError, AdapterEvent, AdapterEventTx, AdapterFactory, CloseReason, RangingAdapter,
};
use ranging_core::context::Clock;
use ranging_types::{PeerId, RawMeasurement, Technology, TechnologyConfig};

// ── Noise profiles ────────────────────────────────────────────────────────────

/// Per-technology measurement noise. Defaults roughly follow the error
/// floors of the real radios.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoiseProfile {
    /// 1σ range noise, meters
    pub sigma_m: f64,
    /// Probability a tick is NLOS-biased
    pub nlos_rate: f64,
    /// Mean positive bias applied on NLOS ticks, meters
    pub nlos_bias_m: f64,
    /// Report azimuth/elevation (UWB-style PDoA)
    pub aoa: bool,
    /// 1σ angle noise, radians
    pub sigma_aoa_rad: f64,
}

impl Default for NoiseProfile {
    fn default() -> Self {
        Self {
            sigma_m: 0.07,
            nlos_rate: 0.05,
            nlos_bias_m: 0.30,
            aoa: false,
            sigma_aoa_rad: 0.05,
        }
    }
}

impl NoiseProfile {
    pub fn default_for(technology: Technology) -> Self {
        match technology {
            Technology::Uwb => Self {
                sigma_m: 0.07,
                aoa: true,
                ..Self::default()
            },
            Technology::Cs => Self {
                sigma_m: 0.30,
                ..Self::default()
            },
            Technology::Rtt => Self {
                sigma_m: 1.00,
                nlos_rate: 0.10,
                ..Self::default()
            },
            Technology::Rssi => Self {
                sigma_m: 2.00,
                nlos_rate: 0.15,
                nlos_bias_m: 1.0,
                ..Self::default()
            },
        }
    }
}

/// Optional TOML override file: `[profiles.uwb] sigma_m = 0.05` etc.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimProfileFile {
    #[serde(default)]
    pub profiles: HashMap<String, NoiseProfile>,
}

// ── Peer motion ───────────────────────────────────────────────────────────────

/// Ground-truth track: base distance plus a slow sinusoidal walk. Phase is
/// seeded from the peer id so peers do not move in lockstep.
fn true_distance_m(peer: PeerId, t_secs: f64) -> f64 {
    let seed = peer.as_bytes()[15] as f64;
    let base = 3.0 + (seed % 7.0);
    let phase = seed * 0.7;
    base + 1.5 * (0.15 * t_secs * std::f64::consts::TAU + phase).sin()
}

fn true_azimuth_rad(peer: PeerId, t_secs: f64) -> f64 {
    let seed = peer.as_bytes()[15] as f64;
    (0.05 * t_secs * std::f64::consts::TAU + seed).sin() * 1.2
}

// ── The adapter ───────────────────────────────────────────────────────────────

struct SimInner {
    stop_tx: Option<watch::Sender<bool>>,
}

pub struct SimAdapter {
    technology: Technology,
    profile: NoiseProfile,
    clock: Arc<dyn Clock>,
    interval_ms: Arc<AtomicU32>,
    throttled: Arc<AtomicBool>,
    inner: Mutex<SimInner>,
}

impl SimAdapter {
    pub fn new(technology: Technology, profile: NoiseProfile, clock: Arc<dyn Clock>) -> Self {
        Self {
            technology,
            profile,
            clock,
            interval_ms: Arc::new(AtomicU32::new(200)),
            throttled: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(SimInner { stop_tx: None }),
        }
    }
}

#[async_trait]
impl RangingAdapter for SimAdapter {
    fn technology(&self) -> Technology {
        self.technology
    }

    async fn start(
        &self,
        config: TechnologyConfig,
        events: AdapterEventTx,
    ) -> Result<(), AdapterError> {
        let peers = config.peers();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock().expect("sim adapter state");
            if inner.stop_tx.is_some() {
                return Err(AdapterError::AlreadyStarted);
            }
            inner.stop_tx = Some(stop_tx);
        }

        self.interval_ms
            .store(config.params().update_rate().interval_ms(), Ordering::Relaxed);

        let technology = self.technology;
        let profile = self.profile.clone();
        let clock = self.clock.clone();
        let interval_ms = self.interval_ms.clone();
        let throttled = self.throttled.clone();

        tokio::spawn(async move {
            let _ = events.send(AdapterEvent::Started { peers: peers.clone() }).await;
            info!("sim: {technology} ranging {} peer(s)", peers.len());
            let started = std::time::Instant::now();

            loop {
                let mut tick = u64::from(interval_ms.load(Ordering::Relaxed));
                if throttled.load(Ordering::Relaxed) {
                    // Backgrounded apps get a quarter of the duty cycle
                    tick *= 4;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(tick)) => {}
                    _ = stop_rx.changed() => break,
                }

                let t_secs = started.elapsed().as_secs_f64();
                let now_ms = clock.now_ms();
                for peer in &peers {
                    let measurement = synth_measurement(technology, &profile, *peer, t_secs, now_ms);
                    if events
                        .send(AdapterEvent::Data {
                            peer: *peer,
                            measurement,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            let _ = events.send(AdapterEvent::Stopped { peers }).await;
            let _ = events
                .send(AdapterEvent::Closed {
                    reason: CloseReason::LocalRequest,
                })
                .await;
            debug!("sim: {technology} closed");
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let stop_tx = self.inner.lock().expect("sim adapter state").stop_tx.take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        Ok(())
    }

    async fn reconfigure_interval(&self, interval_ms: u32) -> Result<(), AdapterError> {
        self.interval_ms.store(interval_ms.max(10), Ordering::Relaxed);
        Ok(())
    }

    fn app_foreground_changed(&self, foreground: bool) {
        if foreground {
            self.throttled.store(false, Ordering::Relaxed);
        }
    }

    fn background_timeout(&self) {
        self.throttled.store(true, Ordering::Relaxed);
    }
}

fn synth_measurement(
    technology: Technology,
    profile: &NoiseProfile,
    peer: PeerId,
    t_secs: f64,
    now_ms: u64,
) -> RawMeasurement {
    let mut rng = rand::thread_rng();
    let truth = true_distance_m(peer, t_secs);

    let noise = Normal::new(0.0, profile.sigma_m)
        .expect("sigma is finite and positive")
        .sample(&mut rng);
    let nlos_bias = if rng.gen_bool(profile.nlos_rate.clamp(0.0, 1.0)) {
        Normal::new(profile.nlos_bias_m, profile.nlos_bias_m / 3.0)
            .expect("bias is finite")
            .sample(&mut rng)
            .max(0.0)
    } else {
        0.0
    };

    let mut measurement = RawMeasurement::distance_only(
        technology,
        now_ms,
        (truth + noise + nlos_bias).max(0.0),
    );
    measurement.error_m = Some(profile.sigma_m);

    if profile.aoa {
        let angle_noise = Normal::new(0.0, profile.sigma_aoa_rad).expect("sigma is finite");
        measurement.azimuth_rad = Some(true_azimuth_rad(peer, t_secs) + angle_noise.sample(&mut rng));
        measurement.elevation_rad = Some(angle_noise.sample(&mut rng) * 0.3);
    }
    if technology == Technology::Rssi {
        measurement.rssi_dbm = Some(-45 - (truth * 2.0) as i16);
    }

    measurement
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct SimAdapterFactory {
    profiles: HashMap<Technology, NoiseProfile>,
    clock: Arc<dyn Clock>,
}

impl SimAdapterFactory {
    pub fn new(profiles: HashMap<Technology, NoiseProfile>, clock: Arc<dyn Clock>) -> Self {
        Self { profiles, clock }
    }
}

impl AdapterFactory for SimAdapterFactory {
    fn create(&self, technology: Technology) -> Option<Box<dyn RangingAdapter>> {
        let profile = self.profiles.get(&technology)?.clone();
        Some(Box::new(SimAdapter::new(
            technology,
            profile,
            self.clock.clone(),
        )))
    }
}
