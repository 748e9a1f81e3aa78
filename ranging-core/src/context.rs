//! # context
//!
//! The injected service context. There is no global singleton: the host
//! constructs one `CoreContext` (clock, key RNG, capability registry, adapter
//! factory, OOB connector, metrics sink, options) and threads it through the
//! registry into every session.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

use ranging_types::UpdateRate;

use crate::adapter::AdapterFactory;
use crate::capability::CapabilityRegistry;
use crate::metrics::MetricsSink;
use crate::oob::OobConnector;

// ── Options ───────────────────────────────────────────────────────────────────

/// Process-wide tunables. `Default` reads env overrides, the same way the
/// host deployment configures everything else.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// How long to wait for an adapter to acknowledge `stop` (default 10s)
    pub watchdog_ms: u64,
    /// Smallest filter window (default 3)
    pub min_fusion_window: usize,
    /// Largest filter window (default 5, hard cap 5)
    pub max_fusion_window: usize,
    pub default_update_rate: UpdateRate,
    /// Backgrounded-app duty-cycle timeout (default 15s)
    pub background_timeout_ms: u64,
    /// Bound of the per-session client event channel (default 64)
    pub measurement_queue_depth: usize,
    /// Sessions one client may hold concurrently (default 8)
    pub max_sessions_per_client: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            watchdog_ms: env_parse("RANGING_WATCHDOG_MS", 10_000),
            min_fusion_window: env_parse("RANGING_MIN_FUSION_WINDOW", 3),
            max_fusion_window: env_parse("RANGING_MAX_FUSION_WINDOW", 5),
            default_update_rate: UpdateRate::Normal,
            background_timeout_ms: env_parse("RANGING_BACKGROUND_TIMEOUT_MS", 15_000),
            measurement_queue_depth: env_parse("RANGING_MEASUREMENT_QUEUE_DEPTH", 64),
            max_sessions_per_client: env_parse("RANGING_MAX_SESSIONS_PER_CLIENT", 8),
        }
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Monotonic millisecond clock. Injected so tests can pin time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Instant-anchored clock; zero is construction time.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

// ── Session key RNG ───────────────────────────────────────────────────────────

/// Source of provisioned-STS session keys. Must be cryptographically strong
/// in production; injected so tests can pin keys.
pub trait SessionKeyRng: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// OS entropy via getrandom.
pub struct OsKeyRng;

impl SessionKeyRng for OsKeyRng {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

// ── The context ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CoreContext {
    pub clock: Arc<dyn Clock>,
    pub key_rng: Arc<dyn SessionKeyRng>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub adapters: Arc<dyn AdapterFactory>,
    pub oob: Arc<dyn OobConnector>,
    pub metrics: Arc<dyn MetricsSink>,
    pub options: ServiceOptions,
}

impl CoreContext {
    /// Production wiring: real clock, OS entropy, caller-supplied backends.
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        adapters: Arc<dyn AdapterFactory>,
        oob: Arc<dyn OobConnector>,
        metrics: Arc<dyn MetricsSink>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            key_rng: Arc::new(OsKeyRng),
            capabilities,
            adapters,
            oob,
            metrics,
            options,
        }
    }

    /// Filter window clamped to the configured bounds and the hard cap of 5.
    pub fn fusion_window(&self) -> usize {
        let lo = self.options.min_fusion_window.clamp(1, 5);
        self.options.max_fusion_window.clamp(lo, 5)
    }
}
