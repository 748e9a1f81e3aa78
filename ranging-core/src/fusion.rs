//! # fusion
//!
//! Per-peer reconciliation of concurrent technology streams.
//!
//! The fusion engine owns one [`TechFilter`] per active technology plus a
//! fuser. Every raw sample runs filter-add, filter-compute, then the fuser
//! decides whether the filtered measurement goes up to the client. The fuser
//! is a pure function of (measurement, active technology set); active-set
//! updates happen on the session's serial context, so they are atomic with
//! respect to `feed`.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use ranging_types::{Measurement, RawMeasurement, SessionConfig, Technology};

use crate::filter::{FilterParams, TechFilter};

// ── Fuser ─────────────────────────────────────────────────────────────────────

/// Pure selection policy over concurrent streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fuser {
    /// Every filtered measurement passes through
    Passthrough,
    /// Only the preferred technology passes while it is active; any
    /// technology passes once the preferred one drops out
    Preferential(Technology),
}

impl Fuser {
    /// Policy for a session: fusion disabled means passthrough; enabled means
    /// preferential with the highest-preference technology (UWB).
    pub fn for_session(config: &SessionConfig) -> Self {
        if config.sensor_fusion {
            Self::Preferential(Technology::Uwb)
        } else {
            Self::Passthrough
        }
    }

    pub fn fuse(
        &self,
        measurement: Measurement,
        active: &BTreeSet<Technology>,
    ) -> Option<Measurement> {
        match self {
            Self::Passthrough => Some(measurement),
            Self::Preferential(pref) => {
                if !active.contains(pref) || measurement.technology == *pref {
                    Some(measurement)
                } else {
                    None
                }
            }
        }
    }
}

// ── Fusion engine ─────────────────────────────────────────────────────────────

/// One per peer, created lazily on the peer's first sample and destroyed on
/// peer removal.
pub struct FusionEngine {
    filters: HashMap<Technology, TechFilter>,
    active: BTreeSet<Technology>,
    fuser: Fuser,
    /// Strict-monotonicity guard per technology stream
    last_ts: HashMap<Technology, u64>,
    params: FilterParams,
}

impl FusionEngine {
    pub fn new(fuser: Fuser, params: FilterParams) -> Self {
        Self {
            filters: HashMap::new(),
            active: BTreeSet::new(),
            fuser,
            last_ts: HashMap::new(),
            params,
        }
    }

    /// Mark a technology active for this peer. Re-activating replaces the
    /// existing filter (new radio session, new stream) and resets the
    /// timestamp guard.
    pub fn activate(&mut self, technology: Technology) {
        self.active.insert(technology);
        self.filters
            .insert(technology, TechFilter::new(self.params));
        self.last_ts.remove(&technology);
    }

    pub fn deactivate(&mut self, technology: Technology) {
        self.active.remove(&technology);
        self.filters.remove(&technology);
        self.last_ts.remove(&technology);
    }

    pub fn active(&self) -> &BTreeSet<Technology> {
        &self.active
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Filter + fuse one raw sample. None = fused away or stale timestamp.
    pub fn feed(&mut self, raw: RawMeasurement) -> Option<Measurement> {
        let tech = raw.technology;
        if !self.active.contains(&tech) {
            // First sample can beat the Started bookkeeping; treat it as the
            // activation point
            self.activate(tech);
        }

        if let Some(&last) = self.last_ts.get(&tech) {
            if raw.timestamp_ms <= last {
                trace!(
                    "fusion: dropping stale {tech} sample ({} <= {last})",
                    raw.timestamp_ms
                );
                return None;
            }
        }
        self.last_ts.insert(tech, raw.timestamp_ms);

        let filter = self.filters.get_mut(&tech)?;
        let filtered = filter.process(&raw);
        debug_assert!(filtered.validate().is_ok());
        self.fuser.fuse(filtered, &self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_types::RawMeasurement;

    fn raw(tech: Technology, ts: u64, distance: f64) -> RawMeasurement {
        RawMeasurement::distance_only(tech, ts, distance)
    }

    fn all_techs() -> BTreeSet<Technology> {
        Technology::ALL.into_iter().collect()
    }

    #[test]
    fn passthrough_is_identity_for_any_active_set() {
        let m = Measurement {
            technology: Technology::Rssi,
            timestamp_ms: 5,
            distance_m: 2.0,
            azimuth_rad: None,
            elevation_rad: None,
            rssi_dbm: Some(-60),
            velocity_mps: None,
            confidence: Some(1.0),
            error_m: None,
        };
        for active in [BTreeSet::new(), all_techs()] {
            let out = Fuser::Passthrough.fuse(m.clone(), &active).unwrap();
            assert_eq!(out.distance_m, m.distance_m);
            assert_eq!(out.technology, m.technology);
        }
    }

    #[test]
    fn preferential_passes_only_preferred_while_active() {
        let fuser = Fuser::Preferential(Technology::Uwb);
        let active: BTreeSet<Technology> =
            [Technology::Uwb, Technology::Cs].into_iter().collect();

        let uwb = Measurement {
            technology: Technology::Uwb,
            timestamp_ms: 1,
            distance_m: 1.0,
            azimuth_rad: None,
            elevation_rad: None,
            rssi_dbm: None,
            velocity_mps: None,
            confidence: None,
            error_m: None,
        };
        let mut cs = uwb.clone();
        cs.technology = Technology::Cs;

        assert!(fuser.fuse(uwb, &active).is_some());
        assert!(fuser.fuse(cs.clone(), &active).is_none());

        // Preferred technology gone: any technology falls through
        let without_uwb: BTreeSet<Technology> = [Technology::Cs].into_iter().collect();
        assert!(fuser.fuse(cs, &without_uwb).is_some());
    }

    #[test]
    fn engine_interleaved_streams_prefer_uwb() {
        // Mirrors the interleaved CS/UWB scenario: only UWB comes out while
        // both are active, CS flows after UWB deactivates.
        let mut engine = FusionEngine::new(
            Fuser::Preferential(Technology::Uwb),
            FilterParams::new(5),
        );
        engine.activate(Technology::Uwb);
        engine.activate(Technology::Cs);

        let mut emitted = Vec::new();
        for (tech, ts) in [
            (Technology::Cs, 10),
            (Technology::Uwb, 20),
            (Technology::Cs, 30),
            (Technology::Uwb, 40),
        ] {
            if let Some(m) = engine.feed(raw(tech, ts, 1.0)) {
                emitted.push(m.technology);
            }
        }
        assert_eq!(emitted, vec![Technology::Uwb, Technology::Uwb]);

        engine.deactivate(Technology::Uwb);
        let out = engine.feed(raw(Technology::Cs, 50, 1.1)).unwrap();
        assert_eq!(out.technology, Technology::Cs);
    }

    #[test]
    fn stale_timestamps_are_dropped() {
        let mut engine = FusionEngine::new(Fuser::Passthrough, FilterParams::new(5));
        assert!(engine.feed(raw(Technology::Uwb, 100, 1.0)).is_some());
        assert!(engine.feed(raw(Technology::Uwb, 100, 1.0)).is_none());
        assert!(engine.feed(raw(Technology::Uwb, 50, 1.0)).is_none());
        assert!(engine.feed(raw(Technology::Uwb, 101, 1.0)).is_some());
    }

    #[test]
    fn emitted_timestamps_strictly_monotonic_per_stream() {
        let mut engine = FusionEngine::new(Fuser::Passthrough, FilterParams::new(3));
        let mut last = None;
        for ts in [1u64, 2, 2, 5, 4, 9] {
            if let Some(m) = engine.feed(raw(Technology::Rtt, ts, 2.0)) {
                if let Some(prev) = last {
                    assert!(m.timestamp_ms > prev);
                }
                last = Some(m.timestamp_ms);
            }
        }
        assert_eq!(last, Some(9));
    }

    #[test]
    fn reactivation_resets_the_stream() {
        let mut engine = FusionEngine::new(Fuser::Passthrough, FilterParams::new(5));
        assert!(engine.feed(raw(Technology::Uwb, 1000, 1.0)).is_some());
        engine.deactivate(Technology::Uwb);
        engine.activate(Technology::Uwb);
        // New stream may legitimately restart its clock
        assert!(engine.feed(raw(Technology::Uwb, 1, 1.0)).is_some());
    }

    #[test]
    fn first_sample_activates_lazily() {
        let mut engine = FusionEngine::new(Fuser::Passthrough, FilterParams::new(5));
        assert!(engine.is_idle());
        assert!(engine.feed(raw(Technology::Rssi, 1, 3.0)).is_some());
        assert!(engine.active().contains(&Technology::Rssi));
    }
}
