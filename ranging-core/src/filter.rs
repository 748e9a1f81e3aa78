//! # filter
//!
//! Per-(peer, technology) smoothing of range and angle streams.
//!
//! Each stream runs a small moving-median window (N <= 5) with outlier
//! rejection: once three samples are in the window, anything further than
//! 3σ from the window mean is dropped. Angles are unwrapped to ±π before
//! filtering so a stream hovering around the wrap point does not collapse
//! toward zero. AoA is fed as the (azimuth, elevation, distance) triple with
//! the distance stream driving the outlier gate — a rejected range drops the
//! matching angle samples too.
//!
//! Filters are stateless across sessions; re-creating a technology's filter
//! replaces (closes) the previous one.

use std::collections::VecDeque;
use std::f64::consts::{PI, TAU};

use ranging_types::{Measurement, RawMeasurement};

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    /// Window length, clamped to 1..=5
    pub window: usize,
    /// Rejection threshold in window standard deviations
    pub outlier_sigma: f64,
    /// σ floor for the distance gate, meters — keeps a perfectly still
    /// window from rejecting real motion
    pub distance_sigma_floor_m: f64,
}

impl FilterParams {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.clamp(1, 5),
            outlier_sigma: 3.0,
            distance_sigma_floor_m: 0.05,
        }
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self::new(5)
    }
}

// ── Moving-median stream ──────────────────────────────────────────────────────

/// One scalar stream: bounded ring of accepted samples plus an accept/reject
/// history of the same length for the confidence estimate.
#[derive(Debug)]
pub struct StreamFilter {
    values: VecDeque<f64>,
    accepts: VecDeque<bool>,
    window: usize,
    outlier_sigma: f64,
    sigma_floor: f64,
}

impl StreamFilter {
    pub fn new(window: usize, outlier_sigma: f64, sigma_floor: f64) -> Self {
        let window = window.clamp(1, 5);
        Self {
            values: VecDeque::with_capacity(window),
            accepts: VecDeque::with_capacity(window),
            window,
            outlier_sigma,
            sigma_floor,
        }
    }

    fn mean_std(&self) -> (f64, f64) {
        let n = self.values.len() as f64;
        let mean = self.values.iter().sum::<f64>() / n;
        let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    /// Returns whether the sample survived the outlier gate.
    pub fn add(&mut self, value: f64) -> bool {
        let accepted = if self.values.len() >= 3 {
            let (mean, std) = self.mean_std();
            let gate = self.outlier_sigma * std.max(self.sigma_floor);
            (value - mean).abs() <= gate
        } else {
            true
        };

        if accepted {
            if self.values.len() == self.window {
                self.values.pop_front();
            }
            self.values.push_back(value);
        }
        if self.accepts.len() == self.window {
            self.accepts.pop_front();
        }
        self.accepts.push_back(accepted);
        accepted
    }

    /// Median of the window. None only before the first sample.
    pub fn compute(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        })
    }

    /// Fraction of recent samples that survived the gate.
    pub fn confidence(&self) -> f64 {
        if self.accepts.is_empty() {
            return 1.0;
        }
        let accepted = self.accepts.iter().filter(|a| **a).count();
        accepted as f64 / self.accepts.len() as f64
    }
}

// ── Angle stream ──────────────────────────────────────────────────────────────

/// Wrap into [-π, π).
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut x = (angle + PI) % TAU;
    if x < 0.0 {
        x += TAU;
    }
    x - PI
}

/// Median filter over an unwrapped angle stream. Samples are unwrapped
/// relative to the previous sample so the window never straddles the ±π seam.
#[derive(Debug)]
pub struct AngleFilter {
    inner: StreamFilter,
    last_unwrapped: Option<f64>,
}

impl AngleFilter {
    pub fn new(window: usize, outlier_sigma: f64) -> Self {
        Self {
            // 30 mrad floor, same role as the distance floor
            inner: StreamFilter::new(window, outlier_sigma, 0.03),
            last_unwrapped: None,
        }
    }

    pub fn add(&mut self, angle: f64) -> bool {
        let unwrapped = match self.last_unwrapped {
            Some(prev) => prev + wrap_to_pi(angle - prev),
            None => wrap_to_pi(angle),
        };
        self.last_unwrapped = Some(unwrapped);
        self.inner.add(unwrapped)
    }

    pub fn compute(&self) -> Option<f64> {
        self.inner.compute().map(wrap_to_pi)
    }
}

// ── Per-technology pipeline ───────────────────────────────────────────────────

/// The full filter stack for one (peer, technology) stream.
#[derive(Debug)]
pub struct TechFilter {
    distance: StreamFilter,
    azimuth: Option<AngleFilter>,
    elevation: Option<AngleFilter>,
    params: FilterParams,
}

impl TechFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            distance: StreamFilter::new(
                params.window,
                params.outlier_sigma,
                params.distance_sigma_floor_m,
            ),
            azimuth: None,
            elevation: None,
            params,
        }
    }

    /// Add the raw sample and compute the filtered output. Always yields a
    /// measurement — by the time this runs at least one sample is in the
    /// window.
    pub fn process(&mut self, raw: &RawMeasurement) -> Measurement {
        let range_accepted = self.distance.add(raw.distance_m);

        // Angles only enter their windows when the driving range was accepted
        if let Some(az) = raw.azimuth_rad {
            let filter = self
                .azimuth
                .get_or_insert_with(|| AngleFilter::new(self.params.window, self.params.outlier_sigma));
            if range_accepted {
                filter.add(az);
            }
            if let (Some(el), true) = (raw.elevation_rad, range_accepted) {
                self.elevation
                    .get_or_insert_with(|| {
                        AngleFilter::new(self.params.window, self.params.outlier_sigma)
                    })
                    .add(el);
            }
        }

        let distance_m = self.distance.compute().unwrap_or(raw.distance_m);
        let azimuth_rad = self.azimuth.as_ref().and_then(AngleFilter::compute);
        // Elevation is only reported alongside azimuth
        let elevation_rad = match azimuth_rad {
            Some(_) => self.elevation.as_ref().and_then(AngleFilter::compute),
            None => None,
        };

        Measurement {
            technology: raw.technology,
            timestamp_ms: raw.timestamp_ms,
            distance_m,
            azimuth_rad,
            elevation_rad,
            rssi_dbm: raw.rssi_dbm,
            velocity_mps: raw.velocity_mps,
            confidence: Some(self.distance.confidence()),
            error_m: raw.error_m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_types::Technology;

    fn raw(ts: u64, distance: f64) -> RawMeasurement {
        RawMeasurement::distance_only(Technology::Uwb, ts, distance)
    }

    #[test]
    fn median_of_small_window() {
        let mut filter = StreamFilter::new(5, 3.0, 0.05);
        for v in [1.0, 3.0, 2.0] {
            filter.add(v);
        }
        assert_eq!(filter.compute(), Some(2.0));
    }

    #[test]
    fn compute_yields_after_first_sample() {
        let mut filter = StreamFilter::new(5, 3.0, 0.05);
        assert_eq!(filter.compute(), None);
        filter.add(4.2);
        assert_eq!(filter.compute(), Some(4.2));
    }

    #[test]
    fn outlier_beyond_three_sigma_is_dropped() {
        let mut filter = StreamFilter::new(5, 3.0, 0.05);
        for v in [1.0, 1.05, 0.95, 1.0] {
            assert!(filter.add(v));
        }
        assert!(!filter.add(25.0));
        // The spike never entered the window
        assert!(filter.compute().unwrap() < 1.1);
        assert!(filter.confidence() < 1.0);
    }

    #[test]
    fn still_window_accepts_small_motion() {
        let mut filter = StreamFilter::new(5, 3.0, 0.05);
        for _ in 0..5 {
            filter.add(2.0);
        }
        // σ is zero but the floor keeps a 10 cm step inside the gate
        assert!(filter.add(2.10));
    }

    #[test]
    fn window_is_bounded() {
        let mut filter = StreamFilter::new(3, 3.0, 0.05);
        for v in [1.0, 2.0, 3.0, 4.0] {
            filter.add(v);
        }
        assert_eq!(filter.values.len(), 3);
        assert_eq!(filter.compute(), Some(3.0));
    }

    #[test]
    fn angle_stream_survives_the_wrap_point() {
        let mut filter = AngleFilter::new(5, 3.0);
        for a in [3.10, -3.10, 3.12, -3.12] {
            filter.add(a);
        }
        let out = filter.compute().unwrap();
        // Median must stay near ±π, not average toward zero
        assert!(out.abs() > 3.0, "got {out}");
    }

    #[test]
    fn wrap_to_pi_bounds() {
        assert!((wrap_to_pi(TAU + 0.1) - 0.1).abs() < 1e-12);
        assert!((wrap_to_pi(-TAU - 0.1) + 0.1).abs() < 1e-12);
        assert_eq!(wrap_to_pi(PI), -PI);
    }

    #[test]
    fn rejected_range_gates_the_angles() {
        let mut filter = TechFilter::new(FilterParams::new(5));
        for i in 0..4u64 {
            let mut m = raw(i * 100, 1.0);
            m.azimuth_rad = Some(0.5);
            filter.process(&m);
        }
        // Range spike with a wild angle: both must be ignored
        let mut spike = raw(400, 30.0);
        spike.azimuth_rad = Some(-2.0);
        let out = filter.process(&spike);
        assert!(out.distance_m < 1.1);
        assert!((out.azimuth_rad.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn elevation_never_emitted_without_azimuth() {
        let mut filter = TechFilter::new(FilterParams::new(3));
        let mut m = raw(0, 2.0);
        m.elevation_rad = Some(0.3); // malformed adapter output
        let out = filter.process(&m);
        assert!(out.azimuth_rad.is_none());
        assert!(out.elevation_rad.is_none());
        assert!(out.validate().is_ok());
    }
}
