//! Measurement records.
//!
//! `RawMeasurement` is what an adapter reports; `Measurement` is what the
//! fusion engine emits after filtering. Same shape — the filtered variant
//! additionally carries a confidence and has passed validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Technology;

// ── Raw (adapter-supplied) ────────────────────────────────────────────────────

/// One unfiltered sample from a single adapter for a single peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeasurement {
    pub technology: Technology,
    /// Monotonic service-clock milliseconds. Strictly increasing per
    /// (peer, technology) stream; the fusion engine drops violations.
    pub timestamp_ms: u64,
    /// Line-of-sight distance, meters. Never negative.
    pub distance_m: f64,
    /// Azimuth angle of arrival, radians in (-π, π]. UWB/CS only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azimuth_rad: Option<f64>,
    /// Elevation angle of arrival, radians. Only meaningful with azimuth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_rad: Option<f64>,
    /// Received signal strength, dBm (RSSI / CS)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<i16>,
    /// Radial velocity, m/s (positive = receding)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity_mps: Option<f64>,
    /// Adapter-reported 1σ range error, meters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_m: Option<f64>,
}

impl RawMeasurement {
    /// Minimal distance-only sample, the common case for RTT and RSSI.
    pub fn distance_only(technology: Technology, timestamp_ms: u64, distance_m: f64) -> Self {
        Self {
            technology,
            timestamp_ms,
            distance_m,
            azimuth_rad: None,
            elevation_rad: None,
            rssi_dbm: None,
            velocity_mps: None,
            error_m: None,
        }
    }

    pub fn has_aoa(&self) -> bool {
        self.azimuth_rad.is_some()
    }
}

// ── Filtered (fusion output) ──────────────────────────────────────────────────

/// One filtered, fused sample emitted to the client for a single peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub technology: Technology,
    pub timestamp_ms: u64,
    pub distance_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azimuth_rad: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation_rad: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity_mps: Option<f64>,
    /// Filter confidence in [0, 1] — fraction of the window that survived
    /// outlier rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_m: Option<f64>,
}

impl Measurement {
    pub fn has_aoa(&self) -> bool {
        self.azimuth_rad.is_some()
    }

    /// Shape invariants shared by every consumer. Elevation without azimuth
    /// is rejected — AoA-needing consumers key off azimuth presence.
    pub fn validate(&self) -> Result<(), MeasurementError> {
        if self.distance_m < 0.0 || !self.distance_m.is_finite() {
            return Err(MeasurementError::BadDistance(self.distance_m));
        }
        if self.elevation_rad.is_some() && self.azimuth_rad.is_none() {
            return Err(MeasurementError::ElevationWithoutAzimuth);
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MeasurementError::BadConfidence(c));
            }
        }
        if let Some(e) = self.error_m {
            if e < 0.0 {
                return Err(MeasurementError::BadError(e));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeasurementError {
    #[error("distance must be finite and >= 0, got {0}")]
    BadDistance(f64),
    #[error("elevation present without azimuth")]
    ElevationWithoutAzimuth,
    #[error("confidence must be in [0, 1], got {0}")]
    BadConfidence(f64),
    #[error("error_m must be >= 0, got {0}")]
    BadError(f64),
}
