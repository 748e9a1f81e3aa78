//! # ranging-core
//!
//! Session orchestration and fusion for the multi-technology ranging
//! service.
//!
//! Four radio technologies — UWB, Bluetooth Channel Sounding, WiFi RTT and
//! Bluetooth RSSI — hide behind one [`adapter::RangingAdapter`] contract.
//! A client hands the [`registry::SessionRegistry`] a declarative
//! [`ranging_types::SessionPreference`]; the registry spawns a
//! [`session`] actor that drives every adapter concurrently, routes raw
//! samples through per-peer [`fusion::FusionEngine`]s, and streams fused
//! measurements plus lifecycle events back over a bounded channel. OOB
//! sessions first negotiate mutually compatible UWB parameters through the
//! [`oob`] selector.
//!
//! The host provides the ambient world once, as a [`context::CoreContext`]:
//! clock, session-key RNG, capability registry, adapter factory, OOB
//! transport and metrics sink. Radio drivers, IPC parcels and persistence
//! all live outside this crate.

pub mod adapter;
pub mod capability;
pub mod context;
pub mod error;
pub mod event;
pub mod filter;
pub mod fusion;
pub mod metrics;
pub mod oob;
pub mod registry;
pub mod session;

pub use adapter::{AdapterError, AdapterEvent, AdapterEventTx, AdapterFactory, CloseReason, RangingAdapter};
pub use capability::{AvailabilityObserver, CapabilityRegistry};
pub use context::{Clock, CoreContext, MonotonicClock, OsKeyRng, ServiceOptions, SessionKeyRng};
pub use error::{RangingError, SelectionError};
pub use event::{SessionEvent, StopReason};
pub use fusion::{Fuser, FusionEngine};
pub use metrics::{LogMetricsSink, MetricKind, MetricRecord, MetricsSink, NullMetricsSink};
pub use oob::{OobConnector, OobError, SelectionRequest, UnsupportedOobConnector, UwbSelection};
pub use registry::{ClientId, SessionRegistry};
pub use session::{SessionHandle, SessionId};
