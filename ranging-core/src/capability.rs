//! # capability
//!
//! Process-wide store of per-technology availability and capabilities.
//!
//! The availability map sits behind a read-mostly lock; nothing awaits while
//! holding it. Observers are weak handles in a copy-on-write list — a
//! notification clones the current list, drops the lock, then calls out, so
//! a slow or dropped observer never blocks the notifier. Dropped observers
//! are pruned on the next notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use ranging_types::{Availability, Technology, TechnologyCapabilities};

/// Notified on every availability transition, in order, at most once per
/// transition. Capabilities ride along only while the technology is Enabled.
pub trait AvailabilityObserver: Send + Sync {
    fn on_availability_changed(
        &self,
        technology: Technology,
        availability: Availability,
        capabilities: Option<&TechnologyCapabilities>,
    );
}

#[derive(Clone)]
struct TechState {
    availability: Availability,
    capabilities: Option<TechnologyCapabilities>,
}

pub struct CapabilityRegistry {
    state: RwLock<HashMap<Technology, TechState>>,
    observers: Mutex<Vec<Weak<dyn AvailabilityObserver>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        let mut state = HashMap::new();
        for tech in Technology::ALL {
            state.insert(
                tech,
                TechState {
                    availability: Availability::NotSupported,
                    capabilities: None,
                },
            );
        }
        Self {
            state: RwLock::new(state),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, technology: Technology) -> (Availability, Option<TechnologyCapabilities>) {
        let state = self.state.read().expect("capability map poisoned");
        match state.get(&technology) {
            Some(s) => (s.availability, s.capabilities.clone()),
            None => (Availability::NotSupported, None),
        }
    }

    /// Convenience: capabilities only if the technology is Enabled.
    pub fn enabled_capabilities(&self, technology: Technology) -> Option<TechnologyCapabilities> {
        match self.get(technology) {
            (Availability::Enabled, caps) => caps,
            _ => None,
        }
    }

    pub fn subscribe(&self, observer: &Arc<dyn AvailabilityObserver>) {
        let mut observers = self.observers.lock().expect("observer list poisoned");
        observers.push(Arc::downgrade(observer));
    }

    /// Explicit unregistration. Dropping the Arc works too — dead weak
    /// handles are pruned on the next notification.
    pub fn unsubscribe(&self, observer: &Arc<dyn AvailabilityObserver>) {
        let mut observers = self.observers.lock().expect("observer list poisoned");
        observers.retain(|w| match w.upgrade() {
            Some(o) => !Arc::ptr_eq(&o, observer),
            None => false,
        });
    }

    /// Driver-side entry point: record a transition and fan it out.
    ///
    /// Capabilities are published on the first transition to Enabled and
    /// replaced on Enabled→Enabled updates; any transition away from Enabled
    /// clears them.
    pub fn update(
        &self,
        technology: Technology,
        availability: Availability,
        capabilities: Option<TechnologyCapabilities>,
    ) {
        let published = {
            let mut state = self.state.write().expect("capability map poisoned");
            let entry = state.entry(technology).or_insert(TechState {
                availability: Availability::NotSupported,
                capabilities: None,
            });
            entry.availability = availability;
            if availability == Availability::Enabled {
                if capabilities.is_some() {
                    entry.capabilities = capabilities;
                }
            } else {
                entry.capabilities = None;
            }
            entry.capabilities.clone()
        };

        debug!("capability: {technology} -> {availability:?}");
        self.notify(technology, availability, published.as_ref());
    }

    fn notify(
        &self,
        technology: Technology,
        availability: Availability,
        capabilities: Option<&TechnologyCapabilities>,
    ) {
        // Snapshot under the lock, call outside it
        let snapshot: Vec<Arc<dyn AvailabilityObserver>> = {
            let mut observers = self.observers.lock().expect("observer list poisoned");
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in snapshot {
            observer.on_availability_changed(technology, availability, capabilities);
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
