//! System-event relays.
//!
//! Boot and screen-on notifications come from the session manager over
//! D-Bus. Relays have no data dependency on the authentication pipeline;
//! the registry only tracks which ones are live.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Relay {
    Boot,
    ScreenOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    BootCompleted,
    ScreenOn,
}

static GLOBAL: OnceLock<RelayRegistry> = OnceLock::new();

/// Set of registered relays. Registration is idempotent.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    registered: Mutex<BTreeSet<Relay>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static RelayRegistry {
        GLOBAL.get_or_init(|| {
            tracing::debug!("relay registry initialized");
            RelayRegistry::new()
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<Relay>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the relay was not registered before.
    pub fn register(&self, relay: Relay) -> bool {
        let added = self.lock().insert(relay);
        if added {
            tracing::info!(?relay, "relay registered");
        }
        added
    }

    /// Returns true if the relay was registered.
    pub fn unregister(&self, relay: Relay) -> bool {
        let removed = self.lock().remove(&relay);
        if removed {
            tracing::info!(?relay, "relay unregistered");
        }
        removed
    }

    pub fn is_registered(&self, relay: Relay) -> bool {
        self.lock().contains(&relay)
    }

    pub fn registered(&self) -> Vec<Relay> {
        self.lock().iter().copied().collect()
    }

    /// Deliver a system event. Returns whether any relay acted on it.
    pub fn dispatch(&self, event: SystemEvent) -> bool {
        match event {
            SystemEvent::BootCompleted => {
                if !self.is_registered(Relay::Boot) {
                    tracing::debug!("boot event with no relay registered");
                    return false;
                }
                tracing::info!("boot completed");
                self.register(Relay::ScreenOn);
                true
            }
            SystemEvent::ScreenOn => {
                if self.is_registered(Relay::ScreenOn) {
                    tracing::info!("screen turned on");
                    true
                } else {
                    tracing::debug!("screen-on event with no relay registered");
                    false
                }
            }
        }
    }

    /// Drop every registration.
    pub fn teardown(&self) {
        let mut set = self.lock();
        if !set.is_empty() {
            tracing::info!(relays = ?*set, "relay registry torn down");
        }
        set.clear();
    }
}
