mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use availability::{occupant_at, resolve, status_of};
pub use conflict::{check_schedule_limits, validate_duration, validate_windows};
pub use error::EngineError;
pub use slots::generate_slots;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{AppointmentStore, ScheduleSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on one `persist_appointment` call as seen by `book`.
    pub persist_timeout: Duration,
    /// Used for professionals with no configured slot duration.
    pub default_slot_minutes: Option<Minutes>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            persist_timeout: Duration::from_secs(2),
            default_slot_minutes: None,
        }
    }
}

/// Slot availability and booking over pluggable schedule and appointment
/// stores. Queries take no locks; bookings are serialized per resource key.
pub struct Engine {
    pub(super) schedule: Arc<dyn ScheduleSource>,
    pub(super) store: Arc<dyn AppointmentStore>,
    pub notify: Arc<NotifyHub>,
    /// Booking locks of keys with a booking or cancellation in flight.
    pub(super) booking_locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
    pub(super) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        schedule: Arc<dyn ScheduleSource>,
        store: Arc<dyn AppointmentStore>,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            schedule,
            store,
            notify,
            booking_locks: DashMap::new(),
            settings,
        }
    }

    /// Engine over a single store that serves both schedules and appointments.
    pub fn with_store<S>(store: Arc<S>, settings: EngineSettings) -> Self
    where
        S: ScheduleSource + AppointmentStore + 'static,
    {
        Self::new(store.clone(), store, Arc::new(NotifyHub::new()), settings)
    }

    pub(super) fn booking_lock(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        self.booking_locks.entry(*key).or_default().clone()
    }

    /// Drop the key's lock once nobody holds or waits on it. Waiters clone
    /// the `Arc` under the same shard lock, so a live entry is never removed.
    pub(super) fn release_booking_lock(&self, key: &ResourceKey) {
        self.booking_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
