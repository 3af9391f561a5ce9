//! Collaborator capabilities the engine depends on, with one production
//! implementation (`WalStore`) and one fixture (`FixtureStore`).

mod fixture;
mod wal_store;

pub use fixture::FixtureStore;
pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The insert would overlap a stored appointment.
    Conflict(Occupant),
    NotFound(Ulid),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict(o) => write!(f, "overlaps appointment {}", o.appointment_id),
            StoreError::NotFound(id) => write!(f, "appointment not found: {id}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Read side of schedule configuration.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// `None` when nothing is recorded for the key; `Some(vec![])` when the
    /// resource is deliberately closed that day.
    async fn fetch_working_windows(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<Vec<WorkingWindow>>, StoreError>;

    async fn fetch_slot_duration(
        &self,
        professional_id: ProfessionalId,
    ) -> Result<Option<Minutes>, StoreError>;
}

/// Write side of schedule configuration, used by administrators.
/// Implementations validate before storing anything.
#[async_trait]
pub trait ScheduleAdmin: Send + Sync {
    async fn set_schedule(
        &self,
        key: ScheduleKey,
        windows: Vec<WorkingWindow>,
    ) -> Result<(), EngineError>;

    async fn set_slot_duration(
        &self,
        professional_id: ProfessionalId,
        minutes: Minutes,
    ) -> Result<(), EngineError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn fetch_occupied_intervals(
        &self,
        key: &ResourceKey,
    ) -> Result<Vec<OccupiedInterval>, StoreError>;

    /// Durable once this returns `Ok`.
    async fn persist_appointment(
        &self,
        key: &ResourceKey,
        interval: &OccupiedInterval,
    ) -> Result<(), StoreError>;

    async fn remove_appointment(
        &self,
        key: &ResourceKey,
        appointment_id: Ulid,
    ) -> Result<OccupiedInterval, StoreError>;
}
