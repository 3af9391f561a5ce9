use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Weekday;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::{check_schedule_limits, validate_duration, validate_windows, EngineError};
use crate::model::*;

use super::{AppointmentStore, ScheduleAdmin, ScheduleSource, StoreError};

const CLINIC_DAYS: [Weekday; 6] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Static clinic data held in memory. Unlike `WalStore`, `persist_appointment`
/// appends blindly, so exclusivity rests entirely on the booking coordinator.
#[derive(Default)]
pub struct FixtureStore {
    schedules: DashMap<ScheduleKey, Vec<WorkingWindow>>,
    durations: DashMap<ProfessionalId, Minutes>,
    occupied: DashMap<ResourceKey, Vec<OccupiedInterval>>,
    persist_delay: Option<Duration>,
    persist_calls: AtomicUsize,
}

impl FixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The legacy two-session day, 08:00-13:00 and 14:00-20:00, Monday to
    /// Saturday, for one professional and room.
    pub fn clinic(professional_id: ProfessionalId, room_id: RoomId) -> Self {
        let sessions = vec![
            WorkingWindow::named(8 * 60, 13 * 60, "morning"),
            WorkingWindow::named(14 * 60, 20 * 60, "afternoon"),
        ];
        Self::new().with_weekly_windows(professional_id, room_id, &CLINIC_DAYS, sessions)
    }

    pub fn with_windows(self, key: ScheduleKey, windows: Vec<WorkingWindow>) -> Self {
        self.schedules.insert(key, windows);
        self
    }

    pub fn with_weekly_windows(
        self,
        professional_id: ProfessionalId,
        room_id: RoomId,
        weekdays: &[Weekday],
        windows: Vec<WorkingWindow>,
    ) -> Self {
        for weekday in weekdays {
            let key = ScheduleKey {
                professional_id,
                room_id,
                weekday: *weekday,
            };
            self.schedules.insert(key, windows.clone());
        }
        self
    }

    pub fn with_duration(self, professional_id: ProfessionalId, minutes: Minutes) -> Self {
        self.durations.insert(professional_id, minutes);
        self
    }

    pub fn with_occupied(self, key: ResourceKey, intervals: Vec<OccupiedInterval>) -> Self {
        self.occupied.entry(key).or_default().extend(intervals);
        self
    }

    /// Make every `persist_appointment` sleep first, to exercise timeouts
    /// and widen race windows in tests.
    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = Some(delay);
        self
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// The three appointments the legacy screen shipped with.
    pub fn legacy_occupancy() -> Vec<OccupiedInterval> {
        [
            (9 * 60, 30, "Juan Pérez"),
            (10 * 60, 30, "María González"),
            (14 * 60 + 30, 15, "Carlos López"),
        ]
        .into_iter()
        .map(|(start, duration, patient)| OccupiedInterval {
            start,
            duration,
            occupant: Occupant {
                appointment_id: Ulid::new(),
                patient: patient.into(),
            },
        })
        .collect()
    }
}

#[async_trait]
impl ScheduleSource for FixtureStore {
    async fn fetch_working_windows(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<Vec<WorkingWindow>>, StoreError> {
        Ok(self
            .schedules
            .get(&key.schedule_key())
            .map(|e| e.value().clone()))
    }

    async fn fetch_slot_duration(
        &self,
        professional_id: ProfessionalId,
    ) -> Result<Option<Minutes>, StoreError> {
        Ok(self.durations.get(&professional_id).map(|e| *e.value()))
    }
}

#[async_trait]
impl ScheduleAdmin for FixtureStore {
    async fn set_schedule(
        &self,
        key: ScheduleKey,
        windows: Vec<WorkingWindow>,
    ) -> Result<(), EngineError> {
        validate_windows(&windows)?;
        check_schedule_limits(&windows)?;
        self.schedules.insert(key, windows);
        Ok(())
    }

    async fn set_slot_duration(
        &self,
        professional_id: ProfessionalId,
        minutes: Minutes,
    ) -> Result<(), EngineError> {
        validate_duration(minutes)?;
        self.durations.insert(professional_id, minutes);
        Ok(())
    }
}

#[async_trait]
impl AppointmentStore for FixtureStore {
    async fn fetch_occupied_intervals(
        &self,
        key: &ResourceKey,
    ) -> Result<Vec<OccupiedInterval>, StoreError> {
        Ok(self
            .occupied
            .get(key)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn persist_appointment(
        &self,
        key: &ResourceKey,
        interval: &OccupiedInterval,
    ) -> Result<(), StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.persist_delay {
            tokio::time::sleep(delay).await;
        }
        self.occupied
            .entry(*key)
            .or_default()
            .push(interval.clone());
        Ok(())
    }

    async fn remove_appointment(
        &self,
        key: &ResourceKey,
        appointment_id: Ulid,
    ) -> Result<OccupiedInterval, StoreError> {
        let mut intervals = self
            .occupied
            .get_mut(key)
            .ok_or(StoreError::NotFound(appointment_id))?;
        let pos = intervals
            .iter()
            .position(|i| i.occupant.appointment_id == appointment_id)
            .ok_or(StoreError::NotFound(appointment_id))?;
        Ok(intervals.remove(pos))
    }
}
