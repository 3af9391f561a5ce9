use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::engine::{check_schedule_limits, validate_duration, validate_windows, EngineError};
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{AppointmentStore, ScheduleAdmin, ScheduleSource, StoreError};

// ── Group-commit WAL channel ─────────────────────────────────────

type Reply = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append { event: Event, response: Reply },
    Compact { events: Vec<Event>, response: Reply },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written as one batch and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Option<WalCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let result = wal.rewrite(&events);
                match &result {
                    Ok(()) => tracing::info!("WAL compacted to {} events", events.len()),
                    Err(e) => tracing::error!("WAL compaction failed: {e}"),
                }
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Reply)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch is cut back off the file so that no caller told it
    // failed has a record on disk.
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        tracing::error!("WAL rollback after a failed flush also failed: {e}");
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }

    for (_, response) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

// ── Store ────────────────────────────────────────────────────────

/// In-memory schedules and occupancy, journalled to a WAL.
pub struct WalStore {
    schedules: DashMap<ScheduleKey, Vec<WorkingWindow>>,
    durations: DashMap<ProfessionalId, Minutes>,
    days: DashMap<ResourceKey, Arc<RwLock<DayState>>>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold the read side across append and apply; compaction
    /// holds the write side so its snapshot never misses a committed event.
    commit_gate: RwLock<()>,
}

impl WalStore {
    /// Replay the journal at `path` and start its writer task. Must be
    /// called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let schedules = DashMap::new();
        let durations = DashMap::new();
        let mut days: HashMap<ResourceKey, DayState> = HashMap::new();

        for event in &events {
            match event {
                Event::ScheduleSet { key, windows } => {
                    schedules.insert(*key, windows.clone());
                }
                Event::SlotDurationSet {
                    professional_id,
                    minutes,
                } => {
                    durations.insert(*professional_id, *minutes);
                }
                Event::AppointmentBooked { key, interval } => {
                    days.entry(*key)
                        .or_insert_with(|| DayState::new(*key))
                        .insert(interval.clone());
                }
                Event::AppointmentCancelled {
                    key,
                    appointment_id,
                } => {
                    if let Some(day) = days.get_mut(key) {
                        day.remove(*appointment_id);
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} WAL events from {}: {} schedules, {} appointments",
            events.len(),
            path.display(),
            schedules.len(),
            days.values().map(|d| d.occupied.len()).sum::<usize>()
        );

        Ok(Self {
            schedules,
            durations,
            days: days
                .into_iter()
                .map(|(key, day)| (key, Arc::new(RwLock::new(day))))
                .collect(),
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn day(&self, key: &ResourceKey) -> Arc<RwLock<DayState>> {
        self.days
            .entry(*key)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(*key))))
            .clone()
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .schedules
            .iter()
            .map(|e| Event::ScheduleSet {
                key: *e.key(),
                windows: e.value().clone(),
            })
            .collect();
        events.extend(self.durations.iter().map(|e| Event::SlotDurationSet {
            professional_id: *e.key(),
            minutes: *e.value(),
        }));

        // Collect first: no DashMap shard guard may be held across an await.
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for day in days {
            let guard = day.read().await;
            events.extend(guard.occupied.iter().map(|interval| Event::AppointmentBooked {
                key: guard.key,
                interval: interval.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ScheduleSource for WalStore {
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
impl ScheduleAdmin for WalStore {
    async fn set_schedule(
        &self,
        key: ScheduleKey,
        windows: Vec<WorkingWindow>,
    ) -> Result<(), EngineError> {
        validate_windows(&windows)?;
        check_schedule_limits(&windows)?;

        let _gate = self.commit_gate.read().await;
        self.wal_append(Event::ScheduleSet {
            key,
            windows: windows.clone(),
        })
        .await?;
        tracing::info!(
            "schedule set for p{}/r{}/{}: {} windows",
            key.professional_id,
            key.room_id,
            key.weekday,
            windows.len()
        );
        self.schedules.insert(key, windows);
        Ok(())
    }

    async fn set_slot_duration(
        &self,
        professional_id: ProfessionalId,
        minutes: Minutes,
    ) -> Result<(), EngineError> {
        validate_duration(minutes)?;

        let _gate = self.commit_gate.read().await;
        self.wal_append(Event::SlotDurationSet {
            professional_id,
            minutes,
        })
        .await?;
        tracing::info!("slot duration for professional {professional_id} set to {minutes}m");
        self.durations.insert(professional_id, minutes);
        Ok(())
    }
}

#[async_trait]
impl AppointmentStore for WalStore {
    async fn fetch_occupied_intervals(
        &self,
        key: &ResourceKey,
    ) -> Result<Vec<OccupiedInterval>, StoreError> {
        let Some(day) = self.days.get(key).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = day.read().await;
        Ok(guard.occupied.clone())
    }

    /// Atomic insert: refuses anything overlapping a stored interval.
    async fn persist_appointment(
        &self,
        key: &ResourceKey,
        interval: &OccupiedInterval,
    ) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let day = self.day(key);
        let mut guard = day.write().await;

        let span = Span {
            start: interval.start,
            end: interval.end(),
        };
        if let Some(hit) = guard.overlapping(&span).next() {
            return Err(StoreError::Conflict(hit.occupant.clone()));
        }

        self.wal_append(Event::AppointmentBooked {
            key: *key,
            interval: interval.clone(),
        })
        .await?;
        guard.insert(interval.clone());
        Ok(())
    }

    async fn remove_appointment(
        &self,
        key: &ResourceKey,
        appointment_id: Ulid,
    ) -> Result<OccupiedInterval, StoreError> {
        let _gate = self.commit_gate.read().await;
        let day = self
            .days
            .get(key)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(appointment_id))?;
        let mut guard = day.write().await;
        if !guard
            .occupied
            .iter()
            .any(|i| i.occupant.appointment_id == appointment_id)
        {
            return Err(StoreError::NotFound(appointment_id));
        }

        self.wal_append(Event::AppointmentCancelled {
            key: *key,
            appointment_id,
        })
        .await?;
        guard
            .remove(appointment_id)
            .ok_or(StoreError::NotFound(appointment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("turnero_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn monday() -> ResourceKey {
        ResourceKey::new(10, 3, Day::Weekday(Weekday::Mon))
    }

    fn appt(start: Minutes, duration: Minutes, patient: &str) -> OccupiedInterval {
        OccupiedInterval {
            start,
            duration,
            occupant: Occupant {
                appointment_id: Ulid::new(),
                patient: patient.into(),
            },
        }
    }

    #[tokio::test]
    async fn dated_key_reads_its_weekday_schedule() {
        let store = WalStore::open(&test_wal_path("dated_schedule.wal")).unwrap();
        let windows = vec![WorkingWindow::named(480, 780, "morning")];
        store
            .set_schedule(monday().schedule_key(), windows.clone())
            .await
            .unwrap();

        let dated = ResourceKey::new(10, 3, "2026-10-19".parse().unwrap());
        assert_eq!(store.fetch_working_windows(&dated).await.unwrap(), Some(windows));
        let tuesday = ResourceKey::new(10, 3, Day::Weekday(Weekday::Tue));
        assert_eq!(store.fetch_working_windows(&tuesday).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_schedule_is_not_stored() {
        let store = WalStore::open(&test_wal_path("invalid_schedule.wal")).unwrap();
        let err = store
            .set_schedule(monday().schedule_key(), vec![WorkingWindow::new(780, 480)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
        assert_eq!(store.fetch_working_windows(&monday()).await.unwrap(), None);

        let err = store.set_slot_duration(10, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
        assert_eq!(store.appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn persist_rejects_overlap() {
        let store = WalStore::open(&test_wal_path("overlap.wal")).unwrap();
        let first = appt(540, 30, "Juan Pérez");
        store.persist_appointment(&monday(), &first).await.unwrap();

        let clash = appt(555, 15, "late");
        assert_eq!(
            store.persist_appointment(&monday(), &clash).await,
            Err(StoreError::Conflict(first.occupant.clone()))
        );
        // Adjacent is fine.
        store
            .persist_appointment(&monday(), &appt(570, 15, "next"))
            .await
            .unwrap();
        assert_eq!(store.fetch_occupied_intervals(&monday()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let store = WalStore::open(&test_wal_path("remove_unknown.wal")).unwrap();
        let id = Ulid::new();
        assert_eq!(
            store.remove_appointment(&monday(), id).await,
            Err(StoreError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let kept = appt(600, 15, "María González");
        let cancelled = appt(540, 30, "Juan Pérez");
        {
            let store = WalStore::open(&path).unwrap();
            store
                .set_schedule(monday().schedule_key(), vec![WorkingWindow::new(480, 780)])
                .await
                .unwrap();
            store.set_slot_duration(10, 15).await.unwrap();
            store.persist_appointment(&monday(), &cancelled).await.unwrap();
            store.persist_appointment(&monday(), &kept).await.unwrap();
            store
                .remove_appointment(&monday(), cancelled.occupant.appointment_id)
                .await
                .unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.fetch_slot_duration(10).await.unwrap(), Some(15));
        assert_eq!(
            store.fetch_occupied_intervals(&monday()).await.unwrap(),
            vec![kept.clone()]
        );
    }

    #[tokio::test]
    async fn booking_after_torn_tail_survives_second_restart() {
        let path = test_wal_path("torn_then_book.wal");
        let before_crash = appt(540, 15, "Juan Pérez");
        {
            let store = WalStore::open(&path).unwrap();
            store.persist_appointment(&monday(), &before_crash).await.unwrap();
        }
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let after_crash = appt(600, 15, "María González");
        {
            let store = WalStore::open(&path).unwrap();
            assert_eq!(store.fetch_occupied_intervals(&monday()).await.unwrap().len(), 1);
            store.persist_appointment(&monday(), &after_crash).await.unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(
            store.fetch_occupied_intervals(&monday()).await.unwrap(),
            vec![before_crash, after_crash]
        );
    }

    #[tokio::test]
    async fn compaction_preserves_state_and_resets_counter() {
        let path = test_wal_path("compact.wal");
        let survivor = appt(720, 15, "Carlos López");
        {
            let store = WalStore::open(&path).unwrap();
            store.set_slot_duration(10, 15).await.unwrap();
            for start in (480..720).step_by(15) {
                let a = appt(start, 15, "churn");
                store.persist_appointment(&monday(), &a).await.unwrap();
                store
                    .remove_appointment(&monday(), a.occupant.appointment_id)
                    .await
                    .unwrap();
            }
            store.persist_appointment(&monday(), &survivor).await.unwrap();
            assert!(store.appends_since_compact().await > 30);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL ({after}) should be smaller than {before}");
            assert_eq!(store.appends_since_compact().await, 0);

            store
                .persist_appointment(&monday(), &appt(735, 15, "after"))
                .await
                .unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        let occupied = store.fetch_occupied_intervals(&monday()).await.unwrap();
        assert_eq!(occupied.len(), 2);
        assert_eq!(occupied[0], survivor);
        assert_eq!(store.fetch_slot_duration(10).await.unwrap(), Some(15));
    }
}
