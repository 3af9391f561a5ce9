use std::time::Instant;

use ulid::Ulid;

use crate::limits::MAX_APPOINTMENTS_PER_DAY;
use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::conflict::{check_no_overlap, validate_patient};
use super::{status_of, Engine, EngineError};

impl Engine {
    /// Book the slot starting at `slot_start` on `key` for `patient`.
    ///
    /// The grid and the occupancy are re-read under the key's booking lock,
    /// and the lock is held until the store write finishes. The write runs
    /// on its own task: if it outlives `persist_timeout` the caller gets
    /// `Timeout` while the write completes, still under the lock.
    pub async fn book(
        &self,
        key: &ResourceKey,
        slot_start: Minutes,
        patient: String,
    ) -> Result<Confirmation, EngineError> {
        let started = Instant::now();
        let result = self.try_book(key, slot_start, patient).await;
        self.release_booking_lock(key);

        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(e) => e.code(),
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn try_book(
        &self,
        key: &ResourceKey,
        slot_start: Minutes,
        patient: String,
    ) -> Result<Confirmation, EngineError> {
        validate_patient(&patient)?;
        let guard = self.booking_lock(key).lock_owned().await;

        let grid = self.load_grid(key).await?;
        let slot = *grid
            .slot_at(slot_start)
            .ok_or(EngineError::SlotNotOffered {
                key: *key,
                start: slot_start,
            })?;
        let mut occupied = self.store.fetch_occupied_intervals(key).await?;

        if let Status::Occupied(occupant) = status_of(&slot, &occupied) {
            tracing::warn!(
                "book {key} {}: taken by {}",
                format_hhmm(slot.start),
                occupant.appointment_id
            );
            return Err(EngineError::SlotNoLongerAvailable {
                key: *key,
                start: slot.start,
                occupant,
            });
        }
        check_no_overlap(key, &slot.span(), &occupied)?;
        if occupied.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on one day"));
        }

        let interval = OccupiedInterval {
            start: slot.start,
            duration: slot.duration,
            occupant: Occupant {
                appointment_id: Ulid::new(),
                patient,
            },
        };
        let appointment_id = interval.occupant.appointment_id;

        let store = self.store.clone();
        let notify = self.notify.clone();
        let write_key = *key;
        let written = interval.clone();
        let write = tokio::spawn(async move {
            store.persist_appointment(&write_key, &written).await?;
            occupied.push(written);
            occupied.sort_by_key(|i| i.start);
            notify.publish(OccupancyChanged {
                key: write_key,
                cause: ChangeCause::Booked(appointment_id),
                occupied,
            });
            drop(guard);
            Ok::<(), StoreError>(())
        });

        match tokio::time::timeout(self.settings.persist_timeout, write).await {
            Err(_) => {
                tracing::warn!(
                    "book {key} {}: store write exceeded {:?}, outcome pending",
                    format_hhmm(slot.start),
                    self.settings.persist_timeout
                );
                Err(EngineError::Timeout {
                    key: *key,
                    start: slot.start,
                })
            }
            Ok(Err(join_err)) => {
                tracing::error!("book {key}: store write task failed: {join_err}");
                Err(EngineError::Storage(join_err.to_string()))
            }
            Ok(Ok(Err(StoreError::Conflict(occupant)))) => Err(EngineError::SlotNoLongerAvailable {
                key: *key,
                start: slot.start,
                occupant,
            }),
            Ok(Ok(Err(e))) => {
                tracing::error!("book {key}: {e}");
                Err(e.into())
            }
            Ok(Ok(Ok(()))) => {
                tracing::info!(
                    "booked {appointment_id} on {key} at {}",
                    format_hhmm(slot.start)
                );
                Ok(Confirmation {
                    key: *key,
                    interval,
                })
            }
        }
    }

    /// Remove an appointment and publish the freed occupancy.
    pub async fn cancel(
        &self,
        key: &ResourceKey,
        appointment_id: Ulid,
    ) -> Result<OccupiedInterval, EngineError> {
        let result = self.try_cancel(key, appointment_id).await;
        self.release_booking_lock(key);
        result
    }

    async fn try_cancel(
        &self,
        key: &ResourceKey,
        appointment_id: Ulid,
    ) -> Result<OccupiedInterval, EngineError> {
        let _guard = self.booking_lock(key).lock_owned().await;

        let mut occupied = self.store.fetch_occupied_intervals(key).await?;
        let removed = self.store.remove_appointment(key, appointment_id).await?;
        occupied.retain(|i| i.occupant.appointment_id != appointment_id);
        occupied.sort_by_key(|i| i.start);

        self.notify.publish(OccupancyChanged {
            key: *key,
            cause: ChangeCause::Cancelled(appointment_id),
            occupied,
        });
        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        tracing::info!(
            "cancelled {appointment_id} on {key} at {}",
            format_hhmm(removed.start)
        );
        Ok(removed)
    }
}
