use crate::model::*;

use super::{generate_slots, resolve, Engine, EngineError};

/// The slot grid for one key, before occupancy is applied.
pub(super) struct Grid {
    pub duration: Minutes,
    pub windows: Vec<WorkingWindow>,
    pub slots: Vec<Slot>,
}

impl Grid {
    pub fn slot_at(&self, start: Minutes) -> Option<&Slot> {
        self.slots
            .binary_search_by_key(&start, |s| s.start)
            .ok()
            .map(|i| &self.slots[i])
    }
}

impl Engine {
    /// Fetch windows and duration for `key` and cut the grid.
    ///
    /// No windows record, or no duration and no configured default, is
    /// `ResourceNotConfigured`. An empty windows record is a closed day and
    /// yields an empty grid.
    pub(super) async fn load_grid(&self, key: &ResourceKey) -> Result<Grid, EngineError> {
        let windows = self
            .schedule
            .fetch_working_windows(key)
            .await?
            .ok_or(EngineError::ResourceNotConfigured(*key))?;
        let duration = self
            .schedule
            .fetch_slot_duration(key.professional_id)
            .await?
            .or(self.settings.default_slot_minutes)
            .ok_or(EngineError::ResourceNotConfigured(*key))?;
        let slots = generate_slots(&windows, duration)?;
        Ok(Grid {
            duration,
            windows,
            slots,
        })
    }

    pub async fn get_availability(&self, key: &ResourceKey) -> Result<AvailabilityView, EngineError> {
        let grid = self.load_grid(key).await?;
        let occupied = self.store.fetch_occupied_intervals(key).await?;
        let slots = resolve(&grid.slots, &occupied);

        metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
        tracing::debug!(
            "availability {key}: {} slots, {} occupied intervals",
            slots.len(),
            occupied.len()
        );

        Ok(AvailabilityView {
            key: *key,
            slot_minutes: grid.duration,
            windows: grid.windows,
            slots,
        })
    }

    /// Committed appointments on `key`, ordered by start.
    pub async fn appointments(&self, key: &ResourceKey) -> Result<Vec<OccupiedInterval>, EngineError> {
        let mut occupied = self.store.fetch_occupied_intervals(key).await?;
        occupied.sort_by_key(|i| i.start);
        Ok(occupied)
    }
}
