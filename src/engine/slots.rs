use crate::model::*;

use super::conflict::{validate_duration, validate_windows};
use super::EngineError;

// ── Slot generation ──────────────────────────────────────────────

/// Cut each working window into back-to-back slots of `duration` minutes.
///
/// A slot is emitted only if it ends at or before its window's end; the
/// trailing remainder of a window is dropped, never emitted as a partial
/// slot. Windows are walked in the given order, so the result is ordered
/// by window and then by start. No windows means no slots.
pub fn generate_slots(windows: &[WorkingWindow], duration: Minutes) -> Result<Vec<Slot>, EngineError> {
    validate_duration(duration)?;
    validate_windows(windows)?;

    let capacity: usize = windows
        .iter()
        .map(|w| (w.length() / duration) as usize)
        .sum();
    let mut slots = Vec::with_capacity(capacity);

    for (index, window) in windows.iter().enumerate() {
        let mut start = window.start;
        while start + duration <= window.end {
            slots.push(Slot {
                start,
                duration,
                window: index,
            });
            start += duration;
        }
    }

    Ok(slots)
}
