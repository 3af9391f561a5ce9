use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn validate_duration(minutes: Minutes) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::InvalidConfiguration(
            "slot duration must be positive".into(),
        ));
    }
    if minutes > MAX_SLOT_MINUTES {
        return Err(EngineError::InvalidConfiguration(format!(
            "slot duration {minutes} exceeds one day"
        )));
    }
    Ok(())
}

/// Windows must be well-formed, inside the day, and strictly ordered
/// without overlap. Touching windows (13:00-14:00, 14:00-20:00) are fine.
pub fn validate_windows(windows: &[WorkingWindow]) -> Result<(), EngineError> {
    let mut prev_end: Option<Minutes> = None;
    for w in windows {
        if w.start >= w.end {
            return Err(EngineError::InvalidConfiguration(format!(
                "window {}-{} starts at or after its end",
                format_hhmm(w.start),
                format_hhmm(w.end)
            )));
        }
        if w.end > MINUTES_PER_DAY {
            return Err(EngineError::InvalidConfiguration(format!(
                "window ending {} runs past midnight",
                format_hhmm(w.end)
            )));
        }
        if let Some(end) = prev_end
            && w.start < end
        {
            return Err(EngineError::InvalidConfiguration(format!(
                "window starting {} overlaps or precedes the previous one",
                format_hhmm(w.start)
            )));
        }
        prev_end = Some(w.end);
    }
    Ok(())
}

/// Size bounds for administrator input, on top of `validate_windows`.
pub fn check_schedule_limits(windows: &[WorkingWindow]) -> Result<(), EngineError> {
    if windows.len() > MAX_WINDOWS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many working windows"));
    }
    if windows
        .iter()
        .any(|w| w.name.as_ref().is_some_and(|n| n.len() > MAX_WINDOW_NAME_LEN))
    {
        return Err(EngineError::LimitExceeded("window name too long"));
    }
    Ok(())
}

pub fn validate_patient(patient: &str) -> Result<(), EngineError> {
    if patient.trim().is_empty() {
        return Err(EngineError::InvalidRequest(
            "patient label must not be empty".into(),
        ));
    }
    if patient.len() > MAX_PATIENT_LABEL_LEN {
        return Err(EngineError::LimitExceeded("patient label too long"));
    }
    Ok(())
}

/// Committed intervals of one key never overlap. A slot whose start is free
/// can still run into an irregular legacy appointment starting inside it.
pub fn check_no_overlap(
    key: &ResourceKey,
    span: &Span,
    occupied: &[OccupiedInterval],
) -> Result<(), EngineError> {
    match occupied.iter().find(|i| i.overlaps(span)) {
        Some(hit) => Err(EngineError::SlotNoLongerAvailable {
            key: *key,
            start: span.start,
            occupant: hit.occupant.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use ulid::Ulid;

    fn key() -> ResourceKey {
        ResourceKey::new(1, 1, Day::Weekday(Weekday::Mon))
    }

    #[test]
    fn zero_duration_rejected() {
        assert!(matches!(
            validate_duration(0),
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(validate_duration(15).is_ok());
        assert!(validate_duration(MAX_SLOT_MINUTES + 1).is_err());
    }

    #[test]
    fn malformed_window_rejected() {
        let inverted = [WorkingWindow::new(780, 480)];
        assert!(matches!(
            validate_windows(&inverted),
            Err(EngineError::InvalidConfiguration(_))
        ));
        let empty = [WorkingWindow::new(480, 480)];
        assert!(validate_windows(&empty).is_err());
        let past_midnight = [WorkingWindow::new(1380, 1500)];
        assert!(validate_windows(&past_midnight).is_err());
    }

    #[test]
    fn overlapping_or_unordered_windows_rejected() {
        let overlapping = [WorkingWindow::new(480, 780), WorkingWindow::new(720, 900)];
        assert!(validate_windows(&overlapping).is_err());
        let unordered = [WorkingWindow::new(840, 1200), WorkingWindow::new(480, 780)];
        assert!(validate_windows(&unordered).is_err());
    }

    #[test]
    fn touching_windows_accepted() {
        let touching = [WorkingWindow::new(480, 780), WorkingWindow::new(780, 840)];
        assert!(validate_windows(&touching).is_ok());
        assert!(validate_windows(&[]).is_ok());
    }

    #[test]
    fn schedule_limits() {
        let many: Vec<_> = (0..=MAX_WINDOWS_PER_DAY as Minutes)
            .map(|i| WorkingWindow::new(i * 60, i * 60 + 30))
            .collect();
        assert_eq!(
            check_schedule_limits(&many),
            Err(EngineError::LimitExceeded("too many working windows"))
        );
        let long_name = [WorkingWindow::named(480, 780, "x".repeat(MAX_WINDOW_NAME_LEN + 1))];
        assert!(check_schedule_limits(&long_name).is_err());
    }

    #[test]
    fn patient_label_bounds() {
        assert!(validate_patient("Juan Pérez").is_ok());
        assert_eq!(
            validate_patient("   "),
            Err(EngineError::InvalidRequest("patient label must not be empty".into()))
        );
        assert_eq!(
            validate_patient(&"x".repeat(MAX_PATIENT_LABEL_LEN + 1)),
            Err(EngineError::LimitExceeded("patient label too long"))
        );
    }

    #[test]
    fn overlap_detects_irregular_interval_inside_slot() {
        let legacy = OccupiedInterval {
            start: 590, // 09:50, off-grid
            duration: 20,
            occupant: Occupant {
                appointment_id: Ulid::new(),
                patient: "legacy".into(),
            },
        };
        let slot = Span::new(585, 600); // 09:45-10:00
        let err = check_no_overlap(&key(), &slot, std::slice::from_ref(&legacy)).unwrap_err();
        match err {
            EngineError::SlotNoLongerAvailable { occupant, start, .. } => {
                assert_eq!(occupant, legacy.occupant);
                assert_eq!(start, 585);
            }
            other => panic!("expected SlotNoLongerAvailable, got {other:?}"),
        }
        assert!(check_no_overlap(&key(), &Span::new(610, 625), &[legacy]).is_ok());
    }
}
