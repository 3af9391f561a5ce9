//! Newline-delimited JSON protocol: one request object per line in, one
//! reply object per line out, plus pushed `occupancy_changed` lines for
//! listening connections. Times of day travel as `"HH:MM"`.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Availability {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
    },
    Book {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
        #[serde(with = "hhmm")]
        start: Minutes,
        patient: String,
    },
    Cancel {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
        appointment_id: Ulid,
    },
    Appointments {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
    },
    SetSchedule {
        professional_id: ProfessionalId,
        room_id: RoomId,
        weekday: Day,
        windows: Vec<WindowDto>,
    },
    SetSlotDuration {
        professional_id: ProfessionalId,
        minutes: Minutes,
    },
    Listen {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
    },
    Unlisten {
        professional_id: ProfessionalId,
        room_id: RoomId,
        day: Day,
    },
}

impl Request {
    /// The resource key the request targets, if it targets one.
    pub fn key(&self) -> Option<ResourceKey> {
        match self {
            Request::Availability {
                professional_id,
                room_id,
                day,
            }
            | Request::Book {
                professional_id,
                room_id,
                day,
                ..
            }
            | Request::Cancel {
                professional_id,
                room_id,
                day,
                ..
            }
            | Request::Appointments {
                professional_id,
                room_id,
                day,
            }
            | Request::Listen {
                professional_id,
                room_id,
                day,
            }
            | Request::Unlisten {
                professional_id,
                room_id,
                day,
            } => Some(ResourceKey::new(*professional_id, *room_id, *day)),
            Request::SetSchedule { .. } | Request::SetSlotDuration { .. } => None,
        }
    }
}

/// Weekly schedules are keyed by weekday; a calendar date is refused
/// rather than silently widened to every matching weekday.
pub fn schedule_key(
    professional_id: ProfessionalId,
    room_id: RoomId,
    weekday: Day,
) -> Result<ScheduleKey, ProtocolError> {
    match weekday {
        Day::Weekday(weekday) => Ok(ScheduleKey {
            professional_id,
            room_id,
            weekday,
        }),
        Day::Date(date) => Err(ProtocolError::Invalid(format!(
            "schedules are weekly; got the date {date}, expected a weekday"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDto {
    #[serde(with = "hhmm")]
    pub start: Minutes,
    #[serde(with = "hhmm")]
    pub end: Minutes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<WindowDto> for WorkingWindow {
    fn from(w: WindowDto) -> Self {
        WorkingWindow {
            start: w.start,
            end: w.end,
            name: w.name,
        }
    }
}

impl From<&WorkingWindow> for WindowDto {
    fn from(w: &WorkingWindow) -> Self {
        WindowDto {
            start: w.start,
            end: w.end,
            name: w.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotDto {
    #[serde(with = "hhmm")]
    pub start: Minutes,
    #[serde(with = "hhmm")]
    pub end: Minutes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupant: Option<Occupant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentDto {
    pub appointment_id: Ulid,
    #[serde(with = "hhmm")]
    pub start: Minutes,
    #[serde(with = "hhmm")]
    pub end: Minutes,
    pub duration: Minutes,
    pub patient: String,
}

impl From<&OccupiedInterval> for AppointmentDto {
    fn from(i: &OccupiedInterval) -> Self {
        AppointmentDto {
            appointment_id: i.occupant.appointment_id,
            start: i.start,
            end: i.end(),
            duration: i.duration,
            patient: i.occupant.patient.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDto {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupant: Option<Occupant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Availability {
        key: ResourceKey,
        slot_minutes: Minutes,
        windows: Vec<WindowDto>,
        slots: Vec<SlotDto>,
    },
    Booked {
        key: ResourceKey,
        appointment: AppointmentDto,
    },
    Cancelled {
        key: ResourceKey,
        appointment: AppointmentDto,
    },
    Appointments {
        key: ResourceKey,
        appointments: Vec<AppointmentDto>,
    },
    Ok,
    Listening {
        channel: String,
    },
    Unlistened {
        channel: String,
    },
    OccupancyChanged {
        key: ResourceKey,
        cause: &'static str,
        appointment_id: Ulid,
        appointments: Vec<AppointmentDto>,
    },
    /// The listener fell behind and missed pushes; re-query availability.
    Resync {
        channel: String,
        missed: u64,
    },
    Error(ErrorDto),
}

impl Reply {
    pub fn availability(view: &AvailabilityView) -> Self {
        let slots = view
            .slots
            .iter()
            .map(|s| SlotDto {
                start: s.slot.start,
                end: s.slot.end(),
                session: view.window_name(&s.slot).map(str::to_owned),
                status: if s.status.is_free() { "free" } else { "occupied" },
                occupant: s.status.occupant().cloned(),
            })
            .collect();
        Reply::Availability {
            key: view.key,
            slot_minutes: view.slot_minutes,
            windows: view.windows.iter().map(WindowDto::from).collect(),
            slots,
        }
    }

    pub fn occupancy_changed(change: &OccupancyChanged) -> Self {
        let (cause, appointment_id) = match change.cause {
            ChangeCause::Booked(id) => ("booked", id),
            ChangeCause::Cancelled(id) => ("cancelled", id),
        };
        Reply::OccupancyChanged {
            key: change.key,
            cause,
            appointment_id,
            appointments: change.occupied.iter().map(AppointmentDto::from).collect(),
        }
    }

    pub fn error(e: &EngineError) -> Self {
        let occupant = match e {
            EngineError::SlotNoLongerAvailable { occupant, .. } => Some(occupant.clone()),
            _ => None,
        };
        Reply::Error(ErrorDto {
            code: e.code(),
            message: e.to_string(),
            occupant,
        })
    }

    pub fn protocol_error(e: &ProtocolError) -> Self {
        Reply::Error(ErrorDto {
            code: e.code(),
            message: e.to_string(),
            occupant: None,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// One JSON line, without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","code":"internal","message":"encode failed: {e}"}}"#)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, or not a known request shape.
    Malformed(String),
    /// Well-formed but semantically unusable.
    Invalid(String),
    LineTooLong,
    TooManyListens,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_request",
            ProtocolError::Invalid(_) => "invalid_request",
            ProtocolError::LineTooLong => "line_too_long",
            ProtocolError::TooManyListens => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed request: {e}"),
            ProtocolError::Invalid(e) => write!(f, "invalid request: {e}"),
            ProtocolError::LineTooLong => write!(f, "request line too long"),
            ProtocolError::TooManyListens => write!(f, "too many channels on one connection"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use serde_json::{json, Value};

    fn to_json(reply: &Reply) -> Value {
        serde_json::from_str(&reply.to_line()).unwrap()
    }

    #[test]
    fn parse_book_with_hhmm_start() {
        let req = parse_request(
            r#"{"op":"book","professional_id":7,"room_id":2,"day":"2026-10-19","start":"10:00","patient":"Ana"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            Request::Book {
                professional_id: 7,
                room_id: 2,
                day: "2026-10-19".parse().unwrap(),
                start: 600,
                patient: "Ana".into(),
            }
        );
        assert_eq!(
            req.key(),
            Some(ResourceKey::new(7, 2, "2026-10-19".parse().unwrap()))
        );
    }

    #[test]
    fn parse_set_schedule_with_numeric_weekday() {
        let req = parse_request(
            r#"{"op":"set_schedule","professional_id":1,"room_id":1,"weekday":"1",
                "windows":[{"start":"08:00","end":"13:00","name":"morning"},{"start":"14:00","end":"20:00"}]}"#,
        )
        .unwrap();
        let Request::SetSchedule { weekday, windows, .. } = req else {
            panic!("expected set_schedule");
        };
        assert_eq!(weekday, Day::Weekday(Weekday::Mon));
        let windows: Vec<WorkingWindow> = windows.into_iter().map(Into::into).collect();
        assert_eq!(
            windows,
            vec![
                WorkingWindow::named(480, 780, "morning"),
                WorkingWindow::new(840, 1200)
            ]
        );
    }

    #[test]
    fn schedule_key_refuses_dates() {
        assert!(schedule_key(1, 1, Day::Weekday(Weekday::Sat)).is_ok());
        let err = schedule_key(1, 1, "2026-10-24".parse().unwrap()).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn malformed_lines() {
        assert!(matches!(parse_request("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_request(r#"{"op":"teleport"}"#), Err(ProtocolError::Malformed(_))));
        assert!(parse_request(r#"{"op":"book","professional_id":1,"room_id":1,"day":"mon","start":"25:00","patient":"x"}"#).is_err());
        assert!(parse_request(r#"{"op":"availability","professional_id":1,"room_id":1,"day":"someday"}"#).is_err());
    }

    #[test]
    fn availability_reply_shape() {
        let key = ResourceKey::new(1, 1, Day::Weekday(Weekday::Mon));
        let occupant = Occupant {
            appointment_id: Ulid::new(),
            patient: "Juan Pérez".into(),
        };
        let view = AvailabilityView {
            key,
            slot_minutes: 30,
            windows: vec![WorkingWindow::named(480, 540, "morning")],
            slots: vec![
                SlotStatus {
                    slot: Slot { start: 480, duration: 30, window: 0 },
                    status: Status::Free,
                },
                SlotStatus {
                    slot: Slot { start: 510, duration: 30, window: 0 },
                    status: Status::Occupied(occupant.clone()),
                },
            ],
        };
        let v = to_json(&Reply::availability(&view));
        assert_eq!(v["type"], "availability");
        assert_eq!(v["key"], json!({"professional_id": 1, "room_id": 1, "day": "mon"}));
        assert_eq!(v["slots"][0], json!({"start": "08:00", "end": "08:30", "session": "morning", "status": "free"}));
        assert_eq!(v["slots"][1]["status"], "occupied");
        assert_eq!(v["slots"][1]["occupant"]["patient"], "Juan Pérez");
        assert_eq!(
            v["slots"][1]["occupant"]["appointment_id"],
            occupant.appointment_id.to_string()
        );
    }

    #[test]
    fn error_reply_carries_occupant() {
        let occupant = Occupant {
            appointment_id: Ulid::new(),
            patient: "María González".into(),
        };
        let err = EngineError::SlotNoLongerAvailable {
            key: ResourceKey::new(1, 1, Day::Weekday(Weekday::Mon)),
            start: 600,
            occupant,
        };
        let v = to_json(&Reply::error(&err));
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "slot_no_longer_available");
        assert_eq!(v["occupant"]["patient"], "María González");

        let v = to_json(&Reply::protocol_error(&ProtocolError::LineTooLong));
        assert_eq!(v["code"], "line_too_long");
        assert!(v.get("occupant").is_none());
    }

    #[test]
    fn unit_reply_is_just_a_tag() {
        assert_eq!(Reply::Ok.to_line(), r#"{"type":"ok"}"#);
    }
}
