use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight. Every time of day in the crate uses it.
pub type Minutes = u32;

pub type ProfessionalId = u64;
pub type RoomId = u64;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end
    }
}

/// A contiguous session during which a resource accepts appointments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    pub start: Minutes,
    pub end: Minutes,
    /// Session label shown next to its slots ("morning", "afternoon").
    pub name: Option<String>,
}

impl WorkingWindow {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        Self { start, end, name: None }
    }

    pub fn named(start: Minutes, end: Minutes, name: impl Into<String>) -> Self {
        Self {
            start,
            end,
            name: Some(name.into()),
        }
    }

    pub fn length(&self) -> Minutes {
        self.end.saturating_sub(self.start)
    }
}

/// One candidate appointment start. Derived on every query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Minutes,
    pub duration: Minutes,
    /// Index of the working window this slot was cut from.
    pub window: usize,
}

impl Slot {
    pub fn end(&self) -> Minutes {
        self.start + self.duration
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }
}

/// Who holds an occupied interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    pub appointment_id: Ulid,
    pub patient: String,
}

/// A committed appointment's time span on one resource and day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupiedInterval {
    pub start: Minutes,
    pub duration: Minutes,
    pub occupant: Occupant,
}

impl OccupiedInterval {
    pub fn end(&self) -> Minutes {
        self.start.saturating_add(self.duration)
    }

    /// Half-open containment. Zero-length legacy rows cover nothing.
    pub fn covers(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end()
    }

    pub fn overlaps(&self, span: &Span) -> bool {
        self.start < span.end && span.start < self.end()
    }
}

// ── Resource keys ────────────────────────────────────────────────

/// Either a recurring day of the week or one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Day {
    Weekday(Weekday),
    Date(NaiveDate),
}

impl Day {
    /// The weekday whose schedule governs this day.
    pub fn weekday(&self) -> Weekday {
        match self {
            Day::Weekday(w) => *w,
            Day::Date(d) => d.weekday(),
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Day::Weekday(w) => write!(f, "{}", w.to_string().to_lowercase()),
            Day::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayParseError(pub String);

impl fmt::Display for DayParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bad day {:?}: expected YYYY-MM-DD, a weekday name, or 1-7 (1 = Monday)",
            self.0
        )
    }
}

impl std::error::Error for DayParseError {}

impl FromStr for Day {
    type Err = DayParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Day::Date(date));
        }
        let weekday = match s {
            "1" => Weekday::Mon,
            "2" => Weekday::Tue,
            "3" => Weekday::Wed,
            "4" => Weekday::Thu,
            "5" => Weekday::Fri,
            "6" => Weekday::Sat,
            "7" => Weekday::Sun,
            other => other
                .parse::<Weekday>()
                .map_err(|_| DayParseError(s.to_string()))?,
        };
        Ok(Day::Weekday(weekday))
    }
}

impl From<Day> for String {
    fn from(day: Day) -> Self {
        day.to_string()
    }
}

impl TryFrom<String> for Day {
    type Error = DayParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The (professional, room, day) scope of every generation and booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub professional_id: ProfessionalId,
    pub room_id: RoomId,
    pub day: Day,
}

impl ResourceKey {
    pub fn new(professional_id: ProfessionalId, room_id: RoomId, day: Day) -> Self {
        Self {
            professional_id,
            room_id,
            day,
        }
    }

    pub fn schedule_key(&self) -> ScheduleKey {
        ScheduleKey {
            professional_id: self.professional_id,
            room_id: self.room_id,
            weekday: self.day.weekday(),
        }
    }
}

/// Doubles as the notification channel name.
impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}/r{}/{}", self.professional_id, self.room_id, self.day)
    }
}

/// Weekly schedules are stored per weekday; dated keys fall back to theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub professional_id: ProfessionalId,
    pub room_id: RoomId,
    pub weekday: Weekday,
}

// ── Per-day occupancy ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DayState {
    pub key: ResourceKey,
    /// Committed appointments, sorted by `start`.
    pub occupied: Vec<OccupiedInterval>,
}

impl DayState {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            occupied: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, interval: OccupiedInterval) {
        let pos = self
            .occupied
            .partition_point(|i| i.start <= interval.start);
        self.occupied.insert(pos, interval);
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<OccupiedInterval> {
        let pos = self
            .occupied
            .iter()
            .position(|i| i.occupant.appointment_id == appointment_id)?;
        Some(self.occupied.remove(pos))
    }

    /// Intervals overlapping `query`. Everything starting at or after
    /// `query.end` is skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &OccupiedInterval> {
        let right_bound = self.occupied.partition_point(|i| i.start < query.end);
        self.occupied[..right_bound]
            .iter()
            .filter(move |i| i.end() > query.start)
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleSet {
        key: ScheduleKey,
        windows: Vec<WorkingWindow>,
    },
    SlotDurationSet {
        professional_id: ProfessionalId,
        minutes: Minutes,
    },
    AppointmentBooked {
        key: ResourceKey,
        interval: OccupiedInterval,
    },
    AppointmentCancelled {
        key: ResourceKey,
        appointment_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Free,
    Occupied(Occupant),
}

impl Status {
    pub fn is_free(&self) -> bool {
        matches!(self, Status::Free)
    }

    pub fn occupant(&self) -> Option<&Occupant> {
        match self {
            Status::Free => None,
            Status::Occupied(o) => Some(o),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub slot: Slot,
    pub status: Status,
}

/// Resolved slots for one key. Built per query; stale once any booking lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityView {
    pub key: ResourceKey,
    pub slot_minutes: Minutes,
    pub windows: Vec<WorkingWindow>,
    pub slots: Vec<SlotStatus>,
}

impl AvailabilityView {
    pub fn slot_at(&self, start: Minutes) -> Option<&SlotStatus> {
        self.slots.iter().find(|s| s.slot.start == start)
    }

    pub fn free_starts(&self) -> Vec<Minutes> {
        self.slots
            .iter()
            .filter(|s| s.status.is_free())
            .map(|s| s.slot.start)
            .collect()
    }

    pub fn window_name(&self, slot: &Slot) -> Option<&str> {
        self.windows.get(slot.window).and_then(|w| w.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub key: ResourceKey,
    pub interval: OccupiedInterval,
}

impl Confirmation {
    pub fn appointment_id(&self) -> Ulid {
        self.interval.occupant.appointment_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Booked(Ulid),
    Cancelled(Ulid),
}

/// Published after every committed booking or cancellation on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyChanged {
    pub key: ResourceKey,
    pub cause: ChangeCause,
    pub occupied: Vec<OccupiedInterval>,
}

// ── HH:MM helpers ────────────────────────────────────────────────

pub fn format_hhmm(m: Minutes) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse `HH:MM`. `24:00` is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Result<Minutes, String> {
    let s = s.trim();
    if s == "24:00" {
        return Ok(MINUTES_PER_DAY);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("bad time {s:?}: {e}"))?;
    Ok(t.hour() * 60 + t.minute())
}

/// Serde adapter: minutes as `"HH:MM"` out, `"HH:MM"` or an integer in.
/// Only for self-describing formats; the WAL keeps raw minutes.
pub mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_hhmm, parse_hhmm, Minutes};

    pub fn serialize<S: Serializer>(m: &Minutes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_hhmm(*m))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Minutes, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(Minutes),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Minutes(m) => Ok(m),
            Raw::Text(s) => parse_hhmm(&s).map_err(serde::de::Error::custom),
        }
    }
}
