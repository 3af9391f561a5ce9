use crate::model::{Minutes, MINUTES_PER_DAY};

/// Longest slot a professional may configure.
pub const MAX_SLOT_MINUTES: Minutes = MINUTES_PER_DAY;

/// Working windows per professional, room and weekday.
pub const MAX_WINDOWS_PER_DAY: usize = 16;

pub const MAX_WINDOW_NAME_LEN: usize = 64;

pub const MAX_PATIENT_LABEL_LEN: usize = 256;

/// One appointment per minute of the day is already absurd.
pub const MAX_APPOINTMENTS_PER_DAY: usize = MINUTES_PER_DAY as usize;

/// Longest request line accepted by the wire protocol.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Channels a single connection may LISTEN on at once.
pub const MAX_LISTENS_PER_CONNECTION: usize = 64;
