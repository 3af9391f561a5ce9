use ulid::Ulid;

use crate::model::{format_hhmm, Minutes, Occupant, ResourceKey};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed working window or slot duration. Not retryable until an
    /// administrator fixes the schedule.
    InvalidConfiguration(String),
    /// Caller input that can never succeed as sent, such as an empty
    /// patient label.
    InvalidRequest(String),
    /// No working windows or slot duration recorded for the key.
    ResourceNotConfigured(ResourceKey),
    /// The requested start is not on the key's slot grid.
    SlotNotOffered { key: ResourceKey, start: Minutes },
    /// The re-check at commit time found the slot taken.
    SlotNoLongerAvailable {
        key: ResourceKey,
        start: Minutes,
        occupant: Occupant,
    },
    /// The persistence write did not finish in time. The booking may or may
    /// not have landed; re-query before retrying.
    Timeout { key: ResourceKey, start: Minutes },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable code for the wire protocol and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidConfiguration(_) => "invalid_configuration",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::ResourceNotConfigured(_) => "resource_not_configured",
            EngineError::SlotNotOffered { .. } => "slot_not_offered",
            EngineError::SlotNoLongerAvailable { .. } => "slot_no_longer_available",
            EngineError::Timeout { .. } => "timeout",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::ResourceNotConfigured(key) => {
                write!(f, "resource {key} has no working windows or slot duration")
            }
            EngineError::SlotNotOffered { key, start } => {
                write!(f, "{} is not a slot of {key}", format_hhmm(*start))
            }
            EngineError::SlotNoLongerAvailable {
                key,
                start,
                occupant,
            } => write!(
                f,
                "slot {} on {key} is no longer available (appointment {})",
                format_hhmm(*start),
                occupant.appointment_id
            ),
            EngineError::Timeout { key, start } => write!(
                f,
                "booking {} on {key} timed out; outcome unknown, re-query availability",
                format_hhmm(*start)
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Storage(other.to_string()),
        }
    }
}
