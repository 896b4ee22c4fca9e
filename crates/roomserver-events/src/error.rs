//! Error types for event parsing and validation.

use thiserror::Error;

/// Errors raised while parsing or validating an event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// The event bytes are not valid JSON.
    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is missing or has the wrong type.
    #[error("missing or malformed field: {0}")]
    Field(&'static str),

    /// A `prev_events` entry is neither an event ID string nor an
    /// `[event_id, hashes]` reference pair.
    #[error("malformed prev_events reference at index {0}")]
    PrevEventReference(usize),

    /// The event is not a JSON object at the top level.
    #[error("event is not a JSON object")]
    NotAnObject,
}
