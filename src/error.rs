//! Unified error handling for the input pipeline.
//!
//! The consumer loop decides what to do with a failed record by variant,
//! never by string matching: transient errors are retried in place,
//! missing-dependency errors are deferred with backoff, permanent input
//! defects advance the offset, and store corruption aborts the process.

use roomserver_events::EventError;
use thiserror::Error;

use crate::db::DbError;
use crate::stream::StreamError;

/// Errors that can occur while processing one input record.
#[derive(Debug, Error)]
pub enum InputError {
    /// A supplied prior-state event ID is unknown to the store.
    #[error("missing state event for {0}")]
    MissingState(String),

    /// A prev_event has no recorded state; the event arrived before its
    /// ancestry.
    #[error("missing state at prev_event for {0}")]
    MissingPrevState(String),

    /// A non-outlier event arrived for a room the store has never seen.
    #[error("the first events added to a room must be outliers: {0}")]
    BadRoomBootstrap(String),

    /// An event with no usable prev_events inside a known room.
    #[error("orphan event in known room: {0}")]
    OrphanEvent(String),

    /// The event bytes failed to parse.
    #[error("malformed event: {0}")]
    Event(#[from] EventError),

    /// The store failed or returned something that breaks an invariant.
    #[error("store error: {0}")]
    Db(#[from] DbError),

    /// The ingress or egress log failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Processing was cancelled at a step boundary; the record is
    /// reprocessed on restart.
    #[error("processing cancelled")]
    Cancelled,
}

/// How the consumer loop should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry the same offset after backoff; the failure is transient.
    Retry,
    /// Retry the same offset after backoff; the record depends on events
    /// not yet seen.
    Defer,
    /// Log, advance the offset, emit nothing; the record is defective.
    Poison,
    /// Abort the process; the store is no longer trustworthy.
    Fatal,
}

impl InputError {
    /// Classify the error for the consumer loop.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::MissingState(_) | Self::MissingPrevState(_) => Disposition::Defer,
            Self::BadRoomBootstrap(_) | Self::OrphanEvent(_) | Self::Event(_) => {
                Disposition::Poison
            }
            Self::Db(DbError::Corrupt(_)) => Disposition::Fatal,
            Self::Db(_) | Self::Stream(_) | Self::Cancelled => Disposition::Retry,
        }
    }

    /// Static error code for metric labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingState(_) => "missing_state",
            Self::MissingPrevState(_) => "missing_prev_state",
            Self::BadRoomBootstrap(_) => "bad_room_bootstrap",
            Self::OrphanEvent(_) => "orphan_event",
            Self::Event(_) => "malformed_event",
            Self::Db(DbError::Corrupt(_)) => "corrupt_store",
            Self::Db(_) => "store_error",
            Self::Stream(_) => "stream_error",
            Self::Cancelled => "cancelled",
        }
    }
}
