//! # roomserver-events
//!
//! A library for working with federated room events: parsing the signed
//! JSON wire format, computing canonical JSON and the SHA-256 reference
//! hash, and evaluating the authorization rules that decide whether an
//! event is allowed against a given room state.
//!
//! ## Quick Start
//!
//! ```rust
//! use roomserver_events::Event;
//!
//! let raw = br#"{
//!     "event_id": "$abc:example.org",
//!     "room_id": "!room:example.org",
//!     "sender": "@alice:example.org",
//!     "type": "m.room.message",
//!     "depth": 7,
//!     "prev_events": [["$prev:example.org", {}]],
//!     "content": {"body": "hello"}
//! }"#;
//!
//! let event = Event::parse(raw).expect("valid event");
//! assert_eq!(event.event_type(), "m.room.message");
//! assert!(!event.is_state());
//! ```
//!
//! Authorization is evaluated against an [`AuthProvider`], a capability set
//! exposing the five pieces of room state the rules may consult: the create
//! event, power levels, join rules, and the member / third-party-invite
//! events keyed by state key. [`StateNeeded`] computes which of those a
//! batch of events will require, so callers can load exactly that much
//! state before calling [`allowed`].

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod auth;
pub mod canonical;
pub mod error;
pub mod event;

pub use self::auth::{AuthError, AuthProvider, StateNeeded, allowed};
pub use self::canonical::{canonical_json, reference_hash};
pub use self::error::EventError;
pub use self::event::Event;

/// Convenience type alias for Results using [`EventError`].
pub type Result<T, E = EventError> = std::result::Result<T, E>;
