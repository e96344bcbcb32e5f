//! # tracker-protocol — Conversation Tracker Protocol
//!
//! Shared types and trait interfaces for the conversation tracker store:
//! the closed event taxonomy, the read-only domain schema events are
//! validated against, the deterministic state projection, and the ports
//! that persistence backends implement.
//!
//! It is intentionally runtime-free (no tokio, no axum) so it can be used as
//! a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — `ConversationId`
//! - [`event`] — `Event` + `EventKind`, wire construction and serialization
//! - [`domain`] — `Domain` trait, `DomainSpec`, `SlotType`
//! - [`state`] — `DialogueState` projection and `TrackerSnapshot`
//! - [`ports`] — `TrackerBackend` persistence port
//! - [`error`] — `TrackerError`, `TrackerResult`

pub mod domain;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod state;

pub use domain::{
    ACTION_DEFAULT_FALLBACK, ACTION_LISTEN, ACTION_RESTART, BUILTIN_ACTIONS, Domain, DomainError,
    DomainSpec, SlotType,
};
pub use error::{TrackerError, TrackerResult};
pub use event::{Entity, Event, EventKind, Intent, ParseData, parse_events};
pub use ids::ConversationId;
pub use ports::TrackerBackend;
pub use state::{DialogueState, TrackerSnapshot, UserMessage};
