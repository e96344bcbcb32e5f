//! Conversation trackers and the store that owns them.
//!
//! A [`DialogueTracker`] is one conversation's append-only event log plus its
//! incrementally maintained projection. The [`TrackerStore`] maps
//! conversation ids to trackers, persists them through a
//! [`TrackerBackend`](tracker_protocol::TrackerBackend), and serializes
//! work on the same conversation with per-id locks.

mod store;
mod tracker;

pub use store::{ConversationGuard, StoreConfig, TrackerStore};
pub use tracker::DialogueTracker;
