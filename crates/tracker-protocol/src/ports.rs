//! Persistence port for tracker stores.
//!
//! A backend stores each conversation's full, ordered event log under its
//! conversation id. Backends only move events in and out; projection,
//! locking and caching belong to the store built on top of them.
//!
//! Object-safety note: the trait uses `async-trait` so stores can hold an
//! `Arc<dyn TrackerBackend>`.

use crate::error::TrackerResult;
use crate::event::Event;
use crate::ids::ConversationId;
use async_trait::async_trait;

#[async_trait]
pub trait TrackerBackend: Send + Sync {
    /// Load the persisted log, or `None` when nothing was ever stored.
    async fn load(&self, conversation_id: &ConversationId) -> TrackerResult<Option<Vec<Event>>>;

    /// Replace the persisted log for `conversation_id` with `events`.
    async fn store(&self, conversation_id: &ConversationId, events: &[Event]) -> TrackerResult<()>;

    async fn exists(&self, conversation_id: &ConversationId) -> TrackerResult<bool>;

    /// Remove the persisted log. Returns whether anything was removed.
    async fn remove(&self, conversation_id: &ConversationId) -> TrackerResult<bool>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}
