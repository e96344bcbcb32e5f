//! Dialogue state projection.
//!
//! `DialogueState` is the fold of a conversation's event log from the empty
//! state. It is never edited directly: the only way to change it is to apply
//! another event (see [`Event::apply_to`]).

use crate::event::{Event, ParseData};
use crate::ids::ConversationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Latest message received from the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub parse_data: ParseData,
}

/// Current state of one conversation, derived from its events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueState {
    pub slots: BTreeMap<String, Value>,
    pub latest_message: Option<UserMessage>,
    pub latest_action_name: Option<String>,
    pub latest_bot_utterance: Option<String>,
    pub turn_count: u64,
    pub paused: bool,
    pub latest_event_time: Option<f64>,
}

impl DialogueState {
    /// Pure apply: returns the state after `event`.
    #[must_use]
    pub fn applied(mut self, event: &Event) -> Self {
        event.apply_to(&mut self);
        self
    }

    /// Replay `events` from the empty state.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        events
            .into_iter()
            .fold(Self::default(), |state, event| state.applied(event))
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get(name)
    }

    pub fn latest_intent(&self) -> Option<&str> {
        self.latest_message
            .as_ref()
            .and_then(|message| message.parse_data.intent_name())
    }
}

/// Immutable point-in-time view of a tracker, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub sender_id: ConversationId,
    pub slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub latest_message: Option<UserMessage>,
    #[serde(default)]
    pub latest_action_name: Option<String>,
    #[serde(default)]
    pub latest_bot_utterance: Option<String>,
    pub turn_count: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub latest_event_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

impl TrackerSnapshot {
    pub fn new(sender_id: ConversationId, state: &DialogueState, events: Option<Vec<Event>>) -> Self {
        Self {
            sender_id,
            slots: state.slots.clone(),
            latest_message: state.latest_message.clone(),
            latest_action_name: state.latest_action_name.clone(),
            latest_bot_utterance: state.latest_bot_utterance.clone(),
            turn_count: state.turn_count,
            paused: state.paused,
            latest_event_time: state.latest_event_time,
            events,
        }
    }

    /// The projection part of the snapshot, without sender id or events.
    pub fn state(&self) -> DialogueState {
        DialogueState {
            slots: self.slots.clone(),
            latest_message: self.latest_message.clone(),
            latest_action_name: self.latest_action_name.clone(),
            latest_bot_utterance: self.latest_bot_utterance.clone(),
            turn_count: self.turn_count,
            paused: self.paused,
            latest_event_time: self.latest_event_time,
        }
    }
}
