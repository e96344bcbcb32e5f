use tracker_protocol::{ConversationId, DialogueState, Event, TrackerSnapshot};

/// One conversation: its ordered event log and the projection of that log.
///
/// The projection is updated incrementally on every [`update`](Self::update)
/// and always equals `DialogueState::fold(self.events())`.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueTracker {
    sender_id: ConversationId,
    events: Vec<Event>,
    state: DialogueState,
}

impl DialogueTracker {
    pub fn new(sender_id: ConversationId) -> Self {
        Self {
            sender_id,
            events: Vec::new(),
            state: DialogueState::default(),
        }
    }

    /// Rehydrate a tracker from a persisted log by full replay.
    pub fn from_events(sender_id: ConversationId, events: Vec<Event>) -> Self {
        let state = DialogueState::fold(&events);
        Self {
            sender_id,
            events,
            state,
        }
    }

    pub fn sender_id(&self) -> &ConversationId {
        &self.sender_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest_action_name(&self) -> Option<&str> {
        self.state.latest_action_name.as_deref()
    }

    /// Append `event` and apply it to the current projection.
    pub fn update(&mut self, event: Event) {
        event.apply_to(&mut self.state);
        self.events.push(event);
    }

    pub fn update_all(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.update(event);
        }
    }

    pub fn current_state(&self, include_events: bool) -> TrackerSnapshot {
        TrackerSnapshot::new(
            self.sender_id.clone(),
            &self.state,
            include_events.then(|| self.events.clone()),
        )
    }

    /// Recompute the projection from the full log. Diagnostics only.
    pub fn state_from_scratch(&self) -> DialogueState {
        DialogueState::fold(&self.events)
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}
