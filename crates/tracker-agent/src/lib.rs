//! The dialogue agent: one handle over the domain, the message interpreter,
//! the action policy and the tracker store.
//!
//! Every operation that mutates a conversation runs its whole
//! `get_or_create → update → save` sequence under that conversation's lock.
//! Wire payloads are converted into events before the lock is taken, so an
//! invalid batch never reaches a tracker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};
use tracker_events::{FileTrackerBackend, InMemoryTrackerBackend};
use tracker_policy::{ActionPolicy, CommandInterpreter, IntentMappingPolicy, Interpreter};
use tracker_protocol::{
    ConversationId, Domain, DomainSpec, Event, TrackerBackend, TrackerResult, TrackerSnapshot,
    parse_events,
};
use tracker_runtime::{DialogueTracker, StoreConfig, TrackerStore};

/// Reply to a handled message: what the bot should do next and where the
/// conversation stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub next_action: String,
    pub tracker: TrackerSnapshot,
}

pub struct AgentBuilder {
    domain: Arc<dyn Domain>,
    backend: Option<Arc<dyn TrackerBackend>>,
    interpreter: Arc<dyn Interpreter>,
    policy: Arc<dyn ActionPolicy>,
    store_config: StoreConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            domain: Arc::new(DomainSpec::default()),
            backend: None,
            interpreter: Arc::new(CommandInterpreter::new()),
            policy: Arc::new(IntentMappingPolicy::default()),
            store_config: StoreConfig::default(),
        }
    }

    pub fn domain(mut self, domain: Arc<dyn Domain>) -> Self {
        self.domain = domain;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TrackerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Persist trackers as JSONL files under `root`.
    pub fn file_backend(self, root: impl Into<PathBuf>) -> Self {
        self.backend(Arc::new(FileTrackerBackend::new(root)))
    }

    pub fn interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn ActionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.store_config.persist_timeout = timeout;
        self
    }

    /// How many trackers stay in memory between requests.
    pub fn resident_capacity(mut self, capacity: usize) -> Self {
        self.store_config.resident_capacity = capacity;
        self
    }

    pub fn build(self) -> DialogueAgent {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryTrackerBackend::new()));
        let store = TrackerStore::with_config(backend, self.store_config);
        info!(backend = store.backend_name(), "dialogue agent ready");

        DialogueAgent {
            domain: self.domain,
            interpreter: self.interpreter,
            policy: self.policy,
            store,
        }
    }
}

#[derive(Clone)]
pub struct DialogueAgent {
    domain: Arc<dyn Domain>,
    interpreter: Arc<dyn Interpreter>,
    policy: Arc<dyn ActionPolicy>,
    store: TrackerStore,
}

impl DialogueAgent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn domain(&self) -> &dyn Domain {
        self.domain.as_ref()
    }

    pub fn store(&self) -> &TrackerStore {
        &self.store
    }

    /// Validate a batch of wire event descriptors against the domain.
    pub fn parse_events(&self, batch: Vec<Value>) -> TrackerResult<Vec<Event>> {
        parse_events(batch, self.domain.as_ref())
    }

    async fn predict(&self, tracker: &DialogueTracker) -> String {
        self.policy
            .predict_next(tracker.events(), tracker.state(), self.domain.as_ref())
            .await
    }

    /// Interpret `text`, log it as a user utterance and predict the next
    /// action.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id))]
    pub async fn handle_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> TrackerResult<PredictionResponse> {
        let parse_data = self.interpreter.parse(text).await;
        debug!(intent = ?parse_data.intent_name(), "message interpreted");
        let utterance = Event::user_uttered(text, parse_data);

        let _guard = self.store.lock(conversation_id).await;
        let mut tracker = self.store.get_or_create(conversation_id).await?;
        tracker.update(utterance);
        let next_action = self.predict(&tracker).await;
        self.store.save(&tracker).await?;

        info!(%next_action, "message handled");
        Ok(PredictionResponse {
            next_action,
            tracker: tracker.current_state(false),
        })
    }

    /// Log the action the client just ran plus the events it produced, then
    /// predict what comes next.
    #[instrument(skip(self, events), fields(conversation_id = %conversation_id, count = events.len()))]
    pub async fn continue_message_handling(
        &self,
        conversation_id: &ConversationId,
        executed_action: Option<&str>,
        events: Vec<Event>,
    ) -> TrackerResult<PredictionResponse> {
        let executed = executed_action
            .map(|action_name| {
                let mut params = Map::new();
                params.insert("action_name".to_owned(), Value::from(action_name));
                Event::construct("action_executed", params, self.domain.as_ref())
            })
            .transpose()?;

        let _guard = self.store.lock(conversation_id).await;
        let mut tracker = self.store.get_or_create(conversation_id).await?;
        tracker.update_all(executed.into_iter().chain(events));
        let next_action = self.predict(&tracker).await;
        self.store.save(&tracker).await?;

        info!(%next_action, "continued conversation");
        Ok(PredictionResponse {
            next_action,
            tracker: tracker.current_state(false),
        })
    }

    /// Append `events` and persist. The snapshot omits the event log.
    #[instrument(skip(self, events), fields(conversation_id = %conversation_id, count = events.len()))]
    pub async fn append_events(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
    ) -> TrackerResult<TrackerSnapshot> {
        let tracker = self
            .store
            .modify(conversation_id, |tracker| tracker.update_all(events))
            .await?;
        Ok(tracker.current_state(false))
    }

    /// Full snapshot including events. Creates the conversation if needed.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn tracker_snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> TrackerResult<TrackerSnapshot> {
        let _guard = self.store.lock(conversation_id).await;
        let tracker = self.store.get_or_create(conversation_id).await?;
        Ok(tracker.current_state(true))
    }

    /// Replace the whole history of a conversation with `events`. Previously
    /// persisted events are discarded.
    #[instrument(skip(self, events), fields(conversation_id = %conversation_id, count = events.len()))]
    pub async fn replace_tracker(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
    ) -> TrackerResult<TrackerSnapshot> {
        let tracker = self.store.replace(conversation_id, events).await?;
        Ok(tracker.current_state(true))
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        let _guard = self.store.lock(conversation_id).await;
        self.store.delete(conversation_id).await
    }
}
