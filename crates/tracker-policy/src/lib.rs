//! Message interpretation and next-action selection.
//!
//! Both are collaborators of the tracker core, not part of it: the agent
//! only needs something that turns text into [`ParseData`] and something that
//! names the next action for a conversation. The implementations here are
//! deterministic and rule-based.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use tracker_protocol::{
    ACTION_DEFAULT_FALLBACK, ACTION_LISTEN, DialogueState, Domain, Entity, Event, EventKind,
    Intent, ParseData,
};

#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn parse(&self, text: &str) -> ParseData;
}

#[async_trait]
pub trait ActionPolicy: Send + Sync {
    /// Name the action the bot should run next.
    async fn predict_next(&self, events: &[Event], state: &DialogueState, domain: &dyn Domain)
    -> String;
}

/// Understands `/intent` and `/intent{"entity": "value"}` messages, plus
/// optional keyword rules for free text.
#[derive(Debug, Clone, Default)]
pub struct CommandInterpreter {
    keywords: Vec<(String, String)>,
}

impl CommandInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify free text containing `keyword` (case-insensitive) as `intent`.
    /// Rules are checked in insertion order.
    pub fn with_keyword(mut self, intent: impl Into<String>, keyword: impl Into<String>) -> Self {
        self.keywords
            .push((intent.into(), keyword.into().to_lowercase()));
        self
    }

    fn parse_command(text: &str, command: &str) -> ParseData {
        let (intent, raw_entities) = match command.find('{') {
            Some(start) => (&command[..start], Some(&command[start..])),
            None => (command, None),
        };

        let entities = raw_entities
            .map(|raw| match serde_json::from_str::<Map<String, Value>>(raw) {
                Ok(map) => map
                    .into_iter()
                    .map(|(entity, value)| Entity {
                        entity,
                        value,
                        extra: Map::new(),
                    })
                    .collect(),
                Err(error) => {
                    warn!(%error, "ignoring malformed entities in command message");
                    Vec::new()
                }
            })
            .unwrap_or_default();

        let intent = intent.trim();
        ParseData {
            intent: (!intent.is_empty()).then(|| Intent {
                name: intent.to_owned(),
                confidence: 1.0,
            }),
            entities,
            text: Some(text.to_owned()),
            extra: Map::new(),
        }
    }
}

#[async_trait]
impl Interpreter for CommandInterpreter {
    async fn parse(&self, text: &str) -> ParseData {
        let trimmed = text.trim();
        if let Some(command) = trimmed.strip_prefix('/') {
            return Self::parse_command(text, command);
        }

        let lowered = trimmed.to_lowercase();
        let intent = self
            .keywords
            .iter()
            .find(|(_, keyword)| lowered.split_whitespace().any(|word| word == keyword))
            .map(|(intent, _)| Intent {
                name: intent.clone(),
                confidence: 1.0,
            });
        debug!(matched = intent.is_some(), "free text interpreted");

        ParseData {
            intent,
            entities: Vec::new(),
            text: Some(text.to_owned()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingPolicyConfig {
    /// Intent name → action to run when that intent was the latest input.
    pub intent_actions: BTreeMap<String, String>,
    /// Action for unmapped intents. Defaults to `action_default_fallback`.
    pub fallback_action: Option<String>,
}

/// Maps the latest user intent to an action, then listens.
///
/// The bot acts once per user message: if the most recent input since the
/// last restart is a user utterance, the mapped action is returned; if it is
/// an executed action (or nothing happened yet) the bot listens.
#[derive(Debug, Clone)]
pub struct IntentMappingPolicy {
    intent_actions: BTreeMap<String, String>,
    fallback_action: String,
}

impl Default for IntentMappingPolicy {
    fn default() -> Self {
        Self::from_config(MappingPolicyConfig::default())
    }
}

impl IntentMappingPolicy {
    pub fn from_config(config: MappingPolicyConfig) -> Self {
        Self {
            intent_actions: config.intent_actions,
            fallback_action: config
                .fallback_action
                .unwrap_or_else(|| ACTION_DEFAULT_FALLBACK.to_owned()),
        }
    }

    pub fn map_intent(mut self, intent: impl Into<String>, action: impl Into<String>) -> Self {
        self.intent_actions.insert(intent.into(), action.into());
        self
    }

    fn action_for_intent(&self, intent: Option<&str>, domain: &dyn Domain) -> String {
        let Some(intent) = intent else {
            return self.fallback_action.clone();
        };
        match self.intent_actions.get(intent) {
            Some(action) if domain.action_exists(action) => action.clone(),
            Some(action) => {
                warn!(%intent, %action, "mapped action missing from domain, using fallback");
                self.fallback_action.clone()
            }
            None => self.fallback_action.clone(),
        }
    }
}

#[async_trait]
impl ActionPolicy for IntentMappingPolicy {
    async fn predict_next(
        &self,
        events: &[Event],
        state: &DialogueState,
        domain: &dyn Domain,
    ) -> String {
        if state.paused {
            return ACTION_LISTEN.to_owned();
        }

        let latest_turn = events.iter().rev().find_map(|event| match event.kind() {
            EventKind::UserUttered { parse_data, .. } => Some(Some(parse_data.intent_name())),
            EventKind::ActionExecuted { .. } | EventKind::Restarted => Some(None),
            _ => None,
        });

        match latest_turn {
            Some(Some(intent)) => self.action_for_intent(intent, domain),
            _ => ACTION_LISTEN.to_owned(),
        }
    }
}
