//! Conversation event model.
//!
//! Events are immutable facts about a conversation. On the wire every event
//! is a flat JSON object whose `"event"` key names the kind, e.g.
//! `{"event": "set_slot", "name": "cuisine", "value": "thai"}`. The set of
//! kinds is closed: an unrecognized tag is rejected with
//! [`TrackerError::UnknownEventKind`] instead of being dropped.
//!
//! Construction from the wire validates against a [`Domain`]; decoding of
//! already persisted events goes through the same tag dispatch but skips
//! domain validation, so a changed domain never makes stored history
//! unreadable.

use crate::domain::Domain;
use crate::error::{TrackerError, TrackerResult};
use crate::state::DialogueState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Key holding the kind tag in the wire format.
pub const EVENT_TAG_KEY: &str = "event";
const TIMESTAMP_KEY: &str = "timestamp";

/// Intent recognized in a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

/// Entity extracted from a user message. Unknown keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity: String,
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structured interpretation of a user message.
///
/// Keys other than `intent`, `entities` and `text` are carried through
/// untouched so events round-trip in the shape they arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ParseData {
    pub fn intent_name(&self) -> Option<&str> {
        self.intent.as_ref().map(|intent| intent.name.as_str())
    }
}

/// Closed set of event kinds. Serializes into the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "user")]
    UserUttered {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        parse_data: ParseData,
    },
    #[serde(rename = "bot")]
    BotUttered {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(rename = "set_slot")]
    SlotSet { name: String, value: Value },
    #[serde(rename = "action_executed")]
    ActionExecuted { action_name: String },
    #[serde(rename = "restart")]
    Restarted,
    #[serde(rename = "reset_slots")]
    AllSlotsReset,
    #[serde(rename = "pause")]
    ConversationPaused,
    #[serde(rename = "resume")]
    ConversationResumed,
}

impl EventKind {
    /// Canonical wire tag of this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UserUttered { .. } => "user",
            Self::BotUttered { .. } => "bot",
            Self::SlotSet { .. } => "set_slot",
            Self::ActionExecuted { .. } => "action_executed",
            Self::Restarted => "restart",
            Self::AllSlotsReset => "reset_slots",
            Self::ConversationPaused => "pause",
            Self::ConversationResumed => "resume",
        }
    }
}

/// Statically known tags, aliases included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownTag {
    User,
    Bot,
    SlotSet,
    Action,
    Restart,
    ResetSlots,
    Pause,
    Resume,
}

impl KnownTag {
    fn parse(tag: &str) -> Option<Self> {
        let known = match tag {
            "user" | "user_uttered" => Self::User,
            "bot" | "bot_uttered" => Self::Bot,
            "set_slot" | "slot" => Self::SlotSet,
            "action_executed" | "action" => Self::Action,
            "restart" | "restarted" => Self::Restart,
            "reset_slots" => Self::ResetSlots,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            _ => return None,
        };
        Some(known)
    }
}

#[derive(Deserialize)]
struct UserParams {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    parse_data: Option<ParseData>,
}

#[derive(Deserialize)]
struct BotParams {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct SlotParams {
    name: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct ActionParams {
    #[serde(alias = "name")]
    action_name: String,
}

/// One immutable conversation event: a kind plus an optional timestamp
/// (seconds since the UNIX epoch).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Some(now_timestamp()),
        }
    }

    pub fn with_timestamp(kind: EventKind, timestamp: Option<f64>) -> Self {
        Self { kind, timestamp }
    }

    pub fn slot_set(name: impl Into<String>, value: Value) -> Self {
        Self::new(EventKind::SlotSet {
            name: name.into(),
            value,
        })
    }

    pub fn action_executed(action_name: impl Into<String>) -> Self {
        Self::new(EventKind::ActionExecuted {
            action_name: action_name.into(),
        })
    }

    pub fn user_uttered(text: impl Into<String>, parse_data: ParseData) -> Self {
        Self::new(EventKind::UserUttered {
            text: Some(text.into()),
            parse_data,
        })
    }

    pub fn bot_uttered(text: impl Into<String>) -> Self {
        Self::new(EventKind::BotUttered {
            text: Some(text.into()),
            data: None,
        })
    }

    pub fn restarted() -> Self {
        Self::new(EventKind::Restarted)
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    /// Build an event from its kind tag and parameters, validating them
    /// against `domain`.
    pub fn construct(
        kind: &str,
        params: Map<String, Value>,
        domain: &dyn Domain,
    ) -> TrackerResult<Self> {
        Self::build(kind, params, Some(domain))
    }

    /// Build an event from one wire mapping (`{"event": kind, ...}`).
    pub fn from_wire(raw: Value, domain: &dyn Domain) -> TrackerResult<Self> {
        let Value::Object(mut params) = raw else {
            return Err(TrackerError::invalid_params(
                "event descriptor must be a JSON object",
            ));
        };
        let kind = take_tag(&mut params)?;
        Self::construct(&kind, params, domain)
    }

    /// Decode a previously persisted event without domain validation.
    pub fn decode(mut params: Map<String, Value>) -> TrackerResult<Self> {
        let kind = take_tag(&mut params)?;
        Self::build(&kind, params, None)
    }

    fn build(
        kind: &str,
        mut params: Map<String, Value>,
        domain: Option<&dyn Domain>,
    ) -> TrackerResult<Self> {
        let tag =
            KnownTag::parse(kind).ok_or_else(|| TrackerError::UnknownEventKind(kind.to_owned()))?;
        // Fresh wire events are stamped on arrival; stored ones keep what they had.
        let timestamp = match params.remove(TIMESTAMP_KEY) {
            None | Some(Value::Null) => domain.is_some().then(now_timestamp),
            Some(value) => Some(value.as_f64().ok_or_else(|| {
                TrackerError::invalid_params(format!("{kind}: timestamp must be a number"))
            })?),
        };

        let event_kind = match tag {
            KnownTag::User => {
                let UserParams { text, parse_data } = params_as(kind, params)?;
                EventKind::UserUttered {
                    text,
                    parse_data: parse_data.unwrap_or_default(),
                }
            }
            KnownTag::Bot => {
                let BotParams { text, data } = params_as(kind, params)?;
                EventKind::BotUttered { text, data }
            }
            KnownTag::SlotSet => {
                let SlotParams { name, value } = params_as(kind, params)?;
                if let Some(domain) = domain {
                    validate_slot(domain, &name, &value)?;
                }
                EventKind::SlotSet { name, value }
            }
            KnownTag::Action => {
                let ActionParams { action_name } = params_as(kind, params)?;
                if action_name.trim().is_empty() {
                    return Err(TrackerError::invalid_params(
                        "action_name must not be empty",
                    ));
                }
                if let Some(domain) = domain
                    && !domain.action_exists(&action_name)
                {
                    return Err(TrackerError::invalid_params(format!(
                        "action {action_name} is not defined in the domain"
                    )));
                }
                EventKind::ActionExecuted { action_name }
            }
            KnownTag::Restart => EventKind::Restarted,
            KnownTag::ResetSlots => EventKind::AllSlotsReset,
            KnownTag::Pause => EventKind::ConversationPaused,
            KnownTag::Resume => EventKind::ConversationResumed,
        };

        Ok(Self {
            kind: event_kind,
            timestamp,
        })
    }

    /// Apply this event to `state`. Total: every kind has a rule and none
    /// of them can fail.
    pub fn apply_to(&self, state: &mut DialogueState) {
        match &self.kind {
            EventKind::SlotSet { name, value } => {
                state.slots.insert(name.clone(), value.clone());
            }
            EventKind::ActionExecuted { action_name } => {
                state.latest_action_name = Some(action_name.clone());
                state.turn_count = state.turn_count.saturating_add(1);
            }
            EventKind::UserUttered { text, parse_data } => {
                state.latest_message = Some(crate::state::UserMessage {
                    text: text.clone(),
                    parse_data: parse_data.clone(),
                });
            }
            EventKind::BotUttered { text, .. } => {
                state.latest_bot_utterance = text.clone();
            }
            EventKind::Restarted => {
                *state = DialogueState::default();
            }
            EventKind::AllSlotsReset => state.slots.clear(),
            EventKind::ConversationPaused => state.paused = true,
            EventKind::ConversationResumed => state.paused = false,
        }
        if self.timestamp.is_some() {
            state.latest_event_time = self.timestamp;
        }
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        Self::decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Convert an ordered batch of wire descriptors into events.
///
/// All-or-nothing: the first invalid descriptor aborts the whole batch, so
/// callers never apply a partially constructed batch.
pub fn parse_events(batch: Vec<Value>, domain: &dyn Domain) -> TrackerResult<Vec<Event>> {
    batch
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            Event::from_wire(raw, domain).map_err(|error| match error {
                TrackerError::InvalidEventParams(message) => {
                    TrackerError::InvalidEventParams(format!("event #{index}: {message}"))
                }
                other => other,
            })
        })
        .collect()
}

fn take_tag(params: &mut Map<String, Value>) -> TrackerResult<String> {
    match params.remove(EVENT_TAG_KEY) {
        Some(Value::String(tag)) => Ok(tag),
        Some(other) => Err(TrackerError::invalid_params(format!(
            "\"{EVENT_TAG_KEY}\" must be a string, got {other}"
        ))),
        None => Err(TrackerError::invalid_params(format!(
            "missing \"{EVENT_TAG_KEY}\" key"
        ))),
    }
}

fn params_as<T: DeserializeOwned>(kind: &str, params: Map<String, Value>) -> TrackerResult<T> {
    serde_json::from_value(Value::Object(params))
        .map_err(|error| TrackerError::invalid_params(format!("{kind}: {error}")))
}

fn validate_slot(domain: &dyn Domain, name: &str, value: &Value) -> TrackerResult<()> {
    let slot_type = domain.slot_type(name).ok_or_else(|| {
        TrackerError::invalid_params(format!("slot {name} is not defined in the domain"))
    })?;
    slot_type
        .validate(value)
        .map_err(|reason| TrackerError::invalid_params(format!("slot {name}: {reason}")))
}

/// Current time in seconds since the UNIX epoch, microsecond precision.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
