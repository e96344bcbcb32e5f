//! Domain schema: the slots, intents and actions a dialogue agent knows about.
//!
//! The tracker core only borrows a domain to validate events while they are
//! constructed; it never mutates one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const ACTION_LISTEN: &str = "action_listen";
pub const ACTION_RESTART: &str = "action_restart";
pub const ACTION_DEFAULT_FALLBACK: &str = "action_default_fallback";

/// Actions every domain provides regardless of its declared action list.
pub const BUILTIN_ACTIONS: [&str; 3] = [ACTION_LISTEN, ACTION_RESTART, ACTION_DEFAULT_FALLBACK];

/// Read-only view of a domain, consumed by event construction.
pub trait Domain: Send + Sync + fmt::Debug {
    fn slot_type(&self, name: &str) -> Option<&SlotType>;

    fn slot_exists(&self, name: &str) -> bool {
        self.slot_type(name).is_some()
    }

    fn action_exists(&self, name: &str) -> bool;

    fn intent_exists(&self, name: &str) -> bool;
}

/// Type of a slot, deciding which JSON values it accepts.
///
/// `null` is accepted by every type and unsets the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotType {
    Text,
    Bool,
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_value: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_value: Option<f64>,
    },
    Categorical {
        values: Vec<String>,
    },
    List,
    Unfeaturized,
}

impl SlotType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Float { .. } => "float",
            Self::Categorical { .. } => "categorical",
            Self::List => "list",
            Self::Unfeaturized => "unfeaturized",
        }
    }

    /// Check whether `value` may be stored in a slot of this type.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            Self::Unfeaturized => Ok(()),
            Self::Text if value.is_string() => Ok(()),
            Self::Bool if value.is_boolean() => Ok(()),
            Self::List if value.is_array() => Ok(()),
            Self::Float {
                min_value,
                max_value,
            } => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| format!("expected a number, got {value}"))?;
                if let Some(min) = min_value
                    && number < *min
                {
                    return Err(format!("{number} is below the minimum {min}"));
                }
                if let Some(max) = max_value
                    && number > *max
                {
                    return Err(format!("{number} is above the maximum {max}"));
                }
                Ok(())
            }
            Self::Categorical { values } => {
                let candidate = value
                    .as_str()
                    .ok_or_else(|| format!("expected one of {values:?}, got {value}"))?;
                if values
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(candidate))
                {
                    Ok(())
                } else {
                    Err(format!("expected one of {values:?}, got {candidate:?}"))
                }
            }
            other => Err(format!("expected a {} value, got {value}", other.name())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("failed reading domain file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing domain: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid domain: {0}")]
    Invalid(String),
}

/// Serializable domain description, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSpec {
    pub intents: BTreeSet<String>,
    pub slots: BTreeMap<String, SlotType>,
    pub actions: BTreeSet<String>,
}

impl DomainSpec {
    pub fn from_json_str(raw: &str) -> Result<Self, DomainError> {
        let spec: Self = serde_json::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DomainError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DomainError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn with_slot(mut self, name: impl Into<String>, slot_type: SlotType) -> Self {
        self.slots.insert(name.into(), slot_type);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.actions.insert(name.into());
        self
    }

    pub fn with_intent(mut self, name: impl Into<String>) -> Self {
        self.intents.insert(name.into());
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        for (name, slot_type) in &self.slots {
            if name.trim().is_empty() {
                return Err(DomainError::Invalid("slot names must not be empty".to_owned()));
            }
            match slot_type {
                SlotType::Categorical { values } if values.is_empty() => {
                    return Err(DomainError::Invalid(format!(
                        "categorical slot {name} declares no values"
                    )));
                }
                SlotType::Float {
                    min_value: Some(min),
                    max_value: Some(max),
                } if min > max => {
                    return Err(DomainError::Invalid(format!(
                        "float slot {name} has min_value {min} above max_value {max}"
                    )));
                }
                _ => {}
            }
        }
        if self.actions.iter().any(|action| action.trim().is_empty()) {
            return Err(DomainError::Invalid("action names must not be empty".to_owned()));
        }
        Ok(())
    }
}

impl Domain for DomainSpec {
    fn slot_type(&self, name: &str) -> Option<&SlotType> {
        self.slots.get(name)
    }

    fn action_exists(&self, name: &str) -> bool {
        BUILTIN_ACTIONS.contains(&name) || self.actions.contains(name)
    }

    fn intent_exists(&self, name: &str) -> bool {
        self.intents.contains(name)
    }
}
