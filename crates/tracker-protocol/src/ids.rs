//! Conversation identifiers.
//!
//! Conversation ids are caller-supplied opaque strings (serde-transparent).
//! The only structural requirement is that they are non-empty.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TrackerError, TrackerResult};

/// Unique identifier for one dialogue session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Validate and wrap a caller-supplied id.
    pub fn parse(raw: impl Into<String>) -> TrackerResult<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(TrackerError::InvalidConversationId(
                "conversation id must not be empty".to_owned(),
            ));
        }
        Ok(Self(raw))
    }

    /// View as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = TrackerError;

    fn try_from(s: String) -> TrackerResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ConversationId {
    type Error = TrackerError;

    fn try_from(s: &str) -> TrackerResult<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
