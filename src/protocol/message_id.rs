//! Correlation identifier carried in the `messageID` field of every frame.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use ulid::Ulid;

/// Correlation id linking a request to its eventual response.
///
/// Ids generated by the client are ULIDs, so they are unique across
/// reconnects and never collide with a late response from an earlier
/// session. Ids supplied by callers are accepted verbatim; the controller
/// only echoes them back and never interprets them.
///
/// Always serialized as a string. A numeric id on the wire is accepted and
/// kept in its decimal text form, so `1` and `"1"` are the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match WireId::deserialize(deserializer)? {
            WireId::Text(text) => Self(text),
            WireId::Number(number) => Self(number.to_string()),
        })
    }
}

impl MessageId {
    /// Generate a fresh, process-unique id.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
