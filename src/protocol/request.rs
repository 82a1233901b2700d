//! Outgoing request frames and the builders for protocol-level requests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::MessageId;

/// Command names understood by the controller.
pub mod command {
    /// Subscribe to parameter changes of one or more objects.
    pub const REQUEST_PARAM_LIST: &str = "RequestParamList";
    /// Drop a subscription previously made with `RequestParamList`.
    pub const RELEASE_PARAM_LIST: &str = "ReleaseParamList";
    /// Unsolicited push of changed parameters.
    pub const NOTIFY_LIST: &str = "NotifyList";
}

/// A request sent to the controller.
///
/// Everything except the id and the command is an opaque parameter map that
/// is flattened into the top-level JSON object on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none", default)]
    message_id: Option<MessageId>,
    command: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            message_id: None,
            command: command.into(),
            params: Map::new(),
        }
    }

    /// Subscribe request for `topic`, optionally limited to `keys`.
    pub fn subscribe(topic: &str, keys: &[String]) -> Self {
        Self::new(command::REQUEST_PARAM_LIST)
            .with_param("objectList", json!([{ "objnam": topic, "keys": keys }]))
    }

    /// Release request for `topic`.
    pub fn release(topic: &str) -> Self {
        Self::new(command::RELEASE_PARAM_LIST).with_param("objectList", json!([{ "objnam": topic }]))
    }

    /// Use a caller-chosen correlation id instead of a generated one.
    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Replace the parameter map with the fields of a JSON object.
    ///
    /// Non-object values are stored under a `params` key so nothing is lost.
    pub fn with_params(mut self, params: Value) -> Self {
        match params {
            Value::Object(map) => self.params = map,
            Value::Null => self.params.clear(),
            other => {
                self.params.insert("params".to_string(), other);
            }
        }
        self
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Return the request's id, assigning a fresh one first if it has none.
    pub(crate) fn ensure_message_id(&mut self) -> MessageId {
        self.message_id.get_or_insert_with(MessageId::generate).clone()
    }
}
