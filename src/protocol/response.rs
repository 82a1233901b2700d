//! Decoded response and notification frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::MessageId;
use super::request::command;

/// Status code the controller uses for a successful response.
pub const STATUS_OK_CODE: &str = "200";

/// Outcome reported by the controller for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

/// One named object carried in a response's `objectList`.
///
/// The object name doubles as the subscription topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    #[serde(rename = "objnam")]
    topic: String,
    #[serde(default)]
    params: Map<String, Value>,
}

impl ObjectRecord {
    pub fn new(topic: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            topic: topic.into(),
            params,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// A decoded frame: either the answer to a request or a push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireResponse", into = "WireResponse")]
pub struct Response {
    message_id: Option<MessageId>,
    command: String,
    code: Option<String>,
    description: Option<String>,
    objects: Vec<ObjectRecord>,
}

impl Response {
    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Frames without a status code (plain pushes) count as successful.
    pub fn status(&self) -> Status {
        match self.code.as_deref() {
            None | Some(STATUS_OK_CODE) => Status::Ok,
            Some(_) => Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Status::Ok
    }

    /// Raw status code as sent by the controller.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn objects(&self) -> &[ObjectRecord] {
        &self.objects
    }

    pub fn is_notification(&self) -> bool {
        self.command == command::NOTIFY_LIST
    }

    /// Human readable reason for an error status.
    pub(crate) fn failure_reason(&self) -> String {
        match (self.code(), self.description()) {
            (Some(code), Some(description)) => format!("{code}: {description}"),
            (Some(code), None) => format!("status {code}"),
            (None, Some(description)) => description.to_string(),
            (None, None) => "unknown failure".to_string(),
        }
    }
}

/// Wire representation; the status code may arrive as a string or a number.
#[derive(Serialize, Deserialize)]
struct WireResponse {
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    message_id: Option<MessageId>,
    #[serde(default)]
    command: String,
    #[serde(rename = "response", default, skip_serializing_if = "Option::is_none")]
    code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "objectList", default)]
    objects: Vec<ObjectRecord>,
}

impl From<WireResponse> for Response {
    fn from(wire: WireResponse) -> Self {
        let code = match wire.code {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code),
            Some(other) => Some(other.to_string()),
        };
        Self {
            message_id: wire.message_id,
            command: wire.command,
            code,
            description: wire.description,
            objects: wire.objects,
        }
    }
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        Self {
            message_id: response.message_id,
            command: response.command,
            code: response.code.map(Value::String),
            description: response.description,
            objects: response.objects,
        }
    }
}
