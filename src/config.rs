//! Client configuration.
//!
//! Configuration is a plain serde struct so it can be embedded in a host
//! application's settings or loaded from a standalone TOML file:
//!
//! ```toml
//! host = "192.168.1.20"
//! port = 6681
//! request_timeout_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::protocol::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Default controller port.
pub const DEFAULT_PORT: u16 = 6681;

/// Queue capacity for outbound frames.
///
/// Bounds memory per connection; a full queue rejects new requests instead
/// of blocking the caller.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for every submitted request unless one is given per call.
    /// `None` waits indefinitely.
    pub request_timeout_ms: Option<u64>,
    /// Enable TCP keepalive on the controller socket.
    pub keepalive: bool,
    /// Reconnect once automatically after the transport fails.
    pub auto_reconnect: bool,
    pub outbound_queue_capacity: usize,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            request_timeout_ms: None,
            keepalive: true,
            auto_reconnect: true,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ClientError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ClientError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::config("host must not be empty"));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ClientError::config("outbound_queue_capacity must be positive"));
        }
        if self.max_frame_length == 0 {
            return Err(ClientError::config("max_frame_length must be positive"));
        }
        Ok(())
    }

    /// `host:port` socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}
