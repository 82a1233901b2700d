//! Async request/response client for line-delimited JSON controllers.
//!
//! One persistent TCP connection carries correlated requests and pushed
//! `NotifyList` updates. Callers [`Client::submit`] requests and await the
//! returned [`ResponseFuture`]; topic listeners registered with
//! [`Client::subscribe`] receive updates on a dedicated notifier thread.

mod actor;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod subscription;
mod transport;

pub use actor::ResponseFuture;
pub use client::{Client, ConnectionState};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use protocol::{MessageId, ObjectRecord, Request, Response, Status};
pub use subscription::SubscriptionHandle;
