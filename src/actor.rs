//! Actor components for one controller connection.
//!
//! # Components
//!
//! - `CorrelationTable`: Routes responses to pending requests via oneshot channels
//! - `Reader`: Background task that reads frames and routes responses and notifications
//! - `Writer`: Background task that drains the bounded outbound queue onto the socket
//! - `FailureNotifier`: Tells the supervisor a connection is unusable

mod correlation;
mod link_failure;
mod outbound_message;
mod reader;
mod writer;

pub(crate) use correlation::CorrelationTable;
pub use correlation::ResponseFuture;
pub(crate) use link_failure::{FailureNotifier, LinkFailure};
pub(crate) use outbound_message::OutboundMessage;
pub(crate) use reader::{FrameRouter, ReaderTaskHandle, spawn_reader_task};
pub(crate) use writer::{WriterTaskHandle, spawn_writer_task};
