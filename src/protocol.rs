//! Wire protocol: frame shapes, correlation ids, and the line codec.

pub mod codec;
mod message_id;
mod request;
mod response;

pub use codec::{Frame, FrameCodec};
pub use message_id::MessageId;
pub use request::{Request, command};
pub use response::{ObjectRecord, Response, STATUS_OK_CODE, Status};
