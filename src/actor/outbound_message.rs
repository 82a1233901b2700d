//! Outbound message type for the writer loop.
//!
//! Every frame for the controller passes through one bounded queue consumed
//! by the writer task, so frames are written whole and in submission order.

use bytes::Bytes;

use crate::protocol::MessageId;

/// A request frame waiting to be written, already encoded.
#[derive(Debug)]
pub(crate) struct OutboundMessage {
    /// Newline-terminated JSON frame
    pub(crate) payload: Bytes,
    /// Correlation id, registered with the table BEFORE queuing
    pub(crate) message_id: MessageId,
}

impl OutboundMessage {
    pub(crate) fn new(payload: Bytes, message_id: MessageId) -> Self {
        Self {
            payload,
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_format_names_message_id() {
        let msg = OutboundMessage::new(Bytes::from_static(b"{}\n"), MessageId::from("5"));
        let debug_str = format!("{:?}", msg);
        assert!(debug_str.contains("message_id"), "{debug_str}");
        assert!(debug_str.contains("\"5\""), "{debug_str}");
    }
}
