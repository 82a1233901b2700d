//! Line-delimited JSON framing.
//!
//! Every frame is one JSON object terminated by `\n` (a preceding `\r` is
//! tolerated). Decoding never fails on bad content: a line that is not a
//! valid response, is not UTF-8, or exceeds the length limit comes out as
//! [`Frame::Malformed`] so the reader can log it and keep going. Only real
//! I/O errors end the stream.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Request, Response};
use crate::error::{ClientError, Result};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// One unit of decoded wire data.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Response),
    /// A line that could not be decoded. `line` is lossy and truncated for logs.
    Malformed { line: String, reason: String },
}

/// Serialize a request into a newline-terminated wire frame.
pub fn encode_request(request: &Request) -> Result<Bytes> {
    let mut line = serde_json::to_vec(request).map_err(|e| ClientError::protocol(e.to_string()))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decode one line (without its terminator) into a frame.
pub fn decode_line(line: &[u8]) -> Frame {
    match serde_json::from_slice::<Response>(line) {
        Ok(response) => Frame::Response(response),
        Err(e) => Frame::Malformed {
            line: preview(line),
            reason: e.to_string(),
        },
    }
}

fn preview(line: &[u8]) -> String {
    const PREVIEW_LEN: usize = 256;
    let text = String::from_utf8_lossy(&line[..line.len().min(PREVIEW_LEN)]);
    if line.len() > PREVIEW_LEN {
        format!("{text}...")
    } else {
        text.into_owned()
    }
}

/// tokio-util codec for the controller's framing.
#[derive(Debug)]
pub struct FrameCodec {
    max_length: usize,
    /// Bytes already scanned for a newline in the current buffer.
    next_index: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.advance(src.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    if line.len() > self.max_length {
                        return Ok(Some(too_long(&line, self.max_length)));
                    }
                    return Ok(Some(decode_line(&line)));
                }
                (false, None) if src.len() > self.max_length => {
                    let frame = too_long(src, self.max_length);
                    src.advance(src.len());
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(frame));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding || src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            self.discarding = false;
            return Ok(None);
        }
        // Trailing frame without terminator
        let line = src.split_to(src.len());
        Ok(Some(decode_line(&line)))
    }
}

fn too_long(line: &[u8], max_length: usize) -> Frame {
    Frame::Malformed {
        line: preview(line),
        reason: format!("frame exceeds {max_length} bytes"),
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        if !item.ends_with(b"\n") {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut FrameCodec, input: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_request_appends_newline() {
        let request = Request::new("GetQuery").with_message_id("1");
        let bytes = encode_request(&request).unwrap();
        assert!(bytes.ends_with(b"\n"));

        let value: serde_json::Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(value, json!({"messageID": "1", "command": "GetQuery"}));
    }

    #[test]
    fn decodes_multiple_frames_from_one_buffer() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(
            &mut codec,
            b"{\"messageID\":\"1\",\"command\":\"A\"}\n{\"command\":\"NotifyList\"}\r\n",
        );
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Response(r) if r.command() == "A"));
        assert!(matches!(&frames[1], Frame::Response(r) if r.is_notification()));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"command\":"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\"A\"}\n");
        let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert!(matches!(frame, Frame::Response(r) if r.command() == "A"));
    }

    #[test]
    fn garbage_line_is_malformed_and_stream_continues() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(&mut codec, b"not json\n{\"command\":\"B\"}\n");
        assert!(matches!(&frames[0], Frame::Malformed { line, .. } if line == "not json"));
        assert!(matches!(&frames[1], Frame::Response(r) if r.command() == "B"));
    }

    #[test]
    fn numeric_message_id_is_not_malformed() {
        let frame = decode_line(b"{\"messageID\":7,\"command\":\"GetQuery\",\"response\":\"200\"}");
        assert!(
            matches!(&frame, Frame::Response(r) if r.message_id().map(|id| id.as_str()) == Some("7")),
            "{frame:?}"
        );
    }

    #[test]
    fn invalid_utf8_is_malformed_not_io_error() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(&mut codec, b"\xff\xfe\n");
        assert!(matches!(frames[0], Frame::Malformed { .. }));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(&mut codec, b"\n\r\n{\"command\":\"C\"}\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn over_long_line_is_reported_then_discarded() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"0123456789abcdefXYZ"[..]);
        let frame = codec.decode(&mut buf).unwrap().expect("malformed frame");
        assert!(matches!(frame, Frame::Malformed { reason, .. } if reason.contains("16")));

        // Rest of the long line is dropped, the next line decodes normally.
        buf.extend_from_slice(b"tail\n{\"command\":\"D\"}\n");
        let frame = codec.decode(&mut buf).unwrap().expect("next frame");
        assert!(matches!(frame, Frame::Response(r) if r.command() == "D"));
    }

    #[test]
    fn decode_eof_flushes_unterminated_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"command\":\"E\"}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        let frame = codec.decode_eof(&mut buf).unwrap().expect("trailing frame");
        assert!(matches!(frame, Frame::Response(r) if r.command() == "E"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encoder_does_not_double_newline() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}\n"), &mut dst).unwrap();
        codec.encode(Bytes::from_static(b"{}"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{}\n{}\n");
    }
}
