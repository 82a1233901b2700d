//! TCP transport to the controller.
//!
//! Owns socket setup (address resolution, keepalive) and splits the stream
//! into independently owned framed halves: the read half goes to the reader
//! task, the write half to the writer task.

use std::io;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::FrameCodec;

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// An established connection, not yet handed to the actor tasks.
pub(crate) struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Transport {
    /// Resolve the configured address and connect to the first reachable peer.
    pub(crate) async fn connect(config: &ClientConfig) -> Result<Self> {
        let address = config.address();
        let candidates = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| ClientError::connection(&address, &e))?;

        let mut last_error = None;
        for candidate in candidates {
            match connect_socket(candidate, config.keepalive).await {
                Ok(stream) => {
                    log::debug!(
                        target: "subline::transport",
                        "Connected to {} ({})",
                        address,
                        candidate
                    );
                    return Ok(Self::from_stream(stream, config.max_frame_length));
                }
                Err(e) => {
                    log::debug!(
                        target: "subline::transport",
                        "Connect to {} failed: {}",
                        candidate,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"));
        Err(ClientError::connection(address, &error))
    }

    pub(crate) fn from_stream(stream: TcpStream, max_frame_length: usize) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!(target: "subline::transport", "set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, FrameCodec::new(max_frame_length)),
            writer: FramedWrite::new(write_half, FrameCodec::new(max_frame_length)),
        }
    }

    pub(crate) fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

async fn connect_socket(address: std::net::SocketAddr, keepalive: bool) -> io::Result<TcpStream> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(keepalive)?;
    socket.connect(address).await
}
