//! In-process controller speaking line-delimited JSON over TCP.
//!
//! Each test drives the controller side explicitly: receive the frames the
//! client sent, reply (possibly out of order), push notifications, or drop
//! the socket.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use subline::{Client, ClientConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeController {
    listener: TcpListener,
    port: u16,
}

impl FakeController {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake controller");
        let port = listener.local_addr().expect("local addr").port();
        Self { listener, port }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
    }

    pub async fn accept(&self) -> PeerConnection {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("client should connect")
            .expect("accept");
        let (read_half, write_half) = stream.into_split();
        PeerConnection {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    /// Connect a client with `config` and accept its socket.
    pub async fn connect(&self, config: ClientConfig) -> (Client, PeerConnection) {
        let (client, peer) = tokio::join!(Client::connect(config), self.accept());
        (client.expect("client should connect"), peer)
    }
}

/// Controller side of one accepted connection.
pub struct PeerConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl PeerConnection {
    /// Next frame the client wrote, parsed as JSON.
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("client should send a frame")
            .expect("read frame")
            .expect("connection still open");
        serde_json::from_str(&line).expect("client frames are valid JSON")
    }

    /// Whether the client stays quiet for `window`.
    pub async fn is_silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.lines.next_line())
            .await
            .is_err()
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write frame");
        self.writer.write_all(b"\n").await.expect("write newline");
    }

    /// Reply to `request` with status 200 and the given objects.
    pub async fn reply_ok(&mut self, request: &Value, objects: Value) {
        self.send(json!({
            "messageID": request["messageID"],
            "command": request["command"],
            "response": "200",
            "objectList": objects,
        }))
        .await;
    }

    pub async fn reply_error(&mut self, request: &Value, code: &str, description: &str) {
        self.send(json!({
            "messageID": request["messageID"],
            "command": request["command"],
            "response": code,
            "description": description,
        }))
        .await;
    }

    pub async fn notify(&mut self, topic: &str, params: Value) {
        self.send(json!({
            "command": "NotifyList",
            "objectList": [{"objnam": topic, "params": params}],
        }))
        .await;
    }
}
