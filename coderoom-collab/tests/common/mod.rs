//! Shared harness: a real server on a free port and raw WebSocket clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coderoom_collab::auth::{RejectAllVerifier, TokenVerifier};
use coderoom_collab::protocol::{
    ClientMessage, Language, RoomId, RoomSnapshot, ServerMessage, WireFormat, WireFrame,
};
use coderoom_collab::sandbox::{ExecutionOutput, ExecutorError, SandboxExecutor};
use coderoom_collab::server::{CodeRoomServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a client waits for an expected message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Echoes the code back as stdout. Code containing `sleep` never finishes
/// on its own; code containing `fail` exits with 1.
pub struct EchoExecutor;

#[async_trait]
impl SandboxExecutor for EchoExecutor {
    async fn execute(&self, code: &str, _language: Language) -> Result<ExecutionOutput, ExecutorError> {
        if code.contains("sleep") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if code.contains("fail") {
            return Ok(ExecutionOutput {
                stdout: String::new(),
                stderr: "boom".into(),
                exit_code: 1,
            });
        }
        Ok(ExecutionOutput {
            stdout: code.to_owned(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Defaults tuned for tests: departures are announced at once.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        broadcast_capacity: 64,
        reconnect_window: Duration::ZERO,
        execution_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    }
}

/// Start a server on a free port, return the port and the server.
pub async fn start_test_server(config: ServerConfig) -> (u16, Arc<CodeRoomServer>) {
    start_server_with(config, Arc::new(EchoExecutor), Arc::new(RejectAllVerifier)).await
}

pub async fn start_server_with(
    config: ServerConfig,
    executor: Arc<dyn SandboxExecutor>,
    verifier: Arc<dyn TokenVerifier>,
) -> (u16, Arc<CodeRoomServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(CodeRoomServer::new(config, executor, verifier).unwrap());

    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (port, server)
}

pub fn room(id: &str) -> RoomId {
    RoomId::parse(id).unwrap()
}

pub struct TestClient {
    ws: Ws,
    /// Codec used for outgoing messages.
    pub format: WireFormat,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let url = format!("ws://127.0.0.1:{port}");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        Self {
            ws,
            format: WireFormat::Json,
        }
    }

    pub async fn send(&mut self, message: ClientMessage) {
        let frame = message.encode(self.format).unwrap();
        self.send_raw(to_message(frame)).await;
    }

    pub async fn send_raw(&mut self, message: Message) {
        self.ws.send(message).await.unwrap();
    }

    /// Next protocol message and the codec it arrived in.
    pub async fn recv_frame(&mut self) -> (WireFormat, ServerMessage) {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a server message")
                .expect("connection closed")
                .unwrap();
            let frame = match msg {
                Message::Text(text) => WireFrame::Text(text.as_str().to_owned()),
                Message::Binary(data) => WireFrame::Binary(data.to_vec()),
                Message::Close(_) => panic!("server closed the connection"),
                _ => continue,
            };
            return (frame.format(), ServerMessage::decode(&frame).unwrap());
        }
    }

    pub async fn recv(&mut self) -> ServerMessage {
        self.recv_frame().await.1
    }

    /// Skip messages until one matches.
    pub async fn recv_matching(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    /// Join and return the snapshot.
    pub async fn join(&mut self, room_id: &str, name: &str) -> RoomSnapshot {
        self.join_with_token(room_id, name, None).await
    }

    pub async fn join_with_token(&mut self, room_id: &str, name: &str, token: Option<&str>) -> RoomSnapshot {
        self.send(ClientMessage::Join {
            room_id: room(room_id),
            display_name: name.into(),
            token: token.map(str::to_owned),
        })
        .await;
        match self.recv().await {
            ServerMessage::Snapshot(snapshot) => snapshot,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    /// Assert nothing but control frames arrives for `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {text}"),
                Ok(Some(Ok(Message::Binary(data)))) => panic!("unexpected binary message: {data:?}"),
                Ok(Some(Ok(_))) => continue,
                Ok(other) => panic!("connection ended: {other:?}"),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}
