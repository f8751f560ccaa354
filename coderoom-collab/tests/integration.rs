//! End-to-end tests over real WebSocket connections.
//!
//! These tests start a real server and connect raw clients, verifying
//! edits, runs and rejections through the full pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use coderoom_collab::auth::{Identity, StaticTokenVerifier};
use coderoom_collab::ot::TextOperation;
use coderoom_collab::protocol::{
    Action, ClientMessage, EditPayload, ErrorCode, ExecutionView, Language, RunFailure,
    ServerMessage, WireFormat, WireFrame,
};
use coderoom_collab::room::DEFAULT_BUFFER;
use coderoom_collab::server::ServerConfig;
use common::{room, start_server_with, start_test_server, test_config, EchoExecutor, TestClient};
use tokio_tungstenite::tungstenite::Message;

fn replace(room_id: &str, base_revision: u64, text: &str) -> ClientMessage {
    ClientMessage::EditSubmit {
        room_id: room(room_id),
        base_revision,
        payload: EditPayload::Replace { text: text.into() },
        client_timestamp: None,
    }
}

fn delta(room_id: &str, base_revision: u64, operation: TextOperation) -> ClientMessage {
    ClientMessage::EditSubmit {
        room_id: room(room_id),
        base_revision,
        payload: EditPayload::Delta { operation },
        client_timestamp: Some(1_700_000_000_000),
    }
}

fn run(room_id: &str) -> ClientMessage {
    ClientMessage::RunRequest {
        room_id: room(room_id),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, server) = start_test_server(test_config()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_first_join_creates_room_with_defaults() {
    let (port, server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;

    let snapshot = alice.join("R1", "Alice").await;
    assert_eq!(snapshot.room_id, room("R1"));
    assert_eq!(snapshot.buffer, DEFAULT_BUFFER);
    assert_eq!(snapshot.language, Language::JavaScript);
    assert_eq!(snapshot.revision, 0);
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(snapshot.participants[0].display_name, "Alice");
    assert_eq!(snapshot.participants[0].connection_id, snapshot.you);
    assert_eq!(snapshot.execution, ExecutionView::Idle);
    assert!(snapshot.last_run.is_none());

    assert_eq!(server.store().room_count().await, 1);
}

#[tokio::test]
async fn test_edit_join_and_run_scenario() {
    let (port, _server) = start_test_server(test_config()).await;

    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;

    alice.send(replace("R1", 0, "print(1)")).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 1 });

    let mut bob = TestClient::connect(port).await;
    let snapshot = bob.join("R1", "Bob").await;
    assert_eq!(snapshot.buffer, "print(1)");
    assert_eq!(snapshot.revision, 1);
    assert_eq!(snapshot.participants.len(), 2);
    let bob_id = snapshot.you;

    let ServerMessage::ParticipantJoined { participant, participants } = alice.recv().await else {
        panic!("expected ParticipantJoined");
    };
    assert_eq!(participant.display_name, "Bob");
    assert_eq!(participants.len(), 2);

    bob.send(ClientMessage::LanguageChange {
        room_id: room("R1"),
        language: Language::Python,
    })
    .await;
    let changed = ServerMessage::LanguageChanged {
        revision: 2,
        language: Language::Python,
        changed_by: bob_id,
    };
    assert_eq!(alice.recv().await, changed);
    assert_eq!(bob.recv().await, changed);

    bob.send(run("R1")).await;
    let ServerMessage::RunAccepted { request_id } = bob.recv().await else {
        panic!("expected RunAccepted");
    };

    for client in [&mut alice, &mut bob] {
        assert_eq!(
            client.recv().await,
            ServerMessage::RunStarted {
                request_id,
                requested_by: bob_id,
                language: Language::Python,
            }
        );
        assert_eq!(
            client.recv().await,
            ServerMessage::RunCompleted {
                request_id,
                stdout: "print(1)".into(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
            }
        );
    }

    // Late joiners see the last result.
    let mut carol = TestClient::connect(port).await;
    let snapshot = carol.join("R1", "Carol").await;
    let last_run = snapshot.last_run.unwrap();
    assert_eq!(last_run.request_id, request_id);
    assert_eq!(last_run.language, Language::Python);
}

#[tokio::test]
async fn test_concurrent_deltas_converge() {
    let (port, _server) = start_test_server(test_config()).await;

    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    alice.send(replace("R1", 0, "ab")).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 1 });

    let mut bob = TestClient::connect(port).await;
    assert_eq!(bob.join("R1", "Bob").await.revision, 1);
    alice
        .recv_matching(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;

    // Both edit revision 1 without having seen each other's change.
    let mut append = TextOperation::new();
    append.retain(2).insert("X");
    let mut prepend = TextOperation::new();
    prepend.insert("Y").retain(2);

    alice.send(delta("R1", 1, append.clone())).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 2 });
    bob.send(delta("R1", 1, prepend)).await;

    // Bob first sees Alice's edit, then the ack for his own.
    let ServerMessage::EditApplied { revision: 2, payload, .. } = bob.recv().await else {
        panic!("expected Alice's edit");
    };
    assert_eq!(payload, EditPayload::Delta { operation: append });
    assert_eq!(bob.recv().await, ServerMessage::EditAck { revision: 3 });

    // Alice receives Bob's edit rebased onto hers.
    let ServerMessage::EditApplied { revision: 3, payload, .. } = alice.recv().await else {
        panic!("expected Bob's edit");
    };
    let EditPayload::Delta { operation } = payload else {
        panic!("expected a delta");
    };
    assert_eq!(operation.apply("abX").unwrap(), "YabX");

    let mut carol = TestClient::connect(port).await;
    let snapshot = carol.join("R1", "Carol").await;
    assert_eq!(snapshot.buffer, "YabX");
    assert_eq!(snapshot.revision, 3);
}

#[tokio::test]
async fn test_originator_gets_ack_not_echo() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    bob.join("R1", "Bob").await;
    alice
        .recv_matching(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;

    alice.send(replace("R1", 0, "hello")).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 1 });
    assert!(matches!(bob.recv().await, ServerMessage::EditApplied { revision: 1, .. }));
    alice.assert_silent(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_stale_replace_rejected_with_current_revision() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;

    alice.send(replace("R1", 0, "one")).await;
    alice.recv().await;
    alice.send(replace("R1", 0, "two")).await;

    let ServerMessage::Rejected {
        action,
        code,
        current_revision,
        ..
    } = alice.recv().await
    else {
        panic!("expected rejection");
    };
    assert_eq!(action, Action::Edit);
    assert_eq!(code, ErrorCode::StaleRevision);
    assert_eq!(current_revision, Some(1));

    alice
        .send(ClientMessage::Resync {
            room_id: room("R1"),
        })
        .await;
    let ServerMessage::Snapshot(snapshot) = alice.recv().await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.buffer, "one");
}

#[tokio::test]
async fn test_delta_with_wrong_length_rejected() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    alice.send(replace("R1", 0, "abc")).await;
    alice.recv().await;

    let mut op = TextOperation::new();
    op.retain(10).insert("!");
    alice.send(delta("R1", 1, op)).await;
    assert!(matches!(
        alice.recv().await,
        ServerMessage::Rejected {
            code: ErrorCode::InvalidOperation,
            ..
        }
    ));
}

#[tokio::test]
async fn test_edit_without_join_rejected() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;

    let mut mallory = TestClient::connect(port).await;
    mallory.send(replace("R1", 0, "pwned")).await;
    assert!(matches!(
        mallory.recv().await,
        ServerMessage::Rejected {
            code: ErrorCode::NotInRoom,
            ..
        }
    ));

    mallory.send(replace("NOPE", 0, "x")).await;
    assert!(matches!(
        mallory.recv().await,
        ServerMessage::Rejected {
            code: ErrorCode::RoomNotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn test_single_flight_and_timeout() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    bob.join("R1", "Bob").await;
    alice
        .recv_matching(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;

    alice.send(replace("R1", 0, "sleep(100)")).await;
    alice.recv().await;
    bob.recv().await;

    alice.send(run("R1")).await;
    let ServerMessage::RunAccepted { request_id } = alice.recv().await else {
        panic!("expected RunAccepted");
    };
    assert!(matches!(bob.recv().await, ServerMessage::RunStarted { .. }));

    bob.send(run("R1")).await;
    let ServerMessage::Rejected { action, code, .. } = bob.recv().await else {
        panic!("expected AlreadyRunning");
    };
    assert_eq!((action, code), (Action::Run, ErrorCode::AlreadyRunning));

    let failed = ServerMessage::RunFailed {
        request_id,
        reason: RunFailure::ExecutionTimeout,
    };
    assert_eq!(
        alice
            .recv_matching(|m| matches!(m, ServerMessage::RunFailed { .. }))
            .await,
        failed
    );
    assert_eq!(bob.recv().await, failed);

    // The slot is free again.
    alice.send(replace("R1", 1, "print(2)")).await;
    alice.recv().await;
    bob.send(run("R1")).await;
    assert!(matches!(
        bob.recv_matching(|m| !matches!(m, ServerMessage::EditApplied { .. }))
            .await,
        ServerMessage::RunAccepted { .. }
    ));
}

#[tokio::test]
async fn test_failing_program_reports_exit_code() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    alice.send(replace("R1", 0, "fail()")).await;
    alice.recv().await;

    alice.send(run("R1")).await;
    let completed = alice
        .recv_matching(|m| matches!(m, ServerMessage::RunCompleted { .. }))
        .await;
    let ServerMessage::RunCompleted {
        stderr,
        exit_code,
        success,
        ..
    } = completed
    else {
        unreachable!()
    };
    assert_eq!(stderr, "boom");
    assert_eq!(exit_code, 1);
    assert!(!success);
}

#[tokio::test]
async fn test_execution_disabled_room() {
    let mut config = test_config();
    config.room_defaults.settings.allow_execution = false;
    let (port, _server) = start_test_server(config).await;

    let mut alice = TestClient::connect(port).await;
    assert!(!alice.join("R1", "Alice").await.settings.allow_execution);
    alice.send(run("R1")).await;
    assert!(matches!(
        alice.recv().await,
        ServerMessage::Rejected {
            action: Action::Run,
            code: ErrorCode::ExecutionDisabled,
            ..
        }
    ));
}

#[tokio::test]
async fn test_room_full_rejected() {
    let mut config = test_config();
    config.room_defaults.settings.max_participants = 1;
    let (port, _server) = start_test_server(config).await;

    let mut alice = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;

    let mut bob = TestClient::connect(port).await;
    bob.send(ClientMessage::Join {
        room_id: room("R1"),
        display_name: "Bob".into(),
        token: None,
    })
    .await;
    assert!(matches!(
        bob.recv().await,
        ServerMessage::Rejected {
            action: Action::Join,
            code: ErrorCode::RoomFull,
            ..
        }
    ));
    alice.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_login_required_room() {
    let mut config = ServerConfig {
        reconnect_window: Duration::ZERO,
        ..ServerConfig::default()
    };
    config.room_defaults.settings.require_login = true;
    let mut verifier = StaticTokenVerifier::new();
    verifier.insert(
        "tok-alice",
        Identity {
            user_id: "u1".into(),
            username: "alice".into(),
        },
    );
    let (port, _server) = start_server_with(config, Arc::new(EchoExecutor), Arc::new(verifier)).await;

    let mut guest = TestClient::connect(port).await;
    guest
        .send(ClientMessage::Join {
            room_id: room("R1"),
            display_name: "Guest".into(),
            token: Some("forged".into()),
        })
        .await;
    assert!(matches!(
        guest.recv().await,
        ServerMessage::Rejected {
            code: ErrorCode::LoginRequired,
            ..
        }
    ));

    let mut alice = TestClient::connect(port).await;
    let snapshot = alice.join_with_token("R1", "whatever", Some("tok-alice")).await;
    let me = &snapshot.participants[0];
    assert_eq!(me.display_name, "alice");
    assert!(me.verified);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    bob.join("R2", "Bob").await;

    alice.send(replace("R1", 0, "only in R1")).await;
    alice.recv().await;
    bob.assert_silent(Duration::from_millis(150)).await;

    let mut carol = TestClient::connect(port).await;
    assert_eq!(carol.join("R2", "Carol").await.buffer, DEFAULT_BUFFER);
}

#[tokio::test]
async fn test_binary_frames_answered_in_binary() {
    let (port, _server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    alice.format = WireFormat::Binary;

    alice
        .send(ClientMessage::Join {
            room_id: room("R1"),
            display_name: "Alice".into(),
            token: None,
        })
        .await;
    let (format, message) = alice.recv_frame().await;
    assert_eq!(format, WireFormat::Binary);
    assert!(matches!(message, ServerMessage::Snapshot(_)));

    alice.send(replace("R1", 0, "bin")).await;
    assert_eq!(
        alice.recv_frame().await,
        (WireFormat::Binary, ServerMessage::EditAck { revision: 1 })
    );

    // Switching back to text switches the replies too.
    alice.format = WireFormat::Json;
    alice.send(ClientMessage::Ping).await;
    assert_eq!(alice.recv_frame().await, (WireFormat::Json, ServerMessage::Pong));
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (port, server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;

    alice.send_raw(Message::Text("{not json".into())).await;
    assert!(matches!(
        alice.recv().await,
        ServerMessage::Rejected {
            action: Action::Decode,
            code: ErrorCode::Malformed,
            ..
        }
    ));

    alice.send(ClientMessage::Ping).await;
    assert_eq!(alice.recv().await, ServerMessage::Pong);
    assert_eq!(server.stats().await.rejected_frames, 1);
}

#[tokio::test]
async fn test_overflowing_delta_rejected_and_room_survives() {
    let (port, server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    alice.join("R1", "Alice").await;
    bob.join("R1", "Bob").await;
    alice
        .recv_matching(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;
    alice.send(replace("R1", 0, "ab")).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 1 });
    bob.recv().await;

    // Retain(usize::MAX) + Delete(3) wraps to a base length of 2 unless checked.
    let mut op = TextOperation::new();
    op.retain(7).delete(3);
    let WireFrame::Text(json) = delta("R1", 1, op).encode(WireFormat::Json).unwrap() else {
        panic!("expected a text frame");
    };
    let json = json.replace(r#"{"retain":7}"#, &format!(r#"{{"retain":{}}}"#, usize::MAX));
    alice.send_raw(Message::Text(json.into())).await;
    assert!(matches!(
        alice.recv().await,
        ServerMessage::Rejected {
            action: Action::Decode,
            code: ErrorCode::Malformed,
            ..
        }
    ));
    bob.assert_silent(Duration::from_millis(100)).await;

    // The connection, membership and edit path are intact.
    let mut append = TextOperation::new();
    append.retain(2).insert("!");
    alice.send(delta("R1", 1, append)).await;
    assert_eq!(alice.recv().await, ServerMessage::EditAck { revision: 2 });
    assert!(matches!(bob.recv().await, ServerMessage::EditApplied { revision: 2, .. }));
    assert_eq!(
        server.gateway().presence().participant_count(&room("R1")).await,
        2
    );
}

#[tokio::test]
async fn test_switching_rooms_leaves_previous() {
    let (port, server) = start_test_server(test_config()).await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    bob.join("R1", "Bob").await;
    alice.join("R1", "Alice").await;
    bob.recv_matching(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;

    alice.join("R2", "Alice").await;
    let ServerMessage::ParticipantLeft { participants, .. } = bob.recv().await else {
        panic!("expected ParticipantLeft");
    };
    assert_eq!(participants.len(), 1);
    assert_eq!(
        server.gateway().presence().participant_count(&room("R2")).await,
        1
    );
}
