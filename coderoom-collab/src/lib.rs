//! # coderoom-collab — Real-time collaborative code rooms
//!
//! Participants join a named room over WebSocket, edit one shared buffer,
//! see who is present and typing, switch the room language, and run the
//! buffer in an external sandbox with the result broadcast to everyone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌────────────────┐
//! │ Browser     │ ◄─────────────────► │ CodeRoomServer │
//! │ (per user)  │  JSON or bincode    │ (central)      │
//! └─────────────┘                     └───────┬────────┘
//!                                             │
//!                                    ┌────────┴────────┐
//!                                    │ ConnectionGateway│
//!                                    └────────┬────────┘
//!                   ┌─────────────────────────┼──────────────────────┐
//!                   ▼                         ▼                      ▼
//!           PresenceTracker            EditReconciler        ExecutionDispatcher
//!                   └─────────────┬───────────┘                      │
//!                                 ▼                                  ▼
//!                           SessionStore ── RoomArchive        SandboxExecutor
//!                                 │
//!                         Room ── BroadcastGroup (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages, identifiers, JSON and bincode framing
//! - [`ot`] — Text operations with transform for concurrent edits
//! - [`room`] — Authoritative room state
//! - [`session`] — Room registry, lazy creation and idle eviction
//! - [`reconcile`] — Revision-checked edits and language changes
//! - [`presence`] — Joins, departures, reconnects and typing hints
//! - [`execution`] — Single-flight code runs with timeouts
//! - [`sandbox`] — External executor bridge
//! - [`auth`] — Token verification for login-only rooms
//! - [`broadcast`] — Per-room ordered fan-out
//! - [`storage`] — RocksDB archive for evicted rooms
//! - [`gateway`] / [`server`] — Connection routing and the WebSocket server

pub mod protocol;
pub mod ot;
pub mod broadcast;
pub mod error;
pub mod room;
pub mod auth;
pub mod session;
pub mod reconcile;
pub mod presence;
pub mod sandbox;
pub mod execution;
pub mod storage;
pub mod gateway;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    Action, ClientMessage, ConnectionId, EditPayload, ErrorCode, ExecutionView, Language,
    ParticipantView, ProtocolError, RequestId, RoomId, RoomSettings, RoomSnapshot, RunFailure,
    RunOutcome, RunRecord, ServerMessage, WireFormat, WireFrame,
};
pub use ot::{OtError, TextOperation};
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Delivery, DeliveryReceiver};
pub use error::RoomError;
pub use room::{ExecutionState, Participant, Room, RoomDefaults, DEFAULT_BUFFER};
pub use auth::{Identity, RejectAllVerifier, StaticTokenVerifier, TokenVerifier};
pub use session::{RoomHandle, SessionConfig, SessionStats, SessionStore};
pub use reconcile::{AppliedEdit, EditHistory, EditOperation, EditReconciler};
pub use presence::{JoinRequest, Joined, PresenceConfig, PresenceTracker};
pub use sandbox::{ExecutionOutput, ExecutorError, ProcessExecutor, SandboxConfig, SandboxExecutor};
pub use execution::{ExecutionConfig, ExecutionDispatcher, ExecutionRequest, ExecutionStatus};
pub use storage::{ArchiveConfig, ArchiveError, ArchiveMetadata, ArchivedRoom, RoomArchive};
pub use gateway::{ConnectionGateway, ConnectionState};
pub use server::{CodeRoomServer, ServerConfig, ServerStats};
