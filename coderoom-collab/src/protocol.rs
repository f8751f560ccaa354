//! Wire protocol for collaborative code rooms.
//!
//! Every request and event is a serde enum. Two encodings share the same
//! message types:
//!
//! ```text
//! WebSocket Text frame   ── JSON    (browser clients)
//! WebSocket Binary frame ── bincode (native clients, standard config)
//! ```
//!
//! The server answers in the encoding of the connection's most recent
//! inbound frame. Revision-bearing events (`EditAck`, `EditApplied`,
//! `LanguageChanged`) are delivered per room in acceptance order; a client
//! drops any such event at or below the revision it already holds.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ot::TextOperation;

/// Longest accepted room identifier, in characters.
pub const MAX_ROOM_ID_LEN: usize = 128;

// ─── Identifiers ─────────────────────────────────────────────────────

/// Opaque room identifier chosen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier. Surrounding whitespace is trimmed.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, ProtocolError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidRoomId("room id is empty".into()));
        }
        if trimmed.chars().count() > MAX_ROOM_ID_LEN {
            return Err(ProtocolError::InvalidRoomId(format!(
                "room id exceeds {MAX_ROOM_ID_LEN} characters"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ProtocolError::InvalidRoomId("room id contains control characters".into()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one physical connection, assigned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Languages & settings ────────────────────────────────────────────

/// Languages a room buffer can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Java,
    C,
    Cpp,
    CSharp,
    Go,
    Rust,
    Php,
    Ruby,
    Swift,
    Kotlin,
    Html,
    Css,
}

impl Language {
    pub const ALL: [Language; 15] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Python,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::CSharp,
        Language::Go,
        Language::Rust,
        Language::Php,
        Language::Ruby,
        Language::Swift,
        Language::Kotlin,
        Language::Html,
        Language::Css,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Swift => "swift",
            Language::Kotlin => "kotlin",
            Language::Html => "html",
            Language::Css => "css",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::JavaScript
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == wanted)
            .ok_or_else(|| ProtocolError::UnknownLanguage(s.to_owned()))
    }
}

/// Per-room policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub allow_execution: bool,
    pub allow_guests: bool,
    pub require_login: bool,
    pub max_participants: usize,
}

impl RoomSettings {
    pub const MIN_PARTICIPANTS: usize = 1;
    pub const MAX_PARTICIPANTS: usize = 50;

    /// Joiners must present a verified identity.
    pub fn requires_identity(&self) -> bool {
        self.require_login || !self.allow_guests
    }

    /// Clamp `max_participants` into the supported range.
    pub fn normalized(mut self) -> Self {
        self.max_participants = self
            .max_participants
            .clamp(Self::MIN_PARTICIPANTS, Self::MAX_PARTICIPANTS);
        self
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            allow_execution: true,
            allow_guests: true,
            require_login: false,
            max_participants: 10,
        }
    }
}

// ─── Views ───────────────────────────────────────────────────────────

/// A participant as other clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub connection_id: ConnectionId,
    pub display_name: String,
    /// Milliseconds since the Unix epoch.
    pub joined_at_ms: u64,
    pub typing: bool,
    /// Joined with a verified identity rather than as a guest.
    pub verified: bool,
}

/// Execution state as exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionView {
    Idle,
    Running {
        request_id: RequestId,
        requested_by: ConnectionId,
    },
}

/// Why a run produced no program output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    ExecutionTimeout,
    ExecutorUnavailable { detail: String },
    UnsupportedLanguage { language: Language },
}

impl RunFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            RunFailure::ExecutionTimeout => ErrorCode::ExecutionTimeout,
            RunFailure::ExecutorUnavailable { .. } | RunFailure::UnsupportedLanguage { .. } => {
                ErrorCode::ExecutorUnavailable
            }
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::ExecutionTimeout => write!(f, "execution timed out"),
            RunFailure::ExecutorUnavailable { detail } => write!(f, "executor unavailable: {detail}"),
            RunFailure::UnsupportedLanguage { language } => {
                write!(f, "no sandbox is configured for {language}")
            }
        }
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
        success: bool,
    },
    Failed {
        reason: RunFailure,
    },
}

/// The most recent finished run of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub request_id: RequestId,
    pub requested_by: ConnectionId,
    pub language: Language,
    pub outcome: RunOutcome,
}

/// Everything a client needs to initialize or resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    /// The receiving connection.
    pub you: ConnectionId,
    pub buffer: String,
    pub language: Language,
    pub revision: u64,
    pub participants: Vec<ParticipantView>,
    pub execution: ExecutionView,
    pub last_run: Option<RunRecord>,
    pub settings: RoomSettings,
}

// ─── Edits ───────────────────────────────────────────────────────────

/// The body of an edit submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditPayload {
    /// Replace the whole buffer. Only accepted against the current revision.
    Replace { text: String },
    /// Structured change, transformed against concurrent history.
    Delta { operation: TextOperation },
}

// ─── Messages ────────────────────────────────────────────────────────

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
        display_name: String,
        token: Option<String>,
    },
    Leave {
        room_id: RoomId,
    },
    EditSubmit {
        room_id: RoomId,
        base_revision: u64,
        payload: EditPayload,
        client_timestamp: Option<u64>,
    },
    LanguageChange {
        room_id: RoomId,
        language: Language,
    },
    RunRequest {
        room_id: RoomId,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    Resync {
        room_id: RoomId,
    },
    Ping,
}

impl ClientMessage {
    pub fn action(&self) -> Action {
        match self {
            ClientMessage::Join { .. } => Action::Join,
            ClientMessage::Leave { .. } => Action::Leave,
            ClientMessage::EditSubmit { .. } => Action::Edit,
            ClientMessage::LanguageChange { .. } => Action::LanguageChange,
            ClientMessage::RunRequest { .. } => Action::Run,
            ClientMessage::Typing { .. } => Action::Typing,
            ClientMessage::Resync { .. } => Action::Resync,
            ClientMessage::Ping => Action::Ping,
        }
    }

    pub fn encode(&self, format: WireFormat) -> Result<WireFrame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode(frame: &WireFrame) -> Result<Self, ProtocolError> {
        decode_frame(frame)
    }
}

/// Which request a rejection answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Join,
    Leave,
    Edit,
    LanguageChange,
    Run,
    Typing,
    Resync,
    Ping,
    /// The frame could not be decoded at all.
    Decode,
}

/// Machine-readable rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    LoginRequired,
    StaleRevision,
    AlreadyRunning,
    ExecutionDisabled,
    ExecutionTimeout,
    ExecutorUnavailable,
    NotInRoom,
    InvalidOperation,
    Malformed,
}

/// Server → client events and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(RoomSnapshot),
    EditAck {
        revision: u64,
    },
    EditApplied {
        revision: u64,
        payload: EditPayload,
        origin: ConnectionId,
    },
    LanguageChanged {
        revision: u64,
        language: Language,
        changed_by: ConnectionId,
    },
    ParticipantJoined {
        participant: ParticipantView,
        participants: Vec<ParticipantView>,
    },
    ParticipantReconnected {
        previous: ConnectionId,
        participant: ParticipantView,
        participants: Vec<ParticipantView>,
    },
    ParticipantLeft {
        connection_id: ConnectionId,
        participants: Vec<ParticipantView>,
    },
    TypingChanged {
        connection_id: ConnectionId,
        is_typing: bool,
    },
    RunAccepted {
        request_id: RequestId,
    },
    RunStarted {
        request_id: RequestId,
        requested_by: ConnectionId,
        language: Language,
    },
    RunCompleted {
        request_id: RequestId,
        stdout: String,
        stderr: String,
        exit_code: i32,
        success: bool,
    },
    RunFailed {
        request_id: RequestId,
        reason: RunFailure,
    },
    Rejected {
        action: Action,
        code: ErrorCode,
        message: String,
        /// Set when the client should resync to this revision.
        current_revision: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    /// Revision carried by ordered buffer/language events.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ServerMessage::Snapshot(snapshot) => Some(snapshot.revision),
            ServerMessage::EditAck { revision }
            | ServerMessage::EditApplied { revision, .. }
            | ServerMessage::LanguageChanged { revision, .. } => Some(*revision),
            _ => None,
        }
    }

    pub fn encode(&self, format: WireFormat) -> Result<WireFrame, ProtocolError> {
        encode_frame(self, format)
    }

    pub fn decode(frame: &WireFrame) -> Result<Self, ProtocolError> {
        decode_frame(frame)
    }
}

// ─── Framing ─────────────────────────────────────────────────────────

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    Binary,
}

/// A transport-neutral frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn format(&self) -> WireFormat {
        match self {
            WireFrame::Text(_) => WireFormat::Json,
            WireFrame::Binary(_) => WireFormat::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode_frame<T: Serialize>(value: &T, format: WireFormat) -> Result<WireFrame, ProtocolError> {
    match format {
        WireFormat::Json => serde_json::to_string(value)
            .map(WireFrame::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        WireFormat::Binary => bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(WireFrame::Binary)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
    }
}

fn decode_frame<T: DeserializeOwned>(frame: &WireFrame) -> Result<T, ProtocolError> {
    match frame {
        WireFrame::Text(text) => {
            serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
        }
        WireFrame::Binary(bytes) => {
            let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
            Ok(value)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),
}
