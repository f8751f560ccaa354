//! Canonical state of one collaborative room.
//!
//! A `Room` is only ever touched through [`crate::session::SessionStore`],
//! which hands it out behind the room's mutex. Everything in here is
//! synchronous: no method awaits, so a mutation never yields while it holds
//! the room.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::auth::Identity;
use crate::broadcast::{Audience, BroadcastGroup, DeliveryReceiver};
use crate::protocol::{
    ConnectionId, ExecutionView, Language, ParticipantView, RequestId, RoomId, RoomSettings,
    RoomSnapshot, RunRecord, ServerMessage,
};
use crate::reconcile::EditHistory;

/// Buffer used for rooms that have never been edited.
pub const DEFAULT_BUFFER: &str = "// Start coding...\nconsole.log(\"Hello, CodeCollab!\");";

/// Values applied when a room is created lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDefaults {
    pub buffer: String,
    pub language: Language,
    pub settings: RoomSettings,
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER.to_owned(),
            language: Language::JavaScript,
            settings: RoomSettings::default(),
        }
    }
}

/// A connected member of a room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub identity: Option<Identity>,
    pub joined_at_ms: u64,
    pub(crate) typing_until: Option<Instant>,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, display_name: String, identity: Option<Identity>) -> Self {
        Self {
            connection_id,
            display_name,
            identity,
            joined_at_ms: unix_millis(),
            typing_until: None,
        }
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing_until.is_some_and(|until| until > now)
    }

    pub fn view(&self, now: Instant) -> ParticipantView {
        ParticipantView {
            connection_id: self.connection_id,
            display_name: self.display_name.clone(),
            joined_at_ms: self.joined_at_ms,
            typing: self.is_typing(now),
            verified: self.identity.is_some(),
        }
    }
}

/// Execution slot of a room. At most one run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running {
        request_id: RequestId,
        requested_by: ConnectionId,
        started_at: Instant,
    },
}

impl ExecutionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ExecutionState::Idle)
    }

    pub fn view(&self) -> ExecutionView {
        match self {
            ExecutionState::Idle => ExecutionView::Idle,
            ExecutionState::Running {
                request_id,
                requested_by,
                ..
            } => ExecutionView::Running {
                request_id: *request_id,
                requested_by: *requested_by,
            },
        }
    }
}

/// A disconnect whose "left" notice is held back for a reconnect window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingDeparture {
    pub connection_id: ConnectionId,
    pub token: u64,
}

/// Eviction bookkeeping. `epoch` invalidates timers armed earlier.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EvictionState {
    pub scheduled: bool,
    pub epoch: u64,
}

pub struct Room {
    pub(crate) id: RoomId,
    pub(crate) buffer: String,
    pub(crate) language: Language,
    pub(crate) revision: u64,
    pub(crate) participants: Vec<Participant>,
    pub(crate) execution: ExecutionState,
    pub(crate) last_run: Option<RunRecord>,
    pub(crate) settings: RoomSettings,
    pub(crate) history: EditHistory,
    pub(crate) pending_departures: HashMap<String, PendingDeparture>,
    pub(crate) departure_seq: u64,
    pub(crate) fanout: BroadcastGroup,
    pub(crate) eviction: EvictionState,
    pub(crate) evicted: bool,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        buffer: String,
        language: Language,
        revision: u64,
        settings: RoomSettings,
        history_limit: usize,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            id,
            buffer,
            language,
            revision,
            participants: Vec::new(),
            execution: ExecutionState::Idle,
            last_run: None,
            settings: settings.normalized(),
            history: EditHistory::new(history_limit),
            pending_departures: HashMap::new(),
            departure_seq: 0,
            fanout: BroadcastGroup::new(broadcast_capacity),
            eviction: EvictionState::default(),
            evicted: false,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.last_run.as_ref()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, connection_id: ConnectionId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    pub(crate) fn participant_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
    }

    pub fn is_member(&self, connection_id: ConnectionId) -> bool {
        self.participant(connection_id).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.settings.max_participants
    }

    /// Empty and not running anything.
    pub fn is_evictable(&self) -> bool {
        self.participants.is_empty() && self.execution.is_idle()
    }

    pub fn fanout(&self) -> &BroadcastGroup {
        &self.fanout
    }

    pub(crate) fn subscribe(&self) -> DeliveryReceiver {
        self.fanout.subscribe()
    }

    pub(crate) fn publish(&self, audience: Audience, message: ServerMessage) -> usize {
        self.fanout.publish(audience, message)
    }

    /// Advance the revision for an accepted mutation.
    pub(crate) fn commit_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    pub fn participant_views(&self, now: Instant) -> Vec<ParticipantView> {
        self.participants.iter().map(|p| p.view(now)).collect()
    }

    pub fn snapshot(&self, you: ConnectionId, now: Instant) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            you,
            buffer: self.buffer.clone(),
            language: self.language,
            revision: self.revision,
            participants: self.participant_views(now),
            execution: self.execution.view(),
            last_run: self.last_run.clone(),
            settings: self.settings,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("revision", &self.revision)
            .field("buffer_len", &self.buffer.len())
            .field("participants", &self.participants.len())
            .field("execution", &self.execution)
            .field("evicted", &self.evicted)
            .finish()
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
