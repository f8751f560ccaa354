//! Room membership and typing awareness.
//!
//! ```text
//! join ──► verify token (no lock held)
//!            │
//!            ▼
//!      room lock: admit, publish ParticipantJoined, subscribe, snapshot
//!
//! disconnect ──► room lock: remove, park "pending departure"
//!                  │
//!                  ├─ same display name joins within the window
//!                  │     └─► ParticipantReconnected
//!                  └─ window elapses
//!                        └─► ParticipantLeft
//! ```
//!
//! The joiner subscribes to the room channel after its own join event is
//! published and inside the same critical section as its snapshot, so it
//! sees exactly the events that come after the snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::auth::{Identity, TokenVerifier};
use crate::broadcast::{Audience, DeliveryReceiver};
use crate::error::RoomError;
use crate::protocol::{ConnectionId, RoomId, RoomSnapshot, ServerMessage};
use crate::room::{Participant, PendingDeparture, Room, RoomDefaults};
use crate::session::SessionStore;

/// Longest display name kept, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Name given to joiners who do not provide one.
pub const GUEST_NAME: &str = "Guest";

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Applied to rooms created by a join.
    pub defaults: RoomDefaults,
    /// How long a typing hint stays visible without a refresh.
    pub typing_ttl: Duration,
    /// How long a dropped connection's "left" notice is held back.
    /// Zero announces departures immediately.
    pub reconnect_window: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            defaults: RoomDefaults::default(),
            typing_ttl: Duration::from_secs(3),
            reconnect_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequest {
    pub display_name: String,
    pub token: Option<String>,
}

/// Result of a successful join or resync.
#[derive(Debug)]
pub struct Joined {
    pub snapshot: RoomSnapshot,
    /// Subscribed at the moment the snapshot was taken.
    pub receiver: DeliveryReceiver,
    /// The join continued a connection that dropped moments ago.
    pub reconnected: bool,
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: SessionStore,
    verifier: Arc<dyn TokenVerifier>,
    config: Arc<PresenceConfig>,
}

impl PresenceTracker {
    pub fn new(store: SessionStore, verifier: Arc<dyn TokenVerifier>, config: PresenceConfig) -> Self {
        Self {
            store,
            verifier,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Admit `connection_id` into the room, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
        request: JoinRequest,
    ) -> Result<Joined, RoomError> {
        let identity = match request.token.as_deref() {
            Some(token) => self.verifier.verify(token).await,
            None => None,
        };
        let display_name = match &identity {
            Some(identity) => sanitize_display_name(&identity.username),
            None => sanitize_display_name(&request.display_name),
        };

        self.store
            .mutate_or_create(room_id, &self.config.defaults, |room| {
                admit(room, connection_id, display_name, identity)
            })
            .await
    }

    /// Remove a participant and announce it at once. Leaving a room one is
    /// not in, or one that no longer exists, is not an error.
    pub async fn leave(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let result = self
            .store
            .mutate(room_id, |room| {
                let Some(participant) = remove_participant(room, connection_id) else {
                    return Ok(false);
                };
                announce_left(room, participant.connection_id);
                log::info!("{} left room {}", participant.display_name, room.id);
                Ok(true)
            })
            .await;
        result.unwrap_or(false)
    }

    /// Handle a dropped connection. The participant is removed now but the
    /// departure is only announced once the reconnect window has passed.
    pub async fn disconnect(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let window = self.config.reconnect_window;
        if window.is_zero() {
            return self.leave(room_id, connection_id).await;
        }

        let parked = self
            .store
            .mutate(room_id, |room| {
                let Some(participant) = remove_participant(room, connection_id) else {
                    return Ok(None);
                };
                room.departure_seq += 1;
                let token = room.departure_seq;
                let pending = PendingDeparture {
                    connection_id,
                    token,
                };
                if let Some(displaced) = room
                    .pending_departures
                    .insert(participant.display_name.clone(), pending)
                {
                    // Two drops under one name: only the newest can reconnect.
                    announce_left(room, displaced.connection_id);
                }
                log::info!(
                    "{} disconnected from room {}, holding departure for {window:?}",
                    participant.display_name,
                    room.id
                );
                Ok(Some((participant.display_name, token)))
            })
            .await;

        let Ok(Some((display_name, token))) = parked else {
            return false;
        };

        let tracker = self.clone();
        let room_id = room_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tracker.finish_departure(&room_id, &display_name, token).await;
        });
        true
    }

    async fn finish_departure(&self, room_id: &RoomId, display_name: &str, token: u64) {
        let _ = self
            .store
            .mutate(room_id, |room| {
                let current = room.pending_departures.get(display_name).copied();
                if let Some(pending) = current.filter(|p| p.token == token) {
                    room.pending_departures.remove(display_name);
                    announce_left(room, pending.connection_id);
                    log::debug!("Departure of {display_name} from {} confirmed", room.id);
                }
                Ok(())
            })
            .await;
    }

    /// Set or clear the typing hint. A non-member is ignored.
    pub async fn set_typing(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
        is_typing: bool,
    ) -> Result<(), RoomError> {
        let ttl = self.config.typing_ttl;
        let arm_expiry = self
            .store
            .mutate(room_id, |room| {
                let now = Instant::now();
                let Some(participant) = room.participant_mut(connection_id) else {
                    return Ok(None);
                };
                let was_typing = participant.is_typing(now);
                participant.typing_until = is_typing.then(|| now + ttl);

                log::trace!("{connection_id} typing={is_typing} in {}", room.id);
                if was_typing != is_typing {
                    room.publish(
                        Audience::Except(connection_id),
                        ServerMessage::TypingChanged {
                            connection_id,
                            is_typing,
                        },
                    );
                }
                Ok((is_typing && !was_typing).then(|| now + ttl))
            })
            .await?;

        if let Some(deadline) = arm_expiry {
            let tracker = self.clone();
            let room_id = room_id.clone();
            tokio::spawn(async move {
                tracker.expire_typing(room_id, connection_id, deadline).await;
            });
        }
        Ok(())
    }

    /// Clear a typing hint once it runs out, following refreshes.
    async fn expire_typing(&self, room_id: RoomId, connection_id: ConnectionId, mut deadline: Instant) {
        loop {
            tokio::time::sleep_until(deadline).await;
            let next = self
                .store
                .mutate(&room_id, |room| {
                    let now = Instant::now();
                    let Some(participant) = room.participant_mut(connection_id) else {
                        return Ok(None);
                    };
                    match participant.typing_until {
                        Some(until) if until > now => Ok(Some(until)),
                        Some(_) => {
                            participant.typing_until = None;
                            room.publish(
                                Audience::Except(connection_id),
                                ServerMessage::TypingChanged {
                                    connection_id,
                                    is_typing: false,
                                },
                            );
                            Ok(None)
                        }
                        None => Ok(None),
                    }
                })
                .await;
            match next {
                Ok(Some(until)) => deadline = until,
                _ => return,
            }
        }
    }

    /// Fresh snapshot plus a fresh subscription, taken together.
    pub async fn resync(&self, room_id: &RoomId, connection_id: ConnectionId) -> Result<Joined, RoomError> {
        self.store
            .mutate(room_id, |room| {
                if !room.is_member(connection_id) {
                    return Err(RoomError::NotInRoom(room.id.clone()));
                }
                Ok(Joined {
                    snapshot: room.snapshot(connection_id, Instant::now()),
                    receiver: room.subscribe(),
                    reconnected: false,
                })
            })
            .await
    }

    pub async fn snapshot(&self, room_id: &RoomId, connection_id: ConnectionId) -> Result<RoomSnapshot, RoomError> {
        self.store
            .read(room_id, |room| room.snapshot(connection_id, Instant::now()))
            .await
    }

    pub async fn participant_count(&self, room_id: &RoomId) -> usize {
        self.store
            .read(room_id, |room| room.participants().len())
            .await
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("config", &self.config)
            .finish()
    }
}

fn admit(
    room: &mut Room,
    connection_id: ConnectionId,
    display_name: String,
    identity: Option<Identity>,
) -> Result<Joined, RoomError> {
    let now = Instant::now();

    if room.is_member(connection_id) {
        return Ok(Joined {
            snapshot: room.snapshot(connection_id, now),
            receiver: room.subscribe(),
            reconnected: false,
        });
    }
    if room.settings.requires_identity() && identity.is_none() {
        return Err(RoomError::LoginRequired(room.id.clone()));
    }
    if room.is_full() {
        return Err(RoomError::RoomFull {
            room_id: room.id.clone(),
            max: room.settings.max_participants,
        });
    }

    let participant = Participant::new(connection_id, display_name, identity);
    let view = participant.view(now);
    let previous = room.pending_departures.remove(&participant.display_name);
    log::info!(
        "{} {} room {} ({} present)",
        participant.display_name,
        if previous.is_some() { "rejoined" } else { "joined" },
        room.id,
        room.participants.len() + 1
    );
    room.participants.push(participant);

    let participants = room.participant_views(now);
    let event = match previous {
        Some(previous) => ServerMessage::ParticipantReconnected {
            previous: previous.connection_id,
            participant: view,
            participants,
        },
        None => ServerMessage::ParticipantJoined {
            participant: view,
            participants,
        },
    };
    room.publish(Audience::Except(connection_id), event);

    Ok(Joined {
        snapshot: room.snapshot(connection_id, now),
        receiver: room.subscribe(),
        reconnected: previous.is_some(),
    })
}

fn remove_participant(room: &mut Room, connection_id: ConnectionId) -> Option<Participant> {
    let index = room
        .participants
        .iter()
        .position(|p| p.connection_id == connection_id)?;
    Some(room.participants.remove(index))
}

fn announce_left(room: &Room, connection_id: ConnectionId) {
    let participants = room.participant_views(Instant::now());
    room.publish(
        Audience::All,
        ServerMessage::ParticipantLeft {
            connection_id,
            participants,
        },
    );
}

/// Trim, drop control characters and cap the length. Empty becomes
/// [`GUEST_NAME`].
pub fn sanitize_display_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        GUEST_NAME.to_owned()
    } else {
        cleaned.to_owned()
    }
}
