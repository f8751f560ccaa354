//! Server-side edit reconciliation.
//!
//! The room's revision counter orders every accepted mutation. A delta made
//! against an older revision is rebased over the history it missed:
//!
//! ```text
//! base 5 ──► rev 6 (accepted op A) ──► rev 7 (incoming B')
//!            B' = transform(A, B).1    A wins insert ties
//! ```
//!
//! Whole-buffer replacements carry no positional information, so they are
//! only accepted against the current revision and act as a barrier in
//! history: no delta can be rebased across one.

use std::collections::VecDeque;

use crate::broadcast::Audience;
use crate::error::RoomError;
use crate::ot::TextOperation;
use crate::protocol::{ConnectionId, EditPayload, Language, RoomId, ServerMessage};
use crate::room::Room;
use crate::session::SessionStore;

/// What an accepted revision did to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEntry {
    Text(TextOperation),
    Replace,
    /// Language change. Leaves the text alone.
    Identity,
}

/// Bounded log of accepted mutations, keyed by the revision they produced.
#[derive(Debug, Clone)]
pub struct EditHistory {
    entries: VecDeque<(u64, HistoryEntry)>,
    limit: usize,
}

impl EditHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    pub fn push(&mut self, revision: u64, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back((revision, entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_revision(&self) -> Option<u64> {
        self.entries.front().map(|(revision, _)| *revision)
    }

    /// Entries that produced revisions `base + 1 ..= current`, or `None` if
    /// any of them has been dropped.
    fn since(&self, base: u64, current: u64) -> Option<impl Iterator<Item = &HistoryEntry>> {
        let wanted = (current - base) as usize;
        let start = self.entries.len().checked_sub(wanted)?;
        let (first, _) = self.entries.get(start)?;
        if *first != base + 1 {
            return None;
        }
        Some(self.entries.range(start..).map(|(_, entry)| entry))
    }
}

/// One edit submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOperation {
    pub room_id: RoomId,
    pub origin: ConnectionId,
    pub base_revision: u64,
    pub payload: EditPayload,
    /// Client clock, informational only.
    pub client_timestamp: Option<u64>,
}

/// An accepted edit as it was applied, after any rebasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub revision: u64,
    pub payload: EditPayload,
}

#[derive(Debug, Clone)]
pub struct EditReconciler {
    store: SessionStore,
    max_buffer_bytes: Option<usize>,
}

impl EditReconciler {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            max_buffer_bytes: None,
        }
    }

    /// Reject edits that would grow the buffer beyond `limit` bytes.
    pub fn with_max_buffer_bytes(mut self, limit: usize) -> Self {
        self.max_buffer_bytes = Some(limit);
        self
    }

    /// Apply an edit under the room lock.
    ///
    /// On success the originator gets `EditAck` and every other participant
    /// gets `EditApplied`, both through the room channel so they are ordered
    /// with all other revisions.
    pub async fn apply_edit(&self, op: EditOperation) -> Result<AppliedEdit, RoomError> {
        let max = self.max_buffer_bytes;
        self.store
            .mutate(&op.room_id, |room| {
                let applied = apply_to_room(room, &op, max)?;
                room.publish(
                    Audience::Except(op.origin),
                    ServerMessage::EditApplied {
                        revision: applied.revision,
                        payload: applied.payload.clone(),
                        origin: op.origin,
                    },
                );
                room.publish(
                    Audience::Only(op.origin),
                    ServerMessage::EditAck {
                        revision: applied.revision,
                    },
                );
                Ok(applied)
            })
            .await
    }

    /// Switch the room language. A change to the current language is a
    /// no-op and keeps the revision.
    pub async fn change_language(
        &self,
        room_id: &RoomId,
        origin: ConnectionId,
        language: Language,
    ) -> Result<u64, RoomError> {
        self.store
            .mutate(room_id, |room| {
                if !room.is_member(origin) {
                    return Err(RoomError::NotInRoom(room.id.clone()));
                }
                if room.language == language {
                    return Ok(room.revision);
                }

                room.language = language;
                let revision = room.commit_revision();
                room.history.push(revision, HistoryEntry::Identity);
                room.publish(
                    Audience::All,
                    ServerMessage::LanguageChanged {
                        revision,
                        language,
                        changed_by: origin,
                    },
                );
                log::info!("Room {} switched to {language} at revision {revision}", room.id);
                Ok(revision)
            })
            .await
    }
}

/// Validate, rebase and apply one edit to `room`. Does not publish.
pub(crate) fn apply_to_room(
    room: &mut Room,
    op: &EditOperation,
    max_buffer_bytes: Option<usize>,
) -> Result<AppliedEdit, RoomError> {
    if !room.is_member(op.origin) {
        return Err(RoomError::NotInRoom(room.id.clone()));
    }

    let current = room.revision;
    let stale = RoomError::StaleRevision {
        base: op.base_revision,
        current,
    };
    if op.base_revision > current {
        return Err(stale);
    }

    let (buffer, entry, payload) = match &op.payload {
        EditPayload::Replace { text } => {
            if op.base_revision != current {
                log::warn!(
                    "Stale replace in {} (base {}, current {current})",
                    room.id,
                    op.base_revision
                );
                return Err(stale);
            }
            (text.clone(), HistoryEntry::Replace, op.payload.clone())
        }
        EditPayload::Delta { operation } => {
            let rebased = if op.base_revision == current {
                operation.clone()
            } else {
                let Some(missed) = room.history.since(op.base_revision, current) else {
                    log::warn!(
                        "Delta in {} based on revision {} is outside history",
                        room.id,
                        op.base_revision
                    );
                    return Err(stale);
                };
                rebase(operation.clone(), missed).ok_or(stale)??
            };
            let buffer = rebased.apply(&room.buffer)?;
            (
                buffer,
                HistoryEntry::Text(rebased.clone()),
                EditPayload::Delta { operation: rebased },
            )
        }
    };

    if let Some(limit) = max_buffer_bytes {
        if buffer.len() > limit {
            return Err(RoomError::BufferTooLarge {
                size: buffer.len(),
                limit,
            });
        }
    }

    room.buffer = buffer;
    let revision = room.commit_revision();
    room.history.push(revision, entry);
    log::debug!(
        "Room {} accepted edit from {} at revision {revision} (base {}, client ts {:?})",
        room.id,
        op.origin,
        op.base_revision,
        op.client_timestamp
    );
    Ok(AppliedEdit { revision, payload })
}

/// Transform `incoming` over every missed entry. `None` if a replace is in
/// the way.
fn rebase<'a>(
    mut incoming: TextOperation,
    missed: impl Iterator<Item = &'a HistoryEntry>,
) -> Option<Result<TextOperation, RoomError>> {
    for entry in missed {
        match entry {
            HistoryEntry::Identity => {}
            HistoryEntry::Replace => return None,
            HistoryEntry::Text(accepted) => match TextOperation::transform(accepted, &incoming) {
                Ok((_, transformed)) => incoming = transformed,
                Err(e) => return Some(Err(e.into())),
            },
        }
    }
    Some(Ok(incoming))
}
