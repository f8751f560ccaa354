use crate::ot::OtError;
use crate::protocol::{Action, ErrorCode, RequestId, RoomId, ServerMessage};

/// Recoverable failures of a room operation.
///
/// None of these poison the room; the client is told why and, where a
/// revision is involved, which revision to resync to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("Room {room_id} is full ({max} participants)")]
    RoomFull { room_id: RoomId, max: usize },
    #[error("Login required to join {0}")]
    LoginRequired(RoomId),
    #[error("Edit based on revision {base} is stale, room is at {current}")]
    StaleRevision { base: u64, current: u64 },
    #[error("A run is already in progress ({0})")]
    AlreadyRunning(RequestId),
    #[error("Code execution is disabled in {0}")]
    ExecutionDisabled(RoomId),
    #[error("Connection is not a participant of {0}")]
    NotInRoom(RoomId),
    #[error("Invalid operation: {source}")]
    InvalidOperation {
        #[from]
        source: OtError,
    },
    #[error("Buffer would grow to {size} bytes, limit is {limit}")]
    BufferTooLarge { size: usize, limit: usize },
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            RoomError::RoomFull { .. } => ErrorCode::RoomFull,
            RoomError::LoginRequired(_) => ErrorCode::LoginRequired,
            RoomError::StaleRevision { .. } => ErrorCode::StaleRevision,
            RoomError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            RoomError::ExecutionDisabled(_) => ErrorCode::ExecutionDisabled,
            RoomError::NotInRoom(_) => ErrorCode::NotInRoom,
            RoomError::InvalidOperation { .. } | RoomError::BufferTooLarge { .. } => {
                ErrorCode::InvalidOperation
            }
        }
    }

    /// Revision the client should resync to, when the failure is about one.
    pub fn current_revision(&self) -> Option<u64> {
        match self {
            RoomError::StaleRevision { current, .. } => Some(*current),
            _ => None,
        }
    }

    pub fn to_rejection(&self, action: Action) -> ServerMessage {
        ServerMessage::Rejected {
            action,
            code: self.code(),
            message: self.to_string(),
            current_revision: self.current_revision(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_revision_rejection() {
        let err = RoomError::StaleRevision { base: 3, current: 7 };
        let ServerMessage::Rejected {
            action,
            code,
            current_revision,
            message,
        } = err.to_rejection(Action::Edit)
        else {
            panic!("expected rejection");
        };
        assert_eq!(action, Action::Edit);
        assert_eq!(code, ErrorCode::StaleRevision);
        assert_eq!(current_revision, Some(7));
        assert!(message.contains("revision 3"));
    }

    #[test]
    fn test_ot_errors_become_invalid_operation() {
        let err: RoomError = OtError::LengthMismatch { expected: 2, actual: 5 }.into();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);
        assert_eq!(err.current_revision(), None);
    }

    #[test]
    fn test_codes() {
        let room = RoomId::parse("R1").unwrap();
        assert_eq!(RoomError::RoomNotFound(room.clone()).code(), ErrorCode::RoomNotFound);
        assert_eq!(
            RoomError::RoomFull { room_id: room.clone(), max: 2 }.code(),
            ErrorCode::RoomFull
        );
        assert_eq!(RoomError::LoginRequired(room.clone()).code(), ErrorCode::LoginRequired);
        assert_eq!(RoomError::ExecutionDisabled(room).code(), ErrorCode::ExecutionDisabled);
        assert_eq!(
            RoomError::AlreadyRunning(RequestId::new()).code(),
            ErrorCode::AlreadyRunning
        );
    }
}
