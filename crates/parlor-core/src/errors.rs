use serde::{Serialize, Serializer};
use serde_json::Value;

/// Numeric error codes reported to clients in `error` frames.
/// Grouped the same way the client treats them: protocol, auth, validation, domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Protocol
    Parse = 1,
    UnknownCommand = 2,

    // Auth
    AuthNeed = 3,
    AuthFailed = 4,
    AlreadyAuthenticated = 5,

    // Validation / domain
    UserNotInRoom = 6,
    MessageEmpty = 7,
    MessageNotFound = 8,
    CantEditMessage = 9,
    RoomIdRequired = 10,
    AlreadyInRoom = 11,
    RoomNotFound = 12,
    RoomNameRequired = 13,
    UserNotFound = 14,
    ContactExists = 15,
    ContactNotExists = 16,

    // Server
    Internal = 17,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Human-readable text sent alongside the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Parse => "Parse error",
            Self::UnknownCommand => "Unknown command",
            Self::AuthNeed => "Authentication need",
            Self::AuthFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::UserNotInRoom => "User not in room",
            Self::MessageEmpty => "Message empty",
            Self::MessageNotFound => "Message not found",
            Self::CantEditMessage => "Can't edit message",
            Self::RoomIdRequired => "Room id required",
            Self::AlreadyInRoom => "Already in room",
            Self::RoomNotFound => "Room not found",
            Self::RoomNameRequired => "Room name required",
            Self::UserNotFound => "User not found",
            Self::ContactExists => "Contact exists",
            Self::ContactNotExists => "Contact not exists",
            Self::Internal => "Internal error",
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(self) -> &'static str {
        match self {
            Self::Parse | Self::UnknownCommand => "protocol",
            Self::AuthNeed | Self::AuthFailed | Self::AlreadyAuthenticated => "auth",
            Self::MessageEmpty | Self::RoomIdRequired | Self::RoomNameRequired => "validation",
            Self::Internal => "internal",
            _ => "domain",
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// A frame that could not be turned into a command.
/// Carries the client's `cmd_id` when one could be recovered so the error can be correlated.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {detail}")]
    Malformed { cmd_id: Value, detail: String },

    #[error("unknown command: {name}")]
    UnknownCommand { cmd_id: Value, name: String },
}

impl ProtocolError {
    pub fn cmd_id(&self) -> &Value {
        match self {
            Self::Malformed { cmd_id, .. } | Self::UnknownCommand { cmd_id, .. } => cmd_id,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Malformed { .. } => ErrorCode::Parse,
            Self::UnknownCommand { .. } => ErrorCode::UnknownCommand,
        }
    }
}
