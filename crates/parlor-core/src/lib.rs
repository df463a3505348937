pub mod errors;
pub mod ids;
pub mod protocol;
pub mod records;
pub mod security;

pub use errors::{ErrorCode, ProtocolError};
pub use ids::{ContactId, MessageId, RoomId, SessionId, UserId};
pub use protocol::{Command, CommandEnvelope, ServerMessage};
