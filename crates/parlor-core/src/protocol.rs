//! Wire protocol: inbound commands and the closed set of server frames.
//!
//! Every frame is a single JSON object. Inbound frames name their operation in
//! `command` and may carry a `cmd_id` that is echoed verbatim in the response.
//! Outbound frames are one of `system_message`, `message_info` or `error`.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::{ErrorCode, ProtocolError};
use crate::ids::{ContactId, MessageId, RoomId, UserId};
use crate::records::{ContactRecord, MessageRecord, RoomRecord, RoomType, UserRecord};

// ── Commands ──

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Auth {
        login: String,
        passwd: String,
    },
    AuthByKey {
        user_id: UserId,
        key: String,
    },
    MessageCreate {
        #[serde(default)]
        room_id: Option<RoomId>,
        #[serde(default, rename = "message")]
        text: String,
    },
    MessageEdit {
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default, rename = "message")]
        text: String,
    },
    RoomJoin {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    RoomLeave {
        #[serde(default)]
        room_id: Option<RoomId>,
    },
    RoomCreate {
        #[serde(default)]
        name: String,
    },
    ContactAdd {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    ContactRemove {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    UsersSearch {
        #[serde(default)]
        name: String,
    },
}

impl Command {
    pub const NAMES: &'static [&'static str] = &[
        "auth",
        "auth_by_key",
        "message_create",
        "message_edit",
        "room_join",
        "room_leave",
        "room_create",
        "contact_add",
        "contact_remove",
        "users_search",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::AuthByKey { .. } => "auth_by_key",
            Self::MessageCreate { .. } => "message_create",
            Self::MessageEdit { .. } => "message_edit",
            Self::RoomJoin { .. } => "room_join",
            Self::RoomLeave { .. } => "room_leave",
            Self::RoomCreate { .. } => "room_create",
            Self::ContactAdd { .. } => "contact_add",
            Self::ContactRemove { .. } => "contact_remove",
            Self::UsersSearch { .. } => "users_search",
        }
    }

    /// Only the login commands may run on an unauthenticated session.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Auth { .. } | Self::AuthByKey { .. })
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandEnvelope {
    /// Echoed verbatim; `Value::Null` when the client sent none.
    pub cmd_id: Value,
    pub command: Command,
}

/// Decode one text frame into a command envelope.
pub fn decode_frame(raw: &str) -> Result<CommandEnvelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed {
        cmd_id: Value::Null,
        detail: e.to_string(),
    })?;

    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::Malformed {
            cmd_id: Value::Null,
            detail: "frame is not a JSON object".into(),
        });
    };

    let cmd_id = fields.remove("cmd_id").unwrap_or(Value::Null);

    let name = match fields.get("command") {
        Some(Value::String(name)) => name.clone(),
        _ => {
            return Err(ProtocolError::Malformed {
                cmd_id,
                detail: "missing command".into(),
            })
        }
    };
    if !Command::NAMES.contains(&name.as_str()) {
        return Err(ProtocolError::UnknownCommand { cmd_id, name });
    }

    match serde_json::from_value(Value::Object(fields)) {
        Ok(command) => Ok(CommandEnvelope { cmd_id, command }),
        Err(e) => Err(ProtocolError::Malformed {
            cmd_id,
            detail: format!("{name}: {e}"),
        }),
    }
}

// ── Payload objects ──

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub id: UserId,
    pub login: String,
    pub name: String,
    pub online: bool,
}

impl UserData {
    pub fn new(user: &UserRecord, online: bool) -> Self {
        Self {
            id: user.id,
            login: user.login.clone(),
            name: user.name.clone(),
            online,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub message: String,
    /// Unix seconds.
    pub created_at: i64,
    pub created_at_str: String,
}

impl From<&MessageRecord> for MessageData {
    fn from(message: &MessageRecord) -> Self {
        Self {
            id: message.id,
            room_id: message.room_id,
            user_id: message.user_id,
            message: message.text.clone(),
            created_at: message.created_at.timestamp(),
            created_at_str: format_timestamp(&message.created_at),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomData {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub enabled: bool,
    pub messages: Vec<MessageData>,
}

impl RoomData {
    pub fn new(room: &RoomRecord, messages: &[MessageRecord]) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            room_type: room.room_type,
            enabled: room.enabled,
            messages: messages.iter().map(MessageData::from).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    pub id: ContactId,
    /// The counterpart, not the viewer.
    pub user_id: UserId,
    pub enabled: bool,
}

impl ContactData {
    pub fn for_viewer(contact: &ContactRecord, viewer: UserId) -> Self {
        Self {
            id: contact.id,
            user_id: contact.counterpart(viewer),
            enabled: contact.enabled,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Presence {
    pub user_id: UserId,
    pub user_name: String,
}

/// Everything a client needs right after logging in.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthSnapshot {
    pub user: UserData,
    pub rooms: Vec<RoomData>,
    pub users: Vec<UserData>,
    pub contacts: Vec<ContactData>,
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Server frames ──

/// Discriminant carried in `message_id` of `system_message` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemKind {
    AuthSuccess = 1,
    UserOnline = 2,
    UserOffline = 3,
    UserJoined = 4,
    CommandSuccess = 5,
    UserLeave = 6,
    MessageEdited = 7,
    AddedToRoom = 8,
    AddedContact = 9,
    RemovedContact = 10,
}

impl SystemKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn label(self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth success",
            Self::UserOnline => "user online",
            Self::UserOffline => "user offline",
            Self::UserJoined => "user joined",
            Self::CommandSuccess => "ok",
            Self::UserLeave => "user leave",
            Self::MessageEdited => "message edited",
            Self::AddedToRoom => "added to room",
            Self::AddedContact => "added_contact",
            Self::RemovedContact => "removed_contact",
        }
    }
}

/// Operation-specific fields of a `CommandSuccess` response.
#[derive(Clone, Debug, PartialEq)]
pub enum SuccessPayload {
    Empty,
    Message(MessageData),
    Room(RoomData),
    RoomLeft { room_id: RoomId },
    ContactAdded { contact_id: ContactId, room: RoomData, user: UserData },
    ContactRemoved { contact_id: ContactId, room_id: Option<RoomId> },
    Users(Vec<UserData>),
}

/// Every frame the server can send. Responses carry the caller's `cmd_id`; events do not.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    AuthSuccess { cmd_id: Value, snapshot: AuthSnapshot },
    CommandSuccess { cmd_id: Value, payload: SuccessPayload },
    Error { cmd_id: Value, code: ErrorCode },
    MessageInfo { message: MessageData },
    MessageEdited { message: MessageData },
    UserOnline(Presence),
    UserOffline(Presence),
    UserJoined { room_id: RoomId, presence: Presence },
    UserLeave { room_id: RoomId, presence: Presence },
    AddedToRoom { room: RoomData },
    AddedContact { contact_id: ContactId, user: UserData, room: RoomData },
    RemovedContact { contact_id: ContactId, user_id: UserId, room_id: Option<RoomId> },
}

impl ServerMessage {
    pub fn error(cmd_id: Value, code: ErrorCode) -> Self {
        Self::Error { cmd_id, code }
    }

    pub fn success(cmd_id: Value, payload: SuccessPayload) -> Self {
        Self::CommandSuccess { cmd_id, payload }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthSuccess { .. } => "auth_success",
            Self::CommandSuccess { .. } => "command_success",
            Self::Error { .. } => "error",
            Self::MessageInfo { .. } => "message_info",
            Self::MessageEdited { .. } => "message_edited",
            Self::UserOnline(_) => "user_online",
            Self::UserOffline(_) => "user_offline",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeave { .. } => "user_leave",
            Self::AddedToRoom { .. } => "added_to_room",
            Self::AddedContact { .. } => "added_contact",
            Self::RemovedContact { .. } => "removed_contact",
        }
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn system_header<M: SerializeMap>(map: &mut M, kind: SystemKind) -> Result<(), M::Error> {
    map.serialize_entry("command", "system_message")?;
    map.serialize_entry("message_id", &kind.code())
}

fn labelled<M: SerializeMap>(map: &mut M, kind: SystemKind) -> Result<(), M::Error> {
    system_header(map, kind)?;
    map.serialize_entry("message", kind.label())
}

fn presence_fields<M: SerializeMap>(map: &mut M, presence: &Presence) -> Result<(), M::Error> {
    map.serialize_entry("user_id", &presence.user_id)?;
    map.serialize_entry("user_name", &presence.user_name)
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::AuthSuccess { cmd_id, snapshot } => {
                map.serialize_entry("cmd_id", cmd_id)?;
                labelled(&mut map, SystemKind::AuthSuccess)?;
                map.serialize_entry("user", &snapshot.user)?;
                map.serialize_entry("rooms", &snapshot.rooms)?;
                map.serialize_entry("users", &snapshot.users)?;
                map.serialize_entry("contacts", &snapshot.contacts)?;
            }
            Self::CommandSuccess { cmd_id, payload } => {
                map.serialize_entry("cmd_id", cmd_id)?;
                labelled(&mut map, SystemKind::CommandSuccess)?;
                match payload {
                    SuccessPayload::Empty => {}
                    SuccessPayload::Message(message) => {
                        map.serialize_entry("data", message)?;
                    }
                    SuccessPayload::Room(room) => {
                        map.serialize_entry("room_id", &room.id)?;
                        map.serialize_entry("room", room)?;
                    }
                    SuccessPayload::RoomLeft { room_id } => {
                        map.serialize_entry("room_id", room_id)?;
                    }
                    SuccessPayload::ContactAdded { contact_id, room, user } => {
                        map.serialize_entry("contact_id", contact_id)?;
                        map.serialize_entry("room", room)?;
                        map.serialize_entry("user", user)?;
                    }
                    SuccessPayload::ContactRemoved { contact_id, room_id } => {
                        map.serialize_entry("contact_id", contact_id)?;
                        map.serialize_entry("room_id", room_id)?;
                    }
                    SuccessPayload::Users(users) => {
                        map.serialize_entry("users", users)?;
                    }
                }
            }
            Self::Error { cmd_id, code } => {
                map.serialize_entry("cmd_id", cmd_id)?;
                map.serialize_entry("command", "error")?;
                map.serialize_entry("error_code", code)?;
                map.serialize_entry("error_message", code.message())?;
            }
            Self::MessageInfo { message } => {
                map.serialize_entry("command", "message_info")?;
                map.serialize_entry("room_id", &message.room_id)?;
                map.serialize_entry("message", message)?;
            }
            Self::MessageEdited { message } => {
                system_header(&mut map, SystemKind::MessageEdited)?;
                map.serialize_entry("room_id", &message.room_id)?;
                map.serialize_entry("message", message)?;
            }
            Self::UserOnline(presence) => {
                labelled(&mut map, SystemKind::UserOnline)?;
                presence_fields(&mut map, presence)?;
            }
            Self::UserOffline(presence) => {
                labelled(&mut map, SystemKind::UserOffline)?;
                presence_fields(&mut map, presence)?;
            }
            Self::UserJoined { room_id, presence } => {
                labelled(&mut map, SystemKind::UserJoined)?;
                map.serialize_entry("room_id", room_id)?;
                presence_fields(&mut map, presence)?;
            }
            Self::UserLeave { room_id, presence } => {
                labelled(&mut map, SystemKind::UserLeave)?;
                map.serialize_entry("room_id", room_id)?;
                presence_fields(&mut map, presence)?;
            }
            Self::AddedToRoom { room } => {
                labelled(&mut map, SystemKind::AddedToRoom)?;
                map.serialize_entry("room", room)?;
            }
            Self::AddedContact { contact_id, user, room } => {
                labelled(&mut map, SystemKind::AddedContact)?;
                map.serialize_entry("contact_id", contact_id)?;
                map.serialize_entry("user", user)?;
                map.serialize_entry("room", room)?;
            }
            Self::RemovedContact { contact_id, user_id, room_id } => {
                labelled(&mut map, SystemKind::RemovedContact)?;
                map.serialize_entry("contact_id", contact_id)?;
                map.serialize_entry("user_id", user_id)?;
                map.serialize_entry("room_id", room_id)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn message_record() -> MessageRecord {
        MessageRecord {
            id: MessageId::new(5),
            room_id: RoomId::new(2),
            user_id: UserId::new(1),
            text: "hi".into(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        }
    }

    fn to_json(message: &ServerMessage) -> Value {
        serde_json::from_str(&message.to_frame().unwrap()).unwrap()
    }

    // ── decode_frame ──

    #[test]
    fn decodes_auth_with_cmd_id() {
        let env = decode_frame(r#"{"cmd_id": 3, "command": "auth", "login": "ann", "passwd": "pw"}"#).unwrap();
        assert_eq!(env.cmd_id, json!(3));
        assert_eq!(
            env.command,
            Command::Auth { login: "ann".into(), passwd: "pw".into() }
        );
    }

    #[test]
    fn missing_cmd_id_is_null() {
        let env = decode_frame(r#"{"command": "room_leave", "room_id": 4}"#).unwrap();
        assert_eq!(env.cmd_id, Value::Null);
        assert_eq!(env.command, Command::RoomLeave { room_id: Some(RoomId::new(4)) });
    }

    #[test]
    fn message_text_field_is_named_message() {
        let env = decode_frame(r#"{"command": "message_create", "room_id": 1, "message": "yo"}"#).unwrap();
        assert_eq!(
            env.command,
            Command::MessageCreate { room_id: Some(RoomId::new(1)), text: "yo".into() }
        );
    }

    #[test]
    fn missing_message_text_defaults_to_empty() {
        let env = decode_frame(r#"{"command": "message_create", "room_id": 1}"#).unwrap();
        assert!(matches!(env.command, Command::MessageCreate { ref text, .. } if text.is_empty()));
    }

    #[test]
    fn room_join_without_room_id() {
        let env = decode_frame(r#"{"command": "room_join"}"#).unwrap();
        assert_eq!(env.command, Command::RoomJoin { room_id: None });
        let env = decode_frame(r#"{"command": "room_join", "room_id": null}"#).unwrap();
        assert_eq!(env.command, Command::RoomJoin { room_id: None });
    }

    #[test]
    fn missing_ids_decode_as_none() {
        let cases = [
            (r#"{"command": "message_create", "message": "hi"}"#, Command::MessageCreate { room_id: None, text: "hi".into() }),
            (r#"{"command": "message_edit", "message": "x"}"#, Command::MessageEdit { message_id: None, text: "x".into() }),
            (r#"{"command": "room_leave"}"#, Command::RoomLeave { room_id: None }),
            (r#"{"command": "contact_add"}"#, Command::ContactAdd { user_id: None }),
            (r#"{"command": "contact_remove", "user_id": null}"#, Command::ContactRemove { user_id: None }),
        ];
        for (frame, expected) in cases {
            assert_eq!(decode_frame(frame).unwrap().command, expected, "{frame}");
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = decode_frame("{not json").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Parse);
        assert_eq!(err.cmd_id(), &Value::Null);
    }

    #[test]
    fn non_object_is_malformed() {
        let err = decode_frame("[1,2]").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Parse);
    }

    #[test]
    fn missing_command_keeps_cmd_id() {
        let err = decode_frame(r#"{"cmd_id": "abc"}"#).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Parse);
        assert_eq!(err.cmd_id(), &json!("abc"));
    }

    #[test]
    fn unknown_command() {
        let err = decode_frame(r#"{"cmd_id": 9, "command": "teleport"}"#).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::UnknownCommand);
        assert_eq!(err.cmd_id(), &json!(9));
    }

    #[test]
    fn wrong_field_type_is_malformed_with_cmd_id() {
        let err = decode_frame(r#"{"cmd_id": 2, "command": "room_leave", "room_id": "x"}"#).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Parse);
        assert_eq!(err.cmd_id(), &json!(2));
    }

    #[test]
    fn every_name_decodes_to_matching_variant() {
        let frames = [
            r#"{"command": "auth", "login": "a", "passwd": "b"}"#,
            r#"{"command": "auth_by_key", "user_id": 1, "key": "K"}"#,
            r#"{"command": "message_create", "room_id": 1, "message": "m"}"#,
            r#"{"command": "message_edit", "message_id": 1, "message": "m"}"#,
            r#"{"command": "room_join", "room_id": 1}"#,
            r#"{"command": "room_leave", "room_id": 1}"#,
            r#"{"command": "room_create", "name": "n"}"#,
            r#"{"command": "contact_add", "user_id": 1}"#,
            r#"{"command": "contact_remove", "user_id": 1}"#,
            r#"{"command": "users_search", "name": "n"}"#,
        ];
        for (frame, name) in frames.iter().zip(Command::NAMES) {
            let env = decode_frame(frame).unwrap();
            assert_eq!(env.command.name(), *name);
        }
    }

    #[test]
    fn only_login_commands_skip_auth() {
        assert!(!Command::Auth { login: "a".into(), passwd: "b".into() }.requires_auth());
        assert!(!Command::AuthByKey { user_id: UserId::new(1), key: "k".into() }.requires_auth());
        assert!(Command::UsersSearch { name: "x".into() }.requires_auth());
    }

    // ── payloads ──

    #[test]
    fn message_data_timestamps() {
        let data = MessageData::from(&message_record());
        assert_eq!(data.created_at, 1_709_993_107);
        assert_eq!(data.created_at_str, "2024-03-09 14:05:07");
        assert_eq!(data.message, "hi");
    }

    #[test]
    fn contact_data_shows_counterpart() {
        let contact = ContactRecord {
            id: ContactId::new(3),
            user1_id: UserId::new(1),
            user2_id: UserId::new(2),
            enabled: true,
        };
        assert_eq!(ContactData::for_viewer(&contact, UserId::new(2)).user_id, UserId::new(1));
    }

    #[test]
    fn room_data_type_field() {
        let room = RoomRecord {
            id: RoomId::new(7),
            name: "3".into(),
            room_type: RoomType::User,
            enabled: true,
            contact_id: Some(ContactId::new(3)),
        };
        let value = serde_json::to_value(RoomData::new(&room, &[])).unwrap();
        assert_eq!(value, json!({"id": 7, "name": "3", "type": 2, "enabled": true, "messages": []}));
    }

    // ── encoder ──

    #[test]
    fn error_frame_shape() {
        let value = to_json(&ServerMessage::error(json!(4), ErrorCode::AuthFailed));
        assert_eq!(
            value,
            json!({
                "cmd_id": 4,
                "command": "error",
                "error_code": 4,
                "error_message": "Authentication failed"
            })
        );
    }

    #[test]
    fn success_frame_always_has_cmd_id() {
        let value = to_json(&ServerMessage::success(Value::Null, SuccessPayload::Empty));
        assert_eq!(
            value,
            json!({"cmd_id": null, "command": "system_message", "message_id": 5, "message": "ok"})
        );
    }

    #[test]
    fn success_with_message_data() {
        let data = MessageData::from(&message_record());
        let value = to_json(&ServerMessage::success(json!(1), SuccessPayload::Message(data)));
        assert_eq!(value["data"]["id"], 5);
        assert_eq!(value["data"]["message"], "hi");
        assert_eq!(value["message_id"], 5);
    }

    #[test]
    fn message_info_has_no_cmd_id() {
        let data = MessageData::from(&message_record());
        let value = to_json(&ServerMessage::MessageInfo { message: data });
        assert_eq!(value["command"], "message_info");
        assert_eq!(value["room_id"], 2);
        assert_eq!(value["message"]["user_id"], 1);
        assert!(value.get("cmd_id").is_none());
    }

    #[test]
    fn message_edited_carries_object_in_message() {
        let data = MessageData::from(&message_record());
        let value = to_json(&ServerMessage::MessageEdited { message: data });
        assert_eq!(value["command"], "system_message");
        assert_eq!(value["message_id"], 7);
        assert_eq!(value["message"]["message"], "hi");
    }

    #[test]
    fn presence_events() {
        let presence = Presence { user_id: UserId::new(9), user_name: "Bo".into() };
        let online = to_json(&ServerMessage::UserOnline(presence.clone()));
        assert_eq!(
            online,
            json!({
                "command": "system_message",
                "message_id": 2,
                "message": "user online",
                "user_id": 9,
                "user_name": "Bo"
            })
        );
        let offline = to_json(&ServerMessage::UserOffline(presence.clone()));
        assert_eq!(offline["message_id"], 3);
        assert_eq!(offline["message"], "user offline");

        let joined = to_json(&ServerMessage::UserJoined { room_id: RoomId::new(4), presence });
        assert_eq!(joined["message_id"], 4);
        assert_eq!(joined["room_id"], 4);
    }

    #[test]
    fn removed_contact_event() {
        let value = to_json(&ServerMessage::RemovedContact {
            contact_id: ContactId::new(2),
            user_id: UserId::new(1),
            room_id: Some(RoomId::new(8)),
        });
        assert_eq!(value["message_id"], 10);
        assert_eq!(value["message"], "removed_contact");
        assert_eq!(value["contact_id"], 2);
        assert_eq!(value["room_id"], 8);
    }

    #[test]
    fn kind_names() {
        assert_eq!(ServerMessage::error(Value::Null, ErrorCode::Parse).kind(), "error");
        let presence = Presence { user_id: UserId::new(1), user_name: "a".into() };
        assert_eq!(ServerMessage::UserOffline(presence).kind(), "user_offline");
    }
}
