//! Persisted entities as read back from the store. Treated as immutable snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{ContactId, MessageId, RoomId, UserId};

#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub login: String,
    pub passwd: String,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("login", &self.login)
            .finish()
    }
}

/// Group rooms are created by users; private rooms back a contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoomType {
    Chat,
    User,
}

impl RoomType {
    pub fn code(self) -> i64 {
        match self {
            Self::Chat => 1,
            Self::User => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Chat),
            2 => Some(Self::User),
            _ => None,
        }
    }
}

impl Serialize for RoomType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for RoomType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown room type: {code}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub room_type: RoomType,
    pub enabled: bool,
    /// Set for private rooms only.
    pub contact_id: Option<ContactId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub enabled: bool,
}

impl ContactRecord {
    /// The other side of the relationship, as seen by `viewer`.
    pub fn counterpart(&self, viewer: UserId) -> UserId {
        if self.user1_id == viewer {
            self.user2_id
        } else {
            self.user1_id
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.user1_id == user || self.user2_id == user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_type_codes() {
        assert_eq!(RoomType::Chat.code(), 1);
        assert_eq!(RoomType::User.code(), 2);
        assert_eq!(RoomType::from_code(2), Some(RoomType::User));
        assert_eq!(RoomType::from_code(9), None);
    }

    #[test]
    fn room_type_serde() {
        assert_eq!(serde_json::to_value(RoomType::User).unwrap(), 2);
        let parsed: RoomType = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, RoomType::Chat);
        assert!(serde_json::from_str::<RoomType>("3").is_err());
    }

    #[test]
    fn contact_counterpart_either_side() {
        let contact = ContactRecord {
            id: ContactId::new(1),
            user1_id: UserId::new(10),
            user2_id: UserId::new(20),
            enabled: true,
        };
        assert_eq!(contact.counterpart(UserId::new(10)), UserId::new(20));
        assert_eq!(contact.counterpart(UserId::new(20)), UserId::new(10));
        assert!(contact.involves(UserId::new(20)));
        assert!(!contact.involves(UserId::new(30)));
    }

    #[test]
    fn user_debug_hides_password() {
        let user = UserRecord {
            id: UserId::new(1),
            name: "Ann".into(),
            login: "ann".into(),
            passwd: "secret-pw".into(),
        };
        assert!(!format!("{user:?}").contains("secret-pw"));
    }
}
