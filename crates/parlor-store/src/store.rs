//! The storage surface the gateway talks to.
//!
//! Repositories are synchronous; `SqliteChatStore` moves each call onto the
//! blocking pool so connection tasks never stall the runtime on SQLite.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use parlor_core::ids::{ContactId, MessageId, RoomId, UserId};
use parlor_core::records::{ContactRecord, MessageRecord, RoomRecord, RoomType, UserRecord};

use crate::contacts::{ContactActivation, ContactRepo};
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::rooms::RoomRepo;
use crate::users::UserRepo;

#[derive(Clone, Debug, PartialEq)]
pub struct RoomHistory {
    pub room: RoomRecord,
    /// Oldest first.
    pub messages: Vec<MessageRecord>,
}

/// What a user sees right after logging in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserSnapshot {
    pub rooms: Vec<RoomHistory>,
    /// Co-members, message authors and contact counterparts. Never the user.
    pub users: Vec<UserRecord>,
    pub contacts: Vec<ContactRecord>,
}

impl UserSnapshot {
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|history| history.room.id).collect()
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_user_by_credentials(
        &self,
        login: &str,
        passwd: &str,
    ) -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    async fn create_user(
        &self,
        name: &str,
        login: &str,
        passwd: &str,
    ) -> Result<UserRecord, StoreError>;

    async fn search_users_by_name(
        &self,
        query: &str,
        exclude: Option<UserId>,
        limit: u32,
    ) -> Result<Vec<UserRecord>, StoreError>;

    async fn load_user_snapshot(
        &self,
        user_id: UserId,
        history_limit: u32,
    ) -> Result<UserSnapshot, StoreError>;

    async fn create_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        text: &str,
    ) -> Result<MessageRecord, StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError>;

    /// Persist new text for a message; returns the updated snapshot.
    async fn save_message(&self, id: MessageId, text: &str) -> Result<MessageRecord, StoreError>;

    async fn find_room(&self, id: RoomId) -> Result<Option<RoomRecord>, StoreError>;

    async fn room_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Room plus the creator's membership, atomically.
    async fn create_room(
        &self,
        name: &str,
        room_type: RoomType,
        creator: UserId,
    ) -> Result<RoomRecord, StoreError>;

    async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError>;

    async fn add_user_to_room(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError>;

    async fn remove_user_from_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, StoreError>;

    async fn set_room_enabled(&self, room_id: RoomId, enabled: bool) -> Result<(), StoreError>;

    async fn find_contact(&self, a: UserId, b: UserId) -> Result<Option<ContactRecord>, StoreError>;

    /// Enable the pair's contact, creating it if needed. `activated` is false
    /// when it was already enabled.
    async fn find_or_create_contact(
        &self,
        owner: UserId,
        other: UserId,
    ) -> Result<ContactActivation, StoreError>;

    async fn set_contact_enabled(&self, id: ContactId, enabled: bool) -> Result<(), StoreError>;

    async fn find_private_room(&self, contact_id: ContactId)
        -> Result<Option<RoomRecord>, StoreError>;

    async fn find_or_create_private_room(
        &self,
        contact_id: ContactId,
    ) -> Result<RoomRecord, StoreError>;
}

/// `ChatStore` over a local SQLite database.
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Database,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

fn snapshot(db: Database, user_id: UserId, history_limit: u32) -> Result<UserSnapshot, StoreError> {
    let rooms_repo = RoomRepo::new(db.clone());
    let messages_repo = MessageRepo::new(db.clone());

    let mut related = BTreeSet::new();
    let mut rooms = Vec::new();
    for room in rooms_repo.enabled_for_user(user_id)? {
        related.extend(rooms_repo.member_ids(room.id)?);
        let messages = messages_repo.recent(room.id, history_limit)?;
        related.extend(messages.iter().map(|m| m.user_id));
        rooms.push(RoomHistory { room, messages });
    }

    let contacts = ContactRepo::new(db.clone()).for_user(user_id)?;
    related.extend(contacts.iter().map(|c| c.counterpart(user_id)));
    related.remove(&user_id);

    let ids: Vec<UserId> = related.into_iter().collect();
    let users = UserRepo::new(db).get_many(&ids)?;

    Ok(UserSnapshot { rooms, users, contacts })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn find_user_by_credentials(
        &self,
        login: &str,
        passwd: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let (login, passwd) = (login.to_owned(), passwd.to_owned());
        self.blocking(move |db| UserRepo::new(db).find_by_credentials(&login, &passwd))
            .await
    }

    async fn find_user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.blocking(move |db| UserRepo::new(db).get(id)).await
    }

    async fn create_user(
        &self,
        name: &str,
        login: &str,
        passwd: &str,
    ) -> Result<UserRecord, StoreError> {
        let (name, login, passwd) = (name.to_owned(), login.to_owned(), passwd.to_owned());
        self.blocking(move |db| UserRepo::new(db).create(&name, &login, &passwd))
            .await
    }

    async fn search_users_by_name(
        &self,
        query: &str,
        exclude: Option<UserId>,
        limit: u32,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let query = query.to_owned();
        self.blocking(move |db| UserRepo::new(db).search(&query, exclude, limit))
            .await
    }

    async fn load_user_snapshot(
        &self,
        user_id: UserId,
        history_limit: u32,
    ) -> Result<UserSnapshot, StoreError> {
        self.blocking(move |db| snapshot(db, user_id, history_limit))
            .await
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        text: &str,
    ) -> Result<MessageRecord, StoreError> {
        let text = text.to_owned();
        self.blocking(move |db| MessageRepo::new(db).create(room_id, user_id, &text, Utc::now()))
            .await
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).get(id)).await
    }

    async fn save_message(&self, id: MessageId, text: &str) -> Result<MessageRecord, StoreError> {
        let text = text.to_owned();
        self.blocking(move |db| MessageRepo::new(db).update_text(id, &text))
            .await
    }

    async fn find_room(&self, id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).get(id)).await
    }

    async fn room_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).recent(room_id, limit))
            .await
    }

    async fn create_room(
        &self,
        name: &str,
        room_type: RoomType,
        creator: UserId,
    ) -> Result<RoomRecord, StoreError> {
        let name = name.to_owned();
        self.blocking(move |db| RoomRepo::new(db).create_with_member(&name, room_type, creator))
            .await
    }

    async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).is_member(user_id, room_id))
            .await
    }

    async fn add_user_to_room(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).add_member(user_id, room_id))
            .await
    }

    async fn remove_user_from_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).remove_member(user_id, room_id))
            .await
    }

    async fn set_room_enabled(&self, room_id: RoomId, enabled: bool) -> Result<(), StoreError> {
        self.blocking(move |db| RoomRepo::new(db).set_enabled(room_id, enabled))
            .await
    }

    async fn find_contact(&self, a: UserId, b: UserId) -> Result<Option<ContactRecord>, StoreError> {
        self.blocking(move |db| ContactRepo::new(db).find(a, b)).await
    }

    async fn find_or_create_contact(
        &self,
        owner: UserId,
        other: UserId,
    ) -> Result<ContactActivation, StoreError> {
        self.blocking(move |db| ContactRepo::new(db).find_or_create(owner, other))
            .await
    }

    async fn set_contact_enabled(&self, id: ContactId, enabled: bool) -> Result<(), StoreError> {
        self.blocking(move |db| ContactRepo::new(db).set_enabled(id, enabled))
            .await
    }

    async fn find_private_room(
        &self,
        contact_id: ContactId,
    ) -> Result<Option<RoomRecord>, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).find_by_contact(contact_id))
            .await
    }

    async fn find_or_create_private_room(
        &self,
        contact_id: ContactId,
    ) -> Result<RoomRecord, StoreError> {
        self.blocking(move |db| RoomRepo::new(db).find_or_create_private(contact_id))
            .await
    }
}
