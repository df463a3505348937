use chrono::{DateTime, Utc};
use parlor_core::ids::{MessageId, RoomId, UserId};
use parlor_core::records::MessageRecord;
use rusqlite::params;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_timestamp, get, parse_timestamp, query_all, query_opt};

const MESSAGE_COLUMNS: &str = "id, room_id, user_id, message, created_at";

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let created_at: String = get(row, 4, "messages", "created_at")?;
    Ok(MessageRecord {
        id: MessageId::new(get(row, 0, "messages", "id")?),
        room_id: RoomId::new(get(row, 1, "messages", "room_id")?),
        user_id: UserId::new(get(row, 2, "messages", "user_id")?),
        text: get(row, 3, "messages", "message")?,
        created_at: parse_timestamp(&created_at, "messages", "created_at")?,
    })
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, text), fields(room_id = %room_id, user_id = %user_id))]
    pub fn create(
        &self,
        room_id: RoomId,
        user_id: UserId,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<MessageRecord, StoreError> {
        let stamp = format_timestamp(&created_at);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (room_id, user_id, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![room_id.get(), user_id.get(), text, stamp],
            )?;
            Ok(MessageRecord {
                id: MessageId::new(conn.last_insert_rowid()),
                room_id,
                user_id,
                text: text.to_string(),
                created_at: parse_timestamp(&stamp, "messages", "created_at")?,
            })
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_opt(
                conn,
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id.get()],
                message_from_row,
            )
        })
    }

    /// Replace the text of a message and return the new snapshot.
    #[instrument(skip(self, text), fields(message_id = %id))]
    pub fn update_text(&self, id: MessageId, text: &str) -> Result<MessageRecord, StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET message = ?1 WHERE id = ?2",
                params![text, id.get()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            query_opt(
                conn,
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id.get()],
                message_from_row,
            )?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
        })
    }

    /// The last `limit` messages of a room, oldest first.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn recent(&self, room_id: RoomId, limit: u32) -> Result<Vec<MessageRecord>, StoreError> {
        let mut messages = self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ?1 \
                     ORDER BY id DESC LIMIT ?2"
                ),
                params![room_id.get(), limit],
                message_from_row,
            )
        })?;
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomRepo;
    use crate::users::UserRepo;
    use chrono::TimeZone;
    use parlor_core::records::RoomType;

    fn setup() -> (MessageRepo, RoomId, UserId) {
        let db = Database::in_memory().unwrap();
        let user = UserRepo::new(db.clone()).create("A", "a", "pw").unwrap().id;
        let room = RoomRepo::new(db.clone())
            .create_with_member("lobby", RoomType::Chat, user)
            .unwrap()
            .id;
        (MessageRepo::new(db), room, user)
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn create_then_get_matches() {
        let (repo, room, user) = setup();
        let created = repo.create(room, user, "hello", at(1)).unwrap();
        assert_eq!(repo.get(created.id).unwrap().unwrap(), created);
        assert_eq!(created.created_at, at(1));
    }

    #[test]
    fn created_at_is_truncated_to_seconds() {
        let (repo, room, user) = setup();
        let now = Utc::now();
        let created = repo.create(room, user, "hello", now).unwrap();
        assert_eq!(created.created_at.timestamp(), now.timestamp());
        assert_eq!(created.created_at.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn update_text_returns_new_snapshot() {
        let (repo, room, user) = setup();
        let created = repo.create(room, user, "helo", at(1)).unwrap();
        let edited = repo.update_text(created.id, "hello").unwrap();
        assert_eq!(edited.text, "hello");
        assert_eq!(edited.id, created.id);
        assert_eq!(edited.created_at, created.created_at);
        assert_eq!(created.text, "helo");
    }

    #[test]
    fn update_missing_is_not_found() {
        let (repo, _, _) = setup();
        assert!(matches!(
            repo.update_text(MessageId::new(5), "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let (repo, room, user) = setup();
        for i in 0..5 {
            repo.create(room, user, &format!("m{i}"), at(i)).unwrap();
        }
        let recent = repo.recent(room, 3).unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }
}
