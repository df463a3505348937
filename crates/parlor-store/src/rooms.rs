use parlor_core::ids::{ContactId, RoomId, UserId};
use parlor_core::records::{RoomRecord, RoomType};
use rusqlite::params;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_room_type, query_all, query_opt};

const ROOM_COLUMNS: &str = "r.id, r.name, r.room_type, r.enabled, r.contact_id";

fn room_from_row(row: &rusqlite::Row<'_>) -> Result<RoomRecord, StoreError> {
    let contact_id: Option<i64> = get(row, 4, "rooms", "contact_id")?;
    Ok(RoomRecord {
        id: RoomId::new(get(row, 0, "rooms", "id")?),
        name: get(row, 1, "rooms", "name")?,
        room_type: parse_room_type(get(row, 2, "rooms", "room_type")?, "rooms", "room_type")?,
        enabled: get(row, 3, "rooms", "enabled")?,
        contact_id: contact_id.map(ContactId::new),
    })
}

fn private_room(
    conn: &rusqlite::Connection,
    contact_id: ContactId,
) -> Result<Option<RoomRecord>, StoreError> {
    query_opt(
        conn,
        &format!("SELECT {ROOM_COLUMNS} FROM rooms r WHERE r.contact_id = ?1"),
        [contact_id.get()],
        room_from_row,
    )
}

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(room_id = %id))]
    pub fn get(&self, id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_opt(
                conn,
                &format!("SELECT {ROOM_COLUMNS} FROM rooms r WHERE r.id = ?1"),
                [id.get()],
                room_from_row,
            )
        })
    }

    /// Create a room and make `creator` its first member in one transaction.
    #[instrument(skip(self), fields(creator = %creator))]
    pub fn create_with_member(
        &self,
        name: &str,
        room_type: RoomType,
        creator: UserId,
    ) -> Result<RoomRecord, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO rooms (name, room_type, enabled) VALUES (?1, ?2, 1)",
                params![name, room_type.code()],
            )?;
            let id = RoomId::new(tx.last_insert_rowid());
            tx.execute(
                "INSERT INTO users_rooms (user_id, room_id) VALUES (?1, ?2)",
                params![creator.get(), id.get()],
            )?;
            tx.commit()?;

            Ok(RoomRecord {
                id,
                name: name.to_string(),
                room_type,
                enabled: true,
                contact_id: None,
            })
        })
    }

    /// Returns false if the membership already existed.
    #[instrument(skip(self))]
    pub fn add_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users_rooms (user_id, room_id) VALUES (?1, ?2)",
                params![user_id.get(), room_id.get()],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Returns false if there was no membership to remove.
    #[instrument(skip(self))]
    pub fn remove_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM users_rooms WHERE user_id = ?1 AND room_id = ?2",
                params![user_id.get(), room_id.get()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = query_opt(
                conn,
                "SELECT 1 FROM users_rooms WHERE user_id = ?1 AND room_id = ?2",
                params![user_id.get(), room_id.get()],
                |_| Ok(()),
            )?;
            Ok(found.is_some())
        })
    }

    /// Enabled rooms the user belongs to, by id.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn enabled_for_user(&self, user_id: UserId) -> Result<Vec<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {ROOM_COLUMNS} FROM rooms r \
                     JOIN users_rooms ur ON ur.room_id = r.id \
                     WHERE ur.user_id = ?1 AND r.enabled = 1 \
                     ORDER BY r.id"
                ),
                [user_id.get()],
                room_from_row,
            )
        })
    }

    pub fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                "SELECT user_id FROM users_rooms WHERE room_id = ?1 ORDER BY user_id",
                [room_id.get()],
                |row| Ok(UserId::new(get(row, 0, "users_rooms", "user_id")?)),
            )
        })
    }

    #[instrument(skip(self), fields(contact_id = %contact_id))]
    pub fn find_by_contact(&self, contact_id: ContactId) -> Result<Option<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| private_room(conn, contact_id))
    }

    /// The private room backing a contact, created or re-enabled as needed.
    #[instrument(skip(self), fields(contact_id = %contact_id))]
    pub fn find_or_create_private(&self, contact_id: ContactId) -> Result<RoomRecord, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(room) = private_room(conn, contact_id)? {
                if !room.enabled {
                    conn.execute("UPDATE rooms SET enabled = 1 WHERE id = ?1", [room.id.get()])?;
                }
                return Ok(RoomRecord { enabled: true, ..room });
            }

            let name = contact_id.to_string();
            conn.execute(
                "INSERT INTO rooms (name, room_type, enabled, contact_id) VALUES (?1, ?2, 1, ?3)",
                params![name, RoomType::User.code(), contact_id.get()],
            )?;
            Ok(RoomRecord {
                id: RoomId::new(conn.last_insert_rowid()),
                name,
                room_type: RoomType::User,
                enabled: true,
                contact_id: Some(contact_id),
            })
        })
    }

    #[instrument(skip(self))]
    pub fn set_enabled(&self, room_id: RoomId, enabled: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE rooms SET enabled = ?1 WHERE id = ?2",
                params![enabled, room_id.get()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("room {room_id}")));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    fn setup() -> (Database, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let a = users.create("A", "a", "pw").unwrap().id;
        let b = users.create("B", "b", "pw").unwrap().id;
        (db, a, b)
    }

    fn contact(db: &Database, a: UserId, b: UserId) -> ContactId {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (user1_id, user2_id) VALUES (?1, ?2)",
                params![a.get(), b.get()],
            )?;
            Ok(ContactId::new(conn.last_insert_rowid()))
        })
        .unwrap()
    }

    #[test]
    fn create_with_member_is_visible() {
        let (db, a, _) = setup();
        let repo = RoomRepo::new(db);
        let room = repo.create_with_member("lobby", RoomType::Chat, a).unwrap();
        assert_eq!(repo.get(room.id).unwrap().unwrap(), room);
        assert!(repo.is_member(a, room.id).unwrap());
        assert_eq!(repo.member_ids(room.id).unwrap(), vec![a]);
    }

    #[test]
    fn create_with_unknown_creator_rolls_back() {
        let (db, _, _) = setup();
        let repo = RoomRepo::new(db.clone());
        assert!(repo.create_with_member("ghost", RoomType::Chat, UserId::new(999)).is_err());
        let rooms: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rooms, 0);
    }

    #[test]
    fn add_and_remove_member_report_changes() {
        let (db, a, b) = setup();
        let repo = RoomRepo::new(db);
        let room = repo.create_with_member("lobby", RoomType::Chat, a).unwrap();
        assert!(repo.add_member(b, room.id).unwrap());
        assert!(!repo.add_member(b, room.id).unwrap());
        assert!(repo.remove_member(b, room.id).unwrap());
        assert!(!repo.remove_member(b, room.id).unwrap());
        assert!(!repo.is_member(b, room.id).unwrap());
    }

    #[test]
    fn enabled_for_user_skips_disabled() {
        let (db, a, _) = setup();
        let repo = RoomRepo::new(db);
        let one = repo.create_with_member("one", RoomType::Chat, a).unwrap();
        let two = repo.create_with_member("two", RoomType::Chat, a).unwrap();
        repo.set_enabled(two.id, false).unwrap();
        let rooms = repo.enabled_for_user(a).unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, one.id);
    }

    #[test]
    fn private_room_is_keyed_by_contact() {
        let (db, a, b) = setup();
        let contact_id = contact(&db, a, b);
        let repo = RoomRepo::new(db);

        let room = repo.find_or_create_private(contact_id).unwrap();
        assert_eq!(room.room_type, RoomType::User);
        assert_eq!(room.name, contact_id.to_string());
        assert_eq!(room.contact_id, Some(contact_id));

        repo.set_enabled(room.id, false).unwrap();
        let again = repo.find_or_create_private(contact_id).unwrap();
        assert_eq!(again.id, room.id);
        assert!(again.enabled);
        assert!(repo.get(room.id).unwrap().unwrap().enabled);
    }

    #[test]
    fn set_enabled_missing_room() {
        let (db, _, _) = setup();
        let repo = RoomRepo::new(db);
        assert!(matches!(repo.set_enabled(RoomId::new(77), true), Err(StoreError::NotFound(_))));
    }
}
