use parlor_core::ids::{ContactId, UserId};
use parlor_core::records::ContactRecord;
use rusqlite::params;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, query_all, query_opt};

const CONTACT_COLUMNS: &str = "id, user1_id, user2_id, enabled";

fn contact_from_row(row: &rusqlite::Row<'_>) -> Result<ContactRecord, StoreError> {
    Ok(ContactRecord {
        id: ContactId::new(get(row, 0, "contacts", "id")?),
        user1_id: UserId::new(get(row, 1, "contacts", "user1_id")?),
        user2_id: UserId::new(get(row, 2, "contacts", "user2_id")?),
        enabled: get(row, 3, "contacts", "enabled")?,
    })
}

fn find_pair(
    conn: &rusqlite::Connection,
    a: UserId,
    b: UserId,
) -> Result<Option<ContactRecord>, StoreError> {
    query_opt(
        conn,
        &format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE (user1_id = ?1 AND user2_id = ?2) OR (user1_id = ?2 AND user2_id = ?1) \
             ORDER BY id LIMIT 1"
        ),
        params![a.get(), b.get()],
        contact_from_row,
    )
}

/// An enabled contact plus whether this call created or re-enabled it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactActivation {
    pub contact: ContactRecord,
    /// False when the pair already had an enabled contact.
    pub activated: bool,
}

pub struct ContactRepo {
    db: Database,
}

impl ContactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The contact between two users, regardless of who added whom.
    #[instrument(skip(self))]
    pub fn find(&self, a: UserId, b: UserId) -> Result<Option<ContactRecord>, StoreError> {
        self.db.with_conn(|conn| find_pair(conn, a, b))
    }

    /// Find the pair's contact, re-enabling it, or create an enabled one.
    /// Runs under a single connection lock, so when both sides race exactly
    /// one of them sees `activated == true`.
    #[instrument(skip(self))]
    pub fn find_or_create(&self, owner: UserId, other: UserId) -> Result<ContactActivation, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(existing) = find_pair(conn, owner, other)? {
                let activated = !existing.enabled;
                if activated {
                    conn.execute("UPDATE contacts SET enabled = 1 WHERE id = ?1", [existing.id.get()])?;
                }
                return Ok(ContactActivation {
                    contact: ContactRecord { enabled: true, ..existing },
                    activated,
                });
            }

            conn.execute(
                "INSERT INTO contacts (user1_id, user2_id, enabled) VALUES (?1, ?2, 1)",
                params![owner.get(), other.get()],
            )?;
            Ok(ContactActivation {
                contact: ContactRecord {
                    id: ContactId::new(conn.last_insert_rowid()),
                    user1_id: owner,
                    user2_id: other,
                    enabled: true,
                },
                activated: true,
            })
        })
    }

    #[instrument(skip(self))]
    pub fn set_enabled(&self, id: ContactId, enabled: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE contacts SET enabled = ?1 WHERE id = ?2",
                params![enabled, id.get()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("contact {id}")));
            }
            Ok(())
        })
    }

    /// Every contact the user is part of, enabled or not.
    pub fn for_user(&self, user_id: UserId) -> Result<Vec<ContactRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts \
                     WHERE user1_id = ?1 OR user2_id = ?1 ORDER BY id"
                ),
                [user_id.get()],
                contact_from_row,
            )
        })
    }
}
