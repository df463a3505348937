use parlor_core::ids::UserId;
use parlor_core::records::UserRecord;
use rusqlite::params;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{escape_like, get, query_all, query_opt};

const USER_COLUMNS: &str = "id, name, login, passwd";

pub(crate) fn user_from_row(row: &rusqlite::Row<'_>) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        id: UserId::new(get(row, 0, "users", "id")?),
        name: get(row, 1, "users", "name")?,
        login: get(row, 2, "users", "login")?,
        passwd: get(row, 3, "users", "passwd")?,
    })
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a user. Logins are unique; a duplicate yields `Conflict`.
    #[instrument(skip(self, passwd))]
    pub fn create(&self, name: &str, login: &str, passwd: &str) -> Result<UserRecord, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (name, login, passwd) VALUES (?1, ?2, ?3)",
                params![name, login, passwd],
            )?;
            Ok(UserRecord {
                id: UserId::new(conn.last_insert_rowid()),
                name: name.to_string(),
                login: login.to_string(),
                passwd: passwd.to_string(),
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_opt(
                conn,
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id.get()],
                user_from_row,
            )
        })
    }

    #[instrument(skip(self, passwd))]
    pub fn find_by_credentials(
        &self,
        login: &str,
        passwd: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_opt(
                conn,
                &format!("SELECT {USER_COLUMNS} FROM users WHERE login = ?1 AND passwd = ?2"),
                params![login, passwd],
                user_from_row,
            )
        })
    }

    /// Case-insensitive substring match on name or login, ordered by name.
    #[instrument(skip(self))]
    pub fn search(
        &self,
        query: &str,
        exclude: Option<UserId>,
        limit: u32,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        let excluded = exclude.map(UserId::get).unwrap_or(-1);
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE (lower(name) LIKE ?1 ESCAPE '\\' OR lower(login) LIKE ?1 ESCAPE '\\') \
                       AND id != ?2 \
                     ORDER BY name, id LIMIT ?3"
                ),
                params![pattern, excluded, limit],
                user_from_row,
            )
        })
    }

    /// Fetch several users at once; missing ids are skipped.
    pub fn get_many(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.get(*id)? {
                out.push(user);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepo {
        UserRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = repo();
        let user = repo.create("Ann", "ann", "pw").unwrap();
        let fetched = repo.get(user.id).unwrap().unwrap();
        assert_eq!(fetched, user);
    }

    #[test]
    fn get_missing_is_none() {
        assert!(repo().get(UserId::new(404)).unwrap().is_none());
    }

    #[test]
    fn duplicate_login_conflicts() {
        let repo = repo();
        repo.create("Ann", "ann", "pw").unwrap();
        assert!(matches!(repo.create("Other", "ann", "x"), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn credentials_must_both_match() {
        let repo = repo();
        let user = repo.create("Ann", "ann", "pw").unwrap();
        assert_eq!(repo.find_by_credentials("ann", "pw").unwrap().unwrap().id, user.id);
        assert!(repo.find_by_credentials("ann", "nope").unwrap().is_none());
        assert!(repo.find_by_credentials("bob", "pw").unwrap().is_none());
    }

    #[test]
    fn search_is_case_insensitive_on_name_and_login() {
        let repo = repo();
        let ann = repo.create("Annabel", "ann", "pw").unwrap();
        repo.create("Bob", "bobby_annex", "pw").unwrap();
        repo.create("Carl", "carl", "pw").unwrap();

        let found = repo.search("ANN", None, 10).unwrap();
        let names: Vec<_> = found.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Annabel", "Bob"]);

        let found = repo.search("ann", Some(ann.id), 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Bob");
    }

    #[test]
    fn search_escapes_wildcards() {
        let repo = repo();
        repo.create("Ann", "ann", "pw").unwrap();
        repo.create("100%", "percent", "pw").unwrap();
        let found = repo.search("%", None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].login, "percent");
    }

    #[test]
    fn search_respects_limit() {
        let repo = repo();
        for i in 0..5 {
            repo.create(&format!("user{i}"), &format!("login{i}"), "pw").unwrap();
        }
        assert_eq!(repo.search("user", None, 3).unwrap().len(), 3);
    }

    #[test]
    fn get_many_skips_missing() {
        let repo = repo();
        let a = repo.create("A", "a", "pw").unwrap();
        let b = repo.create("B", "b", "pw").unwrap();
        let found = repo.get_many(&[a.id, UserId::new(999), b.id]).unwrap();
        assert_eq!(found.len(), 2);
    }
}
