//! User records. Deleting a user cascades to tasks, logs, vault entries and
//! semantic memory.

use std::sync::Arc;

use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{Timestamp, User};

use crate::db::{storage_err, Database, OptionalExt};

pub struct UserRepository {
    db: Arc<Database>,
}

impl UserRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new user. Fails with `Conflict` if the email is taken.
    pub fn create(&self, user: &User) -> Result<(), TaskPilotError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, name, phone, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user.id.to_string(),
                    user.email,
                    user.name,
                    user.phone,
                    user.is_active as i32,
                    user.created_at.0,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    TaskPilotError::Conflict(format!("User {} already exists", user.email))
                }
                other => TaskPilotError::Storage(format!("Failed to create user: {}", other)),
            })?;
            Ok(())
        })
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<User>, TaskPilotError> {
        self.find_one("SELECT id, email, name, phone, is_active, created_at FROM users WHERE id = ?1", id.to_string())
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<User>, TaskPilotError> {
        self.find_one(
            "SELECT id, email, name, phone, is_active, created_at FROM users WHERE email = ?1",
            email.trim().to_ascii_lowercase(),
        )
    }

    fn find_one(&self, sql: &str, key: String) -> Result<Option<User>, TaskPilotError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(sql, rusqlite::params![key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i32>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                })
                .optional()
                .map_err(storage_err)?;

            match row {
                Some((id, email, name, phone, active, created_at)) => Ok(Some(User {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| TaskPilotError::Corrupt(format!("Invalid user id: {}", e)))?,
                    email,
                    name,
                    phone,
                    is_active: active != 0,
                    created_at: Timestamp(created_at),
                })),
                None => Ok(None),
            }
        })
    }

    /// Delete a user and, by cascade, everything the user owns.
    pub fn delete(&self, id: Uuid) -> Result<bool, TaskPilotError> {
        self.db.with_conn(|conn| {
            let affected = conn
                .execute("DELETE FROM users WHERE id = ?1", rusqlite::params![id.to_string()])
                .map_err(storage_err)?;
            Ok(affected > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> UserRepository {
        UserRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_create_and_find() {
        let repo = repo();
        let user = User::new("alice@example.com", "Alice", Some("+15551230000".into()));
        repo.create(&user).unwrap();

        let by_id = repo.find_by_id(user.id).unwrap().unwrap();
        assert_eq!(by_id, user);

        let by_email = repo.find_by_email("ALICE@example.com ").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
    }

    #[test]
    fn test_duplicate_email_conflict() {
        let repo = repo();
        repo.create(&User::new("bob@example.com", "Bob", None)).unwrap();
        let err = repo
            .create(&User::new("bob@example.com", "Robert", None))
            .unwrap_err();
        assert!(matches!(err, TaskPilotError::Conflict(_)));
    }

    #[test]
    fn test_find_nonexistent() {
        let repo = repo();
        assert!(repo.find_by_id(Uuid::new_v4()).unwrap().is_none());
        assert!(repo.find_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let repo = repo();
        let user = User::new("carol@example.com", "Carol", None);
        repo.create(&user).unwrap();
        assert!(repo.delete(user.id).unwrap());
        assert!(!repo.delete(user.id).unwrap());
        assert!(repo.find_by_id(user.id).unwrap().is_none());
    }
}
