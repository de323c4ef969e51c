pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// The relational store. A single connection behind a mutex: every call is
/// serialized, and multi-row changes run inside one transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent readers (e.g. the sqlite3 shell)
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::init(conn)?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Like `with_conn`, but hands out `&mut` so the closure can open a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&mut conn)
    }
}

/// Stored timestamp format: RFC 3339, UTC, millisecond precision. Sorts
/// lexicographically, so SQL comparisons on the text column are chronological.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

/// Stranger tokens are only ever stored, and looked up, as this digest.
pub fn hash_stranger_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_digest_is_stable_hex() {
        assert_eq!(hash_stranger_token("abc"), hash_stranger_token("abc"));
        assert_ne!(hash_stranger_token("abc"), hash_stranger_token("abd"));
        assert_eq!(hash_stranger_token("abc").len(), 64);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::Database;
    use crate::models::{NewUser, QrCodeRow, UserInsert, UserRow};
    use safetag_types::models::Purpose;

    pub fn db() -> Database {
        Database::open_in_memory().expect("in-memory db")
    }

    pub fn user(db: &Database, email: &str) -> UserRow {
        let outcome = db
            .create_user(&NewUser {
                id: Uuid::new_v4().to_string(),
                name: "Owner".into(),
                email: email.into(),
                phone: None,
                password_hash: "hash".into(),
            })
            .expect("create user");
        match outcome {
            UserInsert::Created(user) => user,
            other => panic!("unexpected {:?}", other),
        }
    }

    pub fn qr(db: &Database, owner_id: &str, code: &str) -> QrCodeRow {
        db.create_qr_code(&Uuid::new_v4().to_string(), owner_id, code, Purpose::Pet, None, None)
            .expect("create qr")
            .expect("code free")
    }

    pub fn active_qr(db: &Database, owner_id: &str, code: &str) -> QrCodeRow {
        let qr = qr(db, owner_id, code);
        db.activate_qr_code(&qr.id, Utc::now() + Duration::days(365))
            .expect("activate");
        db.get_qr_code(&qr.id).expect("get").expect("exists")
    }
}
