use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{GoogleProfile, NewUser, ProfileChange, ProfileUpdate, UserInsert, UserRow};
use crate::{Database, now};

impl Database {
    /// Email and phone uniqueness is checked under the same lock as the insert.
    pub fn create_user(&self, user: &NewUser) -> Result<UserInsert> {
        self.with_conn_mut(|conn| {
            if query_user_by_email(conn, &user.email)?.is_some() {
                return Ok(UserInsert::EmailTaken);
            }
            if let Some(phone) = &user.phone {
                if phone_owner(conn, phone)?.is_some() {
                    return Ok(UserInsert::PhoneTaken);
                }
            }

            let ts = now();
            conn.execute(
                "INSERT INTO users (id, name, email, phone, password, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![user.id, user.name, user.email, user.phone, user.password_hash, ts],
            )?;

            let row = query_user_by_id(conn, &user.id)?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished after insert", user.id))?;
            Ok(UserInsert::Created(row))
        })
    }

    /// Finds the account for a Google identity, by Google id first and then by
    /// email. An email account seen for the first time gets the Google id (and
    /// picture) linked to it; an unknown identity becomes a new verified user
    /// without a password. `new_id` is only used in that last case.
    pub fn sign_in_with_google(&self, new_id: &str, profile: &GoogleProfile) -> Result<UserRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();

            let sql = format!(
                "SELECT {} FROM users WHERE google_id = ?1 OR email = ?2
                 ORDER BY google_id IS ?1 DESC LIMIT 1",
                UserRow::COLUMNS
            );
            let existing = tx
                .query_row(&sql, params![profile.google_id, profile.email], UserRow::from_row)
                .optional()?;

            let id = match existing {
                Some(user) if user.google_id.is_some() => return Ok(user),
                Some(user) => {
                    tx.execute(
                        "UPDATE users SET google_id = ?2, avatar_url = COALESCE(?3, avatar_url), updated_at = ?4
                         WHERE id = ?1",
                        params![user.id, profile.google_id, profile.avatar_url, ts],
                    )?;
                    user.id
                }
                None => {
                    tx.execute(
                        "INSERT INTO users (id, name, email, google_id, avatar_url, is_verified, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                        params![new_id, profile.name, profile.email, profile.google_id, profile.avatar_url, ts],
                    )?;
                    new_id.to_string()
                }
            };

            let user = query_user_by_id(&tx, &id)?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished during Google sign-in", id))?;
            tx.commit()?;
            Ok(user)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_email(conn, email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Returns (qr code count, emergency contact count).
    pub fn get_user_counts(&self, id: &str) -> Result<(i64, i64)> {
        self.with_conn(|conn| {
            let counts = conn.query_row(
                "SELECT (SELECT COUNT(*) FROM qr_codes WHERE owner_id = ?1),
                        (SELECT COUNT(*) FROM emergency_contacts WHERE owner_id = ?1)",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(counts)
        })
    }

    pub fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<ProfileChange> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(mut user) = query_user_by_id(&tx, id)? else {
                return Ok(ProfileChange::NotFound);
            };

            if let Some(Some(phone)) = &update.phone {
                if phone_owner(&tx, phone)?.is_some_and(|owner| owner != id) {
                    return Ok(ProfileChange::PhoneTaken);
                }
            }

            if let Some(name) = &update.name {
                user.name = name.clone();
            }
            if let Some(phone) = &update.phone {
                user.phone = phone.clone();
            }
            if let Some(avatar_url) = &update.avatar_url {
                user.avatar_url = avatar_url.clone();
            }

            tx.execute(
                "UPDATE users SET name = ?2, phone = ?3, avatar_url = ?4, updated_at = ?5 WHERE id = ?1",
                params![id, user.name, user.phone, user.avatar_url, now()],
            )?;
            tx.commit()?;

            Ok(ProfileChange::Updated(user))
        })
    }

    /// Removes the user; everything they own goes with them via `ON DELETE CASCADE`.
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }
}

fn query_user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE email = ?1", UserRow::COLUMNS);
    let row = conn.query_row(&sql, [email], UserRow::from_row).optional()?;
    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS);
    let row = conn.query_row(&sql, [id], UserRow::from_row).optional()?;
    Ok(row)
}

fn phone_owner(conn: &Connection, phone: &str) -> Result<Option<String>> {
    let owner = conn
        .query_row("SELECT id FROM users WHERE phone = ?1", [phone], |row| row.get(0))
        .optional()?;
    Ok(owner)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::test_support;

    fn new_user(email: &str, phone: Option<&str>) -> NewUser {
        NewUser {
            id: Uuid::new_v4().to_string(),
            name: "Asha".into(),
            email: email.into(),
            phone: phone.map(str::to_string),
            password_hash: "hash".into(),
        }
    }

    #[test]
    fn email_and_phone_are_unique() {
        let db = test_support::db();
        assert!(matches!(
            db.create_user(&new_user("a@x.in", Some("+911"))).unwrap(),
            UserInsert::Created(_)
        ));
        assert!(matches!(
            db.create_user(&new_user("a@x.in", None)).unwrap(),
            UserInsert::EmailTaken
        ));
        assert!(matches!(
            db.create_user(&new_user("b@x.in", Some("+911"))).unwrap(),
            UserInsert::PhoneTaken
        ));
        // Users without a phone never collide with each other.
        assert!(matches!(
            db.create_user(&new_user("c@x.in", None)).unwrap(),
            UserInsert::Created(_)
        ));
    }

    #[test]
    fn profile_update_keeps_absent_and_clears_null() {
        let db = test_support::db();
        let UserInsert::Created(user) = db.create_user(&new_user("a@x.in", Some("+911"))).unwrap() else {
            panic!("expected insert");
        };

        let change = db
            .update_profile(
                &user.id,
                &ProfileUpdate {
                    name: None,
                    phone: Some(None),
                    avatar_url: Some(Some("https://img/a.png".into())),
                },
            )
            .unwrap();

        let ProfileChange::Updated(updated) = change else { panic!("expected update") };
        assert_eq!(updated.name, "Asha");
        assert_eq!(updated.phone, None);
        assert_eq!(updated.avatar_url.as_deref(), Some("https://img/a.png"));

        let stored = db.get_user_by_id(&user.id).unwrap().unwrap();
        assert_eq!(stored.phone, None);
    }

    fn google(google_id: &str, email: &str) -> GoogleProfile {
        GoogleProfile {
            google_id: google_id.into(),
            email: email.into(),
            name: "Asha G".into(),
            avatar_url: Some("https://lh3/photo.jpg".into()),
        }
    }

    #[test]
    fn google_sign_in_creates_a_verified_passwordless_user_once() {
        let db = test_support::db();
        let first_id = Uuid::new_v4().to_string();

        let created = db.sign_in_with_google(&first_id, &google("g-1", "g@x.in")).unwrap();
        assert_eq!(created.id, first_id);
        assert!(created.is_verified);
        assert_eq!(created.password, None);
        assert_eq!(created.google_id.as_deref(), Some("g-1"));

        let again = db
            .sign_in_with_google(&Uuid::new_v4().to_string(), &google("g-1", "g@x.in"))
            .unwrap();
        assert_eq!(again.id, first_id);
    }

    #[test]
    fn google_sign_in_links_an_existing_email_account() {
        let db = test_support::db();
        let user = test_support::user(&db, "a@x.in");

        let linked = db
            .sign_in_with_google(&Uuid::new_v4().to_string(), &google("g-2", "a@x.in"))
            .unwrap();
        assert_eq!(linked.id, user.id);
        assert_eq!(linked.google_id.as_deref(), Some("g-2"));
        assert_eq!(linked.avatar_url.as_deref(), Some("https://lh3/photo.jpg"));
        assert_eq!(linked.password.as_deref(), Some("hash"));
        assert_eq!(linked.name, "Owner");
    }

    #[test]
    fn deleting_a_user_cascades() {
        let db = test_support::db();
        let user = test_support::user(&db, "a@x.in");
        test_support::qr(&db, &user.id, "CASCADE1");

        assert!(db.delete_user(&user.id).unwrap());
        assert!(db.get_qr_code_by_code("CASCADE1").unwrap().is_none());
        assert!(db.get_user_by_id(&user.id).unwrap().is_none());
    }
}
