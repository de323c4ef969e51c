use anyhow::Result;
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{NewNotification, NotificationRow};
use crate::{Database, now};

impl Database {
    pub fn create_notification(&self, notification: &NewNotification) -> Result<String> {
        self.with_conn_mut(|conn| insert_notification(conn, notification))
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                NotificationRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id, limit], NotificationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user_id],
            )?;
            Ok(changed)
        })
    }

    /// Returns false if the notification does not exist or belongs to someone else.
    pub fn mark_notification_read(&self, user_id: &str, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                [id, user_id],
            )?;
            Ok(changed > 0)
        })
    }
}

/// Usable inside a caller's transaction.
pub(crate) fn insert_notification(conn: &Connection, notification: &NewNotification) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notifications (id, user_id, kind, title, body, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            notification.user_id,
            notification.kind.as_str(),
            notification.title,
            notification.body,
            notification.data.to_string(),
            now()
        ],
    )?;
    Ok(id)
}
