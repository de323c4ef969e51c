use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use safetag_types::models::{Purpose, SenderRole};

use crate::models::{ChatMessageRow, ChatSessionRow, NewMessage, SessionSummaryRow};
use crate::{Database, now, timestamp};

impl Database {
    pub fn get_session(&self, id: &str) -> Result<Option<ChatSessionRow>> {
        self.with_conn(|conn| query_session(conn, "id", id))
    }

    pub fn get_session_by_token_hash(&self, token_hash: &str) -> Result<Option<ChatSessionRow>> {
        self.with_conn(|conn| query_session(conn, "stranger_token_hash", token_hash))
    }

    /// Owner's sessions, most recently active first, with a preview of the last message.
    pub fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.qr_id, s.owner_id, s.is_active, s.created_at, s.last_activity_at,
                        q.purpose, q.custom_purpose,
                        (SELECT m.content FROM chat_messages m WHERE m.session_id = s.id ORDER BY m.seq DESC LIMIT 1),
                        (SELECT m.created_at FROM chat_messages m WHERE m.session_id = s.id ORDER BY m.seq DESC LIMIT 1)
                 FROM chat_sessions s
                 JOIN qr_codes q ON q.id = s.qr_id
                 WHERE s.owner_id = ?1
                 ORDER BY s.last_activity_at DESC",
            )?;

            let rows = stmt
                .query_map([owner_id], |row| {
                    let purpose: String = row.get(6)?;
                    let custom: Option<String> = row.get(7)?;
                    let qr_purpose = custom.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| {
                        purpose
                            .parse::<Purpose>()
                            .map(|p| p.label().to_string())
                            .unwrap_or(purpose)
                    });
                    Ok(SessionSummaryRow {
                        session: ChatSessionRow::from_row(row)?,
                        qr_purpose,
                        last_message: row.get(8)?,
                        last_message_at: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Appends a message and bumps the session's activity clock.
    pub fn insert_message(&self, message: &NewMessage) -> Result<ChatMessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();

            tx.execute(
                "INSERT INTO chat_messages
                    (id, session_id, sender_role, kind, content, media_url, latitude, longitude, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id,
                    message.session_id,
                    message.sender_role.as_str(),
                    message.kind.as_str(),
                    message.content,
                    message.media_url,
                    message.latitude,
                    message.longitude,
                    ts
                ],
            )?;
            let seq = tx.last_insert_rowid();

            tx.execute(
                "UPDATE chat_sessions SET last_activity_at = ?2 WHERE id = ?1",
                params![message.session_id, ts],
            )?;
            tx.commit()?;

            Ok(ChatMessageRow {
                seq,
                id: message.id.clone(),
                session_id: message.session_id.clone(),
                sender_role: message.sender_role,
                kind: message.kind,
                content: message.content.clone(),
                media_url: message.media_url.clone(),
                latitude: message.latitude,
                longitude: message.longitude,
                is_read: false,
                created_at: ts,
            })
        })
    }

    /// All messages of a session in send order.
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chat_messages WHERE session_id = ?1 ORDER BY seq ASC",
                ChatMessageRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([session_id], ChatMessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Marks everything `sender` wrote in the session as read.
    pub fn mark_messages_read(&self, session_id: &str, sender: SenderRole) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE chat_messages SET is_read = 1 WHERE session_id = ?1 AND sender_role = ?2 AND is_read = 0",
                [session_id, sender.as_str()],
            )?;
            Ok(changed)
        })
    }

    /// Returns true if the session was active and is now closed.
    pub fn close_session(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE chat_sessions SET is_active = 0, closed_at = ?2 WHERE id = ?1 AND is_active = 1",
                params![id, now()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Closes active sessions with no activity since `idle_before`.
    /// Returns the closed sessions.
    pub fn close_idle_sessions(&self, idle_before: DateTime<Utc>) -> Result<Vec<ChatSessionRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let cutoff = timestamp(idle_before);

            let idle = {
                let sql = format!(
                    "SELECT {} FROM chat_sessions WHERE is_active = 1 AND last_activity_at < ?1",
                    ChatSessionRow::COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map([&cutoff], ChatSessionRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let ts = now();
            for session in &idle {
                tx.execute(
                    "UPDATE chat_sessions SET is_active = 0, closed_at = ?2 WHERE id = ?1",
                    params![session.id, ts],
                )?;
            }
            tx.commit()?;

            Ok(idle
                .into_iter()
                .map(|s| ChatSessionRow { is_active: false, ..s })
                .collect())
        })
    }
}

fn query_session(conn: &Connection, column: &str, value: &str) -> Result<Option<ChatSessionRow>> {
    let sql = format!("SELECT {} FROM chat_sessions WHERE {} = ?1", ChatSessionRow::COLUMNS, column);
    let row = conn.query_row(&sql, [value], ChatSessionRow::from_row).optional()?;
    Ok(row)
}
