use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;
use uuid::Uuid;

use safetag_types::models::{NotificationKind, Purpose, QrStatus};

use crate::models::{NewNotification, QrCodeRow, QrSummaryRow, ScanInput, ScanOutcome, ScanRecord};
use crate::queries::insert_notification;
use crate::{Database, now, timestamp};

impl Database {
    /// Inserts a new inactive code. Returns `None` if `unique_code` is already taken.
    pub fn create_qr_code(
        &self,
        id: &str,
        owner_id: &str,
        unique_code: &str,
        purpose: Purpose,
        custom_purpose: Option<&str>,
        template: Option<&str>,
    ) -> Result<Option<QrCodeRow>> {
        self.with_conn_mut(|conn| {
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM qr_codes WHERE unique_code = ?1)",
                [unique_code],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(None);
            }

            let ts = now();
            conn.execute(
                "INSERT INTO qr_codes (id, owner_id, unique_code, purpose, custom_purpose, template, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, owner_id, unique_code, purpose.as_str(), custom_purpose, template, ts],
            )?;

            query_qr_by_id(conn, id)
        })
    }

    pub fn get_qr_code(&self, id: &str) -> Result<Option<QrCodeRow>> {
        self.with_conn(|conn| query_qr_by_id(conn, id))
    }

    #[cfg(test)]
    pub(crate) fn get_qr_code_by_code(&self, unique_code: &str) -> Result<Option<QrCodeRow>> {
        self.with_conn(|conn| query_qr_by_code(conn, unique_code))
    }

    /// Owner's codes, newest first, with the number of calls each received.
    pub fn list_qr_codes(&self, owner_id: &str) -> Result<Vec<QrSummaryRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {}, (SELECT COUNT(*) FROM calls c WHERE c.qr_id = q.id)
                 FROM qr_codes q
                 WHERE owner_id = ?1
                 ORDER BY created_at DESC",
                QrCodeRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([owner_id], |row| {
                    Ok(QrSummaryRow {
                        qr: QrCodeRow::from_row(row)?,
                        call_count: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn activate_qr_code(&self, id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| activate(conn, id, expires_at))
    }

    /// The scan pipeline's store half. In one transaction: bump the counter,
    /// log the scan, open a chat session and leave the owner a notification.
    /// Unknown, inactive and expired codes write nothing.
    pub fn record_scan(&self, unique_code: &str, scan: &ScanInput) -> Result<ScanOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(mut qr) = query_qr_by_code(&tx, unique_code)? else {
                return Ok(ScanOutcome::NotFound);
            };

            match qr.status {
                QrStatus::Inactive => return Ok(ScanOutcome::Inactive),
                QrStatus::Expired => return Ok(ScanOutcome::Expired),
                QrStatus::Active => {}
            }

            let ts = now();
            if qr.expires_at.as_deref().is_some_and(|exp| exp <= ts.as_str()) {
                return Ok(ScanOutcome::Expired);
            }

            tx.execute(
                "UPDATE qr_codes SET scan_count = scan_count + 1, last_scanned_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![qr.id, ts],
            )?;

            tx.execute(
                "INSERT INTO scan_logs (id, qr_id, ip, user_agent, scanned_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![Uuid::new_v4().to_string(), qr.id, scan.ip, scan.user_agent, ts],
            )?;

            tx.execute(
                "INSERT INTO chat_sessions (id, qr_id, owner_id, stranger_token_hash, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![scan.session_id, qr.id, qr.owner_id, scan.stranger_token_hash, ts],
            )?;

            let owner_name: String =
                tx.query_row("SELECT name FROM users WHERE id = ?1", [&qr.owner_id], |row| row.get(0))?;

            let label = qr.purpose_label();
            insert_notification(
                &tx,
                &NewNotification {
                    user_id: qr.owner_id.clone(),
                    kind: NotificationKind::QrScanned,
                    title: format!("{} tag scanned", label),
                    body: format!("Someone scanned your {} tag and may want to reach you.", label),
                    data: json!({ "qrId": qr.id, "sessionId": scan.session_id }),
                },
            )?;

            tx.commit()?;

            qr.scan_count += 1;
            qr.last_scanned_at = Some(ts);

            Ok(ScanOutcome::Started(ScanRecord {
                qr,
                owner_name,
                session_id: scan.session_id.clone(),
            }))
        })
    }

    pub fn count_scan_logs(&self, qr_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM scan_logs WHERE qr_id = ?1", [qr_id], |row| {
                row.get(0)
            })?;
            Ok(count)
        })
    }

    /// Flips active codes whose validity window has passed. Returns how many changed.
    pub fn expire_qr_codes(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE qr_codes SET status = 'expired', updated_at = ?1
                 WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
                [now()],
            )?;
            Ok(changed)
        })
    }
}

pub(crate) fn activate(conn: &Connection, id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
    let ts = now();
    let changed = conn.execute(
        "UPDATE qr_codes SET status = 'active', activated_at = ?2, expires_at = ?3, updated_at = ?2
         WHERE id = ?1",
        params![id, ts, timestamp(expires_at)],
    )?;
    Ok(changed > 0)
}

pub(crate) fn query_qr_by_id(conn: &Connection, id: &str) -> Result<Option<QrCodeRow>> {
    let sql = format!("SELECT {} FROM qr_codes WHERE id = ?1", QrCodeRow::COLUMNS);
    let row = conn.query_row(&sql, [id], QrCodeRow::from_row).optional()?;
    Ok(row)
}

fn query_qr_by_code(conn: &Connection, unique_code: &str) -> Result<Option<QrCodeRow>> {
    let sql = format!("SELECT {} FROM qr_codes WHERE unique_code = ?1", QrCodeRow::COLUMNS);
    let row = conn.query_row(&sql, [unique_code], QrCodeRow::from_row).optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_support;

    fn scan_input() -> ScanInput {
        ScanInput {
            session_id: Uuid::new_v4().to_string(),
            stranger_token_hash: Uuid::new_v4().to_string(),
            ip: Some("10.0.0.1".into()),
            user_agent: Some("test-agent".into()),
        }
    }

    fn session_count(db: &Database, qr_id: &str) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM chat_sessions WHERE qr_id = ?1", [qr_id], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn unknown_code_writes_nothing() {
        let db = test_support::db();
        assert!(matches!(db.record_scan("NOPE0000", &scan_input()).unwrap(), ScanOutcome::NotFound));
        let logs: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM scan_logs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(logs, 0);
    }

    #[test]
    fn inactive_and_expired_codes_leave_counter_alone() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");

        let inactive = test_support::qr(&db, &owner.id, "INACT001");
        assert!(matches!(db.record_scan("INACT001", &scan_input()).unwrap(), ScanOutcome::Inactive));

        let lapsed = test_support::qr(&db, &owner.id, "LAPSED01");
        db.activate_qr_code(&lapsed.id, Utc::now() - Duration::minutes(1)).unwrap();
        assert!(matches!(db.record_scan("LAPSED01", &scan_input()).unwrap(), ScanOutcome::Expired));

        for qr in [&inactive, &lapsed] {
            assert_eq!(db.get_qr_code(&qr.id).unwrap().unwrap().scan_count, 0);
            assert_eq!(db.count_scan_logs(&qr.id).unwrap(), 0);
            assert_eq!(session_count(&db, &qr.id), 0);
        }
    }

    #[test]
    fn n_scans_count_n_times_and_open_n_sessions() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let qr = test_support::active_qr(&db, &owner.id, "ABC123");

        let n = 4;
        for _ in 0..n {
            let ScanOutcome::Started(record) = db.record_scan("ABC123", &scan_input()).unwrap() else {
                panic!("scan should start a session");
            };
            assert_eq!(record.owner_name, "Owner");
            assert_eq!(record.qr.purpose_label(), "Pet Tag");
        }

        assert_eq!(db.get_qr_code(&qr.id).unwrap().unwrap().scan_count, n);
        assert_eq!(db.count_scan_logs(&qr.id).unwrap(), n);
        assert_eq!(session_count(&db, &qr.id), n);
        assert_eq!(db.list_notifications(&owner.id, 50).unwrap().len(), n as usize);
    }

    #[test]
    fn sweeping_expires_lapsed_codes() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let lapsed = test_support::qr(&db, &owner.id, "LAPSED02");
        db.activate_qr_code(&lapsed.id, Utc::now() - Duration::seconds(5)).unwrap();
        let fresh = test_support::active_qr(&db, &owner.id, "FRESH001");

        assert_eq!(db.expire_qr_codes().unwrap(), 1);
        assert_eq!(db.get_qr_code(&lapsed.id).unwrap().unwrap().status, QrStatus::Expired);
        assert_eq!(db.get_qr_code(&fresh.id).unwrap().unwrap().status, QrStatus::Active);
    }

    #[test]
    fn duplicate_code_is_refused() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        test_support::qr(&db, &owner.id, "DUPE0001");
        let again = db
            .create_qr_code(&Uuid::new_v4().to_string(), &owner.id, "DUPE0001", Purpose::Bag, None, None)
            .unwrap();
        assert!(again.is_none());
    }
}
