use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use safetag_types::models::{CallAction, CallStatus, EscalationResult, NotificationKind};

use crate::models::{CallRow, EscalationOutcome, NewCall, NewNotification, TransitionOutcome};
use crate::queries::insert_notification;
use crate::{Database, now, timestamp};

impl Database {
    /// Creates a call in the ringing state.
    pub fn create_call(&self, call: &NewCall) -> Result<CallRow> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO calls (id, qr_id, session_id, caller_id, callee_id, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'ringing', ?6)",
                params![call.id, call.qr_id, call.session_id, call.caller_id, call.callee_id, now()],
            )?;
            query_call(conn, &call.id)?.ok_or_else(|| anyhow::anyhow!("call {} vanished after insert", call.id))
        })
    }

    pub fn get_call(&self, id: &str) -> Result<Option<CallRow>> {
        self.with_conn(|conn| query_call(conn, id))
    }

    /// Calls placed through one QR code, newest first.
    pub fn list_calls_for_qr(&self, qr_id: &str) -> Result<Vec<CallRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM calls WHERE qr_id = ?1 ORDER BY started_at DESC, rowid DESC",
                CallRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([qr_id], CallRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Applies `action` to the call. The write is conditional on the status the
    /// decision was made from, so two racing transitions cannot both apply.
    /// Declined and missed calls to an owner leave them a notification.
    pub fn transition_call(&self, id: &str, action: CallAction) -> Result<TransitionOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(call) = query_call(&tx, id)? else {
                return Ok(TransitionOutcome::NotFound);
            };
            let Some(next) = action.target(call.status) else {
                return Ok(TransitionOutcome::Rejected(call.status));
            };

            let ts = now();
            let (connected_at, ended_at) = match next {
                CallStatus::Connected => (Some(ts.as_str()), None),
                _ => (None, Some(ts.as_str())),
            };

            let changed = tx.execute(
                "UPDATE calls
                 SET status = ?3,
                     connected_at = COALESCE(?4, connected_at),
                     ended_at = COALESCE(?5, ended_at)
                 WHERE id = ?1 AND status = ?2",
                params![id, call.status.as_str(), next.as_str(), connected_at, ended_at],
            )?;
            if changed == 0 {
                let current = query_call(&tx, id)?.map_or(call.status, |c| c.status);
                return Ok(TransitionOutcome::Rejected(current));
            }

            if let Some(notification) = call_notification(&call, next) {
                insert_notification(&tx, &notification)?;
            }

            let updated = query_call(&tx, id)?
                .ok_or_else(|| anyhow::anyhow!("call {} vanished during transition", id))?;
            tx.commit()?;

            Ok(TransitionOutcome::Applied(updated))
        })
    }

    /// Ringing calls started before `started_before` become missed.
    /// Returns the calls that timed out.
    pub fn time_out_ringing_calls(&self, started_before: DateTime<Utc>) -> Result<Vec<CallRow>> {
        let stale: Vec<String> = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM calls WHERE status = 'ringing' AND started_at < ?1")?;
            let ids = stmt
                .query_map([timestamp(started_before)], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;

        let mut missed = Vec::with_capacity(stale.len());
        for id in &stale {
            // The callee may have picked up in the meantime; that shows up as Rejected.
            if let TransitionOutcome::Applied(call) = self.transition_call(id, CallAction::Timeout)? {
                missed.push(call);
            }
        }
        Ok(missed)
    }

    /// Records the out-of-band fallback for a declined or missed call.
    /// Status is left untouched; escalation is recorded at most once.
    pub fn record_escalation(
        &self,
        id: &str,
        escalated_to: &str,
        result: EscalationResult,
    ) -> Result<EscalationOutcome> {
        self.with_conn_mut(|conn| {
            let Some(call) = query_call(conn, id)? else {
                return Ok(EscalationOutcome::NotFound);
            };

            let eligible = matches!(call.status, CallStatus::Declined | CallStatus::Missed);
            let changed = if eligible {
                conn.execute(
                    "UPDATE calls SET escalated_to = ?2, escalation_result = ?3
                     WHERE id = ?1 AND escalated_to IS NULL AND escalation_result = 'not_attempted'",
                    params![id, escalated_to, result.as_str()],
                )?
            } else {
                0
            };
            if changed == 0 {
                return Ok(EscalationOutcome::Rejected(call.status));
            }

            let updated = query_call(conn, id)?
                .ok_or_else(|| anyhow::anyhow!("call {} vanished during escalation", id))?;
            Ok(EscalationOutcome::Recorded(updated))
        })
    }
}

fn call_notification(call: &CallRow, next: CallStatus) -> Option<NewNotification> {
    if call.callee_is_stranger() {
        return None;
    }
    let (kind, title) = match next {
        CallStatus::Missed => (NotificationKind::MissedCall, "Missed call"),
        CallStatus::Declined => (NotificationKind::CallDeclined, "Call declined"),
        _ => return None,
    };
    Some(NewNotification {
        user_id: call.callee_id.clone(),
        kind,
        title: title.to_string(),
        body: "Someone who scanned your tag tried to call you.".to_string(),
        data: json!({ "callId": call.id, "qrId": call.qr_id, "sessionId": call.session_id }),
    })
}

fn query_call(conn: &Connection, id: &str) -> Result<Option<CallRow>> {
    let sql = format!("SELECT {} FROM calls WHERE id = ?1", CallRow::COLUMNS);
    let row = conn.query_row(&sql, [id], CallRow::from_row).optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::models::{ScanInput, ScanOutcome};
    use crate::test_support;

    fn ringing_call(db: &Database) -> CallRow {
        let owner = test_support::user(db, &format!("{}@x.in", Uuid::new_v4()));
        let code = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        let qr = test_support::active_qr(db, &owner.id, &code);
        db.create_call(&NewCall {
            id: Uuid::new_v4().to_string(),
            qr_id: qr.id,
            session_id: None,
            caller_id: "stranger-room".into(),
            callee_id: owner.id,
        })
        .unwrap()
    }

    fn status_of(db: &Database, id: &str) -> CallStatus {
        db.get_call(id).unwrap().unwrap().status
    }

    #[test]
    fn accept_then_end() {
        let db = test_support::db();
        let call = ringing_call(&db);
        assert_eq!(call.status, CallStatus::Ringing);

        let TransitionOutcome::Applied(connected) = db.transition_call(&call.id, CallAction::Accept).unwrap() else {
            panic!("accept should apply");
        };
        assert_eq!(connected.status, CallStatus::Connected);
        assert!(connected.connected_at.is_some());

        let TransitionOutcome::Applied(ended) = db.transition_call(&call.id, CallAction::End).unwrap() else {
            panic!("end should apply");
        };
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.ended_at.is_some());
    }

    #[test]
    fn declined_call_cannot_be_accepted() {
        let db = test_support::db();
        let call = ringing_call(&db);

        assert!(matches!(
            db.transition_call(&call.id, CallAction::Decline).unwrap(),
            TransitionOutcome::Applied(_)
        ));
        assert!(matches!(
            db.transition_call(&call.id, CallAction::Accept).unwrap(),
            TransitionOutcome::Rejected(CallStatus::Declined)
        ));
        assert!(matches!(
            db.transition_call(&call.id, CallAction::End).unwrap(),
            TransitionOutcome::Rejected(CallStatus::Declined)
        ));
        assert_eq!(status_of(&db, &call.id), CallStatus::Declined);

        let notes = db.list_notifications(&call.callee_id, 50).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::CallDeclined);
    }

    #[test]
    fn owner_can_ring_a_session_without_a_notification() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let qr = test_support::active_qr(&db, &owner.id, "CALLBACK");
        let session_id = Uuid::new_v4().to_string();
        let ScanOutcome::Started(_) = db
            .record_scan(
                "CALLBACK",
                &ScanInput {
                    session_id: session_id.clone(),
                    stranger_token_hash: crate::hash_stranger_token("tok"),
                    ip: None,
                    user_agent: None,
                },
            )
            .unwrap()
        else {
            panic!("scan should start a session");
        };

        let call = db
            .create_call(&NewCall {
                id: Uuid::new_v4().to_string(),
                qr_id: qr.id,
                session_id: Some(session_id.clone()),
                caller_id: owner.id.clone(),
                callee_id: session_id,
            })
            .unwrap();
        assert!(call.callee_is_stranger());

        assert!(matches!(
            db.transition_call(&call.id, CallAction::Decline).unwrap(),
            TransitionOutcome::Applied(_)
        ));
        let notes = db.list_notifications(&owner.id, 50).unwrap();
        assert!(notes.iter().all(|n| n.kind == NotificationKind::QrScanned));
    }

    #[test]
    fn unknown_call_is_not_found() {
        let db = test_support::db();
        assert!(matches!(
            db.transition_call("missing", CallAction::Accept).unwrap(),
            TransitionOutcome::NotFound
        ));
    }

    #[test]
    fn ring_timeout_marks_missed_once() {
        let db = test_support::db();
        let stale = ringing_call(&db);
        let answered = ringing_call(&db);
        db.transition_call(&answered.id, CallAction::Accept).unwrap();

        let missed = db.time_out_ringing_calls(Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].id, stale.id);
        assert_eq!(status_of(&db, &stale.id), CallStatus::Missed);
        assert_eq!(status_of(&db, &answered.id), CallStatus::Connected);

        assert!(db.time_out_ringing_calls(Utc::now() + Duration::seconds(1)).unwrap().is_empty());
    }

    #[test]
    fn escalation_is_recorded_once_on_failed_calls() {
        let db = test_support::db();
        let call = ringing_call(&db);

        assert!(matches!(
            db.record_escalation(&call.id, "+911234", EscalationResult::Answered).unwrap(),
            EscalationOutcome::Rejected(CallStatus::Ringing)
        ));

        db.transition_call(&call.id, CallAction::End).unwrap();
        let EscalationOutcome::Recorded(row) =
            db.record_escalation(&call.id, "+911234", EscalationResult::Answered).unwrap()
        else {
            panic!("escalation should record");
        };
        assert_eq!(row.status, CallStatus::Missed);
        assert_eq!(row.escalation_result, EscalationResult::Answered);
        assert_eq!(row.escalated_to.as_deref(), Some("+911234"));

        assert!(matches!(
            db.record_escalation(&call.id, "+915678", EscalationResult::Missed).unwrap(),
            EscalationOutcome::Rejected(CallStatus::Missed)
        ));
    }
}
