use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use safetag_types::models::{NotificationKind, OrderStatus, OrderType};

use super::qr_codes::{activate, query_qr_by_id};
use crate::models::{NewNotification, OrderConfirm, OrderRow};
use crate::queries::insert_notification;
use crate::{Database, now};

impl Database {
    pub fn create_order(
        &self,
        id: &str,
        user_id: &str,
        qr_id: Option<&str>,
        order_type: OrderType,
        amount: i64,
    ) -> Result<OrderRow> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO orders (id, user_id, qr_id, order_type, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, user_id, qr_id, order_type.as_str(), amount, now()],
            )?;
            query_order(conn, user_id, id)?.ok_or_else(|| anyhow::anyhow!("order {} vanished after insert", id))
        })
    }

    #[cfg(test)]
    pub(crate) fn get_order(&self, user_id: &str, id: &str) -> Result<Option<OrderRow>> {
        self.with_conn(|conn| query_order(conn, user_id, id))
    }

    /// Newest first.
    pub fn list_orders(&self, user_id: &str) -> Result<Vec<OrderRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM orders WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
                OrderRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], OrderRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Marks a pending order paid. If it is tied to a QR code, the code is
    /// activated until `qr_expires_at` in the same transaction, and the buyer
    /// gets an `order_paid` notification.
    pub fn confirm_order(
        &self,
        user_id: &str,
        id: &str,
        payment_id: &str,
        qr_expires_at: DateTime<Utc>,
    ) -> Result<OrderConfirm> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(order) = query_order(&tx, user_id, id)? else {
                return Ok(OrderConfirm::NotFound);
            };
            if order.status == OrderStatus::Paid {
                return Ok(OrderConfirm::AlreadyPaid);
            }

            let ts = now();
            let changed = tx.execute(
                "UPDATE orders SET status = 'paid', payment_id = ?2, paid_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, payment_id, ts],
            )?;
            if changed == 0 {
                return Ok(OrderConfirm::AlreadyPaid);
            }

            let activated_qr = match &order.qr_id {
                Some(qr_id) if activate(&tx, qr_id, qr_expires_at)? => query_qr_by_id(&tx, qr_id)?,
                _ => None,
            };

            let body = match &activated_qr {
                Some(qr) => format!("Your {} tag {} is now active.", qr.purpose_label(), qr.unique_code),
                None => format!("Payment {} received.", payment_id),
            };
            insert_notification(
                &tx,
                &NewNotification {
                    user_id: user_id.to_string(),
                    kind: NotificationKind::OrderPaid,
                    title: "Order confirmed".to_string(),
                    body,
                    data: json!({ "orderId": id, "qrId": order.qr_id }),
                },
            )?;

            let order = query_order(&tx, user_id, id)?
                .ok_or_else(|| anyhow::anyhow!("order {} vanished during confirm", id))?;
            tx.commit()?;

            Ok(OrderConfirm::Confirmed { order, activated_qr })
        })
    }
}

fn query_order(conn: &Connection, user_id: &str, id: &str) -> Result<Option<OrderRow>> {
    let sql = format!("SELECT {} FROM orders WHERE id = ?1 AND user_id = ?2", OrderRow::COLUMNS);
    let row = conn.query_row(&sql, [id, user_id], OrderRow::from_row).optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use safetag_types::models::QrStatus;
    use uuid::Uuid;

    use super::*;
    use crate::models::{ScanInput, ScanOutcome};
    use crate::test_support;

    #[test]
    fn confirming_activates_the_tag_once() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let qr = test_support::qr(&db, &owner.id, "ORDER001");

        let order_id = Uuid::new_v4().to_string();
        let order = db
            .create_order(&order_id, &owner.id, Some(&qr.id), OrderType::Sticker, 23500)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.currency, "INR");

        let scan = || ScanInput {
            session_id: Uuid::new_v4().to_string(),
            stranger_token_hash: Uuid::new_v4().to_string(),
            ip: None,
            user_agent: None,
        };
        assert!(matches!(db.record_scan("ORDER001", &scan()).unwrap(), ScanOutcome::Inactive));

        let expires = Utc::now() + Duration::days(365);
        let OrderConfirm::Confirmed { order, activated_qr } =
            db.confirm_order(&owner.id, &order_id, "pay_123", expires).unwrap()
        else {
            panic!("order should confirm");
        };
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_id.as_deref(), Some("pay_123"));
        assert_eq!(activated_qr.unwrap().status, QrStatus::Active);

        assert!(matches!(db.record_scan("ORDER001", &scan()).unwrap(), ScanOutcome::Started(_)));

        assert!(matches!(
            db.confirm_order(&owner.id, &order_id, "pay_456", expires).unwrap(),
            OrderConfirm::AlreadyPaid
        ));

        let kinds: Vec<_> = db.list_notifications(&owner.id, 50).unwrap().into_iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NotificationKind::OrderPaid));
    }

    #[test]
    fn orders_are_private_to_their_buyer() {
        let db = test_support::db();
        let a = test_support::user(&db, "a@x.in");
        let b = test_support::user(&db, "b@x.in");
        let order_id = Uuid::new_v4().to_string();
        db.create_order(&order_id, &a.id, None, OrderType::Pdf, 9900).unwrap();

        assert!(db.get_order(&b.id, &order_id).unwrap().is_none());
        assert!(db.list_orders(&b.id).unwrap().is_empty());
        assert!(matches!(
            db.confirm_order(&b.id, &order_id, "pay", Utc::now()).unwrap(),
            OrderConfirm::NotFound
        ));

        let OrderConfirm::Confirmed { activated_qr, .. } =
            db.confirm_order(&a.id, &order_id, "pay", Utc::now()).unwrap()
        else {
            panic!("order should confirm");
        };
        assert!(activated_qr.is_none());
        assert_eq!(db.list_orders(&a.id).unwrap().len(), 1);
    }
}
