use std::collections::HashSet;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{ContactChange, ContactInsert, ContactRow, ContactUpdate, NewContact, ReorderOutcome};
use crate::{Database, now};

// Priorities are 1-based ranks and stay dense (1..=K) per owner. Every
// mutation below reads the current order, edits it in memory and rewrites all
// ranks inside one transaction, so no reader ever sees a gap or a duplicate.

impl Database {
    /// Ascending priority.
    pub fn list_contacts(&self, owner_id: &str) -> Result<Vec<ContactRow>> {
        self.with_conn(|conn| query_contacts(conn, owner_id))
    }

    pub fn add_contact(&self, owner_id: &str, contact: &NewContact) -> Result<ContactInsert> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if phone_in_use(&tx, owner_id, &contact.phone, None)? {
                return Ok(ContactInsert::DuplicatePhone);
            }

            let mut order = ordered_ids(&tx, owner_id)?;
            insert_row(&tx, owner_id, contact)?;
            let position = contact
                .priority
                .map(|p| (p.max(1) as usize - 1).min(order.len()))
                .unwrap_or(order.len());
            order.insert(position, contact.id.clone());
            renumber(&tx, owner_id, &order)?;

            let row = query_contact(&tx, owner_id, &contact.id)?
                .ok_or_else(|| anyhow::anyhow!("contact {} vanished after insert", contact.id))?;
            tx.commit()?;
            Ok(ContactInsert::Inserted(row))
        })
    }

    /// Appends every contact whose phone is not already present (for this owner
    /// or earlier in the batch). Requested priorities are ignored; device sync
    /// appends in the order given. Returns the number added.
    pub fn add_contacts_bulk(&self, owner_id: &str, contacts: &[NewContact]) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut phones: HashSet<String> =
                query_contacts(&tx, owner_id)?.into_iter().map(|c| c.phone).collect();
            let mut order = ordered_ids(&tx, owner_id)?;

            let mut added = 0;
            for contact in contacts {
                if !phones.insert(contact.phone.clone()) {
                    continue;
                }
                insert_row(&tx, owner_id, contact)?;
                order.push(contact.id.clone());
                added += 1;
            }

            renumber(&tx, owner_id, &order)?;
            tx.commit()?;
            Ok(added)
        })
    }

    pub fn update_contact(&self, owner_id: &str, id: &str, update: &ContactUpdate) -> Result<ContactChange> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(mut contact) = query_contact(&tx, owner_id, id)? else {
                return Ok(ContactChange::NotFound);
            };

            if let Some(phone) = &update.phone {
                if phone_in_use(&tx, owner_id, phone, Some(id))? {
                    return Ok(ContactChange::DuplicatePhone);
                }
                contact.phone = phone.clone();
            }
            if let Some(name) = &update.name {
                contact.name = name.clone();
            }
            if let Some(relation) = &update.relation {
                contact.relation = relation.clone().unwrap_or_default();
            }

            tx.execute(
                "UPDATE emergency_contacts SET name = ?3, phone = ?4, relation = ?5 WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id, contact.name, contact.phone, contact.relation],
            )?;

            if let Some(priority) = update.priority {
                let mut order = ordered_ids(&tx, owner_id)?;
                order.retain(|other| other != id);
                let position = (priority.max(1) as usize - 1).min(order.len());
                order.insert(position, id.to_string());
                renumber(&tx, owner_id, &order)?;
            }

            let row = query_contact(&tx, owner_id, id)?
                .ok_or_else(|| anyhow::anyhow!("contact {} vanished during update", id))?;
            tx.commit()?;
            Ok(ContactChange::Updated(row))
        })
    }

    /// `ordered_ids` must name each of the owner's contacts exactly once.
    pub fn reorder_contacts(&self, owner_id: &str, ordered: &[String]) -> Result<ReorderOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let current: HashSet<String> = ordered_ids(&tx, owner_id)?.into_iter().collect();
            let requested: HashSet<&String> = ordered.iter().collect();
            let is_permutation = ordered.len() == current.len()
                && requested.len() == ordered.len()
                && ordered.iter().all(|id| current.contains(id));
            if !is_permutation {
                return Ok(ReorderOutcome::Mismatch);
            }

            renumber(&tx, owner_id, ordered)?;
            let rows = query_contacts(&tx, owner_id)?;
            tx.commit()?;
            Ok(ReorderOutcome::Reordered(rows))
        })
    }

    /// Deletes the contact and closes the gap it leaves.
    pub fn delete_contact(&self, owner_id: &str, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let removed = tx.execute(
                "DELETE FROM emergency_contacts WHERE id = ?1 AND owner_id = ?2",
                [id, owner_id],
            )?;
            if removed == 0 {
                return Ok(false);
            }

            let order = ordered_ids(&tx, owner_id)?;
            renumber(&tx, owner_id, &order)?;
            tx.commit()?;
            Ok(true)
        })
    }
}

fn insert_row(conn: &Connection, owner_id: &str, contact: &NewContact) -> Result<()> {
    // Rank is assigned by the following renumber.
    conn.execute(
        "INSERT INTO emergency_contacts (id, owner_id, name, phone, relation, priority, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![contact.id, owner_id, contact.name, contact.phone, contact.relation, now()],
    )?;
    Ok(())
}

fn renumber(conn: &Connection, owner_id: &str, order: &[String]) -> Result<()> {
    let mut stmt =
        conn.prepare("UPDATE emergency_contacts SET priority = ?3 WHERE id = ?1 AND owner_id = ?2")?;
    for (rank, id) in order.iter().enumerate() {
        stmt.execute(params![id, owner_id, rank as u32 + 1])?;
    }
    Ok(())
}

fn ordered_ids(conn: &Connection, owner_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM emergency_contacts WHERE owner_id = ?1 ORDER BY priority ASC, created_at ASC, rowid ASC",
    )?;
    let ids = stmt
        .query_map([owner_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn phone_in_use(conn: &Connection, owner_id: &str, phone: &str, except: Option<&str>) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM emergency_contacts WHERE owner_id = ?1 AND phone = ?2",
            [owner_id, phone],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some_and(|found| Some(found.as_str()) != except))
}

fn query_contacts(conn: &Connection, owner_id: &str) -> Result<Vec<ContactRow>> {
    let sql = format!(
        "SELECT {} FROM emergency_contacts WHERE owner_id = ?1 ORDER BY priority ASC",
        ContactRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([owner_id], ContactRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_contact(conn: &Connection, owner_id: &str, id: &str) -> Result<Option<ContactRow>> {
    let sql = format!(
        "SELECT {} FROM emergency_contacts WHERE id = ?1 AND owner_id = ?2",
        ContactRow::COLUMNS
    );
    let row = conn.query_row(&sql, [id, owner_id], ContactRow::from_row).optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::test_support;

    fn contact(name: &str, phone: &str, priority: Option<u32>) -> NewContact {
        NewContact {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            phone: phone.into(),
            relation: String::new(),
            priority,
        }
    }

    fn names_and_ranks(db: &Database, owner_id: &str) -> Vec<(String, u32)> {
        db.list_contacts(owner_id)
            .unwrap()
            .into_iter()
            .map(|c| (c.name, c.priority))
            .collect()
    }

    fn add(db: &Database, owner_id: &str, c: &NewContact) -> ContactRow {
        match db.add_contact(owner_id, c).unwrap() {
            ContactInsert::Inserted(row) => row,
            ContactInsert::DuplicatePhone => panic!("duplicate phone"),
        }
    }

    #[test]
    fn explicit_priority_inserts_and_shifts() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");

        add(&db, &owner.id, &contact("Mom", "1", None));
        add(&db, &owner.id, &contact("Dad", "2", None));
        let sis = add(&db, &owner.id, &contact("Sis", "3", Some(1)));
        assert_eq!(sis.priority, 1);
        add(&db, &owner.id, &contact("Far", "4", Some(99)));

        assert_eq!(
            names_and_ranks(&db, &owner.id),
            [("Sis".to_string(), 1), ("Mom".to_string(), 2), ("Dad".to_string(), 3), ("Far".to_string(), 4)]
        );
    }

    #[test]
    fn duplicate_phone_is_rejected_per_owner() {
        let db = test_support::db();
        let a = test_support::user(&db, "a@x.in");
        let b = test_support::user(&db, "b@x.in");

        add(&db, &a.id, &contact("Mom", "555", None));
        assert!(matches!(
            db.add_contact(&a.id, &contact("Mum", "555", None)).unwrap(),
            ContactInsert::DuplicatePhone
        ));
        add(&db, &b.id, &contact("Mom", "555", None));
    }

    #[test]
    fn reorder_assigns_exact_ranks() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let ids: Vec<String> = ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(i, n)| add(&db, &owner.id, &contact(n, &i.to_string(), None)).id)
            .collect();

        let wanted = vec![ids[2].clone(), ids[0].clone(), ids[3].clone(), ids[1].clone()];
        let ReorderOutcome::Reordered(rows) = db.reorder_contacts(&owner.id, &wanted).unwrap() else {
            panic!("reorder should apply");
        };
        let got: Vec<_> = rows.iter().map(|c| (c.id.clone(), c.priority)).collect();
        let expected: Vec<_> = wanted.iter().cloned().zip(1u32..).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn reorder_rejects_non_permutations_without_changes() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        let a = add(&db, &owner.id, &contact("A", "1", None)).id;
        let b = add(&db, &owner.id, &contact("B", "2", None)).id;
        let before = names_and_ranks(&db, &owner.id);

        for bad in [
            vec![a.clone()],
            vec![a.clone(), a.clone()],
            vec![b.clone(), a.clone(), "stranger".to_string()],
            vec![b.clone(), "stranger".to_string()],
        ] {
            assert!(matches!(db.reorder_contacts(&owner.id, &bad).unwrap(), ReorderOutcome::Mismatch));
        }
        assert_eq!(names_and_ranks(&db, &owner.id), before);
    }

    #[test]
    fn delete_resequences_remaining() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        add(&db, &owner.id, &contact("A", "1", None));
        let b = add(&db, &owner.id, &contact("B", "2", None));
        add(&db, &owner.id, &contact("C", "3", None));

        assert!(db.delete_contact(&owner.id, &b.id).unwrap());
        assert!(!db.delete_contact(&owner.id, &b.id).unwrap());
        assert_eq!(names_and_ranks(&db, &owner.id), [("A".to_string(), 1), ("C".to_string(), 2)]);
    }

    #[test]
    fn bulk_skips_known_and_repeated_phones() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        add(&db, &owner.id, &contact("Mom", "1", None));

        let added = db
            .add_contacts_bulk(
                &owner.id,
                &[contact("Mom again", "1", None), contact("Dad", "2", None), contact("Dad dup", "2", None)],
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(names_and_ranks(&db, &owner.id), [("Mom".to_string(), 1), ("Dad".to_string(), 2)]);
    }

    #[test]
    fn update_moves_and_clears_relation() {
        let db = test_support::db();
        let owner = test_support::user(&db, "o@x.in");
        add(&db, &owner.id, &contact("A", "1", None));
        add(&db, &owner.id, &contact("B", "2", None));
        let c = add(
            &db,
            &owner.id,
            &NewContact { relation: "Friend".into(), ..contact("C", "3", None) },
        );

        let change = db
            .update_contact(
                &owner.id,
                &c.id,
                &ContactUpdate { relation: Some(None), priority: Some(1), ..Default::default() },
            )
            .unwrap();
        let ContactChange::Updated(row) = change else { panic!("update should apply") };
        assert_eq!(row.relation, "");
        assert_eq!(row.priority, 1);
        assert_eq!(
            names_and_ranks(&db, &owner.id),
            [("C".to_string(), 1), ("A".to_string(), 2), ("B".to_string(), 3)]
        );

        assert!(matches!(
            db.update_contact(&owner.id, &c.id, &ContactUpdate { phone: Some("1".into()), ..Default::default() })
                .unwrap(),
            ContactChange::DuplicatePhone
        ));
        let other = test_support::user(&db, "p@x.in");
        assert!(matches!(
            db.update_contact(&other.id, &c.id, &ContactUpdate::default()).unwrap(),
            ContactChange::NotFound
        ));
    }
}
