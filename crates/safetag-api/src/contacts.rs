use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use safetag_db::models::{ContactChange, ContactInsert, ContactUpdate, NewContact, ReorderOutcome};
use safetag_types::api::{
    BulkContactsRequest, NewContactRequest, ReorderContactsRequest, UpdateContactRequest,
};

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::AuthUser;
use crate::state::{AppState, success};

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Name and phone are required; everything else is optional.
fn to_new_contact(req: NewContactRequest) -> Option<NewContact> {
    Some(NewContact {
        id: Uuid::new_v4().to_string(),
        name: trimmed(req.name)?,
        phone: trimmed(req.phone)?,
        relation: trimmed(req.relation).unwrap_or_default(),
        priority: req.priority,
    })
}

pub async fn list_contacts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let owner_id = auth.id.to_string();
    let rows = state.store(move |db| db.list_contacts(&owner_id)).await?;
    let contacts = convert::all(&rows, convert::contact)?;

    Ok(success(json!({ "contacts": contacts })))
}

pub async fn add_contact(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<NewContactRequest>,
) -> ApiResult<impl IntoResponse> {
    let contact =
        to_new_contact(req).ok_or_else(|| AppError::BadRequest("Name and phone are required".into()))?;

    let owner_id = auth.id.to_string();
    let row = match state.store(move |db| db.add_contact(&owner_id, &contact)).await? {
        ContactInsert::Inserted(row) => row,
        ContactInsert::DuplicatePhone => {
            return Err(AppError::Conflict("A contact with this phone already exists".into()));
        }
    };

    Ok((StatusCode::CREATED, success(json!({ "contact": convert::contact(&row)? }))))
}

/// Device address-book sync. Incomplete entries and known phones are skipped.
pub async fn add_contacts_bulk(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<BulkContactsRequest>,
) -> ApiResult<impl IntoResponse> {
    let contacts: Vec<NewContact> = req.contacts.into_iter().filter_map(to_new_contact).collect();

    let owner_id = auth.id.to_string();
    let (added, rows) = state
        .store(move |db| {
            let added = db.add_contacts_bulk(&owner_id, &contacts)?;
            Ok((added, db.list_contacts(&owner_id)?))
        })
        .await?;

    Ok(success(json!({
        "addedCount": added,
        "contacts": convert::all(&rows, convert::contact)?,
    })))
}

pub async fn update_contact(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(contact_id): Path<Uuid>,
    Json(req): Json<UpdateContactRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty())
        || req.phone.as_deref().is_some_and(|p| p.trim().is_empty())
    {
        return Err(AppError::BadRequest("Name and phone cannot be empty".into()));
    }

    let update = ContactUpdate {
        name: trimmed(req.name),
        phone: trimmed(req.phone),
        relation: req.relation.map(trimmed),
        priority: req.priority,
    };

    let owner_id = auth.id.to_string();
    let id = contact_id.to_string();
    let row = match state.store(move |db| db.update_contact(&owner_id, &id, &update)).await? {
        ContactChange::Updated(row) => row,
        ContactChange::NotFound => return Err(AppError::NotFound("Contact not found".into())),
        ContactChange::DuplicatePhone => {
            return Err(AppError::Conflict("A contact with this phone already exists".into()));
        }
    };

    Ok(success(json!({ "contact": convert::contact(&row)? })))
}

pub async fn reorder_contacts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<ReorderContactsRequest>,
) -> ApiResult<impl IntoResponse> {
    let ordered: Vec<String> = req.ordered_ids.iter().map(Uuid::to_string).collect();

    let owner_id = auth.id.to_string();
    let rows = match state.store(move |db| db.reorder_contacts(&owner_id, &ordered)).await? {
        ReorderOutcome::Reordered(rows) => rows,
        ReorderOutcome::Mismatch => {
            return Err(AppError::BadRequest(
                "orderedIds must list each of your contacts exactly once".into(),
            ));
        }
    };

    Ok(success(json!({ "contacts": convert::all(&rows, convert::contact)? })))
}

pub async fn delete_contact(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(contact_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let owner_id = auth.id.to_string();
    let id = contact_id.to_string();
    if !state.store(move |db| db.delete_contact(&owner_id, &id)).await? {
        return Err(AppError::NotFound("Contact not found".into()));
    }

    Ok(success(json!({ "message": "Contact deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_contacts_are_dropped() {
        let ok = NewContactRequest {
            name: Some(" Mom ".into()),
            phone: Some("+91 98450".into()),
            ..Default::default()
        };
        let contact = to_new_contact(ok).unwrap();
        assert_eq!(contact.name, "Mom");
        assert_eq!(contact.relation, "");

        assert!(to_new_contact(NewContactRequest { name: Some("Dad".into()), ..Default::default() }).is_none());
        assert!(
            to_new_contact(NewContactRequest {
                name: Some("  ".into()),
                phone: Some("1".into()),
                ..Default::default()
            })
            .is_none()
        );
    }
}
