use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use safetag_db::hash_stranger_token;
use safetag_db::models::ChatSessionRow;
use safetag_types::api::Claims;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the stranger's session token on stranger-side routes.
pub const STRANGER_TOKEN_HEADER: &str = "x-stranger-token";

/// The owner behind a verified bearer token. Inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub name: String,
}

/// Who is making a request on routes open to both sides of a conversation.
#[derive(Debug, Clone)]
pub enum Party {
    Owner(AuthUser),
    Stranger(ChatSessionRow),
}

/// Reject requests without a valid bearer token for an existing user.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.map_err(|_| AppError::Unauthorized("Missing bearer token".into()))?;

    let user = authenticate(&state, bearer.token()).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Verify a bearer token and make sure its subject still exists.
pub async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, AppError> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("Invalid or expired token".into()))?
    .claims;

    let user_id = claims.sub.to_string();
    let user = state
        .store(move |db| db.get_user_by_id(&user_id))
        .await?
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists".into()))?;

    Ok(AuthUser { id: claims.sub, name: user.name })
}

/// Look up the chat session a stranger token was issued for.
pub async fn authenticate_stranger(state: &AppState, token: &str) -> Result<ChatSessionRow, AppError> {
    if token.is_empty() {
        return Err(AppError::Unauthorized("Missing stranger token".into()));
    }
    let hash = hash_stranger_token(token);
    state
        .store(move |db| db.get_session_by_token_hash(&hash))
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid stranger token".into()))
}

pub fn stranger_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(STRANGER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the caller on mixed routes. A bearer token wins over a stranger
/// token when both are present.
pub async fn resolve_party(
    state: &AppState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: &HeaderMap,
) -> Result<Party, AppError> {
    if let Some(TypedHeader(Authorization(bearer))) = bearer {
        return authenticate(state, bearer.token()).await.map(Party::Owner);
    }
    match stranger_token(headers) {
        Some(token) => authenticate_stranger(state, token).await.map(Party::Stranger),
        None => Err(AppError::Unauthorized("Authentication required".into())),
    }
}
