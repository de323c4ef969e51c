use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::SaltString,
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{EncodingKey, Header, encode};
use rand::Rng;
use rand_core::OsRng;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use safetag_db::models::{GoogleProfile, NewUser, ProfileChange, ProfileUpdate, UserInsert};
use safetag_types::api::{
    AuthResponse, Claims, GoogleSignInRequest, LoginRequest, ProfileResponse, RegisterRequest,
    UpdateProfileRequest,
};

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::AuthUser;
use crate::state::{AppState, success};

const TOKEN_TTL_DAYS: i64 = 30;
const MIN_PASSWORD_LEN: usize = 6;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = req.name.trim().to_string();
    let email = req.email.trim().to_lowercase();
    let phone = req.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".into()));
    }
    if !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required".into()));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let password_hash = hash_password(&req.password)?;
    let new_user = NewUser {
        id: Uuid::new_v4().to_string(),
        name,
        email,
        phone,
        password_hash,
    };

    let user = match state.store(move |db| db.create_user(&new_user)).await? {
        UserInsert::Created(user) => user,
        UserInsert::EmailTaken => return Err(AppError::Conflict("Email is already registered".into())),
        UserInsert::PhoneTaken => return Err(AppError::Conflict("Phone is already registered".into())),
    };

    let profile = convert::user_profile(&user)?;
    let token = issue_token(&state.jwt_secret, profile.id, &profile.name)?;
    info!("Registered user {} ({})", profile.name, profile.id);

    Ok((StatusCode::CREATED, success(AuthResponse { token, user: profile })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let email = req.email.trim().to_lowercase();
    let user = state
        .store(move |db| db.get_user_by_email(&email))
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid email or password".into()))?;

    // Accounts created through Google have no password to check.
    let stored = user
        .password
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("Invalid email or password".into()))?;
    let parsed_hash = PasswordHash::new(stored)
        .map_err(|e| anyhow::anyhow!("stored password hash is malformed: {}", e))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Unauthorized("Invalid email or password".into()))?;

    let profile = convert::user_profile(&user)?;
    let token = issue_token(&state.jwt_secret, profile.id, &profile.name)?;

    Ok(success(AuthResponse { token, user: profile }))
}

/// The subset of Google's tokeninfo answer sign-in needs.
#[derive(Debug, Deserialize)]
struct GoogleTokenInfo {
    sub: String,
    aud: Option<String>,
    email: Option<String>,
    /// tokeninfo sends this as the string "true" or "false".
    email_verified: Option<serde_json::Value>,
    name: Option<String>,
    picture: Option<String>,
}

impl GoogleTokenInfo {
    fn email_unverified(&self) -> bool {
        match &self.email_verified {
            Some(serde_json::Value::Bool(verified)) => !verified,
            Some(serde_json::Value::String(verified)) => verified == "false",
            _ => false,
        }
    }
}

/// Sign in (or sign up) with a Google ID token. An existing account with the
/// same email is linked to the Google identity rather than duplicated.
pub async fn google_sign_in(
    State(state): State<AppState>,
    Json(req): Json<GoogleSignInRequest>,
) -> ApiResult<impl IntoResponse> {
    let id_token = req.id_token.trim();
    if id_token.is_empty() {
        return Err(AppError::BadRequest("ID token is required".into()));
    }

    let info = verify_google_token(&state, id_token).await?;
    if let Some(client_id) = &state.settings.google_client_id {
        if info.aud.as_deref() != Some(client_id.as_str()) {
            warn!("Google token for {} was issued to another client", info.sub);
            return Err(AppError::Unauthorized("Invalid Google ID token".into()));
        }
    }
    if info.email_unverified() {
        return Err(AppError::Unauthorized("Google has not verified this email".into()));
    }
    let email = info
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::BadRequest("Email not provided by Google".into()))?;

    let name = info
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
    let profile = GoogleProfile {
        google_id: info.sub,
        email,
        name,
        avatar_url: info.picture.filter(|p| !p.is_empty()),
    };

    let new_id = Uuid::new_v4().to_string();
    let user = state
        .store(move |db| db.sign_in_with_google(&new_id, &profile))
        .await?;

    let profile = convert::user_profile(&user)?;
    let token = issue_token(&state.jwt_secret, profile.id, &profile.name)?;
    info!("{} ({}) signed in with Google", profile.name, profile.id);

    Ok(success(AuthResponse { token, user: profile }))
}

async fn verify_google_token(state: &AppState, id_token: &str) -> ApiResult<GoogleTokenInfo> {
    let resp = state
        .http
        .get(state.settings.google_tokeninfo_url.as_str())
        .query(&[("id_token", id_token)])
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Google tokeninfo request failed: {}", e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        warn!("Google rejected an ID token ({}): {}", status, body);
        return Err(AppError::Unauthorized("Invalid Google ID token".into()));
    }

    let info = resp
        .json::<GoogleTokenInfo>()
        .await
        .map_err(|e| anyhow::anyhow!("unexpected tokeninfo response: {}", e))?;
    Ok(info)
}

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    let (user, (qr_count, contact_count)) = state
        .store(move |db| {
            let user = db.get_user_by_id(&user_id)?;
            let counts = db.get_user_counts(&user_id)?;
            Ok((user, counts))
        })
        .await?;
    let user = user.ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(success(ProfileResponse {
        user: convert::user_profile(&user)?,
        qr_count,
        contact_count,
    }))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = match req.name {
        Some(name) if name.trim().is_empty() => {
            return Err(AppError::BadRequest("Name cannot be empty".into()));
        }
        other => other.map(|n| n.trim().to_string()),
    };
    let update = ProfileUpdate {
        name,
        phone: req
            .phone
            .map(|p| p.map(|p| p.trim().to_string()).filter(|p| !p.is_empty())),
        avatar_url: req.avatar_url,
    };

    let user_id = auth.id.to_string();
    let user = match state.store(move |db| db.update_profile(&user_id, &update)).await? {
        ProfileChange::Updated(user) => user,
        ProfileChange::NotFound => return Err(AppError::NotFound("User not found".into())),
        ProfileChange::PhoneTaken => return Err(AppError::Conflict("Phone is already registered".into())),
    };

    Ok(success(serde_json::json!({ "user": convert::user_profile(&user)? })))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    if !state.store(move |db| db.delete_user(&user_id)).await? {
        return Err(AppError::NotFound("User not found".into()));
    }
    info!("Deleted account {}", auth.id);

    Ok(success(serde_json::json!({ "message": "Account deleted" })))
}

// -- Credentials --

fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

pub fn issue_token(secret: &str, user_id: Uuid, name: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        name: name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// A fresh bearer secret for the stranger side of one chat session.
pub fn new_stranger_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
