use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use serde::Serialize;
use tracing::error;

use safetag_db::Database;
use safetag_gateway::Rooms;

use crate::error::AppError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub rooms: Rooms,
    pub jwt_secret: String,
    pub settings: Settings,
    /// Outbound client for Google token verification.
    pub http: reqwest::Client,
}

/// Tunables the handlers and the sweeper read at runtime.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Public base URL of the web app; scan links are `<app_url>/scan/<code>`.
    pub app_url: String,
    pub qr_validity_days: i64,
    pub session_idle_hours: i64,
    pub ring_timeout_secs: i64,
    /// When set, Google ID tokens must carry this audience.
    pub google_client_id: Option<String>,
    pub google_tokeninfo_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:3000".into(),
            qr_validity_days: 365,
            session_idle_hours: 24,
            ring_timeout_secs: 45,
            google_client_id: None,
            google_tokeninfo_url: "https://oauth2.googleapis.com/tokeninfo".into(),
        }
    }
}

impl AppStateInner {
    pub fn new(
        db: Database,
        rooms: Rooms,
        jwt_secret: impl Into<String>,
        settings: Settings,
    ) -> anyhow::Result<AppState> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Arc::new(Self {
            db: Arc::new(db),
            rooms,
            jwt_secret: jwt_secret.into(),
            settings,
            http,
        }))
    }

    /// Run a store call off the async runtime.
    pub async fn store<F, T>(self: &Arc<Self>, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || f(state.db.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                AppError::Upstream(anyhow::anyhow!("blocking task failed: {}", e))
            })?
            .map_err(AppError::from)
    }
}

/// Response envelope: the body's fields with a `success` flag alongside.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

pub fn success<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, body })
}

/// A business-rule refusal the client renders itself. Still a 200.
pub fn refusal<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { success: false, body })
}
