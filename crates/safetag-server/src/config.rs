use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};

use safetag_api::state::Settings;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub sweep_interval_secs: u64,
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("SAFETAG_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("SAFETAG_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let host = lookup("SAFETAG_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&lookup, "SAFETAG_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("SAFETAG_HOST is not a valid address: {}", host))?;

        let defaults = Settings::default();
        let settings = Settings {
            app_url: lookup("SAFETAG_APP_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.app_url),
            qr_validity_days: positive(&lookup, "SAFETAG_QR_VALIDITY_DAYS", defaults.qr_validity_days)?,
            session_idle_hours: positive(&lookup, "SAFETAG_SESSION_IDLE_HOURS", defaults.session_idle_hours)?,
            ring_timeout_secs: positive(&lookup, "SAFETAG_RING_TIMEOUT_SECS", defaults.ring_timeout_secs)?,
            google_client_id: lookup("SAFETAG_GOOGLE_CLIENT_ID")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            google_tokeninfo_url: lookup("SAFETAG_GOOGLE_TOKENINFO_URL")
                .unwrap_or(defaults.google_tokeninfo_url),
        };

        let sweep_interval_secs: u64 = parse(&lookup, "SAFETAG_SWEEP_INTERVAL_SECS", 30)?;
        if sweep_interval_secs == 0 {
            bail!("SAFETAG_SWEEP_INTERVAL_SECS must be at least 1");
        }

        Ok(Self {
            addr,
            db_path: lookup("SAFETAG_DB_PATH").unwrap_or_else(|| "safetag.db".into()).into(),
            jwt_secret,
            sweep_interval_secs,
            settings,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: i64) -> anyhow::Result<i64> {
    let value = parse(lookup, key, default)?;
    if value <= 0 {
        bail!("{} must be positive, got {}", key, value);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let config = config(&[("SAFETAG_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("safetag.db"));
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.settings.qr_validity_days, 365);
        assert_eq!(config.settings.session_idle_hours, 24);
        assert_eq!(config.settings.ring_timeout_secs, 45);
        assert_eq!(config.settings.google_client_id, None);
        assert_eq!(config.settings.google_tokeninfo_url, "https://oauth2.googleapis.com/tokeninfo");
    }

    #[test]
    fn blank_google_client_id_is_unset() {
        let config = config(&[
            ("SAFETAG_JWT_SECRET", "s3cret"),
            ("SAFETAG_GOOGLE_CLIENT_ID", "  "),
        ])
        .unwrap();
        assert_eq!(config.settings.google_client_id, None);

        let config = config_with_client("web.apps.googleusercontent.com");
        assert_eq!(config.settings.google_client_id.as_deref(), Some("web.apps.googleusercontent.com"));
    }

    fn config_with_client(id: &str) -> Config {
        config(&[("SAFETAG_JWT_SECRET", "s3cret"), ("SAFETAG_GOOGLE_CLIENT_ID", id)]).unwrap()
    }

    #[test]
    fn placeholder_secrets_are_refused() {
        assert!(config(&[]).is_err());
        assert!(config(&[("SAFETAG_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let err = config(&[("SAFETAG_JWT_SECRET", "s3cret"), ("SAFETAG_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("SAFETAG_PORT"));

        let err = config(&[("SAFETAG_JWT_SECRET", "s3cret"), ("SAFETAG_RING_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("SAFETAG_RING_TIMEOUT_SECS"));
    }

    #[test]
    fn app_url_loses_trailing_slash() {
        let config = config(&[
            ("SAFETAG_JWT_SECRET", "s3cret"),
            ("SAFETAG_APP_URL", "https://safetag.in/"),
            ("SAFETAG_PORT", "8080"),
        ])
        .unwrap();
        assert_eq!(config.settings.app_url, "https://safetag.in");
        assert_eq!(config.addr.port(), 8080);
    }
}
