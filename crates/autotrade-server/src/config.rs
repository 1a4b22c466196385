use std::path::PathBuf;

use anyhow::{Context, bail};

use autotrade_gateway::DEFAULT_OUTBOUND_CAPACITY;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

/// Where push credentials come from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcmCredentials {
    Path(PathBuf),
    Json(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub fcm: Option<FcmCredentials>,
    pub outbound_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = var("AUTOTRADE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("AUTOTRADE_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let port = var("AUTOTRADE_PORT")
            .unwrap_or_else(|| "8080".into())
            .parse()
            .context("AUTOTRADE_PORT is not a valid port")?;

        let outbound_capacity = match var("AUTOTRADE_OUTBOUND_CAPACITY") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => bail!("AUTOTRADE_OUTBOUND_CAPACITY must be a positive integer, got '{}'", raw),
            },
            None => DEFAULT_OUTBOUND_CAPACITY,
        };

        let fcm = match (var("AUTOTRADE_FCM_CREDENTIALS_JSON"), var("AUTOTRADE_FCM_CREDENTIALS_PATH")) {
            (Some(json), _) if !json.trim().is_empty() => Some(FcmCredentials::Json(json)),
            (_, Some(path)) if !path.trim().is_empty() => Some(FcmCredentials::Path(path.into())),
            _ => None,
        };

        Ok(Self {
            host: var("AUTOTRADE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("AUTOTRADE_DB_PATH").unwrap_or_else(|| "autotrade-chat.db".into()).into(),
            jwt_secret,
            fcm,
            outbound_capacity,
        })
    }
}
