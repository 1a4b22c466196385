//! Firebase Cloud Messaging (HTTP v1) implementation of [`PushNotifier`].
//!
//! Device tokens come from `user_devices`. Access tokens are minted by
//! signing an RS256 assertion with the service-account key and exchanging it
//! at Google's token endpoint; the result is cached until shortly before it
//! expires.

use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use autotrade_db::Database;

use crate::push::{PushNotification, PushNotifier};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Cached access tokens are refreshed this many seconds before expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The subset of a Google service-account JSON key we need.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Clone)]
struct TokenCache {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    expires_in: i64,
}

pub struct FcmNotifier {
    db: Arc<Database>,
    credentials: ServiceAccountKey,
    token_cache: Mutex<Option<TokenCache>>,
    http_client: reqwest::Client,
}

impl FcmNotifier {
    pub fn new(db: Arc<Database>, credentials: ServiceAccountKey) -> Self {
        Self {
            db,
            credentials,
            token_cache: Mutex::new(None),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn from_service_account_json(db: Arc<Database>, json: &str) -> anyhow::Result<Self> {
        let credentials: ServiceAccountKey =
            serde_json::from_str(json).context("Invalid FCM service account JSON")?;
        info!("FCM push enabled for project {}", credentials.project_id);
        Ok(Self::new(db, credentials))
    }

    fn cached_token(&self) -> Option<String> {
        let cache = self.token_cache.lock().ok()?;
        let cached = cache.as_ref()?;
        (cached.expires_at > Utc::now().timestamp() + TOKEN_REFRESH_MARGIN_SECS)
            .then(|| cached.access_token.clone())
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &self.credentials.client_email,
            sub: &self.credentials.client_email,
            scope: FCM_SCOPE,
            aud: &self.credentials.token_uri,
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
        };

        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .context("Failed to parse service account private key")?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let response = self
            .http_client
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Token request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("Token request failed with status {}", response.status()));
        }

        let token: GoogleTokenResponse = response.json().await?;

        if let Ok(mut cache) = self.token_cache.lock() {
            *cache = Some(TokenCache {
                access_token: token.access_token.clone(),
                expires_at: Utc::now().timestamp() + token.expires_in,
            });
        }

        Ok(token.access_token)
    }

    async fn send_one(
        &self,
        access_token: &str,
        device_token: &str,
        notification: &PushNotification,
    ) -> anyhow::Result<()> {
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.credentials.project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&fcm_message(device_token, notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("FCM API error: {} - {}", status, body));
        }
        Ok(())
    }

    async fn deliver(&self, user_ids: &[Uuid], notification: &PushNotification) -> anyhow::Result<()> {
        let db = self.db.clone();
        let ids: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();
        let tokens = tokio::task::spawn_blocking(move || db.get_device_tokens(&ids)).await??;

        if tokens.is_empty() {
            info!("No push tokens registered for {} user(s)", user_ids.len());
            return Ok(());
        }

        let access_token = self.access_token().await?;

        let mut sent = 0usize;
        for (i, token) in tokens.iter().enumerate() {
            match self.send_one(&access_token, token, notification).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("FCM: failed to send to token[{}]: {}", i, e),
            }
        }

        info!("FCM: sent {}/{} notifications", sent, tokens.len());
        Ok(())
    }
}

impl PushNotifier for FcmNotifier {
    fn send_to_users<'a>(
        &'a self,
        user_ids: &'a [Uuid],
        notification: &'a PushNotification,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.deliver(user_ids, notification))
    }
}

/// Request body for `messages:send`, with the Android channel and APNs
/// sound/badge the mobile clients expect for chat.
fn fcm_message(device_token: &str, notification: &PushNotification) -> serde_json::Value {
    serde_json::json!({
        "message": {
            "token": device_token,
            "notification": {
                "title": notification.title,
                "body": notification.body,
            },
            "data": notification.data,
            "android": {
                "priority": "high",
                "notification": {
                    "click_action": "FLUTTER_NOTIFICATION_CLICK",
                    "channel_id": "chat_messages",
                },
            },
            "apns": {
                "headers": { "apns-priority": "10" },
                "payload": {
                    "aps": {
                        "alert": {
                            "title": notification.title,
                            "body": notification.body,
                        },
                        "sound": "default",
                        "badge": 1,
                    },
                },
            },
        }
    })
}
