mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use autotrade_api::state::{AppState, AppStateInner};
use autotrade_chat::fcm::FcmNotifier;
use autotrade_chat::{ChatService, LogNotifier, PushNotifier};
use autotrade_db::Database;
use autotrade_gateway::Hub;

use crate::config::{FcmCredentials, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotrade=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    let notifier = push_notifier(&config, db.clone())?;
    let chat = ChatService::new(db, notifier);
    let hub = Hub::new(chat.clone(), config.outbound_capacity);

    let state: AppState = Arc::new(AppStateInner {
        chat,
        hub,
        jwt_secret: config.jwt_secret.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Autotrade chat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    autotrade_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn push_notifier(config: &ServerConfig, db: Arc<Database>) -> anyhow::Result<Arc<dyn PushNotifier>> {
    let json = match &config.fcm {
        Some(FcmCredentials::Json(json)) => json.clone(),
        Some(FcmCredentials::Path(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read FCM credentials from {}", path.display()))?,
        None => {
            warn!("No FCM credentials configured; push notifications will only be logged");
            return Ok(Arc::new(LogNotifier));
        }
    };
    Ok(Arc::new(FcmNotifier::from_service_account_json(db, &json)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use futures_util::{SinkExt, StreamExt};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tokio_tungstenite::tungstenite::Message;
    use uuid::Uuid;

    use autotrade_types::api::Claims;
    use autotrade_types::wire::{WireKind, WireMessage};

    const SECRET: &str = "live-test-secret";

    fn token_for(user_id: Uuid) -> String {
        let claims = Claims {
            sub: user_id,
            exp: (Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    async fn next_frame<S>(socket: &mut S) -> WireMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn message_travels_between_two_live_sockets() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = ChatService::new(db, Arc::new(LogNotifier));
        let hub = Hub::new(chat.clone(), 16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = chat
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();

        let state: AppState = Arc::new(AppStateInner {
            chat: chat.clone(),
            hub: hub.clone(),
            jwt_secret: SECRET.into(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app(state)).await });

        let url = |user| format!("ws://{}/chat/ws?token={}", addr, token_for(user));
        let (mut ws_a, _) = tokio_tungstenite::connect_async(url(a)).await.unwrap();
        let (mut ws_b, _) = tokio_tungstenite::connect_async(url(b)).await.unwrap();

        while hub.online_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let outgoing = WireMessage::new(WireKind::Message, conv.id, Uuid::nil()).with_content("is it available?");
        ws_a.send(Message::Text(serde_json::to_string(&outgoing).unwrap().into()))
            .await
            .unwrap();

        let received = next_frame(&mut ws_b).await;
        assert_eq!(received.kind, WireKind::Message);
        assert_eq!(received.sender_id, a);
        assert_eq!(received.content, "is it available?");

        let echo = next_frame(&mut ws_a).await;
        assert_eq!(echo.kind, WireKind::ConversationUpdated);

        assert_eq!(chat.history(conv.id, None, None).await.unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_socket() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = ChatService::new(db, Arc::new(LogNotifier));
        let hub = Hub::new(chat.clone(), 16);
        let state: AppState = Arc::new(AppStateInner {
            chat,
            hub: hub.clone(),
            jwt_secret: SECRET.into(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app(state)).await });

        let user = Uuid::new_v4();
        let url = format!("ws://{}/chat/ws?token={}", addr, token_for(user));
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        while !hub.is_online(user).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let body = format!(r#"{{"type":"typing","content":"{}"}}"#, "x".repeat(9000));
        let _ = ws.send(Message::Text(body.into())).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .expect("socket stayed open after an oversized frame");

        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.is_online(user).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("user still online after the socket closed");
    }

    #[tokio::test]
    async fn upgrade_without_token_is_refused() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = ChatService::new(db, Arc::new(LogNotifier));
        let state: AppState = Arc::new(AppStateInner {
            hub: Hub::new(chat.clone(), 16),
            chat,
            jwt_secret: SECRET.into(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app(state)).await });

        let result = tokio_tungstenite::connect_async(format!("ws://{}/chat/ws", addr)).await;
        assert!(result.is_err());
    }
}
