use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use autotrade_types::wire::WireMessage;

use crate::hub::Hub;
use crate::inbound;

/// Time allowed to write a single frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// The peer must send something (a pong at least) within this window.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Pings go out a little more often than `PONG_WAIT` so a healthy peer
/// always answers in time.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Largest inbound frame/message accepted, in bytes. Applied at upgrade.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Consecutive undecodable text frames tolerated before hanging up.
pub const MAX_MALFORMED_FRAMES: u32 = 20;

/// Why the read side of a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// Close frame or end of stream.
    Closed,
    /// Nothing arrived within [`PONG_WAIT`].
    Idle,
    /// Too many undecodable frames in a row.
    Malformed,
    /// Transport error, including oversized frames.
    Transport,
}

/// Drives an authenticated socket until either side gives up, then removes
/// it from the hub.
pub async fn handle_connection(socket: WebSocket, hub: Hub, user_id: Uuid) {
    let (sender, receiver) = socket.split();
    let registration = hub.register(user_id).await;
    let conn_id = registration.conn_id;

    info!("{} connected to chat ({})", user_id, conn_id);

    let mut send_task = tokio::spawn(write_pump(sender, registration.receiver, user_id));
    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move { read_pump(receiver, &recv_hub, user_id).await });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        result = &mut recv_task => {
            if let Ok(reason) = result {
                debug!("{} read side ended: {:?}", user_id, reason);
            }
            send_task.abort();
        }
    }

    hub.unregister(user_id, conn_id).await;
    info!("{} disconnected from chat ({})", user_id, conn_id);
}

/// Reads frames and dispatches them in arrival order. Any inbound frame
/// resets the idle deadline.
pub async fn read_pump<S, E>(mut receiver: S, hub: &Hub, user_id: Uuid) -> ReadEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut malformed = 0u32;

    loop {
        let msg = match tokio::time::timeout(PONG_WAIT, receiver.next()).await {
            Err(_) => {
                warn!("{} idle for {:?}, dropping connection", user_id, PONG_WAIT);
                return ReadEnd::Idle;
            }
            Ok(None) => return ReadEnd::Closed,
            Ok(Some(Err(e))) => {
                debug!("Read error from {}: {}", user_id, e);
                return ReadEnd::Transport;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<WireMessage>(&text) {
                Ok(frame) => {
                    malformed = 0;
                    inbound::handle_frame(hub, user_id, frame).await;
                }
                Err(e) => {
                    malformed += 1;
                    let preview: String = text.chars().take(200).collect();
                    warn!("Bad frame from {} ({}/{}): {} -- raw: {}", user_id, malformed, MAX_MALFORMED_FRAMES, e, preview);
                    if malformed >= MAX_MALFORMED_FRAMES {
                        return ReadEnd::Malformed;
                    }
                }
            },
            Message::Close(_) => return ReadEnd::Closed,
            // Pings are answered by the transport; pongs only refresh the deadline.
            _ => {}
        }
    }
}

/// Writes queued frames and heartbeat pings. Sends a close frame once the
/// hub drops the queue.
pub async fn write_pump<S>(mut sender: S, mut outbound: mpsc::Receiver<WireMessage>, user_id: Uuid)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut heartbeat = tokio::time::interval(PING_PERIOD);
    heartbeat.tick().await;

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => {
                let Some(msg) = next else {
                    let _ = tokio::time::timeout(WRITE_WAIT, sender.send(Message::Close(None))).await;
                    debug!("Outbound queue of {} closed", user_id);
                    break;
                };
                match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!("Failed to encode {} for {}: {}", msg.kind, user_id, e);
                        continue;
                    }
                }
            }
            _ = heartbeat.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(WRITE_WAIT, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write to {} failed: {}", user_id, e);
                break;
            }
            Err(_) => {
                warn!("Write to {} timed out", user_id);
                break;
            }
        }
    }
}
