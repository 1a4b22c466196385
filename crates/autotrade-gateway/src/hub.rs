use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use autotrade_chat::ChatService;
use autotrade_types::wire::{WireKind, WireMessage};

/// Outbound frames a connection may have queued before the hub treats the
/// user as unreachable and falls back to push.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Who a routed frame is for. The sender is always skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every participant of the frame's conversation.
    Participants,
    /// An explicit set of users, e.g. the author of a delivered message.
    Users(Vec<Uuid>),
}

/// Handed to a connection on registration. `receiver` closes when the hub
/// drops this connection (unregistered or replaced by a newer one).
pub struct Registration {
    pub conn_id: Uuid,
    pub receiver: mpsc::Receiver<WireMessage>,
}

struct Entry {
    conn_id: Uuid,
    sender: mpsc::Sender<WireMessage>,
}

enum Command {
    Register {
        user_id: Uuid,
        conn_id: Uuid,
        sender: mpsc::Sender<WireMessage>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        user_id: Uuid,
        conn_id: Uuid,
        ack: oneshot::Sender<bool>,
    },
    Route {
        message: WireMessage,
        audience: Audience,
    },
    SendTo {
        user_id: Uuid,
        message: WireMessage,
    },
}

/// Owns the directory of live connections and every frame sent to them.
///
/// All mutations go through a single control loop, so registration,
/// unregistration and routing are applied in the order they were issued.
/// The directory holds the only sender of each connection's outbound
/// queue; dropping an entry is what closes the queue.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    commands: mpsc::UnboundedSender<Command>,
    directory: Arc<RwLock<HashMap<Uuid, Entry>>>,
    service: ChatService,
    outbound_capacity: usize,
}

impl Hub {
    /// Spawns the control loop on the current runtime. The loop exits once
    /// every `Hub` handle is dropped.
    pub fn new(service: ChatService, outbound_capacity: usize) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let directory = Arc::new(RwLock::new(HashMap::new()));

        let control = ControlLoop {
            directory: directory.clone(),
            service: service.clone(),
            commands: commands.downgrade(),
        };
        tokio::spawn(control.run(rx));

        Self {
            inner: Arc::new(HubInner {
                commands,
                directory,
                service,
                outbound_capacity: outbound_capacity.max(1),
            }),
        }
    }

    pub fn service(&self) -> &ChatService {
        &self.inner.service
    }

    /// Adds a connection for `user_id`, replacing (and closing) any previous
    /// one. Returns once the hub has applied it.
    pub async fn register(&self, user_id: Uuid) -> Registration {
        let conn_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.inner.outbound_capacity);
        let (ack, done) = oneshot::channel();
        self.submit(Command::Register {
            user_id,
            conn_id,
            sender,
            ack,
        });
        let _ = done.await;
        Registration { conn_id, receiver }
    }

    /// Removes the user's connection, but only if `conn_id` is still the
    /// current one. Returns whether anything was removed.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let (ack, done) = oneshot::channel();
        self.submit(Command::Unregister { user_id, conn_id, ack });
        done.await.unwrap_or(false)
    }

    /// Queues `message` for fan-out to `audience`.
    pub fn route(&self, message: WireMessage, audience: Audience) {
        self.submit(Command::Route { message, audience });
    }

    /// Queues `message` for one user's live connection, if any.
    pub fn send_to(&self, user_id: Uuid, message: WireMessage) {
        self.submit(Command::SendTo { user_id, message });
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.directory.read().await.contains_key(&user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.inner.directory.read().await.len()
    }

    fn submit(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            error!("Hub control loop is gone; dropping command");
        }
    }
}

struct ControlLoop {
    directory: Arc<RwLock<HashMap<Uuid, Entry>>>,
    service: ChatService,
    /// Weak so the loop does not keep its own channel open.
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ControlLoop {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register {
                    user_id,
                    conn_id,
                    sender,
                    ack,
                } => {
                    self.register(user_id, conn_id, sender).await;
                    let _ = ack.send(());
                }
                Command::Unregister { user_id, conn_id, ack } => {
                    let removed = self.unregister(user_id, conn_id).await;
                    let _ = ack.send(removed);
                }
                Command::Route { message, audience } => self.route(message, audience).await,
                Command::SendTo { user_id, message } => {
                    let directory = self.directory.read().await;
                    if deliver(&directory, user_id, message).is_err() {
                        debug!("Direct frame for {} not delivered", user_id);
                    }
                }
            }
        }
        debug!("Hub control loop stopped");
    }

    async fn register(&self, user_id: Uuid, conn_id: Uuid, sender: mpsc::Sender<WireMessage>) {
        let previous = self
            .directory
            .write()
            .await
            .insert(user_id, Entry { conn_id, sender });
        match previous {
            Some(old) => info!(
                "User {} reconnected; closing connection {} in favour of {}",
                user_id, old.conn_id, conn_id
            ),
            None => info!("User {} online ({})", user_id, conn_id),
        }
    }

    async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut directory = self.directory.write().await;
        match directory.get(&user_id) {
            Some(entry) if entry.conn_id == conn_id => {
                directory.remove(&user_id);
                info!("User {} offline ({})", user_id, conn_id);
                true
            }
            _ => false,
        }
    }

    async fn route(&self, message: WireMessage, audience: Audience) {
        let recipients = match audience {
            Audience::Participants => match self.service.participant_ids(message.conversation_id).await {
                Ok(ids) if ids.contains(&message.sender_id) => ids,
                Ok(_) => {
                    warn!(
                        "Dropping {} from {}: not a participant of {}",
                        message.kind, message.sender_id, message.conversation_id
                    );
                    return;
                }
                Err(e) => {
                    error!("Failed to resolve participants of {}: {}", message.conversation_id, e);
                    return;
                }
            },
            Audience::Users(ids) => ids,
        };

        let mut seen = HashSet::new();
        let mut delivered = Vec::new();
        let mut missed = Vec::new();
        {
            let directory = self.directory.read().await;
            for user_id in recipients {
                if user_id == message.sender_id || !seen.insert(user_id) {
                    continue;
                }
                match deliver(&directory, user_id, message.clone()) {
                    Ok(()) => delivered.push(user_id),
                    Err(()) => missed.push(user_id),
                }
            }

            if message.kind == WireKind::Message {
                let echo = WireMessage::conversation_updated(&message);
                for user_id in delivered.iter().chain(std::iter::once(&message.sender_id)) {
                    let _ = deliver(&directory, *user_id, echo.clone());
                }
            }
        }

        if message.kind != WireKind::Message {
            return;
        }

        if !missed.is_empty() {
            debug!("{} recipient(s) of {} unreachable; pushing", missed.len(), message.conversation_id);
            let service = self.service.clone();
            tokio::spawn(async move { service.send_push(missed, &message).await });
        }

        for user_id in delivered {
            let service = self.service.clone();
            let commands = self.commands.clone();
            tokio::spawn(async move {
                match service.total_unread(user_id).await {
                    Ok(total) => {
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands.send(Command::SendTo {
                                user_id,
                                message: WireMessage::unread_update(total),
                            });
                        }
                    }
                    Err(e) => warn!("Failed to refresh unread count for {}: {}", user_id, e),
                }
            });
        }
    }
}

/// Non-blocking hand-off to a user's queue. Offline, full and closed queues
/// all count as not delivered.
fn deliver(directory: &HashMap<Uuid, Entry>, user_id: Uuid, message: WireMessage) -> Result<(), ()> {
    let Some(entry) = directory.get(&user_id) else {
        return Err(());
    };
    match entry.sender.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue of {} is full", user_id);
            Err(())
        }
        Err(TrySendError::Closed(_)) => Err(()),
    }
}
