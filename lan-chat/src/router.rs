use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    message::{Message, Recipient},
    registry::{ConnectionHandle, Registry},
};

/// Result of routing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Number of connections the message was queued for.
    Delivered(usize),
    /// Nothing was delivered: offline recipient, or a tag clients may not send.
    Dropped,
    /// The sender asked to leave; the session should tear down.
    Disconnect,
}

/// Stateless dispatch on top of the registry.
///
/// Handles are copied out of the registry and the lock is released before any
/// delivery, so a stalled peer never blocks other sessions.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Routes a message received from the session bound to `origin`. The
    /// message's sender is stamped with `origin` before it is relayed.
    pub async fn route(&self, origin: &str, message: Message) -> Routed {
        let message = message.with_sender(origin);
        match message {
            Message::BroadcastChat { ref content, .. } => {
                info!(sender = origin, %content, "broadcast chat");
                self.to_everyone(message, None).await
            }
            Message::PrivateChat { ref recipient, .. } => {
                let recipient = recipient.clone();
                info!(sender = origin, %recipient, "private chat");
                self.to_user(&recipient, message).await
            }
            Message::FileRequest {
                ref recipient,
                ref file_name,
                file_size,
                ..
            } => {
                info!(sender = origin, %recipient, %file_name, file_size, "file transfer started");
                let recipient = recipient.clone();
                self.relay(origin, &recipient, message).await
            }
            Message::FileChunk { ref recipient, .. } => {
                let recipient = recipient.clone();
                self.relay(origin, &recipient, message).await
            }
            Message::FileComplete {
                ref recipient,
                ref file_name,
                ..
            } => {
                info!(sender = origin, %recipient, %file_name, "file transfer finished");
                let recipient = recipient.clone();
                self.relay(origin, &recipient, message).await
            }
            Message::FileReject {
                ref recipient,
                ref file_name,
                ..
            } => {
                info!(sender = origin, %recipient, %file_name, "file transfer rejected");
                let recipient = recipient.clone();
                self.relay(origin, &recipient, message).await
            }
            Message::Buzz { ref recipient, .. } => {
                let recipient = recipient.clone();
                self.relay(origin, &recipient, message).await
            }
            Message::TypingStart { ref recipient, .. } | Message::TypingStop { ref recipient, .. } => {
                match recipient.clone() {
                    Recipient::User(identity) => self.to_user(&identity, message).await,
                    Recipient::All => {
                        warn!(sender = origin, "typing indicator addressed to everyone, dropping");
                        Routed::Dropped
                    }
                }
            }
            Message::Disconnect { .. } => Routed::Disconnect,
            Message::Connect { .. } => {
                debug!(sender = origin, "ignoring repeated connect");
                Routed::Dropped
            }
            Message::UserListUpdate { .. } => {
                warn!(sender = origin, "client sent a user list update, dropping");
                Routed::Dropped
            }
        }
    }

    /// Broadcast or unicast resolution shared by file, buzz and reject
    /// traffic. Broadcast relays skip the originator.
    async fn relay(&self, origin: &str, recipient: &Recipient, message: Message) -> Routed {
        match recipient {
            Recipient::All => self.to_everyone(message, Some(origin)).await,
            Recipient::User(identity) => self.to_user(identity, message).await,
        }
    }

    async fn to_everyone(&self, message: Message, skip: Option<&str>) -> Routed {
        let targets: Vec<ConnectionHandle> = self
            .registry
            .handles()
            .await
            .into_iter()
            .filter(|(identity, _)| Some(identity.as_str()) != skip)
            .map(|(_, handle)| handle)
            .collect();

        let delivered = targets
            .iter()
            .filter(|handle| handle.deliver(message.clone()))
            .count();
        Routed::Delivered(delivered)
    }

    async fn to_user(&self, identity: &str, message: Message) -> Routed {
        let Some(handle) = self.registry.lookup(identity).await else {
            warn!(
                recipient = identity,
                tag = message.tag(),
                "recipient offline, dropping message"
            );
            return Routed::Dropped;
        };

        if handle.deliver(message) {
            Routed::Delivered(1)
        } else {
            debug!(recipient = identity, "recipient connection already closed");
            Routed::Dropped
        }
    }
}
