use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::message::Message;

pub type ConnectionId = u64;

/// Addressable outbound side of one live connection.
///
/// Delivery only enqueues; the session's writer task is the single writer of
/// the socket, so frames to one connection are never interleaved.
///
/// The queue is unbounded so that fan-out under the registry lock never
/// waits. The cost is memory: a peer that stops reading keeps accumulating
/// frames until its socket errors out or it disconnects.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a message for this connection. Returns `false` once the
    /// connection has gone away.
    pub fn deliver(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Identity to connection mapping shared by every session of one server.
///
/// All mutations and snapshots happen under one lock. Presence fan-out is
/// enqueued while the lock is held so every observer sees joins, departures
/// and user lists in the same order; enqueueing never waits on a peer's I/O.
pub struct Registry {
    entries: Mutex<BTreeMap<String, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Binds `identity` to `handle`, overwriting any previous binding, then
    /// announces the arrival and pushes a fresh user list to everyone.
    ///
    /// Returns the handle that was displaced, if any.
    pub async fn register(
        &self,
        identity: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(identity.to_string(), handle);
        if let Some(previous) = &previous {
            info!(
                identity,
                previous = previous.id(),
                "identity re-registered, previous connection orphaned"
            );
        } else {
            info!(identity, "user registered");
        }

        fan_out(
            &entries,
            Message::server_notice(format!("{identity} has joined the chat.")),
        );
        fan_out(&entries, user_list(&entries));
        previous
    }

    /// Removes `identity` whatever connection it is bound to. Absent
    /// identities are a no-op.
    pub async fn unregister(&self, identity: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.remove(identity).is_none() {
            return false;
        }
        announce_departure(&entries, identity);
        true
    }

    /// Removes `identity` only while it is still bound to `connection`.
    ///
    /// Sessions tear down through this so that a connection displaced by a
    /// later registration cannot evict its successor.
    pub async fn unregister_connection(&self, identity: &str, connection: ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(identity) {
            Some(handle) if handle.id() == connection => {
                entries.remove(identity);
            }
            _ => return false,
        }
        announce_departure(&entries, identity);
        true
    }

    pub async fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.entries.lock().await.get(identity).cloned()
    }

    /// Identities currently registered, in sorted order.
    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Copies every handle out so callers can deliver after the lock drops.
    pub async fn handles(&self) -> Vec<(String, ConnectionHandle)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(identity, handle)| (identity.clone(), handle.clone()))
            .collect()
    }

    /// Delivers `message` to every registered connection under the lock, in
    /// step with presence traffic.
    pub async fn broadcast(&self, message: Message) -> usize {
        let entries = self.entries.lock().await;
        fan_out(&entries, message)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn announce_departure(entries: &BTreeMap<String, ConnectionHandle>, identity: &str) {
    info!(identity, "user removed");
    fan_out(
        entries,
        Message::server_notice(format!("{identity} has left the chat.")),
    );
    fan_out(entries, user_list(entries));
}

fn user_list(entries: &BTreeMap<String, ConnectionHandle>) -> Message {
    let users: Vec<String> = entries.keys().cloned().collect();
    debug!(users = %users.join(","), "broadcasting user list");
    Message::user_list(users)
}

fn fan_out(entries: &BTreeMap<String, ConnectionHandle>, message: Message) -> usize {
    entries
        .iter()
        .filter(|(identity, handle)| {
            let delivered = handle.deliver(message.clone());
            if !delivered {
                debug!(identity = %identity, "skipping closed connection");
            }
            delivered
        })
        .count()
}
