//! Registry of attached clients.
//!
//! Each client owns a bounded outbound queue. The registry holds the sending
//! half; the connection task holds the receiving half. Sends never block:
//! a full queue drops the message for that client only, and a closed queue
//! marks the client for removal.
//!
//! Fan-out iterates a [`RegistrySnapshot`], which holds the registry's read
//! lock. Registration and removal take the write lock, so neither can
//! interleave with a fan-out pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use protocol::{ServerMessage, TerminalSize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use uuid::Uuid;

/// Opaque handle identifying one attached client.
pub type ClientId = String;

/// Default capacity of a client's outbound queue.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Default upper bound on simultaneously attached clients.
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Errors returned by the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry is at capacity.
    #[error("too many clients attached (max {max})")]
    Full {
        /// Configured maximum.
        max: usize,
    },

    /// No client with the given handle is registered.
    #[error("client not registered: {0}")]
    NotFound(ClientId),
}

/// A message queued for delivery to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw terminal output.
    Output(Bytes),
    /// A control envelope.
    Control(ServerMessage),
}

/// Result of a non-blocking send to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued.
    Sent,
    /// The queue was full and the message was dropped.
    Dropped,
    /// The client's connection is gone.
    Closed,
}

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total messages queued successfully.
    pub messages_sent: u64,
    /// Messages dropped because the client was too slow.
    pub messages_dropped: u64,
    /// Whether the client is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// A point-in-time description of a client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// The client's handle.
    pub id: ClientId,
    /// Join time in Unix epoch milliseconds.
    pub joined_at: u64,
    /// Last terminal size the client reported.
    pub size: Option<TerminalSize>,
    /// Delivery statistics.
    pub stats: ClientStats,
}

/// A registered client and the sending half of its outbound queue.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Outbound>,
    joined_at: u64,
    size: std::sync::Mutex<Option<TerminalSize>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ClientHandle {
    fn new(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            joined_at: now_millis(),
            size: std::sync::Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (handle, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }

    /// Returns whether the client's connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Attempts to queue a message without blocking.
    ///
    /// If the queue is full the message is dropped and the backpressure
    /// flag is set until a later send succeeds.
    pub fn try_send(&self, message: Outbound) -> SendOutcome {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(client_id = %self.id, "Client recovered from backpressure");
                }
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        client_id = %self.id,
                        dropped = dropped,
                        "Client is backpressured, dropping messages"
                    );
                }
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Client channel closed");
                SendOutcome::Closed
            }
        }
    }

    fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            joined_at: self.joined_at,
            size: *self.size.lock().unwrap_or_else(|p| p.into_inner()),
            stats: self.stats(),
        }
    }
}

/// Read-locked view of the registered clients.
///
/// While a snapshot is alive no client can join or leave.
pub struct RegistrySnapshot<'a> {
    clients: RwLockReadGuard<'a, HashMap<ClientId, ClientHandle>>,
}

impl RegistrySnapshot<'_> {
    /// Applies `f` to every client in the snapshot, including clients whose
    /// connection has closed but which have not been removed yet.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle),
    {
        self.clients.values().for_each(f);
    }

    /// Number of clients in the snapshot.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The set of attached clients.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    max_clients: usize,
    queue_capacity: usize,
}

impl ClientRegistry {
    /// Creates a registry with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CLIENTS, DEFAULT_SEND_QUEUE_CAPACITY)
    }

    /// Creates a registry with explicit limits.
    pub fn with_limits(max_clients: usize, queue_capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            max_clients,
            queue_capacity,
        }
    }

    /// Returns the configured client limit.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Registers a new client.
    ///
    /// Returns the client's handle and the receiving half of its queue.
    pub async fn register(&self) -> Result<(ClientId, mpsc::Receiver<Outbound>), RegistryError> {
        self.register_with(Vec::new).await
    }

    /// Registers a new client, queueing `prelude` ahead of anything else.
    ///
    /// `prelude` runs under the write lock, so whatever it captures is
    /// consistent with the fan-out passes before and after registration.
    pub async fn register_with<F>(
        &self,
        prelude: F,
    ) -> Result<(ClientId, mpsc::Receiver<Outbound>), RegistryError>
    where
        F: FnOnce() -> Vec<Outbound>,
    {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.max_clients {
            return Err(RegistryError::Full {
                max: self.max_clients,
            });
        }

        let id = Uuid::new_v4().to_string();
        let (handle, rx) = ClientHandle::new(id.clone(), self.queue_capacity);
        for message in prelude() {
            handle.try_send(message);
        }
        clients.insert(id.clone(), handle);

        tracing::debug!(client_id = %id, clients = clients.len(), "Registered client");
        Ok((id, rx))
    }

    /// Removes a client. Removing an unknown client is not an error.
    ///
    /// Returns the client's statistics if it was registered.
    pub async fn unregister(&self, client_id: &ClientId) -> Option<ClientStats> {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(client_id).map(|h| h.stats());
        if removed.is_some() {
            tracing::debug!(client_id = %client_id, clients = clients.len(), "Unregistered client");
        }
        removed
    }

    /// Returns the number of registered clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Returns whether a client is registered.
    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    /// Takes a read-locked snapshot for fan-out.
    pub async fn snapshot(&self) -> RegistrySnapshot<'_> {
        RegistrySnapshot {
            clients: self.clients.read().await,
        }
    }

    /// Applies `f` to a snapshot of the registered clients.
    pub async fn for_each<F>(&self, f: F)
    where
        F: FnMut(&ClientHandle),
    {
        self.snapshot().await.for_each(f);
    }

    /// Records the terminal size last reported by a client.
    pub async fn set_size(
        &self,
        client_id: &ClientId,
        size: TerminalSize,
    ) -> Result<(), RegistryError> {
        let clients = self.clients.read().await;
        let handle = clients
            .get(client_id)
            .ok_or_else(|| RegistryError::NotFound(client_id.clone()))?;
        *handle.size.lock().unwrap_or_else(|p| p.into_inner()) = Some(size);
        Ok(())
    }

    /// Returns information about a client.
    pub async fn client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        self.clients.read().await.get(client_id).map(|h| h.info())
    }

    /// Returns a list of all registered client IDs.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Removes every client, closing their queues.
    ///
    /// Returns how many clients were removed.
    pub async fn clear(&self) -> usize {
        let mut clients = self.clients.write().await;
        let count = clients.len();
        clients.clear();
        count
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the current Unix timestamp in milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
