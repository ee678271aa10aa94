//! Broadcast hub between the shared session and its clients.
//!
//! The hub is the only consumer of the session's output. Each chunk is
//! pushed, unchanged, to every client registered at the moment the chunk
//! is drained. Client input and resizes go straight to the session, which
//! serializes them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{ServerMessage, TerminalSize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use super::pty::{OutputStream, Session, SessionError, SessionState};
use super::registry::{ClientId, ClientRegistry, Outbound, RegistryError, SendOutcome};
use super::replay::ReplayBuffer;

/// How long the output may stay quiet before a drain after termination
/// gives up. A background job can hold the PTY open indefinitely.
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Upper bound on draining output after termination.
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Errors returned by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The shared session has ended.
    #[error("session has ended")]
    SessionEnded,

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Why the fan-out loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The shell exited or the PTY closed.
    ChildExit,
    /// Reading or writing the PTY failed.
    IoError,
    /// The session was terminated from outside the loop.
    Terminated,
}

/// Final result of a session, reported when the fan-out loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// What ended the session.
    pub reason: EndReason,
    /// Exit code of the shell, if known.
    pub exit_code: Option<i32>,
}

/// A newly attached client.
pub struct ClientAttachment {
    /// The client's handle.
    pub id: ClientId,
    /// Messages to forward to the client's connection.
    pub outbound: mpsc::Receiver<Outbound>,
    /// Set once the session has ended. Unlike `outbound` this can never
    /// overflow, so the end of the session reaches even a stalled client.
    pub session_end: watch::Receiver<Option<SessionOutcome>>,
}

impl ClientAttachment {
    /// Returns how the session ended, or `None` while it is running.
    pub fn session_outcome(&self) -> Option<SessionOutcome> {
        *self.session_end.borrow()
    }
}

/// Bridges one session to any number of clients.
pub struct BroadcastHub {
    session: Arc<Session>,
    registry: Arc<ClientRegistry>,
    replay: Option<std::sync::Mutex<ReplayBuffer>>,
    outcome: watch::Sender<Option<SessionOutcome>>,
}

impl BroadcastHub {
    /// Creates a hub without a replay buffer.
    pub fn new(session: Arc<Session>, registry: Arc<ClientRegistry>) -> Self {
        Self::with_replay(session, registry, 0)
    }

    /// Creates a hub that replays up to `replay_bytes` of recent output to
    /// each new client. Zero disables replay.
    pub fn with_replay(
        session: Arc<Session>,
        registry: Arc<ClientRegistry>,
        replay_bytes: usize,
    ) -> Self {
        let replay = (replay_bytes > 0).then(|| std::sync::Mutex::new(ReplayBuffer::new(replay_bytes)));
        Self {
            session,
            registry,
            replay,
            outcome: watch::Sender::new(None),
        }
    }

    /// Returns the shared session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns the client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Returns the number of attached clients.
    pub async fn viewer_count(&self) -> usize {
        self.registry.count().await
    }

    /// Returns whether another client could attach right now.
    pub async fn is_accepting(&self) -> bool {
        self.session.is_running() && self.registry.count().await < self.registry.max_clients()
    }

    /// Returns how the session ended, or `None` while it is running.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        *self.outcome.borrow()
    }

    /// Attaches a client.
    ///
    /// The client receives output produced from this point on, preceded by
    /// the replay buffer when one is configured. Every client is told the
    /// new viewer count.
    pub async fn on_client_join(&self) -> Result<ClientAttachment, HubError> {
        if !self.session.is_running() || self.outcome().is_some() {
            return Err(HubError::SessionEnded);
        }

        let (id, outbound) = self
            .registry
            .register_with(|| match &self.replay {
                Some(replay) => {
                    let backlog = lock(replay).snapshot();
                    if backlog.is_empty() {
                        Vec::new()
                    } else {
                        vec![Outbound::Output(backlog)]
                    }
                }
                None => Vec::new(),
            })
            .await?;

        // The fan-out loop may have cleared the registry just before this
        // client was added.
        if self.outcome().is_some() {
            self.registry.unregister(&id).await;
            return Err(HubError::SessionEnded);
        }

        tracing::info!(client_id = %id, "Client joined");
        self.broadcast_viewer_count().await;

        Ok(ClientAttachment {
            id,
            outbound,
            session_end: self.outcome.subscribe(),
        })
    }

    /// Forwards a client's keystrokes to the shell.
    ///
    /// There is no turn-taking: input from several clients interleaves in
    /// arrival order.
    pub async fn on_client_input(&self, client_id: &ClientId, data: &[u8]) -> Result<(), HubError> {
        if !self.registry.contains(client_id).await {
            return Err(RegistryError::NotFound(client_id.clone()).into());
        }
        self.session.write_input(data).await?;
        Ok(())
    }

    /// Applies a client's terminal size to the shared PTY.
    ///
    /// The most recent resize from any client wins.
    pub async fn on_client_resize(
        &self,
        client_id: &ClientId,
        size: TerminalSize,
    ) -> Result<(), HubError> {
        self.registry.set_size(client_id, size).await?;
        self.session.resize(size).await?;
        tracing::debug!(client_id = %client_id, rows = size.rows, cols = size.cols, "Client resized terminal");
        Ok(())
    }

    /// Detaches a client. The session keeps running with zero clients.
    pub async fn on_client_leave(&self, client_id: &ClientId) {
        if let Some(stats) = self.registry.unregister(client_id).await {
            tracing::info!(
                client_id = %client_id,
                sent = stats.messages_sent,
                dropped = stats.messages_dropped,
                "Client left"
            );
            self.broadcast_viewer_count().await;
        }
    }

    /// Fans one chunk out to every registered client.
    ///
    /// Clients whose connection has closed are removed afterwards. Returns
    /// the number of clients the chunk was queued for.
    pub async fn publish(&self, chunk: Bytes) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let snapshot = self.registry.snapshot().await;
            if let Some(replay) = &self.replay {
                lock(replay).push(&chunk);
            }
            snapshot.for_each(|handle| match handle.try_send(Outbound::Output(chunk.clone())) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Dropped => {}
                SendOutcome::Closed => closed.push(handle.id().clone()),
            });
        }

        if !closed.is_empty() {
            let mut removed = false;
            for client_id in closed {
                if self.registry.unregister(&client_id).await.is_some() {
                    tracing::debug!(client_id = %client_id, "Removed disconnected client");
                    removed = true;
                }
            }
            if removed {
                self.broadcast_viewer_count().await;
            }
        }

        delivered
    }

    async fn broadcast_viewer_count(&self) {
        let snapshot = self.registry.snapshot().await;
        let message = ServerMessage::Users {
            count: snapshot.len(),
        };
        snapshot.for_each(|handle| {
            handle.try_send(Outbound::Control(message.clone()));
        });
    }

    /// Runs the fan-out loop until the session ends.
    ///
    /// The loop stops when the output ends or the session is terminated,
    /// including by the shell exiting while a background job still holds
    /// the PTY. Pending output is drained and the shell is reaped. The
    /// outcome is then published to every attachment and the registry is
    /// cleared so the connections close.
    pub async fn run(&self, mut output: OutputStream) -> SessionOutcome {
        let mut state_rx = self.session.subscribe_state();

        let reason = loop {
            tokio::select! {
                biased;
                next = output.next_chunk() => match next {
                    Ok(Some(chunk)) => {
                        self.publish(chunk).await;
                    }
                    Ok(None) => break EndReason::ChildExit,
                    Err(e) => {
                        tracing::error!(error = %e, "Session output failed");
                        break EndReason::IoError;
                    }
                },
                _ = wait_terminated(&mut state_rx) => {
                    self.drain_remaining(&mut output).await;
                    if self.session.child_exited() {
                        break EndReason::ChildExit;
                    }
                    break EndReason::Terminated;
                }
            }
        };

        let exit_code = match self.session.terminate().await {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reap shell");
                None
            }
        };

        let outcome = SessionOutcome { reason, exit_code };
        self.outcome.send_replace(Some(outcome));
        let disconnected = self.registry.clear().await;

        tracing::info!(
            reason = ?reason,
            exit_code = ?exit_code,
            disconnected = disconnected,
            "Session ended"
        );

        outcome
    }

    /// Publishes output still in flight after the session was terminated.
    async fn drain_remaining(&self, output: &mut OutputStream) {
        let deadline = Instant::now() + DRAIN_LIMIT;
        while Instant::now() < deadline {
            match timeout(DRAIN_IDLE, output.next_chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    self.publish(chunk).await;
                }
                Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return,
            }
        }
    }
}

async fn wait_terminated(state_rx: &mut watch::Receiver<SessionState>) {
    loop {
        if *state_rx.borrow_and_update() == SessionState::Terminated {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
