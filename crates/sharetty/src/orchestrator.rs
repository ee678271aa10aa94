//! Orchestrator wiring the session, hub and server together.
//!
//! The orchestrator owns the lifecycle of the process: it spawns the shared
//! shell, starts the fan-out loop and the HTTP server, and on shutdown (a
//! signal or the shell exiting) makes sure the shell is reaped before the
//! server stops.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::server::{router, AppState};
use crate::session::{
    BroadcastHub, ClientRegistry, EndReason, OutputStream, Session, SessionOutcome,
};

/// How long open connections get to finish after shutdown starts.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Spawning the shell and binding the listener.
    Starting,
    /// Serving clients.
    Running,
    /// Reaping the shell and stopping the server.
    ShuttingDown,
}

/// Runs one shared session and the server in front of it.
pub struct Orchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    hub: Option<Arc<BroadcastHub>>,
    local_addr: Option<SocketAddr>,
    session_task: Option<JoinHandle<SessionOutcome>>,
    server_task: Option<JoinHandle<std::io::Result<()>>>,
    shutdown_token: CancellationToken,
    shutdown_requested: bool,
}

impl Orchestrator {
    /// Creates an orchestrator. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            hub: None,
            local_addr: None,
            session_task: None,
            server_task: None,
            shutdown_token: CancellationToken::new(),
            shutdown_requested: false,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns the address the server is listening on once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the broadcast hub once started.
    pub fn hub(&self) -> Option<&Arc<BroadcastHub>> {
        self.hub.as_ref()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns whether the last run was stopped by the shutdown future
    /// rather than by the session ending.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Spawns the shell, starts the fan-out loop and begins serving.
    ///
    /// Any failure is fatal and leaves the orchestrator stopped.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        if let Err(e) = self.start_inner().await {
            *self.state.write().await = OrchestratorState::Stopped;
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        if let Some(local_addr) = self.local_addr {
            info!("Listening on http://{}", local_addr);
        }
        Ok(())
    }

    async fn start_inner(&mut self) -> Result<()> {
        let options = self.config.session_options();
        let session = Session::start(options).context("Failed to start shared shell")?;
        info!(pid = ?session.pid(), "Shared shell started");

        let (listener, local_addr, output) = match self.listen(&session).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(term_err) = session.terminate().await {
                    warn!(error = %term_err, "Failed to reap shell after startup failure");
                }
                return Err(e);
            }
        };

        let registry = Arc::new(ClientRegistry::with_limits(
            self.config.clients.max_clients,
            self.config.clients.send_queue_capacity,
        ));
        let hub = Arc::new(BroadcastHub::with_replay(
            Arc::new(session),
            registry,
            self.config.clients.replay_bytes,
        ));

        let session_task = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.run(output).await })
        };

        let app = router(AppState::new(
            Arc::clone(&hub),
            self.config.server.max_message_size,
        ));
        let token = self.shutdown_token.clone();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });

        self.hub = Some(hub);
        self.local_addr = Some(local_addr);
        self.session_task = Some(session_task);
        self.server_task = Some(server_task);
        Ok(())
    }

    /// Binds the listener and takes the session's output.
    async fn listen(&self, session: &Session) -> Result<(TcpListener, SocketAddr, OutputStream)> {
        let addr = self
            .config
            .socket_addr()
            .context("Invalid listen address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read local address")?;
        let output = session
            .read_output()
            .context("Failed to take session output")?;
        Ok((listener, local_addr, output))
    }

    /// Serves until the shell exits or `shutdown` completes, then stops.
    ///
    /// The shell is always terminated and reaped before this returns.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let mut session_task = self
            .session_task
            .take()
            .context("Orchestrator has not been started")?;

        let finished = tokio::select! {
            outcome = &mut session_task => Some(outcome),
            _ = shutdown => None,
        };

        let outcome = match finished {
            Some(outcome) => outcome.context("Fan-out task panicked")?,
            None => {
                info!("Shutdown requested, terminating shell");
                self.shutdown_requested = true;
                *self.state.write().await = OrchestratorState::ShuttingDown;
                if let Some(hub) = &self.hub {
                    if let Err(e) = hub.session().terminate().await {
                        warn!(error = %e, "Failed to terminate shell");
                    }
                }
                session_task.await.context("Fan-out task panicked")?
            }
        };

        self.stop_server().await;

        match outcome.reason {
            EndReason::IoError => error!(exit_code = ?outcome.exit_code, "Session ended on I/O error"),
            _ => info!(exit_code = ?outcome.exit_code, "Session ended"),
        }

        Ok(outcome)
    }

    /// Stops accepting connections and waits for the server to wind down.
    async fn stop_server(&mut self) {
        *self.state.write().await = OrchestratorState::ShuttingDown;
        self.shutdown_token.cancel();

        if let Some(server_task) = self.server_task.take() {
            match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_task).await {
                Ok(Ok(Ok(()))) => debug!("Server stopped"),
                Ok(Ok(Err(e))) => warn!(error = %e, "Server stopped with error"),
                Ok(Err(e)) => warn!(error = %e, "Server task panicked"),
                Err(_) => warn!("Server did not stop in time"),
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
