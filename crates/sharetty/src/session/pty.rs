//! PTY session management.
//!
//! A [`Session`] owns the one pseudo-terminal and the shell running on it.
//! Every interaction with the terminal goes through its methods: the write
//! side and the master handle sit behind async mutexes, and the read side
//! is handed out exactly once as an [`OutputStream`].

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Could not allocate the PTY or launch the shell.
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// Reading from or writing to the PTY master failed.
    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to apply a new window size.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// The session has ended and accepts no more input.
    #[error("session terminated")]
    Terminated,

    /// The output stream was already handed out.
    #[error("session output already taken")]
    OutputTaken,
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// PTY allocated, shell not yet confirmed running.
    Starting,
    /// Shell is running and accepting input.
    Running,
    /// Shell exited or was killed; descriptors are released or about to be.
    Terminated,
}

/// Default buffer size for reading from the PTY.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the PTY reader and the fan-out loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How often the exit watcher polls the shell.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters for spawning the shared shell.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Shell command. `None` falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    /// Initial terminal size.
    pub size: TerminalSize,
    /// Extra environment variables for the shell.
    pub env: Vec<(String, String)>,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
    /// Maximum bytes per output chunk.
    pub read_buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: None,
            size: TerminalSize::default(),
            env: Vec::new(),
            cwd: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Item produced by the blocking PTY reader.
enum OutputEvent {
    Chunk(Bytes),
    End,
    Failed(io::Error),
}

/// The lazy, non-restartable sequence of output chunks read from the PTY.
///
/// There is exactly one reader per session. Once the sequence has ended
/// (child exit or I/O failure) it keeps returning `Ok(None)`.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputEvent>,
    finished: bool,
}

impl OutputStream {
    /// Waits for the next chunk.
    ///
    /// Returns `Ok(Some(chunk))` for output, `Ok(None)` once the session has
    /// ended, and [`SessionError::Io`] if reading the PTY failed.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, SessionError> {
        if self.finished {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(OutputEvent::Chunk(data)) => Ok(Some(data)),
            Some(OutputEvent::End) | None => {
                self.finished = true;
                Ok(None)
            }
            Some(OutputEvent::Failed(e)) => {
                self.finished = true;
                Err(SessionError::Io(e))
            }
        }
    }

    /// Returns whether the end of the sequence has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// The shared shell and its pseudo-terminal.
pub struct Session {
    /// The PTY master handle, released on terminate.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY, released on terminate.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The child process, taken when reaped.
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,

    /// Set when the shell exited on its own rather than being terminated.
    child_exited: Arc<AtomicBool>,

    /// The reader for the PTY, taken by `read_output`.
    reader: std::sync::Mutex<Option<Box<dyn Read + Send>>>,

    /// Lifecycle state, observable by the hub.
    state: Arc<watch::Sender<SessionState>>,

    /// Last applied terminal size.
    size: std::sync::Mutex<TerminalSize>,

    /// Exit code recorded when the child was reaped.
    exit_code: std::sync::Mutex<Option<i32>>,

    /// Process ID.
    pid: Option<u32>,

    read_buffer_size: usize,
}

impl Session {
    /// Allocates a PTY and spawns the shell on it.
    ///
    /// Fails with [`SessionError::Spawn`] if the OS cannot provide a PTY or
    /// the shell cannot be executed.
    pub fn start(options: SessionOptions) -> Result<Self, SessionError> {
        let (state, _) = watch::channel(SessionState::Starting);
        let shell_cmd = detect_shell(options.shell);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(options.size))
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);
        cmd.env("TERM", "xterm-256color");
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", shell_cmd, e)))?;

        // The master only sees EOF once every slave descriptor is closed.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let session = Session {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Arc::new(Mutex::new(Some(child))),
            child_exited: Arc::new(AtomicBool::new(false)),
            reader: std::sync::Mutex::new(Some(reader)),
            state: Arc::new(state),
            size: std::sync::Mutex::new(options.size),
            exit_code: std::sync::Mutex::new(None),
            pid,
            read_buffer_size: options.read_buffer_size.max(1),
        };
        session.state.send_replace(SessionState::Running);

        tracing::info!(
            shell = %shell_cmd,
            pid = ?pid,
            rows = options.size.rows,
            cols = options.size.cols,
            "Started shared shell"
        );

        Ok(session)
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns whether the session still accepts input.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Returns a receiver that observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the last applied terminal size.
    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Returns the shell's exit code once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    /// Returns whether the shell exited on its own, as opposed to being
    /// terminated or losing its PTY.
    pub fn child_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Starts reading the PTY and returns the output sequence.
    ///
    /// The reader runs on a dedicated thread and is the only consumer of the
    /// master side. A background job can keep the PTY open after the shell
    /// is gone, so the shell itself is also watched: when it exits the
    /// session moves to [`SessionState::Terminated`] even if the output has
    /// not reached EOF. Can only be called once; later calls fail with
    /// [`SessionError::OutputTaken`].
    pub fn read_output(&self) -> Result<OutputStream, SessionError> {
        let mut reader = lock(&self.reader).take().ok_or(SessionError::OutputTaken)?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let state = Arc::clone(&self.state);
        let buffer_size = self.read_buffer_size;

        // A plain thread: a read held open by a background job must not
        // stall runtime shutdown the way a blocking-pool task would.
        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size];
                loop {
                    let event = match reader.read(&mut buffer) {
                        Ok(0) => OutputEvent::End,
                        Ok(n) => OutputEvent::Chunk(Bytes::copy_from_slice(&buffer[..n])),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if is_pty_closed(&e) => OutputEvent::End,
                        Err(e) => {
                            tracing::error!(error = %e, "Error reading from PTY");
                            OutputEvent::Failed(e)
                        }
                    };

                    let last = !matches!(event, OutputEvent::Chunk(_));
                    if tx.blocking_send(event).is_err() {
                        tracing::debug!("Output stream dropped, reader stopping");
                        break;
                    }
                    if last {
                        tracing::info!("PTY closed - shell exited");
                        break;
                    }
                }
                state.send_replace(SessionState::Terminated);
            })?;

        self.spawn_exit_watcher();

        Ok(OutputStream {
            rx,
            finished: false,
        })
    }

    /// Polls the shell until it exits or the session is terminated.
    fn spawn_exit_watcher(&self) {
        let child = Arc::clone(&self.child);
        let child_exited = Arc::clone(&self.child_exited);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHILD_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if *state.borrow() == SessionState::Terminated {
                    return;
                }

                let mut slot = child.lock().await;
                let Some(shell) = slot.as_mut() else {
                    return;
                };
                match shell.try_wait() {
                    Ok(Some(status)) => {
                        tracing::info!(exit_code = status.exit_code(), "Shell exited");
                        child_exited.store(true, Ordering::Release);
                        state.send_replace(SessionState::Terminated);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll shell status");
                        return;
                    }
                }
            }
        });
    }

    /// Writes keystrokes to the shell.
    ///
    /// Writes are serialized, so concurrent callers interleave at call
    /// granularity. The write itself runs on the blocking pool since the
    /// PTY can stall when the shell is not reading. A failed write ends the
    /// session.
    pub async fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::Terminated);
        }

        let mut guard = self.writer.lock().await;
        let mut writer = guard.take().ok_or(SessionError::Terminated)?;
        let data = data.to_vec();

        let joined = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&data).and_then(|()| writer.flush());
            (writer, result)
        })
        .await;

        let result = match joined {
            Ok((writer, result)) => {
                *guard = Some(writer);
                result
            }
            Err(e) => Err(io::Error::other(e)),
        };
        drop(guard);

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to write to PTY, ending session");
            self.state.send_replace(SessionState::Terminated);
            return Err(SessionError::Io(e));
        }

        Ok(())
    }

    /// Applies a new window size. A no-op once the session has terminated.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        let master = self.master.lock().await;
        let Some(master) = master.as_ref() else {
            return Ok(());
        };
        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Resize(e.to_string()))?;

        *lock(&self.size) = size;

        tracing::debug!(rows = size.rows, cols = size.cols, "Resized PTY");

        Ok(())
    }

    /// Ends the shell and releases the PTY.
    ///
    /// The child gets a hangup and, if it lingers, a kill; it is then
    /// reaped. Calling this again returns the recorded exit code without
    /// signalling anything.
    pub async fn terminate(&self) -> Result<Option<i32>, SessionError> {
        self.state.send_replace(SessionState::Terminated);

        // Held until the exit code is recorded so concurrent callers see it.
        let mut child_slot = self.child.lock().await;
        let Some(mut child) = child_slot.take() else {
            return Ok(self.exit_code());
        };

        let status = tokio::task::spawn_blocking(move || -> io::Result<_> {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if let Err(e) = child.kill() {
                tracing::warn!(error = %e, "Failed to signal shell");
            }
            child.wait()
        })
        .await
        .map_err(|e| SessionError::Io(io::Error::other(e)))??;

        let code = i32::try_from(status.exit_code()).ok();
        *lock(&self.exit_code) = code;

        self.writer.lock().await.take();
        self.master.lock().await.take();

        tracing::info!(pid = ?self.pid, exit_code = ?code, "Shell terminated");

        Ok(code)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Ok(mut slot) = self.child.try_lock() else {
            return;
        };
        if let Some(mut child) = slot.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// On Linux, reading the master after the last slave descriptor closed
/// fails with EIO instead of returning 0.
fn is_pty_closed(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_options() -> SessionOptions {
        SessionOptions {
            shell: Some("/bin/sh".to_string()),
            ..SessionOptions::default()
        }
    }

    async fn read_until(output: &mut OutputStream, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), output.next_chunk()).await {
                Ok(Ok(Some(data))) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(_) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[tokio::test]
    async fn test_session_start() {
        let session = Session::start(sh_options()).expect("failed to start session");

        assert_eq!(session.state(), SessionState::Running);
        assert!(session.is_running());
        assert_eq!(session.size(), TerminalSize::new(24, 80));
        assert!(session.pid().is_some());

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_start_missing_shell_fails() {
        let result = Session::start(SessionOptions {
            shell: Some("/nonexistent/shell-binary".to_string()),
            ..SessionOptions::default()
        });
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_write_and_read_output() {
        let session = Session::start(sh_options()).unwrap();
        let mut output = session.read_output().unwrap();

        session.write_input(b"echo test_output_marker\n").await.unwrap();

        assert!(
            read_until(&mut output, "test_output_marker").await,
            "Did not receive expected output"
        );

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_output_only_once() {
        let session = Session::start(sh_options()).unwrap();

        let _output = session.read_output().unwrap();
        assert!(matches!(
            session.read_output(),
            Err(SessionError::OutputTaken)
        ));

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_vars_reach_shell() {
        let session = Session::start(SessionOptions {
            env: vec![("SHARETTY_TEST_VAR".to_string(), "test_value".to_string())],
            ..sh_options()
        })
        .unwrap();
        let mut output = session.read_output().unwrap();

        session.write_input(b"echo $SHARETTY_TEST_VAR\n").await.unwrap();
        assert!(read_until(&mut output, "test_value").await);

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_last_writer_wins() {
        let session = Session::start(sh_options()).unwrap();

        session.resize(TerminalSize::new(24, 80)).await.unwrap();
        session.resize(TerminalSize::new(40, 120)).await.unwrap();

        assert_eq!(session.size(), TerminalSize::new(40, 120));

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_reaches_shell() {
        let session = Session::start(sh_options()).unwrap();
        let mut output = session.read_output().unwrap();

        session.resize(TerminalSize::new(33, 111)).await.unwrap();
        session.write_input(b"stty size\n").await.unwrap();

        assert!(read_until(&mut output, "33 111").await);

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_after_terminate_is_noop() {
        let session = Session::start(sh_options()).unwrap();
        session.terminate().await.unwrap();

        let result = session.resize(TerminalSize::new(50, 100)).await;
        assert!(result.is_ok());
        assert_eq!(session.size(), TerminalSize::new(24, 80));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let session = Session::start(sh_options()).unwrap();

        let first = session.terminate().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);

        let second = session.terminate().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_write_after_terminate_fails() {
        let session = Session::start(sh_options()).unwrap();
        session.terminate().await.unwrap();

        let result = session.write_input(b"hello\n").await;
        assert!(matches!(result, Err(SessionError::Terminated)));
    }

    #[tokio::test]
    async fn test_output_ends_when_shell_exits() {
        let session = Session::start(sh_options()).unwrap();
        let mut output = session.read_output().unwrap();

        session.write_input(b"exit 42\n").await.unwrap();

        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match output.next_chunk().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return true,
                    Err(_) => return false,
                }
            }
        })
        .await
        .expect("output did not end");

        assert!(ended);
        assert!(output.is_finished());
        assert!(matches!(output.next_chunk().await, Ok(None)));

        let code = session.terminate().await.unwrap();
        assert_eq!(code, Some(42));
        assert_eq!(session.exit_code(), Some(42));
    }

    #[tokio::test]
    async fn test_shell_exit_with_background_job_ends_session() {
        let session = Session::start(sh_options()).unwrap();
        let _output = session.read_output().unwrap();
        let mut state_rx = session.subscribe_state();

        // The background job inherits the PTY and keeps it open.
        session.write_input(b"sleep 30 &\nexit 7\n").await.unwrap();

        timeout(
            Duration::from_secs(3),
            state_rx.wait_for(|state| *state == SessionState::Terminated),
        )
        .await
        .expect("session still running after the shell exited")
        .expect("sender dropped");

        assert!(session.child_exited());
        assert!(!session.is_running());
        assert_eq!(session.terminate().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_terminate_does_not_count_as_child_exit() {
        let session = Session::start(sh_options()).unwrap();
        let _output = session.read_output().unwrap();

        session.terminate().await.unwrap();
        assert!(!session.child_exited());
    }

    #[tokio::test]
    async fn test_concurrent_writes_all_arrive() {
        let session = Arc::new(Session::start(sh_options()).unwrap());
        let mut output = session.read_output().unwrap();

        let writers: Vec<_> = ["echo first_write\n", "echo second_write\n"]
            .into_iter()
            .map(|line| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.write_input(line.as_bytes()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let mut seen = String::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Ok(Some(data)) = output.next_chunk().await {
                seen.push_str(&String::from_utf8_lossy(&data));
                // Each line shows up once as echoed input and once as output.
                if seen.matches("first_write").count() >= 2
                    && seen.matches("second_write").count() >= 2
                {
                    break;
                }
            }
        })
        .await;
        assert!(seen.matches("first_write").count() >= 2);
        assert!(seen.matches("second_write").count() >= 2);

        session.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_subscription_sees_termination() {
        let session = Session::start(sh_options()).unwrap();
        let mut state_rx = session.subscribe_state();
        assert_eq!(*state_rx.borrow_and_update(), SessionState::Running);

        session.terminate().await.unwrap();

        timeout(Duration::from_secs(1), state_rx.changed())
            .await
            .expect("timeout")
            .expect("sender dropped");
        assert_eq!(*state_rx.borrow(), SessionState::Terminated);
    }
}
