//! Managed unix-domain socket server.
//!
//! A [`SocketTransport`] owns one socket path. An accept loop hands each
//! connection to a single consumer through a bounded queue; the consumer
//! releases it with [`SocketTransport::done_conn`] once handled.
//!
//! ```text
//! accept loop ──(take wait token)──► queue ──► next_conn() ──► consumer
//!                                                                 │
//! stop(): cancel accept, close tracker,  ◄──── done_conn(conn) ───┘
//!         wait for every token
//! ```
//!
//! `stop` never returns while a connection obtained from `next_conn` is
//! still held; afterwards `next_conn` yields `None`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

use crate::constants::{ACCEPT_RETRY_DELAY, CONN_QUEUE_DEPTH, MAX_SOCKET_PATH};
use crate::endpoint::Endpoint;
use crate::error::{AcommError, Result};

/// An accepted connection.
///
/// Holds one unit of the transport's shutdown wait-count until it is passed
/// to [`SocketTransport::done_conn`] or dropped.
pub struct Connection {
    id: u64,
    stream: UnixStream,
    _token: TaskTrackerToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Sequence number of this connection on its transport.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying stream.
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    /// Queue sender, moved into the accept loop on start.
    queue_tx: Option<mpsc::Sender<Connection>>,
    accept_handle: Option<JoinHandle<()>>,
    /// Set once we bound the path, so stop only removes our own file.
    bound: bool,
}

/// Unix socket server with graceful drain.
#[derive(Debug)]
pub struct SocketTransport {
    socket_path: PathBuf,
    state: Mutex<State>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    cancel: CancellationToken,
    conns: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketTransport {
    /// Create a transport for the given path. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        Self {
            socket_path: socket_path.into(),
            state: Mutex::new(State {
                phase: Phase::Idle,
                queue_tx: Some(queue_tx),
                accept_handle: None,
                bound: false,
            }),
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            cancel: CancellationToken::new(),
            conns: TaskTracker::new(),
        }
    }

    /// Bind the socket and spawn the accept loop.
    ///
    /// Removes a stale socket file whose listener is gone, but fails if
    /// another listener is still serving the path. Must be called inside a
    /// tokio runtime. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long, in use, or cannot be bound,
    /// or if the transport was already stopped.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(AcommError::AlreadyStopped),
            Phase::Idle => {}
        }

        let path_len = self.socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            return Err(AcommError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "socket path too long ({path_len} bytes, max {}): {}",
                    MAX_SOCKET_PATH - 1,
                    self.socket_path.display()
                ),
            )));
        }

        prepare_socket_path(&self.socket_path)?;

        let listener = std::os::unix::net::UnixListener::bind(&self.socket_path)?;
        state.bound = true;

        // Owner-only access
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(listener)?;

        let Some(queue_tx) = state.queue_tx.take() else {
            return Err(AcommError::AlreadyStopped);
        };

        log::info!("[Transport] Listening on {}", self.socket_path.display());

        state.accept_handle = Some(tokio::spawn(Self::accept_loop(
            listener,
            queue_tx,
            self.cancel.clone(),
            self.conns.clone(),
            self.socket_path.clone(),
        )));
        state.phase = Phase::Running;
        Ok(())
    }

    /// Accept loop, runs as a tokio task until cancelled.
    async fn accept_loop(
        listener: tokio::net::UnixListener,
        queue_tx: mpsc::Sender<Connection>,
        cancel: CancellationToken,
        conns: TaskTracker,
        socket_path: PathBuf,
    ) {
        let mut next_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    next_id += 1;
                    // Wait token is taken before the connection is queued.
                    let conn = Connection {
                        id: next_id,
                        stream,
                        _token: conns.token(),
                    };
                    log::trace!("[Transport] Accepted connection {} on {}", next_id, socket_path.display());
                    if queue_tx.send(conn).await.is_err() {
                        log::warn!("[Transport] Queue closed, stopping accept loop");
                        break;
                    }
                }
                Err(e) => {
                    log::error!("[Transport] Accept error on {}: {e}", socket_path.display());
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        log::debug!("[Transport] Accept loop stopped for {}", socket_path.display());
    }

    /// Wait for the next accepted connection.
    ///
    /// Returns `None` once `stop` has begun and the queue is drained.
    pub async fn next_conn(&self) -> Option<Connection> {
        self.queue_rx.lock().await.recv().await
    }

    /// Mark a connection as handled: closes it and releases its wait token.
    pub fn done_conn(&self, conn: Connection) {
        log::trace!("[Transport] Connection {} done on {}", conn.id, self.socket_path.display());
        drop(conn);
    }

    /// Stop accepting and wait for every handed-out connection to be
    /// released. Removes the socket file. Safe to call more than once.
    pub async fn stop(&self) {
        let (handle, bound) = {
            let mut state = lock(&self.state);
            state.phase = Phase::Stopped;
            // Never started: dropping the sender lets next_conn return None.
            state.queue_tx = None;
            (state.accept_handle.take(), state.bound)
        };

        self.cancel.cancel();
        self.conns.close();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[Transport] Accept loop panicked: {e}");
            }
            if bound {
                if let Err(e) = std::fs::remove_file(&self.socket_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("[Transport] Failed to remove {}: {e}", self.socket_path.display());
                    }
                }
            }
        }

        if !self.conns.is_empty() {
            log::info!(
                "[Transport] Waiting for {} connection(s) on {}",
                self.conns.len(),
                self.socket_path.display()
            );
        }
        self.conns.wait().await;
        log::debug!("[Transport] Stopped {}", self.socket_path.display());
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        lock(&self.state).phase == Phase::Running
    }

    /// Connections accepted but not yet released.
    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Path to the socket file.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// `unix://` URL of the socket.
    pub fn url(&self) -> String {
        Endpoint::unix_url(&self.socket_path)
    }
}

/// Clear a stale socket file and make sure the parent directory exists.
fn prepare_socket_path(path: &Path) -> Result<()> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(AcommError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("socket already in use: {}", path.display()),
            )));
        }
        log::debug!("[Transport] Removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
