//! Daemon Server Implementation
//!
//! This module provides the server loop for the gateway daemon:
//! - Accepts connections on a Unix socket (owner-only permissions)
//! - Rejects peers running as a different user
//! - Spawns a handler task per connection
//! - Serves newline-delimited JSON requests against one shared [`Gateway`]
//! - Supports graceful shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       client          client          client
//!       (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                    Arc<Gateway>
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use gateway_core::Gateway;

use crate::protocol::{self, Response};

/// How often the accept loop checks the shutdown flag
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from `SO_PEERCRED`)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Shared orchestration core
    gateway: Arc<Gateway>,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    /// Next connection id
    next_id: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, gateway: Arc<Gateway>, server_config: ServerConfig) -> Self {
        Self {
            socket_path,
            gateway,
            server_config,
            connection_states: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        (result == 0).then_some(cred.uid)
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        stream.peer_cred().ok().map(|cred| cred.uid())
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the accept loop until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, "Listening for connections");

        let our_uid = unsafe { libc::getuid() };

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let stream = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(
                    max_connections = self.server_config.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
        }

        self.shutdown().await
    }

    /// Serve request lines from one client until it disconnects
    async fn handle_connection(
        conn_id: u64,
        stream: UnixStream,
        gateway: Arc<Gateway>,
        connection_states: Arc<DashMap<u64, ConnectionState>>,
    ) {
        debug!("Connection handler started");

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read error");
                    let reply = Response::Error(format!("Read error: {e}"));
                    let _ = write_half
                        .write_all(&protocol::encode_response(&reply))
                        .await;
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let response = protocol::dispatch(&gateway, &line).await;
            if let Err(e) = write_half
                .write_all(&protocol::encode_response(&response))
                .await
            {
                error!(error = %e, "Write error");
                break;
            }
        }

        if let Some((_, state)) = connection_states.remove(&conn_id) {
            debug!(
                peer_uid = ?state.peer_uid,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                "Connection closed"
            );
        }
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id, "Aborting connection");
                state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to unwind
        tokio::time::sleep(ACCEPT_POLL).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Server stopped");
        Ok(())
    }

    /// Number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}
