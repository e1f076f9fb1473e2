//! Inter-process communication between the server and its clients.
//!
//! This module provides Unix socket-based IPC using a JSON-over-newlines protocol.
//! The server runs an [`IpcServer`] in front of a [`SessionManager`]; clients
//! connect with [`IpcClient`].
//!
//! # Protocol
//!
//! - Each message is a single line of JSON followed by a newline
//! - Requests are sent from client to server using [`IpcRequest`]
//! - Responses are sent from server to client using [`IpcResponse`]
//! - After [`IpcRequest::Subscribe`] the connection only streams
//!   [`IpcResponse::Event`] lines
//!
//! # Socket Location
//!
//! Sockets are created in `~/.droidpilot/` with the naming pattern
//! `droidpilot_{name}.sock`. Use [`socket_path`] to get the path for a name.
//!
//! # Example
//!
//! ```no_run
//! use droidpilot_core::ipc::{IpcClient, IpcRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut client = IpcClient::connect("default").await.unwrap();
//!     let response = client
//!         .send(&IpcRequest::CreateSession {
//!             capabilities: json!({"platformName": "Android", "browserName": "chrome"}),
//!         })
//!         .await
//!         .unwrap();
//!     println!("Response: {:?}", response);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::DriverError;
use crate::journal::SessionEvent;
use crate::manager::{SessionManager, SessionSummary};

/// Errors that can occur during IPC operations.
#[derive(Error, Debug)]
pub enum IpcError {
    /// An I/O error occurred (connection, read, write).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server closed the connection.
    #[error("Connection closed")]
    Closed,
}

/// A request sent from client to server over the IPC connection.
///
/// Requests are serialized as JSON with a `type` tag discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Create a session and bring it to the ready state.
    CreateSession {
        /// Raw capabilities, flat or in a W3C envelope.
        capabilities: Value,
    },

    /// Delete a session.
    DeleteSession {
        /// The session to delete.
        session_id: String,
    },

    /// Execute a command on a session.
    Execute {
        /// The target session.
        session_id: String,
        /// The command to run.
        command: Command,
    },

    /// Stream a session's events on this connection.
    Subscribe {
        /// The session to watch.
        session_id: String,
    },

    /// List live sessions.
    ListSessions,

    /// Delete every session and stop the server.
    Shutdown,
}

/// A response sent from server to client over the IPC connection.
///
/// Responses are serialized as JSON with a `type` tag discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcResponse {
    /// A session was created.
    Session {
        /// The new session id.
        session_id: String,
        /// Capabilities as reported by the created session.
        capabilities: Value,
    },

    /// A command or deletion succeeded.
    Value {
        /// The returned value (`null` when there is none).
        value: Value,
    },

    /// Live sessions.
    Sessions {
        /// One entry per session.
        sessions: Vec<SessionSummary>,
    },

    /// A session event (sent to subscribers).
    Event {
        /// The event that occurred.
        event: SessionEvent,
    },

    /// An error occurred processing the request.
    Error {
        /// Remote-protocol error string.
        error: String,
        /// Human-readable error message.
        message: String,
    },

    /// The server is shutting down.
    ShutdownAck,
}

impl IpcResponse {
    fn from_error(err: &DriverError) -> Self {
        IpcResponse::Error {
            error: err.w3c_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Returns the droidpilot directory path (`~/.droidpilot/`).
///
/// Creates the directory if it doesn't exist.
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
pub fn droidpilot_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".droidpilot");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the Unix socket path for a server name
/// (e.g., `~/.droidpilot/droidpilot_default.sock`).
pub fn socket_path(name: &str) -> PathBuf {
    droidpilot_dir().join(format!("droidpilot_{}.sock", name))
}

/// Unix socket server in front of a [`SessionManager`].
///
/// Each client connection is handled on its own task. The socket file is
/// removed when the server is dropped.
pub struct IpcServer {
    manager: Arc<SessionManager>,
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl IpcServer {
    /// Creates a server listening on [`socket_path`]`(name)`.
    pub fn new(manager: Arc<SessionManager>, name: &str) -> Self {
        Self::with_socket_path(manager, socket_path(name))
    }

    /// Creates a server listening on an explicit path.
    pub fn with_socket_path(manager: Arc<SessionManager>, path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            socket_path: path.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until a client sends [`IpcRequest::Shutdown`]
    /// or the shutdown token is cancelled.
    ///
    /// Any existing socket file at the path is removed before binding.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Io`] if the socket cannot be bound or an accept fails
    pub async fn run(&self) -> Result<(), IpcError> {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove existing socket");
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "ipc server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    debug!("client connected");
                    let manager = self.manager.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, manager, shutdown).await {
                            debug!(error = %e, "client connection ended with error");
                        }
                    });
                }
                _ = self.shutdown.cancelled() => {
                    info!("ipc server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_client(
        stream: UnixStream,
        manager: Arc<SessionManager>,
        shutdown: CancellationToken,
    ) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }

            let request: IpcRequest = match serde_json::from_str(line.trim()) {
                Ok(request) => request,
                Err(e) => {
                    let response = IpcResponse::Error {
                        error: "invalid argument".to_string(),
                        message: format!("malformed request: {}", e),
                    };
                    write_response(&mut writer, &response).await?;
                    continue;
                }
            };

            let response = match request {
                IpcRequest::CreateSession { capabilities } => {
                    match manager.create_session(&capabilities).await {
                        Ok((session_id, capabilities)) => IpcResponse::Session {
                            session_id,
                            capabilities,
                        },
                        Err(e) => IpcResponse::from_error(&e),
                    }
                }
                IpcRequest::DeleteSession { session_id } => {
                    match manager.delete_session(&session_id).await {
                        Ok(_) => IpcResponse::Value { value: Value::Null },
                        Err(e) => IpcResponse::from_error(&e),
                    }
                }
                IpcRequest::Execute {
                    session_id,
                    command,
                } => match manager.execute(&session_id, command).await {
                    Ok(result) if result.success => IpcResponse::Value {
                        value: result.value,
                    },
                    Ok(result) => IpcResponse::Error {
                        error: result.error.unwrap_or("unknown error").to_string(),
                        message: result.message,
                    },
                    Err(e) => IpcResponse::from_error(&e),
                },
                IpcRequest::Subscribe { session_id } => {
                    match manager.subscribe(&session_id).await {
                        Ok(rx) => return Self::stream_events(rx, writer).await,
                        Err(e) => IpcResponse::from_error(&e),
                    }
                }
                IpcRequest::ListSessions => IpcResponse::Sessions {
                    sessions: manager.list_sessions().await,
                },
                IpcRequest::Shutdown => {
                    let reports = manager.delete_all().await;
                    debug!(deleted = reports.len(), "sessions deleted for shutdown");
                    write_response(&mut writer, &IpcResponse::ShutdownAck).await?;
                    shutdown.cancel();
                    return Ok(());
                }
            };

            write_response(&mut writer, &response).await?;
        }
        Ok(())
    }

    async fn stream_events(
        mut rx: tokio::sync::broadcast::Receiver<SessionEvent>,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), IpcError> {
        debug!("client subscribed to session events");
        while let Ok(event) = rx.recv().await {
            let ended = matches!(event, SessionEvent::Ended { .. });
            if write_response(&mut writer, &IpcResponse::Event { event })
                .await
                .is_err()
            {
                debug!("subscriber went away");
                break;
            }
            if ended {
                break;
            }
        }
        Ok(())
    }

    /// Returns a reference to the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to clean up socket on drop");
            }
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &IpcResponse) -> Result<(), IpcError> {
    let json = serde_json::to_string(response)? + "\n";
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Unix socket client for IPC communication.
pub struct IpcClient {
    stream: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connects to the server named `name`.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Io`] if the connection fails (e.g., server not running)
    pub async fn connect(name: &str) -> Result<Self, IpcError> {
        Self::connect_path(&socket_path(name)).await
    }

    /// Connects to a server socket at an explicit path.
    pub async fn connect_path(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            stream: BufReader::new(reader),
            writer,
        })
    }

    /// Sends a request and waits for the response line.
    ///
    /// # Errors
    ///
    /// - [`IpcError::Io`] if the send or receive fails
    /// - [`IpcError::Json`] if serialization or deserialization fails
    /// - [`IpcError::Closed`] if the server hung up before answering
    pub async fn send(&mut self, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
        let json = serde_json::to_string(request)? + "\n";
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        self.read_response().await
    }

    /// Subscribes to a session's events.
    ///
    /// Follow with [`Self::read_event`] in a loop; the connection can no
    /// longer be used for other requests.
    pub async fn subscribe(&mut self, session_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::Subscribe {
            session_id: session_id.to_string(),
        };
        let json = serde_json::to_string(&request)? + "\n";
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next streamed event.
    pub async fn read_event(&mut self) -> Result<IpcResponse, IpcError> {
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<IpcResponse, IpcError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(IpcError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}
