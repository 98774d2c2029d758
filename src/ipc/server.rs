//! Management socket server and client
//!
//! One task per connection; each connection may carry any number of
//! request/response exchanges until the peer hangs up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcResponse, LENGTH_PREFIX_SIZE,
    MAX_MESSAGE_SIZE,
};
use crate::config::IpcConfig;
use crate::error::IpcError;

/// Unix socket server dispatching management commands to an [`IpcHandler`]
pub struct IpcServer {
    /// Socket path, mode, and frame limit
    config: IpcConfig,

    /// Shared with SIGHUP handling in the binary
    handler: Arc<IpcHandler>,
}

impl IpcServer {
    /// Server over `handler`; nothing is bound until [`IpcServer::run`]
    pub fn new(config: IpcConfig, handler: Arc<IpcHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the Unix socket, replacing a stale socket file
    fn bind(&self) -> Result<UnixListener, IpcError> {
        let socket_path = &self.config.socket_path;
        let bind_error = |reason: String| IpcError::BindError {
            path: socket_path.display().to_string(),
            reason,
        };

        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .map_err(|e| bind_error(format!("Failed to remove existing socket: {e}")))?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| bind_error(format!("Failed to create parent directory: {e}")))?;
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| bind_error(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(self.config.socket_mode);
            std::fs::set_permissions(socket_path, permissions)
                .map_err(|e| bind_error(format!("Failed to set permissions: {e}")))?;
        }

        Ok(listener)
    }

    /// Run the IPC server until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns `IpcError::BindError` if the socket cannot be created.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("IPC server disabled");
            return Ok(());
        }

        let listener = self.bind()?;
        info!("IPC server listening on {:?}", self.config.socket_path);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let max_size = self.config.max_message_size;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, max_size).await {
                                    debug!("IPC connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }

        Ok(())
    }
}

/// Serve one client until it disconnects or sends `shutdown`
async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<IpcHandler>,
    max_message_size: usize,
) -> Result<(), IpcError> {
    debug!("IPC client connected");

    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("IPC client disconnected");
                return Ok(());
            }
            Err(e) => return Err(IpcError::from(e)),
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;

        // The body cannot be skipped safely, so an oversized frame ends the connection
        if msg_len > max_message_size {
            warn!(
                "IPC message too large: {} bytes (max {})",
                msg_len, max_message_size
            );
            let response = IpcResponse::error(
                ErrorCode::InvalidParameters,
                format!("Message too large: {msg_len} bytes"),
            );
            send_response(&mut stream, &response).await?;
            return Err(IpcError::protocol(format!("message of {msg_len} bytes rejected")));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        let command: IpcCommand = match decode_message(&msg_buf) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Invalid IPC command: {}", e);
                let response = IpcResponse::error(
                    ErrorCode::InvalidCommand,
                    format!("Invalid command format: {e}"),
                );
                send_response(&mut stream, &response).await?;
                continue;
            }
        };

        let is_shutdown = matches!(command, IpcCommand::Shutdown);

        let response = handler.handle(command).await;
        send_response(&mut stream, &response).await?;

        if is_shutdown {
            debug!("Shutdown command received, closing connection");
            break;
        }
    }

    Ok(())
}

/// Write one length-prefixed response frame
async fn send_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<(), IpcError> {
    let encoded = encode_message(response).map_err(|e| IpcError::serialization(e.to_string()))?;

    stream.write_all(&encoded).await?;
    stream.flush().await?;

    Ok(())
}

/// Client for the management socket; opens a new connection per request
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Client for the socket at `socket_path`
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send one command and wait for its response
    ///
    /// # Errors
    ///
    /// Returns `IpcError` if the socket is unreachable or the response is
    /// malformed.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(e.to_string()))?;

        let encoded =
            encode_message(&command).map_err(|e| IpcError::serialization(e.to_string()))?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            return Err(IpcError::protocol(format!(
                "Response too large: {msg_len} bytes"
            )));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        decode_message(&msg_buf).map_err(|e| IpcError::protocol(e.to_string()))
    }

    /// Whether the server answers `ping`
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let response = self.send(IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Add an access key; returns the port actually used
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ProtocolError` carrying the server's error message
    /// if the key was not added.
    pub async fn add_access_key(
        &self,
        id: impl Into<String>,
        port: u16,
        cipher: Option<String>,
        secret: impl Into<String>,
    ) -> Result<u16, IpcError> {
        let response = self
            .send(IpcCommand::AddAccessKey {
                id: id.into(),
                port,
                cipher,
                secret: secret.into(),
            })
            .await?;
        match response {
            IpcResponse::AccessKeyAdded { port, .. } => Ok(port),
            other => Err(unexpected(other)),
        }
    }

    /// Whether an access key is served on a port
    pub async fn access_key_status(&self, id: impl Into<String>, port: u16) -> Result<bool, IpcError> {
        let response = self
            .send(IpcCommand::AccessKeyStatus {
                id: id.into(),
                port,
            })
            .await?;
        match response {
            IpcResponse::AccessKeyStatus { active, .. } => Ok(active),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error(e) => IpcError::protocol(e.to_string()),
        other => IpcError::protocol(format!("unexpected response: {other:?}")),
    }
}
