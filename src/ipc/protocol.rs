//! Management protocol messages
//!
//! Commands and responses exchanged over the management socket, and the
//! frame encoding shared by server and client. A frame is a 4-byte
//! big-endian body length followed by that many bytes of JSON.

use serde::{Deserialize, Serialize};

use crate::ss_inbound::{PortStatus, ReconcileSummary};
use crate::stats::StatsSnapshot;

/// Request sent by a management client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Liveness probe
    Ping,

    /// Port, key, and session counts
    Status,

    /// Get relay statistics
    GetStats,

    /// List bound ports with their access keys
    ListPorts,

    /// Add an access key, opening its port if needed
    ///
    /// The response carries the port actually used, which differs from
    /// `port` when that port could not be bound.
    AddAccessKey {
        /// Access key identity
        id: String,
        /// Requested port
        port: u16,
        /// Cipher method (default: chacha20-ietf-poly1305)
        #[serde(default)]
        cipher: Option<String>,
        /// Shared secret
        secret: String,
    },

    /// Remove an access key; the port closes with its last key
    RemoveAccessKey {
        /// Access key identity
        id: String,
        /// Port the key is served on
        port: u16,
    },

    /// Whether an access key is served on a port
    AccessKeyStatus {
        /// Access key identity
        id: String,
        /// Port number
        port: u16,
    },

    /// Whether anything accepts TCP connections on localhost:port
    CheckPort {
        /// Port number
        port: u16,
    },

    /// Reload access keys from a configuration file
    Reload {
        /// Path to configuration file (uses the startup path if None)
        #[serde(default)]
        config_path: Option<String>,
    },

    /// Close every port and stop the process
    Shutdown,
}

impl IpcCommand {
    /// Command name as it appears in the `type` field
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Status => "status",
            Self::GetStats => "get_stats",
            Self::ListPorts => "list_ports",
            Self::AddAccessKey { .. } => "add_access_key",
            Self::RemoveAccessKey { .. } => "remove_access_key",
            Self::AccessKeyStatus { .. } => "access_key_status",
            Self::CheckPort { .. } => "check_port",
            Self::Reload { .. } => "reload",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Reply to an [`IpcCommand`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Answer to `ping`
    Pong,

    /// Answer to `status`
    Status(ServerStatus),

    /// Answer to `get_stats`
    Stats(StatsSnapshot),

    /// Bound ports
    PortList {
        /// Ports in ascending order
        ports: Vec<PortStatus>,
    },

    /// Access key added
    AccessKeyAdded {
        /// Access key identity
        id: String,
        /// Port the key is served on
        port: u16,
    },

    /// Access key removed
    AccessKeyRemoved {
        /// Access key identity
        id: String,
        /// Port number
        port: u16,
        /// Whether the key was present before removal
        existed: bool,
        /// Whether the port was closed because it became empty
        port_closed: bool,
    },

    /// Access key presence
    AccessKeyStatus {
        /// Access key identity
        id: String,
        /// Port number
        port: u16,
        /// Whether the key is served on the port
        active: bool,
    },

    /// Port check result
    PortCheck {
        /// Port number
        port: u16,
        /// Whether a TCP connection to localhost:port succeeded
        accepting: bool,
    },

    /// Reload result
    Reloaded(ReconcileSummary),

    /// Command carried out, nothing to return
    Success {
        /// Human-readable detail
        message: Option<String>,
    },

    /// Command refused or failed
    Error(ErrorPayload),
}

impl IpcResponse {
    /// Bare success
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    /// Success with a detail message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success {
            message: Some(msg.into()),
        }
    }

    /// Failure with a code and message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Whether the command failed
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Snapshot returned by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Crate version
    pub version: String,
    /// Seconds since the process started
    pub uptime_secs: u64,
    /// Bound ports
    pub ports: usize,
    /// Access keys across all ports
    pub access_keys: usize,
    /// Active TCP connections
    pub active_connections: u64,
    /// Active NAT sessions
    pub nat_sessions: u64,
    /// Replay cache capacity (0 when disabled)
    pub replay_history: usize,
    /// Timestamp of the last successful reload (Unix epoch milliseconds, 0 if never)
    pub last_reload_ms: u64,
    /// Set once `shutdown` has been accepted
    pub shutting_down: bool,
}

/// Error body of an IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable category
    pub code: ErrorCode,
    /// Detail for humans
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorPayload {}

/// Failure categories, serialized in SCREAMING_SNAKE_CASE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Frame did not decode as a command
    InvalidCommand,
    /// Command decoded but a field is unusable
    InvalidParameters,
    /// Port or key does not exist
    NotFound,
    /// Key id already present on the port
    AlreadyExists,
    /// Bind, reload, or scan failed
    OperationFailed,
    /// Refused because shutdown has begun
    ShuttingDown,
    /// Unexpected failure
    InternalError,
}

/// Largest response body a client accepts
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Bytes of the big-endian `u32` length that precedes every JSON body
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Serialize `msg` and prepend its length
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode the JSON body of a length-prefixed message
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
