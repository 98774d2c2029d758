//! IPC (Inter-Process Communication) module
//!
//! This module provides a Unix socket-based management interface for adding
//! and removing access keys at runtime.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded command or response
//!
//! # Example
//!
//! ```no_run
//! use ss_relay::ipc::{IpcClient, IpcCommand, IpcResponse};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/var/run/ss-relay.sock");
//!
//! let port = client.add_access_key("alice", 9000, None, "secret").await?;
//! println!("alice is served on port {port}");
//!
//! let response = client.send(IpcCommand::Status).await?;
//! if let IpcResponse::Status(status) = response {
//!     println!("{} keys on {} ports", status.access_keys, status.ports);
//! }
//! # Ok(())
//! # }
//! ```

mod handler;
mod protocol;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, ErrorPayload, IpcCommand, IpcResponse,
    ServerStatus, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};
