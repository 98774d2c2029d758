//! Integration tests for ss-relay
//!
//! Every test runs a real relay on loopback, with echo servers standing in
//! for destinations and a small client built on the crate's own AEAD framing.
//!
//! # Test Organization
//!
//! - `common`: Relay harness, echo servers, and the test client
//! - `tcp_relay`: Key attribution on a shared port, rejection, and replay
//! - `udp_relay`: NAT sessions and idle expiry
//! - `reconcile`: Port lifecycle driven by desired key sets
//! - `ipc_management`: The Unix socket management interface
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests udp_relay
//! ```
//!
//! # Test Requirements
//!
//! - Tests bind ephemeral loopback ports and need no external network
//! - Destination policy is relaxed so loopback echo servers are reachable

pub mod common;
pub mod ipc_management;
pub mod reconcile;
pub mod tcp_relay;
pub mod udp_relay;
