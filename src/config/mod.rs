//! Configuration module for ss-relay
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use ss_relay::config::load_config;
//!
//! let config = load_config("/etc/ss-relay/config.json").unwrap();
//! println!("{} access keys", config.keys.len());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env,
};
pub use types::{AccessKeyConfig, IpcConfig, LogConfig, ServerConfig, SsRelayConfig};
