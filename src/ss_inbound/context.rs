//! Shared relay context
//!
//! Everything the relay services of every port share: timeouts and policy,
//! the process-wide replay cache, and the metrics sink. The reconciler owns
//! one `RelayContext` and hands an `Arc` of it to each port binding.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use super::policy::DestinationPolicy;
use super::replay::ReplayCache;
use crate::config::ServerConfig;
use crate::stats::{NoopMetrics, RelayMetrics};

/// Default TCP handshake read deadline
pub const DEFAULT_TCP_READ_TIMEOUT: Duration = Duration::from_secs(59);

/// Default NAT session idle timeout (RFC 4787 REQ-5 minimum)
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default upstream TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables applied to every port binding
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Address every port is bound on
    pub listen_ip: IpAddr,
    /// Deadline for identification and reading the target address
    pub tcp_read_timeout: Duration,
    /// Deadline for connecting to a TCP target
    pub connect_timeout: Duration,
    /// Idle time after which a NAT session is removed
    pub nat_timeout: Duration,
    /// Listen backlog of each TCP listener
    pub tcp_backlog: u32,
    /// Consecutive ports tried when a requested port cannot be bound
    pub port_scan_limit: u16,
    /// Upstream destination policy
    pub policy: DestinationPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_read_timeout: DEFAULT_TCP_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nat_timeout: DEFAULT_NAT_TIMEOUT,
            tcp_backlog: 1024,
            port_scan_limit: 16,
            policy: DestinationPolicy::default(),
        }
    }
}

impl From<&ServerConfig> for RelaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            listen_ip: config.listen_ip,
            tcp_read_timeout: Duration::from_secs(config.tcp_read_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            nat_timeout: Duration::from_secs(config.nat_timeout_secs),
            tcp_backlog: config.tcp_backlog,
            port_scan_limit: config.port_scan_limit,
            policy: DestinationPolicy::new(config.allow_private_destinations),
        }
    }
}

/// State shared by the relay services of all ports
pub struct RelayContext {
    /// Tunables
    pub settings: RelaySettings,
    /// Process-wide salt history
    pub replay: ReplayCache,
    /// Metrics sink
    pub metrics: Arc<dyn RelayMetrics>,
}

impl RelayContext {
    /// Create a context
    #[must_use]
    pub fn new(settings: RelaySettings, replay_history: usize, metrics: Arc<dyn RelayMetrics>) -> Self {
        Self {
            settings,
            replay: ReplayCache::new(replay_history),
            metrics,
        }
    }

    /// Context from server configuration
    #[must_use]
    pub fn from_config(config: &ServerConfig, metrics: Arc<dyn RelayMetrics>) -> Self {
        Self::new(RelaySettings::from(config), config.replay_history, metrics)
    }

    /// Context with default settings and no metrics
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RelaySettings::default(), 0, Arc::new(NoopMetrics))
    }
}

impl fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayContext")
            .field("settings", &self.settings)
            .field("replay_history", &self.replay.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_server_config() {
        let config = ServerConfig {
            nat_timeout_secs: 1,
            tcp_read_timeout_secs: 2,
            connect_timeout_secs: 3,
            allow_private_destinations: true,
            ..ServerConfig::default()
        };
        let settings = RelaySettings::from(&config);
        assert_eq!(settings.nat_timeout, Duration::from_secs(1));
        assert_eq!(settings.tcp_read_timeout, Duration::from_secs(2));
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert!(settings.policy.allows_private());
    }

    #[test]
    fn test_defaults() {
        let ctx = RelayContext::with_defaults();
        assert_eq!(ctx.settings.tcp_read_timeout, DEFAULT_TCP_READ_TIMEOUT);
        assert_eq!(ctx.settings.nat_timeout, DEFAULT_NAT_TIMEOUT);
        assert!(!ctx.replay.is_enabled());
    }
}
