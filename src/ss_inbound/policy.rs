//! Upstream destination policy
//!
//! Clients may ask the relay to reach any address. Unless explicitly
//! allowed, targets inside non-public ranges are refused so that the relay
//! cannot be used to reach the host's own network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::lookup_host;

use super::error::{ShadowsocksInboundError, ShadowsocksInboundResult};
use crate::shadowsocks::ShadowsocksDestination;

/// Whether `ip` is outside the publicly routable address space
#[must_use]
pub fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_non_public_v4(ip),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_non_public_v4(mapped);
            }
            is_non_public_v6(ip)
        }
    }
}

fn is_non_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        // 100.64.0.0/10 (CGNAT)
        || (a == 100 && (b & 0xc0) == 64)
        // 198.18.0.0/15 (benchmarking)
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 (reserved)
        || a >= 240
}

fn is_non_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 (unique local)
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 (link-local)
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 (documentation)
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// Policy applied to every upstream target
#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationPolicy {
    allow_private: bool,
}

impl DestinationPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Whether non-public targets are allowed
    #[must_use]
    pub const fn allows_private(&self) -> bool {
        self.allow_private
    }

    /// Check a resolved target address
    ///
    /// # Errors
    ///
    /// Returns `DestinationDenied` for a non-public address when those are not allowed.
    pub fn check(&self, addr: SocketAddr) -> ShadowsocksInboundResult<()> {
        if !self.allow_private && is_non_public(addr.ip()) {
            return Err(ShadowsocksInboundError::DestinationDenied(addr.to_string()));
        }
        Ok(())
    }

    /// Resolve `dest` and return the first permitted address
    ///
    /// # Errors
    ///
    /// - `ConnectFailed` if a domain does not resolve
    /// - `DestinationDenied` if no resolved address is permitted
    pub async fn resolve(&self, dest: &ShadowsocksDestination) -> ShadowsocksInboundResult<SocketAddr> {
        match dest {
            ShadowsocksDestination::SocketAddr(addr) => {
                self.check(*addr)?;
                Ok(*addr)
            }
            ShadowsocksDestination::DomainName { domain, port } => {
                let addrs = lookup_host((domain.as_str(), *port))
                    .await
                    .map_err(|e| ShadowsocksInboundError::connect_failed(dest, e.to_string()))?;

                let mut saw_any = false;
                for addr in addrs {
                    saw_any = true;
                    if self.check(addr).is_ok() {
                        return Ok(addr);
                    }
                }
                if saw_any {
                    Err(ShadowsocksInboundError::DestinationDenied(dest.to_string()))
                } else {
                    Err(ShadowsocksInboundError::connect_failed(dest, "no addresses"))
                }
            }
        }
    }
}
