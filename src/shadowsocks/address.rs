//! Shadowsocks target address
//!
//! The first decrypted bytes of every TCP stream and UDP packet carry the
//! target address in SOCKS5 form:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! Decoding and encoding go through `shadowsocks::relay::socks5::Address`.

use std::io::Cursor;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use shadowsocks::relay::socks5::Address as SsAddress;

use super::error::ShadowsocksError;

/// Shadowsocks destination information
///
/// Represents the target address extracted from a Shadowsocks request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShadowsocksDestination {
    /// IP address and port
    SocketAddr(SocketAddr),

    /// Domain name and port
    DomainName {
        /// Domain name
        domain: String,
        /// Port number
        port: u16,
    },
}

impl ShadowsocksDestination {
    /// Create a destination from a socket address
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::SocketAddr(addr)
    }

    /// Create a destination from a domain name and port
    #[must_use]
    pub fn from_domain(domain: impl Into<String>, port: u16) -> Self {
        Self::DomainName {
            domain: domain.into(),
            port,
        }
    }

    /// Get the port number
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::SocketAddr(addr) => addr.port(),
            Self::DomainName { port, .. } => *port,
        }
    }

    /// Convert to a socket address if possible
    ///
    /// Returns `None` for domain names (requires DNS resolution).
    #[must_use]
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::SocketAddr(addr) => Some(*addr),
            Self::DomainName { .. } => None,
        }
    }

    /// Parse an address from the front of `buf`
    ///
    /// Returns the address and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` for an unknown address type, a truncated
    /// buffer, or a domain that is empty or not valid UTF-8.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ShadowsocksError> {
        if buf.is_empty() {
            return Err(ShadowsocksError::protocol("empty address"));
        }
        let mut cursor = Cursor::new(buf);
        let addr = SsAddress::read_cursor(&mut cursor)
            .map_err(|e| ShadowsocksError::protocol(format!("bad target address: {e}")))?;
        let used = usize::try_from(cursor.position())
            .map_err(|_| ShadowsocksError::protocol("address offset overflow"))?;

        let dest = Self::from(addr);
        if matches!(&dest, Self::DomainName { domain, .. } if domain.is_empty()) {
            return Err(ShadowsocksError::protocol("empty domain name"));
        }
        Ok((dest, used))
    }

    /// Number of bytes `write_to` appends
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        self.to_ss_address().serialized_len()
    }

    /// Append the SOCKS5 encoding of this address to `out`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if a domain name exceeds 255 bytes.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ShadowsocksError> {
        if let Self::DomainName { domain, .. } = self {
            if domain.len() > usize::from(u8::MAX) {
                return Err(ShadowsocksError::protocol("domain name longer than 255 bytes"));
            }
        }
        self.to_ss_address().write_to_buf(out);
        Ok(())
    }

    /// Convert to the shadowsocks crate's address type
    #[must_use]
    pub fn to_ss_address(&self) -> SsAddress {
        match self {
            Self::SocketAddr(addr) => SsAddress::SocketAddress(*addr),
            Self::DomainName { domain, port } => SsAddress::DomainNameAddress(domain.clone(), *port),
        }
    }
}

impl From<SsAddress> for ShadowsocksDestination {
    fn from(addr: SsAddress) -> Self {
        match addr {
            SsAddress::SocketAddress(addr) => Self::SocketAddr(addr),
            SsAddress::DomainNameAddress(domain, port) => Self::DomainName { domain, port },
        }
    }
}

impl From<SocketAddr> for ShadowsocksDestination {
    fn from(addr: SocketAddr) -> Self {
        Self::SocketAddr(addr)
    }
}

impl std::fmt::Display for ShadowsocksDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SocketAddr(addr) => write!(f, "{addr}"),
            Self::DomainName { domain, port } => write!(f, "{domain}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_from_socket_addr() {
        let addr: SocketAddr = "192.168.1.1:443".parse().unwrap();
        let dest = ShadowsocksDestination::from_socket_addr(addr);

        assert_eq!(dest.port(), 443);
        assert_eq!(dest.as_socket_addr(), Some(addr));
        assert_eq!(dest.to_string(), "192.168.1.1:443");
    }

    #[test]
    fn test_parse_ipv4_with_trailing_payload() {
        let buf = [0x01, 8, 8, 4, 4, 0x00, 0x35, b'h', b'i'];
        let (dest, used) = ShadowsocksDestination::parse(&buf).unwrap();
        assert_eq!(used, 7);
        assert_eq!(dest.to_string(), "8.8.4.4:53");
        assert_eq!(&buf[used..], b"hi");
    }

    #[test]
    fn test_parse_domain() {
        let mut buf = vec![0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());
        let (dest, used) = ShadowsocksDestination::parse(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(dest, ShadowsocksDestination::from_domain("example.com", 443));
        assert!(dest.as_socket_addr().is_none());
    }

    #[test]
    fn test_parse_ipv6() {
        let dest = ShadowsocksDestination::from_socket_addr("[2001:db8::1]:8080".parse().unwrap());
        let mut buf = Vec::new();
        dest.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), dest.serialized_len());
        let (parsed, used) = ShadowsocksDestination::parse(&buf).unwrap();
        assert_eq!(used, 19);
        assert_eq!(parsed, dest);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ShadowsocksDestination::parse(&[]).is_err());
        assert!(ShadowsocksDestination::parse(&[0x01, 1, 2, 3]).is_err());
        assert!(ShadowsocksDestination::parse(&[0x03, 0, 0, 80]).is_err());
        assert!(ShadowsocksDestination::parse(&[0x03, 5, b'a']).is_err());
        assert!(ShadowsocksDestination::parse(&[0x05, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(ShadowsocksDestination::parse(&[0x03, 2, 0xff, 0xfe, 0, 80]).is_err());
    }

    #[test]
    fn test_ss_address_conversion() {
        let dest = ShadowsocksDestination::from_domain("example.org", 853);
        let ss = dest.to_ss_address();
        assert_eq!(ss.port(), 853);
        assert_eq!(ShadowsocksDestination::from(ss), dest);

        let addr: SocketAddr = "[::1]:53".parse().unwrap();
        assert_eq!(
            ShadowsocksDestination::from(SsAddress::SocketAddress(addr)),
            ShadowsocksDestination::from_socket_addr(addr)
        );
    }

    #[test]
    fn test_write_rejects_long_domain() {
        let dest = ShadowsocksDestination::from_domain("a".repeat(256), 80);
        assert!(dest.write_to(&mut Vec::new()).is_err());
    }
}
