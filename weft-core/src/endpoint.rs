//! Endpoint parsing for listen and connect addresses.
//!
//! Turns textual addresses into [`SocketAddr`] values once at startup.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// A resolved TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`
    /// - `127.0.0.1:5555`
    /// - `[::1]:5555` (IPv6)
    /// - `*:5555` (any IPv4 interface)
    /// - `localhost:5555` (resolved through the system resolver)
    ///
    /// # Examples
    ///
    /// ```
    /// use weft_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert_eq!(endpoint.addr().port(), 5555);
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Endpoint listening on every IPv4 interface.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Endpoint listening on every IPv6 interface.
    #[must_use]
    pub const fn any_v6(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    }

    /// Loopback endpoint, handy for tests and demos.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.0
    }

    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(EndpointError::InvalidScheme(s.to_string())),
            None => s,
        };

        if let Some(port) = addr.strip_prefix("*:") {
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
            return Ok(Self::any(port));
        }

        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return Ok(Self(socket_addr));
        }

        // Hostname form; the port must still be numeric.
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(addr.to_string()))?;
        if host.is_empty() {
            return Err(EndpointError::InvalidAddress(addr.to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;

        addr.to_socket_addrs()
            .map_err(|_| EndpointError::InvalidAddress(addr.to_string()))?
            .next()
            .map(Self)
            .ok_or_else(|| EndpointError::InvalidAddress(addr.to_string()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.0)
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:// or a bare address)")]
    InvalidScheme(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Missing port in address: {0}")]
    MissingPort(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(endpoint.addr(), "127.0.0.1:5555".parse().unwrap());
        assert!(!endpoint.is_ipv6());
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let endpoint = Endpoint::parse("[::1]:5555").unwrap();
        assert!(endpoint.is_ipv6());
        assert_eq!(endpoint.addr().port(), 5555);
    }

    #[test]
    fn test_parse_wildcard() {
        let endpoint = Endpoint::parse("*:7000").unwrap();
        assert_eq!(endpoint, Endpoint::any(7000));
    }

    #[test]
    fn test_parse_localhost_name() {
        let endpoint = Endpoint::parse("localhost:6000").unwrap();
        assert!(endpoint.addr().ip().is_loopback());
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            Endpoint::parse("udp://127.0.0.1:5555"),
            Err(EndpointError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            Endpoint::parse("127.0.0.1:notaport"),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("localhost"),
            Err(EndpointError::MissingPort(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        let endpoint = Endpoint::localhost(5555);
        let text = endpoint.to_string();
        assert_eq!(text, "tcp://127.0.0.1:5555");
        assert_eq!(Endpoint::parse(&text).unwrap(), endpoint);
    }
}
