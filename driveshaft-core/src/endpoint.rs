//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Parses the `scheme://rest` URI forms accepted by bind and connect.
//! Only TCP and inproc are wired to real transports; the remaining
//! schemes parse so callers get a precise "unsupported transport"
//! error instead of a generic parse failure.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp://host:port[;interface]`
    Tcp(TcpEndpoint),
    /// Unix domain socket: `ipc:///path/to/socket`
    Ipc(PathBuf),
    /// In-process transport: `inproc://name`
    Inproc(String),
    /// UDP transport (parsed only)
    Udp(String),
    /// TIPC transport (parsed only)
    Tipc(String),
}

/// Host part of a TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TcpHost {
    /// `*` — all local interfaces
    Any,
    /// A literal IPv4 or IPv6 address
    Addr(IpAddr),
    /// A DNS name, resolved at connect/bind time
    Name(String),
}

/// Port part of a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpPort {
    /// `*` or `!` — let the OS assign an ephemeral port
    Ephemeral,
    /// A fixed port number
    Port(u16),
}

/// A parsed `tcp://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
    pub host: TcpHost,
    pub port: TcpPort,
    /// Optional `;interface` suffix. Accepted and carried through, but
    /// device binding is not applied.
    pub interface: Option<String>,
}

impl TcpEndpoint {
    /// Local address to bind. Wildcard hosts map to the unspecified
    /// address of the requested family; ephemeral ports map to 0.
    pub fn bind_addr(&self, ipv6: bool) -> Result<SocketAddr, EndpointError> {
        let port = match self.port {
            TcpPort::Ephemeral => 0,
            TcpPort::Port(p) => p,
        };
        let ip = match &self.host {
            TcpHost::Any => {
                if ipv6 {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                }
            }
            TcpHost::Addr(ip) => *ip,
            TcpHost::Name(name) => return resolve_name(name, port).map_err(EndpointError::Io),
        };
        Ok(SocketAddr::new(ip, port))
    }

    /// Remote address to connect to. Names resolve through the system
    /// resolver; the first address of an acceptable family wins.
    pub fn connect_addr(&self, ipv6: bool) -> Result<SocketAddr, EndpointError> {
        let port = match self.port {
            TcpPort::Ephemeral => {
                return Err(EndpointError::InvalidTcpAddress(
                    "cannot connect to a wildcard port".into(),
                ))
            }
            TcpPort::Port(p) => p,
        };
        match &self.host {
            TcpHost::Any => Err(EndpointError::InvalidTcpAddress(
                "cannot connect to a wildcard host".into(),
            )),
            TcpHost::Addr(ip) => Ok(SocketAddr::new(*ip, port)),
            TcpHost::Name(name) => {
                let addrs = (name.as_str(), port)
                    .to_socket_addrs()
                    .map_err(EndpointError::Io)?;
                let mut fallback = None;
                for addr in addrs {
                    if addr.is_ipv4() {
                        return Ok(addr);
                    }
                    if ipv6 && fallback.is_none() {
                        fallback = Some(addr);
                    }
                }
                fallback.ok_or_else(|| {
                    EndpointError::InvalidTcpAddress(format!("no usable address for {name}"))
                })
            }
        }
    }
}

fn resolve_name(name: &str, port: u16) -> std::io::Result<SocketAddr> {
    (name, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "name did not resolve"))
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// # Examples
    ///
    /// ```
    /// use driveshaft_core::endpoint::Endpoint;
    ///
    /// let ep = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert!(matches!(ep, Endpoint::Tcp(_)));
    ///
    /// let ep = Endpoint::parse("tcp://*:*").unwrap();
    /// assert!(matches!(ep, Endpoint::Tcp(_)));
    ///
    /// let ep = Endpoint::parse("inproc://pipeline").unwrap();
    /// assert!(matches!(ep, Endpoint::Inproc(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Returns true if this is a TCP endpoint.
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }

    /// Returns true if this is an inproc endpoint.
    #[must_use]
    pub const fn is_inproc(&self) -> bool {
        matches!(self, Endpoint::Inproc(_))
    }
}

fn parse_tcp(rest: &str) -> Result<TcpEndpoint, EndpointError> {
    // Split off a trailing `;interface`.
    let (addr, interface) = match rest.split_once(';') {
        Some((a, i)) if !i.is_empty() => (a, Some(i.to_string())),
        Some((a, _)) => (a, None),
        None => (rest, None),
    };

    // IPv6 literals are bracketed: [::1]:5555
    let (host_str, port_str) = if let Some(closing) = addr.strip_prefix('[') {
        let (host, tail) = closing
            .split_once(']')
            .ok_or_else(|| EndpointError::InvalidTcpAddress(addr.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| EndpointError::InvalidTcpAddress(addr.to_string()))?;
        (host, port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| EndpointError::InvalidTcpAddress(addr.to_string()))?
    };

    let host = if host_str == "*" {
        TcpHost::Any
    } else if let Ok(ip) = host_str.parse::<IpAddr>() {
        TcpHost::Addr(ip)
    } else if !host_str.is_empty() {
        TcpHost::Name(host_str.to_string())
    } else {
        return Err(EndpointError::InvalidTcpAddress(addr.to_string()));
    };

    let port = match port_str {
        "*" | "!" => TcpPort::Ephemeral,
        p => TcpPort::Port(
            p.parse::<u16>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?,
        ),
    };

    Ok(TcpEndpoint {
        host,
        port,
        interface,
    })
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            Ok(Endpoint::Tcp(parse_tcp(rest)?))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(EndpointError::InvalidTcpAddress(s.to_string()));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                Err(EndpointError::InvalidInprocName(
                    "inproc name cannot be empty".to_string(),
                ))
            } else {
                Ok(Endpoint::Inproc(name.to_string()))
            }
        } else if let Some(rest) = s.strip_prefix("udp://") {
            Ok(Endpoint::Udp(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("tipc://") {
            Ok(Endpoint::Tipc(rest.to_string()))
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(ep) => {
                write!(f, "tcp://")?;
                match &ep.host {
                    TcpHost::Any => write!(f, "*")?,
                    TcpHost::Addr(IpAddr::V6(ip)) => write!(f, "[{ip}]")?,
                    TcpHost::Addr(IpAddr::V4(ip)) => write!(f, "{ip}")?,
                    TcpHost::Name(name) => write!(f, "{name}")?,
                }
                match ep.port {
                    TcpPort::Ephemeral => write!(f, ":*")?,
                    TcpPort::Port(p) => write!(f, ":{p}")?,
                }
                if let Some(iface) = &ep.interface {
                    write!(f, ";{iface}")?;
                }
                Ok(())
            }
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
            Endpoint::Udp(rest) => write!(f, "udp://{rest}"),
            Endpoint::Tipc(rest) => write!(f, "tipc://{rest}"),
        }
    }
}

/// Errors that can occur when parsing or resolving endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid scheme in endpoint: {0} (expected tcp://, ipc://, inproc://, udp:// or tipc://)")]
    InvalidScheme(String),

    #[error("invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("invalid inproc name: {0}")]
    InvalidInprocName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EndpointError> for crate::error::DriveshaftError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::Io(e) => Self::Io(e),
            other => Self::InvalidEndpoint(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let ep = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:5555");
        let Endpoint::Tcp(tcp) = ep else { panic!() };
        assert_eq!(
            tcp.bind_addr(false).unwrap(),
            "127.0.0.1:5555".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_tcp_ipv6() {
        let ep = Endpoint::parse("tcp://[::1]:5555").unwrap();
        let Endpoint::Tcp(tcp) = ep else { panic!() };
        assert_eq!(tcp.host, TcpHost::Addr("::1".parse().unwrap()));
        assert_eq!(tcp.port, TcpPort::Port(5555));
    }

    #[test]
    fn test_parse_wildcards() {
        let Endpoint::Tcp(tcp) = Endpoint::parse("tcp://*:*").unwrap() else {
            panic!()
        };
        assert_eq!(tcp.host, TcpHost::Any);
        assert_eq!(tcp.port, TcpPort::Ephemeral);
        assert_eq!(tcp.bind_addr(false).unwrap().port(), 0);

        let Endpoint::Tcp(tcp) = Endpoint::parse("tcp://127.0.0.1:!").unwrap() else {
            panic!()
        };
        assert_eq!(tcp.port, TcpPort::Ephemeral);
    }

    #[test]
    fn test_parse_interface_suffix() {
        let Endpoint::Tcp(tcp) = Endpoint::parse("tcp://*:1234;eth0").unwrap() else {
            panic!()
        };
        assert_eq!(tcp.interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_connect_rejects_wildcards() {
        let Endpoint::Tcp(tcp) = Endpoint::parse("tcp://*:5555").unwrap() else {
            panic!()
        };
        assert!(tcp.connect_addr(false).is_err());
    }

    #[test]
    fn test_parse_inproc() {
        let ep = Endpoint::parse("inproc://my-endpoint").unwrap();
        assert!(ep.is_inproc());
        assert_eq!(ep.to_string(), "inproc://my-endpoint");
        assert!(Endpoint::parse("inproc://").is_err());
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:5555"),
            Err(EndpointError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_other_schemes_parse() {
        assert!(matches!(
            Endpoint::parse("udp://127.0.0.1:5555"),
            Ok(Endpoint::Udp(_))
        ));
        assert!(matches!(
            Endpoint::parse("ipc:///tmp/sock"),
            Ok(Endpoint::Ipc(_))
        ));
    }
}
