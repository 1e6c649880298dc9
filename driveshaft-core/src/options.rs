//! Socket configuration options.
//!
//! [`Options`] is the full per-socket configuration record; a copy
//! travels with every I/O-side object the socket launches, so a later
//! option change affects only future connections. [`SocketOption`] is
//! the typed tag surface applied through `Socket::set_option`.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{DriveshaftError, Result};
use crate::socket_type::SocketType;

/// TCP keepalive knobs. `None` leaves the OS default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepaliveCfg {
    pub enabled: Option<bool>,
    pub count: Option<u32>,
    pub idle: Option<Duration>,
    pub interval: Option<Duration>,
}

/// A CIDR allow-list entry for accepted TCP peers.
///
/// Matching is strict on address family: a v4 filter never matches a
/// v6 peer and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrFilter {
    addr: IpAddr,
    prefix: u8,
}

impl CidrFilter {
    /// Parse `a.b.c.d/len` or `addr6/len`; a bare address implies a
    /// full-length prefix.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| DriveshaftError::invalid_argument(format!("bad filter address: {s}")))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_str {
            None => max,
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| {
                    DriveshaftError::invalid_argument(format!("bad filter prefix: {s}"))
                })?,
        };
        Ok(Self { addr, prefix })
    }

    /// Check a peer address against this filter.
    #[must_use]
    pub fn matches(&self, peer: IpAddr) -> bool {
        match (self.addr, peer) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Socket configuration record.
#[derive(Debug, Clone)]
pub struct Options {
    /// The pattern this socket speaks; fixed at creation.
    pub socket_type: SocketType,

    /// Outbound high-water mark: maximum in-flight messages per pipe
    /// toward a peer. 0 means unlimited.
    pub sndhwm: u32,

    /// Inbound high-water mark. 0 means unlimited.
    pub rcvhwm: u32,

    /// How long a closed socket keeps draining queued outbound
    /// messages. `None` drains forever; zero drops immediately.
    pub linger: Option<Duration>,

    /// Base reconnect interval for failed or lost connections.
    pub reconnect_ivl: Duration,

    /// Backoff ceiling. Zero disables exponential backoff.
    pub reconnect_ivl_max: Duration,

    /// Give up an in-progress TCP connect after this long. Zero leaves
    /// it to the OS.
    pub connect_timeout: Duration,

    /// Abort a connection whose protocol handshake has not completed
    /// within this window. Zero disables the timer.
    pub handshake_ivl: Duration,

    /// Send timeout. `None` blocks forever; zero means non-blocking.
    pub sndtimeo: Option<Duration>,

    /// Receive timeout. `None` blocks forever; zero means non-blocking.
    pub rcvtimeo: Option<Duration>,

    /// Only queue messages once a connection is live, instead of
    /// pre-attaching the pipe at connect time.
    pub immediate: bool,

    /// Allow IPv6 addresses on this socket's transports.
    pub ipv6: bool,

    pub keepalive: KeepaliveCfg,

    /// IP type-of-service byte for new connections. 0 leaves it unset.
    pub tos: u32,

    /// SO_SNDBUF for new connections.
    pub sndbuf: Option<usize>,

    /// SO_RCVBUF for new connections.
    pub rcvbuf: Option<usize>,

    /// Listen backlog.
    pub backlog: i32,

    /// Reject inbound messages larger than this.
    pub maxmsgsize: Option<u64>,

    /// Identity announced to peers during the handshake.
    pub routing_id: Option<Bytes>,

    /// Identity assigned to the next outgoing connection; consumed by
    /// that connect call.
    pub connect_routing_id: Option<Bytes>,

    /// ROUTER: error on sends to unknown peers instead of dropping.
    pub router_mandatory: bool,

    /// ROUTER: a reconnecting peer takes over its old identity.
    pub router_handover: bool,

    /// Send an empty probe message on every new ROUTER connection.
    pub probe_router: bool,

    /// XPUB: surface duplicate subscription messages too.
    pub xpub_verbose: bool,

    /// CIDR allow-list applied by TCP listeners. Empty accepts all.
    pub accept_filters: Vec<CidrFilter>,
}

impl Options {
    #[must_use]
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            sndhwm: 1000,
            rcvhwm: 1000,
            linger: None,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            handshake_ivl: Duration::from_secs(30),
            sndtimeo: None,
            rcvtimeo: None,
            immediate: false,
            ipv6: false,
            keepalive: KeepaliveCfg::default(),
            tos: 0,
            sndbuf: None,
            rcvbuf: None,
            backlog: 100,
            maxmsgsize: None,
            routing_id: None,
            connect_routing_id: None,
            router_mandatory: false,
            router_handover: false,
            probe_router: false,
            xpub_verbose: false,
            accept_filters: Vec::new(),
        }
    }

    /// Apply one option, validating its value.
    ///
    /// Subscribe/unsubscribe are handled by the pattern layer before
    /// this is reached.
    pub fn set(&mut self, opt: SocketOption) -> Result<()> {
        match opt {
            SocketOption::SendHwm(v) => self.sndhwm = v,
            SocketOption::RecvHwm(v) => self.rcvhwm = v,
            SocketOption::Linger(v) => self.linger = v,
            SocketOption::ReconnectIvl(v) => self.reconnect_ivl = v,
            SocketOption::ReconnectIvlMax(v) => self.reconnect_ivl_max = v,
            SocketOption::ConnectTimeout(v) => self.connect_timeout = v,
            SocketOption::HandshakeIvl(v) => self.handshake_ivl = v,
            SocketOption::SendTimeout(v) => self.sndtimeo = v,
            SocketOption::RecvTimeout(v) => self.rcvtimeo = v,
            SocketOption::Immediate(v) => self.immediate = v,
            SocketOption::Ipv6(v) => self.ipv6 = v,
            SocketOption::TcpKeepalive(v) => self.keepalive.enabled = v,
            SocketOption::TcpKeepaliveCount(v) => {
                if v == 0 {
                    return Err(DriveshaftError::invalid_argument("keepalive count is zero"));
                }
                self.keepalive.count = Some(v);
            }
            SocketOption::TcpKeepaliveIdle(v) => self.keepalive.idle = Some(v),
            SocketOption::TcpKeepaliveInterval(v) => self.keepalive.interval = Some(v),
            SocketOption::TypeOfService(v) => {
                if v > 255 {
                    return Err(DriveshaftError::invalid_argument("TOS exceeds one byte"));
                }
                self.tos = v;
            }
            SocketOption::SendBuffer(v) => self.sndbuf = Some(v),
            SocketOption::RecvBuffer(v) => self.rcvbuf = Some(v),
            SocketOption::Backlog(v) => {
                if v <= 0 {
                    return Err(DriveshaftError::invalid_argument("backlog must be positive"));
                }
                self.backlog = v;
            }
            SocketOption::MaxMessageSize(v) => self.maxmsgsize = v,
            SocketOption::RoutingId(id) => {
                validate_routing_id(&id)?;
                self.routing_id = Some(id);
            }
            SocketOption::ConnectRoutingId(id) => {
                validate_routing_id(&id)?;
                self.connect_routing_id = Some(id);
            }
            SocketOption::RouterMandatory(v) => self.router_mandatory = v,
            SocketOption::RouterHandover(v) => self.router_handover = v,
            SocketOption::ProbeRouter(v) => self.probe_router = v,
            SocketOption::XpubVerbose(v) => self.xpub_verbose = v,
            SocketOption::AcceptFilter(spec) => self.accept_filters.push(CidrFilter::parse(&spec)?),
            SocketOption::ClearAcceptFilters => self.accept_filters.clear(),
            SocketOption::Subscribe(_) | SocketOption::Unsubscribe(_) => {
                return Err(DriveshaftError::invalid_argument(
                    "subscriptions only apply to SUB/XSUB sockets",
                ))
            }
        }
        Ok(())
    }

    /// Non-blocking send configured?
    #[must_use]
    pub fn is_send_nonblocking(&self) -> bool {
        matches!(self.sndtimeo, Some(d) if d.is_zero())
    }

    /// Non-blocking receive configured?
    #[must_use]
    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.rcvtimeo, Some(d) if d.is_zero())
    }
}

/// One settable socket option.
#[derive(Debug, Clone)]
pub enum SocketOption {
    SendHwm(u32),
    RecvHwm(u32),
    Linger(Option<Duration>),
    ReconnectIvl(Duration),
    ReconnectIvlMax(Duration),
    ConnectTimeout(Duration),
    HandshakeIvl(Duration),
    SendTimeout(Option<Duration>),
    RecvTimeout(Option<Duration>),
    Immediate(bool),
    Ipv6(bool),
    TcpKeepalive(Option<bool>),
    TcpKeepaliveCount(u32),
    TcpKeepaliveIdle(Duration),
    TcpKeepaliveInterval(Duration),
    TypeOfService(u32),
    SendBuffer(usize),
    RecvBuffer(usize),
    Backlog(i32),
    MaxMessageSize(Option<u64>),
    RoutingId(Bytes),
    ConnectRoutingId(Bytes),
    RouterMandatory(bool),
    RouterHandover(bool),
    ProbeRouter(bool),
    XpubVerbose(bool),
    /// SUB/XSUB: add a prefix subscription.
    Subscribe(Bytes),
    /// SUB/XSUB: drop a prefix subscription.
    Unsubscribe(Bytes),
    AcceptFilter(String),
    ClearAcceptFilters,
}

fn validate_routing_id(id: &Bytes) -> Result<()> {
    if id.is_empty() {
        return Err(DriveshaftError::invalid_argument("routing id cannot be empty"));
    }
    if id.len() > 255 {
        return Err(DriveshaftError::invalid_argument(format!(
            "routing id cannot exceed 255 bytes (got {})",
            id.len()
        )));
    }
    if id[0] == 0 {
        return Err(DriveshaftError::invalid_argument(
            "routing id cannot start with a zero byte (reserved for generated ids)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::new(SocketType::Dealer);
        assert_eq!(opts.sndhwm, 1000);
        assert_eq!(opts.rcvhwm, 1000);
        assert_eq!(opts.reconnect_ivl, Duration::from_millis(100));
        assert_eq!(opts.handshake_ivl, Duration::from_secs(30));
        assert!(opts.linger.is_none());
        assert!(!opts.is_send_nonblocking());
    }

    #[test]
    fn test_set_and_validate() {
        let mut opts = Options::new(SocketType::Push);
        opts.set(SocketOption::SendHwm(10)).unwrap();
        assert_eq!(opts.sndhwm, 10);

        assert!(opts.set(SocketOption::TypeOfService(300)).is_err());
        assert!(opts.set(SocketOption::Backlog(0)).is_err());
        assert!(opts
            .set(SocketOption::RoutingId(Bytes::from_static(b"")))
            .is_err());
        assert!(opts
            .set(SocketOption::RoutingId(Bytes::from_static(b"\x00peer")))
            .is_err());
        opts.set(SocketOption::RoutingId(Bytes::from_static(b"worker-01")))
            .unwrap();
    }

    #[test]
    fn test_nonblocking_flags() {
        let mut opts = Options::new(SocketType::Pull);
        opts.set(SocketOption::RecvTimeout(Some(Duration::ZERO)))
            .unwrap();
        assert!(opts.is_recv_nonblocking());
        opts.set(SocketOption::RecvTimeout(Some(Duration::from_secs(1))))
            .unwrap();
        assert!(!opts.is_recv_nonblocking());
    }

    #[test]
    fn test_cidr_filter_v4() {
        let f = CidrFilter::parse("192.168.1.0/24").unwrap();
        assert!(f.matches("192.168.1.17".parse().unwrap()));
        assert!(!f.matches("192.168.2.17".parse().unwrap()));
        // Family-strict: never matches v6.
        assert!(!f.matches("::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_filter_v6_and_bare() {
        let f = CidrFilter::parse("2001:db8::/32").unwrap();
        assert!(f.matches("2001:db8::1".parse().unwrap()));
        assert!(!f.matches("2001:db9::1".parse().unwrap()));

        let bare = CidrFilter::parse("10.0.0.1").unwrap();
        assert!(bare.matches("10.0.0.1".parse().unwrap()));
        assert!(!bare.matches("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_cidr_filter_rejects_garbage() {
        assert!(CidrFilter::parse("not-an-ip/8").is_err());
        assert!(CidrFilter::parse("10.0.0.0/33").is_err());
    }
}
