//! Socket pattern enumeration.

use std::fmt;

/// The messaging pattern a socket speaks.
///
/// The pattern decides how attached pipes are selected on send, how
/// inbound messages are interleaved on recv, and which peers a
/// connection handshake will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketType {
    /// Exclusive bidirectional link between exactly two peers
    Pair = 0,

    /// Publisher fanning messages out to matching subscribers
    Pub = 1,

    /// Subscriber with prefix-based topic filtering
    Sub = 2,

    /// Synchronous request client (strict send/recv alternation)
    Req = 3,

    /// Synchronous reply server (envelope tracking)
    Rep = 4,

    /// Asynchronous request-reply with round-robin fan-out
    Dealer = 5,

    /// Identity-addressed router
    Router = 6,

    /// Downstream end of a pipeline, fair-queued
    Pull = 7,

    /// Upstream end of a pipeline, load-balanced
    Push = 8,

    /// Publisher that surfaces subscription messages to the application
    XPub = 9,

    /// Subscriber with subscriptions driven by explicit messages
    XSub = 10,
}

impl SocketType {
    /// Wire name of the socket type, as carried in handshake metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "PAIR",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pull => "PULL",
            Self::Push => "PUSH",
            Self::XPub => "XPUB",
            Self::XSub => "XSUB",
        }
    }

    /// Parse the wire name announced by a peer.
    #[must_use]
    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"PAIR" => Some(Self::Pair),
            b"PUB" => Some(Self::Pub),
            b"SUB" => Some(Self::Sub),
            b"REQ" => Some(Self::Req),
            b"REP" => Some(Self::Rep),
            b"DEALER" => Some(Self::Dealer),
            b"ROUTER" => Some(Self::Router),
            b"PULL" => Some(Self::Pull),
            b"PUSH" => Some(Self::Push),
            b"XPUB" => Some(Self::XPub),
            b"XSUB" => Some(Self::XSub),
            _ => None,
        }
    }

    /// Check whether a peer of the given type is a valid counterpart.
    #[must_use]
    pub fn is_compatible(&self, peer: SocketType) -> bool {
        matches!(
            (self, peer),
            (Self::Pair, Self::Pair)
                | (Self::Pub, Self::Sub | Self::XSub)
                | (Self::Sub, Self::Pub | Self::XPub)
                | (Self::XPub, Self::Sub | Self::XSub)
                | (Self::XSub, Self::Pub | Self::XPub)
                | (Self::Req, Self::Rep | Self::Router)
                | (Self::Rep, Self::Req | Self::Dealer)
                | (Self::Dealer, Self::Rep | Self::Dealer | Self::Router)
                | (Self::Router, Self::Req | Self::Dealer | Self::Router)
                | (Self::Push, Self::Pull)
                | (Self::Pull, Self::Push)
        )
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_type_display() {
        assert_eq!(SocketType::Dealer.to_string(), "DEALER");
        assert_eq!(SocketType::XPub.to_string(), "XPUB");
    }

    #[test]
    fn test_wire_round_trip() {
        for ty in [
            SocketType::Pair,
            SocketType::Pub,
            SocketType::Sub,
            SocketType::Req,
            SocketType::Rep,
            SocketType::Dealer,
            SocketType::Router,
            SocketType::Pull,
            SocketType::Push,
            SocketType::XPub,
            SocketType::XSub,
        ] {
            assert_eq!(SocketType::from_wire(ty.as_str().as_bytes()), Some(ty));
        }
        assert_eq!(SocketType::from_wire(b"BOGUS"), None);
    }

    #[test]
    fn test_socket_compatibility() {
        assert!(SocketType::Req.is_compatible(SocketType::Rep));
        assert!(SocketType::Rep.is_compatible(SocketType::Req));
        assert!(SocketType::Dealer.is_compatible(SocketType::Router));
        assert!(SocketType::Router.is_compatible(SocketType::Dealer));
        assert!(SocketType::Push.is_compatible(SocketType::Pull));
        assert!(SocketType::Pub.is_compatible(SocketType::Sub));
        assert!(SocketType::XPub.is_compatible(SocketType::XSub));
        assert!(SocketType::Pub.is_compatible(SocketType::XSub));
        assert!(SocketType::XSub.is_compatible(SocketType::Pub));

        // Incompatible pairs
        assert!(!SocketType::Req.is_compatible(SocketType::Req));
        assert!(!SocketType::Pub.is_compatible(SocketType::Pull));
        assert!(!SocketType::Pair.is_compatible(SocketType::Dealer));
    }
}
