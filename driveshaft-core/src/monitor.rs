//! Socket event monitoring.
//!
//! Lifecycle events (connects, accepts, handshakes, disconnects) are
//! emitted by the I/O-side objects and delivered to the application
//! over a channel obtained from the socket's `monitor()` call. Until a
//! monitor is attached, emission is a no-op.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Socket lifecycle events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Outgoing connection established and handed to a session.
    Connected { endpoint: String },

    /// Asynchronous connect launched; completion is pending.
    ConnectDelayed { endpoint: String },

    /// Connect failed or the connection died; a retry is scheduled
    /// after `interval`.
    ConnectRetried {
        endpoint: String,
        interval: Duration,
    },

    /// Listener is accepting connections.
    Listening { endpoint: String },

    /// Bind failed synchronously.
    BindFailed { endpoint: String, reason: String },

    /// Listener accepted an incoming connection.
    Accepted { endpoint: String },

    /// Accept failed (typically resource exhaustion).
    AcceptFailed { endpoint: String, reason: String },

    /// A connection's file descriptor was closed.
    Closed { endpoint: String },

    /// Closing a connection failed.
    CloseFailed { endpoint: String, reason: String },

    /// An established session lost its connection.
    Disconnected { endpoint: String },

    /// The monitored socket is gone; no further events follow.
    MonitorStopped,

    /// Protocol handshake completed; data may flow.
    HandshakeSucceeded { endpoint: String },

    /// Handshake failed with no further detail (e.g. timeout).
    HandshakeFailedNoDetail { endpoint: String },

    /// Handshake failed due to a protocol violation.
    HandshakeFailedProtocol { endpoint: String, reason: String },

    /// Handshake failed at the authentication stage.
    HandshakeFailedAuth { endpoint: String },
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { endpoint } => write!(f, "connected to {endpoint}"),
            Self::ConnectDelayed { endpoint } => write!(f, "connect to {endpoint} in progress"),
            Self::ConnectRetried { endpoint, interval } => {
                write!(f, "connect to {endpoint} retried in {interval:?}")
            }
            Self::Listening { endpoint } => write!(f, "listening on {endpoint}"),
            Self::BindFailed { endpoint, reason } => {
                write!(f, "bind failed for {endpoint}: {reason}")
            }
            Self::Accepted { endpoint } => write!(f, "accepted connection on {endpoint}"),
            Self::AcceptFailed { endpoint, reason } => {
                write!(f, "accept failed on {endpoint}: {reason}")
            }
            Self::Closed { endpoint } => write!(f, "closed {endpoint}"),
            Self::CloseFailed { endpoint, reason } => {
                write!(f, "close failed for {endpoint}: {reason}")
            }
            Self::Disconnected { endpoint } => write!(f, "disconnected from {endpoint}"),
            Self::MonitorStopped => write!(f, "monitor stopped"),
            Self::HandshakeSucceeded { endpoint } => write!(f, "handshake on {endpoint} succeeded"),
            Self::HandshakeFailedNoDetail { endpoint } => {
                write!(f, "handshake on {endpoint} failed")
            }
            Self::HandshakeFailedProtocol { endpoint, reason } => {
                write!(f, "handshake on {endpoint} failed: {reason}")
            }
            Self::HandshakeFailedAuth { endpoint } => {
                write!(f, "handshake on {endpoint} failed: not authorised")
            }
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Shared emission point for one socket's lifecycle events.
///
/// Cloned into every I/O-side object working for the socket
/// (connecters, listeners, sessions, engines). Cheap to clone; cheap
/// to emit into when nobody subscribed.
#[derive(Clone, Default)]
pub struct SocketEvents {
    tx: Arc<Mutex<Option<flume::Sender<SocketEvent>>>>,
}

impl SocketEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh monitor channel, replacing any previous one, and
    /// return its receiving end.
    #[must_use]
    pub fn subscribe(&self) -> SocketMonitor {
        let (tx, rx) = flume::unbounded();
        *self.tx.lock() = Some(tx);
        rx
    }

    /// Emit an event. Drops it silently when no monitor is attached or
    /// the receiver is gone.
    pub fn emit(&self, event: SocketEvent) {
        let mut guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                *guard = None;
            }
        }
    }

    /// Emit the final event and detach the channel.
    pub fn stop(&self) {
        let mut guard = self.tx.lock();
        if let Some(tx) = guard.take() {
            let _ = tx.send(SocketEvent::MonitorStopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscriber_is_noop() {
        let events = SocketEvents::new();
        events.emit(SocketEvent::MonitorStopped);
    }

    #[test]
    fn test_monitor_channel() {
        let events = SocketEvents::new();
        let rx = events.subscribe();
        events.emit(SocketEvent::Listening {
            endpoint: "tcp://127.0.0.1:5555".into(),
        });

        let event = rx.recv().unwrap();
        assert!(matches!(event, SocketEvent::Listening { .. }));
    }

    #[test]
    fn test_stop_sends_final_event() {
        let events = SocketEvents::new();
        let rx = events.subscribe();
        events.stop();
        assert!(matches!(rx.recv().unwrap(), SocketEvent::MonitorStopped));
        // Channel closed afterwards.
        assert!(rx.recv().is_err());
    }
}
