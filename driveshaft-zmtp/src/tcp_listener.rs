//! TCP listener.
//!
//! The listening socket is created, bound and put into listen mode
//! synchronously on the application thread so bind errors surface
//! immediately; the object then moves to an I/O thread and accepts
//! from the reactor. Every accepted connection gets a passive session
//! (owned by the listener) on the least loaded I/O thread and an
//! engine shipped to it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use driveshaft_core::command::{CommandKind, MailboxId, Route};
use driveshaft_core::context::Ctx;
use driveshaft_core::endpoint::TcpEndpoint;
use driveshaft_core::io_thread::IoCtx;
use driveshaft_core::monitor::{SocketEvent, SocketEvents};
use driveshaft_core::object::{Disposition, IoObject, OwnCore};
use driveshaft_core::options::Options;
use driveshaft_core::reactor::Handle;

use crate::engine::{peer_endpoint, StreamEngine};
use crate::mechanism::Role;
use crate::session::Session;
use crate::tcp::tune_socket;

pub(crate) struct TcpListener {
    own: OwnCore,
    socket: Route,
    options: Options,
    events: SocketEvents,
    sock: Socket,
    handle: Option<Handle>,
    endpoint_str: String,
}

impl TcpListener {
    /// Create, bind and listen. Fails synchronously so the caller can
    /// report bind errors from `bind()` itself.
    pub fn create(
        ctx: Arc<Ctx>,
        route: Route,
        socket: Route,
        options: Options,
        events: SocketEvents,
        endpoint: &TcpEndpoint,
    ) -> io::Result<Self> {
        let addr = endpoint
            .bind_addr(options.ipv6)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(options.backlog)?;

        // Resolve the actual address for wildcard ports.
        let local: SocketAddr = sock
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))?;
        let endpoint_str = format!("tcp://{local}");

        Ok(Self {
            own: OwnCore::new(ctx, route, Some(socket.clone())),
            socket,
            options,
            events,
            sock,
            handle: None,
            endpoint_str,
        })
    }

    /// Resolved endpoint, with wildcards replaced.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint_str
    }

    fn accept_one(&mut self, io: &mut IoCtx<'_>) {
        let (accepted, addr) = match self.sock.accept() {
            Ok(pair) => pair,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(e) => {
                // Resource exhaustion and aborted connections refuse
                // this accept, never the listener.
                tracing::warn!(endpoint = %self.endpoint_str, error = %e, "accept failed");
                self.events.emit(SocketEvent::AcceptFailed {
                    endpoint: self.endpoint_str.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if !self.options.accept_filters.is_empty() {
            let allowed = addr.as_socket().is_some_and(|peer| {
                self.options
                    .accept_filters
                    .iter()
                    .any(|f| f.matches(peer.ip()))
            });
            if !allowed {
                tracing::debug!(endpoint = %self.endpoint_str, "peer rejected by accept filter");
                return;
            }
        }

        if accepted.set_nonblocking(true).is_err()
            || tune_socket(&accepted, &self.options).is_err()
        {
            self.events.emit(SocketEvent::AcceptFailed {
                endpoint: self.endpoint_str.clone(),
                reason: "socket tuning failed".into(),
            });
            return;
        }

        let peer = peer_endpoint(&accepted);

        // Passive session on the least loaded thread; this listener
        // owns it.
        let tid = io.ctx.choose_io_thread();
        let session_route = io.ctx.alloc_route(MailboxId::IoThread(tid));
        let session = Session::new(
            Arc::clone(io.ctx),
            session_route.clone(),
            self.own.route().clone(),
            self.socket.clone(),
            self.options.clone(),
            self.events.clone(),
            None,
            peer.clone(),
            None,
        );
        self.own.launch_child(session_route.clone(), Box::new(session));

        let engine = StreamEngine::new(
            accepted,
            self.options.clone(),
            peer,
            self.events.clone(),
            Role::Server,
        );
        io.ctx.send_command(
            &session_route,
            CommandKind::Attach {
                engine: Box::new(engine),
            },
        );

        self.events.emit(SocketEvent::Accepted {
            endpoint: self.endpoint_str.clone(),
        });
    }
}

impl IoObject for TcpListener {
    fn plug(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.own.note_command();
        use std::os::fd::AsRawFd;
        match io.reactor.add_fd(self.sock.as_raw_fd(), self.own.route().object()) {
            Ok(h) => {
                io.reactor.set_pollin(h);
                self.handle = Some(h);
            }
            Err(e) => {
                tracing::error!(endpoint = %self.endpoint_str, error = %e, "cannot watch listener");
            }
        }
        self.own.finalize()
    }

    fn process_command(&mut self, io: &mut IoCtx<'_>, kind: CommandKind) -> Disposition {
        self.own.note_command();
        match kind {
            CommandKind::Term { linger } => {
                if let Some(h) = self.handle.take() {
                    io.reactor.rm_fd(h);
                }
                self.events.emit(SocketEvent::Closed {
                    endpoint: self.endpoint_str.clone(),
                });
                self.own.start_term(linger);
            }
            CommandKind::TermAck => self.own.process_term_ack(),
            CommandKind::TermReq { child } => {
                let linger = self.options.linger;
                self.own.process_term_req(&child, linger);
            }
            other => tracing::warn!(kind = ?other, "unexpected listener command"),
        }
        self.own.finalize()
    }

    fn in_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.accept_one(io);
        self.own.finalize()
    }

    fn out_event(&mut self, _io: &mut IoCtx<'_>) -> Disposition {
        Disposition::Alive
    }

    fn timer_event(&mut self, _io: &mut IoCtx<'_>, _id: u32) -> Disposition {
        Disposition::Alive
    }
}
