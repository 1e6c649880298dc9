//! Outgoing TCP connection state machine.
//!
//! Lifecycle: wait (optionally) for a backoff interval, resolve the
//! address, launch a non-blocking connect, and wait for writability.
//! On completion the descriptor's error state decides between handing
//! a fresh engine to the session and scheduling a retry. The connecter
//! owns the whole reconnect policy; one successful handoff and it
//! terminates itself, leaving the next reconnect to a future
//! connecter.
//!
//! Backoff: each retry waits the current interval plus a random jitter
//! of up to one base interval; when a ceiling is configured the
//! current interval doubles per retry, capped there. A fresh connecter
//! starts over from the base interval.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use driveshaft_core::command::{CommandKind, Route};
use driveshaft_core::context::Ctx;
use driveshaft_core::endpoint::TcpEndpoint;
use driveshaft_core::io_thread::IoCtx;
use driveshaft_core::monitor::{SocketEvent, SocketEvents};
use driveshaft_core::object::{Disposition, IoObject, OwnCore};
use driveshaft_core::options::Options;
use driveshaft_core::reactor::Handle;

use crate::engine::StreamEngine;
use crate::mechanism::Role;
use crate::tcp::tune_socket;

const CONNECT_TIMER_ID: u32 = 1;
const RECONNECT_TIMER_ID: u32 = 2;

enum Opened {
    /// Connect finished synchronously.
    Connected(Socket),
    /// Connect is in flight; poll for writability.
    InProgress(Socket),
}

pub(crate) struct TcpConnecter {
    own: OwnCore,
    session: Route,
    endpoint: TcpEndpoint,
    endpoint_str: String,
    options: Options,
    events: SocketEvents,

    sock: Option<Socket>,
    handle: Option<Handle>,
    delayed_start: bool,
    connect_timer: bool,
    reconnect_timer: bool,
    current_reconnect_ivl: Duration,
}

impl TcpConnecter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<Ctx>,
        route: Route,
        session: Route,
        endpoint: TcpEndpoint,
        endpoint_str: String,
        options: Options,
        events: SocketEvents,
        delayed_start: bool,
    ) -> Self {
        let current_reconnect_ivl = options.reconnect_ivl;
        Self {
            own: OwnCore::new(ctx, route, Some(session.clone())),
            session,
            endpoint,
            endpoint_str,
            options,
            events,
            sock: None,
            handle: None,
            delayed_start,
            connect_timer: false,
            reconnect_timer: false,
            current_reconnect_ivl,
        }
    }

    fn open(&self) -> io::Result<Opened> {
        let addr = self
            .endpoint
            .connect_addr(self.options.ipv6)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;

        match sock.connect(&addr.into()) {
            Ok(()) => Ok(Opened::Connected(sock)),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(Opened::InProgress(sock)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Opened::InProgress(sock)),
            Err(e) => Err(e),
        }
    }

    fn start_connecting(&mut self, io: &mut IoCtx<'_>) {
        match self.open() {
            Ok(Opened::Connected(sock)) => {
                self.sock = Some(sock);
                match io
                    .reactor
                    .add_fd(self.sock_fd(), self.own.route().object())
                {
                    Ok(h) => {
                        self.handle = Some(h);
                        self.complete(io);
                    }
                    Err(_) => {
                        self.sock = None;
                        self.add_reconnect_timer(io);
                    }
                }
            }
            Ok(Opened::InProgress(sock)) => {
                self.sock = Some(sock);
                match io
                    .reactor
                    .add_fd(self.sock_fd(), self.own.route().object())
                {
                    Ok(h) => {
                        self.handle = Some(h);
                        io.reactor.set_pollout(h);
                        self.events.emit(SocketEvent::ConnectDelayed {
                            endpoint: self.endpoint_str.clone(),
                        });
                        if !self.options.connect_timeout.is_zero() {
                            io.reactor.add_timer(
                                self.options.connect_timeout,
                                self.own.route().object(),
                                CONNECT_TIMER_ID,
                            );
                            self.connect_timer = true;
                        }
                    }
                    Err(_) => {
                        self.sock = None;
                        self.add_reconnect_timer(io);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint_str, error = %e, "connect failed");
                self.add_reconnect_timer(io);
            }
        }
    }

    fn sock_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.sock.as_ref().expect("socket is open").as_raw_fd()
    }

    /// The async connect resolved one way or the other.
    fn complete(&mut self, io: &mut IoCtx<'_>) {
        if self.connect_timer {
            io.reactor
                .cancel_timer(self.own.route().object(), CONNECT_TIMER_ID);
            self.connect_timer = false;
        }
        if let Some(h) = self.handle.take() {
            io.reactor.rm_fd(h);
        }

        let sock = self.sock.take().expect("completion without a socket");

        // A failed async connect surfaces through SO_ERROR.
        let failed = match sock.take_error() {
            Ok(None) => false,
            Ok(Some(e)) => {
                tracing::debug!(endpoint = %self.endpoint_str, error = %e, "connect refused");
                true
            }
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint_str, error = %e, "connect failed");
                true
            }
        };
        if failed || tune_socket(&sock, &self.options).is_err() {
            self.add_reconnect_timer(io);
            return;
        }

        let engine = StreamEngine::new(
            sock,
            self.options.clone(),
            self.endpoint_str.clone(),
            self.events.clone(),
            Role::Client,
        );
        self.own.ctx().clone().send_command(
            &self.session,
            CommandKind::Attach {
                engine: Box::new(engine),
            },
        );
        self.events.emit(SocketEvent::Connected {
            endpoint: self.endpoint_str.clone(),
        });

        // Job done; hand control back to the session.
        self.own.terminate(None);
    }

    fn add_reconnect_timer(&mut self, io: &mut IoCtx<'_>) {
        let interval = self.next_reconnect_ivl();
        io.reactor
            .add_timer(interval, self.own.route().object(), RECONNECT_TIMER_ID);
        self.reconnect_timer = true;
        self.events.emit(SocketEvent::ConnectRetried {
            endpoint: self.endpoint_str.clone(),
            interval,
        });
    }

    /// Current interval plus jitter; the interval itself doubles up to
    /// the configured ceiling.
    fn next_reconnect_ivl(&mut self) -> Duration {
        let base = self.options.reconnect_ivl;
        let jitter_ms = if base.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..base.as_millis() as u64)
        };
        let interval = self.current_reconnect_ivl + Duration::from_millis(jitter_ms);

        let max = self.options.reconnect_ivl_max;
        if !max.is_zero() && max > base {
            self.current_reconnect_ivl = (self.current_reconnect_ivl * 2).min(max);
        }
        interval
    }

    fn process_term(&mut self, io: &mut IoCtx<'_>) {
        if self.connect_timer {
            io.reactor
                .cancel_timer(self.own.route().object(), CONNECT_TIMER_ID);
            self.connect_timer = false;
        }
        if self.reconnect_timer {
            io.reactor
                .cancel_timer(self.own.route().object(), RECONNECT_TIMER_ID);
            self.reconnect_timer = false;
        }
        if let Some(h) = self.handle.take() {
            io.reactor.rm_fd(h);
        }
        self.sock = None;
        self.own.start_term(None);
    }
}

impl IoObject for TcpConnecter {
    fn plug(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.own.note_command();
        if self.delayed_start {
            self.add_reconnect_timer(io);
        } else {
            self.start_connecting(io);
        }
        self.own.finalize()
    }

    fn process_command(&mut self, io: &mut IoCtx<'_>, kind: CommandKind) -> Disposition {
        self.own.note_command();
        match kind {
            CommandKind::Term { .. } => self.process_term(io),
            CommandKind::TermAck => self.own.process_term_ack(),
            other => tracing::warn!(kind = ?other, "unexpected connecter command"),
        }
        self.own.finalize()
    }

    fn in_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        // Only error conditions arrive as readability here; resolve
        // them the same way as writability.
        self.out_event(io)
    }

    fn out_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        if self.sock.is_some() {
            self.complete(io);
        }
        self.own.finalize()
    }

    fn timer_event(&mut self, io: &mut IoCtx<'_>, id: u32) -> Disposition {
        match id {
            CONNECT_TIMER_ID => {
                // Userspace connect timeout: abandon and back off.
                self.connect_timer = false;
                if let Some(h) = self.handle.take() {
                    io.reactor.rm_fd(h);
                }
                self.sock = None;
                self.add_reconnect_timer(io);
            }
            RECONNECT_TIMER_ID => {
                self.reconnect_timer = false;
                self.start_connecting(io);
            }
            _ => {}
        }
        self.own.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driveshaft_core::context::Context;
    use driveshaft_core::command::MailboxId;
    use driveshaft_core::endpoint::Endpoint;

    fn connecter_for(ctx: &Context) -> TcpConnecter {
        let shared = ctx.shared();
        let route = shared.alloc_route(MailboxId::IoThread(0));
        let session = shared.alloc_route(MailboxId::IoThread(0));
        let Endpoint::Tcp(ep) = Endpoint::parse("tcp://127.0.0.1:1").unwrap() else {
            panic!()
        };
        TcpConnecter::new(
            Arc::clone(shared),
            route,
            session,
            ep,
            "tcp://127.0.0.1:1".into(),
            Options::new(driveshaft_core::socket_type::SocketType::Dealer),
            SocketEvents::new(),
            false,
        )
    }

    #[test]
    fn test_backoff_sequence_is_nondecreasing_and_capped() {
        let ctx = Context::new().unwrap();
        let mut c = connecter_for(&ctx);
        c.options.reconnect_ivl = Duration::from_millis(100);
        c.options.reconnect_ivl_max = Duration::from_millis(2000);
        c.current_reconnect_ivl = c.options.reconnect_ivl;

        let mut last_floor = Duration::ZERO;
        for _ in 0..10 {
            let floor = c.current_reconnect_ivl;
            let ivl = c.next_reconnect_ivl();
            // interval = current + jitter in [0, base)
            assert!(ivl >= floor);
            assert!(ivl < floor + Duration::from_millis(100));
            assert!(floor >= last_floor);
            last_floor = floor;
        }
        assert_eq!(c.current_reconnect_ivl, Duration::from_millis(2000));
        ctx.term().unwrap();
    }

    #[test]
    fn test_backoff_without_ceiling_stays_at_base() {
        let ctx = Context::new().unwrap();
        let mut c = connecter_for(&ctx);
        c.options.reconnect_ivl = Duration::from_millis(100);
        c.options.reconnect_ivl_max = Duration::ZERO;

        for _ in 0..5 {
            let ivl = c.next_reconnect_ivl();
            assert!(ivl >= Duration::from_millis(100));
            assert!(ivl < Duration::from_millis(200));
        }
        ctx.term().unwrap();
    }
}
