//! Per-connection session.
//!
//! A session bridges one socket-side pipe with one protocol engine and
//! outlives individual connections: a connect-initiated ("active")
//! session keeps its pipe across reconnects and launches a fresh
//! connecter each time the engine dies, while an accept-initiated
//! ("passive") session tears itself down on disconnect.
//!
//! The session owns its engine outright; reactor events for the
//! connection's descriptor arrive here and are forwarded. Toward the
//! engine the session appears only as an [`EngineSink`].

use std::sync::Arc;

use driveshaft_core::command::{CommandKind, MailboxId, ObjectId, Route};
use driveshaft_core::context::Ctx;
use driveshaft_core::endpoint::TcpEndpoint;
use driveshaft_core::engine::{Engine, EngineError, EngineSink};
use driveshaft_core::io_thread::IoCtx;
use driveshaft_core::monitor::{SocketEvent, SocketEvents};
use driveshaft_core::msg::{Metadata, Msg};
use driveshaft_core::object::{Disposition, IoObject, OwnCore};
use driveshaft_core::options::Options;
use driveshaft_core::pipe::{pipe_pair, PipeEnd};
use driveshaft_core::socket_type::SocketType;

use bytes::Bytes;

use crate::tcp_connecter::TcpConnecter;

const LINGER_TIMER_ID: u32 = 0x20;

pub(crate) struct Session {
    own: OwnCore,
    socket: Route,
    options: Options,
    events: SocketEvents,

    pipe: Option<PipeEnd>,
    engine: Option<Box<dyn Engine>>,

    /// Reconnect target; `None` marks an accepted (passive) session.
    endpoint: Option<TcpEndpoint>,
    endpoint_str: String,

    pending_error: Option<EngineError>,
    linger_timer: bool,
    pipe_obligation: bool,
    engine_obligation: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<Ctx>,
        route: Route,
        owner: Route,
        socket: Route,
        options: Options,
        events: SocketEvents,
        endpoint: Option<TcpEndpoint>,
        endpoint_str: String,
        pipe: Option<PipeEnd>,
    ) -> Self {
        Self {
            own: OwnCore::new(ctx, route, Some(owner)),
            socket,
            options,
            events,
            pipe,
            engine: None,
            endpoint,
            endpoint_str,
            pending_error: None,
            linger_timer: false,
            pipe_obligation: false,
            engine_obligation: false,
        }
    }

    fn start_connecting(&mut self, io: &mut IoCtx<'_>, wait_before_connect: bool) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let tid = io.ctx.choose_io_thread();
        let route = io.ctx.alloc_route(MailboxId::IoThread(tid));
        let connecter = TcpConnecter::new(
            Arc::clone(io.ctx),
            route.clone(),
            self.own.route().clone(),
            endpoint,
            self.endpoint_str.clone(),
            self.options.clone(),
            self.events.clone(),
            wait_before_connect,
        );
        self.own.launch_child(route, Box::new(connecter));
    }

    fn on_attach(&mut self, io: &mut IoCtx<'_>, engine: Box<dyn Engine>) {
        debug_assert!(self.engine.is_none(), "session already has an engine");
        let mut engine = engine;
        engine.plug(io, self);
        self.engine = Some(engine);
        if self.own.is_terminating() && !self.engine_obligation {
            self.own.register_term_acks(1);
            self.engine_obligation = true;
        }
    }

    fn on_term(&mut self, io: &mut IoCtx<'_>, linger: Option<std::time::Duration>) {
        self.own.start_term(linger);

        if let Some(pipe) = &mut self.pipe {
            if !self.pipe_obligation {
                self.own.register_term_acks(1);
                self.pipe_obligation = true;
            }
            let delay = linger.map_or(true, |d| !d.is_zero());
            pipe.terminate(delay);
            pipe.flush();
        }
        if self.engine.is_some() && !self.engine_obligation {
            self.own.register_term_acks(1);
            self.engine_obligation = true;
        }
        if let Some(duration) = linger {
            if !duration.is_zero() {
                io.reactor
                    .add_timer(duration, self.own.route().object(), LINGER_TIMER_ID);
                self.linger_timer = true;
            }
        }
        self.drain_without_engine();
    }

    /// With no engine attached nothing drains the pipe, so control
    /// traffic (the termination delimiter) must be consumed here or
    /// the shutdown handshake never completes.
    fn drain_without_engine(&mut self) {
        if self.engine.is_none() {
            if let Some(pipe) = &mut self.pipe {
                let _ = pipe.check_read();
            }
        }
    }

    fn detach_engine(&mut self, io: &mut IoCtx<'_>) {
        if let Some(mut engine) = self.engine.take() {
            engine.terminate(io);
        }
        if self.engine_obligation {
            self.own.unregister_term_ack();
            self.engine_obligation = false;
        }
    }

    fn with_engine(
        &mut self,
        io: &mut IoCtx<'_>,
        f: impl FnOnce(&mut Box<dyn Engine>, &mut IoCtx<'_>, &mut Self),
    ) {
        if let Some(mut engine) = self.engine.take() {
            f(&mut engine, io, self);
            // An error during the event leaves the engine parked here
            // until after_event tears it down.
            self.engine = Some(engine);
        }
    }

    fn after_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        if let Some(reason) = self.pending_error.take() {
            let orderly = matches!(reason, EngineError::Done);
            self.detach_engine(io);

            if !orderly {
                tracing::debug!(endpoint = %self.endpoint_str, reason = ?reason, "engine detached");
                self.events.emit(SocketEvent::Disconnected {
                    endpoint: self.endpoint_str.clone(),
                });
            }

            if self.own.is_terminating() {
                // The link died mid-shutdown: nothing can drain the
                // pipe any more, so stop waiting for the delimiter.
                if let Some(pipe) = &mut self.pipe {
                    pipe.terminate(false);
                }
                self.drain_without_engine();
            } else if self.endpoint.is_some() {
                // Reconnecting session: tell the pattern the link
                // hiccupped, then try again after a backoff.
                if let Some(pipe) = &mut self.pipe {
                    pipe.hiccup();
                }
                self.start_connecting(io, true);
            } else {
                // Accepted session: one connection, one life.
                self.own.terminate(self.options.linger);
            }
        }

        // During shutdown, close a fully drained engine once the pipe
        // is gone; no further output can appear.
        if self.own.is_terminating()
            && self.pipe.is_none()
            && self.engine.as_ref().is_some_and(|e| e.idle())
        {
            self.detach_engine(io);
        }

        if self.own.check_term() && self.linger_timer {
            io.reactor
                .cancel_timer(self.own.route().object(), LINGER_TIMER_ID);
            self.linger_timer = false;
        }
        self.own.finalize()
    }
}

impl IoObject for Session {
    fn plug(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.own.note_command();
        if self.endpoint.is_some() {
            self.start_connecting(io, false);
        }
        Disposition::Alive
    }

    fn process_command(&mut self, io: &mut IoCtx<'_>, kind: CommandKind) -> Disposition {
        self.own.note_command();
        match kind {
            CommandKind::Attach { engine } => self.on_attach(io, engine),
            CommandKind::Term { linger } => self.on_term(io, linger),
            CommandKind::TermAck => self.own.process_term_ack(),
            CommandKind::TermReq { child } => {
                let linger = self.options.linger;
                self.own.process_term_req(&child, linger);
            }
            CommandKind::ActivateRead { .. } => {
                if self.pipe.as_mut().is_some_and(PipeEnd::process_activate_read) {
                    if self.engine.is_some() {
                        self.with_engine(io, |e, io, s| e.restart_output(io, s));
                    } else {
                        self.drain_without_engine();
                    }
                }
            }
            CommandKind::ActivateWrite { msgs_read, .. } => {
                if self
                    .pipe
                    .as_mut()
                    .is_some_and(|p| p.process_activate_write(msgs_read))
                {
                    self.with_engine(io, |e, io, s| e.restart_input(io, s));
                }
            }
            CommandKind::PipeTerm { .. } => {
                if let Some(pipe) = &mut self.pipe {
                    pipe.process_pipe_term();
                }
                self.drain_without_engine();
            }
            CommandKind::PipeTermAck { .. } => {
                if self
                    .pipe
                    .as_mut()
                    .is_some_and(|p| p.process_pipe_term_ack())
                {
                    self.pipe = None;
                    if self.pipe_obligation {
                        self.own.unregister_term_ack();
                        self.pipe_obligation = false;
                    }
                }
            }
            CommandKind::Hiccup { .. } => {}
            other => {
                tracing::warn!(kind = ?other, "unexpected session command");
            }
        }
        self.after_event(io)
    }

    fn in_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.with_engine(io, |e, io, s| e.in_event(io, s));
        self.after_event(io)
    }

    fn out_event(&mut self, io: &mut IoCtx<'_>) -> Disposition {
        self.with_engine(io, |e, io, s| e.out_event(io, s));
        self.after_event(io)
    }

    fn timer_event(&mut self, io: &mut IoCtx<'_>, id: u32) -> Disposition {
        if id == LINGER_TIMER_ID {
            self.linger_timer = false;
            // Linger expired: stop draining, force the pipe down.
            if let Some(pipe) = &mut self.pipe {
                pipe.terminate(false);
            }
        } else {
            // Engine timers (handshake) are registered under our id.
            self.with_engine(io, |e, io, s| e.timer_event(io, s, id));
        }
        self.after_event(io)
    }
}

impl EngineSink for Session {
    fn object_id(&self) -> ObjectId {
        self.own.route().object()
    }

    fn push_msg(&mut self, msg: Msg) -> Result<(), Msg> {
        match &mut self.pipe {
            Some(pipe) => pipe.write(msg),
            None => Err(msg),
        }
    }

    fn flush(&mut self) {
        if let Some(pipe) = &mut self.pipe {
            pipe.flush();
        }
    }

    fn pull_msg(&mut self) -> Option<Msg> {
        self.pipe.as_mut()?.read()
    }

    fn engine_ready(
        &mut self,
        _io: &mut IoCtx<'_>,
        peer_type: SocketType,
        peer_identity: Option<Bytes>,
        _metadata: Arc<Metadata>,
    ) -> bool {
        if !self.options.socket_type.is_compatible(peer_type) {
            return false;
        }

        // Accepted connections (and immediate-mode connects) get their
        // pipe only now that a peer actually exists.
        if self.pipe.is_none() {
            let (mut socket_end, session_end) = pipe_pair(
                self.own.ctx(),
                Some(self.socket.clone()),
                Some(self.own.route().clone()),
                self.options.sndhwm,
                self.options.rcvhwm,
            );
            socket_end.set_identity(peer_identity);
            self.pipe = Some(session_end);

            if self.own.is_terminating() {
                if let Some(pipe) = &mut self.pipe {
                    self.own.register_term_acks(1);
                    self.pipe_obligation = true;
                    pipe.terminate(false);
                }
            }
            self.own
                .ctx()
                .clone()
                .send_command(&self.socket, CommandKind::Bind { pipe: socket_end });
        }
        true
    }

    fn engine_error(&mut self, reason: EngineError) {
        self.pending_error = Some(reason);
    }

    fn finishing(&self) -> bool {
        self.own.is_terminating() && self.pipe.is_none()
    }
}
