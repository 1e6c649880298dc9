//! Base socket infrastructure shared by all socket patterns.
//!
//! A socket is a distributed object: the application thread drives
//! this half through blocking calls, while sessions, connecters and
//! listeners work for it on I/O threads and talk back exclusively
//! through the socket's mailbox. Blocking send/recv waits on the
//! mailbox signaler and re-attempts the pattern operation whenever a
//! command (typically a pipe activation) arrives.
//!
//! The pattern-specific behavior hangs off [`SocketPattern`]: pipe
//! attachment, message routing, activation and teardown hooks, and
//! pattern-owned options (subscriptions).

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use driveshaft_core::command::{Command, CommandKind, MailboxId, ObjectId, Route};
use driveshaft_core::context::{Context, Ctx, InprocBinding, PendingConnection};
use driveshaft_core::endpoint::{Endpoint, TcpPort};
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::mailbox::Mailbox;
use driveshaft_core::monitor::{SocketEvent, SocketEvents, SocketMonitor};
use driveshaft_core::msg::Msg;
use driveshaft_core::object::OwnCore;
use driveshaft_core::options::{Options, SocketOption};
use driveshaft_core::pipe::{pipe_pair, PipeEnd};
use driveshaft_core::reaper::Reapable;
use driveshaft_core::socket_type::SocketType;

use crate::dealer::DealerPattern;
use crate::pair::PairPattern;
use crate::publisher::PubPattern;
use crate::pull::PullPattern;
use crate::push::PushPattern;
use crate::rep::RepPattern;
use crate::req::ReqPattern;
use crate::router::RouterPattern;
use crate::session::Session;
use crate::subscriber::SubPattern;
use crate::tcp_listener::TcpListener;
use crate::xpub::XPubPattern;
use crate::xsub::XSubPattern;

/// The attached pipes of one socket, keyed by pipe id.
pub(crate) type PipeMap = HashMap<ObjectId, PipeEnd>;

/// Why a pattern refused a send.
pub(crate) enum PatternError {
    /// Every candidate pipe is at its high-water mark; retry later.
    Full(Msg),
    /// This pattern cannot send (or cannot receive).
    Unsupported,
    /// Identity-addressed send with no matching peer.
    NoRoute,
    /// The pattern's state machine forbids this operation now.
    BadState(&'static str),
}

/// Pattern extension points invoked by the socket base.
pub(crate) trait SocketPattern: Send {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        locally_initiated: bool,
    );

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError>;

    fn xrecv(&mut self, pipes: &mut PipeMap, opts: &Options) -> Result<Msg>;

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool;

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool;

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId);

    fn xwrite_activated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        let _ = (pipes, pipe);
    }

    /// The connection behind this pipe is being re-established.
    fn xhiccuped(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        let _ = (pipes, opts, pipe);
    }

    fn xpipe_terminated(&mut self, pipes: &mut PipeMap, pipe: ObjectId);

    /// Pattern-owned options (subscriptions). `None` means "not mine".
    fn xsetsockopt(&mut self, pipes: &mut PipeMap, opt: &SocketOption) -> Option<Result<()>> {
        let _ = (pipes, opt);
        None
    }
}

pub(crate) struct SocketCore {
    ctx: Arc<Ctx>,
    route: Route,
    mailbox: Mailbox,
    pub(crate) options: Options,
    pattern: Box<dyn SocketPattern>,
    pipes: PipeMap,
    own: OwnCore,
    endpoints: HashMap<String, Route>,
    last_endpoint: String,
    events: SocketEvents,
    ctx_terminated: bool,
    rcvmore: bool,
}

fn combine_hwm(a: u32, b: u32) -> u32 {
    if a == 0 || b == 0 {
        0
    } else {
        a.saturating_add(b)
    }
}

impl SocketCore {
    fn new(
        ctx: &Arc<Ctx>,
        socket_type: SocketType,
        pattern: Box<dyn SocketPattern>,
    ) -> Result<Self> {
        let (route, mailbox) = ctx.register_socket()?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            route: route.clone(),
            mailbox,
            options: Options::new(socket_type),
            pattern,
            pipes: PipeMap::new(),
            own: OwnCore::new(Arc::clone(ctx), route, None),
            endpoints: HashMap::new(),
            last_endpoint: String::new(),
            events: SocketEvents::new(),
            ctx_terminated: false,
            rcvmore: false,
        })
    }

    // ---------------------------------------------------- commands

    /// Drain pending commands. With `wait`, block up to the given
    /// timeout for the first command (`Err(WouldBlock)` on expiry).
    fn process_commands(&mut self, wait: Option<Option<Duration>>) -> Result<()> {
        let first = match wait {
            None => self.mailbox.try_recv(),
            Some(timeout) => Some(self.mailbox.recv(timeout)?),
        };
        let Some(first) = first else {
            return self.terminated_check();
        };
        self.handle_command(first);
        while let Some(cmd) = self.mailbox.try_recv() {
            self.handle_command(cmd);
        }
        self.terminated_check()
    }

    fn terminated_check(&self) -> Result<()> {
        if self.ctx_terminated {
            Err(DriveshaftError::Terminated)
        } else {
            Ok(())
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        self.own.note_command();
        match cmd.kind {
            CommandKind::Stop => self.ctx_terminated = true,
            CommandKind::Bind { pipe } => self.attach_pipe(pipe, false),
            CommandKind::InprocConnected {
                pipe,
                peer,
                peer_pipe: _,
            } => {
                if let Some(p) = self.pipes.get_mut(&pipe) {
                    p.set_peer_route(peer);
                }
            }
            CommandKind::TermReq { child } => {
                let linger = self.options.linger;
                self.own.process_term_req(&child, linger);
            }
            CommandKind::Term { linger: _ } => self.start_termination(),
            CommandKind::TermAck => self.own.process_term_ack(),
            CommandKind::ActivateRead { pipe } => {
                if self.pipes.get_mut(&pipe).is_some_and(PipeEnd::process_activate_read) {
                    self.pattern
                        .xread_activated(&mut self.pipes, &self.options, pipe);
                }
            }
            CommandKind::ActivateWrite { pipe, msgs_read } => {
                if self
                    .pipes
                    .get_mut(&pipe)
                    .is_some_and(|p| p.process_activate_write(msgs_read))
                {
                    self.pattern.xwrite_activated(&mut self.pipes, pipe);
                }
            }
            CommandKind::Hiccup { pipe } => {
                self.pattern
                    .xhiccuped(&mut self.pipes, &self.options, pipe);
            }
            CommandKind::PipeTerm { pipe } => {
                if let Some(p) = self.pipes.get_mut(&pipe) {
                    p.process_pipe_term();
                }
            }
            CommandKind::PipeTermAck { pipe } => {
                if self
                    .pipes
                    .get_mut(&pipe)
                    .is_some_and(|p| p.process_pipe_term_ack())
                {
                    self.pipes.remove(&pipe);
                    self.pattern.xpipe_terminated(&mut self.pipes, pipe);
                    if self.own.is_terminating() {
                        self.own.unregister_term_ack();
                    }
                }
            }
            other => tracing::warn!(kind = ?other, "unexpected socket command"),
        }
    }

    fn attach_pipe(&mut self, pipe: PipeEnd, locally_initiated: bool) {
        let id = pipe.id();
        self.pipes.insert(id, pipe);
        self.pattern
            .xattach_pipe(&mut self.pipes, &self.options, id, locally_initiated);

        // A pipe arriving into a dying socket joins the funeral.
        if self.own.is_terminating() {
            self.own.register_term_acks(1);
            if let Some(p) = self.pipes.get_mut(&id) {
                p.terminate(false);
            }
        }
    }

    // ---------------------------------------------------- endpoints

    fn bind(&mut self, endpoint_str: &str) -> Result<()> {
        self.terminated_check()?;
        self.process_commands(None)?;

        match Endpoint::parse(endpoint_str)? {
            Endpoint::Inproc(name) => {
                let binding = InprocBinding {
                    route: self.route.clone(),
                    sndhwm: self.options.sndhwm,
                    rcvhwm: self.options.rcvhwm,
                };
                let pending = self.ctx.register_inproc(&name, binding)?;
                for conn in pending {
                    let PendingConnection {
                        connector,
                        connector_pipe,
                        bind_pipe,
                    } = conn;
                    let bind_id = bind_pipe.id();
                    self.attach_pipe(bind_pipe, false);
                    self.ctx.send_command(
                        &connector,
                        CommandKind::InprocConnected {
                            pipe: connector_pipe,
                            peer: self.route.clone(),
                            peer_pipe: bind_id,
                        },
                    );
                }
                self.endpoints
                    .insert(endpoint_str.to_string(), self.route.clone());
                self.last_endpoint = endpoint_str.to_string();
                Ok(())
            }
            Endpoint::Tcp(tcp) => {
                let tid = self.ctx.choose_io_thread();
                let listener_route = self.ctx.alloc_route(MailboxId::IoThread(tid));
                match TcpListener::create(
                    Arc::clone(&self.ctx),
                    listener_route.clone(),
                    self.route.clone(),
                    self.options.clone(),
                    self.events.clone(),
                    &tcp,
                ) {
                    Ok(listener) => {
                        let resolved = listener.endpoint().to_string();
                        self.own
                            .launch_child(listener_route.clone(), Box::new(listener));
                        self.endpoints.insert(resolved.clone(), listener_route);
                        self.last_endpoint = resolved.clone();
                        self.events
                            .emit(SocketEvent::Listening { endpoint: resolved });
                        Ok(())
                    }
                    Err(e) => {
                        self.events.emit(SocketEvent::BindFailed {
                            endpoint: endpoint_str.to_string(),
                            reason: e.to_string(),
                        });
                        Err(e.into())
                    }
                }
            }
            other => Err(DriveshaftError::UnsupportedTransport(other.to_string())),
        }
    }

    fn connect(&mut self, endpoint_str: &str) -> Result<()> {
        self.terminated_check()?;
        self.process_commands(None)?;

        match Endpoint::parse(endpoint_str)? {
            Endpoint::Inproc(name) => {
                let identity = self.options.connect_routing_id.take();
                if let Some(binding) = self.ctx.find_inproc(&name) {
                    let hwm_out = combine_hwm(self.options.sndhwm, binding.rcvhwm);
                    let hwm_in = combine_hwm(self.options.rcvhwm, binding.sndhwm);
                    let (mut local, peer_end) = pipe_pair(
                        &self.ctx,
                        Some(self.route.clone()),
                        Some(binding.route.clone()),
                        hwm_out,
                        hwm_in,
                    );
                    local.set_identity(identity);
                    self.attach_pipe(local, true);
                    self.ctx
                        .send_command(&binding.route, CommandKind::Bind { pipe: peer_end });
                    self.endpoints
                        .insert(endpoint_str.to_string(), binding.route);
                } else {
                    // Nobody bound yet: park our half of the link in
                    // the context until someone does.
                    let (mut local, bind_pipe) = pipe_pair(
                        &self.ctx,
                        Some(self.route.clone()),
                        None,
                        self.options.sndhwm,
                        self.options.rcvhwm,
                    );
                    local.set_identity(identity);
                    let connector_pipe = local.id();
                    self.attach_pipe(local, true);
                    self.ctx.pend_inproc(
                        &name,
                        PendingConnection {
                            connector: self.route.clone(),
                            connector_pipe,
                            bind_pipe,
                        },
                    );
                    self.endpoints
                        .insert(endpoint_str.to_string(), self.route.clone());
                }
                self.last_endpoint = endpoint_str.to_string();
                Ok(())
            }
            Endpoint::Tcp(tcp) => {
                if matches!(tcp.port, TcpPort::Ephemeral) {
                    return Err(DriveshaftError::InvalidEndpoint(
                        "cannot connect to a wildcard port".into(),
                    ));
                }
                let tid = self.ctx.choose_io_thread();
                let session_route = self.ctx.alloc_route(MailboxId::IoThread(tid));

                // Unless immediate mode asks otherwise, the pipe comes
                // up right away so sends queue while the connection
                // establishes.
                let session_pipe = if self.options.immediate {
                    None
                } else {
                    let (mut local, remote) = pipe_pair(
                        &self.ctx,
                        Some(self.route.clone()),
                        Some(session_route.clone()),
                        self.options.sndhwm,
                        self.options.rcvhwm,
                    );
                    local.set_identity(self.options.connect_routing_id.take());
                    self.attach_pipe(local, true);
                    Some(remote)
                };

                let session = Session::new(
                    Arc::clone(&self.ctx),
                    session_route.clone(),
                    self.route.clone(),
                    self.route.clone(),
                    self.options.clone(),
                    self.events.clone(),
                    Some(tcp),
                    endpoint_str.to_string(),
                    session_pipe,
                );
                self.own
                    .launch_child(session_route.clone(), Box::new(session));
                self.endpoints
                    .insert(endpoint_str.to_string(), session_route);
                self.last_endpoint = endpoint_str.to_string();
                Ok(())
            }
            other => Err(DriveshaftError::UnsupportedTransport(other.to_string())),
        }
    }

    // ---------------------------------------------------- data path

    /// Commands must drain on every data-path call: a peer may be
    /// parked waiting for a signal that only surfaces when we process
    /// our mailbox. The empty-mailbox fast path costs no syscall.
    fn tick(&mut self) -> Result<()> {
        self.process_commands(None)
    }

    fn try_send_inner(&mut self, msg: Msg) -> std::result::Result<(), PatternError> {
        self.pattern.xsend(&mut self.pipes, &self.options, msg)
    }

    fn send_msg(&mut self, msg: Msg, block: bool) -> Result<()> {
        self.tick()?;

        let mut msg = msg;
        match self.try_send_inner(msg) {
            Ok(()) => return Ok(()),
            Err(PatternError::Unsupported) => return Err(DriveshaftError::Unsupported),
            Err(PatternError::NoRoute) => return Err(DriveshaftError::HostUnreachable),
            Err(PatternError::BadState(s)) => return Err(DriveshaftError::InvalidState(s)),
            Err(PatternError::Full(returned)) => msg = returned,
        }

        // Maybe an activation is already queued.
        self.process_commands(None)?;

        if !block || self.options.is_send_nonblocking() {
            return match self.try_send_inner(msg) {
                Ok(()) => Ok(()),
                Err(PatternError::Full(_)) => Err(DriveshaftError::WouldBlock),
                Err(other) => Err(pattern_error(other)),
            };
        }

        let deadline = self
            .options
            .sndtimeo
            .map(|timeout| Instant::now() + timeout);
        loop {
            match self.try_send_inner(msg) {
                Ok(()) => return Ok(()),
                Err(PatternError::Full(returned)) => msg = returned,
                Err(other) => return Err(pattern_error(other)),
            }
            let timeout = remaining(deadline)?;
            self.process_commands(Some(timeout))?;
        }
    }

    fn recv_msg(&mut self, block: bool) -> Result<Msg> {
        self.tick()?;

        match self.pattern.xrecv(&mut self.pipes, &self.options) {
            Ok(msg) => return self.accept_msg(msg),
            Err(DriveshaftError::WouldBlock) => {}
            Err(e) => return Err(e),
        }

        self.process_commands(None)?;

        if !block || self.options.is_recv_nonblocking() {
            let msg = self.pattern.xrecv(&mut self.pipes, &self.options)?;
            return self.accept_msg(msg);
        }

        let deadline = self
            .options
            .rcvtimeo
            .map(|timeout| Instant::now() + timeout);
        loop {
            match self.pattern.xrecv(&mut self.pipes, &self.options) {
                Ok(msg) => return self.accept_msg(msg),
                Err(DriveshaftError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
            let timeout = remaining(deadline)?;
            self.process_commands(Some(timeout))?;
        }
    }

    fn accept_msg(&mut self, msg: Msg) -> Result<Msg> {
        self.rcvmore = msg.has_more();
        Ok(msg)
    }

    fn set_option(&mut self, opt: SocketOption) -> Result<()> {
        self.terminated_check()?;
        if let Some(result) = self.pattern.xsetsockopt(&mut self.pipes, &opt) {
            return result;
        }
        self.options.set(opt)
    }

    // ---------------------------------------------------- teardown

    fn start_termination(&mut self) {
        if self.own.is_terminating() {
            return;
        }
        self.ctx.unregister_inproc(self.route.object());
        self.endpoints.clear();

        let ids: Vec<ObjectId> = self.pipes.keys().copied().collect();
        for id in ids {
            let has_peer = match self.pipes.get_mut(&id) {
                Some(pipe) if pipe.has_peer_route() => {
                    pipe.terminate(false);
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if has_peer {
                self.own.register_term_acks(1);
            } else {
                // A pending inproc connect that never matched: no peer
                // to handshake with, drop it outright.
                self.pipes.remove(&id);
                self.pattern.xpipe_terminated(&mut self.pipes, id);
            }
        }
        let linger = self.options.linger;
        self.own.start_term(linger);
    }
}

fn pattern_error(err: PatternError) -> DriveshaftError {
    match err {
        PatternError::Full(_) => DriveshaftError::WouldBlock,
        PatternError::Unsupported => DriveshaftError::Unsupported,
        PatternError::NoRoute => DriveshaftError::HostUnreachable,
        PatternError::BadState(s) => DriveshaftError::InvalidState(s),
    }
}

/// Time left until `deadline`; `Err(WouldBlock)` once it passed.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(DriveshaftError::WouldBlock)
            } else {
                Ok(Some(left))
            }
        }
    }
}

impl Reapable for SocketCore {
    fn object_id(&self) -> ObjectId {
        self.route.object()
    }

    fn mailbox_fd(&self) -> RawFd {
        self.mailbox.fd()
    }

    fn start_reaping(&mut self) {
        self.start_termination();
    }

    fn process_pending(&mut self) -> bool {
        while let Some(cmd) = self.mailbox.try_recv() {
            self.handle_command(cmd);
        }
        if self.own.check_term() {
            let reaper = self.ctx.reaper_route().clone();
            self.ctx.send_command(&reaper, CommandKind::Reaped);
            self.events.stop();
            true
        } else {
            false
        }
    }
}

/// A messaging socket.
///
/// Sockets are single-owner values: every operation takes `&mut self`,
/// which also serialises option changes against the data path. Closing
/// (or dropping) hands any queued messages to the runtime to drain
/// under the linger policy.
pub struct Socket {
    core: Option<Box<SocketCore>>,
}

impl Socket {
    /// Create a socket of the given pattern on a context.
    pub fn new(ctx: &Context, socket_type: SocketType) -> Result<Self> {
        let pattern: Box<dyn SocketPattern> = match socket_type {
            SocketType::Pair => Box::new(PairPattern::new()),
            SocketType::Pub => Box::new(PubPattern::new()),
            SocketType::Sub => Box::new(SubPattern::new()),
            SocketType::Req => Box::new(ReqPattern::new()),
            SocketType::Rep => Box::new(RepPattern::new()),
            SocketType::Dealer => Box::new(DealerPattern::new()),
            SocketType::Router => Box::new(RouterPattern::new()),
            SocketType::Pull => Box::new(PullPattern::new()),
            SocketType::Push => Box::new(PushPattern::new()),
            SocketType::XPub => Box::new(XPubPattern::new()),
            SocketType::XSub => Box::new(XSubPattern::new()),
        };
        let core = SocketCore::new(ctx.shared(), socket_type, pattern)?;
        Ok(Self {
            core: Some(Box::new(core)),
        })
    }

    fn core(&mut self) -> &mut SocketCore {
        self.core.as_mut().expect("socket is closed")
    }

    /// Accept connections at an endpoint (`tcp://`, `inproc://`).
    pub fn bind(&mut self, endpoint: &str) -> Result<()> {
        self.core().bind(endpoint)
    }

    /// Connect to an endpoint. TCP connects are asynchronous: messages
    /// queue until the connection (re-)establishes.
    pub fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.core().connect(endpoint)
    }

    /// Send one frame, blocking per the send-timeout option. Set the
    /// MORE flag on the message to continue a multi-frame message.
    pub fn send(&mut self, msg: impl Into<Msg>) -> Result<()> {
        self.core().send_msg(msg.into(), true)
    }

    /// Non-blocking send.
    pub fn try_send(&mut self, msg: impl Into<Msg>) -> Result<()> {
        self.core().send_msg(msg.into(), false)
    }

    /// Send every item as one atomic multi-frame message.
    pub fn send_multipart<I, M>(&mut self, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<Msg>,
    {
        let mut iter = parts.into_iter().peekable();
        while let Some(part) = iter.next() {
            let mut msg: Msg = part.into();
            msg.set_more(iter.peek().is_some());
            self.send(msg)?;
        }
        Ok(())
    }

    /// Receive one frame, blocking per the receive-timeout option.
    pub fn recv(&mut self) -> Result<Msg> {
        self.core().recv_msg(true)
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Msg> {
        self.core().recv_msg(false)
    }

    /// Receive all frames of the next message.
    pub fn recv_multipart(&mut self) -> Result<Vec<Msg>> {
        let mut parts = vec![self.recv()?];
        while self.rcvmore() {
            parts.push(self.recv()?);
        }
        Ok(parts)
    }

    /// Does the last received frame have successors?
    #[must_use]
    pub fn rcvmore(&self) -> bool {
        self.core.as_ref().map_or(false, |c| c.rcvmore)
    }

    /// Apply a socket option.
    pub fn set_option(&mut self, opt: SocketOption) -> Result<()> {
        self.core().set_option(opt)
    }

    /// Current configuration.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.core.as_ref().expect("socket is closed").options
    }

    /// The socket's pattern.
    #[must_use]
    pub fn socket_type(&self) -> SocketType {
        self.options().socket_type
    }

    /// Last endpoint bound or connected, with wildcards resolved.
    #[must_use]
    pub fn last_endpoint(&self) -> &str {
        self.core
            .as_ref()
            .map_or("", |c| c.last_endpoint.as_str())
    }

    /// Subscribe to lifecycle events.
    pub fn monitor(&mut self) -> SocketMonitor {
        self.core().events.subscribe()
    }

    /// Close the socket. Queued outbound messages drain in the
    /// background under the linger policy.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        let ctx = Arc::clone(&core.ctx);
        ctx.socket_closed(core.route.object());
        let reaper = ctx.reaper_route().clone();
        ctx.send_command(&reaper, CommandKind::Reap { socket: core });
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close_inner();
    }
}
