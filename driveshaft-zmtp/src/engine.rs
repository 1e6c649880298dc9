//! Per-connection stream engine.
//!
//! Owns one connected TCP socket and drives it end-to-end: greeting
//! exchange, mechanism handshake, then the data pump between the
//! session pipe and the descriptor. The engine registers the
//! descriptor under its session's object id, so readiness events reach
//! the session first and are forwarded here.
//!
//! Backpressure works in both directions. Inbound: when the session
//! pipe refuses a decoded message the engine parks it, drops interest
//! in readability, and resumes on `restart_input`. Outbound: when the
//! encoder runs dry the engine drops interest in writability and
//! resumes on `restart_output`.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use driveshaft_core::buffer::SegmentedBuffer;
use driveshaft_core::config::{IN_BATCH_SIZE, OUT_BATCH_SIZE};
use driveshaft_core::engine::{Engine, EngineError, EngineSink};
use driveshaft_core::io_thread::IoCtx;
use driveshaft_core::monitor::{SocketEvent, SocketEvents};
use driveshaft_core::msg::Metadata;
use driveshaft_core::options::Options;
use driveshaft_core::reactor::Handle;

use crate::codec::{encode_msg, Decoder};
use crate::greeting::{Greeting, GREETING_SIZE};
use crate::mechanism::{Mechanism, MechanismStatus, Role};
use crate::mechanism::null::NullMechanism;

const HANDSHAKE_TIMER_ID: u32 = 0x40;

pub struct StreamEngine {
    sock: socket2::Socket,
    endpoint: String,
    options: Options,
    events: SocketEvents,
    role: Role,

    handle: Option<Handle>,
    /// Object id the descriptor and timers are registered under (the
    /// session's), captured at plug time.
    owner: Option<driveshaft_core::command::ObjectId>,
    inbuf: SegmentedBuffer,
    decoder: Decoder,
    outbuf: BytesMut,

    greeting_received: bool,
    mechanism: Box<dyn Mechanism>,
    active: bool,

    pending_in: Option<driveshaft_core::msg::Msg>,
    metadata: Option<Arc<Metadata>>,

    timer_armed: bool,
    errored: bool,
}

impl StreamEngine {
    pub fn new(
        sock: socket2::Socket,
        options: Options,
        endpoint: String,
        events: SocketEvents,
        role: Role,
    ) -> Self {
        let mechanism = Box::new(NullMechanism::new(
            role,
            options.socket_type,
            options.routing_id.as_ref(),
        ));
        let decoder = Decoder::new(options.maxmsgsize);
        Self {
            sock,
            endpoint,
            options,
            events,
            role,
            handle: None,
            owner: None,
            inbuf: SegmentedBuffer::new(),
            decoder,
            outbuf: BytesMut::new(),
            greeting_received: false,
            mechanism,
            active: false,
            pending_in: None,
            metadata: None,
            timer_armed: false,
            errored: false,
        }
    }

    fn error(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink, reason: EngineError) {
        if self.errored {
            return;
        }
        self.errored = true;
        if self.timer_armed {
            io.reactor.cancel_timer(sink.object_id(), HANDSHAKE_TIMER_ID);
            self.timer_armed = false;
        }
        sink.engine_error(reason);
    }

    fn handshake_failed(
        &mut self,
        io: &mut IoCtx<'_>,
        sink: &mut dyn EngineSink,
        reason: String,
    ) {
        self.events.emit(SocketEvent::HandshakeFailedProtocol {
            endpoint: self.endpoint.clone(),
            reason: reason.clone(),
        });
        self.error(io, sink, EngineError::Protocol(reason));
    }

    fn read_batch(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) -> bool {
        let mut chunk = BytesMut::zeroed(IN_BATCH_SIZE);
        loop {
            match (&self.sock).read(&mut chunk[..]) {
                Ok(0) => {
                    self.error(
                        io,
                        sink,
                        EngineError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
                    );
                    return false;
                }
                Ok(n) => {
                    self.inbuf.push(chunk.split_to(n).freeze());
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.error(io, sink, EngineError::Io(e));
                    return false;
                }
            }
        }
    }

    fn process_greeting(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) -> bool {
        if self.inbuf.len() < GREETING_SIZE {
            return false;
        }
        let mut raw = [0u8; GREETING_SIZE];
        self.inbuf.peek(&mut raw);
        self.inbuf.skip(GREETING_SIZE);

        match Greeting::parse(&raw) {
            Ok(greeting) => {
                if greeting.mechanism_name() != self.mechanism.name().as_bytes() {
                    self.handshake_failed(io, sink, "security mechanism mismatch".into());
                    return false;
                }
                self.greeting_received = true;
                true
            }
            Err(e) => {
                self.handshake_failed(io, sink, e.to_string());
                false
            }
        }
    }

    fn process_handshake(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) -> bool {
        loop {
            match self.decoder.decode(&mut self.inbuf) {
                Ok(None) => return false,
                Ok(Some(frame)) => {
                    if let Err(e) = self.mechanism.process(&frame) {
                        self.handshake_failed(io, sink, e.to_string());
                        return false;
                    }
                    match self.mechanism.status() {
                        MechanismStatus::Handshaking => continue,
                        MechanismStatus::Ready => return self.finish_handshake(io, sink),
                        MechanismStatus::Error => {
                            self.events.emit(SocketEvent::HandshakeFailedAuth {
                                endpoint: self.endpoint.clone(),
                            });
                            self.error(
                                io,
                                sink,
                                EngineError::Protocol("handshake refused by peer".into()),
                            );
                            return false;
                        }
                    }
                }
                Err(e) => {
                    self.handshake_failed(io, sink, e.to_string());
                    return false;
                }
            }
        }
    }

    fn finish_handshake(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) -> bool {
        if self.timer_armed {
            io.reactor.cancel_timer(sink.object_id(), HANDSHAKE_TIMER_ID);
            self.timer_armed = false;
        }
        let Some(peer_type) = self.mechanism.peer_socket_type() else {
            self.handshake_failed(io, sink, "peer announced no socket type".into());
            return false;
        };
        let metadata = Arc::new(self.mechanism.peer_metadata());
        self.metadata = Some(Arc::clone(&metadata));
        let identity = self.mechanism.peer_identity();

        if !sink.engine_ready(io, peer_type, identity, metadata) {
            self.handshake_failed(
                io,
                sink,
                format!("socket type {peer_type} is not a valid counterpart"),
            );
            return false;
        }
        self.active = true;
        // Messages may have queued on the pipe while we handshook and
        // no activation is owed for them: pump the output path once so
        // the pipe reader either drains or parks.
        if let Some(h) = self.handle {
            io.reactor.set_pollout(h);
        }
        self.events.emit(SocketEvent::HandshakeSucceeded {
            endpoint: self.endpoint.clone(),
        });
        true
    }

    fn process_input(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) {
        if !self.greeting_received && !self.process_greeting(io, sink) {
            return;
        }
        if !self.active {
            if !self.process_handshake(io, sink) {
                self.kick_output(io);
                return;
            }
            self.kick_output(io);
        }
        if self.errored {
            return;
        }

        if let Some(parked) = self.pending_in.take() {
            if let Err(parked) = sink.push_msg(parked) {
                self.pending_in = Some(parked);
                self.suspend_input(io);
                sink.flush();
                return;
            }
        }

        loop {
            match self.decoder.decode(&mut self.inbuf) {
                Ok(None) => break,
                Ok(Some(mut msg)) => {
                    if msg.is_command() {
                        // No post-handshake commands under NULL.
                        continue;
                    }
                    if let Some(meta) = &self.metadata {
                        msg.set_metadata(Arc::clone(meta));
                    }
                    if let Err(parked) = sink.push_msg(msg) {
                        self.pending_in = Some(parked);
                        self.suspend_input(io);
                        break;
                    }
                }
                Err(e) => {
                    sink.flush();
                    self.error(io, sink, EngineError::Protocol(e.to_string()));
                    return;
                }
            }
        }
        sink.flush();
    }

    fn suspend_input(&mut self, io: &mut IoCtx<'_>) {
        if let Some(h) = self.handle {
            io.reactor.reset_pollin(h);
        }
    }

    fn kick_output(&mut self, io: &mut IoCtx<'_>) {
        if !self.outbuf.is_empty() || self.mechanism.status() == MechanismStatus::Handshaking {
            if let Some(h) = self.handle {
                io.reactor.set_pollout(h);
            }
        }
    }

    fn fill_outbuf(&mut self, sink: &mut dyn EngineSink) {
        if !self.active {
            while let Some(frame) = self.mechanism.produce() {
                encode_msg(&frame, &mut self.outbuf);
            }
            return;
        }
        while self.outbuf.len() < OUT_BATCH_SIZE {
            match sink.pull_msg() {
                Some(msg) => encode_msg(&msg, &mut self.outbuf),
                None => break,
            }
        }
    }
}

impl Engine for StreamEngine {
    fn plug(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) {
        self.owner = Some(sink.object_id());
        let fd = self.sock.as_raw_fd();
        let handle = match io.reactor.add_fd(fd, sink.object_id()) {
            Ok(h) => h,
            Err(e) => {
                self.error(io, sink, EngineError::Io(e));
                return;
            }
        };
        self.handle = Some(handle);
        io.reactor.set_pollin(handle);

        // Both sides greet immediately; the exchange is full duplex.
        let as_server = self.role == Role::Server;
        self.outbuf
            .extend_from_slice(&Greeting::build(self.mechanism.name(), as_server));
        io.reactor.set_pollout(handle);

        if !self.options.handshake_ivl.is_zero() {
            io.reactor.add_timer(
                self.options.handshake_ivl,
                sink.object_id(),
                HANDSHAKE_TIMER_ID,
            );
            self.timer_armed = true;
        }
    }

    fn terminate(&mut self, io: &mut IoCtx<'_>) {
        if self.timer_armed {
            if let Some(owner) = self.owner {
                io.reactor.cancel_timer(owner, HANDSHAKE_TIMER_ID);
            }
            self.timer_armed = false;
        }
        if let Some(h) = self.handle.take() {
            io.reactor.rm_fd(h);
        }
        // The descriptor closes when the socket drops with the engine.
    }

    fn restart_input(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) {
        if self.errored {
            return;
        }
        if let Some(parked) = self.pending_in.take() {
            if let Err(parked) = sink.push_msg(parked) {
                self.pending_in = Some(parked);
                return;
            }
        }
        if let Some(h) = self.handle {
            io.reactor.set_pollin(h);
        }
        // Drain whatever is already buffered before the next readiness.
        self.process_input(io, sink);
    }

    fn restart_output(&mut self, io: &mut IoCtx<'_>, _sink: &mut dyn EngineSink) {
        if self.errored {
            return;
        }
        if let Some(h) = self.handle {
            io.reactor.set_pollout(h);
        }
    }

    fn in_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) {
        if self.errored || self.handle.is_none() {
            return;
        }
        if !self.read_batch(io, sink) {
            return;
        }
        self.process_input(io, sink);
    }

    fn out_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink) {
        if self.errored || self.handle.is_none() {
            return;
        }

        loop {
            if self.outbuf.is_empty() {
                self.fill_outbuf(sink);
            }
            if self.outbuf.is_empty() {
                break;
            }
            match (&self.sock).write(&self.outbuf) {
                Ok(0) => {
                    self.error(
                        io,
                        sink,
                        EngineError::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)),
                    );
                    return;
                }
                Ok(n) => {
                    self.outbuf.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.error(io, sink, EngineError::Io(e));
                    return;
                }
            }
        }

        // Fully drained: stop watching writability until new output.
        if let Some(h) = self.handle {
            io.reactor.reset_pollout(h);
        }
        if self.active && sink.finishing() {
            self.error(io, sink, EngineError::Done);
        }
    }

    fn timer_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink, id: u32) {
        if id != HANDSHAKE_TIMER_ID {
            return;
        }
        self.timer_armed = false;
        self.events.emit(SocketEvent::HandshakeFailedNoDetail {
            endpoint: self.endpoint.clone(),
        });
        self.error(io, sink, EngineError::Timeout);
    }

    fn idle(&self) -> bool {
        self.outbuf.is_empty()
    }
}

/// Whether a connection-level error is worth a reconnect (transient)
/// rather than a protocol giveup; sessions use this to pick policy.
#[must_use]
pub fn is_connection_error(reason: &EngineError) -> bool {
    matches!(reason, EngineError::Io(_) | EngineError::Timeout)
}

/// Peer address rendered as an endpoint string for monitor events.
pub(crate) fn peer_endpoint(sock: &socket2::Socket) -> String {
    sock.peer_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .map_or_else(|| "tcp://unknown".to_string(), |a| format!("tcp://{a}"))
}
