//! Duplex, flow-controlled message pipe.
//!
//! A [`pipe_pair`] connects two objects with a pair of Y-pipes, one
//! per direction. Each [`PipeEnd`] writes into one Y-pipe and reads
//! from the other, tracks high-water-mark credit against its peer, and
//! wakes the peer through its mailbox when a flush lands on a parked
//! reader.
//!
//! Flow control is credit-based: the writer may have at most `hwm`
//! unacknowledged messages in flight; the reader returns credit in
//! `ActivateWrite` commands every low-water-mark messages.
//!
//! Termination drains cleanly through a synthetic delimiter: the
//! terminating side writes a delimiter behind any queued messages and
//! sends `PipeTerm`; the peer keeps reading until the delimiter
//! arrives (or gives up immediately when draining is not wanted) and
//! answers `PipeTermAck`.

use std::sync::Arc;

use bytes::Bytes;

use crate::command::{CommandKind, ObjectId, Route};
use crate::config::MESSAGE_PIPE_GRANULARITY;
use crate::context::Ctx;
use crate::msg::Msg;
use crate::ypipe;

type MsgWriter = ypipe::Writer<Msg, MESSAGE_PIPE_GRANULARITY>;
type MsgReader = ypipe::Reader<Msg, MESSAGE_PIPE_GRANULARITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    /// Peer's delimiter arrived before any termination request.
    DelimiterReceived,
    /// Peer asked to terminate; we drain until its delimiter.
    WaitingForDelimiter,
    /// We asked to terminate and await the peer's ack.
    TermReqSent1,
    /// Both sides asked concurrently; ack sent, awaiting the peer's.
    TermReqSent2,
    /// Ack sent; terminated once the peer's final ack arrives.
    TermAckSent,
}

/// One endpoint of a duplex pipe.
pub struct PipeEnd {
    ctx: Arc<Ctx>,
    id: ObjectId,
    writer: MsgWriter,
    reader: MsgReader,
    peer_route: Option<Route>,
    peer_id: ObjectId,

    in_active: bool,
    out_active: bool,

    /// Outbound high-water mark; 0 is unlimited.
    hwm: u32,
    /// Inbound credit cadence; 0 disables credit updates.
    lwm: u32,
    msgs_read: u64,
    msgs_written: u64,
    peers_msgs_read: u64,

    state: State,
    /// Drain inbound messages before acking a peer's termination.
    delay: bool,
    /// The outbound direction is sealed (delimiter written or given up).
    out_closed: bool,

    /// Peer identity for identity-addressed patterns.
    identity: Option<Bytes>,

    // Signals owed to a peer whose route is not yet known (inproc
    // connect-before-bind).
    owes_wake: bool,
    owes_credit: Option<u64>,
}

fn lwm_for(hwm: u32) -> u32 {
    if hwm == 0 {
        0
    } else {
        (hwm + 1) / 2
    }
}

/// Create both ends of a duplex pipe between the objects `route_a` and
/// `route_b`. `hwm_a_to_b` caps messages in flight from A to B and
/// vice versa. A `None` route parks the corresponding direction's
/// signalling until [`PipeEnd::set_peer_route`] supplies the address.
pub fn pipe_pair(
    ctx: &Arc<Ctx>,
    route_a: Option<Route>,
    route_b: Option<Route>,
    hwm_a_to_b: u32,
    hwm_b_to_a: u32,
) -> (PipeEnd, PipeEnd) {
    let id_a = ctx.alloc_object_id();
    let id_b = ctx.alloc_object_id();

    let (w_ab, r_ab) = ypipe::pair();
    let (w_ba, r_ba) = ypipe::pair();

    let end_a = PipeEnd {
        ctx: Arc::clone(ctx),
        id: id_a,
        writer: w_ab,
        reader: r_ba,
        peer_route: route_b,
        peer_id: id_b,
        in_active: true,
        out_active: true,
        hwm: hwm_a_to_b,
        lwm: lwm_for(hwm_b_to_a),
        msgs_read: 0,
        msgs_written: 0,
        peers_msgs_read: 0,
        state: State::Active,
        delay: true,
        out_closed: false,
        identity: None,
        owes_wake: false,
        owes_credit: None,
    };
    let end_b = PipeEnd {
        ctx: Arc::clone(ctx),
        id: id_b,
        writer: w_ba,
        reader: r_ab,
        peer_route: route_a,
        peer_id: id_a,
        in_active: true,
        out_active: true,
        hwm: hwm_b_to_a,
        lwm: lwm_for(hwm_a_to_b),
        msgs_read: 0,
        msgs_written: 0,
        peers_msgs_read: 0,
        state: State::Active,
        delay: true,
        out_closed: false,
        identity: None,
        owes_wake: false,
        owes_credit: None,
    };
    (end_a, end_b)
}

impl PipeEnd {
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Bytes> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: Option<Bytes>) {
        self.identity = identity;
    }

    #[must_use]
    pub fn has_peer_route(&self) -> bool {
        self.peer_route.is_some()
    }

    /// Supply the peer's address after the fact (inproc pending
    /// connections) and deliver any signals that accrued meanwhile.
    pub fn set_peer_route(&mut self, route: Route) {
        self.peer_route = Some(route);
        if std::mem::take(&mut self.owes_wake) {
            self.send_to_peer(CommandKind::ActivateRead { pipe: self.peer_id });
        }
        if let Some(msgs_read) = self.owes_credit.take() {
            self.send_to_peer(CommandKind::ActivateWrite {
                pipe: self.peer_id,
                msgs_read,
            });
        }
    }

    fn send_to_peer(&self, kind: CommandKind) {
        if let Some(route) = &self.peer_route {
            self.ctx.send_command(route, kind);
        }
    }

    // ---------------------------------------------------------- write

    /// Room for one more message?
    #[must_use]
    pub fn check_write(&mut self) -> bool {
        if !self.out_active || self.state != State::Active {
            return false;
        }
        if self.full() {
            self.out_active = false;
            return false;
        }
        true
    }

    fn full(&self) -> bool {
        self.hwm > 0 && self.msgs_written.saturating_sub(self.peers_msgs_read) >= u64::from(self.hwm)
    }

    /// Queue a message. Multi-frame messages stay invisible to the
    /// reader until their final frame is written; a message counts
    /// against the high-water mark once, at its final frame.
    pub fn write(&mut self, msg: Msg) -> Result<(), Msg> {
        if !self.check_write() {
            return Err(msg);
        }
        let more = msg.has_more();
        self.writer.write(msg, more);
        if !more {
            self.msgs_written += 1;
        }
        Ok(())
    }

    /// Retract unflushed frames of a partially written message.
    pub fn rollback(&mut self) {
        while let Some(msg) = self.writer.unwrite() {
            debug_assert!(msg.has_more(), "rolled back a completed message");
        }
    }

    /// Publish queued messages, waking the peer if it slept.
    pub fn flush(&mut self) {
        if self.state == State::TermAckSent {
            return;
        }
        if !self.writer.flush() {
            if self.peer_route.is_some() {
                self.send_to_peer(CommandKind::ActivateRead { pipe: self.peer_id });
            } else {
                self.owes_wake = true;
            }
        }
    }

    // ----------------------------------------------------------- read

    /// Is a message available?
    pub fn check_read(&mut self) -> bool {
        if !self.in_active
            || !matches!(self.state, State::Active | State::WaitingForDelimiter)
        {
            return false;
        }
        if !self.reader.check_read() {
            self.in_active = false;
            return false;
        }
        if self.reader.probe(Msg::is_delimiter) {
            let _ = self.reader.read();
            self.process_delimiter();
            return false;
        }
        true
    }

    /// Take the next message, returning credit to the peer every
    /// low-water-mark messages.
    pub fn read(&mut self) -> Option<Msg> {
        if !self.in_active
            || !matches!(self.state, State::Active | State::WaitingForDelimiter)
        {
            return None;
        }
        let Some(msg) = self.reader.read() else {
            self.in_active = false;
            return None;
        };
        if msg.is_delimiter() {
            self.process_delimiter();
            return None;
        }
        if !msg.has_more() {
            self.msgs_read += 1;
            if self.lwm > 0 && self.msgs_read % u64::from(self.lwm) == 0 {
                let msgs_read = self.msgs_read;
                if self.peer_route.is_some() {
                    self.send_to_peer(CommandKind::ActivateWrite {
                        pipe: self.peer_id,
                        msgs_read,
                    });
                } else {
                    self.owes_credit = Some(msgs_read);
                }
            }
        }
        Some(msg)
    }

    // ------------------------------------------------- command inputs

    /// `ActivateRead` arrived: the writer published while we slept.
    /// Returns true when the owner should be told reading resumed.
    pub fn process_activate_read(&mut self) -> bool {
        if !self.in_active
            && matches!(self.state, State::Active | State::WaitingForDelimiter)
        {
            self.in_active = true;
            return true;
        }
        false
    }

    /// `ActivateWrite` credit arrived. Returns true when the owner
    /// should be told writing resumed.
    pub fn process_activate_write(&mut self, msgs_read: u64) -> bool {
        self.peers_msgs_read = msgs_read;
        if !self.out_active && self.state == State::Active && !self.full() {
            self.out_active = true;
            return true;
        }
        false
    }

    /// Peer asked us to terminate.
    pub fn process_pipe_term(&mut self) {
        match self.state {
            State::Active => {
                if self.delay {
                    self.state = State::WaitingForDelimiter;
                } else {
                    self.out_closed = true;
                    self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                    self.state = State::TermAckSent;
                }
            }
            State::DelimiterReceived => {
                self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                self.state = State::TermAckSent;
            }
            State::TermReqSent1 => {
                // Both sides initiated concurrently.
                self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                self.state = State::TermReqSent2;
            }
            _ => tracing::warn!(pipe = self.id, "unexpected pipe-term"),
        }
    }

    /// Peer acknowledged termination. Returns true once this end is
    /// fully terminated and may be dropped.
    #[must_use]
    pub fn process_pipe_term_ack(&mut self) -> bool {
        match self.state {
            State::TermReqSent1 => {
                self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                true
            }
            State::TermReqSent2 | State::TermAckSent => true,
            _ => {
                tracing::warn!(pipe = self.id, "unexpected pipe-term-ack");
                false
            }
        }
    }

    fn process_delimiter(&mut self) {
        match self.state {
            State::Active => self.state = State::DelimiterReceived,
            State::WaitingForDelimiter => {
                self.rollback();
                self.out_closed = true;
                self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                self.state = State::TermAckSent;
            }
            _ => {}
        }
    }

    /// Notify the peer's owner that this direction is about to be
    /// re-established (reconnect); patterns replay state on it.
    pub fn hiccup(&mut self) {
        if self.state == State::Active {
            self.send_to_peer(CommandKind::Hiccup { pipe: self.peer_id });
        }
    }

    /// Begin termination of this end. With `delay`, inbound messages
    /// keep flowing until the peer's delimiter arrives; without it,
    /// anything still queued inbound is abandoned.
    pub fn terminate(&mut self, delay: bool) {
        self.delay = delay;

        match self.state {
            State::TermReqSent1 | State::TermReqSent2 | State::TermAckSent => return,
            State::Active | State::DelimiterReceived => {
                self.send_to_peer(CommandKind::PipeTerm { pipe: self.peer_id });
                self.state = State::TermReqSent1;
            }
            State::WaitingForDelimiter => {
                if delay {
                    // Keep draining; the delimiter completes things.
                    return;
                }
                self.rollback();
                self.out_closed = true;
                self.send_to_peer(CommandKind::PipeTermAck { pipe: self.peer_id });
                self.state = State::TermAckSent;
                return;
            }
        }

        self.out_active = false;
        if !self.out_closed {
            self.rollback();
            self.writer.write(Msg::delimiter(), false);
            if !self.writer.flush() {
                self.send_to_peer(CommandKind::ActivateRead { pipe: self.peer_id });
            }
            self.out_closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, MailboxId};
    use crate::context::Context;

    // Drive both ends by hand, shuttling the flow-control commands
    // between two registered mailboxes the way the socket and session
    // threads would.

    fn apply(pipe: &mut PipeEnd, cmd: Command) {
        match cmd.kind {
            CommandKind::ActivateRead { .. } => {
                let _ = pipe.process_activate_read();
            }
            CommandKind::ActivateWrite { msgs_read, .. } => {
                let _ = pipe.process_activate_write(msgs_read);
            }
            CommandKind::PipeTerm { .. } => pipe.process_pipe_term(),
            CommandKind::PipeTermAck { .. } => {
                let _ = pipe.process_pipe_term_ack();
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_hwm_blocks_and_credit_unblocks() {
        let ctx = Context::new().unwrap();
        let (route_a, mut mb_a) = ctx.shared().register_socket().unwrap();
        let (route_b, mut mb_b) = ctx.shared().register_socket().unwrap();
        let (mut a, mut b) = pipe_pair(
            ctx.shared(),
            Some(route_a.clone()),
            Some(route_b.clone()),
            10,
            10,
        );

        for i in 0..10u64 {
            a.write(Msg::from(format!("{i}").into_bytes())).unwrap();
        }
        a.flush();
        // At the mark: the 11th write must be refused.
        assert!(a.write(Msg::from("over")).is_err());
        assert!(!a.check_write());

        // Reader drains five messages; lwm = (10+1)/2 = 5 triggers one
        // credit update.
        while let Some(cmd) = mb_b.try_recv() {
            apply(&mut b, cmd);
        }
        for _ in 0..5 {
            assert!(b.read().is_some());
        }
        let mut credited = false;
        while let Some(cmd) = mb_a.try_recv() {
            credited = true;
            apply(&mut a, cmd);
        }
        assert!(credited);

        // Five more writes fit now.
        for i in 0..5u64 {
            a.write(Msg::from(format!("again-{i}").into_bytes()))
                .unwrap();
        }
        a.flush();
        assert!(a.write(Msg::from("over")).is_err());

        ctx.shared().deregister_socket(route_a.object());
        ctx.shared().deregister_socket(route_b.object());
        ctx.term().unwrap();
    }

    #[test]
    fn test_multiframe_counts_once_and_arrives_whole() {
        let ctx = Context::new().unwrap();
        let (route_a, _mb_a) = ctx.shared().register_socket().unwrap();
        let (route_b, mut mb_b) = ctx.shared().register_socket().unwrap();
        let (mut a, mut b) = pipe_pair(
            ctx.shared(),
            Some(route_a.clone()),
            Some(route_b.clone()),
            2,
            2,
        );

        a.write(Msg::from("head").with_more(true)).unwrap();
        a.write(Msg::from("mid").with_more(true)).unwrap();
        // Incomplete message is invisible to the reader.
        a.flush();
        assert!(!b.check_read());

        a.write(Msg::from("tail")).unwrap();
        a.flush();
        while let Some(cmd) = mb_b.try_recv() {
            apply(&mut b, cmd);
        }
        let m1 = b.read().unwrap();
        assert!(m1.has_more());
        assert_eq!(m1.data(), b"head");
        assert!(b.read().unwrap().has_more());
        let m3 = b.read().unwrap();
        assert!(!m3.has_more());
        assert_eq!(m3.data(), b"tail");

        ctx.shared().deregister_socket(route_a.object());
        ctx.shared().deregister_socket(route_b.object());
        ctx.term().unwrap();
    }

    #[test]
    fn test_termination_drains_then_completes() {
        let ctx = Context::new().unwrap();
        let (route_a, mut mb_a) = ctx.shared().register_socket().unwrap();
        let (route_b, mut mb_b) = ctx.shared().register_socket().unwrap();
        let (mut a, mut b) = pipe_pair(
            ctx.shared(),
            Some(route_a.clone()),
            Some(route_b.clone()),
            0,
            0,
        );

        a.write(Msg::from("one")).unwrap();
        a.write(Msg::from("two")).unwrap();
        a.flush();
        a.terminate(false);

        // B processes the term request, keeps draining (delay defaults
        // true), and sees both messages before the delimiter.
        while let Some(cmd) = mb_b.try_recv() {
            apply(&mut b, cmd);
        }
        assert_eq!(b.read().unwrap().data(), b"one");
        assert_eq!(b.read().unwrap().data(), b"two");
        assert!(b.read().is_none()); // delimiter: acks the termination

        // A completes on B's ack and echoes the final ack.
        let mut a_done = false;
        while let Some(cmd) = mb_a.try_recv() {
            if matches!(cmd.kind, CommandKind::PipeTermAck { .. }) {
                a_done = a.process_pipe_term_ack();
            } else {
                apply(&mut a, cmd);
            }
        }
        assert!(a_done);

        // B completes on the echoed ack.
        let mut b_done = false;
        while let Some(cmd) = mb_b.try_recv() {
            if matches!(cmd.kind, CommandKind::PipeTermAck { .. }) {
                b_done = b.process_pipe_term_ack();
            } else {
                apply(&mut b, cmd);
            }
        }
        assert!(b_done);

        ctx.shared().deregister_socket(route_a.object());
        ctx.shared().deregister_socket(route_b.object());
        ctx.term().unwrap();
    }
}
