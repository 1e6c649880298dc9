//! Ownership graph and termination protocol.
//!
//! Long-lived objects form a tree: sockets own sessions and listeners,
//! listeners own accepted sessions, sessions own connecters. Teardown
//! is a two-phase wave: `Term` flows down the tree, `TermAck` bubbles
//! back up, and an object only removes itself once (a) every child has
//! acked, (b) every extra registered obligation (pipes, engines) has
//! been released, and (c) every command ever sent toward it has been
//! processed — the sent/processed sequence numbers have closed. The
//! last rule guarantees no command can outlive its destination.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandKind, Route};
use crate::context::Ctx;
use crate::io_thread::IoCtx;

/// What became of an object after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Alive,
    /// Fully terminated; the owner table drops the object.
    Destroyed,
}

/// An object living in an I/O thread's table, driven by commands,
/// descriptor readiness and timers.
pub trait IoObject: Send {
    /// Called once, on the owning thread, right after installation.
    fn plug(&mut self, io: &mut IoCtx<'_>) -> Disposition;

    /// Dispatch one command addressed to this object (or to one of its
    /// pipes).
    fn process_command(&mut self, io: &mut IoCtx<'_>, kind: CommandKind) -> Disposition;

    fn in_event(&mut self, io: &mut IoCtx<'_>) -> Disposition;

    fn out_event(&mut self, io: &mut IoCtx<'_>) -> Disposition;

    fn timer_event(&mut self, io: &mut IoCtx<'_>, id: u32) -> Disposition;
}

/// The ownership bookkeeping embedded in every tree node.
pub struct OwnCore {
    ctx: Arc<Ctx>,
    route: Route,
    owner: Option<Route>,
    children: Vec<Route>,
    /// Outstanding acks: children told to terminate plus extra
    /// obligations registered by the object itself.
    term_acks: u32,
    terminating: bool,
    /// Commands this object has processed; compared against
    /// `route.sent()` to close the graph.
    processed: u64,
}

impl OwnCore {
    #[must_use]
    pub fn new(ctx: Arc<Ctx>, route: Route, owner: Option<Route>) -> Self {
        Self {
            ctx,
            route,
            owner,
            children: Vec::new(),
            term_acks: 0,
            terminating: false,
            processed: 0,
        }
    }

    #[must_use]
    pub fn ctx(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route
    }

    #[must_use]
    pub fn owner(&self) -> Option<&Route> {
        self.owner.as_ref()
    }

    /// Account for one dequeued command. Must be called exactly once
    /// per command delivered to the owning object.
    pub fn note_command(&mut self) {
        self.processed += 1;
    }

    /// Adopt and start a child on the thread its route names. Must be
    /// called from the owning thread.
    pub fn launch_child(&mut self, route: Route, object: Box<dyn IoObject>) {
        self.children.push(route.clone());
        self.ctx.send_command(&route, CommandKind::Plug(object));
    }

    /// Ask to be torn down: route the request through the owner so the
    /// tree unwinds top-down, or start directly at the root.
    pub fn terminate(&mut self, linger: Option<Duration>) {
        match &self.owner {
            Some(owner) => {
                let child = self.route.clone();
                self.ctx.send_command(owner, CommandKind::TermReq { child });
            }
            None => self.start_term(linger),
        }
    }

    /// Owner-side handling of a child's termination request.
    pub fn process_term_req(&mut self, child: &Route, linger: Option<Duration>) {
        // During our own shutdown the wave already covers every child.
        if self.terminating {
            return;
        }
        let Some(pos) = self.children.iter().position(|c| c == child) else {
            return;
        };
        self.children.remove(pos);
        self.term_acks += 1;
        self.ctx.send_command(child, CommandKind::Term { linger });
    }

    /// Begin this node's own termination, fanning `Term` to children.
    pub fn start_term(&mut self, linger: Option<Duration>) {
        if self.terminating {
            return;
        }
        self.terminating = true;
        for child in self.children.drain(..) {
            self.ctx.send_command(&child, CommandKind::Term { linger });
            self.term_acks += 1;
        }
    }

    pub fn process_term_ack(&mut self) {
        self.unregister_term_ack();
    }

    /// Add extra obligations (attached pipes, a live engine) that must
    /// be released before this node may die.
    pub fn register_term_acks(&mut self, count: u32) {
        self.term_acks += count;
    }

    pub fn unregister_term_ack(&mut self) {
        debug_assert!(self.term_acks > 0, "termination ack underflow");
        self.term_acks = self.term_acks.saturating_sub(1);
    }

    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// All conditions for removal hold.
    #[must_use]
    pub fn check_term(&self) -> bool {
        self.terminating && self.term_acks == 0 && self.processed == self.route.sent()
    }

    /// Standard epilogue for every event: if termination has fully
    /// closed, ack the owner and report `Destroyed`.
    pub fn finalize(&mut self) -> Disposition {
        if !self.check_term() {
            return Disposition::Alive;
        }
        if let Some(owner) = &self.owner {
            self.ctx.send_command(owner, CommandKind::TermAck);
        }
        Disposition::Destroyed
    }
}
