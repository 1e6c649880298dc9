//! XPUB socket pattern.
//!
//! The publisher's lower half: subscription messages stream in from
//! each subscriber pipe and maintain a per-pipe interest set; outbound
//! messages fan out to the pipes whose interest matches the first
//! frame. Subscription changes are surfaced to the application through
//! `recv` — first-time subscribes and final unsubscribes by default,
//! every one of them in verbose mode.
//!
//! Publishing is lossy: a subscriber at its high-water mark misses the
//! message rather than stalling the publisher.

use std::collections::VecDeque;

use hashbrown::HashMap;

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::dist::Distributor;
use crate::subscription::{SubscriptionEvent, Subscriptions};

pub(crate) struct XPubPattern {
    dist: Distributor,
    pipes_attached: Vec<ObjectId>,
    interest: HashMap<ObjectId, Subscriptions>,
    /// Subscription messages waiting for the application.
    pending: VecDeque<Msg>,
}

impl XPubPattern {
    pub fn new() -> Self {
        Self {
            dist: Distributor::new(),
            pipes_attached: Vec::new(),
            interest: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Drain subscription messages a subscriber pushed at us.
    fn drain_pipe(&mut self, pipes: &mut PipeMap, pipe: ObjectId, opts: &Options) {
        loop {
            let Some(pipe_end) = pipes.get_mut(&pipe) else {
                return;
            };
            let Some(msg) = pipe_end.read() else {
                return;
            };
            let Some(event) = SubscriptionEvent::parse(msg.data()) else {
                tracing::debug!(pipe, "malformed subscription message dropped");
                continue;
            };
            let subs = self.interest.entry(pipe).or_default();
            let edge = match &event {
                SubscriptionEvent::Subscribe(prefix) => subs.subscribe(prefix.clone()),
                SubscriptionEvent::Unsubscribe(prefix) => subs.unsubscribe(prefix),
            };
            if edge || opts.xpub_verbose {
                self.pending.push_back(msg);
            }
        }
    }

    fn matching(&self, topic: &[u8]) -> Vec<ObjectId> {
        self.pipes_attached
            .iter()
            .copied()
            .filter(|pipe| {
                self.interest
                    .get(pipe)
                    .is_some_and(|subs| subs.matches(topic))
            })
            .collect()
    }
}

impl SocketPattern for XPubPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        self.pipes_attached.push(pipe);
        self.interest.insert(pipe, Subscriptions::new());
        // Subscriptions may already be queued (inproc peers subscribe
        // before the pipe reaches us).
        self.drain_pipe(pipes, pipe, opts);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        let matching = if self.dist.mid_message() {
            None
        } else {
            Some(self.matching(msg.data()))
        };
        self.dist.send(pipes, &msg, matching);
        Ok(())
    }

    fn xrecv(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        self.pending
            .pop_front()
            .ok_or(DriveshaftError::WouldBlock)
    }

    fn xhas_in(&mut self, _pipes: &mut PipeMap) -> bool {
        !self.pending.is_empty()
    }

    fn xhas_out(&mut self, _pipes: &mut PipeMap) -> bool {
        // Lossy fan-out never blocks the sender.
        true
    }

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.drain_pipe(pipes, pipe, opts);
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.pipes_attached.retain(|p| *p != pipe);
        self.interest.remove(&pipe);
        self.dist.terminated(pipe);
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
