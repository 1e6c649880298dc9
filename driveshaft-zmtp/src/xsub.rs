//! XSUB socket pattern.
//!
//! The subscriber's lower half: subscriptions arrive as explicit
//! messages from the application (a 0x01/0x00 lead byte plus prefix)
//! and are forwarded upstream to every publisher; inbound messages are
//! fair-queued and filtered against the local subscription set. On a
//! publisher reconnect the full subscription set is replayed.

use std::collections::VecDeque;

use bytes::Bytes;

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::Options;

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::fq::FairQueue;
use crate::subscription::{SubscriptionEvent, Subscriptions};

pub(crate) struct XSubPattern {
    fq: FairQueue,
    /// Every attached pipe, for broadcasting subscription changes.
    out_pipes: Vec<ObjectId>,
    subscriptions: Subscriptions,
    /// Filtered-ahead messages waiting for the application.
    prefetched: VecDeque<Msg>,
    /// Mid-message passthrough: frames after an accepted first frame.
    more: bool,
}

impl XSubPattern {
    pub fn new() -> Self {
        Self {
            fq: FairQueue::new(),
            out_pipes: Vec::new(),
            subscriptions: Subscriptions::new(),
            prefetched: VecDeque::new(),
            more: false,
        }
    }

    fn send_subscription(pipes: &mut PipeMap, pipe: ObjectId, event: &SubscriptionEvent) {
        let Some(p) = pipes.get_mut(&pipe) else {
            return;
        };
        // A full pipe drops the control message; the reconnect replay
        // covers the gap.
        if p.write(event.to_msg()).is_ok() {
            p.flush();
        }
    }

    fn broadcast(&mut self, pipes: &mut PipeMap, event: &SubscriptionEvent) {
        for pipe in self.out_pipes.clone() {
            Self::send_subscription(pipes, pipe, event);
        }
    }

    /// Apply one subscription message from the application.
    pub(crate) fn apply(&mut self, pipes: &mut PipeMap, event: SubscriptionEvent) {
        let changed = match &event {
            SubscriptionEvent::Subscribe(prefix) => self.subscriptions.subscribe(prefix.clone()),
            SubscriptionEvent::Unsubscribe(prefix) => self.subscriptions.unsubscribe(prefix),
        };
        // Duplicate subscriptions stay local; publishers only hear
        // about edges.
        if changed {
            self.broadcast(pipes, &event);
        }
    }

    /// Pull the next message that passes the filter into `prefetched`.
    fn fetch(&mut self, pipes: &mut PipeMap) -> Result<()> {
        loop {
            let (_, msg) = self.fq.recv(pipes)?;

            if self.more {
                // Continuation of an accepted message.
                self.more = msg.has_more();
                self.prefetched.push_back(msg);
                return Ok(());
            }

            if self.subscriptions.matches(msg.data()) {
                self.more = msg.has_more();
                self.prefetched.push_back(msg);
                return Ok(());
            }

            // Filtered out: swallow the remaining frames. They are
            // already flushed, so this cannot block.
            let mut dropping_more = msg.has_more();
            while dropping_more {
                let (_, frame) = self.fq.recv(pipes)?;
                dropping_more = frame.has_more();
            }
        }
    }
}

impl SocketPattern for XSubPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        self.fq.attach(pipe);
        self.out_pipes.push(pipe);
        // Replay the current interest set to the new publisher.
        let prefixes: Vec<Bytes> = self.subscriptions.prefixes().cloned().collect();
        for prefix in prefixes {
            Self::send_subscription(pipes, pipe, &SubscriptionEvent::Subscribe(prefix));
        }
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        // Subscription messages mutate local state and fan upstream;
        // anything else is forwarded verbatim (a feature XPUB peers
        // use for application-level protocols).
        match SubscriptionEvent::parse(msg.data()) {
            Some(event) => {
                self.apply(pipes, event);
                Ok(())
            }
            None => {
                for pipe in self.out_pipes.clone() {
                    if let Some(p) = pipes.get_mut(&pipe) {
                        if p.write(msg.clone()).is_ok() {
                            p.flush();
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        if let Some(msg) = self.prefetched.pop_front() {
            return Ok(msg);
        }
        self.fetch(pipes)?;
        self.prefetched
            .pop_front()
            .ok_or(DriveshaftError::WouldBlock)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        if !self.prefetched.is_empty() {
            return true;
        }
        matches!(self.fetch(pipes), Ok(()))
    }

    fn xhas_out(&mut self, _pipes: &mut PipeMap) -> bool {
        // Subscription sends never block.
        true
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, pipe: ObjectId) {
        self.fq.activated(pipe);
    }

    fn xhiccuped(&mut self, pipes: &mut PipeMap, _opts: &Options, pipe: ObjectId) {
        // The transport under this pipe is reconnecting: the new peer
        // must learn our subscriptions again.
        let prefixes: Vec<Bytes> = self.subscriptions.prefixes().cloned().collect();
        for prefix in prefixes {
            Self::send_subscription(pipes, pipe, &SubscriptionEvent::Subscribe(prefix));
        }
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.fq.terminated(pipe);
        self.out_pipes.retain(|p| *p != pipe);
    }
}
