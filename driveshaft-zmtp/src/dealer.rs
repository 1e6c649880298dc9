//! DEALER socket pattern.
//!
//! Asynchronous request-reply building block: outbound messages
//! load-balance round-robin across peers, inbound messages fair-queue
//! across peers. No envelopes, no state machine; REQ layers its
//! strictness on top of this.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::Result;
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::fq::FairQueue;
use crate::lb::LoadBalancer;

pub(crate) struct DealerPattern {
    fq: FairQueue,
    lb: LoadBalancer,
}

impl DealerPattern {
    pub fn new() -> Self {
        Self {
            fq: FairQueue::new(),
            lb: LoadBalancer::new(),
        }
    }
}

impl SocketPattern for DealerPattern {
    fn xattach_pipe(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        self.fq.attach(pipe);
        self.lb.attach(pipe);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        self.lb.send(pipes, msg).map_err(PatternError::Full)
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        self.fq.recv(pipes).map(|(_, msg)| msg)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.fq.has_in(pipes)
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.lb.has_out(pipes)
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, pipe: ObjectId) {
        self.fq.activated(pipe);
    }

    fn xwrite_activated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.lb.activated(pipe);
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.fq.terminated(pipe);
        self.lb.terminated(pipe);
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
