//! PULL socket pattern.
//!
//! Downstream half of a pipeline: fair-queues inbound messages from
//! connected PUSH peers and cannot send.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::Result;
use driveshaft_core::msg::Msg;
use driveshaft_core::options::Options;

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::fq::FairQueue;

pub(crate) struct PullPattern {
    fq: FairQueue,
}

impl PullPattern {
    pub fn new() -> Self {
        Self {
            fq: FairQueue::new(),
        }
    }
}

impl SocketPattern for PullPattern {
    fn xattach_pipe(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        self.fq.attach(pipe);
    }

    fn xsend(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &Options,
        _msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        Err(PatternError::Unsupported)
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        self.fq.recv(pipes).map(|(_, msg)| msg)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.fq.has_in(pipes)
    }

    fn xhas_out(&mut self, _pipes: &mut PipeMap) -> bool {
        false
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, pipe: ObjectId) {
        self.fq.activated(pipe);
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.fq.terminated(pipe);
    }
}
