//! PUSH socket pattern.
//!
//! Upstream half of a pipeline: load-balances outbound messages over
//! connected PULL peers and cannot receive.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::Options;

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::lb::LoadBalancer;

pub(crate) struct PushPattern {
    lb: LoadBalancer,
}

impl PushPattern {
    pub fn new() -> Self {
        Self {
            lb: LoadBalancer::new(),
        }
    }
}

impl SocketPattern for PushPattern {
    fn xattach_pipe(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
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

    fn xrecv(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        Err(DriveshaftError::Unsupported)
    }

    fn xhas_in(&mut self, _pipes: &mut PipeMap) -> bool {
        false
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.lb.has_out(pipes)
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, _pipe: ObjectId) {}

    fn xwrite_activated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.lb.activated(pipe);
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.lb.terminated(pipe);
    }
}
