//! PUB socket pattern.
//!
//! XPUB with the subscription stream kept internal: subscriptions
//! still steer the fan-out, but the application never sees them and
//! cannot receive.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::Options;

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::xpub::XPubPattern;

pub(crate) struct PubPattern {
    inner: XPubPattern,
}

impl PubPattern {
    pub fn new() -> Self {
        Self {
            inner: XPubPattern::new(),
        }
    }

    fn discard_events(&mut self, pipes: &mut PipeMap, opts: &Options) {
        // The inner pattern queues subscription events for recv; PUB
        // has no recv, so drop them as they appear.
        while self.inner.xrecv(pipes, opts).is_ok() {}
    }
}

impl SocketPattern for PubPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        locally_initiated: bool,
    ) {
        self.inner.xattach_pipe(pipes, opts, pipe, locally_initiated);
        self.discard_events(pipes, opts);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        self.inner.xsend(pipes, opts, msg)
    }

    fn xrecv(&mut self, _pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        Err(DriveshaftError::Unsupported)
    }

    fn xhas_in(&mut self, _pipes: &mut PipeMap) -> bool {
        false
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.inner.xhas_out(pipes)
    }

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.inner.xread_activated(pipes, opts, pipe);
        self.discard_events(pipes, opts);
    }

    fn xwrite_activated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.inner.xwrite_activated(pipes, pipe);
    }

    fn xpipe_terminated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.inner.xpipe_terminated(pipes, pipe);
    }
}
