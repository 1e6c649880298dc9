//! SUB socket pattern.
//!
//! XSUB with the control surface folded into options: subscriptions
//! are managed through `Subscribe`/`Unsubscribe` socket options and
//! direct sends are refused.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::Result;
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::subscription::SubscriptionEvent;
use crate::xsub::XSubPattern;

pub(crate) struct SubPattern {
    inner: XSubPattern,
}

impl SubPattern {
    pub fn new() -> Self {
        Self {
            inner: XSubPattern::new(),
        }
    }
}

impl SocketPattern for SubPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        locally_initiated: bool,
    ) {
        self.inner.xattach_pipe(pipes, opts, pipe, locally_initiated);
    }

    fn xsend(
        &mut self,
        _pipes: &mut PipeMap,
        _opts: &Options,
        _msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        Err(PatternError::Unsupported)
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, opts: &Options) -> Result<Msg> {
        self.inner.xrecv(pipes, opts)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.inner.xhas_in(pipes)
    }

    fn xhas_out(&mut self, _pipes: &mut PipeMap) -> bool {
        false
    }

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.inner.xread_activated(pipes, opts, pipe);
    }

    fn xhiccuped(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.inner.xhiccuped(pipes, opts, pipe);
    }

    fn xpipe_terminated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.inner.xpipe_terminated(pipes, pipe);
    }

    fn xsetsockopt(&mut self, pipes: &mut PipeMap, opt: &SocketOption) -> Option<Result<()>> {
        match opt {
            SocketOption::Subscribe(prefix) => {
                self.inner
                    .apply(pipes, SubscriptionEvent::Subscribe(prefix.clone()));
                Some(Ok(()))
            }
            SocketOption::Unsubscribe(prefix) => {
                self.inner
                    .apply(pipes, SubscriptionEvent::Unsubscribe(prefix.clone()));
                Some(Ok(()))
            }
            _ => None,
        }
    }
}
