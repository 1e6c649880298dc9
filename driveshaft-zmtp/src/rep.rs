//! REP socket pattern.
//!
//! ROUTER with the envelope handled automatically: on receive, the
//! routing-id frames and the empty delimiter are peeled off and
//! stored; on send, the stored envelope is replayed in front of the
//! reply so it travels back to the requester. Receives and sends must
//! strictly alternate.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::router::RouterPattern;

pub(crate) struct RepPattern {
    router: RouterPattern,
    /// A request is in; only send may proceed.
    sending_reply: bool,
    /// The next inbound frame starts a new request (envelope first).
    request_begins: bool,
    /// Envelope of the request being serviced, delimiter included.
    envelope: Vec<Msg>,
}

impl RepPattern {
    pub fn new() -> Self {
        Self {
            router: RouterPattern::new(),
            sending_reply: false,
            request_begins: true,
            envelope: Vec::new(),
        }
    }
}

impl SocketPattern for RepPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        locally_initiated: bool,
    ) {
        self.router.xattach_pipe(pipes, opts, pipe, locally_initiated);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        if !self.sending_reply {
            return Err(PatternError::BadState(
                "REP has no pending request to reply to",
            ));
        }

        if !self.envelope.is_empty() {
            // The routing frame selects the destination; only it can
            // report congestion, so probe it before committing.
            let head = self.envelope[0].clone();
            match self.router.xsend(pipes, opts, head) {
                Ok(()) => {}
                Err(PatternError::Full(_)) => return Err(PatternError::Full(msg)),
                Err(other) => return Err(other),
            }
            for frame in self.envelope.drain(..).skip(1) {
                // Mid-message frames cannot fail; capacity was
                // reserved by the routing frame.
                let _ = self.router.xsend(pipes, opts, frame);
            }
        }

        let last = !msg.has_more();
        self.router.xsend(pipes, opts, msg)?;
        if last {
            self.sending_reply = false;
        }
        Ok(())
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, opts: &Options) -> Result<Msg> {
        if self.sending_reply {
            return Err(DriveshaftError::InvalidState(
                "REP must reply before receiving the next request",
            ));
        }

        if self.request_begins {
            // Collect identity frames up to and including the empty
            // delimiter. Everything is present once the first frame
            // arrived; only that first read can block.
            loop {
                let frame = self.router.xrecv(pipes, opts)?;
                let is_delimiter = frame.is_empty() && frame.has_more();
                self.envelope.push(frame);
                if is_delimiter {
                    break;
                }
            }
            self.request_begins = false;
        }

        let msg = self.router.xrecv(pipes, opts)?;
        if !msg.has_more() {
            self.sending_reply = true;
            self.request_begins = true;
        }
        Ok(msg)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        !self.sending_reply && self.router.xhas_in(pipes)
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.sending_reply && self.router.xhas_out(pipes)
    }

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.router.xread_activated(pipes, opts, pipe);
    }

    fn xwrite_activated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.router.xwrite_activated(pipes, pipe);
    }

    fn xpipe_terminated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.router.xpipe_terminated(pipes, pipe);
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
