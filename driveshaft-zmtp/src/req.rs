//! REQ socket pattern.
//!
//! DEALER with the synchronous request-reply contract enforced: sends
//! and receives must strictly alternate, and every request gains an
//! empty envelope delimiter frame so REP/ROUTER peers can track the
//! return path. Replies without the delimiter are malformed and
//! silently discarded.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::dealer::DealerPattern;

pub(crate) struct ReqPattern {
    dealer: DealerPattern,
    /// A request is out; only recv may proceed.
    awaiting_reply: bool,
    /// The next outbound frame starts a new request.
    request_begins: bool,
    /// The next inbound frame should be the envelope delimiter.
    reply_begins: bool,
}

impl ReqPattern {
    pub fn new() -> Self {
        Self {
            dealer: DealerPattern::new(),
            awaiting_reply: false,
            request_begins: true,
            reply_begins: true,
        }
    }
}

impl SocketPattern for ReqPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        locally_initiated: bool,
    ) {
        self.dealer.xattach_pipe(pipes, opts, pipe, locally_initiated);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        if self.awaiting_reply {
            return Err(PatternError::BadState(
                "REQ must receive the reply before sending again",
            ));
        }

        if self.request_begins {
            let mut delimiter = Msg::new();
            delimiter.set_more(true);
            match self.dealer.xsend(pipes, opts, delimiter) {
                Ok(()) => self.request_begins = false,
                Err(PatternError::Full(_)) => return Err(PatternError::Full(msg)),
                Err(other) => return Err(other),
            }
        }

        let last = !msg.has_more();
        self.dealer.xsend(pipes, opts, msg)?;
        if last {
            self.awaiting_reply = true;
            self.request_begins = true;
        }
        Ok(())
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, opts: &Options) -> Result<Msg> {
        if !self.awaiting_reply {
            return Err(DriveshaftError::InvalidState(
                "REQ has no request in flight to receive a reply for",
            ));
        }

        if self.reply_begins {
            loop {
                let head = self.dealer.xrecv(pipes, opts)?;
                if head.is_empty() && head.has_more() {
                    self.reply_begins = false;
                    break;
                }
                // Malformed reply: discard it whole. Its remaining
                // frames are guaranteed present by the atomic flush.
                tracing::debug!("discarding reply without envelope delimiter");
                let mut more = head.has_more();
                while more {
                    let frame = self.dealer.xrecv(pipes, opts)?;
                    more = frame.has_more();
                }
            }
        }

        let msg = self.dealer.xrecv(pipes, opts)?;
        if !msg.has_more() {
            self.awaiting_reply = false;
            self.reply_begins = true;
        }
        Ok(msg)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.awaiting_reply && self.dealer.xhas_in(pipes)
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        !self.awaiting_reply && self.dealer.xhas_out(pipes)
    }

    fn xread_activated(&mut self, pipes: &mut PipeMap, opts: &Options, pipe: ObjectId) {
        self.dealer.xread_activated(pipes, opts, pipe);
    }

    fn xwrite_activated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.dealer.xwrite_activated(pipes, pipe);
    }

    fn xpipe_terminated(&mut self, pipes: &mut PipeMap, pipe: ObjectId) {
        self.dealer.xpipe_terminated(pipes, pipe);
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
