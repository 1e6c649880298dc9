//! PAIR socket pattern.
//!
//! An exclusive link between exactly two endpoints: one pipe, no
//! routing, no fan-out. A second connection attempt is refused by
//! terminating its pipe on arrival.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};

pub(crate) struct PairPattern {
    pipe: Option<ObjectId>,
}

impl PairPattern {
    pub fn new() -> Self {
        Self { pipe: None }
    }
}

impl SocketPattern for PairPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        if self.pipe.is_some() {
            // Already paired: refuse the newcomer.
            if let Some(extra) = pipes.get_mut(&pipe) {
                extra.terminate(false);
            }
            return;
        }
        self.pipe = Some(pipe);
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        _opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        let Some(id) = self.pipe else {
            return Err(PatternError::Full(msg));
        };
        let Some(pipe) = pipes.get_mut(&id) else {
            return Err(PatternError::Full(msg));
        };
        let more = msg.has_more();
        match pipe.write(msg) {
            Ok(()) => {
                if !more {
                    pipe.flush();
                }
                Ok(())
            }
            Err(msg) => Err(PatternError::Full(msg)),
        }
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        self.pipe
            .and_then(|id| pipes.get_mut(&id))
            .and_then(|p| p.read())
            .ok_or(DriveshaftError::WouldBlock)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(&id))
            .is_some_and(|p| p.check_read())
    }

    fn xhas_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(&id))
            .is_some_and(|p| p.check_write())
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, _pipe: ObjectId) {}

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        if self.pipe == Some(pipe) {
            self.pipe = None;
        }
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
