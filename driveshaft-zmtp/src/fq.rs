//! Fair queueing of inbound pipes.
//!
//! Round-robin reader shared by every pattern with more than one
//! inbound pipe. Pipes sit in a vector partitioned into an active
//! prefix and an inactive tail; a pipe that runs dry is swapped out of
//! the active region and swapped back in when its `ActivateRead`
//! arrives. Mid-message the cursor is pinned so multi-frame messages
//! never interleave.

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::{DriveshaftError, Result};
use driveshaft_core::msg::Msg;

use crate::base::PipeMap;

#[derive(Default)]
pub(crate) struct FairQueue {
    pipes: Vec<ObjectId>,
    /// Pipes in `[0, active)` are believed readable.
    active: usize,
    current: usize,
    /// Mid-message: keep reading from `current`.
    more: bool,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, pipe: ObjectId) {
        self.pipes.push(pipe);
        let last = self.pipes.len() - 1;
        self.pipes.swap(last, self.active);
        self.active += 1;
    }

    pub fn activated(&mut self, pipe: ObjectId) {
        if let Some(pos) = self.pipes.iter().position(|p| *p == pipe) {
            if pos >= self.active {
                self.pipes.swap(pos, self.active);
                self.active += 1;
            }
        }
    }

    pub fn terminated(&mut self, pipe: ObjectId) {
        let Some(pos) = self.pipes.iter().position(|p| *p == pipe) else {
            return;
        };
        if pos < self.active {
            self.active -= 1;
            self.pipes.swap(pos, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        let idx = self
            .pipes
            .iter()
            .position(|p| *p == pipe)
            .expect("pipe still listed");
        self.pipes.swap_remove(idx);
        if self.active > self.pipes.len() {
            self.active = self.pipes.len();
        }
        if self.current >= self.active.max(1) {
            self.current = 0;
        }
    }

    fn deactivate_current(&mut self) {
        self.active -= 1;
        self.pipes.swap(self.current, self.active);
        if self.current == self.active {
            self.current = 0;
        }
    }

    /// Receive the next frame, fairly across pipes. Returns the
    /// producing pipe alongside the frame.
    pub fn recv(&mut self, pipes: &mut PipeMap) -> Result<(ObjectId, Msg)> {
        while self.active > 0 {
            let id = self.pipes[self.current];
            let Some(pipe) = pipes.get_mut(&id) else {
                self.deactivate_current();
                continue;
            };
            match pipe.read() {
                Some(msg) => {
                    self.more = msg.has_more();
                    if !self.more {
                        self.current = (self.current + 1) % self.active;
                    }
                    return Ok((id, msg));
                }
                None => {
                    // A message is flushed whole; the pipe cannot run
                    // dry between frames of one message.
                    debug_assert!(!self.more, "pipe drained mid-message");
                    self.deactivate_current();
                }
            }
        }
        Err(DriveshaftError::WouldBlock)
    }

    /// Would `recv` yield something right now?
    pub fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        if self.more {
            return true;
        }
        while self.active > 0 {
            let id = self.pipes[self.current];
            match pipes.get_mut(&id) {
                Some(pipe) => {
                    if pipe.check_read() {
                        return true;
                    }
                    self.deactivate_current();
                }
                None => self.deactivate_current(),
            }
        }
        false
    }
}
