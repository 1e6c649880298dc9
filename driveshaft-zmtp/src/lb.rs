//! Load balancing of outbound pipes.
//!
//! Round-robin writer, the mirror image of the fair queue: the cursor
//! advances per message, sticks to one pipe for all frames of a
//! multi-frame message, and pipes that hit their high-water mark drop
//! out of the active region until their `ActivateWrite` credit
//! arrives. If the pinned pipe dies mid-message the remaining frames
//! of that message are swallowed.

use driveshaft_core::command::ObjectId;
use driveshaft_core::msg::Msg;

use crate::base::PipeMap;

#[derive(Default)]
pub(crate) struct LoadBalancer {
    pipes: Vec<ObjectId>,
    active: usize,
    current: usize,
    /// Mid-message: stay on `current`.
    more: bool,
    /// The pinned pipe died mid-message; discard the rest.
    dropping: bool,
}

impl LoadBalancer {
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
        if self.more && pos < self.active && pos == self.current {
            self.dropping = true;
        }
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

    /// Send one frame through the current pipe, advancing at message
    /// boundaries. Returns the frame when every pipe is full.
    pub fn send(&mut self, pipes: &mut PipeMap, msg: Msg) -> Result<(), Msg> {
        if self.dropping {
            self.more = msg.has_more();
            if !self.more {
                self.dropping = false;
            }
            return Ok(());
        }

        let more = msg.has_more();
        let mut msg = msg;
        loop {
            if self.active == 0 {
                return Err(msg);
            }
            let id = self.pipes[self.current];
            let Some(pipe) = pipes.get_mut(&id) else {
                self.deactivate_current();
                continue;
            };
            match pipe.write(msg) {
                Ok(()) => {
                    if !more {
                        pipe.flush();
                        self.current = (self.current + 1) % self.active;
                    }
                    self.more = more;
                    return Ok(());
                }
                Err(returned) => {
                    // Backpressure can only strike at a message start;
                    // mid-message capacity was reserved by the first
                    // frame's check.
                    debug_assert!(!self.more, "pipe refused a frame mid-message");
                    msg = returned;
                    self.deactivate_current();
                }
            }
        }
    }

    /// Is any pipe writable right now?
    pub fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        if self.more {
            return true;
        }
        while self.active > 0 {
            let id = self.pipes[self.current];
            match pipes.get_mut(&id) {
                Some(pipe) => {
                    if pipe.check_write() {
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
