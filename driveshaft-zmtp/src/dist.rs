//! Publish-side fan-out.
//!
//! Delivers each message to every matching pipe. Publishing is lossy
//! by design: a pipe at its high-water mark when a message starts is
//! excluded from that whole message (never given a partial one) and
//! simply misses it. Matching is decided at the first frame and pinned
//! for the message's remaining frames.

use driveshaft_core::command::ObjectId;
use driveshaft_core::msg::Msg;

use crate::base::PipeMap;

#[derive(Default)]
pub(crate) struct Distributor {
    /// Pipes taking the remaining frames of the in-flight message.
    targets: Vec<ObjectId>,
    more: bool,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn mid_message(&self) -> bool {
        self.more
    }

    /// Send one frame to `matching` (first frame) or to the pinned
    /// target set (subsequent frames).
    pub fn send(&mut self, pipes: &mut PipeMap, msg: &Msg, matching: Option<Vec<ObjectId>>) {
        if !self.more {
            self.targets = matching.unwrap_or_default();
        }
        let more = msg.has_more();

        self.targets.retain(|id| {
            let Some(pipe) = pipes.get_mut(id) else {
                return false;
            };
            match pipe.write(msg.clone()) {
                Ok(()) => {
                    if !more {
                        pipe.flush();
                    }
                    true
                }
                // Full: this subscriber misses the message.
                Err(_) => false,
            }
        });

        self.more = more;
        if !more {
            self.targets.clear();
        }
    }

    /// A terminated pipe must stop receiving the in-flight message.
    pub fn terminated(&mut self, pipe: ObjectId) {
        self.targets.retain(|p| *p != pipe);
    }
}
