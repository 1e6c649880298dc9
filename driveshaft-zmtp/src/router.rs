//! ROUTER socket pattern.
//!
//! Identity-addressed peer routing. Every inbound message gains a
//! routing-id frame in front, taken from the producing pipe's
//! identity; every outbound message must lead with a routing-id frame
//! that selects the destination pipe. Peers that announce no identity
//! get a generated one (a zero byte followed by a counter, a space no
//! application identity may use).
//!
//! Messages to unknown or congested peers are dropped unless mandatory
//! mode asks for errors instead.

use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::HashMap;

use driveshaft_core::command::ObjectId;
use driveshaft_core::error::Result;
use driveshaft_core::msg::Msg;
use driveshaft_core::options::{Options, SocketOption};

use crate::base::{PatternError, PipeMap, SocketPattern};
use crate::fq::FairQueue;

pub(crate) struct RouterPattern {
    fq: FairQueue,
    out_pipes: HashMap<Bytes, ObjectId>,
    identities: HashMap<ObjectId, Bytes>,
    /// Frames queued ahead of the application (the data frame behind a
    /// synthesised identity frame).
    prefetched: VecDeque<Msg>,
    /// Mid-message on the inbound side.
    in_more: bool,
    /// Outbound routing state.
    current_out: Option<ObjectId>,
    out_more: bool,
    drop_current: bool,
    next_peer_id: u32,
}

impl RouterPattern {
    pub fn new() -> Self {
        Self {
            fq: FairQueue::new(),
            out_pipes: HashMap::new(),
            identities: HashMap::new(),
            prefetched: VecDeque::new(),
            in_more: false,
            current_out: None,
            out_more: false,
            drop_current: false,
            next_peer_id: 0,
        }
    }

    fn generate_identity(&mut self) -> Bytes {
        // Leading zero byte marks generated ids; applications cannot
        // collide with them.
        let mut id = Vec::with_capacity(5);
        id.push(0u8);
        id.extend_from_slice(&self.next_peer_id.to_be_bytes());
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        Bytes::from(id)
    }
}

impl SocketPattern for RouterPattern {
    fn xattach_pipe(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        pipe: ObjectId,
        _locally_initiated: bool,
    ) {
        let announced = pipes.get(&pipe).and_then(|p| p.identity().cloned());
        let identity = announced.unwrap_or_else(|| self.generate_identity());

        if let Some(&old) = self.out_pipes.get(&identity) {
            if opts.router_handover {
                // The newcomer takes over the name; the old connection
                // winds down.
                if let Some(old_pipe) = pipes.get_mut(&old) {
                    old_pipe.terminate(false);
                }
                self.identities.remove(&old);
            } else {
                // First owner keeps the name; refuse the newcomer.
                if let Some(new_pipe) = pipes.get_mut(&pipe) {
                    new_pipe.terminate(false);
                }
                return;
            }
        }

        self.out_pipes.insert(identity.clone(), pipe);
        self.identities.insert(pipe, identity);
        self.fq.attach(pipe);

        if opts.probe_router {
            if let Some(p) = pipes.get_mut(&pipe) {
                if p.write(Msg::new()).is_ok() {
                    p.flush();
                }
            }
        }
    }

    fn xsend(
        &mut self,
        pipes: &mut PipeMap,
        opts: &Options,
        msg: Msg,
    ) -> std::result::Result<(), PatternError> {
        if !self.out_more {
            // First frame is the routing id; it selects and is
            // consumed.
            if !msg.has_more() {
                // An addressless message routes nowhere.
                return if opts.router_mandatory {
                    Err(PatternError::NoRoute)
                } else {
                    Ok(())
                };
            }

            match self.out_pipes.get(msg.data()).copied() {
                Some(pipe_id) => {
                    let writable = pipes
                        .get_mut(&pipe_id)
                        .is_some_and(|p| p.check_write());
                    if writable {
                        self.current_out = Some(pipe_id);
                        self.drop_current = false;
                    } else if opts.router_mandatory {
                        return Err(PatternError::Full(msg));
                    } else {
                        self.drop_current = true;
                    }
                }
                None => {
                    if opts.router_mandatory {
                        return Err(PatternError::NoRoute);
                    }
                    self.drop_current = true;
                }
            }
            self.out_more = true;
            return Ok(());
        }

        // Payload frames follow the selection made above.
        let last = !msg.has_more();
        if !self.drop_current {
            if let Some(pipe_id) = self.current_out {
                if let Some(pipe) = pipes.get_mut(&pipe_id) {
                    if pipe.write(msg).is_ok() && last {
                        pipe.flush();
                    }
                }
            }
        }
        if last {
            self.current_out = None;
            self.out_more = false;
            self.drop_current = false;
        }
        Ok(())
    }

    fn xrecv(&mut self, pipes: &mut PipeMap, _opts: &Options) -> Result<Msg> {
        if let Some(msg) = self.prefetched.pop_front() {
            self.in_more = msg.has_more();
            return Ok(msg);
        }

        let (pipe, msg) = self.fq.recv(pipes)?;
        if self.in_more {
            // Continuation frame of the current message.
            self.in_more = msg.has_more();
            return Ok(msg);
        }

        // New message: synthesise the routing-id frame in front.
        let identity = self
            .identities
            .get(&pipe)
            .cloned()
            .unwrap_or_else(Bytes::new);
        let mut id_frame = Msg::from_bytes(identity);
        id_frame.set_more(true);
        self.prefetched.push_back(msg);
        // in_more stays false until the data frame is handed out.
        Ok(id_frame)
    }

    fn xhas_in(&mut self, pipes: &mut PipeMap) -> bool {
        !self.prefetched.is_empty() || self.fq.has_in(pipes)
    }

    fn xhas_out(&mut self, _pipes: &mut PipeMap) -> bool {
        // Whether a send succeeds depends on the address in its first
        // frame; report writable and resolve per message.
        true
    }

    fn xread_activated(&mut self, _pipes: &mut PipeMap, _opts: &Options, pipe: ObjectId) {
        self.fq.activated(pipe);
    }

    fn xpipe_terminated(&mut self, _pipes: &mut PipeMap, pipe: ObjectId) {
        self.fq.terminated(pipe);
        if let Some(identity) = self.identities.remove(&pipe) {
            self.out_pipes.remove(&identity);
        }
        if self.current_out == Some(pipe) {
            // Mid-message destination died: swallow the rest.
            self.current_out = None;
            self.drop_current = true;
        }
    }

    fn xsetsockopt(&mut self, _pipes: &mut PipeMap, _opt: &SocketOption) -> Option<Result<()>> {
        None
    }
}
