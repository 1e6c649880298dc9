//! The reaper thread.
//!
//! A closed socket's handle is gone, but its termination protocol may
//! still be mid-flight: sessions draining under linger, pipes waiting
//! for acks. Closing hands the socket body to the reaper inside a
//! `Reap` command; the reaper polls the socket's mailbox descriptor
//! and keeps processing its commands until the socket reports itself
//! fully dead, then releases its slot. When the context is
//! terminating and the last socket is gone, the reaper answers the
//! blocked `Context::term` with `Done`.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::command::{Command, CommandKind, ObjectId};
use crate::context::Ctx;
use crate::mailbox::Mailbox;
use crate::reactor::{Handle, Reactor, Ready};

/// A closed socket, as the reaper sees it.
pub trait Reapable: Send {
    /// Slot/object id of the socket.
    fn object_id(&self) -> ObjectId;

    /// The socket mailbox's pollable descriptor.
    fn mailbox_fd(&self) -> RawFd;

    /// Kick off the socket's termination protocol.
    fn start_reaping(&mut self);

    /// Drain and process pending commands. Returns true once the
    /// socket is fully terminated (the implementation sends `Reaped`
    /// to the reaper as part of its last breath).
    fn process_pending(&mut self) -> bool;
}

pub(crate) struct Reaper {
    ctx: Arc<Ctx>,
    self_id: ObjectId,
    mailbox: Mailbox,
    reactor: Reactor,
    sockets: HashMap<ObjectId, (Box<dyn Reapable>, Handle)>,
    done: bool,
}

impl Reaper {
    pub fn new(ctx: Arc<Ctx>, self_id: ObjectId, mailbox: Mailbox) -> io::Result<Self> {
        Ok(Self {
            ctx,
            self_id,
            mailbox,
            reactor: Reactor::new(Arc::new(AtomicUsize::new(0)))?,
            sockets: HashMap::new(),
            done: false,
        })
    }

    pub fn run(mut self) {
        let handle = match self.reactor.add_fd(self.mailbox.fd(), self.self_id) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "reaper cannot register mailbox");
                return;
            }
        };
        self.reactor.set_pollin(handle);

        let mut ready: Vec<Ready> = Vec::new();
        while !self.done {
            if let Err(e) = self.reactor.wait(None, &mut ready) {
                tracing::error!(error = %e, "reaper wait failed");
                continue;
            }
            let batch: Vec<Ready> = ready.drain(..).collect();
            for ev in batch {
                let Some(owner) = self.reactor.owner_of(ev.key) else {
                    continue;
                };
                if owner == self.self_id {
                    self.drain_mailbox();
                } else {
                    self.pump_socket(owner);
                }
            }
            self.reactor.purge_retired();
        }
        tracing::debug!("reaper exits");
    }

    fn drain_mailbox(&mut self) {
        while let Some(cmd) = self.mailbox.try_recv() {
            self.process_command(cmd);
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd.kind {
            CommandKind::Reap { socket } => self.adopt(socket),
            CommandKind::Reaped => {}
            CommandKind::Stop => {
                // Only sent once the socket table is empty; any socket
                // still in flight re-arms the stop via deregister.
                if self.sockets.is_empty() {
                    self.ctx
                        .send_command(self.ctx.term_route(), CommandKind::Done);
                    self.done = true;
                }
            }
            other => tracing::warn!(kind = ?other, "unexpected reaper command"),
        }
    }

    fn adopt(&mut self, mut socket: Box<dyn Reapable>) {
        let id = socket.object_id();
        socket.start_reaping();
        if socket.process_pending() {
            self.finish(id, None);
            return;
        }
        match self.reactor.add_fd(socket.mailbox_fd(), id) {
            Ok(h) => {
                self.reactor.set_pollin(h);
                self.sockets.insert(id, (socket, h));
            }
            Err(e) => {
                // Cannot watch it; spin it down on the spot.
                tracing::error!(socket = id, error = %e, "reaper cannot poll socket");
                while !socket.process_pending() {
                    std::thread::yield_now();
                }
                self.finish(id, None);
            }
        }
    }

    fn pump_socket(&mut self, id: ObjectId) {
        let Some((socket, _)) = self.sockets.get_mut(&id) else {
            return;
        };
        if socket.process_pending() {
            let (_, handle) = self.sockets.remove(&id).unwrap();
            self.finish(id, Some(handle));
        }
    }

    fn finish(&mut self, id: ObjectId, handle: Option<Handle>) {
        if let Some(h) = handle {
            self.reactor.rm_fd(h);
        }
        tracing::debug!(socket = id, "socket reaped");
        self.ctx.deregister_socket(id);
    }
}
