//! I/O worker thread.
//!
//! Owns one reactor, one mailbox and the table of objects living on
//! this thread. The thread's own mailbox descriptor is registered with
//! the reactor, so commands and descriptor readiness flow through one
//! blocking point. Handlers run strictly sequentially and must never
//! block.

use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::command::{Command, CommandKind, ObjectId};
use crate::context::Ctx;
use crate::mailbox::Mailbox;
use crate::object::{Disposition, IoObject};
use crate::reactor::{Handle, Reactor, Ready};

/// Everything an object may touch while handling an event on its
/// owning thread.
pub struct IoCtx<'a> {
    pub ctx: &'a Arc<Ctx>,
    pub reactor: &'a mut Reactor,
    /// Index of the owning I/O thread.
    pub tid: u32,
}

pub(crate) struct IoThread {
    tid: u32,
    ctx: Arc<Ctx>,
    mailbox: Mailbox,
    reactor: Reactor,
    objects: HashMap<ObjectId, Box<dyn IoObject>>,
    self_id: ObjectId,
    mailbox_handle: Option<Handle>,
}

impl IoThread {
    pub fn new(
        ctx: Arc<Ctx>,
        tid: u32,
        self_id: ObjectId,
        mailbox: Mailbox,
        load: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        Ok(Self {
            tid,
            ctx,
            mailbox,
            reactor: Reactor::new(load)?,
            objects: HashMap::new(),
            self_id,
            mailbox_handle: None,
        })
    }

    pub fn run(mut self) {
        let handle = match self.reactor.add_fd(self.mailbox.fd(), self.self_id) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(tid = self.tid, error = %e, "cannot register mailbox");
                return;
            }
        };
        self.reactor.set_pollin(handle);
        self.mailbox_handle = Some(handle);

        let mut ready: Vec<Ready> = Vec::new();
        loop {
            let (due, next_timer) = self.reactor.execute_timers();
            for (owner, id) in due {
                self.dispatch(owner, |obj, io| obj.timer_event(io, id));
            }

            // The mailbox registration counts toward the load, so the
            // loop only exits after a stop command retired it and every
            // object has wound down.
            if self.reactor.load() == 0 && !self.reactor.has_timers() {
                break;
            }

            if let Err(e) = self.reactor.wait(next_timer, &mut ready) {
                tracing::error!(tid = self.tid, error = %e, "reactor wait failed");
                continue;
            }

            let batch: Vec<Ready> = ready.drain(..).collect();
            for ev in batch {
                // An earlier handler in this batch may have retired the
                // descriptor: re-check liveness before every delivery.
                if ev.error {
                    if let Some(owner) = self.reactor.owner_of(ev.key) {
                        self.deliver_in(owner);
                    }
                }
                if ev.writable {
                    if let Some(owner) = self.reactor.owner_of(ev.key) {
                        self.deliver_out(owner);
                    }
                }
                if ev.readable {
                    if let Some(owner) = self.reactor.owner_of(ev.key) {
                        self.deliver_in(owner);
                    }
                }
            }
            self.reactor.purge_retired();
        }
        tracing::debug!(tid = self.tid, "io thread exits");
    }

    fn deliver_in(&mut self, owner: ObjectId) {
        if owner == self.self_id {
            self.drain_mailbox();
        } else {
            self.dispatch(owner, |obj, io| obj.in_event(io));
        }
    }

    fn deliver_out(&mut self, owner: ObjectId) {
        if owner == self.self_id {
            return;
        }
        self.dispatch(owner, |obj, io| obj.out_event(io));
    }

    fn drain_mailbox(&mut self) {
        while let Some(cmd) = self.mailbox.try_recv() {
            self.process_command(cmd);
        }
    }

    fn process_command(&mut self, cmd: Command) {
        let dest = cmd.dest.object();

        if dest == self.self_id {
            match cmd.kind {
                CommandKind::Stop => {
                    if let Some(h) = self.mailbox_handle.take() {
                        self.reactor.rm_fd(h);
                    }
                }
                other => {
                    tracing::warn!(tid = self.tid, kind = ?other, "unexpected thread command");
                }
            }
            return;
        }

        match cmd.kind {
            CommandKind::Plug(object) => {
                self.objects.insert(dest, object);
                self.dispatch(dest, |obj, io| obj.plug(io));
            }
            kind => self.dispatch(dest, |obj, io| obj.process_command(io, kind)),
        }
    }

    fn dispatch<F>(&mut self, owner: ObjectId, f: F)
    where
        F: FnOnce(&mut Box<dyn IoObject>, &mut IoCtx<'_>) -> Disposition,
    {
        let Some(object) = self.objects.get_mut(&owner) else {
            // The destination died between send and delivery; the
            // termination protocol makes this rare but possible for
            // late flow-control signals.
            tracing::debug!(tid = self.tid, owner, "event for absent object");
            return;
        };
        let mut io = IoCtx {
            ctx: &self.ctx,
            reactor: &mut self.reactor,
            tid: self.tid,
        };
        if f(object, &mut io) == Disposition::Destroyed {
            self.objects.remove(&owner);
        }
    }
}
