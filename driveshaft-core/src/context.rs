//! The context: process-scoped runtime state.
//!
//! A [`Context`] owns the I/O worker threads, the reaper thread, the
//! socket slot table, and the inproc endpoint registry. It is created
//! explicitly and passed to every socket constructor; there are no
//! process-wide singletons. The cheap, shareable part lives in [`Ctx`]
//! behind an `Arc`; the thread handles stay with the `Context` value so
//! termination can join them.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::command::{Command, CommandKind, MailboxId, ObjectId, Route};
use crate::error::{DriveshaftError, Result};
use crate::io_thread::IoThread;
use crate::mailbox::{mailbox, Mailbox, MailboxSender};
use crate::pipe::PipeEnd;
use crate::reaper::Reaper;

struct IoHandle {
    sender: MailboxSender,
    route: Route,
    load: Arc<std::sync::atomic::AtomicUsize>,
}

struct SocketSlot {
    sender: MailboxSender,
    route: Route,
    closed: bool,
}

/// A socket bound to an inproc name.
#[derive(Clone)]
pub struct InprocBinding {
    pub route: Route,
    pub sndhwm: u32,
    pub rcvhwm: u32,
}

/// A connect that arrived before its inproc name was bound.
pub struct PendingConnection {
    pub connector: Route,
    pub connector_pipe: ObjectId,
    pub bind_pipe: PipeEnd,
}

#[derive(Default)]
struct InprocTable {
    bound: HashMap<String, InprocBinding>,
    pending: HashMap<String, Vec<PendingConnection>>,
}

/// Shared context state: command routing, socket slots, inproc names.
pub struct Ctx {
    io: Vec<IoHandle>,
    reaper_sender: MailboxSender,
    reaper_route: Route,
    term_sender: MailboxSender,
    term_route: Route,
    sockets: Mutex<HashMap<ObjectId, SocketSlot>>,
    inproc: Mutex<InprocTable>,
    next_object_id: AtomicU32,
    terminating: AtomicBool,
}

impl Ctx {
    /// Allocate a context-unique object id.
    pub fn alloc_object_id(&self) -> ObjectId {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a route served by the given mailbox.
    pub fn alloc_route(&self, mailbox: MailboxId) -> Route {
        Route::new(mailbox, self.alloc_object_id())
    }

    /// Post a command toward a route, accounting it against the
    /// destination's sequence number.
    pub fn send_command(&self, dest: &Route, kind: CommandKind) {
        dest.bump_sent();
        let cmd = Command {
            dest: dest.clone(),
            kind,
        };
        match dest.mailbox() {
            MailboxId::IoThread(tid) => self.io[tid as usize].sender.send(cmd),
            MailboxId::Socket(id) => {
                let sockets = self.sockets.lock();
                match sockets.get(&id) {
                    Some(slot) => slot.sender.send(cmd),
                    None => {
                        tracing::debug!(socket = id, kind = ?cmd.kind, "command for dead socket")
                    }
                }
            }
            MailboxId::Reaper => self.reaper_sender.send(cmd),
            MailboxId::Term => self.term_sender.send(cmd),
        }
    }

    /// Number of I/O worker threads.
    #[must_use]
    pub fn io_thread_count(&self) -> usize {
        self.io.len()
    }

    /// Pick the least loaded I/O thread for a new object.
    #[must_use]
    pub fn choose_io_thread(&self) -> u32 {
        let mut best = 0usize;
        let mut best_load = usize::MAX;
        for (tid, handle) in self.io.iter().enumerate() {
            let load = handle.load.load(Ordering::Relaxed);
            if load < best_load {
                best = tid;
                best_load = load;
            }
        }
        best as u32
    }

    /// The reaper's route, the destination of `Reap` commands.
    #[must_use]
    pub fn reaper_route(&self) -> &Route {
        &self.reaper_route
    }

    pub(crate) fn term_route(&self) -> &Route {
        &self.term_route
    }

    /// True once shutdown started; socket operations must fail with
    /// [`DriveshaftError::Terminated`].
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Create a mailbox slot for a new socket. The returned route's
    /// mailbox id doubles as the socket's slot key.
    pub fn register_socket(&self) -> Result<(Route, Mailbox)> {
        if self.is_terminating() {
            return Err(DriveshaftError::Terminated);
        }
        let id = self.alloc_object_id();
        let (sender, mb) = mailbox()?;
        let route = Route::new(MailboxId::Socket(id), id);
        self.sockets.lock().insert(
            id,
            SocketSlot {
                sender,
                route: route.clone(),
                closed: false,
            },
        );
        Ok((route, mb))
    }

    /// Mark a socket as closed (its handle is gone; the reaper owns it
    /// now). The slot stays routable until the socket finishes dying.
    pub fn socket_closed(&self, id: ObjectId) {
        if let Some(slot) = self.sockets.lock().get_mut(&id) {
            slot.closed = true;
        }
    }

    /// Drop a dead socket's slot. Called by the reaper once the socket
    /// is fully terminated.
    pub fn deregister_socket(&self, id: ObjectId) {
        let empty = {
            let mut sockets = self.sockets.lock();
            sockets.remove(&id);
            sockets.is_empty()
        };
        if empty && self.is_terminating() {
            self.send_command(&self.reaper_route, CommandKind::Stop);
        }
    }

    #[must_use]
    pub fn open_sockets(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Begin shutdown: every open socket gets a stop command so
    /// blocked calls unwind with `Terminated`.
    pub fn start_shutdown(&self) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        let routes: Vec<Route> = {
            let sockets = self.sockets.lock();
            sockets
                .values()
                .filter(|slot| !slot.closed)
                .map(|slot| slot.route.clone())
                .collect()
        };
        for route in routes {
            self.send_command(&route, CommandKind::Stop);
        }
        if self.open_sockets() == 0 {
            self.send_command(&self.reaper_route, CommandKind::Stop);
        }
    }

    // ------------------------------------------------------- inproc

    /// Bind an inproc name, taking over any connections that arrived
    /// ahead of the bind.
    pub fn register_inproc(
        &self,
        name: &str,
        binding: InprocBinding,
    ) -> Result<Vec<PendingConnection>> {
        let mut table = self.inproc.lock();
        if table.bound.contains_key(name) {
            return Err(DriveshaftError::AddrInUse(format!("inproc://{name}")));
        }
        table.bound.insert(name.to_string(), binding);
        Ok(table.pending.remove(name).unwrap_or_default())
    }

    /// Look up a bound inproc name.
    #[must_use]
    pub fn find_inproc(&self, name: &str) -> Option<InprocBinding> {
        self.inproc.lock().bound.get(name).cloned()
    }

    /// Park a connection until the name is bound.
    pub fn pend_inproc(&self, name: &str, pending: PendingConnection) {
        self.inproc
            .lock()
            .pending
            .entry(name.to_string())
            .or_default()
            .push(pending);
    }

    /// Drop every inproc registration owned by a dying socket: its
    /// bound names and its not-yet-matched pending connects.
    pub fn unregister_inproc(&self, socket: ObjectId) {
        let mut table = self.inproc.lock();
        table.bound.retain(|_, b| b.route.object() != socket);
        for pendings in table.pending.values_mut() {
            pendings.retain(|p| p.connector.object() != socket);
        }
        table.pending.retain(|_, v| !v.is_empty());
    }
}

/// Owning handle for a runtime instance.
///
/// Dropping the context terminates it, which blocks until every socket
/// created on it has been closed — drop (or `close`) sockets first.
pub struct Context {
    shared: Arc<Ctx>,
    io_joins: Vec<thread::JoinHandle<()>>,
    reaper_join: Option<thread::JoinHandle<()>>,
    term_mailbox: Option<Mailbox>,
    terminated: bool,
}

impl Context {
    /// Create a context with one I/O thread.
    pub fn new() -> io::Result<Self> {
        Self::with_io_threads(1)
    }

    /// Create a context with one I/O thread per CPU.
    pub fn multi_threaded() -> io::Result<Self> {
        Self::with_io_threads(num_cpus::get())
    }

    /// Create a context with a fixed number of I/O threads (at least
    /// one).
    pub fn with_io_threads(count: usize) -> io::Result<Self> {
        let count = count.max(1);
        let next_id = AtomicU32::new(1);

        let mut io_handles = Vec::with_capacity(count);
        let mut io_parts = Vec::with_capacity(count);
        for tid in 0..count {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let (sender, mb) = mailbox()?;
            let route = Route::new(MailboxId::IoThread(tid as u32), id);
            let load = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            io_handles.push(IoHandle {
                sender,
                route: route.clone(),
                load: Arc::clone(&load),
            });
            io_parts.push((tid as u32, id, mb, load));
        }

        let reaper_id = next_id.fetch_add(1, Ordering::Relaxed);
        let (reaper_sender, reaper_mb) = mailbox()?;
        let reaper_route = Route::new(MailboxId::Reaper, reaper_id);

        let term_id = next_id.fetch_add(1, Ordering::Relaxed);
        let (term_sender, term_mb) = mailbox()?;
        let term_route = Route::new(MailboxId::Term, term_id);

        let shared = Arc::new(Ctx {
            io: io_handles,
            reaper_sender,
            reaper_route,
            term_sender,
            term_route,
            sockets: Mutex::new(HashMap::new()),
            inproc: Mutex::new(InprocTable::default()),
            next_object_id: next_id,
            terminating: AtomicBool::new(false),
        });

        let mut io_joins = Vec::with_capacity(count);
        for (tid, self_id, mb, load) in io_parts {
            let worker = IoThread::new(Arc::clone(&shared), tid, self_id, mb, load)?;
            let join = thread::Builder::new()
                .name(format!("driveshaft-io-{tid}"))
                .spawn(move || worker.run())?;
            io_joins.push(join);
        }

        let reaper = Reaper::new(Arc::clone(&shared), reaper_id, reaper_mb)?;
        let reaper_join = thread::Builder::new()
            .name("driveshaft-reaper".to_string())
            .spawn(move || reaper.run())?;

        Ok(Self {
            shared,
            io_joins,
            reaper_join: Some(reaper_join),
            term_mailbox: Some(term_mb),
            terminated: false,
        })
    }

    /// The shareable context state, as passed to socket constructors.
    #[must_use]
    pub fn shared(&self) -> &Arc<Ctx> {
        &self.shared
    }

    /// Terminate the context: unblock and fail all pending socket
    /// operations, wait until every socket has been closed and reaped,
    /// then stop and join the worker threads.
    pub fn term(mut self) -> Result<()> {
        self.do_term()
    }

    fn do_term(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.shared.start_shutdown();

        if let Some(mut term_mb) = self.term_mailbox.take() {
            loop {
                let cmd = term_mb.recv(None)?;
                if matches!(cmd.kind, CommandKind::Done) {
                    break;
                }
            }
        }

        for handle in &self.shared.io {
            self.shared
                .send_command(&handle.route, CommandKind::Stop);
        }
        for join in self.io_joins.drain(..) {
            let _ = join.join();
        }
        if let Some(join) = self.reaper_join.take() {
            let _ = join.join();
        }
        self.terminated = true;
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.do_term();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_starts_and_terminates() {
        let ctx = Context::with_io_threads(2).unwrap();
        assert_eq!(ctx.shared().io_thread_count(), 2);
        ctx.term().unwrap();
    }

    #[test]
    fn test_register_socket_after_shutdown_fails() {
        let ctx = Context::new().unwrap();
        ctx.shared().start_shutdown();
        assert!(matches!(
            ctx.shared().register_socket(),
            Err(DriveshaftError::Terminated)
        ));
        ctx.term().unwrap();
    }

    #[test]
    fn test_inproc_registry() {
        let ctx = Context::new().unwrap();
        let shared = ctx.shared();
        let route = shared.alloc_route(MailboxId::Socket(999));
        let binding = InprocBinding {
            route: route.clone(),
            sndhwm: 10,
            rcvhwm: 10,
        };
        assert!(shared.register_inproc("a", binding.clone()).is_ok());
        assert!(shared.register_inproc("a", binding.clone()).is_err());
        assert!(shared.find_inproc("a").is_some());
        assert!(shared.find_inproc("b").is_none());

        shared.unregister_inproc(route.object());
        assert!(shared.find_inproc("a").is_none());
        ctx.term().unwrap();
    }

    #[test]
    fn test_choose_io_thread_prefers_idle() {
        let ctx = Context::with_io_threads(2).unwrap();
        // Both threads idle apart from their mailboxes: either answer
        // is fine, but it must be a valid index.
        let tid = ctx.shared().choose_io_thread();
        assert!((tid as usize) < 2);
        ctx.term().unwrap();
    }
}
