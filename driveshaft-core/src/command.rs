//! Commands and object addressing.
//!
//! Every long-lived object in the runtime is reachable through a
//! [`Route`]: which mailbox serves it, its object id within that
//! mailbox's owner, and a shared counter of commands sent toward it.
//! All cross-thread interaction happens by posting a [`Command`] to the
//! route's mailbox; the owning thread dispatches it by object id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::object::IoObject;
use crate::pipe::PipeEnd;
use crate::reaper::Reapable;

/// Context-unique identifier of a command-receiving object (socket,
/// session, connecter, listener, or one end of a pipe).
pub type ObjectId = u32;

/// Which mailbox a route points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxId {
    /// One of the context's I/O worker threads.
    IoThread(u32),
    /// An application-side socket (keyed by the socket's object id).
    Socket(ObjectId),
    /// The context's reaper thread.
    Reaper,
    /// The context's termination mailbox.
    Term,
}

/// Address of an object plus the sent-command counter that the
/// termination protocol closes against.
#[derive(Clone)]
pub struct Route {
    mailbox: MailboxId,
    object: ObjectId,
    seqnum: Arc<AtomicU64>,
}

impl Route {
    #[must_use]
    pub fn new(mailbox: MailboxId, object: ObjectId) -> Self {
        Self {
            mailbox,
            object,
            seqnum: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub const fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    #[must_use]
    pub const fn object(&self) -> ObjectId {
        self.object
    }

    /// Record one more command sent toward this object. Called by the
    /// context as part of posting, never directly.
    pub(crate) fn bump_sent(&self) {
        self.seqnum.fetch_add(1, Ordering::AcqRel);
    }

    /// Commands sent toward this object so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.seqnum.load(Ordering::Acquire)
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.mailbox == other.mailbox && self.object == other.object
    }
}

impl Eq for Route {}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({:?}, {})", self.mailbox, self.object)
    }
}

/// Payload of a command.
pub enum CommandKind {
    /// Shut the receiving event loop down (I/O thread, reaper) or mark
    /// the receiving socket's context as terminated.
    Stop,

    /// Install the carried object into the destination thread's object
    /// table and start it up.
    Plug(Box<dyn IoObject>),

    /// Hand a freshly connected engine to its session.
    Attach { engine: Box<dyn Engine> },

    /// Hand a socket its half of a newly created pipe.
    Bind { pipe: PipeEnd },

    /// The pipe's writer published messages while the reader slept.
    ActivateRead { pipe: ObjectId },

    /// Flow-control credit: the reader consumed up to `msgs_read`, the
    /// writer may resume once below the high-water mark.
    ActivateWrite { pipe: ObjectId, msgs_read: u64 },

    /// The upstream connection was lost and is being re-established;
    /// patterns use this to replay state (e.g. subscriptions).
    Hiccup { pipe: ObjectId },

    /// First phase of pipe shutdown.
    PipeTerm { pipe: ObjectId },

    /// Second phase of pipe shutdown.
    PipeTermAck { pipe: ObjectId },

    /// A child asks its owner to start terminating it.
    TermReq { child: Route },

    /// Owner tells a child to terminate, draining for `linger`.
    Term { linger: Option<Duration> },

    /// Child reports its termination is complete.
    TermAck,

    /// Transfer a closed socket to the reaper thread.
    Reap { socket: Box<dyn Reapable> },

    /// A reaped socket finished dying.
    Reaped,

    /// An inproc connection was completed by the bound peer; carries
    /// the peer half's address so flow-control commands can flow.
    InprocConnected {
        pipe: ObjectId,
        peer: Route,
        peer_pipe: ObjectId,
    },

    /// Context teardown finished; unblocks the terminating thread.
    Done,
}

impl fmt::Debug for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stop => "Stop",
            Self::Plug(_) => "Plug",
            Self::Attach { .. } => "Attach",
            Self::Bind { .. } => "Bind",
            Self::ActivateRead { .. } => "ActivateRead",
            Self::ActivateWrite { .. } => "ActivateWrite",
            Self::Hiccup { .. } => "Hiccup",
            Self::PipeTerm { .. } => "PipeTerm",
            Self::PipeTermAck { .. } => "PipeTermAck",
            Self::TermReq { .. } => "TermReq",
            Self::Term { .. } => "Term",
            Self::TermAck => "TermAck",
            Self::Reap { .. } => "Reap",
            Self::Reaped => "Reaped",
            Self::InprocConnected { .. } => "InprocConnected",
            Self::Done => "Done",
        };
        f.write_str(name)
    }
}

/// A one-shot control message between objects.
pub struct Command {
    pub dest: Route,
    pub kind: CommandKind,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:?} -> {:?})", self.kind, self.dest)
    }
}
