//! Worker-thread event loop over epoll.
//!
//! Owns the registered descriptors and the timer wheel for one worker
//! thread. The loop itself lives in `io_thread` (and the reaper), which
//! interleaves dispatch with liveness checks: removing a descriptor
//! mid-batch marks its entry retired, remaining events for it in the
//! current batch are skipped, and the entry is only released after the
//! batch (`purge_retired`), so a slot is never re-dispatched stale.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::command::ObjectId;
use crate::config::MAX_IO_EVENTS;

/// Registration handle returned by [`Reactor::add_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

/// Readiness of one descriptor in one batch.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub key: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

struct PollEntry {
    fd: RawFd,
    events: u32,
    owner: ObjectId,
    retired: bool,
}

struct Timer {
    owner: ObjectId,
    id: u32,
}

/// Epoll-backed readiness reactor with a timer wheel and a load
/// counter shared with the context for thread selection.
pub struct Reactor {
    epfd: RawFd,
    entries: Slab<PollEntry>,
    retired: Vec<usize>,
    /// Timers keyed by (expiry, insertion sequence): fires in
    /// expiration order, insertion order within a tick.
    timers: BTreeMap<(u64, u64), Timer>,
    timer_seq: u64,
    load: Arc<AtomicUsize>,
    started: Instant,
}

impl Reactor {
    pub fn new(load: Arc<AtomicUsize>) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            entries: Slab::new(),
            retired: Vec::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            load,
            started: Instant::now(),
        })
    }

    /// Registered descriptors across live entries. Used for idle-exit
    /// and for balancing new objects across threads.
    #[must_use]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: usize) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: key as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a descriptor, initially watching nothing. Events are
    /// dispatched to `owner`.
    pub fn add_fd(&mut self, fd: RawFd, owner: ObjectId) -> io::Result<Handle> {
        let key = self.entries.insert(PollEntry {
            fd,
            events: 0,
            owner,
            retired: false,
        });
        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, 0, key) {
            self.entries.remove(key);
            return Err(e);
        }
        self.load.fetch_add(1, Ordering::Relaxed);
        Ok(Handle(key))
    }

    /// Deregister. The entry stays in the table, marked retired, until
    /// the end of the current dispatch batch.
    pub fn rm_fd(&mut self, handle: Handle) {
        let fd = self.entries[handle.0].fd;
        debug_assert!(!self.entries[handle.0].retired, "descriptor removed twice");
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, handle.0);
        self.entries[handle.0].retired = true;
        self.retired.push(handle.0);
        self.load.fetch_sub(1, Ordering::Relaxed);
    }

    fn modify(&mut self, handle: Handle, set: u32, clear: u32) {
        let entry = &mut self.entries[handle.0];
        let events = (entry.events | set) & !clear;
        if events == entry.events {
            return;
        }
        entry.events = events;
        let (fd, events) = (entry.fd, entry.events);
        let _ = self.ctl(libc::EPOLL_CTL_MOD, fd, events, handle.0);
    }

    pub fn set_pollin(&mut self, handle: Handle) {
        self.modify(handle, libc::EPOLLIN as u32, 0);
    }

    pub fn reset_pollin(&mut self, handle: Handle) {
        self.modify(handle, 0, libc::EPOLLIN as u32);
    }

    pub fn set_pollout(&mut self, handle: Handle) {
        self.modify(handle, libc::EPOLLOUT as u32, 0);
    }

    pub fn reset_pollout(&mut self, handle: Handle) {
        self.modify(handle, 0, libc::EPOLLOUT as u32);
    }

    /// Milliseconds since this reactor started.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn add_timer(&mut self, delay: Duration, owner: ObjectId, id: u32) {
        let expiry = self.now_ms() + delay.as_millis() as u64;
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.insert((expiry, seq), Timer { owner, id });
    }

    /// Cancel a previously added timer. O(n); cancellation is rare.
    pub fn cancel_timer(&mut self, owner: ObjectId, id: u32) {
        self.timers
            .retain(|_, t| !(t.owner == owner && t.id == id));
    }

    #[must_use]
    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Pop all due timers. Returns the due (owner, id) pairs in firing
    /// order, plus the wait until the next timer (`None` when no
    /// timers remain).
    pub fn execute_timers(&mut self) -> (Vec<(ObjectId, u32)>, Option<u64>) {
        if self.timers.is_empty() {
            return (Vec::new(), None);
        }
        let now = self.now_ms();
        let mut due = Vec::new();
        let mut next = None;
        while let Some((&(expiry, seq), _)) = self.timers.iter().next() {
            if expiry > now {
                next = Some(expiry - now);
                break;
            }
            let timer = self.timers.remove(&(expiry, seq)).unwrap();
            due.push((timer.owner, timer.id));
        }
        (due, next)
    }

    /// Block for readiness up to `timeout` (`None` waits forever).
    pub fn wait(&mut self, timeout: Option<u64>, out: &mut Vec<Ready>) -> io::Result<()> {
        out.clear();
        let mut events: [libc::epoll_event; MAX_IO_EVENTS] =
            unsafe { std::mem::zeroed() };
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(ms) => ms.min(i32::MAX as u64) as libc::c_int,
        };

        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_IO_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        for ev in &events[..n] {
            let key = ev.u64 as usize;
            let flags = ev.events;
            out.push(Ready {
                key,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                error: flags & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
            });
        }
        Ok(())
    }

    /// Owner of a live entry; `None` once it was retired this batch.
    #[must_use]
    pub fn owner_of(&self, key: usize) -> Option<ObjectId> {
        match self.entries.get(key) {
            Some(entry) if !entry.retired => Some(entry.owner),
            _ => None,
        }
    }

    /// Release entries retired during the finished batch.
    pub fn purge_retired(&mut self) {
        for key in self.retired.drain(..) {
            self.entries.remove(key);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaler::Signaler;

    fn reactor() -> Reactor {
        Reactor::new(Arc::new(AtomicUsize::new(0))).unwrap()
    }

    #[test]
    fn test_fd_readiness() {
        let mut r = reactor();
        let sig = Signaler::new().unwrap();
        let h = r.add_fd(sig.fd(), 42).unwrap();
        r.set_pollin(h);
        assert_eq!(r.load(), 1);

        let mut out = Vec::new();
        r.wait(Some(0), &mut out).unwrap();
        assert!(out.is_empty());

        sig.send();
        r.wait(Some(1000), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].readable);
        assert_eq!(r.owner_of(out[0].key), Some(42));

        r.rm_fd(h);
        assert_eq!(r.owner_of(out[0].key), None);
        r.purge_retired();
        assert_eq!(r.load(), 0);
    }

    #[test]
    fn test_timer_order() {
        let mut r = reactor();
        r.add_timer(Duration::from_millis(50), 1, 10);
        r.add_timer(Duration::from_millis(5), 2, 20);
        r.add_timer(Duration::from_millis(5), 3, 30);

        std::thread::sleep(Duration::from_millis(10));
        let (due, next) = r.execute_timers();
        // Same-tick timers fire in insertion order.
        assert_eq!(due, vec![(2, 20), (3, 30)]);
        assert!(next.is_some());

        std::thread::sleep(Duration::from_millis(50));
        let (due, next) = r.execute_timers();
        assert_eq!(due, vec![(1, 10)]);
        assert!(next.is_none());
    }

    #[test]
    fn test_cancel_timer() {
        let mut r = reactor();
        r.add_timer(Duration::from_millis(1), 1, 10);
        r.add_timer(Duration::from_millis(1), 1, 11);
        r.cancel_timer(1, 10);
        std::thread::sleep(Duration::from_millis(5));
        let (due, _) = r.execute_timers();
        assert_eq!(due, vec![(1, 11)]);
    }

    #[test]
    fn test_pollout_toggle() {
        let mut r = reactor();
        let sig = Signaler::new().unwrap();
        let h = r.add_fd(sig.fd(), 1).unwrap();
        // eventfd counters are writable while below u64::MAX.
        r.set_pollout(h);
        let mut out = Vec::new();
        r.wait(Some(100), &mut out).unwrap();
        assert!(out.iter().any(|e| e.writable));

        r.reset_pollout(h);
        r.wait(Some(0), &mut out).unwrap();
        assert!(out.is_empty());
        r.rm_fd(h);
        r.purge_retired();
    }
}
