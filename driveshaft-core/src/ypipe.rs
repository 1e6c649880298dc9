//! Lock-free single-producer/single-consumer pipe.
//!
//! A [`pair`] splits one shared [`YQueue`] into a [`Writer`] and a
//! [`Reader`] handle, each movable to its own thread. Three cursors
//! partition the queue: everything left of `r` has been consumed,
//! `[r, w)` is readable, `[w, f)` is written but not yet flushed, and
//! anything past `f` is a staged, incomplete multi-frame batch.
//!
//! The single shared word `c` is the consumer's reading frontier. It
//! holds either a slot pointer (the consumer is live and will keep
//! reading up to that slot) or null (the consumer found the pipe empty
//! and parked). `flush` publishes `[w, f)` by compare-exchanging `c`
//! from `w` to `f`; when the exchange fails the consumer has parked, so
//! the producer installs `f` directly and reports that a wake-up signal
//! is owed. All accesses to `c` use acquire-release ordering — the
//! pointer swap is the only synchronisation between the two threads.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::yqueue::YQueue;

struct Shared<T, const N: usize> {
    queue: YQueue<T, N>,
    c: AtomicPtr<T>,
}

// The queue's split-role contract is enforced by the Writer/Reader
// handles: each exists exactly once and is Send but not clonable, so
// each role is driven by at most one thread at a time.
unsafe impl<T: Send, const N: usize> Send for Shared<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Shared<T, N> {}

/// Producer handle of a Y-pipe.
pub struct Writer<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
    /// Frontier published to the consumer.
    w: *mut T,
    /// First slot of the next flush (end of completed writes).
    f: *mut T,
}

unsafe impl<T: Send, const N: usize> Send for Writer<T, N> {}

/// Consumer handle of a Y-pipe.
pub struct Reader<T: Send, const N: usize> {
    shared: Arc<Shared<T, N>>,
    /// Slot up to which reading may proceed without touching `c`.
    r: *mut T,
}

unsafe impl<T: Send, const N: usize> Send for Reader<T, N> {}

/// Create a connected writer/reader pair.
pub fn pair<T: Send, const N: usize>() -> (Writer<T, N>, Reader<T, N>) {
    let queue = YQueue::new();
    // One vacant staging slot so that all cursors have a slot to point
    // at while the pipe is empty.
    unsafe { queue.push() };
    let p = queue.back_ptr();
    let shared = Arc::new(Shared {
        queue,
        c: AtomicPtr::new(p),
    });
    (
        Writer {
            shared: Arc::clone(&shared),
            w: p,
            f: p,
        },
        Reader { shared, r: p },
    )
}

impl<T: Send, const N: usize> Writer<T, N> {
    /// Append a value. With `incomplete` the value is staged but not
    /// yet eligible for flushing, so a multi-frame message becomes
    /// visible to the consumer all at once when its final frame is
    /// written with `incomplete == false`.
    pub fn write(&mut self, value: T, incomplete: bool) {
        unsafe {
            self.shared.queue.write_back(value);
            self.shared.queue.push();
        }
        if !incomplete {
            self.f = self.shared.queue.back_ptr();
        }
    }

    /// Retract the most recently written unflushed value, if any.
    pub fn unwrite(&mut self) -> Option<T> {
        if self.f == self.shared.queue.back_ptr() {
            return None;
        }
        Some(unsafe { self.shared.queue.unpush() })
    }

    /// Publish all completed writes to the consumer.
    ///
    /// Returns `true` when the consumer is live. A `false` return means
    /// the consumer had parked before this flush: the values are
    /// published regardless, but the caller owes the consumer a wake-up
    /// signal through whatever channel connects the two threads.
    #[must_use]
    pub fn flush(&mut self) -> bool {
        if self.w == self.f {
            return true;
        }
        match self
            .shared
            .c
            .compare_exchange(self.w, self.f, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.w = self.f;
                true
            }
            Err(_) => {
                // The consumer parked (c is null): it will not look at
                // the pipe again on its own, so install the frontier on
                // its behalf and ask the caller to wake it.
                self.shared.c.store(self.f, Ordering::Release);
                self.w = self.f;
                false
            }
        }
    }
}

impl<T: Send, const N: usize> Reader<T, N> {
    /// Check whether a value is readable.
    ///
    /// When the local run is exhausted this consults `c`: either it
    /// reveals a new frontier published by the producer, or the
    /// consumer parks by swapping `c` to null — after which only a
    /// producer flush (returning `false` to the producer) revives it.
    #[must_use]
    pub fn check_read(&mut self) -> bool {
        let front = self.shared.queue.front_ptr();
        if front != self.r && !self.r.is_null() {
            return true;
        }

        match self
            .shared
            .c
            .compare_exchange(front, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Nothing beyond our position: parked.
                self.r = front;
                false
            }
            Err(actual) => {
                self.r = actual;
                !actual.is_null()
            }
        }
    }

    /// Take the next value, or `None` when the pipe is (now known to
    /// be) empty and the consumer has parked.
    pub fn read(&mut self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        Some(unsafe { self.shared.queue.pop() })
    }

    /// Inspect the next value without consuming it.
    pub fn probe(&mut self, f: impl FnOnce(&T) -> bool) -> bool {
        if !self.check_read() {
            return false;
        }
        unsafe { f(&*self.shared.queue.front_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_flush_read() {
        let (mut w, mut r) = pair::<u64, 4>();
        assert!(r.read().is_none());

        w.write(1, false);
        w.write(2, false);
        assert!(!w.flush()); // reader parked by the failed read above

        assert_eq!(r.read(), Some(1));
        assert_eq!(r.read(), Some(2));
        assert!(r.read().is_none());
    }

    #[test]
    fn test_flush_true_while_reader_live() {
        let (mut w, mut r) = pair::<u64, 4>();
        w.write(1, false);
        // The reader never parked, so no signal is owed.
        assert!(w.flush());
        assert_eq!(r.read(), Some(1));

        // Reader is still at the frontier without having parked:
        // another flush finds it live again.
        w.write(2, false);
        assert!(w.flush());
        assert_eq!(r.read(), Some(2));
    }

    #[test]
    fn test_incomplete_writes_flush_atomically() {
        let (mut w, mut r) = pair::<u64, 4>();
        w.write(1, true);
        w.write(2, true);
        let _ = w.flush(); // nothing completed: no-op
        assert!(r.read().is_none());

        w.write(3, false);
        let _ = w.flush();
        assert_eq!(r.read(), Some(1));
        assert_eq!(r.read(), Some(2));
        assert_eq!(r.read(), Some(3));
    }

    #[test]
    fn test_unwrite() {
        let (mut w, mut r) = pair::<u64, 4>();
        w.write(1, false);
        let _ = w.flush();
        w.write(2, true);
        w.write(3, true);
        assert_eq!(w.unwrite(), Some(3));
        assert_eq!(w.unwrite(), Some(2));
        assert_eq!(w.unwrite(), None); // slot 1 already flushed

        assert_eq!(r.read(), Some(1));
        assert!(r.read().is_none());
    }

    #[test]
    fn test_park_unpark_cycle() {
        let (mut w, mut r) = pair::<u64, 4>();

        // Park the reader.
        assert!(!r.check_read());
        // First flush after a park must request a signal.
        w.write(10, false);
        assert!(!w.flush());
        // Reader revives and drains.
        assert_eq!(r.read(), Some(10));
        assert!(!r.check_read());
    }

    #[test]
    fn test_probe() {
        let (mut w, mut r) = pair::<u64, 4>();
        w.write(42, false);
        let _ = w.flush();
        assert!(r.probe(|v| *v == 42));
        assert_eq!(r.read(), Some(42));
        assert!(!r.probe(|_| true));
    }

    #[test]
    fn test_two_threads_ordered_delivery() {
        const COUNT: u64 = 100_000;
        let (mut w, mut r) = pair::<u64, 64>();

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                w.write(i, false);
                let _ = w.flush();
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match r.read() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_drop_with_unread_values() {
        let (mut w, r) = pair::<Vec<u8>, 4>();
        for i in 0..10u8 {
            w.write(vec![i; 64], false);
        }
        let _ = w.flush();
        drop(r);
        drop(w);
    }
}
