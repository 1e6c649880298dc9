//! Chunked single-writer/single-reader FIFO.
//!
//! Storage for the Y-pipe. Values live in fixed-size heap chunks linked
//! into a list; the writer appends at the back, the reader consumes at
//! the front, and a single spare chunk is kept aside through an atomic
//! exchange slot so steady-state churn costs no allocation.
//!
//! # Safety model
//!
//! This is the one module in the crate (together with `ypipe`) that
//! uses unsafe code. The queue itself enforces nothing: all methods
//! take `&self` and the caller must uphold the split-role contract.
//!
//! - Exactly one thread acts as the writer. Only the writer may call
//!   `write_back`, `push` and `unpush`; only the writer touches the
//!   back/end cursors.
//! - Exactly one thread acts as the reader. Only the reader may call
//!   `pop`; only the reader touches the begin cursor.
//! - The reader must not pop a slot the writer has not finished
//!   writing. The Y-pipe's published frontier provides that guarantee
//!   along with the necessary happens-before edges.
//! - `spare_chunk` is the only word touched by both roles and is only
//!   accessed with atomic exchanges.
//!
//! The `ypipe` module wraps this into a safe API by construction.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Chunk<T, const N: usize> {
    values: [UnsafeCell<MaybeUninit<T>>; N],
    prev: Cell<*mut Chunk<T, N>>,
    next: Cell<*mut Chunk<T, N>>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn alloc() -> *mut Self {
        // An uninitialised slot array is a valid value: every slot is
        // MaybeUninit and carries no validity requirement of its own.
        let chunk = Self {
            values: unsafe { MaybeUninit::uninit().assume_init() },
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        };
        Box::into_raw(Box::new(chunk))
    }

    /// # Safety
    ///
    /// `chunk` must have come out of [`Chunk::alloc`] and must not be
    /// referenced afterwards. Slots are freed as raw storage; any live
    /// values must have been dropped by the caller already.
    unsafe fn free(chunk: *mut Self) {
        drop(Box::from_raw(chunk));
    }
}

/// The FIFO. `N` is the chunk granularity.
pub(crate) struct YQueue<T, const N: usize> {
    // Reader cursor.
    begin_chunk: Cell<*mut Chunk<T, N>>,
    begin_pos: Cell<usize>,
    // Last committed slot (the staging slot for the next write).
    back_chunk: Cell<*mut Chunk<T, N>>,
    back_pos: Cell<usize>,
    // One past the staging slot.
    end_chunk: Cell<*mut Chunk<T, N>>,
    end_pos: Cell<usize>,
    // Released chunk cached for reuse.
    spare_chunk: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> YQueue<T, N> {
    pub fn new() -> Self {
        assert!(N > 1, "chunk granularity must exceed one slot");
        let first = Chunk::alloc();
        Self {
            begin_chunk: Cell::new(first),
            begin_pos: Cell::new(0),
            back_chunk: Cell::new(first),
            back_pos: Cell::new(0),
            end_chunk: Cell::new(first),
            end_pos: Cell::new(0),
            spare_chunk: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pointer to the front slot (oldest value).
    #[inline]
    pub fn front_ptr(&self) -> *mut T {
        unsafe {
            (*self.begin_chunk.get()).values[self.begin_pos.get()]
                .get()
                .cast()
        }
    }

    /// Pointer to the staging slot (where the next value lands).
    #[inline]
    pub fn back_ptr(&self) -> *mut T {
        unsafe {
            (*self.back_chunk.get()).values[self.back_pos.get()]
                .get()
                .cast()
        }
    }

    /// Store a value into the staging slot.
    ///
    /// # Safety
    ///
    /// Writer role only. The staging slot must currently be vacant
    /// (every `write_back` must be followed by `push` before the next
    /// `write_back`).
    #[inline]
    pub unsafe fn write_back(&self, value: T) {
        ptr::write(self.back_ptr(), value);
    }

    /// Commit the staging slot and advance, linking in a fresh chunk at
    /// a chunk boundary (preferring the spare over allocation).
    ///
    /// # Safety
    ///
    /// Writer role only.
    pub unsafe fn push(&self) {
        self.back_chunk.set(self.end_chunk.get());
        self.back_pos.set(self.end_pos.get());

        let next_pos = self.end_pos.get() + 1;
        if next_pos != N {
            self.end_pos.set(next_pos);
            return;
        }

        let spare = self.spare_chunk.swap(ptr::null_mut(), Ordering::AcqRel);
        let next = if spare.is_null() {
            Chunk::alloc()
        } else {
            (*spare).next.set(ptr::null_mut());
            spare
        };
        (*self.end_chunk.get()).next.set(next);
        (*next).prev.set(self.end_chunk.get());
        self.end_chunk.set(next);
        self.end_pos.set(0);
    }

    /// Retract the most recent `push`, returning the value it
    /// committed.
    ///
    /// # Safety
    ///
    /// Writer role only, and the retracted slot must not have been
    /// published to the reader (the Y-pipe only unwrites unflushed
    /// slots).
    pub unsafe fn unpush(&self) -> T {
        if self.back_pos.get() > 0 {
            self.back_pos.set(self.back_pos.get() - 1);
        } else {
            self.back_pos.set(N - 1);
            self.back_chunk.set((*self.back_chunk.get()).prev.get());
        }

        if self.end_pos.get() > 0 {
            self.end_pos.set(self.end_pos.get() - 1);
        } else {
            self.end_pos.set(N - 1);
            self.end_chunk.set((*self.end_chunk.get()).prev.get());
            let stale = (*self.end_chunk.get()).next.get();
            Chunk::free(stale);
            (*self.end_chunk.get()).next.set(ptr::null_mut());
        }

        ptr::read(self.back_ptr())
    }

    /// Take the front value and advance, recycling an emptied chunk
    /// through the spare slot.
    ///
    /// # Safety
    ///
    /// Reader role only, and the front slot must have been published by
    /// the writer (guaranteed by the Y-pipe frontier protocol).
    pub unsafe fn pop(&self) -> T {
        let value = ptr::read(self.front_ptr());

        let next_pos = self.begin_pos.get() + 1;
        if next_pos != N {
            self.begin_pos.set(next_pos);
        } else {
            let emptied = self.begin_chunk.get();
            self.begin_chunk.set((*emptied).next.get());
            (*self.begin_chunk.get()).prev.set(ptr::null_mut());
            self.begin_pos.set(0);

            let previous_spare = self.spare_chunk.swap(emptied, Ordering::AcqRel);
            if !previous_spare.is_null() {
                Chunk::free(previous_spare);
            }
        }
        value
    }
}

impl<T, const N: usize> Drop for YQueue<T, N> {
    fn drop(&mut self) {
        unsafe {
            // Live values occupy [begin, back); the back slot itself is
            // vacant staging.
            let mut chunk = self.begin_chunk.get();
            let mut pos = self.begin_pos.get();
            while !(chunk == self.back_chunk.get() && pos == self.back_pos.get()) {
                ptr::drop_in_place((*chunk).values[pos].get().cast::<T>());
                pos += 1;
                if pos == N {
                    chunk = (*chunk).next.get();
                    pos = 0;
                }
            }

            let mut c = self.begin_chunk.get();
            loop {
                let next = (*c).next.get();
                let last = c == self.end_chunk.get();
                Chunk::free(c);
                if last {
                    break;
                }
                c = next;
            }

            let spare = self.spare_chunk.swap(ptr::null_mut(), Ordering::AcqRel);
            if !spare.is_null() {
                Chunk::free(spare);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single-threaded exercise of the role contract: one caller plays
    // both roles in sequence, which is trivially valid.

    #[test]
    fn test_fifo_across_chunk_boundaries() {
        let q: YQueue<u64, 4> = YQueue::new();
        unsafe {
            q.push(); // staging slot, as the Y-pipe constructor does
            for i in 0..13u64 {
                q.write_back(i);
                q.push();
            }
            for i in 0..13u64 {
                assert_eq!(q.pop(), i);
            }
        }
    }

    #[test]
    fn test_unpush_returns_last_value() {
        let q: YQueue<String, 4> = YQueue::new();
        unsafe {
            q.push();
            for s in ["a", "b", "c", "d", "e"] {
                q.write_back(s.to_string());
                q.push();
            }
            assert_eq!(q.unpush(), "e");
            assert_eq!(q.unpush(), "d");
            q.write_back("d2".to_string());
            q.push();
            assert_eq!(q.pop(), "a");
            assert_eq!(q.pop(), "b");
            assert_eq!(q.pop(), "c");
            assert_eq!(q.pop(), "d2");
        }
    }

    #[test]
    fn test_drop_releases_unread_values() {
        // Drop with live values in the queue; run under a leak checker
        // (miri/asan) to verify nothing is leaked or double-freed.
        let q: YQueue<Vec<u8>, 4> = YQueue::new();
        unsafe {
            q.push();
            for i in 0..10u8 {
                q.write_back(vec![i; 100]);
                q.push();
            }
            let _ = q.pop();
            let _ = q.pop();
        }
        drop(q);
    }
}
