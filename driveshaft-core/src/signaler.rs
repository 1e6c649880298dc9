//! Cross-thread wake-up primitive.
//!
//! A signaler owns a descriptor that becomes readable when another
//! thread calls [`Signaler::send`]. The receiving side can block on it
//! with a timeout, hand it to a reactor, or drain it non-blockingly.
//! Semantics are one-shot: sends coalesce until the next successful
//! [`Signaler::recv`].
//!
//! On Linux this is an eventfd; on other unix platforms a non-blocking
//! stream socketpair.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{DriveshaftError, Result};

/// One-shot wake primitive with a pollable descriptor.
#[derive(Debug)]
pub struct Signaler {
    /// Readable end, registered with pollers.
    r: RawFd,
    /// Writable end (same fd as `r` for eventfd).
    w: RawFd,
    /// Pid at creation; sends from a forked child are suppressed.
    pid: libc::pid_t,
}

// The fds are plain kernel handles; send() and recv() target disjoint
// ends and both are async-signal-safe syscalls.
unsafe impl Send for Signaler {}
unsafe impl Sync for Signaler {}

impl Signaler {
    pub fn new() -> io::Result<Self> {
        let (r, w) = make_fdpair()?;
        Ok(Self {
            r,
            w,
            pid: unsafe { libc::getpid() },
        })
    }

    /// The descriptor to poll for readability.
    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.r
    }

    /// Make the descriptor readable. Idempotent until the next `recv`.
    pub fn send(&self) {
        if unsafe { libc::getpid() } != self.pid {
            // Forked child: the descriptors belong to the parent's
            // context, never signal through them.
            return;
        }

        #[cfg(target_os = "linux")]
        {
            let inc: u64 = 1;
            loop {
                let n = unsafe {
                    libc::write(self.w, std::ptr::addr_of!(inc).cast(), 8)
                };
                if n == 8 {
                    return;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    // Counter saturated: the receiver is already
                    // overdue for a wake-up, nothing more to say.
                    io::ErrorKind::WouldBlock => return,
                    _ => panic!("signaler write failed: {err}"),
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let dummy = [0u8; 1];
            loop {
                let n = unsafe { libc::send(self.w, dummy.as_ptr().cast(), 1, 0) };
                if n == 1 {
                    return;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return,
                    _ => panic!("signaler send failed: {err}"),
                }
            }
        }
    }

    /// Block until the descriptor is readable or the timeout expires.
    /// `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.r,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };

        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc > 0 {
                return Ok(());
            }
            if rc == 0 {
                return Err(DriveshaftError::WouldBlock);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
    }

    /// Consume the pending signal, blocking via [`Signaler::wait`]
    /// first if none is pending yet.
    pub fn recv(&self) {
        loop {
            match self.recv_failable() {
                Ok(()) => return,
                Err(DriveshaftError::WouldBlock) => {
                    let _ = self.wait(None);
                }
                Err(_) => return,
            }
        }
    }

    /// Consume the pending signal, or return [`DriveshaftError::WouldBlock`]
    /// when none is pending.
    pub fn recv_failable(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let mut counter: u64 = 0;
            loop {
                let n = unsafe {
                    libc::read(self.r, std::ptr::addr_of_mut!(counter).cast(), 8)
                };
                if n == 8 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Err(DriveshaftError::WouldBlock),
                    _ => return Err(err.into()),
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let mut dummy = [0u8; 1];
            loop {
                let n = unsafe { libc::recv(self.r, dummy.as_mut_ptr().cast(), 1, 0) };
                if n == 1 {
                    return Ok(());
                }
                if n == 0 {
                    return Err(DriveshaftError::WouldBlock);
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Err(DriveshaftError::WouldBlock),
                    _ => return Err(err.into()),
                }
            }
        }
    }

    /// Reinitialise after a process fork so the child does not share
    /// wake-ups with the parent.
    pub fn forked(&mut self) -> io::Result<()> {
        self.close_fds();
        let (r, w) = make_fdpair()?;
        self.r = r;
        self.w = w;
        self.pid = unsafe { libc::getpid() };
        Ok(())
    }

    fn close_fds(&mut self) {
        unsafe {
            libc::close(self.r);
            if self.w != self.r {
                libc::close(self.w);
            }
        }
        self.r = -1;
        self.w = -1;
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        if self.r >= 0 {
            self.close_fds();
        }
    }
}

#[cfg(target_os = "linux")]
fn make_fdpair() -> io::Result<(RawFd, RawFd)> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fd, fd))
}

#[cfg(not(target_os = "linux"))]
fn make_fdpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_send_then_recv() {
        let s = Signaler::new().unwrap();
        assert!(s.recv_failable().is_would_block_err());
        s.send();
        s.send(); // coalesces
        assert!(s.recv_failable().is_ok());
        assert!(s.recv_failable().is_would_block_err());
    }

    #[test]
    fn test_wait_timeout() {
        let s = Signaler::new().unwrap();
        let err = s.wait(Some(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_would_block());
    }

    #[test]
    fn test_cross_thread_wake() {
        let s = std::sync::Arc::new(Signaler::new().unwrap());
        let s2 = std::sync::Arc::clone(&s);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            s2.send();
        });
        s.wait(Some(Duration::from_secs(5))).unwrap();
        s.recv();
        t.join().unwrap();
    }

    trait WouldBlockExt {
        fn is_would_block_err(&self) -> bool;
    }

    impl<T> WouldBlockExt for Result<T> {
        fn is_would_block_err(&self) -> bool {
            matches!(self, Err(e) if e.is_would_block())
        }
    }
}
