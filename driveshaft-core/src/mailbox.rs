//! Command mailbox.
//!
//! A Y-pipe of commands plus a signaler. Any thread may send through a
//! cloned [`MailboxSender`] (writes are serialised by a mutex, since
//! the Y-pipe itself admits only one producer); exactly one thread —
//! the owner — receives. The signaler fires only on the empty to
//! non-empty transition observed by a failed flush, so the hot path of
//! an active consumer never touches a file descriptor.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::Command;
use crate::config::COMMAND_PIPE_GRANULARITY;
use crate::error::Result;
use crate::signaler::Signaler;
use crate::ypipe;

struct MailboxShared {
    writer: Mutex<ypipe::Writer<Command, COMMAND_PIPE_GRANULARITY>>,
    signaler: Arc<Signaler>,
}

/// Cloneable producer half of a mailbox.
#[derive(Clone)]
pub struct MailboxSender {
    shared: Arc<MailboxShared>,
}

impl MailboxSender {
    /// Post a command, waking the consumer if it had gone to sleep.
    pub fn send(&self, cmd: Command) {
        let wake = {
            let mut writer = self.shared.writer.lock();
            writer.write(cmd, false);
            !writer.flush()
        };
        if wake {
            self.shared.signaler.send();
        }
    }
}

/// Consumer half of a mailbox; owned by exactly one thread at a time.
pub struct Mailbox {
    reader: ypipe::Reader<Command, COMMAND_PIPE_GRANULARITY>,
    signaler: Arc<Signaler>,
    sender: MailboxSender,
    /// Whether the command pipe may still hold unread commands without
    /// a pending signal.
    active: bool,
}

/// Create a connected sender/receiver pair.
pub fn mailbox() -> io::Result<(MailboxSender, Mailbox)> {
    let (writer, reader) = ypipe::pair();
    let signaler = Arc::new(Signaler::new()?);
    let shared = Arc::new(MailboxShared {
        writer: Mutex::new(writer),
        signaler: Arc::clone(&signaler),
    });
    let sender = MailboxSender { shared };
    Ok((
        sender.clone(),
        Mailbox {
            reader,
            signaler,
            sender,
            active: true,
        },
    ))
}

impl Mailbox {
    /// Descriptor that becomes readable when a sleeping consumer is
    /// owed a wake-up; hand this to a reactor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.signaler.fd()
    }

    /// Another sender handle for this mailbox.
    #[must_use]
    pub fn sender(&self) -> MailboxSender {
        self.sender.clone()
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Command> {
        if self.active {
            if let Some(cmd) = self.reader.read() {
                return Some(cmd);
            }
            self.active = false;
        }
        // The pipe looked empty; a signal may be pending from a flush
        // that raced with our going-to-sleep.
        match self.signaler.recv_failable() {
            Ok(()) => {
                self.active = true;
                self.reader.read()
            }
            Err(_) => None,
        }
    }

    /// Receive one command, blocking up to `timeout` (`None` blocks
    /// indefinitely). Returns
    /// [`WouldBlock`](crate::error::DriveshaftError::WouldBlock) on
    /// timeout.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Command> {
        if self.active {
            if let Some(cmd) = self.reader.read() {
                return Ok(cmd);
            }
            self.active = false;
        }

        loop {
            self.signaler.wait(timeout)?;
            self.signaler.recv_failable()?;
            self.active = true;
            // By the Y-pipe protocol a signal implies a published
            // command; tolerate a miss by waiting again.
            if let Some(cmd) = self.reader.read() {
                return Ok(cmd);
            }
            self.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind, MailboxId, Route};
    use std::thread;

    fn stop_cmd(object: u32) -> Command {
        Command {
            dest: Route::new(MailboxId::Socket(object), object),
            kind: CommandKind::Stop,
        }
    }

    #[test]
    fn test_send_recv_same_thread() {
        let (tx, mut rx) = mailbox().unwrap();
        assert!(rx.try_recv().is_none());

        tx.send(stop_cmd(1));
        tx.send(stop_cmd(2));

        assert_eq!(rx.try_recv().unwrap().dest.object(), 1);
        assert_eq!(rx.try_recv().unwrap().dest.object(), 2);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_recv_timeout() {
        let (_tx, mut rx) = mailbox().unwrap();
        let err = rx.recv(Some(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_would_block());
    }

    #[test]
    fn test_blocking_recv_wakes_on_send() {
        let (tx, mut rx) = mailbox().unwrap();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(stop_cmd(7));
        });
        let cmd = rx.recv(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cmd.dest.object(), 7);
        t.join().unwrap();
    }

    #[test]
    fn test_many_writers_one_reader() {
        let (tx, mut rx) = mailbox().unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    tx.send(stop_cmd(i));
                }
            }));
        }
        let mut got = 0;
        while got < 1000 {
            if rx.recv(Some(Duration::from_secs(5))).is_ok() {
                got += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(rx.try_recv().is_none());
    }
}
