//! Driveshaft Core
//!
//! The threaded messaging kernel underneath the Driveshaft socket
//! crates:
//! - lock-free SPSC plumbing (`yqueue`, `ypipe`)
//! - wake-up and command delivery (`signaler`, `mailbox`, `command`)
//! - the epoll reactor and I/O worker threads (`reactor`, `io_thread`)
//! - the ownership/termination graph (`object`)
//! - flow-controlled duplex pipes (`pipe`)
//! - messages, options, endpoints, monitoring (`msg`, `options`,
//!   `endpoint`, `monitor`)
//! - the process-scoped runtime (`context`, `reaper`)
//!
//! Unsafe code is confined to the modules that need raw memory or raw
//! syscalls: `yqueue`/`ypipe` (the lock-free cells), `signaler` and
//! `reactor` (fd syscalls).

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod io_thread;
pub mod mailbox;
pub mod monitor;
pub mod msg;
pub mod object;
pub mod options;
pub mod pipe;
pub mod reactor;
pub mod reaper;
pub mod signaler;
pub mod socket_type;
pub mod ypipe;
pub mod yqueue;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::context::{Context, Ctx};
    pub use crate::error::{DriveshaftError, Result};
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::msg::Msg;
    pub use crate::options::{Options, SocketOption};
    pub use crate::socket_type::SocketType;
}
