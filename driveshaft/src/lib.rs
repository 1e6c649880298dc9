//! # Driveshaft
//!
//! A brokerless message-transport runtime: socket-like endpoints
//! exchanging discrete multi-frame messages over TCP and in-process
//! transports.
//!
//! ## Architecture
//!
//! Driveshaft is layered as a **messaging kernel** plus protocol
//! crates:
//!
//! - **`driveshaft-core`**: lock-free SPSC pipes, mailboxes, the epoll
//!   reactor and I/O threads, the ownership/termination graph, the
//!   context
//! - **`driveshaft-zmtp`**: wire framing, handshake, sessions, TCP
//!   transport, and the socket patterns
//! - **`driveshaft`**: public API surface (this crate)
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use driveshaft::zmq::{Context, Socket, SocketType};
//!
//! # fn main() -> driveshaft::zmq::Result<()> {
//! let ctx = Context::new()?;
//!
//! let mut server = Socket::new(&ctx, SocketType::Dealer)?;
//! server.bind("tcp://127.0.0.1:7766")?;
//!
//! let mut client = Socket::new(&ctx, SocketType::Dealer)?;
//! client.connect("tcp://127.0.0.1:7766")?;
//!
//! client.send("hello world : 0")?;
//! let echoed = server.recv()?;
//! assert_eq!(echoed.data(), b"hello world : 0");
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Every socket is a distributed object: the application half runs in
//! your thread, its sessions and connections run on the context's I/O
//! threads, and the two halves exchange only commands through
//! lock-reduced mailboxes and messages through lock-free pipes. A
//! socket handle itself is single-owner (`&mut self` everywhere).
//!
//! ## Safety
//!
//! `unsafe` code is confined to `driveshaft-core`'s lock-free cells
//! (`yqueue`, `ypipe`) and raw descriptor plumbing (`signaler`,
//! `reactor`); everything above that is safe Rust.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

// Re-export core types
pub use bytes::Bytes;
pub use driveshaft_core::error::{DriveshaftError, Result};
pub use driveshaft_core::msg::Msg;
pub use driveshaft_core::options::{Options, SocketOption};
pub use driveshaft_core::socket_type::SocketType;

// Protocol modules (opt-in via features)
#[cfg(feature = "zmq")]
pub mod zmq;

/// Development helpers (benches/tests)
pub mod dev_tracing;
