//! # Driveshaft ZMTP
//!
//! **Internal protocol implementation crate for Driveshaft.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `driveshaft`
//! crate for the public API.**
//!
//! This crate supplies everything above the `driveshaft-core` kernel:
//! the 64-byte greeting, the length-prefixed wire framing, the
//! security-mechanism seam (NULL), the per-connection stream engine
//! and session, the TCP connecter/listener pair, and the socket
//! patterns wired onto the pattern-agnostic socket base.
//!
//! ## Socket patterns
//!
//! - **PAIR**: exclusive two-endpoint link
//! - **DEALER / ROUTER**: asynchronous request-reply with identity routing
//! - **REQ / REP**: strict alternating request-reply with envelopes
//! - **PUSH / PULL**: load-balanced pipeline
//! - **PUB / SUB / XPUB / XSUB**: prefix-filtered fan-out

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::uninlined_format_args)] // Style preference

// Internal modules (not part of the public API)
mod dist;
mod fq;
mod lb;
mod subscription;
mod tcp;
mod tcp_connecter;
mod tcp_listener;

// Protocol building blocks
pub mod codec;
pub mod greeting;
pub mod mechanism;

// The connection machinery
mod engine;
mod session;

// The socket surface
pub mod base;
mod dealer;
mod pair;
mod publisher;
mod pull;
mod push;
mod rep;
mod req;
mod router;
mod subscriber;
mod xpub;
mod xsub;

// Re-export the public surface
pub use base::Socket;
pub use codec::ZmtpError;
pub use driveshaft_core::context::Context;
pub use driveshaft_core::error::{DriveshaftError, Result};
pub use driveshaft_core::monitor::{SocketEvent, SocketMonitor};
pub use driveshaft_core::msg::{Metadata, Msg};
pub use driveshaft_core::options::{Options, SocketOption};
pub use driveshaft_core::socket_type::SocketType;

/// Prelude module for convenient imports
///
/// ```rust
/// use driveshaft_zmtp::prelude::*;
/// ```
pub mod prelude {
    pub use super::{Context, DriveshaftError, Msg, Result, Socket, SocketOption, SocketType};
    pub use bytes::Bytes;
}
