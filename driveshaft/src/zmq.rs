//! ZMTP socket API.
//!
//! The full socket surface: create a [`Context`], create [`Socket`]s
//! of a [`SocketType`], bind or connect them, and exchange messages.

pub use driveshaft_zmtp::{
    Context, DriveshaftError, Metadata, Msg, Options, Result, Socket, SocketEvent, SocketMonitor,
    SocketOption, SocketType, ZmtpError,
};

/// Convenient glob-import surface.
pub mod prelude {
    pub use super::{Context, Msg, Result, Socket, SocketOption, SocketType};
    pub use bytes::Bytes;
}
