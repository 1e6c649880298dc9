//! The engine seam.
//!
//! An engine drives one connected file descriptor end-to-end: it is
//! created by a connecter or listener, shipped to its session inside an
//! `Attach` command, and from then on owned by the session, which
//! forwards reactor events to it. The session side of the relationship
//! is abstracted as [`EngineSink`], so the wire-protocol crate can
//! implement engines without this crate knowing any framing details.

use std::sync::Arc;

use bytes::Bytes;

use crate::command::ObjectId;
use crate::io_thread::IoCtx;
use crate::msg::{Metadata, Msg};
use crate::socket_type::SocketType;

/// Why an engine stopped.
#[derive(Debug)]
pub enum EngineError {
    /// Peer violated the wire protocol.
    Protocol(String),
    /// The connection failed or was reset by the peer.
    Io(std::io::Error),
    /// The protocol handshake did not finish in time.
    Timeout,
    /// Orderly local shutdown: everything to send has been sent.
    Done,
}

/// Per-connection protocol driver.
///
/// All methods take the session's [`IoCtx`] because the engine
/// registers its descriptor under the session's object id; reactor
/// events for it arrive at the session, which forwards them here.
pub trait Engine: Send {
    /// Register with the reactor and start the protocol.
    fn plug(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink);

    /// Unregister from the reactor and release the descriptor.
    fn terminate(&mut self, io: &mut IoCtx<'_>);

    /// The pipe toward the socket has room again; resume reading from
    /// the network.
    fn restart_input(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink);

    /// The pipe from the socket has messages again; resume writing to
    /// the network.
    fn restart_output(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink);

    fn in_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink);

    fn out_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink);

    fn timer_event(&mut self, io: &mut IoCtx<'_>, sink: &mut dyn EngineSink, id: u32);

    /// Nothing buffered for the wire; closing now loses no data.
    fn idle(&self) -> bool;
}

/// What an engine needs from the object that owns it.
pub trait EngineSink {
    /// Object id the engine's descriptor is registered under.
    fn object_id(&self) -> ObjectId;

    /// Queue an inbound message toward the socket. On backpressure the
    /// message comes back in `Err` and the engine must stop reading
    /// until [`Engine::restart_input`].
    fn push_msg(&mut self, msg: Msg) -> Result<(), Msg>;

    /// Publish everything pushed so far to the socket.
    fn flush(&mut self);

    /// Next outbound message from the socket, if any.
    fn pull_msg(&mut self) -> Option<Msg>;

    /// Handshake finished. Returns `false` when the peer is not an
    /// acceptable counterpart, in which case the engine must error out.
    fn engine_ready(
        &mut self,
        io: &mut IoCtx<'_>,
        peer_type: SocketType,
        peer_identity: Option<Bytes>,
        metadata: Arc<Metadata>,
    ) -> bool;

    /// The engine hit a fatal condition; the owner will detach it after
    /// the current event returns.
    fn engine_error(&mut self, reason: EngineError);

    /// The owner is draining toward shutdown: once the engine has
    /// nothing left to write it should report `EngineError::Done`.
    fn finishing(&self) -> bool;
}
