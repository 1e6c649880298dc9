//! Security mechanism seam.
//!
//! Between the greeting and the first data frame, the stream engine
//! hands every command frame to a [`Mechanism`] and writes out
//! whatever command frames the mechanism wants sent, until the
//! mechanism reports [`MechanismStatus::Ready`] (or errors out). The
//! engine does not interpret the commands; the mechanism owns the
//! whole exchange, including the peer properties it distils for the
//! session.
//!
//! Only NULL ships here. Authenticating/encrypting mechanisms plug in
//! through the same trait.

pub mod null;

use bytes::Bytes;

use driveshaft_core::msg::{Metadata, Msg};
use driveshaft_core::socket_type::SocketType;

use crate::codec::ZmtpError;

/// Handshake role, as announced in the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
    /// More command frames must flow.
    Handshaking,
    /// Handshake complete; switch to data framing.
    Ready,
    /// Handshake failed; reset the connection.
    Error,
}

/// One security mechanism driving one connection's handshake.
pub trait Mechanism: Send {
    /// Mechanism name as it appears in the greeting.
    fn name(&self) -> &'static str;

    /// Feed one inbound handshake command frame.
    fn process(&mut self, frame: &Msg) -> Result<(), ZmtpError>;

    /// Next outbound handshake command frame, if one is pending.
    fn produce(&mut self) -> Option<Msg>;

    fn status(&self) -> MechanismStatus;

    /// Peer socket type announced during the handshake.
    fn peer_socket_type(&self) -> Option<SocketType>;

    /// Peer identity announced during the handshake.
    fn peer_identity(&self) -> Option<Bytes>;

    /// All peer properties, for stamping onto inbound messages.
    fn peer_metadata(&self) -> Metadata;
}

/// During the handshake only command frames are legal.
#[inline]
pub fn require_command(frame: &Msg) -> Result<(), ZmtpError> {
    if frame.is_command() {
        Ok(())
    } else {
        Err(ZmtpError::BadHandshake)
    }
}
