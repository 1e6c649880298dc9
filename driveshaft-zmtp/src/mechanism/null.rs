//! The NULL mechanism.
//!
//! No authentication, no encryption: each side sends one READY command
//! carrying its metadata (Socket-Type, optionally Identity) and
//! accepts the peer's. An ERROR command from the peer aborts the
//! handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use driveshaft_core::msg::{Metadata, Msg};
use driveshaft_core::socket_type::SocketType;

use crate::codec::ZmtpError;
use crate::mechanism::{require_command, Mechanism, MechanismStatus, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NullState {
    /// READY queued, waiting for the peer's.
    AwaitingReady,
    Ready,
    Error,
}

pub struct NullMechanism {
    #[allow(dead_code)]
    role: Role,
    state: NullState,
    pending_out: Option<Msg>,
    peer_socket_type: Option<SocketType>,
    peer_identity: Option<Bytes>,
    peer_metadata: Metadata,
}

impl NullMechanism {
    #[must_use]
    pub fn new(role: Role, socket_type: SocketType, routing_id: Option<&Bytes>) -> Self {
        // Both sides send READY eagerly; NULL has no ordering rules.
        let body = build_ready(socket_type, routing_id);
        let mut ready = Msg::from_bytes(body);
        ready.set_flags(Msg::COMMAND);
        Self {
            role,
            state: NullState::AwaitingReady,
            pending_out: Some(ready),
            peer_socket_type: None,
            peer_identity: None,
            peer_metadata: Metadata::new(),
        }
    }

    fn process_ready(&mut self, body: &[u8]) -> Result<(), ZmtpError> {
        let mut buf = body;
        while buf.has_remaining() {
            let name_len = buf.get_u8() as usize;
            if buf.remaining() < name_len + 4 {
                return Err(ZmtpError::BadHandshake);
            }
            let name = buf.copy_to_bytes(name_len);
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                return Err(ZmtpError::BadHandshake);
            }
            let value = buf.copy_to_bytes(value_len);

            match name.as_ref() {
                b"Socket-Type" => {
                    self.peer_socket_type = SocketType::from_wire(&value);
                    if self.peer_socket_type.is_none() {
                        return Err(ZmtpError::BadHandshake);
                    }
                    self.peer_metadata.insert("Socket-Type", value);
                }
                b"Identity" => {
                    self.peer_metadata.insert("Identity", value.clone());
                    self.peer_identity = Some(value);
                }
                other => {
                    // Unknown properties are carried, not rejected.
                    if let Ok(key) = std::str::from_utf8(other) {
                        self.peer_metadata.insert(key, value);
                    }
                }
            }
        }

        if self.peer_socket_type.is_none() {
            return Err(ZmtpError::BadHandshake);
        }
        self.state = NullState::Ready;
        Ok(())
    }
}

impl Mechanism for NullMechanism {
    fn name(&self) -> &'static str {
        "NULL"
    }

    fn process(&mut self, frame: &Msg) -> Result<(), ZmtpError> {
        require_command(frame)?;
        if self.state != NullState::AwaitingReady {
            return Err(ZmtpError::BadHandshake);
        }

        let (name, body) = split_command(frame.data()).ok_or(ZmtpError::BadHandshake)?;
        match name {
            b"READY" => self.process_ready(body),
            b"ERROR" => {
                self.state = NullState::Error;
                Ok(())
            }
            _ => Err(ZmtpError::BadHandshake),
        }
    }

    fn produce(&mut self) -> Option<Msg> {
        self.pending_out.take()
    }

    fn status(&self) -> MechanismStatus {
        match self.state {
            NullState::AwaitingReady => MechanismStatus::Handshaking,
            NullState::Ready => MechanismStatus::Ready,
            NullState::Error => MechanismStatus::Error,
        }
    }

    fn peer_socket_type(&self) -> Option<SocketType> {
        self.peer_socket_type
    }

    fn peer_identity(&self) -> Option<Bytes> {
        self.peer_identity.clone()
    }

    fn peer_metadata(&self) -> Metadata {
        self.peer_metadata.clone()
    }
}

/// Split a command body into its name and the property section.
fn split_command(body: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = body.split_first()?;
    let len = *len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Build a READY command body.
///
/// Grammar: one-byte name length, "READY", then properties of the form
/// one-byte name length, name, four-byte big-endian value length,
/// value.
fn build_ready(socket_type: SocketType, routing_id: Option<&Bytes>) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(5);
    body.extend_from_slice(b"READY");
    put_property(&mut body, "Socket-Type", socket_type.as_str().as_bytes());
    if let Some(id) = routing_id {
        put_property(&mut body, "Identity", id);
    }
    body.freeze()
}

#[inline]
fn put_property(dst: &mut BytesMut, name: &str, value: &[u8]) {
    dst.put_u8(name.len() as u8);
    dst.extend_from_slice(name.as_bytes());
    dst.put_u32(value.len() as u32);
    dst.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> (NullMechanism, NullMechanism) {
        (
            NullMechanism::new(Role::Client, SocketType::Dealer, None),
            NullMechanism::new(
                Role::Server,
                SocketType::Router,
                Some(&Bytes::from_static(b"server-1")),
            ),
        )
    }

    #[test]
    fn test_mutual_ready() {
        let (mut client, mut server) = handshake_pair();
        assert_eq!(client.status(), MechanismStatus::Handshaking);

        let client_ready = client.produce().unwrap();
        let server_ready = server.produce().unwrap();
        assert!(client_ready.is_command());

        server.process(&client_ready).unwrap();
        client.process(&server_ready).unwrap();

        assert_eq!(client.status(), MechanismStatus::Ready);
        assert_eq!(server.status(), MechanismStatus::Ready);
        assert_eq!(client.peer_socket_type(), Some(SocketType::Router));
        assert_eq!(server.peer_socket_type(), Some(SocketType::Dealer));
        assert_eq!(
            client.peer_identity().unwrap().as_ref(),
            b"server-1"
        );
        assert!(server.peer_identity().is_none());
    }

    #[test]
    fn test_metadata_carries_properties() {
        let (mut client, mut server) = handshake_pair();
        let ready = server.produce().unwrap();
        client.process(&ready).unwrap();
        let meta = client.peer_metadata();
        assert_eq!(meta.get("Socket-Type").unwrap().as_ref(), b"ROUTER");
        assert_eq!(meta.get("Identity").unwrap().as_ref(), b"server-1");
    }

    #[test]
    fn test_data_frame_during_handshake_is_violation() {
        let (mut client, _) = handshake_pair();
        let data = Msg::from("not a command");
        assert!(client.process(&data).is_err());
    }

    #[test]
    fn test_error_command_aborts() {
        let (mut client, _) = handshake_pair();
        let mut body = BytesMut::new();
        body.put_u8(5);
        body.extend_from_slice(b"ERROR");
        let mut frame = Msg::from_bytes(body.freeze());
        frame.set_flags(Msg::COMMAND);
        client.process(&frame).unwrap();
        assert_eq!(client.status(), MechanismStatus::Error);
    }

    #[test]
    fn test_missing_socket_type_rejected() {
        let (mut client, _) = handshake_pair();
        let mut body = BytesMut::new();
        body.put_u8(5);
        body.extend_from_slice(b"READY");
        let mut frame = Msg::from_bytes(body.freeze());
        frame.set_flags(Msg::COMMAND);
        assert!(client.process(&frame).is_err());
    }

    #[test]
    fn test_garbage_command_rejected() {
        let (mut client, _) = handshake_pair();
        let mut frame = Msg::from_bytes(Bytes::from_static(&[200, 1, 2]));
        frame.set_flags(Msg::COMMAND);
        assert!(client.process(&frame).is_err());
    }
}
