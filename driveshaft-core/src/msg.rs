//! Message frames.
//!
//! A [`Msg`] is one frame of a logical message. Short payloads live in
//! an inline buffer inside the frame itself; longer payloads live in a
//! reference-counted [`Bytes`] so frames can cross pipes and fan out to
//! many peers without copying. A logical message is a maximal run of
//! frames in which every frame but the last carries [`Msg::MORE`].

use bytes::Bytes;
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::config::MAX_VSM_SIZE;

/// Immutable per-connection properties attached to inbound messages
/// after the handshake (peer socket type, identity, mechanism extras).
#[derive(Debug, Default, Clone)]
pub struct Metadata {
    props: HashMap<String, Bytes>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Bytes) {
        self.props.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.props.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

#[derive(Clone)]
enum Payload {
    /// Short payloads copied inline, no allocation
    Inline(SmallVec<[u8; MAX_VSM_SIZE]>),
    /// Long payloads shared by refcount
    Shared(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Data,
    /// Synthetic end-of-stream marker used by pipe termination; never
    /// crosses the wire and never reaches the application.
    Delimiter,
}

/// A single message frame.
#[derive(Clone)]
pub struct Msg {
    payload: Payload,
    kind: Kind,
    flags: u8,
    routing_id: u32,
    metadata: Option<Arc<Metadata>>,
}

impl Msg {
    /// Another frame of the same logical message follows.
    pub const MORE: u8 = 0x01;
    /// Protocol command frame, not application data.
    pub const COMMAND: u8 = 0x02;
    /// Credential frame produced by a security mechanism.
    pub const CREDENTIAL: u8 = 0x20;
    /// Frame carries a routing id rather than a payload.
    pub const ROUTING_ID: u8 = 0x40;

    /// Create an empty data frame.
    #[must_use]
    pub fn new() -> Self {
        Self {
            payload: Payload::Inline(SmallVec::new()),
            kind: Kind::Data,
            flags: 0,
            routing_id: 0,
            metadata: None,
        }
    }

    /// Create a data frame from a byte slice, choosing inline or shared
    /// storage by size.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let payload = if data.len() <= MAX_VSM_SIZE {
            Payload::Inline(SmallVec::from_slice(data))
        } else {
            Payload::Shared(Bytes::copy_from_slice(data))
        };
        Self {
            payload,
            ..Self::new()
        }
    }

    /// Create a data frame that shares an existing buffer.
    #[must_use]
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            payload: Payload::Shared(data),
            ..Self::new()
        }
    }

    /// Create the synthetic delimiter frame.
    #[must_use]
    pub(crate) fn delimiter() -> Self {
        Self {
            kind: Kind::Delimiter,
            ..Self::new()
        }
    }

    #[must_use]
    pub(crate) fn is_delimiter(&self) -> bool {
        self.kind == Kind::Delimiter
    }

    /// Payload bytes of this frame.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Inline(v) => v,
            Payload::Shared(b) => b,
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Inline(v) => v.len(),
            Payload::Shared(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Extract the payload as a shared buffer, copying only if it was
    /// stored inline.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self.payload {
            Payload::Inline(v) => Bytes::copy_from_slice(&v),
            Payload::Shared(b) => b,
        }
    }

    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    pub fn reset_flags(&mut self, flags: u8) {
        self.flags &= !flags;
    }

    /// True when another frame of this logical message follows.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.flags & Self::MORE != 0
    }

    pub fn set_more(&mut self, more: bool) {
        if more {
            self.flags |= Self::MORE;
        } else {
            self.flags &= !Self::MORE;
        }
    }

    /// Builder-style variant of [`Msg::set_more`].
    #[must_use]
    pub fn with_more(mut self, more: bool) -> Self {
        self.set_more(more);
        self
    }

    #[must_use]
    pub const fn is_command(&self) -> bool {
        self.flags & Self::COMMAND != 0
    }

    #[must_use]
    pub const fn routing_id(&self) -> u32 {
        self.routing_id
    }

    pub fn set_routing_id(&mut self, id: u32) {
        self.routing_id = id;
    }

    /// Per-connection metadata stamped on inbound messages.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<Metadata>> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, metadata: Arc<Metadata>) {
        self.metadata = Some(metadata);
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("size", &self.size())
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .finish()
    }
}

impl From<Bytes> for Msg {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for Msg {
    fn from(data: Vec<u8>) -> Self {
        if data.len() <= MAX_VSM_SIZE {
            Self::from_slice(&data)
        } else {
            Self::from_bytes(Bytes::from(data))
        }
    }
}

impl From<&str> for Msg {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl From<&[u8]> for Msg {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.flags == other.flags && self.data() == other.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_vs_shared() {
        let small = Msg::from_slice(&[1u8; MAX_VSM_SIZE]);
        assert!(matches!(small.payload, Payload::Inline(_)));

        let large = Msg::from_slice(&[1u8; MAX_VSM_SIZE + 1]);
        assert!(matches!(large.payload, Payload::Shared(_)));

        assert_eq!(small.size(), MAX_VSM_SIZE);
        assert_eq!(large.size(), MAX_VSM_SIZE + 1);
    }

    #[test]
    fn test_more_flag() {
        let mut msg = Msg::from("part");
        assert!(!msg.has_more());
        msg.set_more(true);
        assert!(msg.has_more());
        msg.set_more(false);
        assert!(!msg.has_more());
    }

    #[test]
    fn test_delimiter_is_internal() {
        let d = Msg::delimiter();
        assert!(d.is_delimiter());
        assert_eq!(d.size(), 0);
        assert!(!Msg::new().is_delimiter());
    }

    #[test]
    fn test_shared_clone_is_cheap() {
        let data = Bytes::from(vec![7u8; 1024]);
        let msg = Msg::from_bytes(data.clone());
        let clone = msg.clone();
        assert_eq!(clone.data(), &data[..]);
    }

    #[test]
    fn test_metadata() {
        let mut meta = Metadata::new();
        meta.insert("Socket-Type", Bytes::from_static(b"DEALER"));
        let meta = Arc::new(meta);

        let mut msg = Msg::from("x");
        msg.set_metadata(meta);
        assert_eq!(
            msg.metadata().unwrap().get("Socket-Type").unwrap().as_ref(),
            b"DEALER"
        );
    }
}
