//! Prefix subscriptions for the publish/subscribe patterns.
//!
//! Subscriptions travel as single-frame messages: a 0x01 or 0x00 lead
//! byte (subscribe / unsubscribe) followed by the topic prefix.
//! Matching is prefix matching; the empty prefix matches everything.

use bytes::{BufMut, Bytes, BytesMut};

use driveshaft_core::msg::Msg;

/// A set of prefix subscriptions with duplicate counting.
///
/// Counting matters on the publisher side: two subscribers of the same
/// prefix must keep the subscription alive until both have left.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    entries: Vec<(Bytes, u32)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one subscription. Returns true when the prefix is new.
    pub fn subscribe(&mut self, prefix: Bytes) -> bool {
        for (existing, count) in &mut self.entries {
            if *existing == prefix {
                *count += 1;
                return false;
            }
        }
        self.entries.push((prefix, 1));
        true
    }

    /// Drop one subscription. Returns true when the prefix is gone.
    pub fn unsubscribe(&mut self, prefix: &[u8]) -> bool {
        for (i, (existing, count)) in self.entries.iter_mut().enumerate() {
            if existing.as_ref() == prefix {
                *count -= 1;
                if *count == 0 {
                    self.entries.swap_remove(i);
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Does any subscription match this topic?
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.entries
            .iter()
            .any(|(prefix, _)| topic.starts_with(prefix.as_ref()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate the distinct prefixes.
    pub fn prefixes(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.iter().map(|(prefix, _)| prefix)
    }
}

/// Decoded subscription control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubscriptionEvent {
    Subscribe(Bytes),
    Unsubscribe(Bytes),
}

impl SubscriptionEvent {
    /// Parse a subscription message body.
    #[must_use]
    pub fn parse(body: &[u8]) -> Option<Self> {
        let (lead, prefix) = body.split_first()?;
        let prefix = Bytes::copy_from_slice(prefix);
        match lead {
            0x01 => Some(Self::Subscribe(prefix)),
            0x00 => Some(Self::Unsubscribe(prefix)),
            _ => None,
        }
    }

    /// Encode as a message frame.
    #[must_use]
    pub fn to_msg(&self) -> Msg {
        let (lead, prefix) = match self {
            Self::Subscribe(p) => (0x01u8, p),
            Self::Unsubscribe(p) => (0x00u8, p),
        };
        let mut body = BytesMut::with_capacity(1 + prefix.len());
        body.put_u8(lead);
        body.extend_from_slice(prefix);
        Msg::from_bytes(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matching() {
        let mut subs = Subscriptions::new();
        assert!(!subs.matches(b"10001 22 58"));

        assert!(subs.subscribe(Bytes::from_static(b"10001 ")));
        assert!(subs.matches(b"10001 22 58"));
        assert!(!subs.matches(b"10002 20 60"));
        assert!(!subs.matches(b"1000"));
    }

    #[test]
    fn test_empty_prefix_matches_all() {
        let mut subs = Subscriptions::new();
        subs.subscribe(Bytes::new());
        assert!(subs.matches(b"anything"));
        assert!(subs.matches(b""));
    }

    #[test]
    fn test_duplicate_counting() {
        let mut subs = Subscriptions::new();
        assert!(subs.subscribe(Bytes::from_static(b"a")));
        assert!(!subs.subscribe(Bytes::from_static(b"a")));
        assert!(!subs.unsubscribe(b"a"));
        assert!(subs.matches(b"abc"));
        assert!(subs.unsubscribe(b"a"));
        assert!(!subs.matches(b"abc"));
    }

    #[test]
    fn test_event_round_trip() {
        let event = SubscriptionEvent::Subscribe(Bytes::from_static(b"topic"));
        let msg = event.to_msg();
        assert_eq!(msg.data()[0], 0x01);
        assert_eq!(SubscriptionEvent::parse(msg.data()), Some(event));

        let event = SubscriptionEvent::Unsubscribe(Bytes::from_static(b"topic"));
        assert_eq!(
            SubscriptionEvent::parse(event.to_msg().data()),
            Some(event)
        );
    }

    #[test]
    fn test_bad_lead_byte() {
        assert_eq!(SubscriptionEvent::parse(&[0x02, b'x']), None);
        assert_eq!(SubscriptionEvent::parse(&[]), None);
    }
}
