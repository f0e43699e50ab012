//! Packet buffers.
//!
//! A [`Packet`] is a cheap-clone handle over immutable captured bytes.
//! Every decoder layer shares the same backing storage; layer payloads are
//! zero-copy slices. The storage is freed when the last handle is dropped.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::proto::Protocol;

/// Capture time in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_duration(since_epoch)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub fn from_duration(since_epoch: Duration) -> Self {
        Self(u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_sub(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Identifies the input a packet was acquired from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InputId(pub u32);

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input{}", self.0)
    }
}

/// Link-layer framing of captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Ethernet,
    /// PPP with HDLC-like address/control bytes.
    Ppp,
    /// Raw IPv4 without link header.
    Ipv4,
}

impl LinkType {
    /// The first decoder a packet of this link type goes through.
    pub fn first_protocol(self) -> Protocol {
        match self {
            LinkType::Ethernet => Protocol::Ethernet,
            LinkType::Ppp => Protocol::Ppp,
            LinkType::Ipv4 => Protocol::Ipv4,
        }
    }
}

#[derive(Debug)]
struct PacketData {
    data: Bytes,
    timestamp: Timestamp,
    input: InputId,
    link: LinkType,
}

/// A captured packet shared by every component that processes it.
#[derive(Debug, Clone)]
pub struct Packet {
    inner: Arc<PacketData>,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, timestamp: Timestamp, input: InputId, link: LinkType) -> Self {
        Self {
            inner: Arc::new(PacketData {
                data: data.into(),
                timestamp,
                input,
                link,
            }),
        }
    }

    /// The captured bytes.
    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.inner.timestamp
    }

    pub fn input(&self) -> InputId {
        self.inner.input
    }

    pub fn link(&self) -> LinkType {
        self.inner.link
    }

    /// Number of live handles to this packet.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_storage() {
        let packet = Packet::new(
            vec![1u8, 2, 3, 4],
            Timestamp::from_millis(5),
            InputId(1),
            LinkType::Ethernet,
        );
        assert_eq!(packet.holders(), 1);

        let other = packet.clone();
        assert_eq!(packet.holders(), 2);
        assert_eq!(other.data().as_ptr(), packet.data().as_ptr());

        drop(other);
        assert_eq!(packet.holders(), 1);
    }

    #[test]
    fn test_slice_keeps_bytes_alive() {
        let packet = Packet::new(
            vec![9u8; 32],
            Timestamp::ZERO,
            InputId(0),
            LinkType::Ipv4,
        );
        let tail = packet.data().slice(16..);
        drop(packet);
        assert_eq!(tail.len(), 16);
        assert!(tail.iter().all(|b| *b == 9));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1_000);
        assert_eq!((ts + Duration::from_millis(10)).as_micros(), 1_010_000);
        assert_eq!(ts - Duration::from_secs(5), Timestamp::ZERO);
        assert_eq!(
            Timestamp::from_millis(1_010).duration_since(ts),
            Duration::from_millis(10)
        );
        assert_eq!(ts.to_string(), "1.000000");
    }

    #[test]
    fn test_link_first_protocol() {
        assert_eq!(LinkType::Ethernet.first_protocol(), Protocol::Ethernet);
        assert_eq!(LinkType::Ppp.first_protocol(), Protocol::Ppp);
        assert_eq!(LinkType::Ipv4.first_protocol(), Protocol::Ipv4);
    }
}
