//! # Core Transport Types (RFC 8999, RFC 9000)
//!
//! Fundamental identifiers, the packet-number-space model, and the time
//! abstraction shared by every subsystem. Time is always a value handed in by
//! the driver; the core never reads a clock.

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::time::Duration;

// ============================================================================
// Connection ID (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000).
pub const MAX_CID_LENGTH: usize = 20;

/// Minimum length of the client-chosen initial destination connection ID.
///
/// Initial packets carrying a shorter DCID are dropped before any state is
/// created (RFC 9000 Section 7.2).
pub const DEFAULT_CONNECTION_ID_SIZE: usize = 8;

/// Connection ID - opaque byte sequence chosen by an endpoint.
///
/// Zero-length CIDs are permitted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes.
    ///
    /// Returns None if length exceeds [`MAX_CID_LENGTH`].
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Create an empty (zero-length) connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({:02x?})", &self.bytes[..])
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 128-bit stateless reset token handed to the peer (RFC 9000 Section 10.3).
pub type StatelessResetToken = [u8; 16];

// ============================================================================
// QUIC Version
// ============================================================================

/// QUIC version number (RFC 8999 Section 5.2).
///
/// Sticky on a connection after the first valid long-header packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicVersion {
    /// 0x00000000 - reserved for version negotiation packets.
    VersionNegotiation,
    /// The IETF draft variant this implementation still accepts.
    Draft29,
    /// QUIC v1 (RFC 9000).
    V1,
    /// Private experimental version used for staged feature rollout.
    Experimental,
    /// Anything else on the wire.
    Unknown(u32),
}

impl QuicVersion {
    pub const EXPERIMENTAL_WIRE: u32 = 0x4558_5001;

    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0x0000_0000 => QuicVersion::VersionNegotiation,
            0xff00_001d => QuicVersion::Draft29,
            0x0000_0001 => QuicVersion::V1,
            Self::EXPERIMENTAL_WIRE => QuicVersion::Experimental,
            other => QuicVersion::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            QuicVersion::VersionNegotiation => 0x0000_0000,
            QuicVersion::Draft29 => 0xff00_001d,
            QuicVersion::V1 => 0x0000_0001,
            QuicVersion::Experimental => Self::EXPERIMENTAL_WIRE,
            QuicVersion::Unknown(other) => other,
        }
    }
}

// ============================================================================
// Packet Numbers and Spaces (RFC 9000 Section 12.3)
// ============================================================================

/// Packet number - monotonically increasing per packet number space.
pub type PacketNumber = u64;

/// Maximum packet number value (2^62 - 1).
///
/// Reaching `MAX_PACKET_NUMBER - 1` in any space forces the connection to
/// close rather than wrap.
pub const MAX_PACKET_NUMBER: PacketNumber = (1u64 << 62) - 1;

/// Packet number space. Each space has independent packet numbers and a
/// separate ack context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    AppData,
}

impl PacketNumberSpace {
    pub const ALL: [PacketNumberSpace; 3] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::AppData,
    ];

    pub fn index(self) -> usize {
        match self {
            PacketNumberSpace::Initial => 0,
            PacketNumberSpace::Handshake => 1,
            PacketNumberSpace::AppData => 2,
        }
    }
}

/// Packet protection type, as recovered by the codec from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionType {
    Initial,
    Handshake,
    ZeroRtt,
    KeyPhaseZero,
    KeyPhaseOne,
}

impl ProtectionType {
    pub fn packet_number_space(self) -> PacketNumberSpace {
        match self {
            ProtectionType::Initial => PacketNumberSpace::Initial,
            ProtectionType::Handshake => PacketNumberSpace::Handshake,
            ProtectionType::ZeroRtt
            | ProtectionType::KeyPhaseZero
            | ProtectionType::KeyPhaseOne => PacketNumberSpace::AppData,
        }
    }

    pub fn encryption_level(self) -> EncryptionLevel {
        match self {
            ProtectionType::Initial => EncryptionLevel::Initial,
            ProtectionType::Handshake => EncryptionLevel::Handshake,
            ProtectionType::ZeroRtt => EncryptionLevel::EarlyData,
            ProtectionType::KeyPhaseZero | ProtectionType::KeyPhaseOne => EncryptionLevel::AppData,
        }
    }
}

/// Encryption level a packet or crypto stream belongs to (RFC 9001).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    EarlyData,
    AppData,
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream ID. The two least significant bits encode initiator and direction:
/// bit 0 is the initiator (0=client, 1=server), bit 1 the direction
/// (0=bidirectional, 1=unidirectional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Distance between consecutive stream ids of the same type.
pub const STREAM_INCREMENT: u64 = 4;

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_client_initiated(self) -> bool {
        self.0 & 0x01 == 0
    }

    pub fn is_server_initiated(self) -> bool {
        self.0 & 0x01 == 1
    }

    pub fn is_bidirectional(self) -> bool {
        self.0 & 0x02 == 0
    }

    pub fn is_unidirectional(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// A remote stream from the server's point of view: client-initiated.
    pub fn is_remote_for_server(self) -> bool {
        self.is_client_initiated()
    }

    /// On the server, a stream whose receive direction belongs to us:
    /// client-initiated bidi, or client-initiated uni.
    pub fn is_receiving_stream_for_server(self) -> bool {
        self.is_client_initiated() && self.is_unidirectional()
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper bound on any MAX_STREAMS value (RFC 9000 Section 4.6: 2^60).
pub const MAX_MAX_STREAMS: u64 = 1u64 << 60;

// ============================================================================
// Time Abstraction
// ============================================================================

/// Monotonic timestamp value.
///
/// The driver supplies the clock; the core only compares and adds. This keeps
/// every state transition deterministic under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self { nanos: micros.saturating_mul(1_000) }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Duration since another instant. Returns None if `other` is later.
    pub fn duration_since(&self, other: Instant) -> Option<Duration> {
        if self.nanos >= other.nanos {
            Some(Duration::from_nanos(self.nanos - other.nanos))
        } else {
            None
        }
    }

    /// Duration since another instant, zero if `other` is later.
    pub fn saturating_duration_since(&self, other: Instant) -> Duration {
        self.duration_since(other).unwrap_or(Duration::ZERO)
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        let nanos = duration.as_nanos();
        if nanos > u64::MAX as u128 {
            return None;
        }
        self.nanos.checked_add(nanos as u64).map(|n| Instant { nanos: n })
    }
}

// ============================================================================
// Protocol Constants
// ============================================================================

/// Coalesced-packet processing cap per UDP datagram.
pub const MAX_NUM_COALESCED_PACKETS: usize = 16;

/// Default UDP send packet length before PMTU discovery raises it.
pub const DEFAULT_UDP_SEND_PACKET_LEN: u64 = 1252;

/// Default upper bound on UDP payloads we are willing to receive.
pub const DEFAULT_MAX_UDP_PAYLOAD: u64 = 1452;

/// Smallest max_udp_payload_size a peer may advertise (RFC 9000 Section 18.2).
pub const MIN_MAX_UDP_PAYLOAD: u64 = 1200;

/// max_ack_delay values at or above 2^14 ms are invalid (RFC 9000 Section 18.2).
pub const MAX_ACK_DELAY_MS: u64 = 1 << 14;

/// Largest valid ack_delay_exponent (RFC 9000 Section 18.2).
pub const MAX_ACK_DELAY_EXPONENT: u64 = 20;

/// Default ack_delay_exponent when the peer omits it.
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

/// Hard clamp on any negotiated idle timeout.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default active_connection_id_limit when the peer omits it.
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// A max_datagram_frame_size at or below this cannot fit any payload.
pub const MAX_DATAGRAM_PACKET_OVERHEAD: u64 = 10;

/// Hard cap on peer address migrations for one connection.
pub const MAX_NUM_MIGRATIONS_ALLOWED: u32 = 6;

/// How long a saved congestion/RTT snapshot remains recoverable after the
/// peer moves away from an address.
pub const TIME_TO_RETAIN_LAST_CONGESTION_AND_RTT_STATE: Duration = Duration::from_secs(60);

/// Source addresses remembered in an address-validation token.
pub const MAX_NUM_TOKEN_SOURCE_ADDRESSES: usize = 3;

/// Lowest-urgency priority level; level 0 is the highest priority.
pub const DEFAULT_MAX_PRIORITY: u8 = 7;

/// D6D raise timeouts below this are rejected.
pub const MIN_D6D_RAISE_TIMEOUT: Duration = Duration::from_secs(30);

/// D6D probe timeouts below this are rejected.
pub const MIN_D6D_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_bounds() {
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; 21]).is_none());
        assert!(ConnectionId::empty().is_empty());
    }

    #[test]
    fn test_stream_id_predicates() {
        // 0: client bidi, 1: server bidi, 2: client uni, 3: server uni
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(0).is_bidirectional());
        assert!(StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_unidirectional());
        assert!(StreamId(2).is_receiving_stream_for_server());
        assert!(!StreamId(0).is_receiving_stream_for_server());
        assert!(StreamId(3).is_server_initiated());
    }

    #[test]
    fn test_protection_type_space_mapping() {
        assert_eq!(
            ProtectionType::Initial.packet_number_space(),
            PacketNumberSpace::Initial
        );
        assert_eq!(
            ProtectionType::ZeroRtt.packet_number_space(),
            PacketNumberSpace::AppData
        );
        assert_eq!(
            ProtectionType::KeyPhaseOne.packet_number_space(),
            PacketNumberSpace::AppData
        );
        assert_eq!(
            ProtectionType::ZeroRtt.encryption_level(),
            EncryptionLevel::EarlyData
        );
    }

    #[test]
    fn test_version_round_trip() {
        for raw in [0u32, 1, 0xff00_001d, QuicVersion::EXPERIMENTAL_WIRE, 0xdead_beef] {
            assert_eq!(QuicVersion::from_wire(raw).to_wire(), raw);
        }
    }

    #[test]
    fn test_instant_arithmetic() {
        let a = Instant::from_nanos(1_000);
        let b = Instant::from_nanos(4_000);
        assert_eq!(b.duration_since(a), Some(Duration::from_nanos(3_000)));
        assert_eq!(a.duration_since(b), None);
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert_eq!(
            a.checked_add(Duration::from_nanos(500)),
            Some(Instant::from_nanos(1_500))
        );
    }
}
