//! Error taxonomy for the transport core.
//!
//! Three families, with different propagation rules:
//! - [`TransportError`] unwinds datagram processing and is translated to an
//!   outbound CONNECTION_CLOSE by the outer driver.
//! - [`LocalError`] is an API-level result from the stream manager, never
//!   peer-visible by itself.
//! - [`PacketDropReason`] never unwinds; drops are counted and logged.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Peer-visible transport error codes (RFC 9000 Section 20.1 subset used by
/// the server core).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// No error (0x00). Used on the wire when we close in response to a peer
    /// close; never a processing failure by itself.
    #[error("no error")]
    NoError,

    #[error("internal error")]
    InternalError,

    #[error("flow control error")]
    FlowControlError,

    #[error("stream limit error")]
    StreamLimitError,

    #[error("stream state error")]
    StreamStateError,

    #[error("final size error")]
    FinalSizeError,

    #[error("transport parameter error")]
    TransportParameterError,

    #[error("protocol violation")]
    ProtocolViolation,

    #[error("invalid migration")]
    InvalidMigration,

    #[error("crypto error")]
    CryptoError,
}

impl TransportErrorCode {
    pub fn to_wire(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidMigration => 0x0c,
            TransportErrorCode::CryptoError => 0x0100,
        }
    }
}

/// A transport error with the human-readable reason phrase that goes into the
/// CONNECTION_CLOSE frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {reason}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }
}

/// API-level errors surfaced to the caller by the stream manager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LocalError {
    #[error("no error")]
    NoError,

    #[error("creating existing stream")]
    CreatingExistingStream,

    #[error("stream limit exceeded")]
    StreamLimitExceeded,
}

/// Telemetry-only reasons a packet was dropped without unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketDropReason {
    ParseError,
    CipherUnavailable,
    MaxBuffered,
    BufferUnavailable,
    UnexpectedProtectionLevel,
    NoData,
    ServerStateClosed,
    InvalidPacket,
    InitialConnidSmall,
    PeerAddressChange,
    Retry,
    Reset,
    TransportParameterError,
    ProtocolViolation,
}

impl PacketDropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketDropReason::ParseError => "PARSE_ERROR",
            PacketDropReason::CipherUnavailable => "CIPHER_UNAVAILABLE",
            PacketDropReason::MaxBuffered => "MAX_BUFFERED",
            PacketDropReason::BufferUnavailable => "BUFFER_UNAVAILABLE",
            PacketDropReason::UnexpectedProtectionLevel => "UNEXPECTED_PROTECTION_LEVEL",
            PacketDropReason::NoData => "NO_DATA",
            PacketDropReason::ServerStateClosed => "SERVER_STATE_CLOSED",
            PacketDropReason::InvalidPacket => "INVALID_PACKET",
            PacketDropReason::InitialConnidSmall => "INITIAL_CONNID_SMALL",
            PacketDropReason::PeerAddressChange => "PEER_ADDRESS_CHANGE",
            PacketDropReason::Retry => "RETRY",
            PacketDropReason::Reset => "RESET",
            PacketDropReason::TransportParameterError => "TRANSPORT_PARAMETER_ERROR",
            PacketDropReason::ProtocolViolation => "PROTOCOL_VIOLATION",
        }
    }
}

impl core::fmt::Display for PacketDropReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_codes() {
        assert_eq!(TransportErrorCode::NoError.to_wire(), 0x00);
        assert_eq!(TransportErrorCode::ProtocolViolation.to_wire(), 0x0a);
        assert_eq!(TransportErrorCode::InvalidMigration.to_wire(), 0x0c);
        assert_eq!(TransportErrorCode::CryptoError.to_wire(), 0x0100);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(
            TransportErrorCode::InvalidMigration,
            "Migration not allowed during handshake",
        );
        assert_eq!(
            err.to_string(),
            "invalid migration: Migration not allowed during handshake"
        );
    }
}
