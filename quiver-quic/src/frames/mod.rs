//! # Frame Model (RFC 9000 Section 12.4, 19)
//!
//! Read-side frames are produced by the codec and dispatched by the server
//! state machine; write-side [`SentFrame`] records travel with each
//! outstanding packet so ack processing can release per-frame bookkeeping.

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::time::Duration;

use crate::types::{ConnectionId, EncryptionLevel, PacketNumber, StatelessResetToken, StreamId};

// ============================================================================
// Read frames
// ============================================================================

/// One acknowledged packet-number range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub start: PacketNumber,
    pub end: PacketNumber,
}

/// ACK frame as decoded by the codec. Blocks are ordered descending; the
/// first block ends at `largest_acked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acked: PacketNumber,
    /// Ack delay already scaled by the peer's ack_delay_exponent.
    pub ack_delay: Duration,
    pub blocks: Vec<AckBlock>,
}

impl AckFrame {
    /// Blocks in ascending packet-number order, for log traversal.
    pub fn blocks_ascending(&self) -> impl Iterator<Item = AckBlock> + '_ {
        self.blocks.iter().rev().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub stream_limit: u64,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub stream_limit: u64,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,
    pub reason_phrase: String,
    /// True for the application-close variant (0x1d).
    pub application_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramFrame {
    pub data: Bytes,
}

/// Umbrella for the small control frames that share one retransmission queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimpleFrame {
    PathChallenge(u64),
    PathResponse(u64),
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    NewToken(Bytes),
    HandshakeDone,
}

impl SimpleFrame {
    /// Probing frames may be sent from a new path without constituting a
    /// migration (RFC 9000 Section 9.1).
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            SimpleFrame::PathChallenge(_)
                | SimpleFrame::PathResponse(_)
                | SimpleFrame::NewConnectionId { .. }
        )
    }
}

/// Decoded frame, as handed over by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack(AckFrame),
    RstStream(RstStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    Stream(StreamFrame),
    MaxData(u64),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked {
        data_limit: u64,
    },
    StreamDataBlocked {
        stream_id: StreamId,
        data_limit: u64,
    },
    StreamsBlocked(StreamsBlockedFrame),
    ConnectionClose(ConnectionCloseFrame),
    Datagram(DatagramFrame),
    Simple(SimpleFrame),
}

impl Frame {
    /// Frames allowed in packets below the AppData encryption level.
    pub fn allowed_before_app_data(&self) -> bool {
        matches!(
            self,
            Frame::Padding
                | Frame::Ack(_)
                | Frame::ConnectionClose(_)
                | Frame::Crypto(_)
                | Frame::Ping
        )
    }

    pub fn is_probing(&self) -> bool {
        match self {
            Frame::Padding => true,
            Frame::Simple(simple) => simple.is_probing(),
            _ => false,
        }
    }
}

// ============================================================================
// Sent-frame records
// ============================================================================

/// Metadata for a frame that went into an outstanding packet. Ack processing
/// visits these to release retransmission bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Stream {
        stream_id: StreamId,
        offset: u64,
        len: u64,
        fin: bool,
    },
    Crypto {
        level: EncryptionLevel,
        offset: u64,
        len: u64,
    },
    /// An ACK we sent; `largest_acked` is the top of its first block.
    Ack {
        largest_acked: PacketNumber,
    },
    RstStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: StreamId,
        maximum_data: u64,
    },
    MaxStreams {
        stream_limit: u64,
        bidirectional: bool,
    },
    Ping,
    Simple(SimpleFrame),
}
