//! # Stream State (RFC 9000 Sections 2, 3)
//!
//! Per-stream send/receive state machines, priority, flow-control fields,
//! and head-of-line-blocking accounting. The collection-level logic lives in
//! [`manager`].

#![forbid(unsafe_code)]

pub mod buffer;
pub mod manager;
pub mod priority;

use core::time::Duration;

use bytes::Bytes;

use crate::error::{TransportError, TransportErrorCode};
use crate::types::{Instant, StreamId, DEFAULT_MAX_PRIORITY};

pub use buffer::ReceiveBuffer;
pub use manager::StreamManager;
pub use priority::PriorityQueue;

// ============================================================================
// Stream states
// ============================================================================

/// Sending-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSendState {
    Open,
    ResetSent,
    Closed,
    /// Receive-only stream; the send side does not exist.
    Invalid,
}

/// Receiving-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecvState {
    Open,
    ResetRecvd,
    Closed,
    /// Send-only stream; the receive side does not exist.
    Invalid,
}

/// Stream priority: urgency level in `0..=DEFAULT_MAX_PRIORITY` (lower is
/// more urgent) plus the incremental flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub level: u8,
    pub incremental: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self { level: DEFAULT_MAX_PRIORITY / 2 + 1, incremental: false }
    }
}

/// Per-stream flow control.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlowControl {
    /// Send limit granted by the peer.
    pub peer_advertised_max_offset: u64,
    /// Receive limit we advertised.
    pub advertised_max_offset: u64,
    /// Receive window size.
    pub window_size: u64,
}

/// A loss-buffer entry: stream bytes declared lost, awaiting rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossBufferMeta {
    pub offset: u64,
    pub len: u64,
    pub fin: bool,
}

/// Meta-only write range handed to a delegated sender (no payload owned by
/// the transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteBufferMeta {
    pub offset: u64,
    pub length: u64,
    pub eof: bool,
}

/// Full per-stream record. Allocated lazily by the manager.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,
    pub send_state: StreamSendState,
    pub recv_state: StreamRecvState,
    pub priority: StreamPriority,
    pub is_control: bool,

    // Receive side.
    pub current_read_offset: u64,
    pub max_offset_observed: u64,
    pub final_read_offset: Option<u64>,
    pub read_buffer: ReceiveBuffer,
    pub stream_read_error: Option<u64>,

    // Send side.
    pub current_write_offset: u64,
    pub pending_writes: Vec<Bytes>,
    pub pending_write_fin: bool,
    pub loss_buffer: Vec<LossBufferMeta>,
    pub dsr_buf_meta: Option<WriteBufferMeta>,
    pub loss_buf_metas: Vec<WriteBufferMeta>,
    pub stream_write_error: Option<u64>,

    pub flow_control: StreamFlowControl,

    // Head-of-line blocking accounting.
    pub last_holb_time: Option<Instant>,
    pub holb_count: u64,
    pub total_holb_time: Duration,
}

impl StreamState {
    pub fn new(id: StreamId) -> Self {
        let (send_state, recv_state) = if id.is_bidirectional() {
            (StreamSendState::Open, StreamRecvState::Open)
        } else if id.is_server_initiated() {
            // Our unidirectional stream: send only.
            (StreamSendState::Open, StreamRecvState::Invalid)
        } else {
            // Peer's unidirectional stream: receive only.
            (StreamSendState::Invalid, StreamRecvState::Open)
        };
        Self {
            id,
            send_state,
            recv_state,
            priority: StreamPriority::default(),
            is_control: false,
            current_read_offset: 0,
            max_offset_observed: 0,
            final_read_offset: None,
            read_buffer: ReceiveBuffer::new(),
            stream_read_error: None,
            current_write_offset: 0,
            pending_writes: Vec::new(),
            pending_write_fin: false,
            loss_buffer: Vec::new(),
            dsr_buf_meta: None,
            loss_buf_metas: Vec::new(),
            stream_write_error: None,
            flow_control: StreamFlowControl::default(),
            last_holb_time: None,
            holb_count: 0,
            total_holb_time: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub fn new_with_windows(id: StreamId, recv_window: u64, peer_max: u64) -> Self {
        let mut stream = Self::new(id);
        stream.flow_control = StreamFlowControl {
            peer_advertised_max_offset: peer_max,
            advertised_max_offset: recv_window,
            window_size: recv_window,
        };
        stream
    }

    /// Removal precondition: both halves closed.
    pub fn in_terminal_states(&self) -> bool {
        let send_done = matches!(
            self.send_state,
            StreamSendState::Closed | StreamSendState::Invalid
        );
        let recv_done = matches!(
            self.recv_state,
            StreamRecvState::Closed | StreamRecvState::Invalid
        );
        send_done && recv_done
    }

    /// Contiguous data (or a terminal signal) is available to read.
    pub fn has_readable_data(&self) -> bool {
        self.read_buffer.has_data_at(self.current_read_offset)
            || self
                .final_read_offset
                .is_some_and(|fin| fin == self.current_read_offset
                    && self.recv_state == StreamRecvState::Open)
    }

    /// Anything buffered, contiguous or not.
    pub fn has_peekable_data(&self) -> bool {
        !self.read_buffer.is_empty()
    }

    pub fn has_writable_data(&self) -> bool {
        if self.pending_writes.is_empty() && !self.pending_write_fin {
            return false;
        }
        self.current_write_offset < self.flow_control.peer_advertised_max_offset
            || (self.pending_writes.is_empty() && self.pending_write_fin)
    }

    pub fn has_writable_buf_meta(&self) -> bool {
        self.dsr_buf_meta
            .is_some_and(|meta| meta.length > 0 || meta.eof)
    }
}

// ============================================================================
// Receive-side handlers
// ============================================================================

/// Apply a received STREAM frame to the stream's receive machinery.
///
/// Flow-control accounting happens in the caller (it owns the connection
/// window); this handles offsets, the final-size checks, and the buffer.
pub fn receive_stream_frame(
    stream: &mut StreamState,
    offset: u64,
    data: Bytes,
    fin: bool,
) -> Result<(), TransportError> {
    if stream.recv_state != StreamRecvState::Open {
        // Data for an already reset or closed receive side is ignored.
        return Ok(());
    }
    let frame_end = offset + data.len() as u64;
    if let Some(final_offset) = stream.final_read_offset {
        if frame_end > final_offset || (fin && frame_end != final_offset) {
            return Err(TransportError::new(
                TransportErrorCode::FinalSizeError,
                format!("Stream {} data beyond final size", stream.id),
            ));
        }
    }
    if fin {
        if frame_end < stream.max_offset_observed {
            return Err(TransportError::new(
                TransportErrorCode::FinalSizeError,
                format!("Stream {} final size below observed data", stream.id),
            ));
        }
        stream.final_read_offset = Some(frame_end);
    }
    stream.read_buffer.insert(offset, data);
    Ok(())
}

/// Apply a received RESET_STREAM to the stream.
pub fn receive_rst_stream(
    stream: &mut StreamState,
    error_code: u64,
    final_size: u64,
) -> Result<(), TransportError> {
    if final_size < stream.max_offset_observed {
        return Err(TransportError::new(
            TransportErrorCode::FinalSizeError,
            format!("Stream {} reset below observed data", stream.id),
        ));
    }
    if matches!(stream.recv_state, StreamRecvState::Closed) {
        return Ok(());
    }
    stream.recv_state = StreamRecvState::ResetRecvd;
    stream.stream_read_error = Some(error_code);
    stream.final_read_offset = Some(final_size);
    // Buffered data is never delivered past a reset; a HOL-blocked reader
    // unblocks through the error instead.
    stream.read_buffer.clear();
    stream.recv_state = StreamRecvState::Closed;
    Ok(())
}

// ============================================================================
// Send-side ack handlers
// ============================================================================

/// A STREAM frame we sent was acknowledged.
pub fn on_stream_frame_acked(stream: &mut StreamState, offset: u64, len: u64, fin: bool) {
    stream
        .loss_buffer
        .retain(|meta| !(meta.offset == offset && meta.len == len && meta.fin == fin));
    if fin && offset + len == stream.current_write_offset && stream.pending_writes.is_empty() {
        stream.send_state = StreamSendState::Closed;
    }
}

/// A RESET_STREAM we sent was acknowledged.
pub fn on_rst_stream_acked(stream: &mut StreamState) {
    if stream.send_state == StreamSendState::ResetSent {
        stream.send_state = StreamSendState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stream_side_validity() {
        // Server view: 0 = client bidi, 2 = client uni, 3 = server uni.
        let bidi = StreamState::new(StreamId(0));
        assert_eq!(bidi.send_state, StreamSendState::Open);
        assert_eq!(bidi.recv_state, StreamRecvState::Open);

        let peer_uni = StreamState::new(StreamId(2));
        assert_eq!(peer_uni.send_state, StreamSendState::Invalid);
        assert_eq!(peer_uni.recv_state, StreamRecvState::Open);

        let own_uni = StreamState::new(StreamId(3));
        assert_eq!(own_uni.send_state, StreamSendState::Open);
        assert_eq!(own_uni.recv_state, StreamRecvState::Invalid);
    }

    #[test]
    fn test_terminal_states() {
        let mut stream = StreamState::new(StreamId(0));
        assert!(!stream.in_terminal_states());
        stream.send_state = StreamSendState::Closed;
        assert!(!stream.in_terminal_states());
        stream.recv_state = StreamRecvState::Closed;
        assert!(stream.in_terminal_states());

        let uni = StreamState::new(StreamId(2));
        assert!(!uni.in_terminal_states());
    }

    #[test]
    fn test_receive_final_size_enforced() {
        let mut stream = StreamState::new_with_windows(StreamId(0), 1_000, 0);
        receive_stream_frame(&mut stream, 0, Bytes::from_static(b"hello"), true).unwrap();
        assert_eq!(stream.final_read_offset, Some(5));
        let err =
            receive_stream_frame(&mut stream, 5, Bytes::from_static(b"x"), false).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FinalSizeError);
    }

    #[test]
    fn test_reset_below_observed_rejected() {
        let mut stream = StreamState::new_with_windows(StreamId(0), 1_000, 0);
        stream.max_offset_observed = 10;
        let err = receive_rst_stream(&mut stream, 7, 5).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FinalSizeError);
        receive_rst_stream(&mut stream, 7, 10).unwrap();
        assert_eq!(stream.recv_state, StreamRecvState::Closed);
        assert_eq!(stream.stream_read_error, Some(7));
    }

    #[test]
    fn test_send_fin_ack_closes_send_side() {
        let mut stream = StreamState::new(StreamId(0));
        stream.current_write_offset = 10;
        on_stream_frame_acked(&mut stream, 0, 10, true);
        assert_eq!(stream.send_state, StreamSendState::Closed);
    }

    #[test]
    fn test_rst_ack_closes_send_side() {
        let mut stream = StreamState::new(StreamId(0));
        stream.send_state = StreamSendState::ResetSent;
        on_rst_stream_acked(&mut stream);
        assert_eq!(stream.send_state, StreamSendState::Closed);
    }
}
