//! # Flow Control (RFC 9000 Section 4)
//!
//! Connection-level and per-stream windows. Receive windows advertise more
//! credit once half the window is consumed; send windows track the peer's
//! MAX_DATA / MAX_STREAM_DATA grants.

#![forbid(unsafe_code)]

use tracing::trace;

use crate::error::{TransportError, TransportErrorCode};
use crate::stream::StreamState;

/// Connection-level flow control accounting.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFlowControlState {
    /// Send limit granted by the peer (MAX_DATA).
    pub peer_advertised_max_offset: u64,
    /// Total bytes written across all streams.
    pub sum_cur_write_offset: u64,
    /// Unread bytes buffered across all stream receive buffers.
    pub sum_cur_stream_buffer_len: u64,
    /// Sum of the largest observed receive offsets across streams.
    pub sum_max_observed_offset: u64,
    /// Sum of application read offsets across streams.
    pub sum_cur_read_offset: u64,
    /// Receive limit we last advertised.
    pub advertised_max_offset: u64,
    /// Receive window size.
    pub window_size: u64,
    pending_window_update: Option<u64>,
}

impl ConnectionFlowControlState {
    pub fn new(window_size: u64) -> Self {
        Self {
            window_size,
            advertised_max_offset: window_size,
            ..Default::default()
        }
    }

    /// Bytes the peer still allows us to send on the connection.
    pub fn send_window(&self) -> u64 {
        self.peer_advertised_max_offset
            .saturating_sub(self.sum_cur_write_offset)
    }

    /// The sender is blocked on the connection window.
    pub fn is_blocked(&self) -> bool {
        self.send_window() == 0
    }

    /// MAX_DATA advertisement ready to go out, if any.
    pub fn window_update_to_send(&mut self) -> Option<u64> {
        self.pending_window_update.take()
    }
}

/// Peer raised the connection send limit (MAX_DATA).
pub fn handle_conn_window_update(state: &mut ConnectionFlowControlState, maximum_data: u64) {
    if maximum_data > state.peer_advertised_max_offset {
        trace!(maximum_data, "connection window update");
        state.peer_advertised_max_offset = maximum_data;
    }
}

/// Peer reports it is blocked on our connection window (DATA_BLOCKED).
/// Re-advertise the current limit so a lost MAX_DATA cannot deadlock.
pub fn handle_conn_blocked(state: &mut ConnectionFlowControlState) {
    state.pending_window_update = Some(state.sum_cur_read_offset + state.window_size);
}

/// Account newly observed receive bytes against the connection window.
///
/// `delta` is the growth of a stream's max observed offset.
pub fn on_connection_data_received(
    state: &mut ConnectionFlowControlState,
    delta: u64,
) -> Result<(), TransportError> {
    state.sum_max_observed_offset += delta;
    if state.sum_max_observed_offset > state.advertised_max_offset {
        return Err(TransportError::new(
            TransportErrorCode::FlowControlError,
            "Connection flow control exceeded",
        ));
    }
    Ok(())
}

/// Account application reads; emits a MAX_DATA update when half the window
/// is consumed.
pub fn on_connection_data_read(state: &mut ConnectionFlowControlState, amount: u64) {
    state.sum_cur_read_offset += amount;
    let remaining = state
        .advertised_max_offset
        .saturating_sub(state.sum_cur_read_offset);
    if remaining < state.window_size / 2 {
        state.pending_window_update = Some(state.sum_cur_read_offset + state.window_size);
    }
}

// ============================================================================
// Per-stream windows
// ============================================================================

/// Peer raised a stream's send limit (MAX_STREAM_DATA). Returns true when
/// the limit actually grew.
pub fn handle_stream_window_update(stream: &mut StreamState, maximum_data: u64) -> bool {
    if maximum_data > stream.flow_control.peer_advertised_max_offset {
        stream.flow_control.peer_advertised_max_offset = maximum_data;
        return true;
    }
    false
}

/// Account received stream data against the stream window.
///
/// Returns the connection-level delta (growth of the stream's max observed
/// offset) on success.
pub fn on_stream_data_received(
    stream: &mut StreamState,
    frame_end_offset: u64,
) -> Result<u64, TransportError> {
    if frame_end_offset > stream.flow_control.advertised_max_offset {
        return Err(TransportError::new(
            TransportErrorCode::FlowControlError,
            format!("Stream {} flow control exceeded", stream.id),
        ));
    }
    let delta = frame_end_offset.saturating_sub(stream.max_offset_observed);
    stream.max_offset_observed = stream.max_offset_observed.max(frame_end_offset);
    Ok(delta)
}

/// Stream read progress; emits a MAX_STREAM_DATA update when half the stream
/// window is consumed.
pub fn maybe_send_stream_window_update(stream: &mut StreamState) -> Option<u64> {
    let fc = &mut stream.flow_control;
    let remaining = fc.advertised_max_offset.saturating_sub(stream.current_read_offset);
    if remaining < fc.window_size / 2 {
        let next = stream.current_read_offset + fc.window_size;
        fc.advertised_max_offset = next;
        return Some(next);
    }
    None
}
