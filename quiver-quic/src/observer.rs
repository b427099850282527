//! Observer and stats sink interfaces.
//!
//! Both are optional collaborators; the core holds them as
//! `Option<Box<dyn ...>>` and every call site tolerates absence.

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::error::PacketDropReason;
use crate::types::{ConnectionId, PacketNumber, ProtectionType};

/// Event-log observer for a single connection (qlog-shaped).
pub trait ConnectionObserver: Send {
    fn add_packet(&mut self, packet_num: PacketNumber, size: usize);

    fn add_packet_drop(&mut self, size: usize, reason: PacketDropReason);

    fn add_packet_buffered(&mut self, protection_type: ProtectionType, size: usize);

    fn add_transport_state_update(&mut self, update: &str);

    fn add_metric_update(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        smoothed_rtt: Duration,
        ack_delay: Duration,
    );

    fn add_connection_migration_update(&mut self, intentional: bool);

    fn set_scid(&mut self, cid: &ConnectionId);

    fn set_dcid(&mut self, cid: &ConnectionId);
}

/// Aggregate transport stats counters.
pub trait StatsCallback: Send {
    fn on_packet_dropped(&mut self, reason: PacketDropReason);

    fn on_packet_processed(&mut self);

    fn on_out_of_order_packet_received(&mut self);

    fn on_stateless_reset(&mut self);

    fn on_new_quic_stream(&mut self);

    fn on_quic_stream_closed(&mut self);
}

/// Counting stats sink, usable as a default and in tests.
#[derive(Debug, Default, Clone)]
pub struct CountingStats {
    pub packets_dropped: u64,
    pub packets_processed: u64,
    pub out_of_order_packets: u64,
    pub stateless_resets: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub last_drop_reason: Option<PacketDropReason>,
}

impl StatsCallback for CountingStats {
    fn on_packet_dropped(&mut self, reason: PacketDropReason) {
        self.packets_dropped += 1;
        self.last_drop_reason = Some(reason);
    }

    fn on_packet_processed(&mut self) {
        self.packets_processed += 1;
    }

    fn on_out_of_order_packet_received(&mut self) {
        self.out_of_order_packets += 1;
    }

    fn on_stateless_reset(&mut self) {
        self.stateless_resets += 1;
    }

    fn on_new_quic_stream(&mut self) {
        self.streams_opened += 1;
    }

    fn on_quic_stream_closed(&mut self) {
        self.streams_closed += 1;
    }
}
