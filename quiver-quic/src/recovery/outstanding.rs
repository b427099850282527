//! # Outstanding Packet Log
//!
//! Ordered record of sent, not-yet-acknowledged packets across all packet
//! number spaces, plus the per-space loss-time deadlines the loss detector
//! consults.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use crate::frames::SentFrame;
use crate::types::{Instant, PacketNumber, PacketNumberSpace};

/// Per-packet metadata recorded at send time.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingPacketMetadata {
    pub time_sent: Instant,
    pub encoded_size: u64,
    pub is_ack_eliciting: bool,
    /// PMTU discovery probe; its ping must not cancel the ping timer.
    pub is_d6d_probe: bool,
}

/// One sent packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet_num: PacketNumber,
    pub space: PacketNumberSpace,
    pub metadata: OutstandingPacketMetadata,
    /// The frames the packet carried, for per-frame ack handling.
    pub frames: Vec<SentFrame>,
    /// Declared lost by the loss detector but retained until acked or purged.
    pub declared_lost: bool,
}

/// The connection's log of outstanding packets.
#[derive(Debug, Default)]
pub struct OutstandingPackets {
    /// Send-ordered. Within one space, packet numbers are strictly
    /// increasing.
    pub packets: VecDeque<OutstandingPacket>,
    loss_times: [Option<Instant>; 3],
}

impl OutstandingPackets {
    pub fn on_packet_sent(&mut self, packet: OutstandingPacket) {
        debug_assert!(self
            .last_outstanding_including_lost(packet.space)
            .map_or(true, |last| last.packet_num < packet.packet_num));
        self.packets.push_back(packet);
    }

    /// Earliest not-lost packet in a space.
    pub fn first_outstanding(&self, space: PacketNumberSpace) -> Option<&OutstandingPacket> {
        self.packets
            .iter()
            .find(|op| !op.declared_lost && op.space == space)
    }

    /// Latest not-lost packet in a space.
    pub fn last_outstanding(&self, space: PacketNumberSpace) -> Option<&OutstandingPacket> {
        self.packets
            .iter()
            .rev()
            .find(|op| !op.declared_lost && op.space == space)
    }

    /// Latest packet in a space, lost ones included.
    pub fn last_outstanding_including_lost(
        &self,
        space: PacketNumberSpace,
    ) -> Option<&OutstandingPacket> {
        self.packets.iter().rev().find(|op| op.space == space)
    }

    /// Not-lost packets of a space in packet-number order.
    pub fn iter_space(
        &self,
        space: PacketNumberSpace,
    ) -> impl Iterator<Item = &OutstandingPacket> {
        self.packets
            .iter()
            .filter(move |op| !op.declared_lost && op.space == space)
    }

    pub fn loss_time(&self, space: PacketNumberSpace) -> Option<Instant> {
        self.loss_times[space.index()]
    }

    pub fn set_loss_time(&mut self, space: PacketNumberSpace, time: Option<Instant>) {
        self.loss_times[space.index()] = time;
    }

    /// Earliest loss deadline among eligible spaces. The AppData space is
    /// ineligible until the 1-RTT write cipher exists.
    pub fn earliest_loss_time(
        &self,
        consider_app_data: bool,
    ) -> Option<(Instant, PacketNumberSpace)> {
        let mut result: Option<(Instant, PacketNumberSpace)> = None;
        for space in PacketNumberSpace::ALL {
            if space == PacketNumberSpace::AppData && !consider_app_data {
                continue;
            }
            let Some(time) = self.loss_times[space.index()] else {
                continue;
            };
            if result.map_or(true, |(best, _)| time < best) {
                result = Some((time, space));
            }
        }
        result
    }

    /// Bytes in flight: sizes of not-lost ack-eliciting packets.
    pub fn bytes_in_flight(&self) -> u64 {
        self.packets
            .iter()
            .filter(|op| !op.declared_lost && op.metadata.is_ack_eliciting)
            .map(|op| op.metadata.encoded_size)
            .sum()
    }

    /// Drop all packets of a space, e.g. when its keys are discarded.
    pub fn discard_space(&mut self, space: PacketNumberSpace) {
        self.packets.retain(|op| op.space != space);
        self.loss_times[space.index()] = None;
    }
}
