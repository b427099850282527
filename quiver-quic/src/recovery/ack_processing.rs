//! # Ack Processing
//!
//! Walks the outstanding packet log against a received ACK frame, removes
//! acknowledged packets, and surfaces the per-frame records so the state
//! machine can release retransmission bookkeeping frame by frame.

#![forbid(unsafe_code)]

use core::time::Duration;

use tracing::trace;

use crate::frames::{AckFrame, SentFrame};
use crate::recovery::outstanding::OutstandingPackets;
use crate::types::{Instant, PacketNumber, PacketNumberSpace};

/// A frame released by an acknowledged packet.
#[derive(Debug, Clone)]
pub struct AckedFrame {
    pub packet_num: PacketNumber,
    pub time_sent: Instant,
    pub is_d6d_probe: bool,
    pub frame: SentFrame,
}

/// Summary of one processed ACK frame.
#[derive(Debug, Clone)]
pub struct AckEvent {
    pub largest_newly_acked: Option<PacketNumber>,
    pub largest_newly_acked_sent_time: Option<Instant>,
    pub acked_bytes: u64,
    pub acked_packets: u64,
    /// Raw sample (send-to-ack-receive) for the largest newly acked packet,
    /// present only when that packet is the frame's largest and not already
    /// declared lost.
    pub rtt_sample: Option<Duration>,
    pub ack_delay: Duration,
    pub ack_receive_time: Instant,
}

impl Default for AckEvent {
    fn default() -> Self {
        Self {
            largest_newly_acked: None,
            largest_newly_acked_sent_time: None,
            acked_bytes: 0,
            acked_packets: 0,
            rtt_sample: None,
            ack_delay: Duration::ZERO,
            ack_receive_time: Instant::ZERO,
        }
    }
}

fn is_acked(frame: &AckFrame, packet_num: PacketNumber) -> bool {
    frame
        .blocks
        .iter()
        .any(|block| block.start <= packet_num && packet_num <= block.end)
}

/// Process one ACK frame against the log.
///
/// Acked packets are removed from the log. The returned frames are in
/// packet-number order, ready for the caller's per-frame dispatch. Packets
/// previously declared lost are dropped silently; they contribute neither
/// bytes nor an RTT sample.
pub fn process_ack_frame(
    outstanding: &mut OutstandingPackets,
    space: PacketNumberSpace,
    frame: &AckFrame,
    ack_receive_time: Instant,
) -> (AckEvent, Vec<AckedFrame>) {
    let mut event = AckEvent {
        ack_delay: frame.ack_delay,
        ack_receive_time,
        ..Default::default()
    };
    let mut acked_frames = Vec::new();

    let mut kept = std::collections::VecDeque::with_capacity(outstanding.packets.len());
    for packet in outstanding.packets.drain(..) {
        if packet.space != space || !is_acked(frame, packet.packet_num) {
            kept.push_back(packet);
            continue;
        }
        if packet.declared_lost {
            // Spuriously declared lost and now acked; it already left the
            // in-flight accounting.
            continue;
        }
        event.acked_bytes += packet.metadata.encoded_size;
        event.acked_packets += 1;
        if event
            .largest_newly_acked
            .map_or(true, |largest| packet.packet_num > largest)
        {
            event.largest_newly_acked = Some(packet.packet_num);
            event.largest_newly_acked_sent_time = Some(packet.metadata.time_sent);
        }
        for sent in packet.frames {
            acked_frames.push(AckedFrame {
                packet_num: packet.packet_num,
                time_sent: packet.metadata.time_sent,
                is_d6d_probe: packet.metadata.is_d6d_probe,
                frame: sent,
            });
        }
    }
    outstanding.packets = kept;

    if event.largest_newly_acked == Some(frame.largest_acked) {
        let sent_time = event.largest_newly_acked_sent_time.unwrap();
        event.rtt_sample = Some(ack_receive_time.saturating_duration_since(sent_time));
    }
    trace!(
        space = ?space,
        largest_acked = frame.largest_acked,
        acked_packets = event.acked_packets,
        acked_bytes = event.acked_bytes,
        "processed ack frame"
    );
    (event, acked_frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::AckBlock;
    use crate::recovery::outstanding::{OutstandingPacket, OutstandingPacketMetadata};
    use crate::types::StreamId;

    fn sent_packet(space: PacketNumberSpace, pn: PacketNumber, lost: bool) -> OutstandingPacket {
        OutstandingPacket {
            packet_num: pn,
            space,
            metadata: OutstandingPacketMetadata {
                time_sent: Instant::from_nanos(pn * 1_000),
                encoded_size: 100,
                is_ack_eliciting: true,
                is_d6d_probe: false,
            },
            frames: vec![SentFrame::Stream {
                stream_id: StreamId(0),
                offset: pn * 10,
                len: 10,
                fin: false,
            }],
            declared_lost: lost,
        }
    }

    fn ack(largest: PacketNumber, blocks: Vec<AckBlock>) -> AckFrame {
        AckFrame { largest_acked: largest, ack_delay: Duration::ZERO, blocks }
    }

    #[test]
    fn test_acked_packets_removed_in_order() {
        let mut log = OutstandingPackets::default();
        for pn in 0..5 {
            log.on_packet_sent(sent_packet(PacketNumberSpace::AppData, pn, false));
        }
        let frame = ack(4, vec![AckBlock { start: 3, end: 4 }, AckBlock { start: 0, end: 1 }]);
        let (event, frames) =
            process_ack_frame(&mut log, PacketNumberSpace::AppData, &frame, Instant::from_nanos(9_000));

        assert_eq!(event.acked_packets, 4);
        assert_eq!(event.acked_bytes, 400);
        assert_eq!(event.largest_newly_acked, Some(4));
        let pns: Vec<_> = frames.iter().map(|f| f.packet_num).collect();
        assert_eq!(pns, vec![0, 1, 3, 4]);
        // Packet 2 survives.
        assert_eq!(log.packets.len(), 1);
        assert_eq!(log.packets[0].packet_num, 2);
    }

    #[test]
    fn test_rtt_sample_only_for_largest() {
        let mut log = OutstandingPackets::default();
        for pn in 0..3 {
            log.on_packet_sent(sent_packet(PacketNumberSpace::AppData, pn, false));
        }
        // Ack only packets 0..=1: largest in frame is 1, newly acked matches.
        let frame = ack(1, vec![AckBlock { start: 0, end: 1 }]);
        let (event, _) =
            process_ack_frame(&mut log, PacketNumberSpace::AppData, &frame, Instant::from_nanos(5_000));
        assert_eq!(event.rtt_sample, Some(Duration::from_nanos(4_000)));

        // Re-acking the same range produces no sample.
        let (event, _) =
            process_ack_frame(&mut log, PacketNumberSpace::AppData, &frame, Instant::from_nanos(6_000));
        assert_eq!(event.rtt_sample, None);
        assert_eq!(event.acked_packets, 0);
    }

    #[test]
    fn test_lost_packets_do_not_sample_rtt() {
        let mut log = OutstandingPackets::default();
        log.on_packet_sent(sent_packet(PacketNumberSpace::AppData, 0, true));
        let frame = ack(0, vec![AckBlock { start: 0, end: 0 }]);
        let (event, frames) =
            process_ack_frame(&mut log, PacketNumberSpace::AppData, &frame, Instant::from_nanos(100));
        assert_eq!(event.acked_packets, 0);
        assert!(frames.is_empty());
        assert!(event.rtt_sample.is_none());
        assert!(log.packets.is_empty());
    }

    #[test]
    fn test_other_spaces_untouched() {
        let mut log = OutstandingPackets::default();
        log.on_packet_sent(sent_packet(PacketNumberSpace::Initial, 0, false));
        log.on_packet_sent(sent_packet(PacketNumberSpace::AppData, 0, false));
        let frame = ack(0, vec![AckBlock { start: 0, end: 0 }]);
        let (event, _) =
            process_ack_frame(&mut log, PacketNumberSpace::Initial, &frame, Instant::from_nanos(100));
        assert_eq!(event.acked_packets, 1);
        assert_eq!(log.packets.len(), 1);
        assert_eq!(log.packets[0].space, PacketNumberSpace::AppData);
    }
}
