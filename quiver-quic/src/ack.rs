//! # Per-Space Ack Bookkeeping (RFC 9000 Section 13.2)
//!
//! Each packet number space carries its own ack context: the set of received
//! packet numbers (ack blocks), receive counters feeding the ack-every-Nth
//! policy, and the latches the writer consults when it builds an ACK frame.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use tracing::trace;

use crate::config::TransportSettings;
use crate::types::{Instant, PacketNumber, PacketNumberSpace, MAX_PACKET_NUMBER};

/// Received packet numbers retained per space for ack-block generation.
const RECEIVED_PACKETS_TRACKED: usize = 1024;

/// Ack threshold applied while only non-retransmittable packets have arrived.
pub const NON_RETX_RX_PACKETS_PENDING_BEFORE_ACK: u64 = 20;

/// Ack context for one packet number space.
#[derive(Debug, Clone)]
pub struct AckState {
    /// Largest packet number received in this space.
    pub largest_received_packet_num: Option<PacketNumber>,
    /// Receive time of that packet.
    pub largest_received_time: Option<Instant>,
    /// Ordered set of received packet numbers, pruned from the bottom.
    pub acks: BTreeSet<PacketNumber>,
    /// Largest packet number we have put into a sent ACK frame.
    pub largest_ack_scheduled: Option<PacketNumber>,
    /// Largest received packet number at the time the last close was sent.
    /// Consulted in the Closed state to decide whether to re-emit the close.
    pub largest_received_at_last_close_sent: Option<PacketNumber>,
    /// Ack-eliciting packets received since the last ACK went out.
    pub num_rx_packets_recvd: u64,
    /// Non-ack-eliciting packets received since the last ACK went out.
    pub num_non_rx_packets_recvd: u64,
    pub needs_to_send_ack_immediately: bool,
    /// Explicit threshold override; supersedes the settings-derived value.
    pub tolerance: Option<u64>,
    /// Pretend packets never arrive out of order.
    pub ignore_reorder: bool,
    /// Next packet number to assign on the send side of this space.
    pub next_packet_num: PacketNumber,
}

impl Default for AckState {
    fn default() -> Self {
        Self {
            largest_received_packet_num: None,
            largest_received_time: None,
            acks: BTreeSet::new(),
            largest_ack_scheduled: None,
            largest_received_at_last_close_sent: None,
            num_rx_packets_recvd: 0,
            num_non_rx_packets_recvd: 0,
            needs_to_send_ack_immediately: false,
            tolerance: None,
            ignore_reorder: false,
            next_packet_num: 0,
        }
    }
}

impl AckState {
    /// There are received packets newer than anything we have acked.
    pub fn has_acks_to_schedule(&self) -> bool {
        match (self.largest_received_packet_num, self.largest_ack_scheduled) {
            (Some(received), Some(scheduled)) => received > scheduled,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Drop tracked acks at or below `largest_acked`; invoked when the peer
    /// acknowledges an ACK frame we sent (ack-of-ack pruning).
    pub fn prune_acks_through(&mut self, largest_acked: PacketNumber) {
        self.acks.retain(|&pn| pn > largest_acked);
    }
}

/// The three ack contexts of a connection.
#[derive(Debug, Clone, Default)]
pub struct AckStates {
    pub initial: AckState,
    pub handshake: AckState,
    pub app_data: AckState,
}

impl AckStates {
    pub fn get(&self, space: PacketNumberSpace) -> &AckState {
        match space {
            PacketNumberSpace::Initial => &self.initial,
            PacketNumberSpace::Handshake => &self.handshake,
            PacketNumberSpace::AppData => &self.app_data,
        }
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> &mut AckState {
        match space {
            PacketNumberSpace::Initial => &mut self.initial,
            PacketNumberSpace::Handshake => &mut self.handshake,
            PacketNumberSpace::AppData => &mut self.app_data,
        }
    }

    /// Any packet received in any space.
    pub fn has_received_packets(&self) -> bool {
        self.initial.largest_received_packet_num.is_some()
            || self.handshake.largest_received_packet_num.is_some()
            || self.app_data.largest_received_packet_num.is_some()
    }

    /// Snapshot largest-received into the close-sent watermark on every space.
    pub fn update_largest_received_at_last_close_sent(&mut self) {
        for space in PacketNumberSpace::ALL {
            let state = self.get_mut(space);
            state.largest_received_at_last_close_sent = state.largest_received_packet_num;
        }
    }

    /// Nothing new arrived since the last close was sent; a fresh close would
    /// be redundant.
    pub fn has_not_received_new_packets_since_last_close_sent(&self) -> bool {
        PacketNumberSpace::ALL.iter().all(|&space| {
            let state = self.get(space);
            state.largest_received_at_last_close_sent == state.largest_received_packet_num
        })
    }
}

/// Record a received packet number. Returns true when the packet arrived out
/// of order (below the current largest).
pub fn update_largest_received_packet_num(
    ack_state: &mut AckState,
    packet_num: PacketNumber,
    receive_time: Instant,
) -> bool {
    let out_of_order = ack_state
        .largest_received_packet_num
        .is_some_and(|largest| packet_num < largest);
    if !out_of_order {
        ack_state.largest_received_packet_num = Some(packet_num);
        ack_state.largest_received_time = Some(receive_time);
    }
    ack_state.acks.insert(packet_num);
    while ack_state.acks.len() > RECEIVED_PACKETS_TRACKED {
        let smallest = *ack_state.acks.iter().next().unwrap();
        ack_state.acks.remove(&smallest);
    }
    out_of_order
}

/// Advance the send-side packet number of a space. Returns true when the
/// space has nearly exhausted its numbers and the transport must close.
pub fn increase_next_packet_num(ack_state: &mut AckState) -> bool {
    ack_state.next_packet_num += 1;
    ack_state.next_packet_num == MAX_PACKET_NUMBER - 1
}

/// Ack scheduling on packet receipt: ack every Nth packet, immediately on
/// crypto data, reordering, or threshold crossings.
pub fn update_ack_send_state_on_recv_packet(
    settings: &TransportSettings,
    ack_state: &mut AckState,
    schedule_ack_timeout: &mut bool,
    mut pkt_out_of_order: bool,
    pkt_has_retransmittable_data: bool,
    pkt_has_crypto_data: bool,
) {
    debug_assert!(!pkt_has_crypto_data || pkt_has_retransmittable_data);
    let mut thresh = NON_RETX_RX_PACKETS_PENDING_BEFORE_ACK;
    if pkt_has_retransmittable_data || ack_state.num_rx_packets_recvd > 0 {
        thresh = match ack_state.tolerance {
            Some(tolerance) => tolerance,
            None => {
                if ack_state.largest_received_packet_num.unwrap_or(0)
                    > settings.rx_packets_before_ack_init_threshold
                {
                    settings.rx_packets_before_ack_after_init
                } else {
                    settings.rx_packets_before_ack_before_init
                }
            }
        };
    }
    if ack_state.ignore_reorder {
        pkt_out_of_order = false;
    }
    if pkt_has_retransmittable_data {
        ack_state.num_rx_packets_recvd += 1;
        if pkt_has_crypto_data
            || pkt_out_of_order
            || ack_state.num_rx_packets_recvd + ack_state.num_non_rx_packets_recvd >= thresh
        {
            trace!(
                crypto = pkt_has_crypto_data,
                out_of_order = pkt_out_of_order,
                rx = ack_state.num_rx_packets_recvd,
                non_rx = ack_state.num_non_rx_packets_recvd,
                "ack immediately"
            );
            *schedule_ack_timeout = false;
            ack_state.needs_to_send_ack_immediately = true;
        } else if !ack_state.needs_to_send_ack_immediately {
            trace!(
                rx = ack_state.num_rx_packets_recvd,
                non_rx = ack_state.num_non_rx_packets_recvd,
                "scheduling ack timeout"
            );
            *schedule_ack_timeout = true;
        }
    } else {
        ack_state.num_non_rx_packets_recvd += 1;
        if ack_state.num_non_rx_packets_recvd + ack_state.num_rx_packets_recvd >= thresh {
            trace!(
                rx = ack_state.num_rx_packets_recvd,
                non_rx = ack_state.num_non_rx_packets_recvd,
                "ack immediately, non-retransmittable threshold"
            );
            *schedule_ack_timeout = false;
            ack_state.needs_to_send_ack_immediately = true;
        }
    }
    if ack_state.needs_to_send_ack_immediately {
        ack_state.num_rx_packets_recvd = 0;
        ack_state.num_non_rx_packets_recvd = 0;
    }
}

/// Ack timer fired: force an immediate ack in the AppData space.
pub fn update_ack_state_on_ack_timeout(
    ack_states: &mut AckStates,
    schedule_ack_timeout: &mut bool,
) {
    ack_states.app_data.needs_to_send_ack_immediately = true;
    ack_states.app_data.num_rx_packets_recvd = 0;
    ack_states.app_data.num_non_rx_packets_recvd = 0;
    *schedule_ack_timeout = false;
}

/// An ack-bearing packet was transmitted: clear the counters and the timer,
/// and record the largest packet number the ACK covered.
pub fn update_ack_send_state_on_sent_packet_with_acks(
    ack_state: &mut AckState,
    schedule_ack_timeout: &mut bool,
    largest_ack_scheduled: PacketNumber,
) {
    *schedule_ack_timeout = false;
    ack_state.needs_to_send_ack_immediately = false;
    ack_state.num_rx_packets_recvd = 0;
    ack_state.num_non_rx_packets_recvd = 0;
    ack_state.largest_ack_scheduled = Some(largest_ack_scheduled);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransportSettings {
        TransportSettings {
            rx_packets_before_ack_before_init: 3,
            rx_packets_before_ack_after_init: 5,
            rx_packets_before_ack_init_threshold: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_largest_received_tracks_maximum() {
        let mut state = AckState::default();
        assert!(!update_largest_received_packet_num(&mut state, 5, Instant::from_nanos(1)));
        assert!(!update_largest_received_packet_num(&mut state, 9, Instant::from_nanos(2)));
        assert!(update_largest_received_packet_num(&mut state, 7, Instant::from_nanos(3)));
        assert_eq!(state.largest_received_packet_num, Some(9));
        assert_eq!(state.largest_received_time, Some(Instant::from_nanos(2)));
        assert_eq!(state.acks.len(), 3);
    }

    #[test]
    fn test_ack_every_nth_retransmittable() {
        // Threshold 3: every third retransmittable packet acks immediately.
        let settings = settings();
        let mut state = AckState::default();
        let mut timer = false;
        let mut immediate = 0;
        for i in 0..9u64 {
            update_largest_received_packet_num(&mut state, i, Instant::from_nanos(i));
            update_ack_send_state_on_recv_packet(
                &settings, &mut state, &mut timer, false, true, false,
            );
            if state.needs_to_send_ack_immediately {
                immediate += 1;
                state.needs_to_send_ack_immediately = false;
            }
        }
        assert_eq!(immediate, 3);
    }

    #[test]
    fn test_crypto_data_acks_immediately() {
        let settings = settings();
        let mut state = AckState::default();
        let mut timer = true;
        update_ack_send_state_on_recv_packet(&settings, &mut state, &mut timer, false, true, true);
        assert!(state.needs_to_send_ack_immediately);
        assert!(!timer);
        assert_eq!(state.num_rx_packets_recvd, 0);
    }

    #[test]
    fn test_out_of_order_acks_immediately_unless_ignored() {
        let settings = settings();
        let mut state = AckState::default();
        let mut timer = false;
        update_ack_send_state_on_recv_packet(&settings, &mut state, &mut timer, true, true, false);
        assert!(state.needs_to_send_ack_immediately);

        let mut state = AckState { ignore_reorder: true, ..Default::default() };
        update_ack_send_state_on_recv_packet(&settings, &mut state, &mut timer, true, true, false);
        assert!(!state.needs_to_send_ack_immediately);
        assert!(timer);
    }

    #[test]
    fn test_tolerance_overrides_settings() {
        let settings = settings();
        let mut state = AckState { tolerance: Some(1), ..Default::default() };
        let mut timer = false;
        update_ack_send_state_on_recv_packet(&settings, &mut state, &mut timer, false, true, false);
        assert!(state.needs_to_send_ack_immediately);
    }

    #[test]
    fn test_non_retransmittable_uses_large_threshold() {
        let settings = settings();
        let mut state = AckState::default();
        let mut timer = false;
        for _ in 0..NON_RETX_RX_PACKETS_PENDING_BEFORE_ACK - 1 {
            update_ack_send_state_on_recv_packet(
                &settings, &mut state, &mut timer, false, false, false,
            );
            assert!(!state.needs_to_send_ack_immediately);
        }
        update_ack_send_state_on_recv_packet(&settings, &mut state, &mut timer, false, false, false);
        assert!(state.needs_to_send_ack_immediately);
    }

    #[test]
    fn test_sent_packet_with_acks_resets_counters() {
        let mut state = AckState {
            num_rx_packets_recvd: 2,
            num_non_rx_packets_recvd: 1,
            needs_to_send_ack_immediately: true,
            ..Default::default()
        };
        let mut timer = true;
        update_ack_send_state_on_sent_packet_with_acks(&mut state, &mut timer, 42);
        assert!(!timer);
        assert!(!state.needs_to_send_ack_immediately);
        assert_eq!(state.num_rx_packets_recvd, 0);
        assert_eq!(state.num_non_rx_packets_recvd, 0);
        assert_eq!(state.largest_ack_scheduled, Some(42));
    }

    #[test]
    fn test_close_sent_watermark() {
        let mut states = AckStates::default();
        update_largest_received_packet_num(&mut states.app_data, 3, Instant::from_nanos(1));
        states.update_largest_received_at_last_close_sent();
        assert!(states.has_not_received_new_packets_since_last_close_sent());
        update_largest_received_packet_num(&mut states.app_data, 4, Instant::from_nanos(2));
        assert!(!states.has_not_received_new_packets_since_last_close_sent());
    }

    #[test]
    fn test_next_packet_num_close_latch() {
        let mut state = AckState { next_packet_num: MAX_PACKET_NUMBER - 2, ..Default::default() };
        assert!(increase_next_packet_num(&mut state));
    }

    #[test]
    fn test_ack_of_ack_pruning() {
        let mut state = AckState::default();
        for pn in 0..10 {
            update_largest_received_packet_num(&mut state, pn, Instant::from_nanos(pn));
        }
        state.prune_acks_through(6);
        assert_eq!(state.acks.iter().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
    }
}
