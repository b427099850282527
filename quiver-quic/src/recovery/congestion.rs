//! # Congestion Controller Interface
//!
//! The core consumes a controller through this trait; the algorithms
//! themselves (Cubic, BBR, Copa, ...) are external collaborators built by an
//! injected factory. Migration moves a live controller into a snapshot and
//! may restore it when the peer returns to a known address.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::config::TransportSettings;
use crate::recovery::ack_processing::AckEvent;
use crate::recovery::outstanding::OutstandingPacket;
use crate::types::{Instant, PacketNumber};

/// Congestion control algorithm selector. The numeric value is the one
/// carried by the CC knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionControlType {
    Cubic,
    NewReno,
    Copa,
    Bbr,
    None,
}

impl CongestionControlType {
    pub fn to_wire(self) -> u64 {
        match self {
            CongestionControlType::Cubic => 0,
            CongestionControlType::NewReno => 1,
            CongestionControlType::Copa => 2,
            CongestionControlType::Bbr => 3,
            CongestionControlType::None => 4,
        }
    }

    /// Lowercase algorithm name, as accepted by the CC knob.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cubic" => Some(CongestionControlType::Cubic),
            "newreno" => Some(CongestionControlType::NewReno),
            "copa" => Some(CongestionControlType::Copa),
            "bbr" => Some(CongestionControlType::Bbr),
            "none" => Some(CongestionControlType::None),
            _ => None,
        }
    }
}

/// Loss observation handed to the controller.
#[derive(Debug, Clone, Default)]
pub struct LossEvent {
    pub lost_bytes: u64,
    pub lost_packets: u64,
    pub largest_lost_packet_num: Option<PacketNumber>,
    pub persistent_congestion: bool,
}

/// The consumed controller interface.
pub trait CongestionController: Send {
    fn on_packet_sent(&mut self, packet: &OutstandingPacket);

    /// One call per processed ACK frame, carrying the ack and/or loss
    /// observations it produced.
    fn on_packet_ack_or_loss(&mut self, ack: Option<&AckEvent>, loss: Option<&LossEvent>);

    fn set_app_idle(&mut self, idle: bool, now: Instant);

    fn get_writable_bytes(&self) -> u64;

    fn get_congestion_window(&self) -> u64;

    fn control_type(&self) -> CongestionControlType;
}

/// Builds controllers; injected by the owning listener.
pub trait CongestionControllerFactory: Send {
    fn make_congestion_controller(
        &self,
        control_type: CongestionControlType,
        settings: &TransportSettings,
    ) -> Box<dyn CongestionController>;
}

/// Saved controller + RTT variables for a validated peer address.
pub struct CongestionAndRttState {
    pub peer_address: SocketAddr,
    pub record_time: Instant,
    pub congestion_controller: Box<dyn CongestionController>,
    pub srtt: Duration,
    pub lrtt: Duration,
    pub rttvar: Duration,
    pub mrtt: Duration,
}

impl core::fmt::Debug for CongestionAndRttState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CongestionAndRttState")
            .field("peer_address", &self.peer_address)
            .field("record_time", &self.record_time)
            .field("control_type", &self.congestion_controller.control_type())
            .field("srtt", &self.srtt)
            .finish()
    }
}

// ============================================================================
// Fallback controller
// ============================================================================

/// Static-window controller used when no algorithm crate is wired in. Keeps
/// byte accounting honest without shaping anything.
#[derive(Debug)]
pub struct StaticCwndCongestionController {
    cwnd: u64,
    bytes_in_flight: u64,
    app_idle: bool,
}

impl StaticCwndCongestionController {
    pub fn new(cwnd: u64) -> Self {
        Self { cwnd, bytes_in_flight: 0, app_idle: false }
    }
}

impl CongestionController for StaticCwndCongestionController {
    fn on_packet_sent(&mut self, packet: &OutstandingPacket) {
        if packet.metadata.is_ack_eliciting {
            self.bytes_in_flight += packet.metadata.encoded_size;
        }
    }

    fn on_packet_ack_or_loss(&mut self, ack: Option<&AckEvent>, loss: Option<&LossEvent>) {
        if let Some(ack) = ack {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(ack.acked_bytes);
        }
        if let Some(loss) = loss {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(loss.lost_bytes);
        }
    }

    fn set_app_idle(&mut self, idle: bool, _now: Instant) {
        self.app_idle = idle;
    }

    fn get_writable_bytes(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    fn get_congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn control_type(&self) -> CongestionControlType {
        CongestionControlType::None
    }
}

/// Factory producing [`StaticCwndCongestionController`] regardless of the
/// requested algorithm.
#[derive(Debug, Default)]
pub struct DefaultCongestionControllerFactory;

impl CongestionControllerFactory for DefaultCongestionControllerFactory {
    fn make_congestion_controller(
        &self,
        _control_type: CongestionControlType,
        settings: &TransportSettings,
    ) -> Box<dyn CongestionController> {
        Box::new(StaticCwndCongestionController::new(
            10 * settings.max_recv_packet_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cc_name_lookup() {
        assert_eq!(
            CongestionControlType::from_name("cubic"),
            Some(CongestionControlType::Cubic)
        );
        assert_eq!(
            CongestionControlType::from_name("bbr"),
            Some(CongestionControlType::Bbr)
        );
        assert_eq!(CongestionControlType::from_name("BBR"), None);
        assert_eq!(CongestionControlType::from_name("vegas"), None);
    }

    #[test]
    fn test_static_cwnd_accounting() {
        use crate::frames::SentFrame;
        use crate::recovery::outstanding::OutstandingPacketMetadata;
        use crate::types::PacketNumberSpace;

        let mut cc = StaticCwndCongestionController::new(10_000);
        cc.on_packet_sent(&OutstandingPacket {
            packet_num: 0,
            space: PacketNumberSpace::AppData,
            metadata: OutstandingPacketMetadata {
                time_sent: Instant::from_nanos(0),
                encoded_size: 1_200,
                is_ack_eliciting: true,
                is_d6d_probe: false,
            },
            frames: vec![SentFrame::Ping],
            declared_lost: false,
        });
        assert_eq!(cc.get_writable_bytes(), 8_800);

        let ack = AckEvent { acked_bytes: 1_200, ..Default::default() };
        cc.on_packet_ack_or_loss(Some(&ack), None);
        assert_eq!(cc.get_writable_bytes(), 10_000);
    }
}
