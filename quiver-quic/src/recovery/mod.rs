//! Loss, RTT, and congestion bookkeeping (RFC 9002).
//!
//! The algorithms (Cubic, BBR, ...) live outside the core; this module owns
//! the state they consume: the outstanding packet log, RTT estimation, and
//! ack processing.

pub mod ack_processing;
pub mod congestion;
pub mod outstanding;
pub mod rtt;

pub use ack_processing::{process_ack_frame, AckEvent, AckedFrame};
pub use congestion::{
    CongestionAndRttState, CongestionControlType, CongestionController,
    CongestionControllerFactory, DefaultCongestionControllerFactory, LossEvent,
};
pub use outstanding::{OutstandingPacket, OutstandingPacketMetadata, OutstandingPackets};
pub use rtt::{update_rtt, RttState, DEFAULT_MIN_RTT};
