//! Transport settings.
//!
//! One value object configured by the owning listener before the first
//! datagram arrives, then treated as read-only by the core (the resumption
//! path and knob channel are the exceptions, and both go through explicit
//! setters on the connection).

#![forbid(unsafe_code)]

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::recovery::congestion::CongestionControlType;
use crate::types::{DEFAULT_ACK_DELAY_EXPONENT, DEFAULT_MAX_UDP_PAYLOAD};

/// Policy for accepting 0-RTT based on the source-address token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroRttSourceTokenMatchingPolicy {
    AlwaysReject,
    RejectIfNoExactMatch,
    LimitIfNoExactMatch,
}

/// DATAGRAM frame support (RFC 9221).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramConfig {
    pub enabled: bool,
    /// Advertised max_datagram_frame_size.
    pub max_read_frame_size: u64,
    /// Received datagrams retained for the application before old ones drop.
    pub read_buffer_size: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_read_frame_size: 65535,
            read_buffer_size: 16,
        }
    }
}

/// Datagram PLPMTUD (d6d) switches. The probing machinery itself lives with
/// the sender; the core only negotiates and sanity-checks the parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct D6DConfig {
    pub enabled: bool,
}

/// Connection-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Connection-level receive window advertised in transport parameters.
    pub advertised_initial_connection_window_size: u64,
    /// Per-stream receive window for bidi streams we initiate ("local" to
    /// the sender of the parameter).
    pub advertised_initial_bidi_local_stream_window_size: u64,
    /// Per-stream receive window for bidi streams the peer initiates.
    pub advertised_initial_bidi_remote_stream_window_size: u64,
    /// Per-stream receive window for unidirectional streams.
    pub advertised_initial_uni_stream_window_size: u64,
    /// Bidirectional stream count the peer may open.
    pub advertised_initial_max_streams_bidi: u64,
    /// Unidirectional stream count the peer may open.
    pub advertised_initial_max_streams_uni: u64,

    pub idle_timeout: Duration,
    pub ack_delay_exponent: u8,
    pub max_recv_packet_size: u64,

    /// Ack-every-Nth threshold before the largest received packet number
    /// crosses `rx_packets_before_ack_init_threshold`.
    pub rx_packets_before_ack_before_init: u64,
    /// Ack-every-Nth threshold after that point.
    pub rx_packets_before_ack_after_init: u64,
    pub rx_packets_before_ack_init_threshold: u64,

    /// Undecryptable 0-RTT/1-RTT packets buffered while keys are pending.
    pub max_packets_to_buffer: usize,

    /// Amplification allowance granted per received packet, in MSS units,
    /// until the peer address is validated.
    pub limited_cwnd_in_mss: u64,

    pub disable_migration: bool,

    /// MAX_STREAMS credit is granted once the closed-stream credit reaches
    /// `advertised_initial_max_streams / windowing_fraction`.
    pub stream_limit_windowing_fraction: u64,

    pub default_congestion_controller: CongestionControlType,
    pub pacing_enabled: bool,

    /// Trust the peer's max_udp_payload_size immediately instead of probing.
    pub can_ignore_path_mtu: bool,

    pub zero_rtt_source_token_matching_policy: ZeroRttSourceTokenMatchingPolicy,

    pub datagram_config: DatagramConfig,
    pub d6d_config: D6DConfig,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            advertised_initial_connection_window_size: 1024 * 1024,
            advertised_initial_bidi_local_stream_window_size: 256 * 1024,
            advertised_initial_bidi_remote_stream_window_size: 256 * 1024,
            advertised_initial_uni_stream_window_size: 256 * 1024,
            advertised_initial_max_streams_bidi: 100,
            advertised_initial_max_streams_uni: 100,
            idle_timeout: Duration::from_secs(60),
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_recv_packet_size: DEFAULT_MAX_UDP_PAYLOAD,
            rx_packets_before_ack_before_init: 10,
            rx_packets_before_ack_after_init: 10,
            rx_packets_before_ack_init_threshold: 100,
            max_packets_to_buffer: 20,
            limited_cwnd_in_mss: 5,
            disable_migration: false,
            stream_limit_windowing_fraction: 2,
            default_congestion_controller: CongestionControlType::Cubic,
            pacing_enabled: false,
            can_ignore_path_mtu: false,
            zero_rtt_source_token_matching_policy:
                ZeroRttSourceTokenMatchingPolicy::RejectIfNoExactMatch,
            datagram_config: DatagramConfig::default(),
            d6d_config: D6DConfig::default(),
        }
    }
}
