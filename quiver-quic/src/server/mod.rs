//! # Server Connection State Machine
//!
//! Top-level ingest for one server-side connection: bootstrap on the first
//! datagram, the coalesced-packet loop, frame dispatch, handshake state
//! transitions, migration, and the Closed-state absorber.
//!
//! The state machine is a pure function of (state, datagram, time). It
//! never does I/O and never reads a clock; timers and writes are raised as
//! [`PendingEvents`] the driver consults after every call.

#![forbid(unsafe_code)]

pub mod cid;
pub mod migration;


use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use bytes::{Bytes, BytesMut};
use core::time::Duration;
use tracing::{debug, trace, warn};

use crate::ack::{
    increase_next_packet_num, update_ack_send_state_on_recv_packet,
    update_ack_send_state_on_sent_packet_with_acks, update_ack_state_on_ack_timeout,
    update_largest_received_packet_num, AckStates,
};
use crate::codec::{
    parse_long_header_invariant, CodecParameters, CodecResult, PacketCodec, RegularPacket,
};
use crate::config::{TransportSettings, ZeroRttSourceTokenMatchingPolicy};
use crate::crypto::{Aead, CryptoState, HandshakeLayer, HeaderCipher};
use crate::error::{PacketDropReason, TransportError, TransportErrorCode};
use crate::flow_control::{
    handle_conn_blocked, handle_conn_window_update, handle_stream_window_update,
    on_connection_data_received, on_stream_data_received, ConnectionFlowControlState,
};
use crate::frames::{Frame, SentFrame, SimpleFrame};
use crate::observer::{ConnectionObserver, StatsCallback};
use crate::recovery::{
    process_ack_frame, update_rtt, CongestionAndRttState, CongestionController,
    CongestionControllerFactory, OutstandingPacket, OutstandingPackets, RttState,
};
use crate::server::cid::{
    encode_with_rejector, ConnectionIdAlgo, ConnectionIdData, ConnectionIdRejector,
    ServerConnectionIdParams, StatelessResetGenerator,
};
use crate::stream::manager::{ManagerContext, StreamManager, StreamWindowDefaults};
use crate::stream::{
    on_rst_stream_acked, on_stream_frame_acked, receive_rst_stream, receive_stream_frame,
};
use crate::transport::parameters::{
    ClientTransportParameters, ServerParametersConfig, ServerTransportParameters,
    TransportParameter, TransportParameterId,
};
use crate::types::{
    ConnectionId, EncryptionLevel, Instant, PacketNumberSpace, ProtectionType, QuicVersion,
    StatelessResetToken, DEFAULT_ACK_DELAY_EXPONENT, DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
    DEFAULT_CONNECTION_ID_SIZE, DEFAULT_MAX_UDP_PAYLOAD, DEFAULT_UDP_SEND_PACKET_LEN,
    MAX_ACK_DELAY_MS, MAX_ACK_DELAY_EXPONENT, MAX_DATAGRAM_PACKET_OVERHEAD, MAX_IDLE_TIMEOUT,
    MAX_NUM_COALESCED_PACKETS, MAX_NUM_TOKEN_SOURCE_ADDRESSES, MIN_D6D_PROBE_TIMEOUT,
    MIN_D6D_RAISE_TIMEOUT, MIN_MAX_UDP_PAYLOAD,
};

/// Builds fresh read codecs; injected so tests and deployments choose the
/// parsing/crypto backend.
pub trait PacketCodecFactory: Send {
    fn make_codec(&self) -> Box<dyn PacketCodec>;
}

/// One received UDP payload.
#[derive(Debug, Clone)]
pub struct ReadData {
    pub peer: SocketAddr,
    pub data: Bytes,
    pub receive_time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Open,
    Closed,
}

/// Result of one datagram's worth of processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// The peer sent CONNECTION_CLOSE; the connection is now Closed and the
    /// driver should emit a NO_ERROR close of its own.
    ClosedByPeer,
}

/// Work the driver must pick up after a turn.
#[derive(Debug, Default)]
pub struct PendingEvents {
    /// Path challenge data to send toward an unvalidated address.
    pub path_challenge: Option<u64>,
    /// Small control frames queued for the next write.
    pub frames: Vec<SimpleFrame>,
    pub schedule_ack_timeout: bool,
    pub schedule_path_validation_timeout: bool,
    pub cancel_ping_timeout: bool,
    pub cancel_handshake_timers: bool,
    /// Packet-number space nearly exhausted; close instead of wrapping.
    pub close_transport: bool,
}

#[derive(Debug, Default)]
pub struct MigrationState {
    pub num_migrations: u32,
    /// Addresses this connection has previously validated.
    pub previous_peer_addresses: Vec<SocketAddr>,
    pub last_congestion_and_rtt: Option<CongestionAndRttState>,
}

impl MigrationState {
    fn new() -> Self {
        Self::default()
    }
}

/// Byte budget for probing an unvalidated path.
#[derive(Debug, Clone, Copy)]
pub struct PendingPathRateLimiter {
    window_bytes: u64,
    available: u64,
}

impl PendingPathRateLimiter {
    pub fn new(udp_send_packet_len: u64) -> Self {
        let window_bytes = 3 * udp_send_packet_len;
        Self { window_bytes, available: window_bytes }
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn consume(&mut self, bytes: u64) {
        self.available = self.available.saturating_sub(bytes);
    }

    pub fn refresh(&mut self) {
        self.available = self.window_bytes;
    }
}

/// DATAGRAM frame state (RFC 9221).
#[derive(Debug, Default)]
pub struct DatagramState {
    pub max_read_frame_size: u64,
    /// Peer's advertised max_datagram_frame_size; zero until negotiated.
    pub max_write_frame_size: u64,
    pub read_buffer: VecDeque<Bytes>,
    pub read_buffer_capacity: usize,
}

/// Negotiated datagram PLPMTUD parameters. The probing machine itself lives
/// with the sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct D6DState {
    pub base_pmtu: Option<u64>,
    pub max_pmtu: Option<u64>,
    pub raise_timeout: Option<Duration>,
    pub probe_timeout: Option<Duration>,
    pub no_blackhole_detection: bool,
}

/// Everything the owning listener injects into a new connection.
pub struct ServerConnectionContext {
    pub handshake_layer: Box<dyn HandshakeLayer>,
    pub codec_factory: Box<dyn PacketCodecFactory>,
    pub conn_id_algo: Box<dyn ConnectionIdAlgo>,
    pub conn_id_rejector: Option<Box<dyn ConnectionIdRejector>>,
    pub congestion_controller_factory: Box<dyn CongestionControllerFactory>,
    pub observer: Option<Box<dyn ConnectionObserver>>,
    pub stats_callback: Option<Box<dyn StatsCallback>>,
    pub transport_settings: TransportSettings,
    pub server_addr: SocketAddr,
    pub server_conn_id_params: ServerConnectionIdParams,
    /// Process-wide secret for stateless-reset tokens, owned by the
    /// listener and passed down read-only.
    pub stateless_reset_token_secret: [u8; 32],
    pub original_peer_address: SocketAddr,
}

/// Builds the manager context from connection fields without borrowing the
/// whole connection.
macro_rules! stream_ctx {
    ($conn:expr, $now:expr) => {
        ManagerContext {
            now: $now,
            stats: $conn.stats_callback.as_deref_mut().map(|s| s as &mut dyn StatsCallback),
            congestion: Some($conn.congestion_controller.as_mut()),
        }
    };
}

#[derive(Debug, Default)]
struct FrameLoopOutcome {
    peer_closed: bool,
    has_retransmittable_data: bool,
    has_crypto_data: bool,
    non_probing: bool,
    handshake_done_acked: bool,
}

/// One server-side connection.
pub struct ServerConnection {
    state: ServerState,
    version: Option<QuicVersion>,

    client_connection_id: Option<ConnectionId>,
    original_destination_connection_id: Option<ConnectionId>,
    server_connection_id: Option<ConnectionId>,
    self_connection_ids: Vec<ConnectionIdData>,
    next_self_connection_id_sequence: u64,
    peer_connection_ids: Vec<(u64, ConnectionId, StatelessResetToken)>,

    peer_address: SocketAddr,
    original_peer_address: SocketAddr,
    server_addr: SocketAddr,

    read_codec: Option<Box<dyn PacketCodec>>,
    codec_factory: Box<dyn PacketCodecFactory>,
    handshake_layer: Box<dyn HandshakeLayer>,
    conn_id_algo: Box<dyn ConnectionIdAlgo>,
    conn_id_rejector: Option<Box<dyn ConnectionIdRejector>>,
    server_conn_id_params: ServerConnectionIdParams,
    stateless_reset_token_secret: [u8; 32],

    crypto_state: CryptoState,
    initial_write_cipher: Option<Box<dyn Aead>>,
    initial_header_cipher: Option<Box<dyn HeaderCipher>>,
    handshake_write_cipher: Option<Box<dyn Aead>>,
    handshake_write_header_cipher: Option<Box<dyn HeaderCipher>>,
    one_rtt_write_cipher: Option<Box<dyn Aead>>,
    one_rtt_write_header_cipher: Option<Box<dyn HeaderCipher>>,
    used_zero_rtt: bool,

    ack_states: AckStates,
    rtt: RttState,
    outstanding: OutstandingPackets,
    congestion_controller: Box<dyn CongestionController>,
    congestion_controller_factory: Box<dyn CongestionControllerFactory>,
    flow_control: ConnectionFlowControlState,
    streams: StreamManager,

    migration_state: MigrationState,
    outstanding_path_validation: Option<u64>,
    path_validation_limiter: Option<PendingPathRateLimiter>,

    pending_events: PendingEvents,
    pending_zero_rtt_data: Option<Vec<ReadData>>,
    pending_one_rtt_data: Option<Vec<ReadData>>,

    /// Amplification guard: bytes we may send before the peer address is
    /// validated. None once validated.
    writable_bytes_limit: Option<u64>,
    udp_send_packet_len: u64,
    peer_max_udp_payload_size: Option<u64>,

    transport_parameters_encoded: bool,
    sent_handshake_done: bool,
    peer_ack_delay_exponent: u8,
    peer_min_ack_delay: Option<Duration>,
    peer_idle_timeout: Duration,
    peer_active_connection_id_limit: u64,
    peer_connection_error: Option<(u64, String)>,

    token_source_addresses: Vec<IpAddr>,
    source_token_matching: bool,

    datagram_state: DatagramState,
    d6d: D6DState,
    can_be_paced: bool,

    observer: Option<Box<dyn ConnectionObserver>>,
    stats_callback: Option<Box<dyn StatsCallback>>,
    transport_settings: TransportSettings,
}

impl ServerConnection {
    pub fn new(ctx: ServerConnectionContext) -> Self {
        let settings = ctx.transport_settings;
        let congestion_controller = ctx
            .congestion_controller_factory
            .make_congestion_controller(settings.default_congestion_controller, &settings);
        let streams = StreamManager::new(
            settings.advertised_initial_max_streams_bidi,
            settings.advertised_initial_max_streams_uni,
            settings.stream_limit_windowing_fraction,
            StreamWindowDefaults {
                local_bidi_recv: settings.advertised_initial_bidi_local_stream_window_size,
                remote_bidi_recv: settings.advertised_initial_bidi_remote_stream_window_size,
                uni_recv: settings.advertised_initial_uni_stream_window_size,
                ..Default::default()
            },
        );
        let datagram_state = DatagramState {
            max_read_frame_size: settings.datagram_config.max_read_frame_size,
            max_write_frame_size: 0,
            read_buffer: VecDeque::new(),
            read_buffer_capacity: settings.datagram_config.read_buffer_size,
        };
        Self {
            state: ServerState::Open,
            version: None,
            client_connection_id: None,
            original_destination_connection_id: None,
            server_connection_id: None,
            self_connection_ids: Vec::new(),
            next_self_connection_id_sequence: 0,
            peer_connection_ids: Vec::new(),
            peer_address: ctx.original_peer_address,
            original_peer_address: ctx.original_peer_address,
            server_addr: ctx.server_addr,
            read_codec: None,
            codec_factory: ctx.codec_factory,
            handshake_layer: ctx.handshake_layer,
            conn_id_algo: ctx.conn_id_algo,
            conn_id_rejector: ctx.conn_id_rejector,
            server_conn_id_params: ctx.server_conn_id_params,
            stateless_reset_token_secret: ctx.stateless_reset_token_secret,
            crypto_state: CryptoState::default(),
            initial_write_cipher: None,
            initial_header_cipher: None,
            handshake_write_cipher: None,
            handshake_write_header_cipher: None,
            one_rtt_write_cipher: None,
            one_rtt_write_header_cipher: None,
            used_zero_rtt: false,
            ack_states: AckStates::default(),
            rtt: RttState::default(),
            outstanding: OutstandingPackets::default(),
            congestion_controller,
            congestion_controller_factory: ctx.congestion_controller_factory,
            flow_control: ConnectionFlowControlState::new(
                settings.advertised_initial_connection_window_size,
            ),
            streams,
            migration_state: MigrationState::new(),
            outstanding_path_validation: None,
            path_validation_limiter: None,
            pending_events: PendingEvents::default(),
            pending_zero_rtt_data: Some(Vec::new()),
            pending_one_rtt_data: Some(Vec::new()),
            writable_bytes_limit: None,
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN,
            peer_max_udp_payload_size: None,
            transport_parameters_encoded: false,
            sent_handshake_done: false,
            peer_ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            peer_min_ack_delay: None,
            peer_idle_timeout: Duration::ZERO,
            peer_active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            peer_connection_error: None,
            token_source_addresses: Vec::new(),
            source_token_matching: false,
            datagram_state,
            d6d: D6DState::default(),
            can_be_paced: false,
            observer: ctx.observer,
            stats_callback: ctx.stats_callback,
            transport_settings: settings,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn version(&self) -> Option<QuicVersion> {
        self.version
    }

    pub fn server_connection_id(&self) -> Option<&ConnectionId> {
        self.server_connection_id.as_ref()
    }

    pub fn client_connection_id(&self) -> Option<&ConnectionId> {
        self.client_connection_id.as_ref()
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn rtt(&self) -> &RttState {
        &self.rtt
    }

    pub fn ack_states(&self) -> &AckStates {
        &self.ack_states
    }

    pub fn pending_events(&self) -> &PendingEvents {
        &self.pending_events
    }

    pub fn pending_events_mut(&mut self) -> &mut PendingEvents {
        &mut self.pending_events
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamManager {
        &mut self.streams
    }

    pub fn flow_control(&self) -> &ConnectionFlowControlState {
        &self.flow_control
    }

    pub fn congestion_controller(&self) -> &dyn CongestionController {
        self.congestion_controller.as_ref()
    }

    pub fn writable_bytes_limit(&self) -> Option<u64> {
        self.writable_bytes_limit
    }

    pub fn peer_connection_error(&self) -> Option<&(u64, String)> {
        self.peer_connection_error.as_ref()
    }

    pub fn datagram_state(&self) -> &DatagramState {
        &self.datagram_state
    }

    pub fn d6d(&self) -> &D6DState {
        &self.d6d
    }

    pub fn token_source_addresses(&self) -> &[IpAddr] {
        &self.token_source_addresses
    }

    pub fn transport_settings(&self) -> &TransportSettings {
        &self.transport_settings
    }

    pub fn original_destination_connection_id(&self) -> Option<&ConnectionId> {
        self.original_destination_connection_id.as_ref()
    }

    pub fn self_connection_ids(&self) -> &[ConnectionIdData] {
        &self.self_connection_ids
    }

    pub fn peer_connection_ids(&self) -> &[(u64, ConnectionId, StatelessResetToken)] {
        &self.peer_connection_ids
    }

    pub fn outstanding(&self) -> &OutstandingPackets {
        &self.outstanding
    }

    pub fn migration_state(&self) -> &MigrationState {
        &self.migration_state
    }

    pub fn path_validation_limiter(&self) -> Option<&PendingPathRateLimiter> {
        self.path_validation_limiter.as_ref()
    }

    pub fn has_initial_ciphers(&self) -> bool {
        self.initial_write_cipher.is_some() && self.initial_header_cipher.is_some()
    }

    pub fn has_handshake_write_ciphers(&self) -> bool {
        self.handshake_write_cipher.is_some() && self.handshake_write_header_cipher.is_some()
    }

    pub fn has_one_rtt_write_ciphers(&self) -> bool {
        self.one_rtt_write_cipher.is_some() && self.one_rtt_write_header_cipher.is_some()
    }

    pub fn used_zero_rtt(&self) -> bool {
        self.used_zero_rtt
    }

    pub fn transport_parameters_encoded(&self) -> bool {
        self.transport_parameters_encoded
    }

    pub fn can_be_paced(&self) -> bool {
        self.can_be_paced
    }

    pub fn source_token_matching(&self) -> bool {
        self.source_token_matching
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        self.peer_idle_timeout
    }

    pub fn peer_min_ack_delay(&self) -> Option<Duration> {
        self.peer_min_ack_delay
    }

    pub fn peer_ack_delay_exponent(&self) -> u8 {
        self.peer_ack_delay_exponent
    }

    pub fn peer_active_connection_id_limit(&self) -> u64 {
        self.peer_active_connection_id_limit
    }

    pub fn peer_max_udp_payload_size(&self) -> Option<u64> {
        self.peer_max_udp_payload_size
    }

    pub fn udp_send_packet_len(&self) -> u64 {
        self.udp_send_packet_len
    }

    /// Bytes the sender may put on the wire right now: congestion window
    /// capped by the amplification guard while the address is unvalidated.
    pub fn writable_bytes(&self) -> u64 {
        let congestion = self.congestion_controller.get_writable_bytes();
        match self.writable_bytes_limit {
            Some(limit) => congestion.min(limit),
            None => congestion,
        }
    }

    /// Next send-side packet number for a space.
    pub fn next_packet_num(&self, space: PacketNumberSpace) -> u64 {
        self.ack_states.get(space).next_packet_num
    }

    /// Earliest loss-timer deadline; AppData only counts once 1-RTT write
    /// keys exist.
    pub fn earliest_loss_time(&self) -> Option<(Instant, PacketNumberSpace)> {
        self.outstanding
            .earliest_loss_time(self.one_rtt_write_cipher.is_some())
    }

    /// Buffered 0-RTT datagrams; taking them retires the buffer.
    pub fn take_pending_zero_rtt_data(&mut self) -> Option<Vec<ReadData>> {
        self.pending_zero_rtt_data.take()
    }

    /// Buffered 1-RTT datagrams; taking them retires the buffer.
    pub fn take_pending_one_rtt_data(&mut self) -> Option<Vec<ReadData>> {
        self.pending_one_rtt_data.take()
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    pub fn on_read_data(&mut self, read_data: ReadData) -> Result<ProcessOutcome, TransportError> {
        match self.state {
            ServerState::Open => self.on_read_data_from_open(read_data),
            ServerState::Closed => self.on_read_data_from_closed(read_data),
        }
    }

    fn on_read_data_from_open(
        &mut self,
        read_data: ReadData,
    ) -> Result<ProcessOutcome, TransportError> {
        debug_assert_eq!(self.state, ServerState::Open);
        if read_data.data.is_empty() {
            return Ok(ProcessOutcome::Processed);
        }
        if self.read_codec.is_none() && !self.handle_first_packet(&read_data)? {
            return Ok(ProcessOutcome::Processed);
        }

        let mut udp_data = BytesMut::from(&read_data.data[..]);
        let mut processed_packets = 0;
        while !udp_data.is_empty() && processed_packets < MAX_NUM_COALESCED_PACKETS {
            processed_packets += 1;
            let data_size = udp_data.len();
            let parsed = self
                .read_codec
                .as_mut()
                .expect("codec installed by bootstrap")
                .parse_packet(&mut udp_data, &self.ack_states);
            let packet_size = data_size - udp_data.len();

            let regular: Box<RegularPacket> = match parsed {
                CodecResult::CipherUnavailable { packet, protection_type } => {
                    self.handle_cipher_unavailable(
                        packet,
                        protection_type,
                        packet_size,
                        &read_data,
                    );
                    self.count_packet_drop(PacketDropReason::ParseError);
                    continue;
                }
                CodecResult::Retry => {
                    // The server is not supposed to receive a retry.
                    self.log_packet_drop(packet_size, PacketDropReason::Retry);
                    self.count_packet_drop(PacketDropReason::ParseError);
                    continue;
                }
                CodecResult::StatelessReset => {
                    self.log_packet_drop(packet_size, PacketDropReason::Reset);
                    self.count_packet_drop(PacketDropReason::ParseError);
                    continue;
                }
                CodecResult::Nothing => {
                    self.log_packet_drop(packet_size, PacketDropReason::CipherUnavailable);
                    self.count_packet_drop(PacketDropReason::ParseError);
                    continue;
                }
                CodecResult::Regular(regular) => regular,
            };

            if regular.frames.is_empty() {
                // Parseable header but no payload frames.
                self.record_packet_drop(packet_size, PacketDropReason::ProtocolViolation);
                return Err(TransportError::new(
                    TransportErrorCode::ProtocolViolation,
                    "Packet has no frames",
                ));
            }

            let protection_type = regular.header.protection_type;
            let encryption_level = protection_type.encryption_level();
            let packet_num = regular.header.packet_num;
            let pn_space = protection_type.packet_number_space();
            let is_protected_packet = matches!(
                protection_type,
                ProtectionType::ZeroRtt
                    | ProtectionType::KeyPhaseZero
                    | ProtectionType::KeyPhaseOne
            );

            if !is_protected_packet {
                for frame in &regular.frames {
                    if !frame.allowed_before_app_data() {
                        self.record_packet_drop(packet_size, PacketDropReason::ProtocolViolation);
                        return Err(TransportError::new(
                            TransportErrorCode::ProtocolViolation,
                            "Invalid frame",
                        ));
                    }
                }
            }

            debug_assert!(self.client_connection_id.is_some());
            if let Some(observer) = self.observer.as_mut() {
                observer.add_packet(packet_num, packet_size);
            }
            // The higher layer validates that the version is supported; the
            // first valid long header pins it.
            if self.version.is_none() {
                let Some(version) = regular.header.version else {
                    return Err(TransportError::new(
                        TransportErrorCode::ProtocolViolation,
                        "Invalid packet type",
                    ));
                };
                self.version = Some(version);
                if version == QuicVersion::Experimental {
                    self.set_experimental_settings();
                }
            }

            if self.peer_address != read_data.peer {
                if encryption_level != EncryptionLevel::AppData {
                    self.record_packet_drop(packet_size, PacketDropReason::PeerAddressChange);
                    return Err(TransportError::new(
                        TransportErrorCode::InvalidMigration,
                        "Migration not allowed during handshake",
                    ));
                }
                if self.transport_settings.disable_migration {
                    self.record_packet_drop(packet_size, PacketDropReason::PeerAddressChange);
                    return Err(TransportError::new(
                        TransportErrorCode::InvalidMigration,
                        "Migration disabled",
                    ));
                }
            }

            let out_of_order = update_largest_received_packet_num(
                self.ack_states.get_mut(pn_space),
                packet_num,
                read_data.receive_time,
            );
            if out_of_order {
                if let Some(stats) = self.stats_callback.as_mut() {
                    stats.on_out_of_order_packet_received();
                }
            }
            debug_assert!(self.ack_states.has_received_packets());

            let header_is_long = regular.header.is_long_header();
            let header_dst_cid = regular.header.dst_cid.clone();

            let outcome = self.process_frames(
                *regular,
                &read_data,
                pn_space,
                encryption_level,
            )?;
            if outcome.peer_closed {
                self.on_server_close();
                return Ok(ProcessOutcome::ClosedByPeer);
            }

            if outcome.handshake_done_acked {
                // Run outside the frame loop to avoid re-entrancy.
                self.handshake_confirmed();
            }

            // Grow the amplification allowance before handshake processing
            // so an undecided validation does not inflate it.
            self.update_writable_byte_limit_on_recv_packet();

            if self.peer_address != read_data.peer {
                if outcome.non_probing {
                    if Some(packet_num)
                        == self.ack_states.get(pn_space).largest_received_packet_num
                    {
                        let intentional_migration = !header_is_long
                            && self.server_connection_id.as_ref() != Some(&header_dst_cid);
                        self.on_connection_migration(
                            read_data.peer,
                            intentional_migration,
                            read_data.receive_time,
                        )?;
                    }
                } else {
                    // A probing-only packet would need a PATH_RESPONSE to the
                    // new address without moving the peer address.
                    self.record_packet_drop(packet_size, PacketDropReason::PeerAddressChange);
                    return Err(TransportError::new(
                        TransportErrorCode::InvalidMigration,
                        "Probing not supported yet",
                    ));
                }
            }

            // Read contiguous crypto bytes and drive the handshake.
            if let Some(data) = self.crypto_state.stream_mut(encryption_level).read_available() {
                self.handshake_layer.do_handshake(data, encryption_level)?;
                if let Err(err) = self.update_handshake_state() {
                    self.record_packet_drop(
                        packet_size,
                        PacketDropReason::TransportParameterError,
                    );
                    return Err(err);
                }
                // Queue whatever the handshake wants on the wire.
                for level in [
                    EncryptionLevel::Initial,
                    EncryptionLevel::Handshake,
                    EncryptionLevel::AppData,
                ] {
                    if let Some(output) = self.handshake_layer.take_pending_output(level) {
                        self.crypto_state.stream_mut(level).write(output);
                    }
                }
            }

            update_ack_send_state_on_recv_packet(
                &self.transport_settings,
                self.ack_states.get_mut(pn_space),
                &mut self.pending_events.schedule_ack_timeout,
                out_of_order,
                outcome.has_retransmittable_data,
                outcome.has_crypto_data,
            );

            // Handshake keys in use: initial keys are done on both sides and
            // the Initial crypto stream is implicitly acknowledged.
            if encryption_level == EncryptionLevel::Handshake
                && self.initial_write_cipher.is_some()
            {
                self.initial_write_cipher = None;
                self.initial_header_cipher = None;
                let codec = self.read_codec.as_mut().expect("codec installed");
                codec.set_initial_read_cipher(None);
                codec.set_initial_header_cipher(None);
                self.crypto_state.initial.implicit_ack();
                self.outstanding.discard_space(PacketNumberSpace::Initial);
            }
            if let Some(stats) = self.stats_callback.as_mut() {
                stats.on_packet_processed();
            }
        }
        if !udp_data.is_empty() {
            trace!(
                unprocessed = udp_data.len(),
                max = MAX_NUM_COALESCED_PACKETS,
                "leaving bytes unprocessed after coalesced packet cap"
            );
        }
        Ok(ProcessOutcome::Processed)
    }

    /// First packet from the peer: parse the invariant, issue a server CID,
    /// install initial ciphers, seed the codec, and hand the handshake layer
    /// our transport parameters.
    fn handle_first_packet(&mut self, read_data: &ReadData) -> Result<bool, TransportError> {
        let Some(parsed) = parse_long_header_invariant(&read_data.data) else {
            debug!("could not parse initial packet header");
            self.record_packet_drop(0, PacketDropReason::ParseError);
            return Ok(false);
        };
        let version = parsed.version;
        if version == QuicVersion::VersionNegotiation {
            debug!("server dropping version negotiation packet");
            self.record_packet_drop(0, PacketDropReason::InvalidPacket);
            return Ok(false);
        }
        let client_connection_id = parsed.src_cid;
        let initial_destination_connection_id = parsed.dst_cid;
        if initial_destination_connection_id.len() < DEFAULT_CONNECTION_ID_SIZE {
            debug!("initial connection id too small");
            self.record_packet_drop(0, PacketDropReason::InitialConnidSmall);
            return Ok(false);
        }

        debug_assert!(self.server_connection_id.is_none());
        let new_conn_id_data = self.create_and_add_new_self_conn_id().ok_or_else(|| {
            TransportError::new(
                TransportErrorCode::InternalError,
                "Failed to encode server connection id",
            )
        })?;
        self.server_connection_id = Some(new_conn_id_data.conn_id.clone());
        self.client_connection_id = Some(client_connection_id.clone());
        self.original_destination_connection_id =
            Some(initial_destination_connection_id.clone());

        let custom_transport_params = self.set_supported_extension_transport_parameters();
        // Counted at token issuance: one reset token minted per connection.
        if let Some(stats) = self.stats_callback.as_mut() {
            stats.on_stateless_reset();
        }
        let settings = &self.transport_settings;
        self.handshake_layer.accept(ServerTransportParameters::build(
            ServerParametersConfig {
                initial_max_data: settings.advertised_initial_connection_window_size,
                initial_max_stream_data_bidi_local: settings
                    .advertised_initial_bidi_local_stream_window_size,
                initial_max_stream_data_bidi_remote: settings
                    .advertised_initial_bidi_remote_stream_window_size,
                initial_max_stream_data_uni: settings.advertised_initial_uni_stream_window_size,
                initial_max_streams_bidi: settings.advertised_initial_max_streams_bidi,
                initial_max_streams_uni: settings.advertised_initial_max_streams_uni,
                idle_timeout_ms: settings.idle_timeout.as_millis() as u64,
                ack_delay_exponent: settings.ack_delay_exponent,
                max_recv_packet_size: settings.max_recv_packet_size,
                stateless_reset_token: new_conn_id_data.token.expect("token generated"),
                initial_source_connection_id: new_conn_id_data.conn_id.clone(),
                original_destination_connection_id: initial_destination_connection_id.clone(),
            },
            custom_transport_params,
        ));
        self.transport_parameters_encoded = true;

        let mut codec = self.codec_factory.make_codec();
        {
            let crypto_factory = self.handshake_layer.crypto_factory();
            codec.set_initial_read_cipher(Some(
                crypto_factory
                    .make_client_initial_cipher(&initial_destination_connection_id, version)?,
            ));
            codec.set_initial_header_cipher(Some(
                crypto_factory.make_client_initial_header_cipher(
                    &initial_destination_connection_id,
                    version,
                )?,
            ));
            self.initial_write_cipher = Some(
                crypto_factory
                    .make_server_initial_cipher(&initial_destination_connection_id, version)?,
            );
            self.initial_header_cipher = Some(
                crypto_factory.make_server_initial_header_cipher(
                    &initial_destination_connection_id,
                    version,
                )?,
            );
        }
        codec.set_client_connection_id(client_connection_id.clone());
        codec.set_server_connection_id(new_conn_id_data.conn_id.clone());
        codec.set_codec_parameters(CodecParameters {
            peer_ack_delay_exponent: self.peer_ack_delay_exponent,
            version,
        });
        if let Some(observer) = self.observer.as_mut() {
            observer.set_scid(&new_conn_id_data.conn_id);
            observer.set_dcid(&initial_destination_connection_id);
        }
        self.read_codec = Some(codec);
        self.peer_address = self.original_peer_address;
        debug!(
            client_cid = %client_connection_id,
            server_cid = %new_conn_id_data.conn_id,
            "bootstrapped connection from first packet"
        );
        Ok(true)
    }

    /// A packet arrived for keys we do not have yet: buffer 0-RTT/1-RTT
    /// packets within budget, drop everything else.
    fn handle_cipher_unavailable(
        &mut self,
        packet: Bytes,
        protection_type: ProtectionType,
        packet_size: usize,
        read_data: &ReadData,
    ) {
        if packet.is_empty() {
            self.log_packet_drop(packet_size, PacketDropReason::NoData);
            return;
        }
        if protection_type != ProtectionType::ZeroRtt
            && protection_type != ProtectionType::KeyPhaseZero
        {
            self.log_packet_drop(packet_size, PacketDropReason::UnexpectedProtectionLevel);
            return;
        }
        let combined_size = self.pending_zero_rtt_data.as_ref().map_or(0, Vec::len)
            + self.pending_one_rtt_data.as_ref().map_or(0, Vec::len);
        if combined_size >= self.transport_settings.max_packets_to_buffer {
            self.log_packet_drop(packet_size, PacketDropReason::MaxBuffered);
            return;
        }
        let pending = if protection_type == ProtectionType::ZeroRtt {
            &mut self.pending_zero_rtt_data
        } else {
            &mut self.pending_one_rtt_data
        };
        match pending {
            Some(list) => {
                list.push(ReadData {
                    peer: read_data.peer,
                    data: packet,
                    receive_time: read_data.receive_time,
                });
                let buffered = list.len();
                if let Some(observer) = self.observer.as_mut() {
                    observer.add_packet_buffered(protection_type, packet_size);
                }
                trace!(?protection_type, buffered, "buffered packet pending keys");
            }
            None => {
                self.log_packet_drop(packet_size, PacketDropReason::BufferUnavailable);
            }
        }
    }

    fn process_frames(
        &mut self,
        regular: RegularPacket,
        read_data: &ReadData,
        pn_space: PacketNumberSpace,
        encryption_level: EncryptionLevel,
    ) -> Result<FrameLoopOutcome, TransportError> {
        let now = read_data.receive_time;
        let mut outcome = FrameLoopOutcome::default();
        for frame in regular.frames {
            match frame {
                Frame::Ack(ack_frame) => {
                    outcome.non_probing = true;
                    let (event, acked_frames) = process_ack_frame(
                        &mut self.outstanding,
                        pn_space,
                        &ack_frame,
                        now,
                    );
                    for acked in acked_frames {
                        match acked.frame {
                            SentFrame::Stream { stream_id, offset, len, fin } => {
                                if self
                                    .streams
                                    .find_stream(stream_id)
                                    .map(|stream| on_stream_frame_acked(stream, offset, len, fin))
                                    .is_some()
                                {
                                    self.streams.add_deliverable(stream_id);
                                    self.streams.update_writable_streams(stream_id);
                                }
                            }
                            SentFrame::Crypto { level, offset, len } => {
                                self.crypto_state.stream_mut(level).on_ack(offset, len);
                            }
                            SentFrame::Ack { largest_acked } => {
                                self.ack_states
                                    .get_mut(pn_space)
                                    .prune_acks_through(largest_acked);
                            }
                            SentFrame::RstStream { stream_id, .. } => {
                                if let Some(stream) = self.streams.find_stream(stream_id) {
                                    on_rst_stream_acked(stream);
                                }
                            }
                            SentFrame::Ping => {
                                if !acked.is_d6d_probe {
                                    self.pending_events.cancel_ping_timeout = true;
                                }
                            }
                            SentFrame::Simple(SimpleFrame::HandshakeDone) => {
                                // Applied after the frame loop to avoid
                                // re-entrancy.
                                outcome.handshake_done_acked = true;
                            }
                            _ => {}
                        }
                    }
                    if let Some(sample) = event.rtt_sample {
                        update_rtt(&mut self.rtt, sample, event.ack_delay);
                        if let Some(observer) = self.observer.as_mut() {
                            observer.add_metric_update(
                                self.rtt.lrtt,
                                self.rtt.mrtt,
                                self.rtt.srtt,
                                event.ack_delay,
                            );
                        }
                    }
                    self.congestion_controller.on_packet_ack_or_loss(Some(&event), None);
                }
                Frame::RstStream(frame) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    let mut ctx = stream_ctx!(self, now);
                    if let Some(stream) = self.streams.get_stream(frame.stream_id, &mut ctx)? {
                        let delta = frame.final_size.saturating_sub(stream.max_offset_observed);
                        on_connection_data_received(&mut self.flow_control, delta)?;
                        let buffered = stream.read_buffer.buffered_len();
                        receive_rst_stream(stream, frame.error_code, frame.final_size)?;
                        self.flow_control.sum_cur_stream_buffer_len = self
                            .flow_control
                            .sum_cur_stream_buffer_len
                            .saturating_sub(buffered);
                        self.streams.update_readable_streams(frame.stream_id, now);
                    }
                }
                Frame::Crypto(frame) => {
                    outcome.has_retransmittable_data = true;
                    outcome.has_crypto_data = true;
                    outcome.non_probing = true;
                    trace!(
                        offset = frame.offset,
                        len = frame.data.len(),
                        level = ?encryption_level,
                        "received crypto data"
                    );
                    self.crypto_state
                        .stream_mut(encryption_level)
                        .append_to_read_buffer(frame.offset, frame.data);
                }
                Frame::Stream(frame) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    let mut ctx = stream_ctx!(self, now);
                    // Data for closed streams we no longer track is ignored.
                    if let Some(stream) = self.streams.get_stream(frame.stream_id, &mut ctx)? {
                        let frame_end = frame.offset + frame.data.len() as u64;
                        let delta = on_stream_data_received(stream, frame_end)?;
                        on_connection_data_received(&mut self.flow_control, delta)?;
                        let before = stream.read_buffer.buffered_len();
                        receive_stream_frame(stream, frame.offset, frame.data, frame.fin)?;
                        let after = stream.read_buffer.buffered_len();
                        self.flow_control.sum_cur_stream_buffer_len += after - before;
                        self.streams.update_readable_streams(frame.stream_id, now);
                    }
                }
                Frame::MaxData(maximum_data) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    handle_conn_window_update(&mut self.flow_control, maximum_data);
                }
                Frame::MaxStreamData(frame) => {
                    if frame.stream_id.is_receiving_stream_for_server() {
                        return Err(TransportError::new(
                            TransportErrorCode::StreamStateError,
                            "Received MaxStreamDataFrame for receiving stream.",
                        ));
                    }
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    let mut ctx = stream_ctx!(self, now);
                    if let Some(stream) = self.streams.get_stream(frame.stream_id, &mut ctx)? {
                        if handle_stream_window_update(stream, frame.maximum_data) {
                            self.streams.update_writable_streams(frame.stream_id);
                        }
                    }
                }
                Frame::MaxStreams(frame) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    if frame.bidirectional {
                        self.streams
                            .set_max_local_bidirectional_streams(frame.stream_limit, false)?;
                    } else {
                        self.streams
                            .set_max_local_unidirectional_streams(frame.stream_limit, false)?;
                    }
                }
                Frame::DataBlocked { .. } => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    handle_conn_blocked(&mut self.flow_control);
                }
                Frame::StreamDataBlocked { stream_id, .. } => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    let mut ctx = stream_ctx!(self, now);
                    if self.streams.get_stream(stream_id, &mut ctx)?.is_some() {
                        self.streams.add_window_update(stream_id);
                    }
                }
                Frame::StreamsBlocked(frame) => {
                    // The peer wants to open a stream beyond the limit we
                    // set; the windowed MAX_STREAMS path handles credit.
                    outcome.non_probing = true;
                    trace!(
                        limit = frame.stream_limit,
                        bidirectional = frame.bidirectional,
                        "peer streams blocked"
                    );
                }
                Frame::ConnectionClose(frame) => {
                    outcome.non_probing = true;
                    let err_msg =
                        format!("Server closed by peer reason={}", frame.reason_phrase);
                    debug!(error_code = frame.error_code, "{err_msg}");
                    if let Some(observer) = self.observer.as_mut() {
                        observer.add_transport_state_update(&err_msg);
                    }
                    // App callbacks get the peer-supplied error; the peer
                    // gets a NO_ERROR close from us.
                    self.peer_connection_error = Some((frame.error_code, err_msg));
                    outcome.peer_closed = true;
                    return Ok(outcome);
                }
                Frame::Ping => {
                    outcome.non_probing = true;
                    // Ping is not data, but it should be acked early.
                    outcome.has_retransmittable_data = true;
                }
                Frame::Padding => {}
                Frame::Datagram(frame) => {
                    // Count toward the ack policy so datagrams are acked
                    // early.
                    outcome.has_retransmittable_data = true;
                    self.handle_datagram(frame.data);
                }
                Frame::Simple(simple) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing |=
                        self.update_simple_frame_on_packet_received(simple)?;
                }
                Frame::StopSending(frame) => {
                    outcome.has_retransmittable_data = true;
                    outcome.non_probing = true;
                    let mut ctx = stream_ctx!(self, now);
                    if self.streams.get_stream(frame.stream_id, &mut ctx)?.is_some() {
                        self.streams.add_stop_sending(frame.stream_id, frame.error_code);
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn update_simple_frame_on_packet_received(
        &mut self,
        frame: SimpleFrame,
    ) -> Result<bool, TransportError> {
        match frame {
            SimpleFrame::PathChallenge(data) => {
                self.pending_events.frames.push(SimpleFrame::PathResponse(data));
                Ok(false)
            }
            SimpleFrame::PathResponse(data) => {
                if self.outstanding_path_validation == Some(data) {
                    self.outstanding_path_validation = None;
                    self.pending_events.schedule_path_validation_timeout = false;
                    debug!("path validated");
                }
                Ok(false)
            }
            SimpleFrame::NewConnectionId { sequence_number, connection_id, token, .. } => {
                self.peer_connection_ids.push((sequence_number, connection_id, token));
                Ok(false)
            }
            SimpleFrame::RetireConnectionId { sequence_number } => {
                if sequence_number >= self.next_self_connection_id_sequence {
                    return Err(TransportError::new(
                        TransportErrorCode::ProtocolViolation,
                        "Retired unissued connection id",
                    ));
                }
                self.self_connection_ids
                    .retain(|data| data.sequence_number != sequence_number);
                Ok(true)
            }
            SimpleFrame::NewToken(_) => Err(TransportError::new(
                TransportErrorCode::ProtocolViolation,
                "Client sent NewToken",
            )),
            SimpleFrame::HandshakeDone => Err(TransportError::new(
                TransportErrorCode::ProtocolViolation,
                "Client sent HandshakeDone",
            )),
        }
    }

    fn handle_datagram(&mut self, data: Bytes) {
        if data.len() as u64 > self.datagram_state.max_read_frame_size {
            trace!(len = data.len(), "dropping oversized datagram");
            return;
        }
        self.datagram_state.read_buffer.push_back(data);
        while self.datagram_state.read_buffer.len() > self.datagram_state.read_buffer_capacity {
            self.datagram_state.read_buffer.pop_front();
        }
    }

    // ========================================================================
    // Handshake state
    // ========================================================================

    /// Pull newly derived ciphers out of the handshake layer and advance the
    /// crypto level state.
    fn update_handshake_state(&mut self) -> Result<(), TransportError> {
        // Zero RTT read cipher is available after the client hello is
        // processed, when the early data attempt is accepted.
        let zero_rtt_read_cipher = self.handshake_layer.get_zero_rtt_read_cipher();
        let zero_rtt_header_cipher = self.handshake_layer.get_zero_rtt_read_header_cipher();
        // One RTT write cipher is available once the client hello is
        // processed; the read cipher only after the client finished message.
        let one_rtt_write_cipher = self.handshake_layer.get_one_rtt_write_cipher();
        let one_rtt_read_cipher = self.handshake_layer.get_one_rtt_read_cipher();
        let one_rtt_write_header_cipher =
            self.handshake_layer.get_one_rtt_write_header_cipher();
        let one_rtt_read_header_cipher = self.handshake_layer.get_one_rtt_read_header_cipher();
        let handshake_read_cipher = self.handshake_layer.get_handshake_read_cipher();
        let handshake_read_header_cipher =
            self.handshake_layer.get_handshake_read_header_cipher();
        let handshake_write_cipher = self.handshake_layer.get_handshake_write_cipher();
        let handshake_write_header_cipher =
            self.handshake_layer.get_handshake_write_header_cipher();

        if let Some(cipher) = zero_rtt_read_cipher {
            self.used_zero_rtt = true;
            if let Some(observer) = self.observer.as_mut() {
                observer.add_transport_state_update("Derived 0-rtt read cipher");
            }
            let codec = self.read_codec.as_mut().expect("codec installed");
            codec.set_zero_rtt_read_cipher(Some(cipher));
        }
        if let Some(cipher) = zero_rtt_header_cipher {
            let codec = self.read_codec.as_mut().expect("codec installed");
            codec.set_zero_rtt_header_cipher(Some(cipher));
        }
        if let Some(cipher) = one_rtt_write_header_cipher {
            self.one_rtt_write_header_cipher = Some(cipher);
        }
        if let Some(cipher) = one_rtt_read_header_cipher {
            let codec = self.read_codec.as_mut().expect("codec installed");
            codec.set_one_rtt_header_cipher(Some(cipher));
        }
        if let Some(cipher) = handshake_write_cipher {
            self.handshake_write_cipher = Some(cipher);
            self.handshake_write_header_cipher = handshake_write_header_cipher;
        }

        if let Some(cipher) = one_rtt_write_cipher {
            if let Some(observer) = self.observer.as_mut() {
                observer.add_transport_state_update("Derived 1-rtt write cipher");
            }
            if self.one_rtt_write_cipher.is_some() {
                return Err(TransportError::new(
                    TransportErrorCode::CryptoError,
                    "Duplicate 1-rtt write cipher",
                ));
            }
            self.one_rtt_write_cipher = Some(cipher);
            self.update_pacing_on_key_established();

            // Transport parameters are negotiated as soon as the 1-RTT write
            // keys exist.
            let Some(client_params) = self.handshake_layer.get_client_transport_params() else {
                return Err(TransportError::new(
                    TransportErrorCode::TransportParameterError,
                    "No client transport params",
                ));
            };
            self.process_client_initial_params(client_params)?;
        }
        if let Some(cipher) = one_rtt_read_cipher {
            if let Some(observer) = self.observer.as_mut() {
                observer.add_transport_state_update("Derived 1-rtt read cipher");
            }
            // The client finished message is in; the address is validated.
            self.writable_bytes_limit = None;
            let codec = self.read_codec.as_mut().expect("codec installed");
            codec.set_one_rtt_read_cipher(Some(cipher));
        }
        if let Some(cipher) = handshake_read_cipher {
            debug_assert!(handshake_read_header_cipher.is_some());
            let codec = self.read_codec.as_mut().expect("codec installed");
            codec.set_handshake_read_cipher(Some(cipher));
            codec.set_handshake_header_cipher(handshake_read_header_cipher);
        }
        if self.handshake_layer.is_handshake_done() {
            debug_assert!(self.one_rtt_write_cipher.is_some());
            if !self.sent_handshake_done {
                self.pending_events.frames.push(SimpleFrame::HandshakeDone);
                self.sent_handshake_done = true;
            }
        }
        Ok(())
    }

    /// HandshakeDone was acknowledged: the handshake is confirmed, the
    /// handshake level retires, and its timers go away.
    fn handshake_confirmed(&mut self) {
        self.pending_events.cancel_handshake_timers = true;
        self.handshake_write_cipher = None;
        self.handshake_write_header_cipher = None;
        if let Some(codec) = self.read_codec.as_mut() {
            codec.set_handshake_read_cipher(None);
            codec.set_handshake_header_cipher(None);
        }
        self.crypto_state.handshake.implicit_ack();
        self.outstanding.discard_space(PacketNumberSpace::Handshake);
        self.writable_bytes_limit = None;
        if let Some(observer) = self.observer.as_mut() {
            observer.add_transport_state_update("Handshake confirmed");
        }
    }

    fn update_pacing_on_key_established(&mut self) {
        self.can_be_paced = self.transport_settings.pacing_enabled;
    }

    /// Validate and apply the client's transport parameters. Runs once, when
    /// the 1-RTT write cipher appears.
    fn process_client_initial_params(
        &mut self,
        client_params: ClientTransportParameters,
    ) -> Result<(), TransportError> {
        use TransportParameterId as Id;

        if matches!(self.version, Some(QuicVersion::V1 | QuicVersion::Draft29)) {
            let initial_source_conn_id =
                client_params.get_conn_id(Id::InitialSourceConnectionId)?;
            let expected = self
                .read_codec
                .as_ref()
                .and_then(|codec| codec.client_connection_id().cloned());
            if initial_source_conn_id.is_none() || initial_source_conn_id != expected {
                return Err(TransportError::new(
                    TransportErrorCode::TransportParameterError,
                    "Initial CID does not match.",
                ));
            }
        }

        // Parameters a client must never send.
        if client_params.contains(Id::PreferredAddress) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "Preferred Address is received by server",
            ));
        }
        if client_params.contains(Id::OriginalDestinationConnectionId) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "OriginalDestinationConnectionId is received by server",
            ));
        }
        if client_params.contains(Id::StatelessResetToken) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "Stateless Reset Token is received by server",
            ));
        }
        if client_params.contains(Id::RetrySourceConnectionId) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "Retry Source Connection ID is received by server",
            ));
        }

        let max_ack_delay = client_params.get_integer(Id::MaxAckDelay)?;
        if max_ack_delay.is_some_and(|delay| delay >= MAX_ACK_DELAY_MS) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "Max Ack Delay is greater than 2^14 ",
            ));
        }
        let packet_size = client_params.get_integer(Id::MaxUdpPayloadSize)?;
        if let Some(size) = packet_size {
            if size < MIN_MAX_UDP_PAYLOAD {
                return Err(TransportError::new(
                    TransportErrorCode::TransportParameterError,
                    format!("Max packet size too small. received max_packetSize = {size}"),
                ));
            }
        }

        let max_data = client_params.get_integer(Id::InitialMaxData)?;
        let max_stream_data_bidi_local =
            client_params.get_integer(Id::InitialMaxStreamDataBidiLocal)?;
        let max_stream_data_bidi_remote =
            client_params.get_integer(Id::InitialMaxStreamDataBidiRemote)?;
        let max_stream_data_uni = client_params.get_integer(Id::InitialMaxStreamDataUni)?;
        trace!(
            conn = max_data.unwrap_or(0),
            bidi_local = max_stream_data_bidi_local.unwrap_or(0),
            bidi_remote = max_stream_data_bidi_remote.unwrap_or(0),
            uni = max_stream_data_uni.unwrap_or(0),
            "client advertised flow control"
        );
        self.flow_control.peer_advertised_max_offset = max_data.unwrap_or(0);
        self.streams.set_peer_stream_windows(
            max_stream_data_bidi_local.unwrap_or(0),
            max_stream_data_bidi_remote.unwrap_or(0),
            max_stream_data_uni.unwrap_or(0),
        );

        let max_streams_bidi = client_params.get_integer(Id::InitialMaxStreamsBidi)?;
        let max_streams_uni = client_params.get_integer(Id::InitialMaxStreamsUni)?;
        self.streams
            .set_max_local_bidirectional_streams(max_streams_bidi.unwrap_or(0), false)?;
        self.streams
            .set_max_local_unidirectional_streams(max_streams_uni.unwrap_or(0), false)?;

        let idle_timeout = client_params.get_integer(Id::MaxIdleTimeout)?;
        self.peer_idle_timeout =
            Duration::from_millis(idle_timeout.unwrap_or(0)).min(MAX_IDLE_TIMEOUT);

        let ack_delay_exponent = client_params.get_integer(Id::AckDelayExponent)?;
        if ack_delay_exponent.is_some_and(|exp| exp > MAX_ACK_DELAY_EXPONENT) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "ack_delay_exponent too large",
            ));
        }
        self.peer_ack_delay_exponent =
            ack_delay_exponent.unwrap_or(DEFAULT_ACK_DELAY_EXPONENT as u64) as u8;

        if let Some(min_ack_delay) = client_params.get_integer(Id::MinAckDelay)? {
            self.peer_min_ack_delay = Some(Duration::from_micros(min_ack_delay));
        }
        if let Some(max_datagram_frame_size) =
            client_params.get_integer(Id::MaxDatagramFrameSize)?
        {
            if max_datagram_frame_size > 0
                && max_datagram_frame_size <= MAX_DATAGRAM_PACKET_OVERHEAD
            {
                return Err(TransportError::new(
                    TransportErrorCode::TransportParameterError,
                    "max_datagram_frame_size too small",
                ));
            }
            self.datagram_state.max_write_frame_size = max_datagram_frame_size;
        }

        // Upper limit for PMTU probing.
        let mut max_udp_payload_size = DEFAULT_MAX_UDP_PAYLOAD;
        if let Some(size) = packet_size {
            max_udp_payload_size = size.min(max_udp_payload_size);
            self.peer_max_udp_payload_size = Some(max_udp_payload_size);
            if self.transport_settings.can_ignore_path_mtu {
                if size > DEFAULT_MAX_UDP_PAYLOAD {
                    // An oversized limit is never trusted.
                    self.udp_send_packet_len = DEFAULT_UDP_SEND_PACKET_LEN;
                } else {
                    self.udp_send_packet_len = max_udp_payload_size;
                }
            }
        }

        self.peer_active_connection_id_limit = client_params
            .get_integer(Id::ActiveConnectionIdLimit)?
            .unwrap_or(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT);

        if self.transport_settings.d6d_config.enabled {
            let base_pmtu = client_params.get_integer(Id::D6DBasePmtu)?;
            if let Some(base) = base_pmtu {
                if (MIN_MAX_UDP_PAYLOAD..=DEFAULT_MAX_UDP_PAYLOAD).contains(&base) {
                    // Probing below udp_send_packet_len would only add delay
                    // on the way to the upper bound.
                    self.d6d.base_pmtu = Some(base.max(self.udp_send_packet_len));
                    self.d6d.max_pmtu = Some(max_udp_payload_size);
                    self.d6d.no_blackhole_detection = true;
                } else {
                    warn!(base_pmtu = base, "client d6d base PMTU fails sanity check");
                    // The base PMTU parameter is the client's switch to turn
                    // d6d on; without a valid one the rest is moot.
                    return Ok(());
                }
            } else {
                return Ok(());
            }
            if let Some(raise) = client_params.get_integer(Id::D6DRaiseTimeout)? {
                let raise = Duration::from_secs(raise);
                if raise >= MIN_D6D_RAISE_TIMEOUT {
                    self.d6d.raise_timeout = Some(raise);
                } else {
                    warn!(?raise, "client d6d raise timeout fails sanity check");
                }
            }
            if let Some(probe) = client_params.get_integer(Id::D6DProbeTimeout)? {
                let probe = Duration::from_secs(probe);
                if probe >= MIN_D6D_PROBE_TIMEOUT {
                    self.d6d.probe_timeout = Some(probe);
                } else {
                    warn!(?probe, "client d6d probe timeout fails sanity check");
                }
            }
        }
        Ok(())
    }

    /// Extension transport parameters advertised beyond the base set.
    fn set_supported_extension_transport_parameters(&mut self) -> Vec<TransportParameter> {
        let mut custom_transport_params = Vec::new();
        if self.transport_settings.datagram_config.enabled {
            custom_transport_params.push(TransportParameter::integral(
                TransportParameterId::MaxDatagramFrameSize,
                self.datagram_state.max_read_frame_size,
            ));
        }
        custom_transport_params
    }

    /// Hook for staged experiments negotiated via the experimental version.
    fn set_experimental_settings(&mut self) {
        // Experimental deployments currently configure their initial cwnd in
        // the worker before the congestion controller is built.
    }

    // ========================================================================
    // Closed state
    // ========================================================================

    fn on_read_data_from_closed(
        &mut self,
        read_data: ReadData,
    ) -> Result<ProcessOutcome, TransportError> {
        debug_assert_eq!(self.state, ServerState::Closed);
        let packet_size = read_data.data.len();
        if self.read_codec.is_none() {
            // Closed before the first packet was ever processed.
            self.record_packet_drop(packet_size, PacketDropReason::ServerStateClosed);
            return Ok(ProcessOutcome::Processed);
        }
        if self.peer_connection_error.is_some() {
            // Already got a peer error; further ones are noise.
            self.record_packet_drop(packet_size, PacketDropReason::ServerStateClosed);
            return Ok(ProcessOutcome::Processed);
        }
        let mut udp_data = BytesMut::from(&read_data.data[..]);
        let parsed = self
            .read_codec
            .as_mut()
            .expect("checked above")
            .parse_packet(&mut udp_data, &self.ack_states);
        let regular: Box<RegularPacket> = match parsed {
            CodecResult::CipherUnavailable { .. } | CodecResult::Nothing => {
                self.log_packet_drop(packet_size, PacketDropReason::CipherUnavailable);
                self.count_packet_drop(PacketDropReason::ParseError);
                return Ok(ProcessOutcome::Processed);
            }
            CodecResult::Retry => {
                self.log_packet_drop(packet_size, PacketDropReason::Retry);
                self.count_packet_drop(PacketDropReason::ParseError);
                return Ok(ProcessOutcome::Processed);
            }
            CodecResult::StatelessReset => {
                self.log_packet_drop(packet_size, PacketDropReason::Reset);
                self.count_packet_drop(PacketDropReason::ParseError);
                return Ok(ProcessOutcome::Processed);
            }
            CodecResult::Regular(regular) => regular,
        };
        if regular.frames.is_empty() {
            self.record_packet_drop(packet_size, PacketDropReason::ProtocolViolation);
            return Err(TransportError::new(
                TransportErrorCode::ProtocolViolation,
                "Packet has no frames",
            ));
        }
        let packet_num = regular.header.packet_num;
        let pn_space = regular.header.protection_type.packet_number_space();
        if let Some(observer) = self.observer.as_mut() {
            observer.add_packet(packet_num, packet_size);
        }

        // Only close frames are considered; everything else is inert here.
        for frame in regular.frames {
            if let Frame::ConnectionClose(frame) = frame {
                let err_msg = format!("Server closed by peer reason={}", frame.reason_phrase);
                debug!(error_code = frame.error_code, "{err_msg}");
                if let Some(observer) = self.observer.as_mut() {
                    observer.add_transport_state_update(&err_msg);
                }
                self.peer_connection_error = Some((frame.error_code, err_msg));
            }
        }

        // Track the largest received packet number so the driver can decide
        // whether a fresh close must go out.
        let ack_state = self.ack_states.get_mut(pn_space);
        ack_state.largest_received_packet_num = Some(
            ack_state
                .largest_received_packet_num
                .map_or(packet_num, |largest| largest.max(packet_num)),
        );
        Ok(ProcessOutcome::Processed)
    }

    /// Transition to Closed. Idempotent; Open -> Closed happens once.
    pub fn on_server_close(&mut self) {
        if self.state == ServerState::Open {
            self.state = ServerState::Closed;
        }
    }

    /// The driver emitted a CONNECTION_CLOSE; remember what had been
    /// received so redundant closes are suppressed.
    pub fn on_close_sent(&mut self) {
        self.ack_states.update_largest_received_at_last_close_sent();
    }

    /// Whether anything new arrived since the last close was sent.
    pub fn should_resend_close(&self) -> bool {
        !self
            .ack_states
            .has_not_received_new_packets_since_last_close_sent()
    }

    // ========================================================================
    // Send-side bookkeeping
    // ========================================================================

    /// Record a packet handed to the wire: packet-number advance (with the
    /// exhaustion latch), ack send-state bookkeeping, crypto retransmission
    /// ranges, congestion accounting, and the amplification budget.
    pub fn on_packet_sent(&mut self, packet: OutstandingPacket) {
        let space = packet.space;
        debug_assert_eq!(packet.packet_num, self.ack_states.get(space).next_packet_num);
        if increase_next_packet_num(self.ack_states.get_mut(space)) {
            self.pending_events.close_transport = true;
        }
        if let Some(&SentFrame::Ack { largest_acked }) = packet
            .frames
            .iter()
            .find(|frame| matches!(frame, SentFrame::Ack { .. }))
        {
            update_ack_send_state_on_sent_packet_with_acks(
                self.ack_states.get_mut(space),
                &mut self.pending_events.schedule_ack_timeout,
                largest_acked,
            );
        }
        for frame in &packet.frames {
            if let SentFrame::Crypto { level, offset, len } = frame {
                self.crypto_state
                    .stream_mut(*level)
                    .retransmission_buffer
                    .insert(*offset, *len);
            }
        }
        if let Some(limit) = self.writable_bytes_limit {
            self.writable_bytes_limit = Some(limit.saturating_sub(packet.metadata.encoded_size));
        }
        self.congestion_controller.on_packet_sent(&packet);
        self.outstanding.on_packet_sent(packet);
    }

    /// The ack timer fired: force an immediate AppData ack.
    pub fn on_ack_timeout(&mut self) {
        update_ack_state_on_ack_timeout(
            &mut self.ack_states,
            &mut self.pending_events.schedule_ack_timeout,
        );
    }

    // ========================================================================
    // Source-address tokens & ticket refresh
    // ========================================================================

    /// Match the peer address against the addresses in a resumption token.
    ///
    /// Matching addresses move to the end of the list to raise their
    /// favorability; the reordered list is persisted for the next session
    /// ticket. Returns whether 0-RTT should be accepted.
    pub fn validate_and_update_source_token(
        &mut self,
        mut source_addresses: Vec<IpAddr>,
    ) -> bool {
        let peer_ip = self.peer_address.ip();
        let mut found_match = false;
        let mut index = source_addresses.len();
        while index > 0 {
            index -= 1;
            if source_addresses[index] == peer_ip {
                found_match = true;
                let address = source_addresses.remove(index);
                source_addresses.push(address);
            }
        }
        self.source_token_matching = found_match;
        let policy = self.transport_settings.zero_rtt_source_token_matching_policy;
        let mut accept_zero_rtt =
            found_match && policy != ZeroRttSourceTokenMatchingPolicy::AlwaysReject;

        if !found_match {
            // Remember this address for the next resumption.
            if source_addresses.len() >= MAX_NUM_TOKEN_SOURCE_ADDRESSES {
                source_addresses.remove(0);
            }
            source_addresses.push(peer_ip);
            match policy {
                ZeroRttSourceTokenMatchingPolicy::AlwaysReject
                | ZeroRttSourceTokenMatchingPolicy::RejectIfNoExactMatch => {
                    accept_zero_rtt = false;
                }
                ZeroRttSourceTokenMatchingPolicy::LimitIfNoExactMatch => {
                    accept_zero_rtt = true;
                    self.writable_bytes_limit = Some(
                        self.transport_settings.limited_cwnd_in_mss * self.udp_send_packet_len,
                    );
                }
            }
        }
        // Written back so the new-session-ticket path sees the new ordering.
        self.token_source_addresses = source_addresses;
        accept_zero_rtt
    }

    /// Apply transport settings carried in a resumption ticket.
    pub fn update_transport_params_from_ticket(
        &mut self,
        idle_timeout: Duration,
        max_recv_packet_size: u64,
        initial_max_data: u64,
        initial_max_stream_data_bidi_local: u64,
        initial_max_stream_data_bidi_remote: u64,
        initial_max_stream_data_uni: u64,
        initial_max_streams_bidi: u64,
        initial_max_streams_uni: u64,
    ) -> Result<(), TransportError> {
        let settings = &mut self.transport_settings;
        settings.idle_timeout = idle_timeout;
        settings.max_recv_packet_size = max_recv_packet_size;
        settings.advertised_initial_connection_window_size = initial_max_data;
        settings.advertised_initial_bidi_local_stream_window_size =
            initial_max_stream_data_bidi_local;
        settings.advertised_initial_bidi_remote_stream_window_size =
            initial_max_stream_data_bidi_remote;
        settings.advertised_initial_uni_stream_window_size = initial_max_stream_data_uni;
        settings.advertised_initial_max_streams_bidi = initial_max_streams_bidi;
        settings.advertised_initial_max_streams_uni = initial_max_streams_uni;

        self.flow_control.window_size = initial_max_data;
        self.flow_control.advertised_max_offset =
            self.flow_control.advertised_max_offset.max(initial_max_data);
        self.streams
            .refresh_stream_limits(initial_max_streams_bidi, initial_max_streams_uni)
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn update_writable_byte_limit_on_recv_packet(&mut self) {
        // Receiving a packet buys more send allowance; a peer could get the
        // same by opening a new connection.
        if let Some(limit) = self.writable_bytes_limit {
            self.writable_bytes_limit = Some(
                limit + self.transport_settings.limited_cwnd_in_mss * self.udp_send_packet_len,
            );
        }
    }

    fn create_and_add_new_self_conn_id(&mut self) -> Option<ConnectionIdData> {
        let generator = StatelessResetGenerator::new(
            &self.stateless_reset_token_secret,
            &self.server_addr.to_string(),
        );
        let encoded = encode_with_rejector(
            self.conn_id_algo.as_mut(),
            self.conn_id_rejector.as_deref(),
            &self.server_conn_id_params,
        )
        .ok()?;
        let token = generator.generate_token(&encoded);
        let data = ConnectionIdData {
            conn_id: encoded,
            sequence_number: self.next_self_connection_id_sequence,
            token: Some(token),
        };
        self.next_self_connection_id_sequence += 1;
        self.self_connection_ids.push(data.clone());
        Some(data)
    }

    /// Log a drop to the observer only (stats handled separately, matching
    /// the per-call-site counting policy).
    fn log_packet_drop(&mut self, size: usize, reason: PacketDropReason) {
        trace!(%reason, size, "dropping packet");
        if let Some(observer) = self.observer.as_mut() {
            observer.add_packet_drop(size, reason);
        }
    }

    fn count_packet_drop(&mut self, reason: PacketDropReason) {
        if let Some(stats) = self.stats_callback.as_mut() {
            stats.on_packet_dropped(reason);
        }
    }

    /// Log and count a drop under the same reason.
    fn record_packet_drop(&mut self, size: usize, reason: PacketDropReason) {
        self.log_packet_drop(size, reason);
        self.count_packet_drop(reason);
    }
}
