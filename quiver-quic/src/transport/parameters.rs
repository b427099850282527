//! # Transport Parameters (RFC 9000 Section 18)
//!
//! Deterministic varint-TLV encoding of the server's parameters, plus typed
//! accessors over the peer's list. Validation of the peer's values lives
//! with the server state machine, which owns the connection state the rules
//! reference.

#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransportError, TransportErrorCode};
use crate::types::{ConnectionId, StatelessResetToken};

/// Known transport parameter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportParameterId {
    OriginalDestinationConnectionId = 0x00,
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    MaxUdpPayloadSize = 0x03,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    AckDelayExponent = 0x0a,
    MaxAckDelay = 0x0b,
    DisableActiveMigration = 0x0c,
    PreferredAddress = 0x0d,
    ActiveConnectionIdLimit = 0x0e,
    InitialSourceConnectionId = 0x0f,
    RetrySourceConnectionId = 0x10,
    MaxDatagramFrameSize = 0x20,
    MinAckDelay = 0xff02_de1a,
    /// Private-use: datagram PLPMTUD base PMTU.
    D6DBasePmtu = 0xff77,
    /// Private-use: datagram PLPMTUD raise timeout (seconds).
    D6DRaiseTimeout = 0xff78,
    /// Private-use: datagram PLPMTUD probe timeout (seconds).
    D6DProbeTimeout = 0xff79,
}

impl TransportParameterId {
    pub fn to_wire(self) -> u64 {
        self as u64
    }
}

/// One raw id/value pair, value still wire-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameter {
    pub id: u64,
    pub value: Bytes,
}

impl TransportParameter {
    pub fn integral(id: TransportParameterId, value: u64) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        put_varint(&mut buf, value);
        Self { id: id.to_wire(), value: buf.freeze() }
    }

    pub fn bytes(id: TransportParameterId, value: Bytes) -> Self {
        Self { id: id.to_wire(), value }
    }
}

// ============================================================================
// Varint TLV encoding
// ============================================================================

fn put_varint(buf: &mut BytesMut, value: u64) {
    if value < 64 {
        buf.put_u8(value as u8);
    } else if value < 16384 {
        buf.put_u16(value as u16 | 0x4000);
    } else if value < 1_073_741_824 {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    }
}

fn get_varint(buf: &mut &[u8]) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let prefix = buf.chunk()[0] >> 6;
    let len = 1usize << prefix;
    if buf.remaining() < len {
        return None;
    }
    Some(match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        _ => unreachable!(),
    })
}

/// Serialize a parameter list. Stable: the same list always yields the same
/// bytes.
pub fn encode_parameters(params: &[TransportParameter]) -> Bytes {
    let mut buf = BytesMut::new();
    for param in params {
        put_varint(&mut buf, param.id);
        put_varint(&mut buf, param.value.len() as u64);
        buf.put_slice(&param.value);
    }
    buf.freeze()
}

/// Parse a parameter list off the wire.
pub fn decode_parameters(mut buf: &[u8]) -> Result<Vec<TransportParameter>, TransportError> {
    let mut params = Vec::new();
    while buf.has_remaining() {
        let id = get_varint(&mut buf).ok_or_else(malformed)?;
        let len = get_varint(&mut buf).ok_or_else(malformed)? as usize;
        if buf.remaining() < len {
            return Err(malformed());
        }
        let value = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        params.push(TransportParameter { id, value });
    }
    Ok(params)
}

fn malformed() -> TransportError {
    TransportError::new(
        TransportErrorCode::TransportParameterError,
        "Malformed transport parameters",
    )
}

// ============================================================================
// Typed views
// ============================================================================

fn find<'a>(params: &'a [TransportParameter], id: TransportParameterId) -> Option<&'a Bytes> {
    params
        .iter()
        .find(|param| param.id == id.to_wire())
        .map(|param| &param.value)
}

fn get_integer_parameter(
    params: &[TransportParameter],
    id: TransportParameterId,
) -> Result<Option<u64>, TransportError> {
    let Some(value) = find(params, id) else {
        return Ok(None);
    };
    let mut slice = &value[..];
    let decoded = get_varint(&mut slice).ok_or_else(malformed)?;
    if slice.has_remaining() {
        return Err(malformed());
    }
    Ok(Some(decoded))
}

fn get_conn_id_parameter(
    params: &[TransportParameter],
    id: TransportParameterId,
) -> Result<Option<ConnectionId>, TransportError> {
    let Some(value) = find(params, id) else {
        return Ok(None);
    };
    ConnectionId::new(value.clone()).map(Some).ok_or_else(|| {
        TransportError::new(
            TransportErrorCode::TransportParameterError,
            "Connection id parameter too long",
        )
    })
}

/// The client's transport parameters, as surfaced by the handshake layer.
#[derive(Debug, Clone, Default)]
pub struct ClientTransportParameters {
    pub parameters: Vec<TransportParameter>,
}

impl ClientTransportParameters {
    pub fn get_integer(
        &self,
        id: TransportParameterId,
    ) -> Result<Option<u64>, TransportError> {
        get_integer_parameter(&self.parameters, id)
    }

    pub fn get_conn_id(
        &self,
        id: TransportParameterId,
    ) -> Result<Option<ConnectionId>, TransportError> {
        get_conn_id_parameter(&self.parameters, id)
    }

    pub fn contains(&self, id: TransportParameterId) -> bool {
        find(&self.parameters, id).is_some()
    }
}

/// The extension the server hands to the handshake layer in the first
/// flight.
#[derive(Debug, Clone)]
pub struct ServerTransportParameters {
    pub parameters: Vec<TransportParameter>,
}

/// Everything that goes into the server's advertised parameters.
pub struct ServerParametersConfig {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub idle_timeout_ms: u64,
    pub ack_delay_exponent: u8,
    pub max_recv_packet_size: u64,
    pub stateless_reset_token: StatelessResetToken,
    pub initial_source_connection_id: ConnectionId,
    pub original_destination_connection_id: ConnectionId,
}

impl ServerTransportParameters {
    pub fn build(
        config: ServerParametersConfig,
        custom: Vec<TransportParameter>,
    ) -> Self {
        let mut parameters = vec![
            TransportParameter::integral(
                TransportParameterId::InitialMaxData,
                config.initial_max_data,
            ),
            TransportParameter::integral(
                TransportParameterId::InitialMaxStreamDataBidiLocal,
                config.initial_max_stream_data_bidi_local,
            ),
            TransportParameter::integral(
                TransportParameterId::InitialMaxStreamDataBidiRemote,
                config.initial_max_stream_data_bidi_remote,
            ),
            TransportParameter::integral(
                TransportParameterId::InitialMaxStreamDataUni,
                config.initial_max_stream_data_uni,
            ),
            TransportParameter::integral(
                TransportParameterId::InitialMaxStreamsBidi,
                config.initial_max_streams_bidi,
            ),
            TransportParameter::integral(
                TransportParameterId::InitialMaxStreamsUni,
                config.initial_max_streams_uni,
            ),
            TransportParameter::integral(
                TransportParameterId::MaxIdleTimeout,
                config.idle_timeout_ms,
            ),
            TransportParameter::integral(
                TransportParameterId::AckDelayExponent,
                config.ack_delay_exponent as u64,
            ),
            TransportParameter::integral(
                TransportParameterId::MaxUdpPayloadSize,
                config.max_recv_packet_size,
            ),
            TransportParameter::bytes(
                TransportParameterId::StatelessResetToken,
                Bytes::copy_from_slice(&config.stateless_reset_token),
            ),
            TransportParameter::bytes(
                TransportParameterId::InitialSourceConnectionId,
                Bytes::copy_from_slice(config.initial_source_connection_id.as_bytes()),
            ),
            TransportParameter::bytes(
                TransportParameterId::OriginalDestinationConnectionId,
                Bytes::copy_from_slice(config.original_destination_connection_id.as_bytes()),
            ),
        ];
        parameters.extend(custom);
        Self { parameters }
    }

    pub fn encode(&self) -> Bytes {
        encode_parameters(&self.parameters)
    }
}
