//! # Packet Codec Interface
//!
//! Parsing, packet-number decryption, and AEAD work happen behind the
//! [`PacketCodec`] trait; the connection consumes [`CodecResult`] values and
//! pushes ciphers into the codec as the handshake produces them.
//!
//! The one piece of parsing the core does itself is the version-independent
//! long-header invariant, needed to bootstrap a connection before any codec
//! or cipher exists.

#![forbid(unsafe_code)]

use bytes::{Buf, Bytes, BytesMut};

use crate::ack::AckStates;
use crate::crypto::{Aead, HeaderCipher};
use crate::frames::Frame;
use crate::types::{
    ConnectionId, PacketNumber, ProtectionType, QuicVersion, MAX_CID_LENGTH,
};

/// Parsed packet header, after header protection removal.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub protection_type: ProtectionType,
    pub packet_num: PacketNumber,
    /// Version from the long header; None for short headers.
    pub version: Option<QuicVersion>,
    /// Destination CID the packet was routed by.
    pub dst_cid: ConnectionId,
}

impl PacketHeader {
    pub fn is_long_header(&self) -> bool {
        self.version.is_some()
    }
}

/// A fully decrypted and parsed packet.
#[derive(Debug, Clone)]
pub struct RegularPacket {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
}

/// Outcome of feeding one coalesced packet's worth of bytes to the codec.
#[derive(Debug)]
pub enum CodecResult {
    Regular(Box<RegularPacket>),
    /// A protected packet for which no read cipher is installed yet. The raw
    /// packet bytes ride along so they can be buffered until keys arrive.
    CipherUnavailable {
        packet: Bytes,
        protection_type: ProtectionType,
    },
    Retry,
    StatelessReset,
    Nothing,
}

/// Parameters the codec needs beyond ciphers.
#[derive(Debug, Clone, Copy)]
pub struct CodecParameters {
    pub peer_ack_delay_exponent: u8,
    pub version: QuicVersion,
}

/// The injected read-side codec. `parse_packet` consumes exactly one
/// coalesced packet from the front of `data`.
pub trait PacketCodec: Send {
    fn parse_packet(&mut self, data: &mut BytesMut, ack_states: &AckStates) -> CodecResult;

    fn set_initial_read_cipher(&mut self, cipher: Option<Box<dyn Aead>>);
    fn set_initial_header_cipher(&mut self, cipher: Option<Box<dyn HeaderCipher>>);
    fn set_handshake_read_cipher(&mut self, cipher: Option<Box<dyn Aead>>);
    fn set_handshake_header_cipher(&mut self, cipher: Option<Box<dyn HeaderCipher>>);
    fn set_zero_rtt_read_cipher(&mut self, cipher: Option<Box<dyn Aead>>);
    fn set_zero_rtt_header_cipher(&mut self, cipher: Option<Box<dyn HeaderCipher>>);
    fn set_one_rtt_read_cipher(&mut self, cipher: Option<Box<dyn Aead>>);
    fn set_one_rtt_header_cipher(&mut self, cipher: Option<Box<dyn HeaderCipher>>);

    fn set_client_connection_id(&mut self, cid: ConnectionId);
    fn set_server_connection_id(&mut self, cid: ConnectionId);
    fn client_connection_id(&self) -> Option<&ConnectionId>;

    fn set_codec_parameters(&mut self, params: CodecParameters);
}

// ============================================================================
// Long header invariant (RFC 8999 Section 5.1)
// ============================================================================

/// The version-independent prefix of a long-header packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeaderInvariant {
    pub version: QuicVersion,
    pub src_cid: ConnectionId,
    pub dst_cid: ConnectionId,
}

/// Parse the long-header invariant off the front of a datagram.
///
/// Returns None for short headers, truncated input, or oversized CIDs.
pub fn parse_long_header_invariant(data: &[u8]) -> Option<LongHeaderInvariant> {
    let mut cursor = data;
    if cursor.remaining() < 1 {
        return None;
    }
    let initial_byte = cursor.get_u8();
    if initial_byte & 0x80 == 0 {
        return None;
    }
    if cursor.remaining() < 4 {
        return None;
    }
    let version = QuicVersion::from_wire(cursor.get_u32());

    if cursor.remaining() < 1 {
        return None;
    }
    let dcid_len = cursor.get_u8() as usize;
    if dcid_len > MAX_CID_LENGTH || cursor.remaining() < dcid_len {
        return None;
    }
    let dst_cid = ConnectionId::from_slice(&cursor[..dcid_len])?;
    cursor.advance(dcid_len);

    if cursor.remaining() < 1 {
        return None;
    }
    let scid_len = cursor.get_u8() as usize;
    if scid_len > MAX_CID_LENGTH || cursor.remaining() < scid_len {
        return None;
    }
    let src_cid = ConnectionId::from_slice(&cursor[..scid_len])?;

    Some(LongHeaderInvariant { version, src_cid, dst_cid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn long_header(version: u32, dcid: &[u8], scid: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(0xc0);
        buf.put_u32(version);
        buf.put_u8(dcid.len() as u8);
        buf.put_slice(dcid);
        buf.put_u8(scid.len() as u8);
        buf.put_slice(scid);
        buf.put_slice(&[0u8; 16]);
        buf
    }

    #[test]
    fn test_parse_long_header_invariant() {
        let dcid = [0xc0, 0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7];
        let scid = [0x8a, 0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91];
        let data = long_header(1, &dcid, &scid);
        let parsed = parse_long_header_invariant(&data).unwrap();
        assert_eq!(parsed.version, QuicVersion::V1);
        assert_eq!(parsed.dst_cid.as_bytes(), &dcid);
        assert_eq!(parsed.src_cid.as_bytes(), &scid);
    }

    #[test]
    fn test_short_header_rejected() {
        let data = [0x40u8, 0x01, 0x02, 0x03];
        assert!(parse_long_header_invariant(&data).is_none());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let data = long_header(1, &[1, 2, 3, 4, 5, 6, 7, 8], &[9, 9]);
        for len in 0..7 {
            assert!(parse_long_header_invariant(&data[..len]).is_none());
        }
    }

    #[test]
    fn test_version_negotiation_recognized() {
        let data = long_header(0, &[1, 2, 3, 4, 5, 6, 7, 8], &[9, 9]);
        let parsed = parse_long_header_invariant(&data).unwrap();
        assert_eq!(parsed.version, QuicVersion::VersionNegotiation);
    }

    #[test]
    fn test_oversized_cid_rejected() {
        let mut buf = Vec::new();
        buf.put_u8(0xc0);
        buf.put_u32(1);
        buf.put_u8(21);
        buf.put_slice(&[0u8; 21]);
        buf.put_u8(0);
        assert!(parse_long_header_invariant(&buf).is_none());
    }
}
