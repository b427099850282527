//! # Crypto Interfaces (RFC 9001)
//!
//! The core never touches key material. It moves opaque cipher handles
//! between the handshake layer and the codec, and it owns the per-level
//! crypto streams that carry the TLS handshake bytes.

#![forbid(unsafe_code)]

use bytes::Bytes;

use crate::error::TransportError;
use crate::stream::buffer::ReceiveBuffer;
use crate::transport::parameters::{ClientTransportParameters, ServerTransportParameters};
use crate::types::{ConnectionId, EncryptionLevel, QuicVersion};

/// Opaque AEAD handle. Produced by the handshake layer or crypto factory,
/// consumed by the codec (read side) or the packet writer (write side).
pub trait Aead: Send {
    /// AEAD tag overhead in bytes.
    fn overhead(&self) -> usize {
        16
    }
}

/// Opaque header-protection cipher handle.
pub trait HeaderCipher: Send {}

/// Derives initial-secret ciphers from the client's destination CID.
pub trait CryptoFactory: Send {
    fn make_client_initial_cipher(
        &self,
        initial_dcid: &ConnectionId,
        version: QuicVersion,
    ) -> Result<Box<dyn Aead>, TransportError>;

    fn make_server_initial_cipher(
        &self,
        initial_dcid: &ConnectionId,
        version: QuicVersion,
    ) -> Result<Box<dyn Aead>, TransportError>;

    fn make_client_initial_header_cipher(
        &self,
        initial_dcid: &ConnectionId,
        version: QuicVersion,
    ) -> Result<Box<dyn HeaderCipher>, TransportError>;

    fn make_server_initial_header_cipher(
        &self,
        initial_dcid: &ConnectionId,
        version: QuicVersion,
    ) -> Result<Box<dyn HeaderCipher>, TransportError>;
}

/// The TLS handshake engine, owned by the connection.
///
/// Cipher getters are one-shot: a cipher is returned once when it becomes
/// available and the layer forgets it afterwards. The connection polls them
/// from `update_handshake_state` after every crypto-stream delivery.
pub trait HandshakeLayer: Send {
    /// Install the server's transport-parameters extension before the first
    /// handshake flight is processed.
    fn accept(&mut self, params: ServerTransportParameters);

    fn crypto_factory(&self) -> &dyn CryptoFactory;

    /// Feed contiguous crypto-stream bytes for one encryption level.
    fn do_handshake(
        &mut self,
        data: Bytes,
        level: EncryptionLevel,
    ) -> Result<(), TransportError>;

    fn get_zero_rtt_read_cipher(&mut self) -> Option<Box<dyn Aead>>;
    fn get_zero_rtt_read_header_cipher(&mut self) -> Option<Box<dyn HeaderCipher>>;
    fn get_handshake_read_cipher(&mut self) -> Option<Box<dyn Aead>>;
    fn get_handshake_read_header_cipher(&mut self) -> Option<Box<dyn HeaderCipher>>;
    fn get_handshake_write_cipher(&mut self) -> Option<Box<dyn Aead>>;
    fn get_handshake_write_header_cipher(&mut self) -> Option<Box<dyn HeaderCipher>>;
    fn get_one_rtt_write_cipher(&mut self) -> Option<Box<dyn Aead>>;
    fn get_one_rtt_write_header_cipher(&mut self) -> Option<Box<dyn HeaderCipher>>;
    fn get_one_rtt_read_cipher(&mut self) -> Option<Box<dyn Aead>>;
    fn get_one_rtt_read_header_cipher(&mut self) -> Option<Box<dyn HeaderCipher>>;

    /// Handshake bytes the layer wants transmitted at `level`, if any.
    fn take_pending_output(&mut self, level: EncryptionLevel) -> Option<Bytes>;

    /// The client's finished message has been processed.
    fn is_handshake_done(&self) -> bool;

    /// The peer's transport parameters, once the ClientHello carried them.
    fn get_client_transport_params(&mut self) -> Option<ClientTransportParameters>;
}

// ============================================================================
// Crypto streams
// ============================================================================

/// Send/receive state of one crypto stream.
///
/// The receive side reassembles out-of-order CRYPTO frames; the send side
/// tracks in-flight ranges so acks (and implicit acks on key transitions)
/// can drain retransmission state.
#[derive(Debug, Default)]
pub struct CryptoStream {
    pub current_read_offset: u64,
    pub read_buffer: ReceiveBuffer,
    pub current_write_offset: u64,
    /// Pending handshake bytes not yet packetized.
    pub pending_writes: Vec<Bytes>,
    /// In-flight (offset, len) ranges awaiting ack.
    pub retransmission_buffer: std::collections::BTreeMap<u64, u64>,
}

impl CryptoStream {
    /// Queue handshake output for transmission.
    pub fn write(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.pending_writes.push(data);
        }
    }

    /// Buffer received CRYPTO frame data.
    pub fn append_to_read_buffer(&mut self, offset: u64, data: Bytes) {
        self.read_buffer.insert(offset, data);
    }

    /// Drain all contiguous received bytes past the read offset.
    pub fn read_available(&mut self) -> Option<Bytes> {
        let mut collected: Option<bytes::BytesMut> = None;
        while let Some(chunk) = self.read_buffer.pop_contiguous(self.current_read_offset) {
            self.current_read_offset += chunk.len() as u64;
            match collected.as_mut() {
                Some(buf) => buf.extend_from_slice(&chunk),
                None => collected = Some(bytes::BytesMut::from(&chunk[..])),
            }
        }
        collected.map(bytes::BytesMut::freeze)
    }

    /// An in-flight range was acknowledged.
    pub fn on_ack(&mut self, offset: u64, len: u64) {
        if let Some(&buffered) = self.retransmission_buffer.get(&offset) {
            if buffered == len {
                self.retransmission_buffer.remove(&offset);
            }
        }
    }

    /// Higher keys are in use; everything at this level is implicitly acked.
    pub fn implicit_ack(&mut self) {
        self.retransmission_buffer.clear();
        self.pending_writes.clear();
    }
}

/// The three crypto streams of a connection. Early data shares the AppData
/// stream.
#[derive(Debug, Default)]
pub struct CryptoState {
    pub initial: CryptoStream,
    pub handshake: CryptoStream,
    pub one_rtt: CryptoStream,
}

impl CryptoState {
    pub fn stream_mut(&mut self, level: EncryptionLevel) -> &mut CryptoStream {
        match level {
            EncryptionLevel::Initial => &mut self.initial,
            EncryptionLevel::Handshake => &mut self.handshake,
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => &mut self.one_rtt,
        }
    }

    pub fn stream(&self, level: EncryptionLevel) -> &CryptoStream {
        match level {
            EncryptionLevel::Initial => &self.initial,
            EncryptionLevel::Handshake => &self.handshake,
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => &self.one_rtt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_stream_reassembly() {
        let mut stream = CryptoStream::default();
        stream.append_to_read_buffer(4, Bytes::from_static(b"5678"));
        assert!(stream.read_available().is_none());
        stream.append_to_read_buffer(0, Bytes::from_static(b"1234"));
        assert_eq!(stream.read_available().unwrap(), Bytes::from_static(b"12345678"));
        assert_eq!(stream.current_read_offset, 8);
    }

    #[test]
    fn test_crypto_stream_ack_drains_inflight() {
        let mut stream = CryptoStream::default();
        stream.retransmission_buffer.insert(0, 100);
        stream.retransmission_buffer.insert(100, 50);
        stream.on_ack(0, 100);
        assert_eq!(stream.retransmission_buffer.len(), 1);
        stream.implicit_ack();
        assert!(stream.retransmission_buffer.is_empty());
    }

    #[test]
    fn test_early_data_shares_app_data_stream() {
        let mut state = CryptoState::default();
        state
            .stream_mut(EncryptionLevel::EarlyData)
            .write(Bytes::from_static(b"x"));
        assert_eq!(state.stream(EncryptionLevel::AppData).pending_writes.len(), 1);
    }
}
