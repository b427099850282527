//! # Server Connection ID Issuance (RFC 9000 Section 5.1)
//!
//! Connection IDs come from a pluggable algorithm so deployments can embed
//! routing state; an injected rejector can veto candidates (e.g. ids that
//! would collide in a routing table). Every issued id carries a stateless
//! reset token derived by keyed HMAC from a process-wide secret the owning
//! listener passes in.

#![forbid(unsafe_code)]

use rand::RngCore;
use ring::hmac;
use thiserror::Error;

use crate::types::{ConnectionId, StatelessResetToken};

/// Attempts before giving up when the rejector keeps refusing candidates.
pub const CONN_ID_ENCODING_RETRY_LIMIT: usize = 16;

/// Inputs the encoding algorithm may fold into an id.
#[derive(Debug, Clone, Copy)]
pub struct ServerConnectionIdParams {
    pub version: u8,
    pub host_id: u32,
    pub process_id: u8,
    pub worker_id: u8,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection id encoding failed")]
pub struct CidEncodeError;

/// Pluggable connection-id encoding.
pub trait ConnectionIdAlgo: Send {
    fn encode_connection_id(
        &mut self,
        params: &ServerConnectionIdParams,
    ) -> Result<ConnectionId, CidEncodeError>;
}

/// Veto hook for candidate connection ids.
pub trait ConnectionIdRejector: Send {
    fn reject_connection_id(&self, cid: &ConnectionId) -> bool;
}

/// An issued server connection id.
#[derive(Debug, Clone)]
pub struct ConnectionIdData {
    pub conn_id: ConnectionId,
    pub sequence_number: u64,
    pub token: Option<StatelessResetToken>,
}

/// Encode a connection id, retrying a rejected candidate up to
/// [`CONN_ID_ENCODING_RETRY_LIMIT`] times.
pub fn encode_with_rejector(
    algo: &mut dyn ConnectionIdAlgo,
    rejector: Option<&dyn ConnectionIdRejector>,
    params: &ServerConnectionIdParams,
) -> Result<ConnectionId, CidEncodeError> {
    let mut encoded = algo.encode_connection_id(params)?;
    let Some(rejector) = rejector else {
        return Ok(encoded);
    };
    let mut encoded_times = 1;
    while rejector.reject_connection_id(&encoded) {
        if encoded_times >= CONN_ID_ENCODING_RETRY_LIMIT {
            tracing::error!("connection id rejector rejected all candidates");
            return Err(CidEncodeError);
        }
        encoded = algo.encode_connection_id(params)?;
        encoded_times += 1;
    }
    Ok(encoded)
}

/// Stateless-reset token derivation: HMAC-SHA256 over the server address and
/// the connection id, truncated to 128 bits.
pub struct StatelessResetGenerator {
    key: hmac::Key,
    address: Vec<u8>,
}

impl StatelessResetGenerator {
    pub fn new(secret: &[u8; 32], server_address: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            address: server_address.as_bytes().to_vec(),
        }
    }

    pub fn generate_token(&self, cid: &ConnectionId) -> StatelessResetToken {
        let mut message = Vec::with_capacity(self.address.len() + cid.len());
        message.extend_from_slice(&self.address);
        message.extend_from_slice(cid.as_bytes());
        let tag = hmac::sign(&self.key, &message);
        let mut token = [0u8; 16];
        token.copy_from_slice(&tag.as_ref()[..16]);
        token
    }
}

/// Default algorithm: routing fields up front, random tail.
#[derive(Debug, Default)]
pub struct RandomConnectionIdAlgo;

impl ConnectionIdAlgo for RandomConnectionIdAlgo {
    fn encode_connection_id(
        &mut self,
        params: &ServerConnectionIdParams,
    ) -> Result<ConnectionId, CidEncodeError> {
        let mut bytes = [0u8; 8];
        bytes[0] = params.version;
        bytes[1..4].copy_from_slice(&params.host_id.to_be_bytes()[1..]);
        bytes[4] = params.process_id;
        bytes[5] = params.worker_id;
        rand::thread_rng().fill_bytes(&mut bytes[6..]);
        ConnectionId::from_slice(&bytes).ok_or(CidEncodeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAlgo(u8);

    impl ConnectionIdAlgo for FixedAlgo {
        fn encode_connection_id(
            &mut self,
            _params: &ServerConnectionIdParams,
        ) -> Result<ConnectionId, CidEncodeError> {
            self.0 = self.0.wrapping_add(1);
            Ok(ConnectionId::from_slice(&[self.0; 8]).unwrap())
        }
    }

    struct RejectBelow(u8);

    impl ConnectionIdRejector for RejectBelow {
        fn reject_connection_id(&self, cid: &ConnectionId) -> bool {
            cid.as_bytes()[0] < self.0
        }
    }

    fn params() -> ServerConnectionIdParams {
        ServerConnectionIdParams { version: 1, host_id: 7, process_id: 2, worker_id: 3 }
    }

    #[test]
    fn test_rejector_retry_loop() {
        let mut algo = FixedAlgo(0);
        let cid =
            encode_with_rejector(&mut algo, Some(&RejectBelow(5)), &params()).unwrap();
        assert_eq!(cid.as_bytes()[0], 5);
    }

    #[test]
    fn test_rejector_exhaustion_fails() {
        let mut algo = FixedAlgo(0);
        let err = encode_with_rejector(&mut algo, Some(&RejectBelow(200)), &params());
        assert_eq!(err, Err(CidEncodeError));
    }

    #[test]
    fn test_no_rejector_takes_first() {
        let mut algo = FixedAlgo(0);
        let cid = encode_with_rejector(&mut algo, None, &params()).unwrap();
        assert_eq!(cid.as_bytes()[0], 1);
    }

    #[test]
    fn test_reset_token_deterministic_and_keyed() {
        let cid = ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let generator_a = StatelessResetGenerator::new(&[7u8; 32], "192.0.2.1:443");
        let generator_b = StatelessResetGenerator::new(&[7u8; 32], "192.0.2.1:443");
        assert_eq!(generator_a.generate_token(&cid), generator_b.generate_token(&cid));

        let other_key = StatelessResetGenerator::new(&[8u8; 32], "192.0.2.1:443");
        assert_ne!(generator_a.generate_token(&cid), other_key.generate_token(&cid));

        let other_addr = StatelessResetGenerator::new(&[7u8; 32], "192.0.2.2:443");
        assert_ne!(generator_a.generate_token(&cid), other_addr.generate_token(&cid));
    }

    #[test]
    fn test_random_algo_embeds_routing_fields() {
        let mut algo = RandomConnectionIdAlgo;
        let cid = algo.encode_connection_id(&params()).unwrap();
        assert_eq!(cid.len(), 8);
        assert_eq!(cid.as_bytes()[0], 1);
        assert_eq!(&cid.as_bytes()[1..4], &7u32.to_be_bytes()[1..]);
        assert_eq!(cid.as_bytes()[4], 2);
        assert_eq!(cid.as_bytes()[5], 3);
    }
}
