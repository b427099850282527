//! Transport-parameter negotiation (RFC 9000 Section 7.4, 18).

pub mod parameters;

pub use parameters::{
    decode_parameters, encode_parameters, ClientTransportParameters, ServerTransportParameters,
    TransportParameter, TransportParameterId,
};
