//! # quiver-quic: Server-Side QUIC Transport Core
//!
//! The connection-facing core of a QUIC (RFC 9000) server: the state machine
//! that ingests UDP datagrams, drives the TLS-based handshake through an
//! injected handshake layer, multiplexes streams, tracks acks and RTT, and
//! validates peer migrations.
//!
//! ## Architecture Overview
//!
//! ```text
//! quiver-quic/
//! ├── error          - Transport/local/drop error taxonomy
//! ├── types          - Connection ids, stream ids, spaces, time values
//! ├── frames         - Decoded frames and sent-frame records
//! ├── codec          - Injected packet codec interface
//! ├── crypto         - Cipher handles, handshake layer, crypto streams
//! ├── ack            - Per-space ack state and scheduling policy
//! ├── recovery       - Outstanding packet log, RTT, ack processing,
//! │                    congestion controller interface
//! ├── flow_control   - Connection and stream windows
//! ├── stream         - Stream state machine, reassembly, priorities,
//! │                    and the stream manager
//! ├── transport      - Transport parameter encoding and accessors
//! ├── knobs          - JSON-carried runtime tuning parameters
//! ├── observer       - Optional event log and stats sinks
//! ├── config         - Transport settings
//! └── server         - The server connection state machine
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure state machine**: no sockets, no event loop, no clock reads.
//!    Datagrams and timestamps come in; frames, events, and timer requests
//!    come out through [`server::PendingEvents`].
//!
//! 2. **Injected collaborators**: packet parsing/AEAD work, the TLS engine,
//!    congestion control algorithms, and connection-id encoding all sit
//!    behind traits owned by the connection. Observers and stats sinks are
//!    optional.
//!
//! 3. **Serial per connection**: a connection is single-threaded state; every
//!    mutation happens inside one driver turn. Nothing in this crate locks.
//!
//! ## Usage Sketch
//!
//! ```rust,ignore
//! use quiver_quic::server::{ReadData, ServerConnection, ServerConnectionContext};
//!
//! let mut connection = ServerConnection::new(context);
//! // Driven by the owning listener's event loop:
//! let outcome = connection.on_read_data(ReadData {
//!     peer,
//!     data: udp_payload,
//!     receive_time: now,
//! })?;
//! // Consult connection.pending_events() for acks, path challenges, and
//! // timer changes to apply.
//! ```

#![forbid(unsafe_code)]

pub mod ack;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod knobs;
pub mod observer;
pub mod recovery;
pub mod server;
pub mod stream;
pub mod transport;
pub mod types;

pub use ack::{AckState, AckStates};
pub use codec::{CodecParameters, CodecResult, PacketCodec, RegularPacket};
pub use config::TransportSettings;
pub use crypto::{Aead, CryptoFactory, HandshakeLayer, HeaderCipher};
pub use error::{
    LocalError, PacketDropReason, TransportError, TransportErrorCode,
};
pub use frames::{Frame, SentFrame, SimpleFrame};
pub use recovery::{
    CongestionControlType, CongestionController, CongestionControllerFactory, RttState,
};
pub use server::{
    ProcessOutcome, ReadData, ServerConnection, ServerConnectionContext, ServerState,
};
pub use stream::{StreamManager, StreamPriority, StreamState};
pub use types::{ConnectionId, Instant, PacketNumber, PacketNumberSpace, QuicVersion, StreamId};
