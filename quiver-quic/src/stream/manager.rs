//! # Stream Manager
//!
//! Owns every stream of a connection: lazy allocation bounded by advertised
//! limits, the readable/writable/peekable/blocked/loss index sets, priority
//! scheduling, windowed MAX_STREAMS credit, and app-idle tracking.
//!
//! Stream records never point back at the connection; anything the manager
//! must tell the outside world (stats, congestion controller) goes through
//! an explicit [`ManagerContext`].

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::error::{LocalError, TransportError, TransportErrorCode};
use crate::observer::StatsCallback;
use crate::recovery::CongestionController;
use crate::stream::priority::PriorityQueue;
use crate::stream::{StreamPriority, StreamState};
use crate::types::{
    Instant, StreamId, DEFAULT_MAX_PRIORITY, MAX_MAX_STREAMS, STREAM_INCREMENT,
};

/// Observer notified whenever any stream's priority landscape changes.
pub trait StreamPrioritiesObserver: Send {
    fn on_stream_priorities_change(&mut self);
}

/// Explicit context for calls that must reach connection-owned
/// collaborators.
pub struct ManagerContext<'a> {
    pub now: Instant,
    pub stats: Option<&'a mut dyn StatsCallback>,
    pub congestion: Option<&'a mut dyn CongestionController>,
}

impl<'a> ManagerContext<'a> {
    pub fn bare(now: Instant) -> Self {
        Self { now, stats: None, congestion: None }
    }
}

/// Receive/send window defaults applied to newly allocated streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamWindowDefaults {
    /// Receive window for bidi streams we initiate.
    pub local_bidi_recv: u64,
    /// Receive window for bidi streams the peer initiates.
    pub remote_bidi_recv: u64,
    /// Receive window for peer unidirectional streams.
    pub uni_recv: u64,
    /// Peer-granted send window for bidi streams we initiate.
    pub local_bidi_send: u64,
    /// Peer-granted send window for bidi streams the peer initiates.
    pub remote_bidi_send: u64,
    /// Peer-granted send window for unidirectional streams we initiate.
    pub uni_send: u64,
}

// Server-side initial stream ids (RFC 9000 Section 2.1).
const INITIAL_LOCAL_BIDI: u64 = 0x01;
const INITIAL_LOCAL_UNI: u64 = 0x03;
const INITIAL_REMOTE_BIDI: u64 = 0x00;
const INITIAL_REMOTE_UNI: u64 = 0x02;

/// The server's stream collection.
pub struct StreamManager {
    streams: BTreeMap<StreamId, StreamState>,

    open_bidirectional_local_streams: BTreeSet<StreamId>,
    open_unidirectional_local_streams: BTreeSet<StreamId>,
    open_bidirectional_peer_streams: BTreeSet<StreamId>,
    open_unidirectional_peer_streams: BTreeSet<StreamId>,
    /// Peer streams implicitly or explicitly opened since last drained.
    new_peer_streams: Vec<StreamId>,

    next_acceptable_peer_bidirectional_stream_id: u64,
    next_acceptable_peer_unidirectional_stream_id: u64,
    next_acceptable_local_bidirectional_stream_id: u64,
    next_acceptable_local_unidirectional_stream_id: u64,
    next_bidirectional_stream_id: u64,
    next_unidirectional_stream_id: u64,

    max_local_bidirectional_stream_id: u64,
    max_local_unidirectional_stream_id: u64,
    max_remote_bidirectional_stream_id: u64,
    max_remote_unidirectional_stream_id: u64,
    max_local_bidirectional_stream_id_increased: bool,
    max_local_unidirectional_stream_id_increased: bool,

    advertised_initial_max_streams_bidi: u64,
    advertised_initial_max_streams_uni: u64,
    stream_limit_windowing_fraction: u64,
    remote_bidirectional_stream_limit_update: Option<u64>,
    remote_unidirectional_stream_limit_update: Option<u64>,

    window_defaults: StreamWindowDefaults,

    // Index sets.
    readable_streams: BTreeSet<StreamId>,
    peekable_streams: BTreeSet<StreamId>,
    writable_streams: PriorityQueue,
    writable_dsr_streams: PriorityQueue,
    writable_control_streams: BTreeSet<StreamId>,
    blocked_streams: BTreeSet<StreamId>,
    deliverable_streams: BTreeSet<StreamId>,
    tx_streams: BTreeSet<StreamId>,
    window_updates: BTreeSet<StreamId>,
    stop_sending_streams: BTreeMap<StreamId, u64>,
    flow_control_updated: BTreeSet<StreamId>,
    loss_streams: BTreeSet<StreamId>,

    stream_priority_levels: BTreeMap<StreamId, u8>,
    priority_changes_observer: Option<Box<dyn StreamPrioritiesObserver>>,

    num_control_streams: u64,
    is_app_idle: bool,
}

impl StreamManager {
    pub fn new(
        advertised_initial_max_streams_bidi: u64,
        advertised_initial_max_streams_uni: u64,
        stream_limit_windowing_fraction: u64,
        window_defaults: StreamWindowDefaults,
    ) -> Self {
        Self {
            streams: BTreeMap::new(),
            open_bidirectional_local_streams: BTreeSet::new(),
            open_unidirectional_local_streams: BTreeSet::new(),
            open_bidirectional_peer_streams: BTreeSet::new(),
            open_unidirectional_peer_streams: BTreeSet::new(),
            new_peer_streams: Vec::new(),
            next_acceptable_peer_bidirectional_stream_id: INITIAL_REMOTE_BIDI,
            next_acceptable_peer_unidirectional_stream_id: INITIAL_REMOTE_UNI,
            next_acceptable_local_bidirectional_stream_id: INITIAL_LOCAL_BIDI,
            next_acceptable_local_unidirectional_stream_id: INITIAL_LOCAL_UNI,
            next_bidirectional_stream_id: INITIAL_LOCAL_BIDI,
            next_unidirectional_stream_id: INITIAL_LOCAL_UNI,
            // Local limits stay zero until the peer's transport parameters
            // arrive.
            max_local_bidirectional_stream_id: INITIAL_LOCAL_BIDI,
            max_local_unidirectional_stream_id: INITIAL_LOCAL_UNI,
            max_remote_bidirectional_stream_id: advertised_initial_max_streams_bidi
                * STREAM_INCREMENT
                + INITIAL_REMOTE_BIDI,
            max_remote_unidirectional_stream_id: advertised_initial_max_streams_uni
                * STREAM_INCREMENT
                + INITIAL_REMOTE_UNI,
            max_local_bidirectional_stream_id_increased: false,
            max_local_unidirectional_stream_id_increased: false,
            advertised_initial_max_streams_bidi,
            advertised_initial_max_streams_uni,
            stream_limit_windowing_fraction,
            remote_bidirectional_stream_limit_update: None,
            remote_unidirectional_stream_limit_update: None,
            window_defaults,
            readable_streams: BTreeSet::new(),
            peekable_streams: BTreeSet::new(),
            writable_streams: PriorityQueue::new(),
            writable_dsr_streams: PriorityQueue::new(),
            writable_control_streams: BTreeSet::new(),
            blocked_streams: BTreeSet::new(),
            deliverable_streams: BTreeSet::new(),
            tx_streams: BTreeSet::new(),
            window_updates: BTreeSet::new(),
            stop_sending_streams: BTreeMap::new(),
            flow_control_updated: BTreeSet::new(),
            loss_streams: BTreeSet::new(),
            stream_priority_levels: BTreeMap::new(),
            priority_changes_observer: None,
            num_control_streams: 0,
            is_app_idle: false,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn stream_exists(&self, stream_id: StreamId) -> bool {
        if stream_id.is_server_initiated() {
            if stream_id.is_unidirectional() {
                self.open_unidirectional_local_streams.contains(&stream_id)
            } else {
                self.open_bidirectional_local_streams.contains(&stream_id)
            }
        } else if stream_id.is_unidirectional() {
            self.open_unidirectional_peer_streams.contains(&stream_id)
        } else {
            self.open_bidirectional_peer_streams.contains(&stream_id)
        }
    }

    pub fn find_stream(&mut self, stream_id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // ========================================================================
    // Limits
    // ========================================================================

    fn checked_max_stream_id(
        max_streams: u64,
        initial_id: u64,
    ) -> Result<u64, TransportError> {
        if max_streams > MAX_MAX_STREAMS {
            return Err(TransportError::new(
                TransportErrorCode::StreamLimitError,
                "Attempt to set maxStreams beyond the max allowed.",
            ));
        }
        Ok(max_streams * STREAM_INCREMENT + initial_id)
    }

    pub fn set_max_local_bidirectional_streams(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        let max_stream_id = Self::checked_max_stream_id(max_streams, INITIAL_LOCAL_BIDI)?;
        if force || max_stream_id > self.max_local_bidirectional_stream_id {
            self.max_local_bidirectional_stream_id = max_stream_id;
            self.max_local_bidirectional_stream_id_increased = true;
        }
        Ok(())
    }

    pub fn set_max_local_unidirectional_streams(
        &mut self,
        max_streams: u64,
        force: bool,
    ) -> Result<(), TransportError> {
        let max_stream_id = Self::checked_max_stream_id(max_streams, INITIAL_LOCAL_UNI)?;
        if force || max_stream_id > self.max_local_unidirectional_stream_id {
            self.max_local_unidirectional_stream_id = max_stream_id;
            self.max_local_unidirectional_stream_id_increased = true;
        }
        Ok(())
    }

    pub fn set_max_remote_bidirectional_streams(
        &mut self,
        max_streams: u64,
    ) -> Result<(), TransportError> {
        let max_stream_id = Self::checked_max_stream_id(max_streams, INITIAL_REMOTE_BIDI)?;
        if max_stream_id > self.max_remote_bidirectional_stream_id {
            self.max_remote_bidirectional_stream_id = max_stream_id;
        }
        Ok(())
    }

    pub fn set_max_remote_unidirectional_streams(
        &mut self,
        max_streams: u64,
    ) -> Result<(), TransportError> {
        let max_stream_id = Self::checked_max_stream_id(max_streams, INITIAL_REMOTE_UNI)?;
        if max_stream_id > self.max_remote_unidirectional_stream_id {
            self.max_remote_unidirectional_stream_id = max_stream_id;
        }
        Ok(())
    }

    pub fn consume_max_local_bidirectional_stream_id_increased(&mut self) -> bool {
        std::mem::take(&mut self.max_local_bidirectional_stream_id_increased)
    }

    pub fn consume_max_local_unidirectional_stream_id_increased(&mut self) -> bool {
        std::mem::take(&mut self.max_local_unidirectional_stream_id_increased)
    }

    /// Streams the peer can still open.
    pub fn openable_remote_bidirectional_streams(&self) -> u64 {
        (self.max_remote_bidirectional_stream_id
            - self.next_acceptable_peer_bidirectional_stream_id)
            / STREAM_INCREMENT
    }

    pub fn openable_remote_unidirectional_streams(&self) -> u64 {
        (self.max_remote_unidirectional_stream_id
            - self.next_acceptable_peer_unidirectional_stream_id)
            / STREAM_INCREMENT
    }

    /// Pending MAX_STREAMS (bidi) advertisement, consumed once.
    pub fn remote_bidirectional_stream_limit_update(&mut self) -> Option<u64> {
        self.remote_bidirectional_stream_limit_update.take()
    }

    pub fn remote_unidirectional_stream_limit_update(&mut self) -> Option<u64> {
        self.remote_unidirectional_stream_limit_update.take()
    }

    /// Re-apply advertised stream limits, e.g. from a resumption ticket.
    /// Remote limits are forced, not merely raised.
    pub fn refresh_stream_limits(
        &mut self,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) -> Result<(), TransportError> {
        self.advertised_initial_max_streams_bidi = max_streams_bidi;
        self.advertised_initial_max_streams_uni = max_streams_uni;
        self.max_remote_bidirectional_stream_id =
            Self::checked_max_stream_id(max_streams_bidi, INITIAL_REMOTE_BIDI)?;
        self.max_remote_unidirectional_stream_id =
            Self::checked_max_stream_id(max_streams_uni, INITIAL_REMOTE_UNI)?;
        Ok(())
    }

    /// Install peer-granted stream send windows once transport parameters
    /// are negotiated.
    pub fn set_peer_stream_windows(
        &mut self,
        peer_bidi_local: u64,
        peer_bidi_remote: u64,
        peer_uni: u64,
    ) {
        // The peer's "local" applies to streams it opens; its "remote" to
        // streams we open.
        self.window_defaults.remote_bidi_send = peer_bidi_local;
        self.window_defaults.local_bidi_send = peer_bidi_remote;
        self.window_defaults.uni_send = peer_uni;
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    fn make_stream_state(&self, stream_id: StreamId) -> StreamState {
        let mut stream = StreamState::new(stream_id);
        let defaults = &self.window_defaults;
        let (recv, send) = if stream_id.is_server_initiated() {
            if stream_id.is_unidirectional() {
                (0, defaults.uni_send)
            } else {
                (defaults.local_bidi_recv, defaults.local_bidi_send)
            }
        } else if stream_id.is_unidirectional() {
            (defaults.uni_recv, 0)
        } else {
            (defaults.remote_bidi_recv, defaults.remote_bidi_send)
        };
        stream.flow_control.advertised_max_offset = recv;
        stream.flow_control.window_size = recv;
        stream.flow_control.peer_advertised_max_offset = send;
        stream
    }

    fn add_to_stream_priority_map(
        &mut self,
        stream_id: StreamId,
        level: u8,
    ) -> Result<(), TransportError> {
        if self
            .stream_priority_levels
            .insert(stream_id, level)
            .is_some()
        {
            return Err(TransportError::new(
                TransportErrorCode::StreamStateError,
                "Attempted to add stream already in priority map",
            ));
        }
        self.notify_stream_priority_changes();
        Ok(())
    }

    fn allocate_stream(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<(), TransportError> {
        if self.streams.contains_key(&stream_id) {
            return Err(TransportError::new(
                TransportErrorCode::StreamStateError,
                "Creating an active stream",
            ));
        }
        let stream = self.make_stream_state(stream_id);
        let level = stream.priority.level;
        self.streams.insert(stream_id, stream);
        self.add_to_stream_priority_map(stream_id, level)?;
        if let Some(stats) = ctx.stats.as_deref_mut() {
            stats.on_new_quic_stream();
        }
        trace!(stream = %stream_id, "allocated stream state");
        Ok(())
    }

    /// Allocate state for a lazily opened local stream. Returns false when
    /// the id is not in the open set (closed or never opened).
    fn get_or_create_opened_local_stream(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<bool, TransportError> {
        let open_set = if stream_id.is_unidirectional() {
            &self.open_unidirectional_local_streams
        } else {
            &self.open_bidirectional_local_streams
        };
        if !open_set.contains(&stream_id) {
            return Ok(false);
        }
        if !self.streams.contains_key(&stream_id) {
            self.allocate_stream(stream_id, ctx)?;
        }
        Ok(true)
    }

    /// Get a stream, creating peer streams lazily.
    ///
    /// `Ok(None)` means the stream existed once but is closed now.
    pub fn get_stream(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<Option<&mut StreamState>, TransportError> {
        if stream_id.is_remote_for_server() {
            self.get_or_create_peer_stream_inner(stream_id, ctx)?;
            self.update_app_idle_state(ctx);
            return Ok(self.streams.get_mut(&stream_id));
        }
        if !self.streams.contains_key(&stream_id) {
            let opened = self.get_or_create_opened_local_stream(stream_id, ctx)?;
            let next_acceptable = if stream_id.is_unidirectional() {
                self.next_acceptable_local_unidirectional_stream_id
            } else {
                self.next_acceptable_local_bidirectional_stream_id
            };
            if !opened && stream_id.value() >= next_acceptable {
                return Err(TransportError::new(
                    TransportErrorCode::StreamStateError,
                    "Trying to get unopened local stream",
                ));
            }
        }
        self.update_app_idle_state(ctx);
        Ok(self.streams.get_mut(&stream_id))
    }

    /// Lazy peer-stream open. Maintains three invariants:
    /// 1. ids below next-acceptable have been seen before;
    /// 2. seen ids always sit in the open set, so absence there means closed;
    /// 3. opening id `n` implicitly opens every lower id of the same type.
    fn get_or_create_peer_stream_inner(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<(), TransportError> {
        if stream_id.is_server_initiated() {
            return Err(TransportError::new(
                TransportErrorCode::StreamStateError,
                "Attempted getting server peer stream on server",
            ));
        }
        if self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        let open_set = if stream_id.is_unidirectional() {
            &self.open_unidirectional_peer_streams
        } else {
            &self.open_bidirectional_peer_streams
        };
        if open_set.contains(&stream_id) {
            // Seen before, allocate lazily.
            return self.allocate_stream(stream_id, ctx);
        }

        let (next_acceptable, max_stream_id) = if stream_id.is_unidirectional() {
            (
                self.next_acceptable_peer_unidirectional_stream_id,
                self.max_remote_unidirectional_stream_id,
            )
        } else {
            (
                self.next_acceptable_peer_bidirectional_stream_id,
                self.max_remote_bidirectional_stream_id,
            )
        };
        if stream_id.value() < next_acceptable {
            // Closed; the caller treats this as "no stream".
            return Ok(());
        }
        if stream_id.value() >= max_stream_id {
            return Err(TransportError::new(
                TransportErrorCode::StreamLimitError,
                "Exceeded stream limit.",
            ));
        }

        // Implicitly open everything from next-acceptable up to this id.
        let mut start = next_acceptable;
        while start <= stream_id.value() {
            let opened = StreamId(start);
            if stream_id.is_unidirectional() {
                self.open_unidirectional_peer_streams.insert(opened);
            } else {
                self.open_bidirectional_peer_streams.insert(opened);
            }
            self.new_peer_streams.push(opened);
            start += STREAM_INCREMENT;
        }
        if stream_id.is_unidirectional() {
            self.next_acceptable_peer_unidirectional_stream_id =
                stream_id.value() + STREAM_INCREMENT;
        } else {
            self.next_acceptable_peer_bidirectional_stream_id =
                stream_id.value() + STREAM_INCREMENT;
        }
        self.allocate_stream(stream_id, ctx)
    }

    /// Open the next locally-initiated bidirectional stream.
    pub fn create_next_bidirectional_stream(
        &mut self,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<Result<StreamId, LocalError>, TransportError> {
        let stream_id = StreamId(self.next_bidirectional_stream_id);
        let result = self.create_local_stream(stream_id, ctx)?;
        if result.is_ok() {
            self.next_bidirectional_stream_id += STREAM_INCREMENT;
        }
        Ok(result)
    }

    /// Open the next locally-initiated unidirectional stream.
    pub fn create_next_unidirectional_stream(
        &mut self,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<Result<StreamId, LocalError>, TransportError> {
        let stream_id = StreamId(self.next_unidirectional_stream_id);
        let result = self.create_local_stream(stream_id, ctx)?;
        if result.is_ok() {
            self.next_unidirectional_stream_id += STREAM_INCREMENT;
        }
        Ok(result)
    }

    fn create_local_stream(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<Result<StreamId, LocalError>, TransportError> {
        debug_assert!(stream_id.is_server_initiated());
        if self.get_or_create_opened_local_stream(stream_id, ctx)? {
            self.update_app_idle_state(ctx);
            return Ok(Ok(stream_id));
        }
        let (next_acceptable, max_stream_id) = if stream_id.is_unidirectional() {
            (
                self.next_acceptable_local_unidirectional_stream_id,
                self.max_local_unidirectional_stream_id,
            )
        } else {
            (
                self.next_acceptable_local_bidirectional_stream_id,
                self.max_local_bidirectional_stream_id,
            )
        };
        if stream_id.value() < next_acceptable {
            return Ok(Err(LocalError::CreatingExistingStream));
        }
        if stream_id.value() >= max_stream_id {
            return Ok(Err(LocalError::StreamLimitExceeded));
        }
        let mut start = next_acceptable;
        while start <= stream_id.value() {
            if stream_id.is_unidirectional() {
                self.open_unidirectional_local_streams.insert(StreamId(start));
            } else {
                self.open_bidirectional_local_streams.insert(StreamId(start));
            }
            start += STREAM_INCREMENT;
        }
        if stream_id.is_unidirectional() {
            self.next_acceptable_local_unidirectional_stream_id =
                stream_id.value() + STREAM_INCREMENT;
        } else {
            self.next_acceptable_local_bidirectional_stream_id =
                stream_id.value() + STREAM_INCREMENT;
        }
        self.allocate_stream(stream_id, ctx)?;
        self.update_app_idle_state(ctx);
        Ok(Ok(stream_id))
    }

    /// Peer streams opened since the last drain, for accept notifications.
    pub fn drain_new_peer_streams(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.new_peer_streams)
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Remove a stream whose both halves reached a terminal state, purge it
    /// from every index, and grant MAX_STREAMS credit for remote streams.
    pub fn remove_closed_stream(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) -> Result<(), TransportError> {
        let Some(stream) = self.streams.get(&stream_id) else {
            trace!(stream = %stream_id, "removing already closed stream");
            return Ok(());
        };
        debug_assert!(stream.in_terminal_states());
        let was_control = stream.is_control;
        debug!(stream = %stream_id, "removing closed stream");

        self.readable_streams.remove(&stream_id);
        self.peekable_streams.remove(&stream_id);
        self.writable_streams.erase(stream_id);
        self.writable_dsr_streams.erase(stream_id);
        self.writable_control_streams.remove(&stream_id);
        self.loss_streams.remove(&stream_id);
        self.blocked_streams.remove(&stream_id);
        self.deliverable_streams.remove(&stream_id);
        self.tx_streams.remove(&stream_id);
        self.window_updates.remove(&stream_id);
        self.stop_sending_streams.remove(&stream_id);
        self.flow_control_updated.remove(&stream_id);

        if self.stream_priority_levels.remove(&stream_id).is_none() {
            return Err(TransportError::new(
                TransportErrorCode::StreamStateError,
                "Removed stream is not in the priority map",
            ));
        }
        if was_control {
            debug_assert!(self.num_control_streams > 0);
            self.num_control_streams -= 1;
        }
        self.streams.remove(&stream_id);
        if let Some(stats) = ctx.stats.as_deref_mut() {
            stats.on_quic_stream_closed();
        }

        if stream_id.is_remote_for_server() {
            if stream_id.is_unidirectional() {
                self.open_unidirectional_peer_streams.remove(&stream_id);
            } else {
                self.open_bidirectional_peer_streams.remove(&stream_id);
            }
            // Grant windowed MAX_STREAMS credit once enough remote streams
            // closed.
            let (initial_limit, openable, open_count) = if stream_id.is_unidirectional() {
                (
                    self.advertised_initial_max_streams_uni,
                    self.openable_remote_unidirectional_streams(),
                    self.open_unidirectional_peer_streams.len() as u64,
                )
            } else {
                (
                    self.advertised_initial_max_streams_bidi,
                    self.openable_remote_bidirectional_streams(),
                    self.open_bidirectional_peer_streams.len() as u64,
                )
            };
            let stream_window = initial_limit / self.stream_limit_windowing_fraction;
            let stream_credit = initial_limit - openable - open_count;
            if stream_credit >= stream_window {
                if stream_id.is_unidirectional() {
                    let max_streams = (self.max_remote_unidirectional_stream_id
                        - INITIAL_REMOTE_UNI)
                        / STREAM_INCREMENT;
                    self.set_max_remote_unidirectional_streams(max_streams + stream_credit)?;
                    self.remote_unidirectional_stream_limit_update =
                        Some(max_streams + stream_credit);
                } else {
                    let max_streams = (self.max_remote_bidirectional_stream_id
                        - INITIAL_REMOTE_BIDI)
                        / STREAM_INCREMENT;
                    self.set_max_remote_bidirectional_streams(max_streams + stream_credit)?;
                    self.remote_bidirectional_stream_limit_update =
                        Some(max_streams + stream_credit);
                }
            }
        } else if stream_id.is_unidirectional() {
            self.open_unidirectional_local_streams.remove(&stream_id);
        } else {
            self.open_bidirectional_local_streams.remove(&stream_id);
        }

        self.update_app_idle_state(ctx);
        self.notify_stream_priority_changes();
        Ok(())
    }

    // ========================================================================
    // Priority
    // ========================================================================

    /// Change a stream's priority. Returns false when the stream is unknown
    /// or the value is unchanged.
    pub fn set_stream_priority(
        &mut self,
        stream_id: StreamId,
        level: u8,
        incremental: bool,
    ) -> Result<bool, TransportError> {
        let new_priority = StreamPriority { level, incremental };
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(false);
        };
        if stream.priority == new_priority {
            return Ok(false);
        }
        stream.priority = new_priority;
        match self.stream_priority_levels.get_mut(&stream_id) {
            Some(entry) => *entry = level,
            None => {
                return Err(TransportError::new(
                    TransportErrorCode::StreamStateError,
                    "Active stream not in stream priority map",
                ));
            }
        }
        self.notify_stream_priority_changes();
        self.writable_streams.update_if_exist(stream_id, new_priority);
        self.writable_dsr_streams.update_if_exist(stream_id, new_priority);
        Ok(true)
    }

    /// Minimum level across live streams, early exit at zero.
    pub fn get_highest_priority_level(&self) -> u8 {
        let mut min = DEFAULT_MAX_PRIORITY;
        for &level in self.stream_priority_levels.values() {
            if level < min {
                min = level;
            }
            if min == 0 {
                break;
            }
        }
        min
    }

    pub fn set_priority_changes_observer(
        &mut self,
        observer: Box<dyn StreamPrioritiesObserver>,
    ) {
        self.priority_changes_observer = Some(observer);
    }

    pub fn reset_priority_changes_observer(&mut self) {
        self.priority_changes_observer = None;
    }

    fn notify_stream_priority_changes(&mut self) {
        if let Some(observer) = self.priority_changes_observer.as_mut() {
            observer.on_stream_priorities_change();
        }
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Refresh the readable/peekable indices and the HOL latch after any
    /// receive-side change.
    pub fn update_readable_streams(&mut self, stream_id: StreamId, now: Instant) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        update_holb_time(stream, now);
        let readable = stream.has_readable_data() || stream.stream_read_error.is_some();
        let peekable = stream.has_peekable_data() || stream.stream_read_error.is_some();
        if readable {
            self.readable_streams.insert(stream_id);
        } else {
            self.readable_streams.remove(&stream_id);
        }
        if peekable {
            self.peekable_streams.insert(stream_id);
        } else {
            self.peekable_streams.remove(&stream_id);
        }
    }

    /// Refresh the writable queues after any send-side change.
    pub fn update_writable_streams(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };
        let priority = stream.priority;
        let is_control = stream.is_control;
        let write_error = stream.stream_write_error.is_some();
        let writable = stream.has_writable_data() || !stream.loss_buffer.is_empty();
        let dsr_writable = stream.has_writable_buf_meta() || !stream.loss_buf_metas.is_empty();
        if write_error {
            debug_assert!(stream.loss_buffer.is_empty());
            debug_assert!(stream.loss_buf_metas.is_empty());
            self.writable_streams.erase(stream_id);
            self.writable_dsr_streams.erase(stream_id);
            self.writable_control_streams.remove(&stream_id);
            return;
        }
        if writable {
            if is_control {
                self.writable_control_streams.insert(stream_id);
            } else {
                self.writable_streams.insert_or_update(stream_id, priority);
            }
        } else if is_control {
            self.writable_control_streams.remove(&stream_id);
        } else {
            self.writable_streams.erase(stream_id);
        }
        if is_control {
            return;
        }
        if dsr_writable {
            self.writable_dsr_streams.insert_or_update(stream_id, priority);
        } else {
            self.writable_dsr_streams.erase(stream_id);
        }
    }

    pub fn add_loss(&mut self, stream_id: StreamId) {
        self.loss_streams.insert(stream_id);
    }

    pub fn add_blocked(&mut self, stream_id: StreamId) {
        self.blocked_streams.insert(stream_id);
    }

    pub fn add_deliverable(&mut self, stream_id: StreamId) {
        self.deliverable_streams.insert(stream_id);
    }

    pub fn add_tx(&mut self, stream_id: StreamId) {
        self.tx_streams.insert(stream_id);
    }

    pub fn add_window_update(&mut self, stream_id: StreamId) {
        self.window_updates.insert(stream_id);
    }

    pub fn add_stop_sending(&mut self, stream_id: StreamId, error_code: u64) {
        self.stop_sending_streams.insert(stream_id, error_code);
    }

    pub fn add_flow_control_updated(&mut self, stream_id: StreamId) {
        self.flow_control_updated.insert(stream_id);
    }

    pub fn readable_streams(&self) -> &BTreeSet<StreamId> {
        &self.readable_streams
    }

    pub fn peekable_streams(&self) -> &BTreeSet<StreamId> {
        &self.peekable_streams
    }

    pub fn writable_streams(&self) -> &PriorityQueue {
        &self.writable_streams
    }

    pub fn writable_dsr_streams(&self) -> &PriorityQueue {
        &self.writable_dsr_streams
    }

    pub fn blocked_streams(&self) -> &BTreeSet<StreamId> {
        &self.blocked_streams
    }

    pub fn loss_streams(&self) -> &BTreeSet<StreamId> {
        &self.loss_streams
    }

    pub fn window_updates(&self) -> &BTreeSet<StreamId> {
        &self.window_updates
    }

    /// Every per-stream index, the priority map included, is empty.
    pub fn all_indices_empty(&self) -> bool {
        self.readable_streams.is_empty()
            && self.peekable_streams.is_empty()
            && self.writable_streams.is_empty()
            && self.writable_dsr_streams.is_empty()
            && self.writable_control_streams.is_empty()
            && self.blocked_streams.is_empty()
            && self.deliverable_streams.is_empty()
            && self.tx_streams.is_empty()
            && self.window_updates.is_empty()
            && self.stop_sending_streams.is_empty()
            && self.flow_control_updated.is_empty()
            && self.loss_streams.is_empty()
            && self.stream_priority_levels.is_empty()
    }

    // ========================================================================
    // Control streams and app-idle
    // ========================================================================

    pub fn set_stream_as_control(
        &mut self,
        stream_id: StreamId,
        ctx: &mut ManagerContext<'_>,
    ) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.is_control {
                stream.is_control = true;
                self.num_control_streams += 1;
            }
        }
        self.update_app_idle_state(ctx);
    }

    pub fn is_app_idle(&self) -> bool {
        self.is_app_idle
    }

    fn has_non_ctrl_streams(&self) -> bool {
        self.streams.len() as u64 > self.num_control_streams
    }

    /// The connection is app-idle iff it has zero non-control streams.
    /// Transitions are pushed into the congestion controller.
    fn update_app_idle_state(&mut self, ctx: &mut ManagerContext<'_>) {
        let has_non_ctrl = self.has_non_ctrl_streams();
        if self.is_app_idle == !has_non_ctrl {
            return;
        }
        self.is_app_idle = !has_non_ctrl;
        if let Some(congestion) = ctx.congestion.as_deref_mut() {
            congestion.set_app_idle(self.is_app_idle, ctx.now);
        }
    }
}

/// Head-of-line-blocking latch maintenance.
///
/// A stream becomes HOL-blocked when buffered data exists that cannot be read
/// at the current offset; it unblocks when the front of the buffer lines up
/// with the read offset (or the buffer drains).
fn update_holb_time(stream: &mut StreamState, now: Instant) {
    if stream.read_buffer.is_empty()
        || stream.read_buffer.front_offset() == Some(stream.current_read_offset)
    {
        if let Some(since) = stream.last_holb_time.take() {
            stream.total_holb_time += now.saturating_duration_since(since);
        }
        return;
    }
    if stream.last_holb_time.is_some() {
        return;
    }
    stream.last_holb_time = Some(now);
    stream.holb_count += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamRecvState, StreamSendState};
    use bytes::Bytes;

    fn manager() -> StreamManager {
        StreamManager::new(
            100,
            100,
            4,
            StreamWindowDefaults {
                local_bidi_recv: 1_000,
                remote_bidi_recv: 1_000,
                uni_recv: 1_000,
                ..Default::default()
            },
        )
    }

    fn close_stream(manager: &mut StreamManager, id: StreamId) {
        let stream = manager.find_stream(id).unwrap();
        stream.send_state = StreamSendState::Closed;
        stream.recv_state = StreamRecvState::Closed;
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        manager.remove_closed_stream(id, &mut ctx).unwrap();
    }

    #[test]
    fn test_peer_stream_lazy_implicit_open() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        // Opening stream 8 implicitly opens 0 and 4.
        let stream = manager.get_stream(StreamId(8), &mut ctx).unwrap().unwrap();
        assert_eq!(stream.id, StreamId(8));
        assert!(manager.stream_exists(StreamId(0)));
        assert!(manager.stream_exists(StreamId(4)));
        // 0 and 4 have no state records yet.
        assert_eq!(manager.stream_count(), 1);
        assert_eq!(
            manager.drain_new_peer_streams(),
            vec![StreamId(0), StreamId(4), StreamId(8)]
        );
        // First access to an implicitly opened stream allocates it.
        assert!(manager.get_stream(StreamId(4), &mut ctx).unwrap().is_some());
        assert_eq!(manager.stream_count(), 2);
    }

    #[test]
    fn test_closed_peer_stream_returns_none() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        manager.get_stream(StreamId(0), &mut ctx).unwrap().unwrap();
        close_stream(&mut manager, StreamId(0));
        assert!(manager.get_stream(StreamId(0), &mut ctx).unwrap().is_none());
    }

    #[test]
    fn test_peer_stream_limit_enforced() {
        let mut manager = StreamManager::new(2, 2, 2, StreamWindowDefaults::default());
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        assert!(manager.get_stream(StreamId(4), &mut ctx).unwrap().is_some());
        let err = manager.get_stream(StreamId(8), &mut ctx).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::StreamLimitError);
    }

    #[test]
    fn test_local_stream_creation_and_limits() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        manager.set_max_local_bidirectional_streams(2, false).unwrap();
        let first = manager
            .create_next_bidirectional_stream(&mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(first, StreamId(1));
        let second = manager
            .create_next_bidirectional_stream(&mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(second, StreamId(5));
        let exhausted = manager.create_next_bidirectional_stream(&mut ctx).unwrap();
        assert_eq!(exhausted, Err(LocalError::StreamLimitExceeded));
    }

    #[test]
    fn test_get_unopened_local_stream_is_error() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        let err = manager.get_stream(StreamId(9), &mut ctx).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::StreamStateError);
    }

    #[test]
    fn test_stream_limit_windowing_scenario() {
        // advertised=100, fraction=4. Peer opens 0,4,...,396; closing the
        // first 25 streams advertises a limit of 125, exactly once.
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        manager.get_stream(StreamId(396), &mut ctx).unwrap().unwrap();
        for id in (0..=96).step_by(4) {
            // Allocate the lazily opened stream so it can be closed.
            manager.get_stream(StreamId(id), &mut ctx).unwrap().unwrap();
            close_stream(&mut manager, StreamId(id));
        }
        assert_eq!(manager.remote_bidirectional_stream_limit_update(), Some(125));
        assert_eq!(manager.remote_bidirectional_stream_limit_update(), None);
    }

    #[test]
    fn test_remove_closed_stream_purges_all_indices() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        let ids: Vec<StreamId> = vec![StreamId(0), StreamId(4), StreamId(8)];
        for &id in &ids {
            let stream = manager.get_stream(id, &mut ctx).unwrap().unwrap();
            stream.read_buffer.insert(0, Bytes::from_static(b"x"));
            stream.pending_writes.push(Bytes::from_static(b"y"));
            stream.flow_control.peer_advertised_max_offset = 100;
            manager.update_readable_streams(id, Instant::ZERO);
            manager.update_writable_streams(id);
            manager.add_blocked(id);
            manager.add_loss(id);
            manager.add_deliverable(id);
            manager.add_tx(id);
            manager.add_window_update(id);
            manager.add_stop_sending(id, 0);
            manager.add_flow_control_updated(id);
        }
        assert!(!manager.all_indices_empty());
        for &id in &ids {
            close_stream(&mut manager, id);
        }
        assert!(manager.all_indices_empty());
        assert_eq!(manager.stream_count(), 0);
    }

    #[test]
    fn test_set_stream_priority_idempotence() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        let id = StreamId(0);
        {
            let stream = manager.get_stream(id, &mut ctx).unwrap().unwrap();
            stream.pending_writes.push(Bytes::from_static(b"y"));
            stream.flow_control.peer_advertised_max_offset = 100;
        }
        manager.update_writable_streams(id);
        assert!(manager.set_stream_priority(id, 2, true).unwrap());
        let position = manager.writable_streams().position(id);
        assert!(!manager.set_stream_priority(id, 2, true).unwrap());
        assert_eq!(manager.writable_streams().position(id), position);
        // Priority map mirrors the stream's level at all times.
        assert_eq!(*manager.stream_priority_levels.get(&id).unwrap(), 2);
        assert_eq!(manager.find_stream(id).unwrap().priority.level, 2);
    }

    #[test]
    fn test_highest_priority_level() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        manager.get_stream(StreamId(0), &mut ctx).unwrap();
        manager.get_stream(StreamId(4), &mut ctx).unwrap();
        manager.set_stream_priority(StreamId(0), 6, false).unwrap();
        manager.set_stream_priority(StreamId(4), 1, false).unwrap();
        assert_eq!(manager.get_highest_priority_level(), 1);
    }

    #[test]
    fn test_max_streams_cap() {
        let mut manager = manager();
        let err = manager
            .set_max_local_bidirectional_streams(MAX_MAX_STREAMS + 1, false)
            .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::StreamLimitError);
    }

    #[test]
    fn test_set_max_remote_same_value_is_noop() {
        let mut manager = manager();
        let before = manager.max_remote_bidirectional_stream_id;
        manager.set_max_remote_bidirectional_streams(100).unwrap();
        assert_eq!(manager.max_remote_bidirectional_stream_id, before);
    }

    #[test]
    fn test_app_idle_transitions_reach_congestion_controller() {
        use crate::recovery::congestion::StaticCwndCongestionController;

        let mut manager = manager();
        let mut cc = StaticCwndCongestionController::new(10_000);
        {
            let mut ctx = ManagerContext {
                now: Instant::ZERO,
                stats: None,
                congestion: Some(&mut cc),
            };
            manager.get_stream(StreamId(0), &mut ctx).unwrap();
            manager.set_stream_as_control(StreamId(0), &mut ctx);
        }
        // Only a control stream left: app idle.
        assert!(manager.is_app_idle());
        let mut ctx = ManagerContext {
            now: Instant::ZERO,
            stats: None,
            congestion: Some(&mut cc),
        };
        manager.get_stream(StreamId(4), &mut ctx).unwrap();
        assert!(!manager.is_app_idle());
    }

    #[test]
    fn test_holb_accounting() {
        let mut manager = manager();
        let mut ctx = ManagerContext::bare(Instant::ZERO);
        let id = StreamId(0);
        {
            let stream = manager.get_stream(id, &mut ctx).unwrap().unwrap();
            // Gap at the front: offset 5 buffered while reading at 0.
            stream.read_buffer.insert(5, Bytes::from_static(b"later"));
        }
        manager.update_readable_streams(id, Instant::from_nanos(1_000));
        {
            let stream = manager.find_stream(id).unwrap();
            assert_eq!(stream.holb_count, 1);
            assert!(stream.last_holb_time.is_some());
            // Fill the gap.
            stream.read_buffer.insert(0, Bytes::from_static(b"early"));
        }
        manager.update_readable_streams(id, Instant::from_nanos(3_000));
        let stream = manager.find_stream(id).unwrap();
        assert_eq!(stream.holb_count, 1);
        assert!(stream.last_holb_time.is_none());
        assert_eq!(stream.total_holb_time, core::time::Duration::from_nanos(2_000));
    }
}
