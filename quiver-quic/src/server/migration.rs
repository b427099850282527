//! # Connection Migration & Path Validation (RFC 9000 Section 9)
//!
//! A non-probing packet from a new peer address triggers migration: a path
//! challenge toward the unvalidated address, and congestion/RTT state that
//! is preserved across NAT rebinding but saved (and possibly later
//! restored) across genuine path changes.

#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{PacketDropReason, TransportError, TransportErrorCode};
use crate::recovery::CongestionAndRttState;
use crate::server::{PendingPathRateLimiter, ServerConnection};
use crate::types::{
    Instant, MAX_NUM_MIGRATIONS_ALLOWED, TIME_TO_RETAIN_LAST_CONGESTION_AND_RTT_STATE,
};

/// Port-only changes and IPv4 moves within a shared /24 are treated as NAT
/// rebinding: the path did not really change, so congestion state survives.
pub fn maybe_nat_rebinding(new_peer_address: SocketAddr, old_peer_address: SocketAddr) -> bool {
    let new_ip = new_peer_address.ip();
    let old_ip = old_peer_address.ip();
    if new_ip == old_ip {
        return true;
    }
    match (new_ip, old_ip) {
        (IpAddr::V4(new_v4), IpAddr::V4(old_v4)) => {
            new_v4.octets()[..3] == old_v4.octets()[..3]
        }
        _ => false,
    }
}

impl ServerConnection {
    pub(super) fn on_connection_migration(
        &mut self,
        new_peer_address: SocketAddr,
        is_intentional: bool,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.migration_state.num_migrations >= MAX_NUM_MIGRATIONS_ALLOWED {
            self.record_packet_drop(0, PacketDropReason::PeerAddressChange);
            return Err(TransportError::new(
                TransportErrorCode::InvalidMigration,
                "Too many migrations",
            ));
        }
        self.migration_state.num_migrations += 1;

        let had_pending_path_challenge = self.pending_events.path_challenge.is_some();
        // Clear any pending path challenge frame that is not sent.
        self.pending_events.path_challenge = None;

        let previously_validated = self
            .migration_state
            .previous_peer_addresses
            .iter()
            .position(|&addr| addr == new_peer_address);
        match previously_validated {
            None => {
                // Send a new path challenge.
                let path_data: u64 = rand::thread_rng().gen();
                self.pending_events.path_challenge = Some(path_data);
                // A migration mid-migration keeps the rate-limit window but
                // resets the available bytes.
                self.path_validation_limiter =
                    Some(PendingPathRateLimiter::new(self.udp_send_packet_len));
                debug!(peer = %new_peer_address, "scheduling path challenge");
            }
            Some(index) => {
                self.migration_state.previous_peer_addresses.remove(index);
            }
        }

        let is_nat_rebinding = maybe_nat_rebinding(new_peer_address, self.peer_address);

        if had_pending_path_challenge || self.outstanding_path_validation.is_some() {
            // Cancel the path validation in flight.
            self.pending_events.schedule_path_validation_timeout = false;
            self.outstanding_path_validation = None;
            if !is_nat_rebinding {
                self.recover_or_reset_congestion_and_rtt_state(new_peer_address, now);
            }
        } else {
            // The current peer address is validated; remember it together
            // with its congestion state and rtt stats.
            let old_peer_address = self.peer_address;
            self.migration_state
                .previous_peer_addresses
                .push(old_peer_address);
            if !is_nat_rebinding {
                let saved = self.move_current_congestion_and_rtt_state(now);
                self.recover_or_reset_congestion_and_rtt_state(new_peer_address, now);
                self.migration_state.last_congestion_and_rtt = Some(saved);
            }
        }

        if let Some(observer) = self.observer.as_mut() {
            observer.add_connection_migration_update(is_intentional);
        }
        debug!(
            peer = %new_peer_address,
            nat_rebinding = is_nat_rebinding,
            intentional = is_intentional,
            "peer address migrated"
        );
        self.peer_address = new_peer_address;
        Ok(())
    }

    fn move_current_congestion_and_rtt_state(&mut self, now: Instant) -> CongestionAndRttState {
        let replacement = self.congestion_controller_factory.make_congestion_controller(
            self.transport_settings.default_congestion_controller,
            &self.transport_settings,
        );
        let congestion_controller =
            std::mem::replace(&mut self.congestion_controller, replacement);
        CongestionAndRttState {
            peer_address: self.peer_address,
            record_time: now,
            congestion_controller,
            srtt: self.rtt.srtt,
            lrtt: self.rtt.lrtt,
            rttvar: self.rtt.rttvar,
            mrtt: self.rtt.mrtt,
        }
    }

    fn reset_congestion_and_rtt_state(&mut self) {
        self.congestion_controller = self.congestion_controller_factory.make_congestion_controller(
            self.transport_settings.default_congestion_controller,
            &self.transport_settings,
        );
        self.rtt.reset();
    }

    fn recover_or_reset_congestion_and_rtt_state(
        &mut self,
        peer_address: SocketAddr,
        now: Instant,
    ) {
        let recoverable = self
            .migration_state
            .last_congestion_and_rtt
            .as_ref()
            .is_some_and(|last| {
                last.peer_address == peer_address
                    && now.saturating_duration_since(last.record_time)
                        <= TIME_TO_RETAIN_LAST_CONGESTION_AND_RTT_STATE
            });
        if recoverable {
            // Recover from the matched non-stale state.
            let last = self.migration_state.last_congestion_and_rtt.take().unwrap();
            self.congestion_controller = last.congestion_controller;
            self.rtt.srtt = last.srtt;
            self.rtt.lrtt = last.lrtt;
            self.rtt.rttvar = last.rttvar;
            self.rtt.mrtt = last.mrtt;
        } else {
            if self.migration_state.last_congestion_and_rtt.is_some() {
                warn!(peer = %peer_address, "saved congestion state unusable, rebuilding");
            }
            self.reset_congestion_and_rtt_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((ip, port))
    }

    #[test]
    fn test_port_change_is_nat_rebinding() {
        assert!(maybe_nat_rebinding(
            addr([192, 0, 2, 10], 5001),
            addr([192, 0, 2, 10], 5000)
        ));
    }

    #[test]
    fn test_same_slash24_is_nat_rebinding() {
        assert!(maybe_nat_rebinding(
            addr([192, 0, 2, 200], 5000),
            addr([192, 0, 2, 10], 5000)
        ));
    }

    #[test]
    fn test_different_subnet_is_migration() {
        assert!(!maybe_nat_rebinding(
            addr([192, 0, 3, 10], 5000),
            addr([192, 0, 2, 10], 5000)
        ));
    }

    #[test]
    fn test_v6_never_nat_rebinding_across_ips() {
        let old: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let new: SocketAddr = "[2001:db8::2]:5000".parse().unwrap();
        assert!(!maybe_nat_rebinding(new, old));
        assert!(maybe_nat_rebinding("[2001:db8::1]:6000".parse().unwrap(), old));
    }
}
