// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::net::SocketAddr;

use std::collections::BTreeMap;

use std::time::Instant;

use slab::Slab;

use crate::Error;
use crate::Result;

use crate::packet::Epoch;
use crate::recovery::CongestionControl;
use crate::recovery::CongestionControlFactory;
use crate::recovery::PacketInfo;
use crate::recovery::RecoveryConfig;

/// Initial MTU for IPv4 paths.
pub const INITIAL_IPV4_MTU: usize = 1252;

/// Initial MTU for IPv6 paths.
pub const INITIAL_IPV6_MTU: usize = 1232;

/// The different states of the path validation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathValidationState {
    /// The path failed its validation.
    Failed,

    /// The path is under validation.
    Validating,

    /// The path has been validated.
    Validated,
}

/// A network path.
///
/// The path accounts bytes in flight. Whether more bytes may be sent is up to
/// the attached congestion controller.
pub struct Path {
    local_addr: SocketAddr,

    peer_addr: SocketAddr,

    /// Maximum datagram size on this path.
    mtu: usize,

    /// Largest congestion window reached.
    mcwnd: usize,

    max_cwnd: usize,

    min_cwnd: usize,

    /// Bytes of packets being built and not sent yet.
    prep_in_flight: usize,

    /// Bytes of sent packets not acknowledged nor declared lost.
    in_flight: usize,

    /// Number of ack-eliciting packets in flight.
    ifae_pkts: usize,

    validation_state: PathValidationState,

    active: bool,

    cc: Box<dyn CongestionControl>,
}

impl Path {
    /// Creates a new path.
    ///
    /// The initial path of a connection is considered validated, the
    /// connection's anti-amplification limit covers it.
    pub fn new(
        local_addr: SocketAddr, peer_addr: SocketAddr, mtu: Option<usize>,
        recovery_config: &RecoveryConfig, cc_factory: CongestionControlFactory,
        is_initial: bool,
    ) -> Path {
        let mtu = mtu.unwrap_or(if peer_addr.is_ipv6() {
            INITIAL_IPV6_MTU
        } else {
            INITIAL_IPV4_MTU
        });

        let recovery_config = RecoveryConfig {
            max_datagram_size: mtu,
            ..*recovery_config
        };

        let cc = cc_factory(&recovery_config);

        let validation_state = if is_initial {
            PathValidationState::Validated
        } else {
            PathValidationState::Validating
        };

        Path {
            local_addr,
            peer_addr,
            mtu,
            mcwnd: cc.congestion_window(),
            max_cwnd: recovery_config.max_cwnd,
            min_cwnd: recovery_config.min_cwnd,
            prep_in_flight: 0,
            in_flight: 0,
            ifae_pkts: 0,
            validation_state,
            active: false,
            cc,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn cwnd(&self) -> usize {
        self.cc.congestion_window()
    }

    pub fn mcwnd(&self) -> usize {
        self.mcwnd
    }

    pub fn max_cwnd(&self) -> usize {
        self.max_cwnd
    }

    pub fn min_cwnd(&self) -> usize {
        self.min_cwnd
    }

    pub fn prep_in_flight(&self) -> usize {
        self.prep_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn ifae_pkts(&self) -> usize {
        self.ifae_pkts
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn validated(&self) -> bool {
        self.validation_state == PathValidationState::Validated
    }

    pub fn validation_state(&self) -> PathValidationState {
        self.validation_state
    }

    pub fn on_validated(&mut self) {
        self.validation_state = PathValidationState::Validated;
    }

    pub fn on_validation_failed(&mut self) {
        self.validation_state = PathValidationState::Failed;
    }

    pub fn cc(&self) -> &dyn CongestionControl {
        self.cc.as_ref()
    }

    /// Records bytes of a packet being built.
    pub fn on_packet_prepared(&mut self, bytes: usize) {
        self.prep_in_flight += bytes;
    }

    /// Records a packet handed to the network.
    ///
    /// `prepared` is the amount that was recorded by
    /// [`on_packet_prepared()`](Self::on_packet_prepared) for it.
    #[allow(clippy::too_many_arguments)]
    pub fn on_packet_sent(
        &mut self, epoch: Epoch, pkt_num: u64, prepared: usize, bytes: usize,
        ack_eliciting: bool, in_flight: bool, now: Instant,
    ) {
        self.prep_in_flight = self.prep_in_flight.saturating_sub(prepared);

        if in_flight {
            self.in_flight += bytes;

            if ack_eliciting {
                self.ifae_pkts += 1;
            }
        }

        self.cc
            .on_packet_sent(epoch, pkt_num, bytes, ack_eliciting, now);
    }

    fn remove_in_flight(&mut self, bytes: usize, ack_eliciting: bool) {
        debug_assert!(self.in_flight >= bytes);

        self.in_flight = self.in_flight.saturating_sub(bytes);

        if ack_eliciting {
            self.ifae_pkts = self.ifae_pkts.saturating_sub(1);
        }
    }

    pub fn on_packet_acked(
        &mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant,
    ) {
        self.remove_in_flight(pkt.size, pkt.ack_eliciting);

        self.cc.on_packet_acked(epoch, pkt, now);

        self.mcwnd = self.mcwnd.max(self.cc.congestion_window());
    }

    pub fn on_packet_lost(
        &mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant,
    ) {
        self.remove_in_flight(pkt.size, pkt.ack_eliciting);

        self.cc.on_packet_lost(epoch, pkt, now);
    }

    /// Removes the bytes in flight of a discarded packet number space and
    /// cancels its timers.
    pub fn on_pkt_num_space_discarded(
        &mut self, epoch: Epoch, bytes: usize, ack_eliciting_pkts: usize,
    ) {
        debug_assert!(self.in_flight >= bytes);

        self.in_flight = self.in_flight.saturating_sub(bytes);
        self.ifae_pkts = self.ifae_pkts.saturating_sub(ack_eliciting_pkts);

        self.cc.on_pkt_num_space_discarded(epoch);
    }

    pub fn loss_detection_timer(&self) -> Option<Instant> {
        self.cc.loss_detection_timer()
    }

    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> Option<Epoch> {
        self.cc.on_loss_detection_timeout(now)
    }

    /// Forgets a prepared packet that was never handed to the network.
    pub fn on_prepared_dropped(&mut self, bytes: usize) {
        self.prep_in_flight = self.prep_in_flight.saturating_sub(bytes);
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "local={:?} peer={:?} mtu={} cwnd={} in_flight={} ifae={} \
             validation={:?} active={}",
            self.local_addr,
            self.peer_addr,
            self.mtu,
            self.cwnd(),
            self.in_flight,
            self.ifae_pkts,
            self.validation_state,
            self.active,
        )
    }
}

/// The paths of a connection: one active path, and at most one path whose
/// validation is pending after the peer's address changed.
pub struct PathMap {
    paths: Slab<Path>,

    /// The mapping from the (local `SocketAddr`, peer `SocketAddr`) to the
    /// `Path` structure identifier.
    addrs_to_paths: BTreeMap<(SocketAddr, SocketAddr), usize>,

    active: usize,

    pending: Option<usize>,
}

impl PathMap {
    pub fn new(mut initial_path: Path) -> PathMap {
        // Most connections only have one path.
        let mut paths = Slab::with_capacity(1);
        let mut addrs_to_paths = BTreeMap::new();

        let addrs = (initial_path.local_addr, initial_path.peer_addr);

        initial_path.active = true;

        let active = paths.insert(initial_path);
        addrs_to_paths.insert(addrs, active);

        PathMap {
            paths,
            addrs_to_paths,
            active,
            pending: None,
        }
    }

    #[inline]
    pub fn get(&self, path_id: usize) -> Result<&Path> {
        self.paths.get(path_id).ok_or(Error::InvalidPathState)
    }

    #[inline]
    pub fn get_mut(&mut self, path_id: usize) -> Result<&mut Path> {
        self.paths.get_mut(path_id).ok_or(Error::InvalidPathState)
    }

    pub fn active(&self) -> &Path {
        &self.paths[self.active]
    }

    pub fn active_mut(&mut self) -> &mut Path {
        &mut self.paths[self.active]
    }

    pub fn active_path_id(&self) -> usize {
        self.active
    }

    pub fn pending_path_id(&self) -> Option<usize> {
        self.pending
    }

    #[inline]
    pub fn iter(&self) -> slab::Iter<Path> {
        self.paths.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> slab::IterMut<Path> {
        self.paths.iter_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn path_id_from_addrs(
        &self, addrs: &(SocketAddr, SocketAddr),
    ) -> Option<usize> {
        self.addrs_to_paths.get(addrs).copied()
    }

    /// Records a path to a new peer address, replacing the previous pending
    /// path if any.
    pub fn insert_pending(&mut self, path: Path) -> Result<usize> {
        let addrs = (path.local_addr, path.peer_addr);

        if self.addrs_to_paths.contains_key(&addrs) {
            return Err(Error::InvalidPathState);
        }

        if let Some(old) = self.pending.take() {
            self.remove(old);
        }

        let pid = self.paths.insert(path);
        self.addrs_to_paths.insert(addrs, pid);
        self.pending = Some(pid);

        Ok(pid)
    }

    /// Makes the validated pending path the active path and forgets the
    /// previous one. Returns the previous active path.
    pub fn promote_pending(&mut self) -> Result<Path> {
        let pid = self.pending.ok_or(Error::InvalidPathState)?;

        if !self.paths[pid].validated() {
            return Err(Error::InvalidPathState);
        }

        self.pending = None;

        let old = self.active;

        self.paths[pid].active = true;
        self.paths[pid].cc.on_connection_migration();

        self.active = pid;

        let mut old = self.remove(old);
        old.active = false;

        Ok(old)
    }

    /// Drops the pending path, for example when its validation failed.
    pub fn abandon_pending(&mut self) -> Option<Path> {
        let pid = self.pending.take()?;

        Some(self.remove(pid))
    }

    fn remove(&mut self, pid: usize) -> Path {
        let path = self.paths.remove(pid);

        self.addrs_to_paths
            .remove(&(path.local_addr, path.peer_addr));

        path
    }
}
