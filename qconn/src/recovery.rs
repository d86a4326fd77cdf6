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

//! Per-path congestion control and loss detection seam.

use std::fmt::Debug;

use std::time::Duration;
use std::time::Instant;

use crate::packet::Epoch;

const INITIAL_RTT: Duration = Duration::from_millis(333);

const GRANULARITY: Duration = Duration::from_millis(1);

const LOSS_REDUCTION_FACTOR: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub max_datagram_size: usize,
    pub initial_cwnd: usize,
    pub min_cwnd: usize,
    pub max_cwnd: usize,
    pub max_ack_delay: Duration,
}

/// A sent packet that was acknowledged or declared lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketInfo {
    pub pkt_num: u64,

    pub size: usize,

    pub ack_eliciting: bool,

    pub time_sent: Instant,
}

/// Congestion controller and loss detector attached to a path.
///
/// The path only accounts bytes, the controller decides the window and
/// owns the loss detection timers of each packet number space.
pub trait CongestionControl: Debug + Send {
    /// Returns the size of the current congestion window in bytes.
    fn congestion_window(&self) -> usize;

    fn on_packet_sent(
        &mut self, epoch: Epoch, pkt_num: u64, sent_bytes: usize,
        ack_eliciting: bool, now: Instant,
    );

    fn on_packet_acked(&mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant);

    fn on_packet_lost(&mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant);

    /// Cancels everything owned by the given packet number space.
    fn on_pkt_num_space_discarded(&mut self, epoch: Epoch);

    /// Called when the path becomes the active path after a migration.
    fn on_connection_migration(&mut self);

    /// Earliest loss detection or probe timeout deadline, if any.
    fn loss_detection_timer(&self) -> Option<Instant>;

    /// Handles an expired loss detection timer, returning the packet number
    /// space that must send a probe.
    fn on_loss_detection_timeout(&mut self, now: Instant) -> Option<Epoch>;

    /// Current probe timeout.
    fn pto(&self) -> Duration;
}

/// Builds the congestion controller of a new path.
pub type CongestionControlFactory =
    fn(&RecoveryConfig) -> Box<dyn CongestionControl>;

/// A NewReno style controller with a static RTT estimate.
///
/// Only the window and the per-space probe timers are tracked, loss
/// detection proper is done by the caller.
#[derive(Debug)]
pub struct Reno {
    congestion_window: usize,

    ssthresh: usize,

    min_cwnd: usize,

    max_cwnd: usize,

    max_datagram_size: usize,

    congestion_recovery_start_time: Option<Instant>,

    pto: Duration,

    /// Probe timeout deadline of each packet number space.
    timers: [Option<Instant>; 3],

    /// Number of ack-eliciting packets in flight, per space.
    ack_eliciting_in_flight: [usize; 3],

    /// Number of probe timeouts since the last acknowledgement.
    pto_count: u32,
}

impl Reno {
    pub fn new(config: &RecoveryConfig) -> Reno {
        let pto = INITIAL_RTT +
            std::cmp::max(INITIAL_RTT * 2, GRANULARITY) +
            config.max_ack_delay;

        Reno {
            congestion_window: config
                .initial_cwnd
                .clamp(config.min_cwnd, config.max_cwnd),
            ssthresh: usize::MAX,
            min_cwnd: config.min_cwnd,
            max_cwnd: config.max_cwnd,
            max_datagram_size: config.max_datagram_size,
            congestion_recovery_start_time: None,
            pto,
            timers: [None; 3],
            ack_eliciting_in_flight: [0; 3],
            pto_count: 0,
        }
    }

    fn backed_off_pto(&self) -> Duration {
        self.pto * 2_u32.saturating_pow(self.pto_count.min(16))
    }

    fn in_congestion_recovery(&self, sent_time: Instant) -> bool {
        match self.congestion_recovery_start_time {
            Some(start) => sent_time <= start,
            None => false,
        }
    }
}

/// Default [`CongestionControlFactory`].
pub fn new_reno(config: &RecoveryConfig) -> Box<dyn CongestionControl> {
    Box::new(Reno::new(config))
}

impl CongestionControl for Reno {
    fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    fn on_packet_sent(
        &mut self, epoch: Epoch, _pkt_num: u64, _sent_bytes: usize,
        ack_eliciting: bool, now: Instant,
    ) {
        if ack_eliciting {
            self.ack_eliciting_in_flight[epoch.index()] += 1;
            self.timers[epoch.index()] = Some(now + self.backed_off_pto());
        }
    }

    fn on_packet_acked(&mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant) {
        let idx = epoch.index();

        self.pto_count = 0;

        if pkt.ack_eliciting {
            self.ack_eliciting_in_flight[idx] =
                self.ack_eliciting_in_flight[idx].saturating_sub(1);

            if self.ack_eliciting_in_flight[idx] == 0 {
                self.timers[idx] = None;
            } else {
                self.timers[idx] = Some(now + self.pto);
            }
        }

        if self.in_congestion_recovery(pkt.time_sent) {
            return;
        }

        if self.congestion_window < self.ssthresh {
            // Slow start.
            self.congestion_window += pkt.size;
        } else {
            // Congestion avoidance.
            self.congestion_window += self.max_datagram_size * pkt.size /
                self.congestion_window.max(1);
        }

        self.congestion_window = self.congestion_window.min(self.max_cwnd);
    }

    fn on_packet_lost(&mut self, epoch: Epoch, pkt: &PacketInfo, now: Instant) {
        let idx = epoch.index();

        if pkt.ack_eliciting {
            self.ack_eliciting_in_flight[idx] =
                self.ack_eliciting_in_flight[idx].saturating_sub(1);

            if self.ack_eliciting_in_flight[idx] == 0 {
                self.timers[idx] = None;
            }
        }

        if self.in_congestion_recovery(pkt.time_sent) {
            return;
        }

        self.congestion_recovery_start_time = Some(now);

        self.congestion_window =
            (self.congestion_window as f64 * LOSS_REDUCTION_FACTOR) as usize;
        self.congestion_window = self.congestion_window.max(self.min_cwnd);

        self.ssthresh = self.congestion_window;
    }

    fn on_pkt_num_space_discarded(&mut self, epoch: Epoch) {
        self.timers[epoch.index()] = None;
        self.ack_eliciting_in_flight[epoch.index()] = 0;
    }

    fn on_connection_migration(&mut self) {
        self.congestion_window = self.min_cwnd.max(self.max_datagram_size * 2);
        self.ssthresh = usize::MAX;
        self.congestion_recovery_start_time = None;
    }

    fn loss_detection_timer(&self) -> Option<Instant> {
        self.timers.iter().flatten().min().copied()
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) -> Option<Epoch> {
        let (idx, _) = self
            .timers
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (i, t)))
            .filter(|(_, t)| *t <= now)
            .min_by_key(|(_, t)| *t)?;

        self.pto_count += 1;
        self.timers[idx] = Some(now + self.backed_off_pto());

        Epoch::ALL.get(idx).copied()
    }

    fn pto(&self) -> Duration {
        self.pto
    }
}
