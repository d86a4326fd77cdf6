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

use std::collections::BTreeMap;

use std::time::Instant;

use crate::Error;
use crate::Result;

use crate::packet;
use crate::packet::Epoch;
use crate::packet::PktNumWindow;
use crate::recovery::PacketInfo;

/// A sent packet, tracked until it is acknowledged, lost or its space is
/// discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub pkt_num: u64,

    /// Size of the packet on the wire.
    pub size: usize,

    pub ack_eliciting: bool,

    /// Whether the packet counts towards bytes in flight.
    pub in_flight: bool,

    /// The path the packet was sent on.
    pub path_id: usize,

    pub time_sent: Instant,

    /// Range of crypto stream data carried by the packet.
    pub crypto: Option<(u64, usize)>,

    /// Whether the packet carries a HANDSHAKE_DONE frame.
    pub handshake_done: bool,
}

impl SentPacket {
    /// What the congestion controller is told about the packet.
    pub fn info(&self) -> PacketInfo {
        PacketInfo {
            pkt_num: self.pkt_num,
            size: self.size,
            ack_eliciting: self.ack_eliciting,
            time_sent: self.time_sent,
        }
    }
}

/// A packet number space.
pub struct PktNumSpace {
    epoch: Epoch,

    largest_rx_pkt_num: Option<u64>,

    /// Time the largest packet number was received.
    largest_rx_pkt_time: Option<Instant>,

    largest_acked: Option<u64>,

    next_pkt_num: u64,

    recv_pkt_num: PktNumWindow,

    /// An ACK frame must be sent.
    pub ack_required: bool,

    /// A probe packet must be sent.
    pub probe_needed: bool,

    /// A new largest packet number was received and not acknowledged yet.
    pub new_largest_pn: bool,

    sent: BTreeMap<u64, SentPacket>,

    discarded: bool,
}

impl PktNumSpace {
    pub fn new(epoch: Epoch) -> PktNumSpace {
        PktNumSpace {
            epoch,
            largest_rx_pkt_num: None,
            largest_rx_pkt_time: None,
            largest_acked: None,
            next_pkt_num: 0,
            recv_pkt_num: PktNumWindow::default(),
            ack_required: false,
            probe_needed: false,
            new_largest_pn: false,
            sent: BTreeMap::new(),
            discarded: false,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn largest_rx_pkt_num(&self) -> Option<u64> {
        self.largest_rx_pkt_num
    }

    pub fn largest_rx_pkt_time(&self) -> Option<Instant> {
        self.largest_rx_pkt_time
    }

    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    /// The packet number the next sent packet will use.
    pub fn next_pkt_num(&self) -> u64 {
        self.next_pkt_num
    }

    /// Allocates the packet number of a packet about to be sent.
    pub fn alloc_pkt_num(&mut self) -> Result<u64> {
        if self.discarded {
            return Err(Error::InvalidState);
        }

        if self.next_pkt_num > packet::MAX_PKT_NUM {
            return Err(Error::InvalidState);
        }

        let pn = self.next_pkt_num;
        self.next_pkt_num += 1;

        Ok(pn)
    }

    /// Whether a packet number was already received, or is too old to tell.
    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.recv_pkt_num.contains(pn)
    }

    /// Records a received packet.
    ///
    /// `ack_now` is set when the packet must be acknowledged without waiting
    /// for the ACK delay.
    pub fn on_packet_received(&mut self, pn: u64, ack_now: bool, now: Instant) {
        self.recv_pkt_num.insert(pn);

        if self.largest_rx_pkt_num.map_or(true, |l| pn > l) {
            self.largest_rx_pkt_num = Some(pn);
            self.largest_rx_pkt_time = Some(now);
            self.new_largest_pn = true;
        }

        if ack_now {
            self.ack_required = true;
        }
    }

    /// Called once an ACK frame for this space was sent.
    pub fn on_ack_sent(&mut self) {
        self.ack_required = false;
        self.new_largest_pn = false;
    }

    pub fn on_packet_sent(&mut self, pkt: SentPacket) {
        if pkt.ack_eliciting {
            self.probe_needed = false;
        }

        self.sent.insert(pkt.pkt_num, pkt);
    }

    /// Removes an acknowledged packet, returning it if it was in flight.
    pub fn on_packet_acked(&mut self, pn: u64) -> Option<SentPacket> {
        let pkt = self.sent.remove(&pn)?;

        if self.largest_acked.map_or(true, |l| pn > l) {
            self.largest_acked = Some(pn);
        }

        Some(pkt)
    }

    /// Removes a lost packet, returning it if it was in flight.
    pub fn on_packet_lost(&mut self, pn: u64) -> Option<SentPacket> {
        self.sent.remove(&pn)
    }

    pub fn sent_packet(&self, pn: u64) -> Option<&SentPacket> {
        self.sent.get(&pn)
    }

    pub fn sent_packets(&self) -> impl Iterator<Item = &SentPacket> + '_ {
        self.sent.values()
    }

    /// Stops counting packets sent on a removed path as in flight.
    pub fn forget_path(&mut self, path_id: usize) {
        for pkt in self.sent.values_mut().filter(|p| p.path_id == path_id) {
            pkt.in_flight = false;
        }
    }

    /// Sum of the sizes of unacknowledged packets counted in flight.
    pub fn bytes_in_flight(&self) -> usize {
        self.sent
            .values()
            .filter(|p| p.in_flight)
            .map(|p| p.size)
            .sum()
    }

    /// Discards the space.
    ///
    /// Returns the packets that were still tracked, or `None` if the space
    /// was already discarded.
    pub fn discard(&mut self) -> Option<Vec<SentPacket>> {
        if self.discarded {
            return None;
        }

        self.discarded = true;

        self.ack_required = false;
        self.probe_needed = false;
        self.new_largest_pn = false;

        let sent = std::mem::take(&mut self.sent);

        Some(sent.into_values().collect())
    }
}

impl std::fmt::Debug for PktNumSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?} largest_rx={:?} largest_acked={:?} next={} sent={} \
             ack_required={} probe_needed={} discarded={}",
            self.epoch,
            self.largest_rx_pkt_num,
            self.largest_acked,
            self.next_pkt_num,
            self.sent.len(),
            self.ack_required,
            self.probe_needed,
            self.discarded,
        )
    }
}
