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

//! Connection closing: state, CONNECTION_CLOSE frames and the lightweight
//! connection that outlives a closed [`Connection`].
//!
//! [`Connection`]: crate::Connection

use std::net::SocketAddr;
use std::sync::Arc;

use std::time::Instant;

use crate::ConnectionError;
use crate::Error;
use crate::Result;
use crate::WireErrorCode;

use crate::cid::CidIndex;
use crate::cid::ConnectionId;
use crate::crypto::Level;
use crate::stats::Counters;

const FRAME_CONNECTION_CLOSE: u64 = 0x1c;
const FRAME_APPLICATION_CLOSE: u64 = 0x1d;

/// Closing status of a connection.
///
/// States only move forward, in declaration order. `Draining` may be entered
/// from any other state, `Closing` only from `ImmediateClose`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CloseState {
    Open,

    /// A local error was detected, a CONNECTION_CLOSE must be sent.
    ImmediateClose,

    /// The CONNECTION_CLOSE was sent. Further peer packets are answered by
    /// retransmitting it, within a budget.
    Closing,

    /// The peer closed the connection. Nothing is ever sent again.
    Draining,
}

impl CloseState {
    /// Moves to `to` if the transition is legal.
    pub fn advance(&mut self, to: CloseState) -> Result<()> {
        let legal = match (*self, to) {
            (CloseState::Open, CloseState::ImmediateClose) => true,

            (CloseState::ImmediateClose, CloseState::Closing) => true,

            (from, CloseState::Draining) => from != CloseState::Draining,

            _ => false,
        };

        if !legal {
            return Err(Error::InvalidState);
        }

        *self = to;

        Ok(())
    }

    pub fn is_open(self) -> bool {
        self == CloseState::Open
    }
}

/// Retransmission budget of the CONNECTION_CLOSE datagram.
///
/// The first retransmission happens after one peer packet, the next one
/// after two more, and so on, up to `max` retransmissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseRetransmit {
    /// Peer packets to receive before the next retransmission.
    nb_pkt_for_cc: u32,

    /// Peer packets received since the last transmission.
    nb_pkt_since_cc: u32,

    scheduled: u32,

    max: u32,

    pending: bool,
}

impl CloseRetransmit {
    pub fn new(max: u32) -> CloseRetransmit {
        CloseRetransmit {
            nb_pkt_for_cc: 1,
            nb_pkt_since_cc: 0,
            scheduled: 0,
            max,
            pending: false,
        }
    }

    /// Records a peer packet, returning true if a retransmission is due.
    pub fn on_packet_received(&mut self) -> bool {
        if self.scheduled >= self.max {
            return false;
        }

        self.nb_pkt_since_cc += 1;

        if self.nb_pkt_since_cc < self.nb_pkt_for_cc {
            return false;
        }

        self.nb_pkt_for_cc += 1;
        self.nb_pkt_since_cc = 0;
        self.scheduled += 1;
        self.pending = true;

        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Clears and returns the pending retransmission flag.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    /// Number of retransmissions scheduled so far.
    pub fn scheduled(&self) -> u32 {
        self.scheduled
    }
}

/// Writes a CONNECTION_CLOSE frame for `err` in a packet of `level`.
///
/// Application closes cannot be sent in Initial and Handshake packets, they
/// become transport closes with the APPLICATION_ERROR code and no reason.
pub fn encode_close_frame(
    err: &ConnectionError, level: Level, b: &mut octets::OctetsMut,
) -> Result<usize> {
    let before = b.cap();

    let hides_app = matches!(level, Level::Initial | Level::Handshake);

    if err.is_app && !hides_app {
        b.put_varint(FRAME_APPLICATION_CLOSE)?;
        b.put_varint(err.error_code)?;
        b.put_varint(err.reason.len() as u64)?;
        b.put_bytes(&err.reason)?;
    } else if err.is_app {
        b.put_varint(FRAME_CONNECTION_CLOSE)?;
        b.put_varint(WireErrorCode::ApplicationError as u64)?;
        b.put_varint(0)?;
        b.put_varint(0)?;
    } else {
        b.put_varint(FRAME_CONNECTION_CLOSE)?;
        b.put_varint(err.error_code)?;
        // Frame type.
        b.put_varint(0)?;
        b.put_varint(err.reason.len() as u64)?;
        b.put_bytes(&err.reason)?;
    }

    Ok(before - b.cap())
}

/// Parses a CONNECTION_CLOSE frame, including its type.
pub fn decode_close_frame(b: &mut octets::Octets) -> Result<ConnectionError> {
    let ty = b.get_varint()?;

    let is_app = match ty {
        FRAME_CONNECTION_CLOSE => false,

        FRAME_APPLICATION_CLOSE => true,

        _ => return Err(Error::InvalidPacket),
    };

    let error_code = b.get_varint()?;

    if !is_app {
        let _frame_type = b.get_varint()?;
    }

    let reason = b.get_bytes_with_varint_length()?.to_vec();

    Ok(ConnectionError {
        is_app,
        error_code,
        reason,
    })
}

/// What is left of a connection in the closing or draining state.
///
/// Only the data needed to answer the peer with the cached CONNECTION_CLOSE
/// datagram and to route its packets is kept.
pub struct ClosingConnection {
    pub(crate) trace_id: String,

    pub(crate) local_addr: SocketAddr,

    pub(crate) peer_addr: SocketAddr,

    pub(crate) cids: Vec<ConnectionId>,

    /// Cached CONNECTION_CLOSE datagram, empty when draining.
    pub(crate) close_dgram: Vec<u8>,

    pub(crate) retransmit: CloseRetransmit,

    pub(crate) draining: bool,

    pub(crate) idle_expire: Instant,

    pub(crate) expired: bool,

    pub(crate) rx_bytes: u64,

    pub(crate) tx_bytes: u64,

    /// Anti-amplification factor, `None` once the peer address is validated.
    pub(crate) amplification_factor: Option<u64>,

    pub(crate) counters: Arc<Counters>,
}

impl ClosingConnection {
    /// Processes a datagram from the peer. Its content is ignored.
    pub fn recv(&mut self, len: usize) {
        self.rx_bytes += len as u64;

        if self.draining || self.expired {
            return;
        }

        if self.retransmit.on_packet_received() {
            trace!("{} close retransmission due", self.trace_id);
        }
    }

    /// Writes the CONNECTION_CLOSE datagram if a retransmission is due.
    pub fn send_close(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.draining || self.expired || !self.retransmit.is_pending() {
            return Err(Error::Done);
        }

        let len = self.close_dgram.len();

        if out.len() < len {
            return Err(Error::BufferTooShort);
        }

        if let Some(factor) = self.amplification_factor {
            if self.tx_bytes + len as u64 > self.rx_bytes * factor {
                return Err(Error::Done);
            }
        }

        self.retransmit.take_pending();

        out[..len].copy_from_slice(&self.close_dgram);
        self.tx_bytes += len as u64;

        Ok(len)
    }

    pub fn timeout(&self) -> Option<Instant> {
        if self.expired {
            return None;
        }

        Some(self.idle_expire)
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if !self.expired && self.idle_expire <= now {
            debug!("{} closing connection expired", self.trace_id);

            self.expired = true;
            self.counters.on_expired();
        }
    }

    /// Whether the connection can be freed.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The connection IDs still routed to this connection.
    pub fn cids(&self) -> &[ConnectionId] {
        &self.cids
    }

    pub fn unregister_cids(&self, index: &CidIndex) {
        for cid in &self.cids {
            index.unregister(cid);
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}
