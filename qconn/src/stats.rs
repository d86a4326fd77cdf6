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

//! Connection counters, readable from any thread.

use crossbeam::atomic::AtomicCell;

use crate::closing::CloseState;

/// Monotonic counters of a connection.
///
/// The owning thread writes, any thread may read a [`Stats`] snapshot.
#[derive(Debug, Default)]
pub struct Counters {
    dropped_pkt: AtomicCell<u64>,
    dropped_pkt_bufoverrun: AtomicCell<u64>,
    dropped_parsing: AtomicCell<u64>,
    socket_full: AtomicCell<u64>,
    sendto_err: AtomicCell<u64>,
    sendto_err_unknown: AtomicCell<u64>,
    sent_pkt: AtomicCell<u64>,
    lost_pkt: AtomicCell<u64>,
    conn_migration_done: AtomicCell<u64>,
    data_blocked: AtomicCell<u64>,
    stream_data_blocked: AtomicCell<u64>,
    streams_blocked_bidi: AtomicCell<u64>,
    streams_blocked_uni: AtomicCell<u64>,
    immediate_close: AtomicCell<u64>,
    closing: AtomicCell<u64>,
    draining: AtomicCell<u64>,
    expired: AtomicCell<u64>,
}

/// Flow control frames reported by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedFrame {
    DataBlocked,
    StreamDataBlocked,
    StreamsBlockedBidi,
    StreamsBlockedUni,
}

/// A copy of the counters of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Packets dropped for any reason other than a parsing error.
    pub dropped_pkt: u64,

    /// Application data dropped because the buffer waiting for the mux was
    /// full.
    pub dropped_pkt_bufoverrun: u64,

    /// Packets dropped because they could not be parsed.
    pub dropped_parsing: u64,

    /// Send attempts that failed because the socket buffer was full.
    pub socket_full: u64,

    /// Other failed send attempts.
    pub sendto_err: u64,

    /// Failed send attempts with an unexpected error.
    pub sendto_err_unknown: u64,

    pub sent_pkt: u64,

    pub lost_pkt: u64,

    /// Connection migrations that completed.
    pub conn_migration_done: u64,

    pub data_blocked: u64,

    pub stream_data_blocked: u64,

    pub streams_blocked_bidi: u64,

    pub streams_blocked_uni: u64,

    /// Transitions to each closing state.
    pub immediate_close: u64,
    pub closing: u64,
    pub draining: u64,

    /// Idle or handshake timer expirations.
    pub expired: u64,
}

fn incr(c: &AtomicCell<u64>) {
    c.fetch_add(1);
}

impl Counters {
    pub fn new() -> Counters {
        Default::default()
    }

    pub(crate) fn on_dropped(&self) {
        incr(&self.dropped_pkt);
    }

    pub(crate) fn on_dropped_parsing(&self) {
        incr(&self.dropped_parsing);
    }

    pub(crate) fn on_bufoverrun(&self) {
        incr(&self.dropped_pkt_bufoverrun);
    }

    pub(crate) fn on_sent(&self) {
        incr(&self.sent_pkt);
    }

    pub(crate) fn on_lost(&self) {
        incr(&self.lost_pkt);
    }

    pub(crate) fn on_migration(&self) {
        incr(&self.conn_migration_done);
    }

    pub(crate) fn on_expired(&self) {
        incr(&self.expired);
    }

    pub(crate) fn on_send_error(&self, err: &std::io::Error) {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock => incr(&self.socket_full),

            ErrorKind::ConnectionRefused |
            ErrorKind::ConnectionReset |
            ErrorKind::PermissionDenied |
            ErrorKind::AddrNotAvailable |
            ErrorKind::InvalidInput => incr(&self.sendto_err),

            _ => incr(&self.sendto_err_unknown),
        }
    }

    pub(crate) fn on_blocked_frame(&self, frame: BlockedFrame) {
        match frame {
            BlockedFrame::DataBlocked => incr(&self.data_blocked),

            BlockedFrame::StreamDataBlocked => incr(&self.stream_data_blocked),

            BlockedFrame::StreamsBlockedBidi =>
                incr(&self.streams_blocked_bidi),

            BlockedFrame::StreamsBlockedUni => incr(&self.streams_blocked_uni),
        }
    }

    pub(crate) fn on_close_state(&self, state: CloseState) {
        match state {
            CloseState::Open => (),

            CloseState::ImmediateClose => incr(&self.immediate_close),

            CloseState::Closing => incr(&self.closing),

            CloseState::Draining => incr(&self.draining),
        }
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            dropped_pkt: self.dropped_pkt.load(),
            dropped_pkt_bufoverrun: self.dropped_pkt_bufoverrun.load(),
            dropped_parsing: self.dropped_parsing.load(),
            socket_full: self.socket_full.load(),
            sendto_err: self.sendto_err.load(),
            sendto_err_unknown: self.sendto_err_unknown.load(),
            sent_pkt: self.sent_pkt.load(),
            lost_pkt: self.lost_pkt.load(),
            conn_migration_done: self.conn_migration_done.load(),
            data_blocked: self.data_blocked.load(),
            stream_data_blocked: self.stream_data_blocked.load(),
            streams_blocked_bidi: self.streams_blocked_bidi.load(),
            streams_blocked_uni: self.streams_blocked_uni.load(),
            immediate_close: self.immediate_close.load(),
            closing: self.closing.load(),
            draining: self.draining.load(),
            expired: self.expired.load(),
        }
    }
}
