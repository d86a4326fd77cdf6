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

//! Packet protection keys of one encryption level, and their rotation.

use std::time::Instant;

use crate::Error;
use crate::Result;

use crate::crypto::KeyPhase;
use crate::crypto::PacketKey;

/// Receive keys of the previous key phase, kept for a while after a phase
/// flip to decrypt reordered packets.
pub struct PrevKey {
    pub key: Box<dyn PacketKey>,

    /// Packet number of the first packet received in the current phase.
    /// Packets below it still use the previous keys.
    ///
    /// `None` until the peer sends a packet in the current phase, which
    /// happens when the flip was initiated locally.
    pub end_pn: Option<u64>,

    /// When the previous keys are discarded. Armed once the peer answered
    /// the flip.
    pub discard_at: Option<Instant>,
}

/// Which receive key should decrypt a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySlot {
    Current,
    Previous,
    Next,
}

/// Keys of one encryption level.
///
/// Besides the current keys, the tracker has three slots used by 1-RTT key
/// updates: previous-rx, next-rx and next-tx. A flip promotes next to
/// current and current to previous; previous is dropped once its grace
/// period is over. Levels that never rotate keep the extra slots empty.
pub struct KeyPhaseTracker {
    phase: KeyPhase,

    rx: Option<Box<dyn PacketKey>>,

    tx: Option<Box<dyn PacketKey>>,

    prv_rx: Option<PrevKey>,

    nxt_rx: Option<Box<dyn PacketKey>>,

    nxt_tx: Option<Box<dyn PacketKey>>,

    /// A locally initiated flip was not answered by the peer yet.
    awaiting_peer: bool,

    rotates: bool,
}

impl KeyPhaseTracker {
    pub fn new(
        rx: Option<Box<dyn PacketKey>>, tx: Option<Box<dyn PacketKey>>,
        rotates: bool,
    ) -> KeyPhaseTracker {
        KeyPhaseTracker {
            phase: KeyPhase::default(),
            rx,
            tx,
            prv_rx: None,
            nxt_rx: None,
            nxt_tx: None,
            awaiting_peer: false,
            rotates,
        }
    }

    pub fn phase(&self) -> KeyPhase {
        self.phase
    }

    pub fn rx(&self) -> Option<&dyn PacketKey> {
        self.rx.as_deref()
    }

    pub fn tx(&self) -> Option<&dyn PacketKey> {
        self.tx.as_deref()
    }

    pub fn set_rx(&mut self, key: Box<dyn PacketKey>) {
        self.rx = Some(key);
    }

    pub fn set_tx(&mut self, key: Box<dyn PacketKey>) {
        self.tx = Some(key);
    }

    pub fn prev(&self) -> Option<&PrevKey> {
        self.prv_rx.as_ref()
    }

    /// Fills the empty next-phase slots.
    pub fn install_next(
        &mut self, rx: Option<Box<dyn PacketKey>>, tx: Option<Box<dyn PacketKey>>,
    ) -> Result<()> {
        if !self.rotates {
            return Err(Error::InvalidState);
        }

        if self.nxt_rx.is_none() {
            self.nxt_rx = rx;
        }

        if self.nxt_tx.is_none() {
            self.nxt_tx = tx;
        }

        Ok(())
    }

    /// Whether both next-phase keys are available.
    pub fn has_next(&self) -> bool {
        self.nxt_rx.is_some() && self.nxt_tx.is_some()
    }

    /// Chooses the receive key for a packet with the given key phase bit
    /// and packet number.
    pub fn select(&self, key_phase: bool, pn: u64) -> KeySlot {
        if !self.rotates || key_phase == self.phase.bit() {
            return KeySlot::Current;
        }

        match self.prv_rx {
            Some(ref prev) if prev.end_pn.map_or(true, |end| pn < end) =>
                KeySlot::Previous,

            _ => KeySlot::Next,
        }
    }

    pub fn rx_key(&self, slot: KeySlot) -> Option<&dyn PacketKey> {
        match slot {
            KeySlot::Current => self.rx.as_deref(),

            KeySlot::Previous => self.prv_rx.as_ref().map(|p| p.key.as_ref()),

            KeySlot::Next => self.nxt_rx.as_deref(),
        }
    }

    /// Records that a packet was received in the current phase.
    ///
    /// The first such packet after a locally initiated flip confirms it: it
    /// sets the boundary below which previous keys are used, and the
    /// previous keys are discarded at `discard_at`.
    pub fn on_current_phase_packet(&mut self, pn: u64, discard_at: Instant) {
        if !self.awaiting_peer {
            return;
        }

        self.awaiting_peer = false;

        if let Some(ref mut prev) = self.prv_rx {
            prev.end_pn = Some(pn);
            prev.discard_at = Some(discard_at);
        }
    }

    /// Whether a locally initiated flip still waits for the peer.
    pub fn is_awaiting_peer(&self) -> bool {
        self.awaiting_peer
    }

    /// Flips the key phase.
    ///
    /// `boundary` is the packet number of the first packet received in the
    /// new phase, if the peer initiated the flip. The previous keys of a
    /// locally initiated flip are kept until the peer answers, whatever
    /// `discard_at` says.
    pub fn commit_flip(
        &mut self, boundary: Option<u64>, discard_at: Option<Instant>,
    ) -> Result<KeyPhase> {
        if !self.rotates {
            return Err(Error::InvalidState);
        }

        // A flip is only allowed once the previous one is confirmed.
        if self.awaiting_peer {
            return Err(Error::KeyUpdate);
        }

        if !self.has_next() || self.rx.is_none() || self.tx.is_none() {
            return Err(Error::KeysUnavailable);
        }

        let (nxt_rx, nxt_tx) = match (self.nxt_rx.take(), self.nxt_tx.take()) {
            (Some(rx), Some(tx)) => (rx, tx),

            _ => return Err(Error::KeysUnavailable),
        };

        let old_rx = std::mem::replace(&mut self.rx, Some(nxt_rx));
        self.tx = Some(nxt_tx);

        self.prv_rx = old_rx.map(|key| PrevKey {
            key,
            end_pn: boundary,
            discard_at: boundary.and(discard_at),
        });

        self.awaiting_peer = boundary.is_none();
        self.phase = self.phase.next();

        Ok(self.phase)
    }

    /// Drops the previous receive key if its grace period is over.
    pub fn discard_prev_if_expired(&mut self, now: Instant) -> bool {
        let expired = self
            .prv_rx
            .as_ref()
            .and_then(|p| p.discard_at)
            .is_some_and(|t| t <= now);

        if expired {
            self.prv_rx = None;
        }

        expired
    }

    pub fn prev_discard_deadline(&self) -> Option<Instant> {
        self.prv_rx.as_ref().and_then(|p| p.discard_at)
    }

    /// Drops every key.
    pub fn clear(&mut self) {
        self.rx = None;
        self.tx = None;
        self.prv_rx = None;
        self.nxt_rx = None;
        self.nxt_tx = None;
        self.awaiting_peer = false;
    }
}
