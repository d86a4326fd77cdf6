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

use crate::crypto::Level;
use crate::crypto::PacketKey;
use crate::crypto_stream::CryptoStream;
use crate::key_update::KeyPhaseTracker;

/// An encryption level: its keys and, for levels carrying handshake data,
/// its crypto stream.
///
/// The packet number space used by the level is owned by the connection,
/// see [`Level::epoch()`].
pub struct EncLevel {
    level: Level,

    pub keys: KeyPhaseTracker,

    pub crypto: Option<CryptoStream>,
}

impl EncLevel {
    pub fn new(
        level: Level, rx: Option<Box<dyn PacketKey>>,
        tx: Option<Box<dyn PacketKey>>, crypto_rx_max: u64,
        crypto_tx_max: u64,
    ) -> EncLevel {
        // 0-RTT packets never carry CRYPTO frames.
        let crypto = if level == Level::ZeroRTT {
            None
        } else {
            Some(CryptoStream::new(crypto_rx_max, crypto_tx_max))
        };

        EncLevel {
            level,
            keys: KeyPhaseTracker::new(rx, tx, level.rotates_keys()),
            crypto,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn can_decrypt(&self) -> bool {
        self.keys.rx().is_some()
    }

    pub fn can_encrypt(&self) -> bool {
        self.keys.tx().is_some()
    }
}

impl std::fmt::Debug for EncLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?} rx={} tx={} phase={:?}",
            self.level,
            self.can_decrypt(),
            self.can_encrypt(),
            self.keys.phase(),
        )
    }
}
