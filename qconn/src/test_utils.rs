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

use super::*;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use crate::crypto::Algorithm;
use crate::crypto::KeyPhase;
use crate::crypto::KeyProvider;
use crate::crypto::Level;
use crate::crypto::PacketKey;
use crate::crypto::RingKey;

/// Deterministic packet protection key for the given level, key phase and
/// direction.
pub fn key(
    level: Level, phase: KeyPhase, from_client: bool,
) -> Box<dyn PacketKey> {
    let mut secret = [0x40 | level as u8; 32];

    if from_client {
        secret[0] ^= 0xff;
    }

    let mut key = RingKey::from_secret(
        Algorithm::AES128_GCM,
        crate::PROTOCOL_VERSION_V1,
        &secret,
    )
    .unwrap();

    for _ in 0..phase.0 {
        key = key.derive_next().unwrap();
    }

    Box::new(key)
}

/// Key provider standing in for the TLS stack. Initial keys are derived by
/// the connection itself.
pub struct StaticKeys {
    is_server: bool,
}

impl StaticKeys {
    pub fn new(is_server: bool) -> StaticKeys {
        StaticKeys { is_server }
    }
}

impl KeyProvider for StaticKeys {
    fn encryption_key(
        &mut self, level: Level, phase: KeyPhase,
    ) -> Option<Box<dyn PacketKey>> {
        if level == Level::Initial {
            return None;
        }

        Some(key(level, phase, !self.is_server))
    }

    fn decryption_key(
        &mut self, level: Level, phase: KeyPhase,
    ) -> Option<Box<dyn PacketKey>> {
        if level == Level::Initial {
            return None;
        }

        Some(key(level, phase, self.is_server))
    }
}

pub const PING: u8 = 0x01;
pub const CRYPTO: u8 = 0x06;
pub const DATA: u8 = 0x08;
pub const HANDSHAKE_DONE: u8 = 0x1e;

pub fn ping() -> Vec<u8> {
    vec![PING]
}

pub fn crypto_frame(off: u64, data: &[u8]) -> Vec<u8> {
    let mut out = vec![0; 32 + data.len()];
    let mut b = octets::OctetsMut::with_slice(&mut out);

    b.put_u8(CRYPTO).unwrap();
    b.put_varint(off).unwrap();
    b.put_varint(data.len() as u64).unwrap();
    b.put_bytes(data).unwrap();

    let len = b.off();
    out.truncate(len);
    out
}

/// A simplified stream frame: type, length and data.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0; 16 + data.len()];
    let mut b = octets::OctetsMut::with_slice(&mut out);

    b.put_u8(DATA).unwrap();
    b.put_varint(data.len() as u64).unwrap();
    b.put_bytes(data).unwrap();

    let len = b.off();
    out.truncate(len);
    out
}

pub fn close_frame(err: &ConnectionError, level: Level) -> Vec<u8> {
    let mut out = vec![0; 64 + err.reason.len()];
    let mut b = octets::OctetsMut::with_slice(&mut out);

    let len = closing::encode_close_frame(err, level, &mut b).unwrap();
    out.truncate(len);
    out
}

/// Minimal frame layer used to drive connections in tests.
pub fn handle_frames(
    conn: &mut Connection, pkt: &RxPacket, payload: &[u8],
) -> Result<RecvFrames> {
    let mut b = octets::Octets::with_slice(payload);
    let mut frames = RecvFrames::default();

    while b.cap() > 0 {
        match b.peek_u8()? {
            0x00 => {
                b.get_u8()?;
            },

            PING => {
                b.get_u8()?;
                frames.ack_eliciting = true;
            },

            CRYPTO => {
                b.get_u8()?;
                let off = b.get_varint()?;
                let data = b.get_bytes_with_varint_length()?;

                conn.crypto_recv(pkt.level, off, data.buf())?;
                frames.ack_eliciting = true;
            },

            DATA => {
                b.get_u8()?;
                let data = b.get_bytes_with_varint_length()?;

                conn.deliver(data.buf());
                frames.ack_eliciting = true;
            },

            0x1c | 0x1d => {
                let err = closing::decode_close_frame(&mut b)?;
                conn.on_peer_close(err, pkt.recv_time);
            },

            HANDSHAKE_DONE => {
                b.get_u8()?;
                conn.on_handshake_done_received(pkt.recv_time)?;
                frames.ack_eliciting = true;
            },

            _ => return Err(Error::ProtocolViolation),
        }
    }

    Ok(frames)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MuxEvent {
    Deliver(Vec<u8>),
    Released,
}

/// Mux recording what it is given.
#[derive(Clone, Default)]
pub struct RecordingMux {
    pub events: Arc<Mutex<Vec<MuxEvent>>>,
}

impl Mux for RecordingMux {
    fn deliver(&mut self, data: &[u8]) {
        self.events.lock().push(MuxEvent::Deliver(data.to_vec()));
    }

    fn released(&mut self) {
        self.events.lock().push(MuxEvent::Released);
    }
}

pub fn config() -> Config {
    Config::new(crate::PROTOCOL_VERSION_V1).unwrap()
}

pub fn client_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:443".parse().unwrap()
}

pub fn odcid() -> ConnectionId {
    ConnectionId::from_slice(&[0xba; 16])
}

/// Builds and sends a single packet datagram.
pub fn send(
    conn: &mut Connection, level: Level, payload: &[u8], frames: SentFrames,
    now: Instant,
) -> Result<Vec<u8>> {
    let mut out = vec![0; 1500];

    let len = conn.send_pkt(level, payload, frames, &mut out, now)?;
    conn.on_dgram_sent(now);

    out.truncate(len);
    Ok(out)
}

pub fn recv(
    conn: &mut Connection, dgram: &mut [u8], from: SocketAddr, to: SocketAddr,
    now: Instant,
) -> Result<usize> {
    conn.recv(dgram, RecvInfo { from, to }, now, handle_frames)
}

pub fn ack_eliciting() -> SentFrames {
    SentFrames {
        ack_eliciting: true,
        ..Default::default()
    }
}

/// A client and a server connection talking to each other.
pub struct Pipe {
    pub client: Connection,
    pub server: Connection,
    pub now: Instant,
}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        Pipe::with_config(&config())
    }

    pub fn with_config(config: &Config) -> Result<Pipe> {
        let _ = env_logger::builder().is_test(true).try_init();

        let now = Instant::now();

        let client = connect(
            0x1111,
            &odcid(),
            client_addr(),
            server_addr(),
            config,
            Box::new(StaticKeys::new(false)),
            now,
        )?;

        let server = accept(
            0x2222,
            &odcid(),
            server_addr(),
            client_addr(),
            config,
            Box::new(StaticKeys::new(true)),
            now,
        )?;

        Ok(Pipe {
            client,
            server,
            now,
        })
    }

    pub fn advance(&mut self, d: Duration) {
        self.now += d;
    }

    /// Sends a client packet and feeds it to the server.
    pub fn client_to_server(
        &mut self, level: Level, payload: &[u8], frames: SentFrames,
    ) -> Result<usize> {
        let mut dgram = send(&mut self.client, level, payload, frames, self.now)?;

        recv(
            &mut self.server,
            &mut dgram,
            client_addr(),
            server_addr(),
            self.now,
        )
    }

    /// Sends a server packet and feeds it to the client.
    pub fn server_to_client(
        &mut self, level: Level, payload: &[u8], frames: SentFrames,
    ) -> Result<usize> {
        let mut dgram = send(&mut self.server, level, payload, frames, self.now)?;

        recv(
            &mut self.client,
            &mut dgram,
            server_addr(),
            client_addr(),
            self.now,
        )
    }

    /// Runs the packet exchange of a handshake, up to HANDSHAKE_DONE.
    pub fn handshake(&mut self) -> Result<()> {
        self.client_to_server(Level::Initial, &ping(), ack_eliciting())?;

        self.server.on_keys_available(Level::Handshake)?;
        self.server.on_keys_available(Level::OneRTT)?;

        self.server_to_client(Level::Initial, &ping(), ack_eliciting())?;

        self.client.on_keys_available(Level::Handshake)?;
        self.client.on_keys_available(Level::OneRTT)?;

        self.server_to_client(Level::Handshake, &ping(), ack_eliciting())?;
        self.client_to_server(Level::Handshake, &ping(), ack_eliciting())?;

        self.client.on_handshake_completed(self.now)?;
        self.server.on_handshake_completed(self.now)?;

        let frames = SentFrames {
            ack_eliciting: true,
            handshake_done: true,
            ..Default::default()
        };

        self.server_to_client(Level::OneRTT, &[HANDSHAKE_DONE], frames)?;

        Ok(())
    }
}
