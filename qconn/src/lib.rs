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

//! Per-connection QUIC state for proxy data paths.
//!
//! This crate holds what a QUIC proxy keeps for each connection: encryption
//! levels and their keys, packet number spaces, paths, connection IDs, the
//! closing state machine and the application multiplexer attachment. It does
//! not own sockets, timers or the TLS stack; those are driven by the caller,
//! which feeds datagrams to [`Connection::recv()`], builds packets with
//! [`Connection::send_pkt()`] and fires deadlines from
//! [`Connection::timeout_instant()`].
//!
//! ## Creating connections
//!
//! A server side connection is created when a client Initial packet is
//! received for an unknown destination connection ID:
//!
//! ```no_run
//! # let odcid = qconn::ConnectionId::from_slice(&[0xba; 16]);
//! # let local = "127.0.0.1:443".parse().unwrap();
//! # let peer = "127.0.0.1:4433".parse().unwrap();
//! # fn tls_keys() -> Box<dyn qconn::crypto::KeyProvider> { unimplemented!() }
//! let config = qconn::Config::new(qconn::PROTOCOL_VERSION_V1)?;
//!
//! let conn = qconn::accept(
//!     0x1234,
//!     &odcid,
//!     local,
//!     peer,
//!     &config,
//!     tls_keys(),
//!     std::time::Instant::now(),
//! )?;
//! # Ok::<(), qconn::Error>(())
//! ```
//!
//! ## Handling incoming packets
//!
//! Frames are parsed by the caller, through the handler given to
//! [`Connection::recv()`]. The handler sees each decrypted payload and
//! reports whether it was ack-eliciting:
//!
//! ```no_run
//! # fn handle(
//! #     conn: &mut qconn::Connection, pkt: &qconn::RxPacket, payload: &[u8],
//! # ) -> qconn::Result<qconn::RecvFrames> {
//! #     unimplemented!()
//! # }
//! # let mut conn: qconn::Connection = unimplemented!();
//! # let mut buf = [0; 1500];
//! # let info: qconn::RecvInfo = unimplemented!();
//! match conn.recv(&mut buf, info, std::time::Instant::now(), handle) {
//!     Ok(_) => (),
//!
//!     // The connection must send a CONNECTION_CLOSE.
//!     Err(e) if e.is_transport() => (),
//!
//!     Err(_) => (),
//! }
//! ```
//!
//! ## Closing
//!
//! A local error moves the connection to the immediate close state, the
//! next [`Connection::send_close()`] call builds the CONNECTION_CLOSE
//! datagram and caches it for retransmission. Once closing or draining, the
//! connection can be reduced to a [`ClosingConnection`] with
//! [`Connection::into_closing()`].

#[macro_use]
extern crate log;

use std::cmp;

use std::collections::VecDeque;

use std::net::SocketAddr;

use std::sync::Arc;

use std::time::Duration;
use std::time::Instant;

use crate::affinity::Affinity;
use crate::affinity::ThreadId;
use crate::backref::BackRefs;
use crate::cid::CidIndex;
use crate::cid::ConnectionHandle;
use crate::cid::LocalCids;
use crate::closing::CloseRetransmit;
use crate::crypto::KeyPhase;
use crate::crypto::KeyProvider;
use crate::crypto::Level;
use crate::crypto_stream::CryptoStream;
use crate::key_update::KeySlot;
use crate::level::EncLevel;
use crate::packet::Epoch;
use crate::packet::Header;
use crate::packet::Type;
use crate::path::Path;
use crate::path::PathMap;
use crate::recovery::CongestionControlFactory;
use crate::recovery::RecoveryConfig;
use crate::space::PktNumSpace;
use crate::space::SentPacket;
use crate::stats::BlockedFrame;
use crate::stats::Counters;
use crate::stats::Stats;

/// The default anti-amplification factor.
const DEFAULT_AMPLIFICATION_FACTOR: u64 = 3;

/// The default maximum number of CONNECTION_CLOSE retransmissions.
const DEFAULT_MAX_CLOSE_RETRANSMITS: u32 = 8;

/// The default number of lost frames tolerated per packet.
const DEFAULT_MAX_FRAME_LOSS: usize = 10;

/// The default limit of unacknowledged crypto bytes.
const DEFAULT_CRYPTO_IN_FLIGHT_MAX: u64 = 4096;

/// The default number of half-open connections above which a Retry is
/// required.
const DEFAULT_RETRY_THRESHOLD: usize = 100;

const DEFAULT_MAX_IDLE_TIMEOUT: u64 = 30000;

const DEFAULT_MAX_ACK_DELAY: u64 = 25;

const DEFAULT_MAX_CWND: usize = 480 * 1024;

// The number of datagrams the initial congestion window allows.
const INITIAL_WINDOW_PACKETS: usize = 10;

// The default active_connection_id_limit transport parameter.
const DEFAULT_ACTIVE_CID_LIMIT: usize = 2;

// Crypto data buffered ahead of the read offset.
const MAX_CRYPTO_RX_BUFFERED: u64 = 1 << 16;

// Application data buffered until a multiplexer is attached.
const MAX_MUX_BUFFERED: usize = 1 << 16;

// Ack-eliciting Application packets received before an ACK is sent without
// waiting for the ACK delay.
const MAX_RX_AEPKTS_SINCE_ACK: usize = 2;

// Size of the Length field of long header packets.
const PAYLOAD_LENGTH_LEN: usize = 2;

/// Stores configuration shared between multiple connections.
#[derive(Clone)]
pub struct Config {
    version: u32,

    max_idle_timeout: u64,

    handshake_timeout: u64,

    max_ack_delay: u64,

    amplification_factor: u64,

    max_close_retransmits: u32,

    max_frame_loss: usize,

    crypto_in_flight_max: u64,

    initial_mtu: Option<usize>,

    min_cwnd: Option<usize>,

    max_cwnd: usize,

    retry_threshold: usize,

    cc_factory: CongestionControlFactory,
}

impl Config {
    /// Creates a config object with the given version.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let config = qconn::Config::new(qconn::PROTOCOL_VERSION_V1)?;
    /// # Ok::<(), qconn::Error>(())
    /// ```
    pub fn new(version: u32) -> Result<Config> {
        if !version_is_supported(version) {
            return Err(Error::UnknownVersion);
        }

        Ok(Config {
            version,
            max_idle_timeout: DEFAULT_MAX_IDLE_TIMEOUT,
            handshake_timeout: 0,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            amplification_factor: DEFAULT_AMPLIFICATION_FACTOR,
            max_close_retransmits: DEFAULT_MAX_CLOSE_RETRANSMITS,
            max_frame_loss: DEFAULT_MAX_FRAME_LOSS,
            crypto_in_flight_max: DEFAULT_CRYPTO_IN_FLIGHT_MAX,
            initial_mtu: None,
            min_cwnd: None,
            max_cwnd: DEFAULT_MAX_CWND,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            cc_factory: recovery::new_reno,
        })
    }

    /// Sets the idle timeout, in milliseconds.
    ///
    /// The default value is 30000. 0 disables the timer.
    pub fn set_max_idle_timeout(&mut self, v: u64) {
        self.max_idle_timeout = v;
    }

    /// Sets the deadline for the handshake to complete, in milliseconds.
    ///
    /// The default value is 0, meaning no deadline.
    pub fn set_handshake_timeout(&mut self, v: u64) {
        self.handshake_timeout = v;
    }

    /// Sets the maximum delay before acknowledging ack-eliciting packets, in
    /// milliseconds.
    ///
    /// The default value is 25.
    pub fn set_max_ack_delay(&mut self, v: u64) {
        self.max_ack_delay = v;
    }

    /// Sets how many bytes a server may send per byte received before the
    /// client address is validated.
    ///
    /// The default value is 3.
    pub fn set_amplification_factor(&mut self, v: u64) {
        self.amplification_factor = v;
    }

    /// Sets the maximum number of CONNECTION_CLOSE retransmissions.
    ///
    /// The default value is 8.
    pub fn set_max_close_retransmits(&mut self, v: u32) {
        self.max_close_retransmits = v;
    }

    /// Sets the number of frames a packet may lose before the connection
    /// is closed.
    ///
    /// The default value is 10.
    pub fn set_max_frame_loss(&mut self, v: usize) {
        self.max_frame_loss = v;
    }

    /// Sets the maximum number of unacknowledged crypto bytes.
    ///
    /// The default value is 4096.
    pub fn set_crypto_in_flight_max(&mut self, v: u64) {
        self.crypto_in_flight_max = v;
    }

    /// Sets the MTU of new paths.
    ///
    /// By default 1252 bytes are used for IPv4 and 1232 for IPv6.
    pub fn set_initial_mtu(&mut self, v: usize) {
        self.initial_mtu = Some(v);
    }

    /// Sets the congestion window bounds, in bytes.
    ///
    /// By default the minimum is 2 datagrams and the maximum 480KiB.
    pub fn set_cwnd_bounds(&mut self, min: usize, max: usize) -> Result<()> {
        if min == 0 || min > max {
            return Err(Error::InvalidState);
        }

        self.min_cwnd = Some(min);
        self.max_cwnd = max;

        Ok(())
    }

    /// Sets the number of half-open connections at which new connections
    /// must go through a Retry.
    ///
    /// The default value is 100.
    pub fn set_retry_threshold(&mut self, v: usize) {
        self.retry_threshold = v;
    }

    /// Sets the congestion controller used by new paths.
    pub fn set_cc_factory(&mut self, f: CongestionControlFactory) {
        self.cc_factory = f;
    }

    fn idle_timeout(&self) -> Option<Duration> {
        if self.max_idle_timeout == 0 {
            return None;
        }

        Some(Duration::from_millis(self.max_idle_timeout))
    }

    fn handshake_timeout(&self) -> Option<Duration> {
        if self.handshake_timeout == 0 {
            return None;
        }

        Some(Duration::from_millis(self.handshake_timeout))
    }

    fn recovery_config(&self) -> RecoveryConfig {
        let mtu = self.initial_mtu.unwrap_or(path::INITIAL_IPV4_MTU);

        let min_cwnd = self.min_cwnd.unwrap_or(2 * mtu).min(self.max_cwnd);

        RecoveryConfig {
            max_datagram_size: mtu,
            initial_cwnd: INITIAL_WINDOW_PACKETS * mtu,
            min_cwnd,
            max_cwnd: self.max_cwnd,
            max_ack_delay: Duration::from_millis(self.max_ack_delay),
        }
    }
}

/// Returns true if a new connection must be asked to go through a Retry,
/// given the number of half-open connections of the endpoint.
pub fn retry_required(config: &Config, half_open: usize) -> bool {
    half_open >= config.retry_threshold
}

/// Attachment state of the application multiplexer.
///
/// States only move forward, in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MuxState {
    /// Not attached yet. Application data is buffered.
    Null,

    /// Attached. Application data is delivered as it arrives.
    Ready,

    /// Detached. Application data is discarded.
    Released,
}

/// The application multiplexer sitting on top of a connection.
pub trait Mux: Send {
    /// Delivers application data received from the peer.
    fn deliver(&mut self, data: &[u8]);

    /// Called once the connection detached the multiplexer.
    fn released(&mut self);
}

/// Ancillary information about incoming datagrams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvInfo {
    /// The remote address the datagram was received from.
    pub from: SocketAddr,

    /// The local address the datagram was received on.
    pub to: SocketAddr,
}

/// A decrypted packet handed to the frame handler.
#[derive(Clone, Copy, Debug)]
pub struct RxPacket {
    pub level: Level,

    pub pkt_num: u64,

    /// Key phase the packet was decrypted with.
    pub key_phase: KeyPhase,

    pub recv_time: Instant,
}

/// What the frame handler found in a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvFrames {
    pub ack_eliciting: bool,
}

/// What a packet given to [`Connection::send_pkt()`] carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SentFrames {
    pub ack_eliciting: bool,

    /// The packet carries an ACK frame.
    pub ack: bool,

    /// Range of crypto stream data carried, as returned by
    /// [`Connection::crypto_emit()`].
    pub crypto: Option<(u64, usize)>,

    pub handshake_done: bool,
}

/// Independent event flags of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// The anti-amplification limit blocked a transmission.
    pub amplification_reached: bool,

    /// The peer address is validated. Never unset.
    pub peer_validated_addr: bool,

    /// Spin bit of the last packet with a new largest packet number.
    pub spin_bit: bool,

    /// A HANDSHAKE_DONE frame must be sent.
    pub handshake_done_pending: bool,

    /// The idle timer was restarted by a received packet and must be
    /// restarted again by the next ack-eliciting packet sent.
    pub idle_timer_restarted_after_read: bool,

    pub ack_timer_fired: bool,

    /// The active path changed, the connection must be moved to another
    /// thread with [`Connection::rebind()`].
    pub affinity_changed: bool,

    /// The idle or handshake timer expired.
    pub exp_timer: bool,
}

/// Byte counters of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteCounts {
    /// Bytes of packets built but not sent yet.
    pub prep: u64,

    pub tx: u64,

    pub rx: u64,
}

/// A QUIC connection.
pub struct Connection {
    trace_id: String,

    is_server: bool,

    config: Config,

    /// The version used by the client in its first Initial packet.
    original_version: u32,

    /// The version switched to by compatible version negotiation.
    negotiated_version: Option<u32>,

    did_version_negotiation: bool,

    /// Destination connection ID of the first client Initial packet.
    odcid: ConnectionId,

    /// The connection ID used as destination of sent packets.
    dcid: ConnectionId,

    got_peer_cid: bool,

    /// The source connection ID of long header packets.
    scid: ConnectionId,

    scids: LocalCids,

    keys: Box<dyn KeyProvider>,

    levels: [Option<EncLevel>; 4],

    spaces: [PktNumSpace; 3],

    paths: PathMap,

    /// Packets built since the last datagram was handed to the network.
    prepared: Vec<(Epoch, u64)>,

    flags: Flags,

    bytes: ByteCounts,

    mux_state: MuxState,

    mux: Option<Box<dyn Mux>>,

    mux_buf: VecDeque<Vec<u8>>,

    mux_buffered: usize,

    close_state: CloseState,

    close_retransmit: CloseRetransmit,

    close_dgram: Vec<u8>,

    local_error: Option<ConnectionError>,

    peer_error: Option<ConnectionError>,

    idle_timer: Option<Instant>,

    handshake_timer: Option<Instant>,

    ack_timer: Option<Instant>,

    rx_aepkts_since_ack: usize,

    recv_count: usize,

    handshake_completed: bool,

    handshake_confirmed: bool,

    affinity: Affinity,

    counters: Arc<Counters>,

    backrefs: BackRefs,
}

/// Creates a server side connection for the client Initial packet sent to
/// `odcid`.
///
/// `hash64` seeds the local connection IDs. `odcid` must be at least 8 bytes
/// long.
pub fn accept(
    hash64: u64, odcid: &ConnectionId, local: SocketAddr, peer: SocketAddr,
    config: &Config, keys: Box<dyn KeyProvider>, now: Instant,
) -> Result<Connection> {
    Connection::new(hash64, odcid, local, peer, config, keys, true, now)
}

/// Creates a client side connection, `odcid` being the destination
/// connection ID of its first Initial packet.
pub fn connect(
    hash64: u64, odcid: &ConnectionId, local: SocketAddr, peer: SocketAddr,
    config: &Config, keys: Box<dyn KeyProvider>, now: Instant,
) -> Result<Connection> {
    Connection::new(hash64, odcid, local, peer, config, keys, false, now)
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        hash64: u64, odcid: &ConnectionId, local: SocketAddr, peer: SocketAddr,
        config: &Config, keys: Box<dyn KeyProvider>, is_server: bool,
        now: Instant,
    ) -> Result<Connection> {
        if odcid.len() > packet::MAX_CID_LEN as usize {
            return Err(Error::InvalidPacket);
        }

        if is_server && odcid.len() < cid::ODCID_MIN_LEN {
            return Err(Error::InvalidPacket);
        }

        let scids = LocalCids::new(hash64, DEFAULT_ACTIVE_CID_LIMIT);
        let scid = scids.first().cloned().unwrap_or_default();

        let trace_id = format!("{scid:?}");

        let path = Path::new(
            local,
            peer,
            config.initial_mtu,
            &config.recovery_config(),
            config.cc_factory,
            true,
        );

        let (open, seal) = crypto::derive_initial_key_material(
            odcid,
            config.version,
            is_server,
        )?;

        let initial = EncLevel::new(
            Level::Initial,
            Some(Box::new(open)),
            Some(Box::new(seal)),
            MAX_CRYPTO_RX_BUFFERED,
            config.crypto_in_flight_max,
        );

        let dcid = if is_server {
            ConnectionId::default()
        } else {
            odcid.clone()
        };

        let mut conn = Connection {
            trace_id,
            is_server,
            config: config.clone(),
            original_version: config.version,
            negotiated_version: None,
            did_version_negotiation: false,
            odcid: odcid.clone(),
            dcid,
            got_peer_cid: false,
            scid,
            scids,
            keys,
            levels: [Some(initial), None, None, None],
            spaces: [
                PktNumSpace::new(Epoch::Initial),
                PktNumSpace::new(Epoch::Handshake),
                PktNumSpace::new(Epoch::Application),
            ],
            paths: PathMap::new(path),
            prepared: Vec::new(),
            flags: Flags::default(),
            bytes: ByteCounts::default(),
            mux_state: MuxState::Null,
            mux: None,
            mux_buf: VecDeque::new(),
            mux_buffered: 0,
            close_state: CloseState::Open,
            close_retransmit: CloseRetransmit::new(config.max_close_retransmits),
            close_dgram: Vec::new(),
            local_error: None,
            peer_error: None,
            idle_timer: None,
            handshake_timer: config.handshake_timeout().map(|t| now + t),
            ack_timer: None,
            rx_aepkts_since_ack: 0,
            recv_count: 0,
            handshake_completed: false,
            handshake_confirmed: false,
            affinity: Affinity::Owned(0),
            counters: Arc::new(Counters::new()),
            backrefs: BackRefs::new(backref::current_epoch()),
        };

        // A client never limits what it sends.
        conn.flags.peer_validated_addr = !is_server;

        conn.idle_timer = conn.idle_timeout().map(|t| now + t);

        debug!(
            "{} new {} connection version={:x} odcid={:?}",
            conn.trace_id,
            if is_server { "server" } else { "client" },
            conn.original_version,
            conn.odcid,
        );

        Ok(conn)
    }

    /// Processes a datagram received from the peer.
    ///
    /// Coalesced packets are processed in order. Each decrypted payload is
    /// given to `handler`, which parses the frames. Packets that cannot be
    /// processed are dropped and counted, the remaining packets of the
    /// datagram with them.
    ///
    /// A transport error, raised here or by the handler, moves the
    /// connection to the immediate close state and is returned.
    ///
    /// Datagrams received after the connection started closing are only
    /// counted, and schedule CONNECTION_CLOSE retransmissions. Once the
    /// connection expired, [`TimedOut`](Error::TimedOut) is returned.
    pub fn recv<F>(
        &mut self, buf: &mut [u8], info: RecvInfo, now: Instant, mut handler: F,
    ) -> Result<usize>
    where
        F: FnMut(&mut Connection, &RxPacket, &[u8]) -> Result<RecvFrames>,
    {
        let len = buf.len();

        if self.affinity.is_pending() {
            return Err(Error::InvalidState);
        }

        if self.flags.exp_timer {
            return Err(Error::TimedOut);
        }

        self.bytes.rx += len as u64;

        match self.close_state {
            CloseState::Open => (),

            CloseState::ImmediateClose | CloseState::Draining => return Ok(len),

            CloseState::Closing => {
                if self.close_retransmit.on_packet_received() {
                    trace!("{} close retransmission due", self.trace_id);
                }

                return Ok(len);
            },
        }

        // A client only talks to the address it connected to.
        if !self.is_server && info.from != self.paths.active().peer_addr() {
            trace!("{} datagram from unknown peer {}", self.trace_id, info.from);

            self.counters.on_dropped();
            return Err(Error::Done);
        }

        let mut done = 0;
        let mut left = len;

        while left > 0 {
            let read = match self.recv_single(
                &mut buf[len - left..len],
                &info,
                len,
                now,
                &mut handler,
            ) {
                Ok(v) => v,

                Err(Error::Done) => left,

                Err(e) if e.is_transport() => {
                    debug!("{} transport error {:?}", self.trace_id, e);

                    self.set_local_error(e);
                    return Err(e);
                },

                Err(e) => {
                    self.drop_pkt(e);
                    left
                },
            };

            done += read;
            left -= cmp::min(read, left);

            if !self.close_state.is_open() {
                break;
            }
        }

        Ok(done)
    }

    fn recv_single<F>(
        &mut self, buf: &mut [u8], info: &RecvInfo, dgram_len: usize,
        now: Instant, handler: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(&mut Connection, &RxPacket, &[u8]) -> Result<RecvFrames>,
    {
        let mut b = octets::Octets::with_slice(buf);

        let hdr = Header::from_bytes(&mut b, cid::LOCAL_CID_LEN)
            .map_err(|e| self.drop_pkt(e))?;

        if hdr.ty == Type::VersionNegotiation {
            return self.on_version_negotiation(&hdr, now);
        }

        if hdr.ty == Type::Retry {
            trace!("{} ignoring retry packet", self.trace_id);
            return Err(self.drop_pkt(Error::Done));
        }

        if hdr.ty != Type::Short && hdr.version != self.version() {
            trace!(
                "{} packet with version {:x} dropped",
                self.trace_id,
                hdr.version
            );

            return Err(self.drop_pkt(Error::UnknownVersion));
        }

        let level = hdr.ty.to_level()?;
        let epoch = level.epoch();

        if level == Level::ZeroRTT && !self.is_server {
            return Err(self.drop_pkt(Error::Done));
        }

        if self.is_server &&
            level == Level::Initial &&
            dgram_len < packet::INITIAL_PACKET_MINLEN
        {
            trace!("{} initial in short datagram dropped", self.trace_id);
            return Err(self.drop_pkt(Error::Done));
        }

        let payload_len = if hdr.ty == Type::Short {
            b.cap()
        } else {
            b.get_varint().map_err(|e| self.drop_pkt(e.into()))? as usize
        };

        if payload_len > b.cap() {
            return Err(self.drop_pkt(Error::InvalidPacket));
        }

        let pn_off = b.off();
        let pkt_end = pn_off + payload_len;

        if self.spaces[epoch.index()].is_discarded() {
            trace!("{} {:?} space discarded, dropped", self.trace_id, epoch);
            return Err(self.drop_pkt(Error::KeysUnavailable));
        }

        let largest_rx = self.spaces[epoch.index()].largest_rx_pkt_num();

        // Remove header protection and open the payload.
        let (pn, pn_len, slot, key_phase, plain_len) = {
            let enc = match self.levels[level as usize] {
                Some(ref v) => v,

                None => return Err(self.drop_pkt(Error::KeysUnavailable)),
            };

            let hp = enc
                .keys
                .rx()
                .ok_or_else(|| self.drop_pkt(Error::KeysUnavailable))?;

            let pkt = &mut buf[..pkt_end];

            let (truncated, pn_len) = packet::decrypt_hdr(pkt, pn_off, hp)
                .map_err(|e| self.drop_pkt(e))?;

            if payload_len < pn_len + hp.tag_len() {
                return Err(self.drop_pkt(Error::InvalidPacket));
            }

            let pn = packet::decode_pkt_num(
                largest_rx.unwrap_or(0),
                truncated,
                pn_len,
            );

            let phase_bit =
                hdr.ty == Type::Short && pkt[0] & packet::KEY_PHASE_BIT != 0;

            let slot = enc.keys.select(phase_bit, pn);

            let key_phase = match slot {
                KeySlot::Current => enc.keys.phase(),

                KeySlot::Previous =>
                    KeyPhase(enc.keys.phase().0.saturating_sub(1)),

                KeySlot::Next => enc.keys.phase().next(),
            };

            let key = enc
                .keys
                .rx_key(slot)
                .ok_or_else(|| self.drop_pkt(Error::KeysUnavailable))?;

            let (head, body) = pkt.split_at_mut(pn_off + pn_len);

            let plain_len = key
                .open_with_u64_counter(pn, head, body)
                .map_err(|e| self.drop_pkt(e))?;

            (pn, pn_len, slot, key_phase, plain_len)
        };

        if packet::reserved_bits(buf[0]) != 0 {
            return Err(Error::ProtocolViolation);
        }

        if self.spaces[epoch.index()].is_duplicate(pn) {
            trace!("{} duplicate packet pn={}", self.trace_id, pn);
            return Err(self.drop_pkt(Error::Done));
        }

        if plain_len == 0 {
            return Err(Error::ProtocolViolation);
        }

        match slot {
            KeySlot::Current => {
                let discard_at = now + self.pto() * 3;

                if let Some(enc) = self.levels[level as usize].as_mut() {
                    enc.keys.on_current_phase_packet(pn, discard_at);
                }
            },

            KeySlot::Previous => (),

            KeySlot::Next => {
                // A new key phase on a reordered packet is an attack.
                if largest_rx.is_some_and(|l| pn < l) {
                    return Err(Error::KeyUpdate);
                }

                self.flip_key_phase(Some(pn), now)?;
            },
        }

        if hdr.ty != Type::Short && !self.got_peer_cid {
            self.dcid = hdr.scid.clone();
            self.got_peer_cid = true;
        }

        if hdr.ty == Type::Short && largest_rx.map_or(true, |l| pn > l) {
            self.flags.spin_bit = hdr.spin;
        }

        if hdr.ty == Type::Short &&
            self.is_server &&
            self.handshake_confirmed &&
            info.from != self.paths.active().peer_addr()
        {
            self.on_new_peer_addr(info);
        }

        trace!(
            "{} rx pkt {:?} pn={} len={} phase={:?}",
            self.trace_id,
            hdr.ty,
            pn,
            plain_len,
            key_phase
        );

        let rx = RxPacket {
            level,
            pkt_num: pn,
            key_phase,
            recv_time: now,
        };

        let payload_off = pn_off + pn_len;

        let payload = &buf[payload_off..payload_off + plain_len];

        let frames = handler(self, &rx, payload)?;

        self.recv_count += 1;

        if !self.spaces[epoch.index()].is_discarded() {
            let ack_now = if epoch == Epoch::Application && frames.ack_eliciting {
                self.rx_aepkts_since_ack += 1;

                if self.ack_timer.is_none() {
                    let delay = Duration::from_millis(self.config.max_ack_delay);

                    self.ack_timer = Some(now + delay);
                }

                self.rx_aepkts_since_ack >= MAX_RX_AEPKTS_SINCE_ACK
            } else {
                frames.ack_eliciting
            };

            self.spaces[epoch.index()].on_packet_received(pn, ack_now, now);
        }

        // Receiving a Handshake packet proves the client owns its address.
        if self.is_server && level == Level::Handshake {
            self.validate_peer_addr();
            self.discard_space(Epoch::Initial, now);
        }

        if self.close_state.is_open() {
            self.idle_timer = self.idle_timeout().map(|t| now + t);
            self.flags.idle_timer_restarted_after_read = true;
        }

        Ok(pkt_end)
    }

    fn on_version_negotiation(
        &mut self, hdr: &Header, now: Instant,
    ) -> Result<usize> {
        if self.is_server || self.did_version_negotiation || self.recv_count > 0
        {
            return Err(self.drop_pkt(Error::Done));
        }

        let versions = hdr.versions.as_deref().unwrap_or(&[]);

        if versions.contains(&self.version()) {
            return Err(self.drop_pkt(Error::Done));
        }

        let version = match version::supported().find(|v| versions.contains(v)) {
            Some(v) => v,

            None => {
                debug!("{} no common version with the server", self.trace_id);
                return Err(self.drop_pkt(Error::UnknownVersion));
            },
        };

        debug!("{} switching to version {:x}", self.trace_id, version);

        self.did_version_negotiation = true;
        self.original_version = version;
        self.negotiated_version = None;

        // Start over with Initial keys of the new version.
        let (open, seal) =
            crypto::derive_initial_key_material(&self.odcid, version, false)?;

        self.discard_space(Epoch::Initial, now);
        self.spaces[Epoch::Initial.index()] = PktNumSpace::new(Epoch::Initial);

        self.levels[Level::Initial as usize] = Some(EncLevel::new(
            Level::Initial,
            Some(Box::new(open)),
            Some(Box::new(seal)),
            MAX_CRYPTO_RX_BUFFERED,
            self.config.crypto_in_flight_max,
        ));

        Err(Error::Done)
    }

    fn drop_pkt(&self, e: Error) -> Error {
        trace!("{} packet dropped: {:?}", self.trace_id, e);

        match e {
            Error::InvalidPacket | Error::BufferTooShort =>
                self.counters.on_dropped_parsing(),

            _ => self.counters.on_dropped(),
        }

        Error::Done
    }

    /// Builds a packet at the given level.
    ///
    /// The packet is written to `out`, which is capped to the path MTU, and
    /// is recorded as prepared until [`on_dgram_sent()`] is called once the
    /// datagram holding it was sent.
    ///
    /// Only allowed before the connection starts closing. Returns
    /// [`Done`] when the anti-amplification limit forbids sending it, and
    /// [`TimedOut`](Error::TimedOut) once the connection expired.
    ///
    /// [`on_dgram_sent()`]: Connection::on_dgram_sent
    /// [`Done`]: Error::Done
    pub fn send_pkt(
        &mut self, level: Level, payload: &[u8], frames: SentFrames,
        out: &mut [u8], now: Instant,
    ) -> Result<usize> {
        if self.affinity.is_pending() {
            return Err(Error::InvalidState);
        }

        if self.flags.exp_timer {
            return Err(Error::TimedOut);
        }

        if !self.close_state.is_open() {
            return Err(Error::Done);
        }

        let epoch = level.epoch();

        let (pn, written, padded) = self.build_pkt(level, payload, out, now)?;

        let pkt = SentPacket {
            pkt_num: pn,
            size: written,
            ack_eliciting: frames.ack_eliciting,
            in_flight: frames.ack_eliciting || padded,
            path_id: self.paths.active_path_id(),
            time_sent: now,
            crypto: frames.crypto,
            handshake_done: frames.handshake_done,
        };

        self.spaces[epoch.index()].on_packet_sent(pkt);
        self.prepared.push((epoch, pn));

        self.bytes.prep += written as u64;
        self.paths.active_mut().on_packet_prepared(written);

        if frames.ack {
            self.spaces[epoch.index()].on_ack_sent();

            if epoch == Epoch::Application {
                self.ack_timer = None;
                self.rx_aepkts_since_ack = 0;
                self.flags.ack_timer_fired = false;
            }
        }

        if frames.handshake_done {
            self.flags.handshake_done_pending = false;
        }

        if frames.ack_eliciting && self.flags.idle_timer_restarted_after_read {
            self.idle_timer = self.idle_timeout().map(|t| now + t);
            self.flags.idle_timer_restarted_after_read = false;
        }

        // The client stops using Initial packets once it sends a Handshake
        // packet.
        if !self.is_server && level == Level::Handshake {
            self.discard_space(Epoch::Initial, now);
        }

        Ok(written)
    }

    /// Writes a protected packet, returning its packet number, its size
    /// and whether padding was added.
    fn build_pkt(
        &mut self, level: Level, payload: &[u8], out: &mut [u8], now: Instant,
    ) -> Result<(u64, usize, bool)> {
        let epoch = level.epoch();

        if self.spaces[epoch.index()].is_discarded() {
            return Err(Error::InvalidState);
        }

        let (tag_len, key_phase) = match self.levels[level as usize] {
            Some(ref enc) => match enc.keys.tx() {
                Some(tx) => (tx.tag_len(), enc.keys.phase().bit()),

                None => return Err(Error::KeysUnavailable),
            },

            None => return Err(Error::KeysUnavailable),
        };

        let out_len = cmp::min(out.len(), self.paths.active().mtu());
        let out = &mut out[..out_len];

        let space = &self.spaces[epoch.index()];
        let pn = space.next_pkt_num();
        let pn_len = packet::pkt_num_len(pn, space.largest_acked());

        let spin = if self.is_server {
            self.flags.spin_bit
        } else {
            !self.flags.spin_bit
        };

        let hdr = Header {
            ty: Type::from_level(level),
            version: self.version(),
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            pkt_num_len: pn_len,
            token: None,
            versions: None,
            key_phase,
            spin,
        };

        let mut b = octets::OctetsMut::with_slice(out);

        hdr.to_bytes(&mut b)?;

        let is_long = hdr.ty != Type::Short;

        let hdr_len = b.off() +
            if is_long { PAYLOAD_LENGTH_LEN } else { 0 } +
            pn_len;

        let mut payload_len =
            cmp::max(payload.len(), packet::min_payload_len(pn_len, tag_len));

        // Client Initial packets must be at least 1200 bytes long.
        if level == Level::Initial && !self.is_server {
            let len = hdr_len + payload_len + tag_len;

            payload_len += packet::INITIAL_PACKET_MINLEN.saturating_sub(len);
        }

        let written = hdr_len + payload_len + tag_len;

        if written > out_len {
            return Err(Error::BufferTooShort);
        }

        if !self.may_send(written) {
            return Err(Error::Done);
        }

        if is_long {
            b.put_varint_with_len(
                (pn_len + payload_len + tag_len) as u64,
                PAYLOAD_LENGTH_LEN,
            )?;
        }

        let pn_off = b.off();

        packet::encode_pkt_num(pn, pn_len, &mut b)?;

        let payload_off = b.off();

        b.put_bytes(payload)?;

        // PADDING frames.
        for _ in payload.len()..payload_len {
            b.put_u8(0)?;
        }

        let tx = self.levels[level as usize]
            .as_ref()
            .and_then(|enc| enc.keys.tx())
            .ok_or(Error::KeysUnavailable)?;

        let (head, body) = out.split_at_mut(payload_off);

        tx.seal_with_u64_counter(
            pn,
            head,
            &mut body[..payload_len + tag_len],
            payload_len,
        )?;

        packet::encrypt_hdr(&mut out[..written], pn_off, pn_len, tx)?;

        self.spaces[epoch.index()].alloc_pkt_num()?;

        trace!(
            "{} tx pkt {:?} pn={} len={} at {:?}",
            self.trace_id,
            hdr.ty,
            pn,
            written,
            now
        );

        Ok((pn, written, payload_len > payload.len()))
    }

    /// Records that the packets built since the previous call were sent.
    pub fn on_dgram_sent(&mut self, now: Instant) {
        self.flush_prepared(None, now);
    }

    /// Records that sending the packets built since the last datagram
    /// failed. They are forgotten, and the crypto data they carried will be
    /// sent again.
    pub fn on_dgram_send_error(&mut self, err: &std::io::Error) {
        self.counters.on_send_error(err);

        trace!("{} send error: {}", self.trace_id, err);

        for (epoch, pn) in std::mem::take(&mut self.prepared) {
            let pkt = match self.spaces[epoch.index()].on_packet_lost(pn) {
                Some(v) => v,

                None => continue,
            };

            if let Ok(path) = self.paths.get_mut(pkt.path_id) {
                path.on_prepared_dropped(pkt.size);
            }

            self.bytes.prep = self.bytes.prep.saturating_sub(pkt.size as u64);

            self.on_frames_lost(epoch, &pkt);
        }
    }

    fn flush_prepared(&mut self, epoch: Option<Epoch>, now: Instant) {
        let (flush, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.prepared)
            .into_iter()
            .partition(|(e, _)| epoch.map_or(true, |v| v == *e));

        self.prepared = keep;

        for (e, pn) in flush {
            let pkt = match self.spaces[e.index()].sent_packet(pn) {
                Some(v) => v.clone(),

                None => continue,
            };

            if let Ok(path) = self.paths.get_mut(pkt.path_id) {
                path.on_packet_sent(
                    e,
                    pn,
                    pkt.size,
                    pkt.size,
                    pkt.ack_eliciting,
                    pkt.in_flight,
                    now,
                );
            }

            self.bytes.prep = self.bytes.prep.saturating_sub(pkt.size as u64);
            self.bytes.tx += pkt.size as u64;

            self.counters.on_sent();
        }
    }

    /// Returns true if `len` more bytes may be sent to the peer.
    ///
    /// Until the peer address is validated, a server may only send up to
    /// the amplification factor times the bytes it received.
    pub fn may_send(&mut self, len: usize) -> bool {
        if self.flags.peer_validated_addr {
            return true;
        }

        let limit = self
            .bytes
            .rx
            .saturating_mul(self.config.amplification_factor);

        if self.bytes.tx + self.bytes.prep + len as u64 > limit {
            if !self.flags.amplification_reached {
                trace!(
                    "{} anti-amplification limit reached rx={} tx={}",
                    self.trace_id,
                    self.bytes.rx,
                    self.bytes.tx
                );
            }

            self.flags.amplification_reached = true;
            return false;
        }

        self.flags.amplification_reached = false;

        true
    }

    fn validate_peer_addr(&mut self) {
        if self.flags.peer_validated_addr {
            return;
        }

        debug!("{} peer address validated", self.trace_id);

        self.flags.peer_validated_addr = true;
        self.flags.amplification_reached = false;
    }

    /// Validates the peer address after the token of a Retry was checked.
    pub fn on_retry_token_validated(&mut self) {
        self.validate_peer_addr();
    }

    /// Processes the acknowledgement of a sent packet.
    pub fn on_packet_acked(&mut self, epoch: Epoch, pn: u64, now: Instant) {
        self.flush_prepared(Some(epoch), now);

        let pkt = match self.spaces[epoch.index()].on_packet_acked(pn) {
            Some(v) => v,

            None => return,
        };

        if pkt.in_flight {
            if let Ok(path) = self.paths.get_mut(pkt.path_id) {
                path.on_packet_acked(epoch, &pkt.info(), now);
            }
        }

        if let Some((off, len)) = pkt.crypto {
            if let Some(crypto) = self.crypto_stream_of(epoch) {
                crypto.send.on_acked(off, len);
            }
        }

        // The client could only acknowledge after decrypting the packet.
        if self.is_server && epoch == Epoch::Handshake {
            self.validate_peer_addr();
        }
    }

    /// Processes the loss of a sent packet.
    pub fn on_packet_lost(&mut self, epoch: Epoch, pn: u64, now: Instant) {
        self.flush_prepared(Some(epoch), now);

        let pkt = match self.spaces[epoch.index()].on_packet_lost(pn) {
            Some(v) => v,

            None => return,
        };

        trace!("{} {:?} packet lost pn={}", self.trace_id, epoch, pn);

        if pkt.in_flight {
            if let Ok(path) = self.paths.get_mut(pkt.path_id) {
                path.on_packet_lost(epoch, &pkt.info(), now);
            }
        }

        self.on_frames_lost(epoch, &pkt);

        self.counters.on_lost();
    }

    fn on_frames_lost(&mut self, epoch: Epoch, pkt: &SentPacket) {
        if let Some((off, len)) = pkt.crypto {
            if let Some(crypto) = self.crypto_stream_of(epoch) {
                crypto.send.on_lost(off, len);
            }
        }

        if pkt.handshake_done {
            self.flags.handshake_done_pending = true;
        }
    }

    /// Reports how many frames of a lost packet were lost so far.
    ///
    /// Above the configured limit the connection is closed with a
    /// PROTOCOL_VIOLATION error.
    pub fn on_frame_lost(&mut self, loss_count: usize) -> Result<()> {
        if loss_count > self.config.max_frame_loss {
            debug!("{} too many frames lost: {}", self.trace_id, loss_count);

            self.set_local_error(Error::FrameLoss);
            return Err(Error::FrameLoss);
        }

        Ok(())
    }

    /// Counts a flow control blocked frame received from the peer.
    pub fn on_blocked_frame(&self, frame: BlockedFrame) {
        self.counters.on_blocked_frame(frame);
    }

    /// Installs the keys of `level` offered by the key provider.
    ///
    /// Initial keys are derived from the original destination connection
    /// ID and need not be notified.
    pub fn on_keys_available(&mut self, level: Level) -> Result<()> {
        if level == Level::Initial {
            return Ok(());
        }

        if self.spaces[level.epoch().index()].is_discarded() {
            return Err(Error::InvalidState);
        }

        let rx = self.keys.decryption_key(level, KeyPhase::default());
        let tx = self.keys.encryption_key(level, KeyPhase::default());

        if rx.is_none() && tx.is_none() {
            return Err(Error::KeysUnavailable);
        }

        match self.levels[level as usize] {
            Some(ref mut enc) => {
                if let (false, Some(rx)) = (enc.can_decrypt(), rx) {
                    enc.keys.set_rx(rx);
                }

                if let (false, Some(tx)) = (enc.can_encrypt(), tx) {
                    enc.keys.set_tx(tx);
                }
            },

            None =>
                self.levels[level as usize] = Some(EncLevel::new(
                    level,
                    rx,
                    tx,
                    MAX_CRYPTO_RX_BUFFERED,
                    self.config.crypto_in_flight_max,
                )),
        }

        debug!("{} {:?} keys available", self.trace_id, level);

        if level.rotates_keys() {
            self.install_next_keys();
        }

        Ok(())
    }

    /// Asks the key provider for the keys of the next 1-RTT key phase.
    fn install_next_keys(&mut self) {
        let phase = match self.levels[Level::OneRTT as usize] {
            Some(ref enc) if !enc.keys.has_next() => enc.keys.phase().next(),

            _ => return,
        };

        let rx = self.keys.decryption_key(Level::OneRTT, phase);
        let tx = self.keys.encryption_key(Level::OneRTT, phase);

        if let Some(enc) = self.levels[Level::OneRTT as usize].as_mut() {
            if enc.keys.install_next(rx, tx).is_err() {
                trace!("{} next keys not installed", self.trace_id);
            }
        }
    }

    fn flip_key_phase(
        &mut self, boundary: Option<u64>, now: Instant,
    ) -> Result<()> {
        let discard_at = now + self.pto() * 3;

        let enc = self.levels[Level::OneRTT as usize]
            .as_mut()
            .ok_or(Error::KeysUnavailable)?;

        let phase = enc.keys.commit_flip(boundary, Some(discard_at))?;

        debug!(
            "{} key phase {:?} {}",
            self.trace_id,
            phase,
            if boundary.is_some() { "by peer" } else { "initiated" }
        );

        self.install_next_keys();

        Ok(())
    }

    /// Starts a key update.
    ///
    /// Only allowed once the handshake is confirmed, and once the peer
    /// responded to the previous update.
    pub fn initiate_key_update(&mut self, now: Instant) -> Result<()> {
        if !self.handshake_confirmed {
            return Err(Error::InvalidState);
        }

        self.flip_key_phase(None, now)
    }

    /// Records that the TLS handshake completed.
    ///
    /// A server confirms the handshake at once and schedules a
    /// HANDSHAKE_DONE frame.
    pub fn on_handshake_completed(&mut self, now: Instant) -> Result<()> {
        if self.handshake_completed {
            return Err(Error::Done);
        }

        debug!("{} handshake completed", self.trace_id);

        self.handshake_completed = true;
        self.handshake_timer = None;

        if self.is_server {
            self.flags.handshake_done_pending = true;
            self.confirm_handshake(now);
        }

        Ok(())
    }

    /// Processes a HANDSHAKE_DONE frame.
    pub fn on_handshake_done_received(&mut self, now: Instant) -> Result<()> {
        if self.is_server {
            return Err(Error::ProtocolViolation);
        }

        if !self.handshake_confirmed {
            self.handshake_completed = true;
            self.handshake_timer = None;

            self.confirm_handshake(now);
        }

        Ok(())
    }

    fn confirm_handshake(&mut self, now: Instant) {
        debug!("{} handshake confirmed", self.trace_id);

        self.handshake_confirmed = true;

        self.discard_space(Epoch::Initial, now);
        self.discard_space(Epoch::Handshake, now);
    }

    /// Discards a packet number space with its keys and crypto stream.
    ///
    /// Discarding twice is a no-op.
    fn discard_space(&mut self, epoch: Epoch, now: Instant) {
        // Packets built for the datagram being assembled are sent anyway.
        self.flush_prepared(Some(epoch), now);

        let flight = match self.spaces[epoch.index()].discard() {
            Some(v) => v,

            None => return,
        };

        for (path_id, path) in self.paths.iter_mut() {
            let (bytes, ack_eliciting) = flight
                .iter()
                .filter(|p| p.in_flight && p.path_id == path_id)
                .fold((0, 0), |(bytes, n), p| {
                    (bytes + p.size, n + usize::from(p.ack_eliciting))
                });

            path.on_pkt_num_space_discarded(epoch, bytes, ack_eliciting);
        }

        self.levels[Level::from_epoch(epoch) as usize] = None;

        if epoch == Epoch::Application {
            self.levels[Level::ZeroRTT as usize] = None;
        }

        debug!("{} {:?} space discarded", self.trace_id, epoch);
    }

    /// Switches to the version picked by compatible version negotiation.
    ///
    /// Initial keys are derived again for the new version.
    pub fn set_negotiated_version(&mut self, version: u32) -> Result<()> {
        if self.negotiated_version.is_some() ||
            !version::is_compatible(self.original_version, version)
        {
            return Err(Error::InvalidState);
        }

        if version == self.original_version {
            return Ok(());
        }

        let (open, seal) = crypto::derive_initial_key_material(
            &self.odcid,
            version,
            self.is_server,
        )?;

        if let Some(enc) = self.levels[Level::Initial as usize].as_mut() {
            enc.keys.set_rx(Box::new(open));
            enc.keys.set_tx(Box::new(seal));
        }

        self.negotiated_version = Some(version);

        debug!("{} negotiated version {:x}", self.trace_id, version);

        Ok(())
    }

    fn crypto_stream(&mut self, level: Level) -> Result<&mut CryptoStream> {
        self.levels[level as usize]
            .as_mut()
            .and_then(|enc| enc.crypto.as_mut())
            .ok_or(Error::InvalidState)
    }

    fn crypto_stream_of(&mut self, epoch: Epoch) -> Option<&mut CryptoStream> {
        self.crypto_stream(Level::from_epoch(epoch)).ok()
    }

    /// Buffers the data of a CRYPTO frame received at `level`.
    pub fn crypto_recv(
        &mut self, level: Level, off: u64, data: &[u8],
    ) -> Result<()> {
        self.crypto_stream(level)?.recv.write(off, data)
    }

    /// Reads the contiguous crypto data received at `level`.
    pub fn crypto_read(&mut self, level: Level, out: &mut [u8]) -> Result<usize> {
        self.crypto_stream(level)?.recv.emit(out)
    }

    /// Buffers crypto data to send at `level`.
    ///
    /// Returns [`Done`](Error::Done) when too much crypto data is
    /// unacknowledged, the caller must try again later.
    pub fn crypto_send(&mut self, level: Level, data: &[u8]) -> Result<()> {
        self.crypto_stream(level)?.send.write(data)
    }

    /// Makes the buffered crypto data of `level` ready to be sent.
    pub fn crypto_flush(&mut self, level: Level) -> Result<()> {
        self.crypto_stream(level)?.send.flush();

        Ok(())
    }

    /// Copies crypto data to send at `level`, returning its offset and
    /// length.
    pub fn crypto_emit(
        &mut self, level: Level, out: &mut [u8],
    ) -> Result<(u64, usize)> {
        self.crypto_stream(level)?.send.emit(out)
    }

    /// Attaches the application multiplexer, delivering the data buffered
    /// so far.
    pub fn attach_mux(&mut self, mut mux: Box<dyn Mux>) -> Result<()> {
        if self.mux_state != MuxState::Null || !self.close_state.is_open() {
            return Err(Error::InvalidState);
        }

        for data in self.mux_buf.drain(..) {
            mux.deliver(&data);
        }

        self.mux_buffered = 0;

        self.mux = Some(mux);
        self.mux_state = MuxState::Ready;

        debug!("{} mux attached", self.trace_id);

        Ok(())
    }

    /// Detaches the application multiplexer.
    pub fn release_mux(&mut self) -> Result<()> {
        if self.mux_state != MuxState::Ready {
            return Err(Error::InvalidState);
        }

        self.mux_state = MuxState::Released;

        if let Some(mut mux) = self.mux.take() {
            mux.released();
        }

        debug!("{} mux released", self.trace_id);

        Ok(())
    }

    /// Hands application data received from the peer to the multiplexer.
    ///
    /// The data is buffered until a multiplexer is attached, and discarded
    /// once it was released.
    pub fn deliver(&mut self, data: &[u8]) {
        match self.mux_state {
            MuxState::Null => {
                if self.mux_buffered + data.len() > MAX_MUX_BUFFERED {
                    trace!("{} mux buffer full", self.trace_id);

                    self.counters.on_bufoverrun();
                    return;
                }

                self.mux_buffered += data.len();
                self.mux_buf.push_back(data.to_vec());
            },

            MuxState::Ready =>
                if let Some(mux) = self.mux.as_mut() {
                    mux.deliver(data);
                },

            MuxState::Released => {
                trace!("{} {} bytes for released mux", self.trace_id, data.len());
            },
        }
    }

    /// Closes the connection with the given error and reason.
    ///
    /// Returns [`Done`](Error::Done) if the connection is already closing.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        if !self.close_state.is_open() {
            return Err(Error::Done);
        }

        self.local_error = Some(ConnectionError {
            is_app: app,
            error_code: err,
            reason: reason.to_vec(),
        });

        self.enter_close_state(CloseState::ImmediateClose);

        Ok(())
    }

    fn set_local_error(&mut self, err: Error) {
        if !self.close_state.is_open() {
            return;
        }

        self.local_error = Some(ConnectionError::transport(err));

        self.enter_close_state(CloseState::ImmediateClose);
    }

    fn enter_close_state(&mut self, to: CloseState) {
        if self.close_state.advance(to).is_ok() {
            debug!("{} close state {:?}", self.trace_id, to);

            self.counters.on_close_state(to);
        }
    }

    /// Processes a CONNECTION_CLOSE frame from the peer.
    pub fn on_peer_close(&mut self, err: ConnectionError, now: Instant) {
        if self.close_state == CloseState::Draining {
            return;
        }

        debug!("{} peer closed: {:?}", self.trace_id, err);

        self.peer_error = Some(err);

        self.enter_close_state(CloseState::Draining);

        self.idle_timer = Some(now + self.pto() * 3);
        self.handshake_timer = None;
        self.ack_timer = None;

        if self.mux_state == MuxState::Ready {
            let _ = self.release_mux();
        }

        self.mux_buf.clear();
        self.mux_buffered = 0;
    }

    /// Writes the CONNECTION_CLOSE datagram.
    ///
    /// In the immediate close state the datagram is built at the highest
    /// level the peer can read, cached, and the connection starts closing.
    /// Afterwards the cached datagram is returned each time a
    /// retransmission is due. Nothing is ever sent while draining.
    pub fn send_close(&mut self, out: &mut [u8], now: Instant) -> Result<usize> {
        match self.close_state {
            CloseState::ImmediateClose => self.send_first_close(out, now),

            CloseState::Closing => {
                if !self.close_retransmit.is_pending() {
                    return Err(Error::Done);
                }

                let len = self.close_dgram.len();

                if len == 0 {
                    self.close_retransmit.take_pending();
                    return Err(Error::Done);
                }

                if out.len() < len {
                    return Err(Error::BufferTooShort);
                }

                if !self.may_send(len) {
                    return Err(Error::Done);
                }

                self.close_retransmit.take_pending();

                out[..len].copy_from_slice(&self.close_dgram);
                self.bytes.tx += len as u64;

                trace!("{} close retransmitted", self.trace_id);

                Ok(len)
            },

            _ => Err(Error::Done),
        }
    }

    fn send_first_close(
        &mut self, out: &mut [u8], now: Instant,
    ) -> Result<usize> {
        let err = self.local_error.clone().ok_or(Error::InvalidState)?;

        let level = match self.close_level() {
            Some(v) => v,

            None => {
                debug!("{} no keys to send CONNECTION_CLOSE", self.trace_id);

                self.enter_close_state(CloseState::Closing);
                self.idle_timer = Some(now + self.pto() * 3);

                return Err(Error::Done);
            },
        };

        let mut frame = vec![0; 32 + err.reason.len()];
        let mut b = octets::OctetsMut::with_slice(&mut frame);
        let frame_len = closing::encode_close_frame(&err, level, &mut b)?;

        let (_, len, _) = self.build_pkt(level, &frame[..frame_len], out, now)?;

        self.close_dgram = out[..len].to_vec();
        self.bytes.tx += len as u64;

        debug!(
            "{} CONNECTION_CLOSE sent at {:?} level: {:?}",
            self.trace_id, level, err
        );

        self.enter_close_state(CloseState::Closing);
        self.idle_timer = Some(now + self.pto() * 3);

        Ok(len)
    }

    /// The level of the CONNECTION_CLOSE: 1-RTT once the handshake is
    /// confirmed, otherwise the highest handshake level with keys.
    fn close_level(&self) -> Option<Level> {
        let usable = |l: Level| {
            self.levels[l as usize]
                .as_ref()
                .is_some_and(|enc| enc.can_encrypt())
        };

        if self.handshake_confirmed && usable(Level::OneRTT) {
            return Some(Level::OneRTT);
        }

        [Level::Handshake, Level::Initial, Level::OneRTT]
            .into_iter()
            .find(|l| usable(*l))
    }

    /// Reduces a closing or draining connection to a [`ClosingConnection`].
    ///
    /// The connection is given back in any other state.
    #[allow(clippy::result_large_err)]
    pub fn into_closing(
        mut self,
    ) -> std::result::Result<ClosingConnection, Connection> {
        let draining = match self.close_state {
            CloseState::Closing => false,

            CloseState::Draining => true,

            _ => return Err(self),
        };

        if self.mux_state == MuxState::Ready {
            let _ = self.release_mux();
        }

        self.backrefs.detach_all();

        let mut cids: Vec<ConnectionId> =
            self.scids.iter().map(|(_, cid)| cid.clone()).collect();

        if self.is_server {
            cids.push(self.odcid.clone());
        }

        let (idle_expire, expired) = match self.idle_timer {
            Some(t) => (t, self.flags.exp_timer),

            None => (Instant::now(), true),
        };

        let close_dgram = if draining {
            Vec::new()
        } else {
            std::mem::take(&mut self.close_dgram)
        };

        let path = self.paths.active();

        Ok(ClosingConnection {
            trace_id: std::mem::take(&mut self.trace_id),
            local_addr: path.local_addr(),
            peer_addr: path.peer_addr(),
            cids,
            close_dgram,
            retransmit: self.close_retransmit,
            draining,
            idle_expire,
            expired,
            rx_bytes: self.bytes.rx,
            tx_bytes: self.bytes.tx,
            amplification_factor: (!self.flags.peer_validated_addr)
                .then_some(self.config.amplification_factor),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Frees an expired connection, removing its connection IDs from the
    /// index and detaching introspection references.
    ///
    /// The connection is given back if it cannot be reclaimed yet.
    #[allow(clippy::result_large_err)]
    pub fn finalize(
        self, index: &CidIndex,
    ) -> std::result::Result<(), Connection> {
        if !self.is_reclaimable() {
            return Err(self);
        }

        self.unregister_cids(index);
        self.backrefs.detach_all();

        debug!("{} connection freed", self.trace_id);

        Ok(())
    }

    fn pto(&self) -> Duration {
        self.paths.active().cc().pto()
    }

    fn idle_timeout(&self) -> Option<Duration> {
        let idle = self.config.idle_timeout()?;

        Some(cmp::max(idle, self.pto() * 3))
    }

    /// Returns when the next timeout event will occur.
    pub fn timeout_instant(&self) -> Option<Instant> {
        if self.flags.exp_timer {
            return None;
        }

        if !self.close_state.is_open() {
            return self.idle_timer;
        }

        let loss = self
            .paths
            .iter()
            .filter_map(|(_, p)| p.loss_detection_timer())
            .min();

        let prev_key = self.levels[Level::OneRTT as usize]
            .as_ref()
            .and_then(|enc| enc.keys.prev_discard_deadline());

        [
            self.idle_timer,
            self.handshake_timer,
            self.ack_timer,
            loss,
            prev_key,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Returns the amount of time until the next timeout event.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.timeout_instant()
            .map(|t| t.saturating_duration_since(now))
    }

    /// Processes the expired timers.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.flags.exp_timer {
            return;
        }

        if self.idle_timer.is_some_and(|t| t <= now) {
            trace!("{} idle timeout expired", self.trace_id);

            self.expire();
            return;
        }

        if self.handshake_timer.is_some_and(|t| t <= now) {
            trace!("{} handshake timeout expired", self.trace_id);

            self.expire();
            return;
        }

        if !self.close_state.is_open() {
            return;
        }

        if self.ack_timer.is_some_and(|t| t <= now) {
            trace!("{} ack timer fired", self.trace_id);

            self.ack_timer = None;
            self.spaces[Epoch::Application.index()].ack_required = true;
            self.flags.ack_timer_fired = true;
        }

        for (_, path) in self.paths.iter_mut() {
            if let Some(epoch) = path.on_loss_detection_timeout(now) {
                let space = &mut self.spaces[epoch.index()];

                if !space.is_discarded() {
                    trace!("{} {:?} probe needed", self.trace_id, epoch);

                    space.probe_needed = true;
                }
            }
        }

        if let Some(enc) = self.levels[Level::OneRTT as usize].as_mut() {
            if enc.keys.discard_prev_if_expired(now) {
                trace!("{} previous keys discarded", self.trace_id);
            }
        }
    }

    fn expire(&mut self) {
        debug!("{} connection expired", self.trace_id);

        self.flags.exp_timer = true;

        self.idle_timer = None;
        self.handshake_timer = None;
        self.ack_timer = None;

        self.counters.on_expired();
    }

    /// Returns true once the connection expired and no multiplexer is
    /// attached anymore.
    pub fn is_reclaimable(&self) -> bool {
        self.flags.exp_timer && self.mux_state != MuxState::Ready
    }

    fn on_new_peer_addr(&mut self, info: &RecvInfo) {
        if self
            .paths
            .path_id_from_addrs(&(info.to, info.from))
            .is_some()
        {
            return;
        }

        let path = Path::new(
            info.to,
            info.from,
            self.config.initial_mtu,
            &self.config.recovery_config(),
            self.config.cc_factory,
            false,
        );

        match self.paths.insert_pending(path) {
            Ok(pid) => debug!(
                "{} new peer address {} on path {}",
                self.trace_id, info.from, pid
            ),

            Err(e) => trace!("{} new path rejected: {:?}", self.trace_id, e),
        }
    }

    /// Makes the path to `peer` the active path once its validation
    /// succeeded.
    ///
    /// The connection must then be moved to the thread handling the new
    /// address, see [`rebind()`](Connection::rebind).
    pub fn on_path_validated(&mut self, peer: SocketAddr) -> Result<()> {
        let pid = self.paths.pending_path_id().ok_or(Error::InvalidPathState)?;

        let path = self.paths.get_mut(pid)?;

        if path.peer_addr() != peer {
            return Err(Error::InvalidPathState);
        }

        path.on_validated();

        let old_id = self.paths.active_path_id();
        let old = self.paths.promote_pending()?;

        for space in self.spaces.iter_mut() {
            space.forget_path(old_id);
        }

        self.counters.on_migration();
        self.flags.affinity_changed = true;

        debug!(
            "{} migrated from {} to {}",
            self.trace_id,
            old.peer_addr(),
            peer
        );

        Ok(())
    }

    /// Forgets the path whose validation failed.
    pub fn on_path_validation_failed(&mut self) -> Result<()> {
        let mut path = self
            .paths
            .abandon_pending()
            .ok_or(Error::InvalidPathState)?;

        path.on_validation_failed();

        debug!("{} path to {} failed", self.trace_id, path.peer_addr());

        Ok(())
    }

    /// Sets the thread owning a connection that did not process any packet
    /// yet.
    pub fn set_owner(&mut self, thread: ThreadId) -> Result<()> {
        if self.recv_count > 0 || self.affinity.is_pending() {
            return Err(Error::InvalidState);
        }

        self.affinity = Affinity::Owned(thread);

        Ok(())
    }

    /// The thread allowed to process the connection, `None` during a
    /// handoff.
    pub fn owner(&self) -> Option<ThreadId> {
        self.affinity.owner()
    }

    /// Starts moving the connection to thread `to`.
    ///
    /// Packets cannot be processed until the receiving thread calls
    /// [`finalize_rebind()`](Connection::finalize_rebind).
    pub fn rebind(&mut self, to: ThreadId) -> Result<()> {
        self.affinity.start(to)?;

        debug!("{} handoff to thread {}", self.trace_id, to);

        Ok(())
    }

    /// Takes ownership of the connection on the receiving thread.
    pub fn finalize_rebind(&mut self, thread: ThreadId) -> Result<()> {
        self.affinity.complete(thread)?;

        self.flags.affinity_changed = false;

        debug!("{} now owned by thread {}", self.trace_id, thread);

        Ok(())
    }

    /// Registers the local connection IDs, and the original destination
    /// connection ID of a server, in the endpoint index.
    pub fn register_cids(
        &self, index: &CidIndex, handle: ConnectionHandle,
    ) -> Result<()> {
        for (_, cid) in self.scids.iter() {
            index.register(cid, handle)?;
        }

        if self.is_server {
            index.register(&self.odcid, handle)?;
        }

        Ok(())
    }

    pub fn unregister_cids(&self, index: &CidIndex) {
        for (_, cid) in self.scids.iter() {
            index.unregister(cid);
        }

        if self.is_server {
            index.unregister(&self.odcid);
        }
    }

    /// Issues a new local connection ID and registers it.
    pub fn issue_cid(
        &mut self, index: &CidIndex, handle: ConnectionHandle,
    ) -> Result<(u64, ConnectionId)> {
        let (seq, cid) = self.scids.issue()?;

        if let Err(e) = index.register(&cid, handle) {
            self.scids.retire(seq);
            return Err(e);
        }

        trace!("{} new local cid {:?} seq={}", self.trace_id, cid, seq);

        Ok((seq, cid))
    }

    /// Retires a local connection ID at the peer's request.
    ///
    /// Retiring a sequence number that was never issued is a
    /// PROTOCOL_VIOLATION.
    pub fn retire_cid(&mut self, seq: u64, index: &CidIndex) -> Result<()> {
        if seq >= self.scids.next_seq() {
            return Err(Error::ProtocolViolation);
        }

        let cid = self.scids.retire(seq).ok_or(Error::InvalidState)?;

        index.unregister(&cid);

        trace!("{} retired local cid {:?} seq={}", self.trace_id, cid, seq);

        Ok(())
    }

    /// Sets the active_connection_id_limit transport parameter of the peer.
    pub fn set_peer_active_cid_limit(&mut self, v: usize) {
        self.scids.set_limit(v);
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The version currently in use.
    pub fn version(&self) -> u32 {
        self.negotiated_version.unwrap_or(self.original_version)
    }

    pub fn original_version(&self) -> u32 {
        self.original_version
    }

    pub fn negotiated_version(&self) -> Option<u32> {
        self.negotiated_version
    }

    pub fn odcid(&self) -> &ConnectionId {
        &self.odcid
    }

    /// The destination connection ID of sent packets.
    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    /// The source connection ID of sent long header packets.
    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn scids(&self) -> impl Iterator<Item = (u64, &ConnectionId)> + '_ {
        self.scids.iter()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn bytes(&self) -> ByteCounts {
        self.bytes
    }

    pub fn mux_state(&self) -> MuxState {
        self.mux_state
    }

    pub fn close_state(&self) -> CloseState {
        self.close_state
    }

    pub fn is_established(&self) -> bool {
        self.handshake_completed
    }

    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    pub fn is_draining(&self) -> bool {
        self.close_state == CloseState::Draining
    }

    pub fn is_closed(&self) -> bool {
        !self.close_state.is_open()
    }

    /// Returns the error the connection was closed with locally.
    pub fn local_error(&self) -> Option<&ConnectionError> {
        self.local_error.as_ref()
    }

    /// Returns the error received in the peer's CONNECTION_CLOSE.
    pub fn peer_error(&self) -> Option<&ConnectionError> {
        self.peer_error.as_ref()
    }

    pub fn paths(&self) -> &PathMap {
        &self.paths
    }

    pub fn space(&self, epoch: Epoch) -> &PktNumSpace {
        &self.spaces[epoch.index()]
    }

    /// Returns the encryption level, unless its keys are not known yet or
    /// were discarded.
    pub fn level(&self, level: Level) -> Option<&EncLevel> {
        self.levels[level as usize].as_ref()
    }

    /// The counters, for reading from other threads.
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    pub fn backrefs(&self) -> &BackRefs {
        &self.backrefs
    }
}

pub use crate::affinity::Mailbox;
pub use crate::affinity::Mailboxes;
pub use crate::cid::ConnectionId;
pub use crate::closing::CloseState;
pub use crate::closing::ClosingConnection;
pub use crate::error::ConnectionError;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::WireErrorCode;
pub use crate::packet::negotiate_version;
pub use crate::version::version_is_supported;
pub use crate::version::PROTOCOL_VERSION_DRAFT29;
pub use crate::version::PROTOCOL_VERSION_V1;
pub use crate::version::PROTOCOL_VERSION_V2;

pub mod affinity;
pub mod backref;
pub mod cid;
pub mod closing;
pub mod crypto;
pub mod crypto_stream;
mod error;
pub mod key_update;
pub mod level;
pub mod packet;
pub mod path;
pub mod recovery;
pub mod space;
pub mod stats;
mod version;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;
