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

use ring::rand::SecureRandom;

use crate::Error;
use crate::Result;

use crate::cid::ConnectionId;
use crate::crypto;
use crate::crypto::PacketKey;
use crate::version;

pub const FORM_BIT: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

const LONG_RESERVED_BITS: u8 = 0x0c;
const SHORT_RESERVED_BITS: u8 = 0x18;

const TYPE_MASK: u8 = 0x30;
const PKT_NUM_MASK: u8 = 0x03;

pub const MAX_CID_LEN: u8 = 20;

pub const MAX_PKT_NUM_LEN: usize = 4;

const SAMPLE_LEN: usize = 16;

/// Largest packet number allowed by the protocol.
pub const MAX_PKT_NUM: u64 = (1 << 62) - 1;

/// Minimum size of a UDP datagram carrying a client Initial packet.
pub const INITIAL_PACKET_MINLEN: usize = 1200;

const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// A packet number space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial     = 0,
    Handshake   = 1,
    Application = 2,
}

impl Epoch {
    pub const ALL: [Epoch; 3] =
        [Epoch::Initial, Epoch::Handshake, Epoch::Application];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// QUIC packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Initial packet.
    Initial,

    /// Retry packet.
    Retry,

    /// Handshake packet.
    Handshake,

    /// 0-RTT packet.
    ZeroRTT,

    /// Version negotiation packet.
    VersionNegotiation,

    /// 1-RTT short header packet.
    Short,
}

impl Type {
    pub(crate) fn from_level(level: crypto::Level) -> Type {
        match level {
            crypto::Level::Initial => Type::Initial,

            crypto::Level::ZeroRTT => Type::ZeroRTT,

            crypto::Level::Handshake => Type::Handshake,

            crypto::Level::OneRTT => Type::Short,
        }
    }

    /// Returns the encryption level protecting packets of this type.
    ///
    /// Retry and version negotiation packets are not protected.
    pub(crate) fn to_level(self) -> Result<crypto::Level> {
        match self {
            Type::Initial => Ok(crypto::Level::Initial),

            Type::ZeroRTT => Ok(crypto::Level::ZeroRTT),

            Type::Handshake => Ok(crypto::Level::Handshake),

            Type::Short => Ok(crypto::Level::OneRTT),

            _ => Err(Error::InvalidPacket),
        }
    }

    fn long_index(self) -> Option<usize> {
        match self {
            Type::Initial => Some(0),
            Type::ZeroRTT => Some(1),
            Type::Handshake => Some(2),
            Type::Retry => Some(3),
            _ => None,
        }
    }
}

/// A QUIC packet's header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    /// The type of the packet.
    pub ty: Type,

    /// The version of the packet.
    pub version: u32,

    /// The destination connection ID of the packet.
    pub dcid: ConnectionId,

    /// The source connection ID of the packet.
    pub scid: ConnectionId,

    /// The length of the packet number. Only known once header protection
    /// is removed.
    pub pkt_num_len: usize,

    /// The address verification token of the packet. Only present in
    /// `Initial` and `Retry` packets.
    pub token: Option<Vec<u8>>,

    /// The list of versions in the packet. Only present in
    /// `VersionNegotiation` packets.
    pub versions: Option<Vec<u32>>,

    /// The key phase bit of the packet. Only meaningful for short header
    /// packets once header protection is removed.
    pub key_phase: bool,

    /// The spin bit of a short header packet.
    pub spin: bool,
}

impl Header {
    /// Parses a QUIC packet header from the given buffer.
    ///
    /// The `dcid_len` parameter is the length of the destination connection
    /// ID, required to parse short header packets.
    pub fn from_slice(buf: &mut [u8], dcid_len: usize) -> Result<Header> {
        let mut b = octets::Octets::with_slice(buf);
        Header::from_bytes(&mut b, dcid_len)
    }

    pub(crate) fn from_bytes(
        b: &mut octets::Octets, dcid_len: usize,
    ) -> Result<Header> {
        let first = b.get_u8()?;

        if !Header::is_long(first) {
            // Decode short header.
            let dcid = b.get_bytes(dcid_len)?;

            return Ok(Header {
                ty: Type::Short,
                version: 0,
                dcid: ConnectionId::from_slice(dcid.as_ref()),
                scid: ConnectionId::default(),
                pkt_num_len: 0,
                token: None,
                versions: None,
                key_phase: false,
                spin: first & SPIN_BIT != 0,
            });
        }

        // Decode long header.
        let version = b.get_u32()?;

        let ty = if version == 0 {
            Type::VersionNegotiation
        } else {
            // Unknown versions use the v1 encoding, the caller rejects them.
            let type_bits = version::lookup(version)
                .map(|v| v.type_bits)
                .unwrap_or([0, 1, 2, 3]);

            let bits = (first & TYPE_MASK) >> 4;

            match type_bits.iter().position(|&t| t == bits) {
                Some(0) => Type::Initial,
                Some(1) => Type::ZeroRTT,
                Some(2) => Type::Handshake,
                Some(3) => Type::Retry,
                _ => return Err(Error::InvalidPacket),
            }
        };

        let dcid_len = b.get_u8()?;
        if version_is_known(version) && dcid_len > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let dcid = b.get_bytes(dcid_len as usize)?.to_vec();

        let scid_len = b.get_u8()?;
        if version_is_known(version) && scid_len > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let scid = b.get_bytes(scid_len as usize)?.to_vec();

        // End of invariants.

        let mut token: Option<Vec<u8>> = None;
        let mut versions: Option<Vec<u32>> = None;

        match ty {
            Type::Initial => {
                token = Some(b.get_bytes_with_varint_length()?.to_vec());
            },

            Type::Retry => {
                // Exclude the integrity tag from the token.
                if b.cap() < RETRY_INTEGRITY_TAG_LEN {
                    return Err(Error::BufferTooShort);
                }

                let token_len = b.cap() - RETRY_INTEGRITY_TAG_LEN;
                token = Some(b.get_bytes(token_len)?.to_vec());
            },

            Type::VersionNegotiation => {
                let mut list: Vec<u32> = Vec::new();

                while b.cap() > 0 {
                    let version = b.get_u32()?;
                    list.push(version);
                }

                versions = Some(list);
            },

            _ => (),
        };

        Ok(Header {
            ty,
            version,
            dcid: ConnectionId::from_vec(dcid),
            scid: ConnectionId::from_vec(scid),
            pkt_num_len: 0,
            token,
            versions,
            key_phase: false,
            spin: false,
        })
    }

    /// Writes the header up to, but excluding, the Length field of long
    /// header packets.
    pub(crate) fn to_bytes(&self, out: &mut octets::OctetsMut) -> Result<()> {
        let mut first = 0;

        // Encode pkt num length.
        first |= self.pkt_num_len.saturating_sub(1) as u8;

        // Encode short header.
        if self.ty == Type::Short {
            // Unset form bit for short header.
            first &= !FORM_BIT;

            // Set fixed bit.
            first |= FIXED_BIT;

            if self.key_phase {
                first |= KEY_PHASE_BIT;
            }

            if self.spin {
                first |= SPIN_BIT;
            }

            out.put_u8(first)?;
            out.put_bytes(&self.dcid)?;

            return Ok(());
        }

        // Encode long header.
        let version = version::lookup(self.version).ok_or(Error::UnknownVersion)?;

        let idx = self.ty.long_index().ok_or(Error::InvalidPacket)?;
        let ty = version.type_bits[idx];

        first |= FORM_BIT | FIXED_BIT | (ty << 4);

        out.put_u8(first)?;

        out.put_u32(self.version)?;

        out.put_u8(self.dcid.len() as u8)?;
        out.put_bytes(&self.dcid)?;

        out.put_u8(self.scid.len() as u8)?;
        out.put_bytes(&self.scid)?;

        // Only Initial and Retry packets have a token.
        if self.ty == Type::Initial {
            match self.token {
                Some(ref v) => {
                    out.put_varint(v.len() as u64)?;
                    out.put_bytes(v)?;
                },

                // No token, so length = 0.
                None => {
                    out.put_varint(0)?;
                },
            }
        }

        Ok(())
    }

    /// Returns true if the packet has a long header.
    ///
    /// The `b` parameter represents the first byte of the QUIC header.
    pub(crate) fn is_long(b: u8) -> bool {
        b & FORM_BIT != 0
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.ty)?;

        if self.ty != Type::Short {
            write!(f, " version={:x}", self.version)?;
        }

        write!(f, " dcid={:?}", self.dcid)?;

        if self.ty != Type::Short {
            write!(f, " scid={:?}", self.scid)?;
        }

        if let Some(ref versions) = self.versions {
            write!(f, " versions={versions:x?}")?;
        }

        Ok(())
    }
}

fn version_is_known(version: u32) -> bool {
    version::version_is_supported(version)
}

/// Returns the reserved bits of a first byte after header protection removal.
pub(crate) fn reserved_bits(first: u8) -> u8 {
    if Header::is_long(first) {
        first & LONG_RESERVED_BITS
    } else {
        first & SHORT_RESERVED_BITS
    }
}

/// Returns the number of bytes needed to encode `pn` so that the peer can
/// decode it given the largest acknowledged packet number.
pub fn pkt_num_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(largest) => pn.saturating_sub(largest),
        None => pn + 1,
    };

    let min_bits = u64::BITS - num_unacked.leading_zeros() + 1;

    (min_bits as usize).div_ceil(8).clamp(1, MAX_PKT_NUM_LEN)
}

/// Removes header protection in place.
///
/// `pn_off` is the offset of the packet number field in `buf`, which must
/// start with the first byte of the packet. Returns the truncated packet
/// number and its length.
pub fn decrypt_hdr(
    buf: &mut [u8], pn_off: usize, aead: &dyn PacketKey,
) -> Result<(u64, usize)> {
    let sample_off = pn_off + MAX_PKT_NUM_LEN;

    if buf.len() < sample_off + SAMPLE_LEN {
        return Err(Error::InvalidPacket);
    }

    let mask = aead.new_mask(&buf[sample_off..sample_off + SAMPLE_LEN])?;

    if Header::is_long(buf[0]) {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }

    let pn_len = usize::from((buf[0] & PKT_NUM_MASK) + 1);

    let mut pn = 0;

    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[i + 1];
        pn = (pn << 8) | u64::from(buf[pn_off + i]);
    }

    Ok((pn, pn_len))
}

/// Recovers the full packet number from its truncated encoding.
pub fn decode_pkt_num(largest_pn: u64, truncated_pn: u64, pn_len: usize) -> u64 {
    let pn_nbits = pn_len * 8;
    let expected_pn = largest_pn + 1;
    let pn_win = 1 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;
    let candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

    if candidate_pn + pn_hwin <= expected_pn &&
        candidate_pn < (1 << 62) - pn_win
    {
        return candidate_pn + pn_win;
    }

    if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
        return candidate_pn - pn_win;
    }

    candidate_pn
}

/// Applies header protection in place.
///
/// The payload following the packet number must already be encrypted.
pub fn encrypt_hdr(
    buf: &mut [u8], pn_off: usize, pn_len: usize, aead: &dyn PacketKey,
) -> Result<()> {
    let sample_off = pn_off + MAX_PKT_NUM_LEN;

    if buf.len() < sample_off + SAMPLE_LEN {
        return Err(Error::BufferTooShort);
    }

    let mask = aead.new_mask(&buf[sample_off..sample_off + SAMPLE_LEN])?;

    if Header::is_long(buf[0]) {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }

    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[i + 1];
    }

    Ok(())
}

pub fn encode_pkt_num(
    pn: u64, pn_len: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    match pn_len {
        1 => b.put_u8(pn as u8)?,

        2 => b.put_u16(pn as u16)?,

        3 => b.put_u24(pn as u32)?,

        4 => b.put_u32(pn as u32)?,

        _ => return Err(Error::InvalidPacket),
    };

    Ok(())
}

/// Minimum payload length so that a header protection sample is available,
/// given the packet number length and AEAD tag length.
pub(crate) fn min_payload_len(pn_len: usize, tag_len: usize) -> usize {
    (MAX_PKT_NUM_LEN + SAMPLE_LEN).saturating_sub(pn_len + tag_len)
}

/// Writes a version negotiation packet in response to a client packet with
/// the given connection IDs.
pub fn negotiate_version(
    scid: &[u8], dcid: &[u8], out: &mut [u8],
) -> Result<usize> {
    let mut b = octets::OctetsMut::with_slice(out);

    let mut first = [0; 1];
    ring::rand::SystemRandom::new()
        .fill(&mut first)
        .map_err(|_| Error::CryptoFail)?;

    b.put_u8(first[0] | FORM_BIT)?;
    b.put_u32(0)?;

    // Invert client's scid and dcid.
    b.put_u8(scid.len() as u8)?;
    b.put_bytes(scid)?;
    b.put_u8(dcid.len() as u8)?;
    b.put_bytes(dcid)?;

    for v in version::supported() {
        b.put_u32(v)?;
    }

    Ok(b.off())
}

/// Sliding window of received packet numbers used to detect duplicates.
#[derive(Clone, Copy, Default)]
pub struct PktNumWindow {
    lower: u64,
    window: u128,
}

impl PktNumWindow {
    pub fn insert(&mut self, seq: u64) {
        // Packet is on the left end of the window.
        if seq < self.lower {
            return;
        }

        // Packet is on the right end of the window.
        if seq > self.upper() {
            let diff = seq - self.upper();
            self.lower += diff;

            self.window = self.window.checked_shl(diff as u32).unwrap_or(0);
        }

        let mask = 1_u128 << (self.upper() - seq);
        self.window |= mask;
    }

    /// Returns true if `seq` was already seen, or is too old to tell.
    pub fn contains(&self, seq: u64) -> bool {
        // Packet is on the right end of the window.
        if seq > self.upper() {
            return false;
        }

        // Packet is on the left end of the window.
        if seq < self.lower {
            return true;
        }

        let mask = 1_u128 << (self.upper() - seq);
        self.window & mask != 0
    }

    fn upper(&self) -> u64 {
        self.lower
            .saturating_add(u128::BITS as u64)
            .saturating_sub(1)
    }
}
