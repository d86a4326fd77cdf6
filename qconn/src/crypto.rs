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

use ring::aead;
use ring::hkdf;

use crate::Error;
use crate::Result;

use crate::packet::Epoch;
use crate::version;

/// An encryption level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Initial   = 0,
    ZeroRTT   = 1,
    Handshake = 2,
    OneRTT    = 3,
}

impl Level {
    pub const ALL: [Level; 4] =
        [Level::Initial, Level::ZeroRTT, Level::Handshake, Level::OneRTT];

    pub fn from_epoch(e: Epoch) -> Level {
        match e {
            Epoch::Initial => Level::Initial,

            Epoch::Handshake => Level::Handshake,

            Epoch::Application => Level::OneRTT,
        }
    }

    /// Returns the packet number space used by packets of this level.
    ///
    /// 0-RTT and 1-RTT packets share the Application space.
    pub fn epoch(self) -> Epoch {
        match self {
            Level::Initial => Epoch::Initial,

            Level::Handshake => Epoch::Handshake,

            Level::ZeroRTT | Level::OneRTT => Epoch::Application,
        }
    }

    /// Whether keys of this level go through key updates.
    pub fn rotates_keys(self) -> bool {
        self == Level::OneRTT
    }
}

/// A key phase generation.
///
/// Generation 0 is the first set of 1-RTT keys. The key phase bit carried in
/// short headers is the low bit of the generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPhase(pub u64);

impl KeyPhase {
    pub fn bit(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn next(self) -> KeyPhase {
        KeyPhase(self.0 + 1)
    }
}

/// Packet protection keys for one direction of one key phase.
pub trait PacketKey: Send + Sync {
    /// Decrypts `buf` in place, returning the plaintext length.
    fn open_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8],
    ) -> Result<usize>;

    /// Encrypts the first `in_len` bytes of `buf` in place and appends the
    /// tag, returning the ciphertext length.
    fn seal_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8], in_len: usize,
    ) -> Result<usize>;

    fn tag_len(&self) -> usize;

    /// Computes the header protection mask for the given ciphertext sample.
    fn new_mask(&self, sample: &[u8]) -> Result<[u8; 5]>;
}

/// Supplier of packet protection keys, usually backed by the TLS stack.
///
/// Returning `None` means the keys are not available yet. The connection asks
/// again when notified that new keys exist.
pub trait KeyProvider: Send {
    fn encryption_key(
        &mut self, level: Level, phase: KeyPhase,
    ) -> Option<Box<dyn PacketKey>>;

    fn decryption_key(
        &mut self, level: Level, phase: KeyPhase,
    ) -> Option<Box<dyn PacketKey>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    #[allow(non_camel_case_types)]
    AES128_GCM,

    #[allow(non_camel_case_types)]
    AES256_GCM,

    #[allow(non_camel_case_types)]
    ChaCha20_Poly1305,
}

impl Algorithm {
    fn get_ring_aead(self) -> &'static aead::Algorithm {
        match self {
            Algorithm::AES128_GCM => &aead::AES_128_GCM,
            Algorithm::AES256_GCM => &aead::AES_256_GCM,
            Algorithm::ChaCha20_Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn get_ring_hp(self) -> &'static aead::quic::Algorithm {
        match self {
            Algorithm::AES128_GCM => &aead::quic::AES_128,
            Algorithm::AES256_GCM => &aead::quic::AES_256,
            Algorithm::ChaCha20_Poly1305 => &aead::quic::CHACHA20,
        }
    }

    fn get_ring_digest(self) -> hkdf::Algorithm {
        match self {
            Algorithm::AES128_GCM => hkdf::HKDF_SHA256,
            Algorithm::AES256_GCM => hkdf::HKDF_SHA384,
            Algorithm::ChaCha20_Poly1305 => hkdf::HKDF_SHA256,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Algorithm::AES128_GCM => 16,
            Algorithm::AES256_GCM => 32,
            Algorithm::ChaCha20_Poly1305 => 32,
        }
    }

    pub fn tag_len(self) -> usize {
        16
    }

    pub fn nonce_len(self) -> usize {
        aead::NONCE_LEN
    }

    fn secret_len(self) -> usize {
        match self {
            Algorithm::AES256_GCM => 48,
            _ => 32,
        }
    }
}

/// Packet protection keys backed by ring.
pub struct RingKey {
    alg: Algorithm,

    version: &'static version::Version,

    key: aead::LessSafeKey,

    iv: Vec<u8>,

    hp_key: aead::quic::HeaderProtectionKey,

    hp_raw: Vec<u8>,

    secret: Vec<u8>,
}

impl RingKey {
    /// Derives packet protection keys from a traffic secret.
    pub fn from_secret(
        alg: Algorithm, version: u32, secret: &[u8],
    ) -> Result<RingKey> {
        let version = version::lookup(version).ok_or(Error::UnknownVersion)?;

        let mut hp_raw = vec![0; alg.key_len()];
        derive_hdr_key(alg, version.hp_label, secret, &mut hp_raw)?;

        RingKey::with_hp_key(alg, version, secret, hp_raw)
    }

    fn with_hp_key(
        alg: Algorithm, version: &'static version::Version, secret: &[u8],
        hp_raw: Vec<u8>,
    ) -> Result<RingKey> {
        let mut key = vec![0; alg.key_len()];
        let mut iv = vec![0; alg.nonce_len()];

        derive_pkt_key(alg, version.key_label, secret, &mut key)?;
        derive_pkt_iv(alg, version.iv_label, secret, &mut iv)?;

        let key = aead::UnboundKey::new(alg.get_ring_aead(), &key)
            .map_err(|_| Error::CryptoFail)?;

        let hp_key =
            aead::quic::HeaderProtectionKey::new(alg.get_ring_hp(), &hp_raw)
                .map_err(|_| Error::CryptoFail)?;

        Ok(RingKey {
            alg,

            version,

            key: aead::LessSafeKey::new(key),

            iv,

            hp_key,

            hp_raw,

            secret: secret.to_vec(),
        })
    }

    /// Derives the keys of the next key phase.
    ///
    /// The header protection key is not updated.
    pub fn derive_next(&self) -> Result<RingKey> {
        let mut next_secret = vec![0; self.alg.secret_len()];

        derive_next_secret(
            self.alg,
            self.version.ku_label,
            &self.secret,
            &mut next_secret,
        )?;

        RingKey::with_hp_key(
            self.alg,
            self.version,
            &next_secret,
            self.hp_raw.clone(),
        )
    }

    pub fn alg(&self) -> Algorithm {
        self.alg
    }
}

impl PacketKey for RingKey {
    fn open_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8],
    ) -> Result<usize> {
        if buf.len() < self.alg.tag_len() {
            return Err(Error::CryptoFail);
        }

        let nonce =
            aead::Nonce::assume_unique_for_key(make_nonce(&self.iv, counter));

        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::from(ad), buf)
            .map_err(|_| Error::CryptoFail)?;

        Ok(plain.len())
    }

    fn seal_with_u64_counter(
        &self, counter: u64, ad: &[u8], buf: &mut [u8], in_len: usize,
    ) -> Result<usize> {
        let tag_len = self.alg.tag_len();

        if in_len + tag_len > buf.len() {
            return Err(Error::BufferTooShort);
        }

        let nonce =
            aead::Nonce::assume_unique_for_key(make_nonce(&self.iv, counter));

        let tag = self
            .key
            .seal_in_place_separate_tag(
                nonce,
                aead::Aad::from(ad),
                &mut buf[..in_len],
            )
            .map_err(|_| Error::CryptoFail)?;

        buf[in_len..in_len + tag_len].copy_from_slice(tag.as_ref());

        Ok(in_len + tag_len)
    }

    fn tag_len(&self) -> usize {
        self.alg.tag_len()
    }

    fn new_mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        let mask = self
            .hp_key
            .new_mask(sample)
            .map_err(|_| Error::CryptoFail)?;

        Ok(mask)
    }
}

/// Derives the Initial keys for the given original destination connection
/// ID, returning the (open, seal) pair for the given role.
pub fn derive_initial_key_material(
    cid: &[u8], version: u32, is_server: bool,
) -> Result<(RingKey, RingKey)> {
    let v = version::lookup(version).ok_or(Error::UnknownVersion)?;

    let aead = Algorithm::AES128_GCM;

    let initial_secret = derive_initial_secret(cid, v);

    let mut client_secret = [0; 32];
    let mut server_secret = [0; 32];

    derive_client_initial_secret(&initial_secret, &mut client_secret)?;
    derive_server_initial_secret(&initial_secret, &mut server_secret)?;

    let client = RingKey::from_secret(aead, version, &client_secret)?;
    let server = RingKey::from_secret(aead, version, &server_secret)?;

    if is_server {
        Ok((client, server))
    } else {
        Ok((server, client))
    }
}

fn derive_initial_secret(
    secret: &[u8], version: &version::Version,
) -> hkdf::Prk {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, version.initial_salt);
    salt.extract(secret)
}

fn derive_client_initial_secret(prk: &hkdf::Prk, out: &mut [u8]) -> Result<()> {
    const LABEL: &[u8] = b"client in";
    hkdf_expand_label(prk, LABEL, out)
}

fn derive_server_initial_secret(prk: &hkdf::Prk, out: &mut [u8]) -> Result<()> {
    const LABEL: &[u8] = b"server in";
    hkdf_expand_label(prk, LABEL, out)
}

pub fn derive_hdr_key(
    aead: Algorithm, label: &[u8], secret: &[u8], out: &mut [u8],
) -> Result<()> {
    let key_len = aead.key_len();

    if key_len > out.len() {
        return Err(Error::CryptoFail);
    }

    let secret = hkdf::Prk::new_less_safe(aead.get_ring_digest(), secret);
    hkdf_expand_label(&secret, label, &mut out[..key_len])
}

pub fn derive_pkt_key(
    aead: Algorithm, label: &[u8], secret: &[u8], out: &mut [u8],
) -> Result<()> {
    let key_len = aead.key_len();

    if key_len > out.len() {
        return Err(Error::CryptoFail);
    }

    let secret = hkdf::Prk::new_less_safe(aead.get_ring_digest(), secret);
    hkdf_expand_label(&secret, label, &mut out[..key_len])
}

pub fn derive_pkt_iv(
    aead: Algorithm, label: &[u8], secret: &[u8], out: &mut [u8],
) -> Result<()> {
    let nonce_len = aead.nonce_len();

    if nonce_len > out.len() {
        return Err(Error::CryptoFail);
    }

    let secret = hkdf::Prk::new_less_safe(aead.get_ring_digest(), secret);
    hkdf_expand_label(&secret, label, &mut out[..nonce_len])
}

fn derive_next_secret(
    aead: Algorithm, label: &[u8], secret: &[u8], out: &mut [u8],
) -> Result<()> {
    let secret = hkdf::Prk::new_less_safe(aead.get_ring_digest(), secret);
    hkdf_expand_label(&secret, label, out)
}

fn hkdf_expand_label(
    prk: &hkdf::Prk, label: &[u8], out: &mut [u8],
) -> Result<()> {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = (LABEL_PREFIX.len() + label.len()) as u8;

    let info = [&out_len, &[label_len][..], LABEL_PREFIX, label, &[0][..]];

    prk.expand(&info, ArbitraryOutputLen(out.len()))
        .map_err(|_| Error::CryptoFail)?
        .fill(out)
        .map_err(|_| Error::CryptoFail)?;

    Ok(())
}

fn make_nonce(iv: &[u8], counter: u64) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0; aead::NONCE_LEN];
    nonce.copy_from_slice(iv);

    // XOR the last bytes of the IV with the counter. This is equivalent to
    // left-padding the counter with zero bytes.
    for (a, b) in nonce[4..].iter_mut().zip(counter.to_be_bytes().iter()) {
        *a ^= b;
    }

    nonce
}

// The ring HKDF expand() API does not accept an arbitrary output length, so we
// need to hide the `usize` length as part of a type that implements the trait
// `ring::hkdf::KeyType` in order to trick ring into accepting it.
struct ArbitraryOutputLen(usize);

impl hkdf::KeyType for ArbitraryOutputLen {
    fn len(&self) -> usize {
        self.0
    }
}
