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

//! Supported QUIC versions.

/// Draft-29 of the QUIC transport.
pub const PROTOCOL_VERSION_DRAFT29: u32 = 0xff00_001d;

/// QUIC version 1 (RFC 9000).
pub const PROTOCOL_VERSION_V1: u32 = 0x0000_0001;

/// QUIC version 2 (RFC 9369).
pub const PROTOCOL_VERSION_V2: u32 = 0x6b33_43cf;

/// Properties of a QUIC version that affect packet protection and the long
/// header encoding.
#[derive(Debug, PartialEq, Eq)]
pub struct Version {
    /// The version number carried in long headers.
    pub num: u32,

    /// Salt used to derive Initial secrets.
    pub initial_salt: &'static [u8; 20],

    pub key_label: &'static [u8],
    pub iv_label: &'static [u8],
    pub hp_label: &'static [u8],
    pub ku_label: &'static [u8],

    /// Long header type bits for Initial, 0-RTT, Handshake and Retry packets.
    pub type_bits: [u8; 4],
}

const INITIAL_SALT_DRAFT29: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c,
    0x61, 0x11, 0xe0, 0x43, 0x90, 0xa8, 0x99,
];

const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4,
    0xc8, 0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

const INITIAL_SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e,
    0x26, 0x9d, 0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
];

static VERSIONS: [Version; 3] = [
    Version {
        num: PROTOCOL_VERSION_V1,
        initial_salt: &INITIAL_SALT_V1,
        key_label: b"quic key",
        iv_label: b"quic iv",
        hp_label: b"quic hp",
        ku_label: b"quic ku",
        type_bits: [0, 1, 2, 3],
    },
    Version {
        num: PROTOCOL_VERSION_V2,
        initial_salt: &INITIAL_SALT_V2,
        key_label: b"quicv2 key",
        iv_label: b"quicv2 iv",
        hp_label: b"quicv2 hp",
        ku_label: b"quicv2 ku",
        type_bits: [1, 2, 3, 0],
    },
    Version {
        num: PROTOCOL_VERSION_DRAFT29,
        initial_salt: &INITIAL_SALT_DRAFT29,
        key_label: b"quic key",
        iv_label: b"quic iv",
        hp_label: b"quic hp",
        ku_label: b"quic ku",
        type_bits: [0, 1, 2, 3],
    },
];

/// Returns the version properties for the given version number, if it is
/// supported.
pub fn lookup(num: u32) -> Option<&'static Version> {
    VERSIONS.iter().find(|v| v.num == num)
}

/// Returns true if the given protocol version is supported.
pub fn version_is_supported(num: u32) -> bool {
    lookup(num).is_some()
}

/// Iterates over the supported version numbers, in preference order.
pub fn supported() -> impl Iterator<Item = u32> {
    VERSIONS.iter().map(|v| v.num)
}

/// Returns true if `to` is a compatible upgrade of `from`.
///
/// Only v1 to v2 is compatible.
pub fn is_compatible(from: u32, to: u32) -> bool {
    from == to || (from == PROTOCOL_VERSION_V1 && to == PROTOCOL_VERSION_V2)
}
