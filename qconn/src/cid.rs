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

use std::borrow::Borrow;
use std::collections::BTreeMap;

use parking_lot::RwLock;

use smallvec::SmallVec;

use crate::Error;
use crate::Result;

/// Length of the connection IDs chosen by this endpoint.
pub const LOCAL_CID_LEN: usize = 8;

/// Minimum length of the destination connection ID of a client Initial.
pub const ODCID_MIN_LEN: usize = 8;

/// A QUIC connection ID.
///
/// Peer-chosen IDs may be anywhere between 0 and 20 bytes long.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(SmallVec<[u8; 20]>);

impl ConnectionId {
    pub fn from_slice(buf: &[u8]) -> ConnectionId {
        ConnectionId(SmallVec::from_slice(buf))
    }

    pub fn from_vec(v: Vec<u8>) -> ConnectionId {
        ConnectionId(SmallVec::from_vec(v))
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for ConnectionId {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in self.0.iter() {
            write!(f, "{c:02x}")?;
        }

        Ok(())
    }
}

/// Derives the local connection ID with sequence number `seq` from the
/// connection's hash seed.
pub fn derive_local_cid(hash64: u64, seq: u64) -> ConnectionId {
    let mut input = [0; 16];
    input[..8].copy_from_slice(&hash64.to_be_bytes());
    input[8..].copy_from_slice(&seq.to_be_bytes());

    let digest = ring::digest::digest(&ring::digest::SHA256, &input);

    ConnectionId::from_slice(&digest.as_ref()[..LOCAL_CID_LEN])
}

/// The connection IDs this endpoint issued for a connection.
pub struct LocalCids {
    hash64: u64,

    /// Next sequence number to use.
    next_seq: u64,

    /// Active connection IDs, by sequence number.
    active: BTreeMap<u64, ConnectionId>,

    /// The maximum number of active connection IDs the peer accepts.
    limit: usize,
}

impl LocalCids {
    /// Creates the set with its first connection ID (sequence number 0)
    /// already issued.
    pub fn new(hash64: u64, limit: usize) -> LocalCids {
        let mut active = BTreeMap::new();
        active.insert(0, derive_local_cid(hash64, 0));

        LocalCids {
            hash64,
            next_seq: 1,
            active,
            limit: limit.max(1),
        }
    }

    /// Issues a new connection ID, returning its sequence number.
    pub fn issue(&mut self) -> Result<(u64, ConnectionId)> {
        if self.active.len() >= self.limit {
            return Err(Error::IdLimit);
        }

        let seq = self.next_seq;
        let cid = derive_local_cid(self.hash64, seq);

        self.next_seq += 1;
        self.active.insert(seq, cid.clone());

        Ok((seq, cid))
    }

    /// Retires the connection ID with the given sequence number.
    pub fn retire(&mut self, seq: u64) -> Option<ConnectionId> {
        self.active.remove(&seq)
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
    }

    /// The first connection ID, unless it was retired.
    pub fn first(&self) -> Option<&ConnectionId> {
        self.active.get(&0)
    }

    pub fn contains(&self, cid: &[u8]) -> bool {
        self.active.values().any(|c| c.as_ref() == cid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ConnectionId)> + '_ {
        self.active.iter().map(|(seq, cid)| (*seq, cid))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Identifies a connection inside the proxy's connection registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub usize);

/// Endpoint-wide index routing connection IDs to connections.
///
/// Shared by all dispatch threads. The index never owns connections, it only
/// stores registry handles.
#[derive(Default)]
pub struct CidIndex {
    tree: RwLock<BTreeMap<ConnectionId, ConnectionHandle>>,
}

impl CidIndex {
    pub fn new() -> CidIndex {
        Default::default()
    }

    /// Associates `cid` with `conn`.
    ///
    /// Fails if the ID already routes to a different connection.
    pub fn register(
        &self, cid: &ConnectionId, conn: ConnectionHandle,
    ) -> Result<()> {
        let mut tree = self.tree.write();

        match tree.get(cid.as_ref()) {
            Some(h) if *h != conn => Err(Error::InvalidState),

            Some(_) => Ok(()),

            None => {
                tree.insert(cid.clone(), conn);
                Ok(())
            },
        }
    }

    pub fn unregister(&self, cid: &[u8]) -> Option<ConnectionHandle> {
        self.tree.write().remove(cid)
    }

    pub fn lookup(&self, cid: &[u8]) -> Option<ConnectionHandle> {
        self.tree.read().get(cid).copied()
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}
