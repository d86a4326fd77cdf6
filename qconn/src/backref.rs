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

//! Back-references from introspection iterators to connections.
//!
//! A foreign thread walking the connections (for example to dump them)
//! attaches a [`BackRef`] to the connection it is about to visit. When the
//! connection goes away first, every attached reference is marked detached
//! so the walker moves on instead of touching freed state.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;

use parking_lot::Mutex;

/// Global generation counter. A walker started at generation `n` skips
/// connections created after it started.
static EPOCH: AtomicCell<u64> = AtomicCell::new(0);

/// Returns the current generation.
pub fn current_epoch() -> u64 {
    EPOCH.load()
}

/// Starts a new generation, returning the generation a walker must use.
pub fn next_epoch() -> u64 {
    EPOCH.fetch_add(1)
}

/// A walker's reference to a connection.
#[derive(Debug, Default)]
pub struct BackRef {
    detached: AtomicCell<bool>,
}

impl BackRef {
    /// Whether the connection went away while referenced.
    pub fn is_detached(&self) -> bool {
        self.detached.load()
    }
}

/// The back-references attached to one connection.
#[derive(Debug)]
pub struct BackRefs {
    refs: Mutex<Vec<Arc<BackRef>>>,

    epoch: u64,
}

impl BackRefs {
    pub fn new(epoch: u64) -> BackRefs {
        BackRefs {
            refs: Mutex::new(Vec::new()),
            epoch,
        }
    }

    /// The generation the connection was created in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a walker started at `walker_epoch` may visit the connection.
    pub fn visible_to(&self, walker_epoch: u64) -> bool {
        self.epoch <= walker_epoch
    }

    pub fn attach(&self) -> Arc<BackRef> {
        let r = Arc::new(BackRef::default());

        self.refs.lock().push(Arc::clone(&r));

        r
    }

    /// Removes a reference once the walker is done with the connection.
    pub fn detach(&self, r: &Arc<BackRef>) {
        self.refs.lock().retain(|x| !Arc::ptr_eq(x, r));
    }

    /// Detaches every reference. Called before the connection is freed.
    pub fn detach_all(&self) {
        for r in self.refs.lock().drain(..) {
            r.detached.store(true);
        }
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }
}

impl Drop for BackRefs {
    fn drop(&mut self) {
        self.detach_all();
    }
}
