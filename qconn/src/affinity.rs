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

//! Thread affinity of connections.
//!
//! Every connection is mutated by a single owner thread. Moving it to another
//! thread is a handoff: the owner records the target, pushes the connection
//! to the target's mailbox, and only the target thread completes the
//! handoff once it pops it.

use crossbeam::queue::SegQueue;

use crate::Error;
use crate::Result;

/// Index of a worker thread.
pub type ThreadId = usize;

/// Ownership of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// Owned by a thread.
    Owned(ThreadId),

    /// Being moved between threads.
    Handoff { from: ThreadId, to: ThreadId },
}

impl Affinity {
    /// The thread allowed to mutate the connection, `None` while in transit.
    pub fn owner(&self) -> Option<ThreadId> {
        match *self {
            Affinity::Owned(t) => Some(t),

            Affinity::Handoff { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Affinity::Handoff { .. })
    }

    /// Starts a handoff to `to`.
    pub fn start(&mut self, to: ThreadId) -> Result<()> {
        match *self {
            Affinity::Owned(from) => {
                *self = Affinity::Handoff { from, to };
                Ok(())
            },

            Affinity::Handoff { .. } => Err(Error::InvalidState),
        }
    }

    /// Completes a handoff on the receiving thread.
    pub fn complete(&mut self, thread: ThreadId) -> Result<()> {
        match *self {
            Affinity::Handoff { to, .. } if to == thread => {
                *self = Affinity::Owned(thread);
                Ok(())
            },

            _ => Err(Error::InvalidState),
        }
    }
}

/// Queue of connections handed to a thread.
pub struct Mailbox<T> {
    queue: SegQueue<T>,
}

impl<T> Mailbox<T> {
    pub fn push(&self, item: T) {
        self.queue.push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox {
            queue: SegQueue::new(),
        }
    }
}

/// One mailbox per worker thread.
pub struct Mailboxes<T> {
    boxes: Vec<Mailbox<T>>,
}

impl<T> Mailboxes<T> {
    pub fn new(threads: usize) -> Mailboxes<T> {
        Mailboxes {
            boxes: (0..threads).map(|_| Mailbox::default()).collect(),
        }
    }

    /// Queues `item` for `thread`. The item is given back if the thread does
    /// not exist.
    pub fn send(
        &self, thread: ThreadId, item: T,
    ) -> std::result::Result<(), T> {
        match self.boxes.get(thread) {
            Some(mb) => {
                mb.push(item);
                Ok(())
            },

            None => Err(item),
        }
    }

    pub fn get(&self, thread: ThreadId) -> Option<&Mailbox<T>> {
        self.boxes.get(thread)
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
