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

//! Handshake data carried in CRYPTO frames.

use std::cmp;

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::Error;
use crate::Result;

/// A chunk of received data starting at a given offset.
#[derive(Debug)]
struct Chunk {
    data: Vec<u8>,

    /// Position of the first unconsumed byte in `data`.
    pos: usize,

    /// Offset of the first unconsumed byte.
    off: u64,
}

impl Chunk {
    fn new(data: &[u8], off: u64) -> Chunk {
        Chunk {
            data: data.to_vec(),
            pos: 0,
            off,
        }
    }

    fn off(&self) -> u64 {
        self.off
    }

    fn max_off(&self) -> u64 {
        self.off + self.len() as u64
    }

    fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn consume(&mut self, count: usize) {
        self.pos += count;
        self.off += count as u64;
    }

    /// Splits the chunk in two at `at` (relative to the unconsumed data),
    /// returning the tail.
    fn split_off(&mut self, at: usize) -> Chunk {
        let tail = self.data.split_off(self.pos + at);

        Chunk {
            data: tail,
            pos: 0,
            off: self.off + at as u64,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

/// Receive side of a crypto stream.
///
/// Out of order fragments are buffered by offset. Only the contiguous
/// prefix starting at the read offset can be read.
#[derive(Debug, Default)]
pub struct CryptoRecv {
    /// Buffered chunks that have not been read yet, keyed by their max
    /// offset.
    data: BTreeMap<u64, Chunk>,

    /// The lowest offset that has yet to be read.
    off: u64,

    /// The highest offset received.
    len: u64,

    /// How far beyond the read offset data may be buffered.
    max_buffered: u64,
}

impl CryptoRecv {
    pub fn new(max_buffered: u64) -> CryptoRecv {
        CryptoRecv {
            max_buffered,
            ..Default::default()
        }
    }

    /// Inserts a fragment.
    ///
    /// Data already read or already buffered is ignored.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let max_off = off + data.len() as u64;

        if max_off > self.off + self.max_buffered {
            return Err(Error::CryptoBufferExceeded);
        }

        // Fully duplicate, or empty.
        if self.off >= max_off {
            return Ok(());
        }

        let mut tmp_bufs = VecDeque::with_capacity(2);
        tmp_bufs.push_back(Chunk::new(data, off));

        'tmp: while let Some(mut buf) = tmp_bufs.pop_front() {
            // Discard incoming data below the read offset.
            if self.off_front() > buf.off() {
                buf = buf.split_off((self.off_front() - buf.off()) as usize);
            }

            if buf.off() < self.len {
                for b in self.data.range(buf.off()..).map(|(_, b)| b) {
                    let off = buf.off();

                    // We are past the current buffer.
                    if b.off() > buf.max_off() {
                        break;
                    }

                    // New buffer is fully contained in existing buffer.
                    if off >= b.off() && buf.max_off() <= b.max_off() {
                        continue 'tmp;
                    }

                    // New buffer's start overlaps existing buffer.
                    if off >= b.off() && off < b.max_off() {
                        buf = buf.split_off((b.max_off() - off) as usize);
                    }

                    // New buffer's end overlaps existing buffer.
                    if off < b.off() && buf.max_off() > b.off() {
                        tmp_bufs
                            .push_back(buf.split_off((b.off() - off) as usize));
                    }
                }
            }

            if buf.is_empty() {
                continue;
            }

            self.len = cmp::max(self.len, buf.max_off());
            self.data.insert(buf.max_off(), buf);
        }

        Ok(())
    }

    /// Reads contiguous data into `out`, returning the number of bytes read.
    ///
    /// Returns `Done` when no data is available at the read offset.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut len = 0;
        let mut cap = out.len();

        if !self.ready() {
            return Err(Error::Done);
        }

        while cap > 0 && self.ready() {
            let mut entry = match self.data.first_entry() {
                Some(entry) => entry,
                None => break,
            };

            let buf = entry.get_mut();

            let buf_len = cmp::min(buf.len(), cap);

            out[len..len + buf_len].copy_from_slice(&buf.as_slice()[..buf_len]);

            self.off += buf_len as u64;

            len += buf_len;
            cap -= buf_len;

            if buf_len < buf.len() {
                buf.consume(buf_len);

                // We reached the maximum capacity, so end here.
                break;
            }

            entry.remove();
        }

        Ok(len)
    }

    /// Returns true if data is available at the read offset.
    pub fn ready(&self) -> bool {
        match self.data.first_key_value() {
            Some((_, buf)) => buf.off() == self.off,
            _ => false,
        }
    }

    /// Length of the contiguous data available at the read offset.
    pub fn readable(&self) -> usize {
        let mut end = self.off;

        for buf in self.data.values() {
            if buf.off() > end {
                break;
            }

            end = cmp::max(end, buf.max_off());
        }

        (end - self.off) as usize
    }

    /// The read offset.
    pub fn off(&self) -> u64 {
        self.off
    }

    fn off_front(&self) -> u64 {
        self.off
    }
}

/// Send side of a crypto stream.
///
/// Data is produced by the TLS stack, made ready by flushing, and handed to
/// the network from the sent offset. Lost data rewinds the sent offset so it
/// is sent again as is.
#[derive(Debug, Default)]
pub struct CryptoSend {
    /// Unacknowledged data, starting at `acked_off`.
    buf: VecDeque<u8>,

    /// Next offset to produce.
    produce_off: u64,

    /// End of the data available for sending.
    ready_off: u64,

    /// Data below this offset was handed to the network.
    sent_off: u64,

    /// Data below this offset was acknowledged.
    acked_off: u64,

    /// Acknowledged ranges above `acked_off`.
    acked: BTreeMap<u64, u64>,

    /// Cap on buffered unacknowledged data.
    max_in_flight: u64,
}

impl CryptoSend {
    pub fn new(max_in_flight: u64) -> CryptoSend {
        CryptoSend {
            max_in_flight,
            ..Default::default()
        }
    }

    /// Buffers handshake data produced by the TLS stack.
    ///
    /// Returns `Done` without buffering anything if this would exceed the
    /// in-flight cap. The caller must retry once data is acknowledged.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let unacked = self.produce_off - self.acked_off;

        if unacked + data.len() as u64 > self.max_in_flight {
            return Err(Error::Done);
        }

        self.buf.extend(data);
        self.produce_off += data.len() as u64;

        Ok(())
    }

    /// Makes all produced data available for sending.
    pub fn flush(&mut self) {
        self.ready_off = self.produce_off;
    }

    /// Copies the next data to send into `out`, returning its offset and
    /// length.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<(u64, usize)> {
        if self.sent_off >= self.ready_off || out.is_empty() {
            return Err(Error::Done);
        }

        let off = self.sent_off;
        let len = cmp::min(out.len() as u64, self.ready_off - off) as usize;

        let start = (off - self.acked_off) as usize;

        let data = self.buf.range(start..start + len);

        for (o, b) in out[..len].iter_mut().zip(data) {
            *o = *b;
        }

        self.sent_off += len as u64;

        Ok((off, len))
    }

    /// Marks a range of sent data as lost, so it is sent again.
    pub fn on_lost(&mut self, off: u64, len: usize) {
        let max_off = off + len as u64;

        if max_off <= self.acked_off {
            return;
        }

        self.sent_off = cmp::min(self.sent_off, cmp::max(off, self.acked_off));
    }

    /// Marks a range of sent data as acknowledged, releasing the contiguous
    /// acknowledged prefix.
    pub fn on_acked(&mut self, off: u64, len: usize) {
        let max_off = cmp::min(off + len as u64, self.ready_off);

        if max_off <= self.acked_off {
            return;
        }

        let end = self.acked.entry(off).or_insert(max_off);
        *end = cmp::max(*end, max_off);

        let mut new_acked = self.acked_off;

        while let Some(entry) = self.acked.first_entry() {
            if *entry.key() > new_acked {
                break;
            }

            new_acked = cmp::max(new_acked, *entry.get());
            entry.remove();
        }

        let released = (new_acked - self.acked_off) as usize;
        self.buf.drain(..released);
        self.acked_off = new_acked;
        self.sent_off = cmp::max(self.sent_off, new_acked);
    }

    /// Returns true if there is data to send.
    pub fn ready(&self) -> bool {
        self.sent_off < self.ready_off
    }

    pub fn produce_off(&self) -> u64 {
        self.produce_off
    }

    pub fn ready_off(&self) -> u64 {
        self.ready_off
    }

    pub fn sent_off(&self) -> u64 {
        self.sent_off
    }

    pub fn acked_off(&self) -> u64 {
        self.acked_off
    }

    /// Bytes produced but not acknowledged yet.
    pub fn unacked(&self) -> u64 {
        self.produce_off - self.acked_off
    }
}

/// The crypto stream of an encryption level.
#[derive(Debug)]
pub struct CryptoStream {
    pub recv: CryptoRecv,

    pub send: CryptoSend,
}

impl CryptoStream {
    pub fn new(max_rx_buffered: u64, max_tx_in_flight: u64) -> CryptoStream {
        CryptoStream {
            recv: CryptoRecv::new(max_rx_buffered),
            send: CryptoSend::new(max_tx_in_flight),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassemble_out_of_order() {
        let mut recv = CryptoRecv::new(4096);
        let mut out = [0; 64];

        let data: Vec<u8> = (0..30).collect();

        recv.write(0, &data[0..10]).unwrap();
        assert_eq!(recv.readable(), 10);

        recv.write(20, &data[20..30]).unwrap();
        assert_eq!(recv.readable(), 10);

        recv.write(10, &data[10..20]).unwrap();
        assert_eq!(recv.readable(), 30);

        // Replaying the first fragment changes nothing.
        recv.write(0, &data[0..10]).unwrap();
        assert_eq!(recv.readable(), 30);

        assert_eq!(recv.emit(&mut out), Ok(30));
        assert_eq!(&out[..30], &data[..]);
        assert_eq!(recv.off(), 30);

        recv.write(0, &data[0..10]).unwrap();
        assert!(!recv.ready());
        assert_eq!(recv.emit(&mut out), Err(Error::Done));
    }

    #[test]
    fn prefix_only_after_gap_filled() {
        let mut recv = CryptoRecv::new(4096);
        let mut out = [0; 64];

        let data: Vec<u8> = (0..30).collect();

        recv.write(0, &data[0..10]).unwrap();
        recv.write(20, &data[20..30]).unwrap();

        assert_eq!(recv.emit(&mut out), Ok(10));
        assert_eq!(recv.emit(&mut out), Err(Error::Done));

        recv.write(10, &data[10..20]).unwrap();
        assert_eq!(recv.emit(&mut out), Ok(20));
        assert_eq!(&out[..20], &data[10..30]);
    }

    #[test]
    fn overlapping_fragments() {
        let mut recv = CryptoRecv::new(4096);
        let mut out = [0; 64];

        let data: Vec<u8> = (0..40).collect();

        recv.write(5, &data[5..15]).unwrap();
        recv.write(25, &data[25..30]).unwrap();

        // Covers both existing chunks and the gaps around them.
        recv.write(0, &data[0..40]).unwrap();
        assert_eq!(recv.readable(), 40);

        assert_eq!(recv.emit(&mut out[..7]), Ok(7));
        assert_eq!(&out[..7], &data[0..7]);

        // Partially read data is trimmed from new fragments.
        recv.write(3, &data[3..12]).unwrap();
        assert_eq!(recv.emit(&mut out), Ok(33));
        assert_eq!(&out[..33], &data[7..40]);
    }

    #[test]
    fn recv_buffer_limit() {
        let mut recv = CryptoRecv::new(16);

        assert_eq!(recv.write(10, &[0; 7]), Err(Error::CryptoBufferExceeded));
        assert!(recv.write(10, &[0; 6]).is_ok());
    }

    #[test]
    fn send_offsets() {
        let mut send = CryptoSend::new(4096);
        let mut out = [0; 8];

        let data: Vec<u8> = (0..20).collect();
        send.write(&data).unwrap();

        // Nothing is sent before the flight is flushed.
        assert_eq!(send.emit(&mut out), Err(Error::Done));
        assert_eq!(send.produce_off(), 20);
        assert_eq!(send.ready_off(), 0);

        send.flush();
        assert!(send.ready());

        assert_eq!(send.emit(&mut out), Ok((0, 8)));
        assert_eq!(&out, &data[0..8]);
        assert_eq!(send.emit(&mut out), Ok((8, 8)));
        assert_eq!(send.sent_off(), 16);

        // Loss rewinds the sent offset, the same bytes are sent again.
        send.on_lost(0, 8);
        assert_eq!(send.sent_off(), 0);
        assert_eq!(send.emit(&mut out), Ok((0, 8)));
        assert_eq!(&out, &data[0..8]);

        send.on_acked(8, 8);
        assert_eq!(send.acked_off(), 0);

        send.on_acked(0, 8);
        assert_eq!(send.acked_off(), 16);
        assert_eq!(send.unacked(), 4);

        // Losing acknowledged data is a no-op.
        send.on_lost(0, 16);
        assert_eq!(send.sent_off(), 16);

        assert_eq!(send.emit(&mut out), Ok((16, 4)));
        assert_eq!(&out[..4], &data[16..20]);
        assert_eq!(send.emit(&mut out), Err(Error::Done));
    }

    #[test]
    fn send_in_flight_cap() {
        let mut send = CryptoSend::new(16);
        let mut out = [0; 16];

        send.write(&[1; 10]).unwrap();

        assert_eq!(send.write(&[2; 7]), Err(Error::Done));
        assert_eq!(send.produce_off(), 10);

        send.write(&[2; 6]).unwrap();
        send.flush();

        assert_eq!(send.emit(&mut out), Ok((0, 16)));
        send.on_acked(0, 10);

        assert!(send.write(&[3; 10]).is_ok());
        assert_eq!(send.unacked(), 16);
    }
}
