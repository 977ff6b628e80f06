// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable receive buffer for the framed DNS byte stream.

/// A growable, contiguous byte buffer with separate read and write offsets.
///
/// Bytes are appended at the write offset and consumed from the read offset;
/// consumed space is reclaimed by compaction once the read offset outgrows
/// the initial capacity.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    desired_capacity: usize,
}

impl Buffer {
    /// Creates a new buffer that will allocate `desired_capacity` up front.
    pub(crate) fn new(desired_capacity: usize) -> Self {
        let desired_capacity = desired_capacity.next_power_of_two();
        Self {
            data: vec![0; desired_capacity],
            read_offset: 0,
            write_offset: 0,
            desired_capacity,
        }
    }

    /// Number of unconsumed bytes available to read.
    pub(crate) fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// The unconsumed bytes.
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.read_offset..self.write_offset]
    }

    /// Returns a writable region of at least `len` bytes, growing the
    /// underlying storage as needed. Call [`Buffer::mark_written`] with the
    /// number of bytes actually filled in.
    pub(crate) fn space(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() - self.write_offset < len {
            self.grow(len);
        }
        &mut self.data[self.write_offset..]
    }

    /// Marks `amount` bytes as written past the write offset.
    pub(crate) fn mark_written(&mut self, amount: usize) {
        self.write_offset = self.data.len().min(self.write_offset + amount);
    }

    /// Consumes `amount` bytes from the front of the readable region.
    pub(crate) fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.write_offset.min(self.read_offset + amount);
        self.compact();
    }

    fn grow(&mut self, needed: usize) {
        // Reclaim consumed space before allocating more.
        if self.read_offset > 0 {
            self.data.copy_within(self.read_offset..self.write_offset, 0);
            self.write_offset -= self.read_offset;
            self.read_offset = 0;
        }
        let wanted = (self.write_offset + needed).next_power_of_two();
        if wanted > self.data.len() {
            self.data.resize(wanted, 0);
        }
    }

    fn compact(&mut self) {
        if self.remaining() == 0 {
            self.read_offset = 0;
            self.write_offset = 0;
            if self.data.len() > self.desired_capacity {
                self.data.truncate(self.desired_capacity);
                self.data.shrink_to_fit();
            }
            return;
        }

        // A read offset past the initial capacity means a significant run of
        // dead space up front; shift the live bytes down to make room.
        if self.read_offset > self.desired_capacity {
            self.data.copy_within(self.read_offset..self.write_offset, 0);
            self.write_offset = self.remaining();
            self.read_offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = Buffer::new(16);
        buf.space(5)[..5].copy_from_slice(b"hello");
        buf.mark_written(5);

        assert_eq!(buf.remaining(), 5);
        assert_eq!(buf.as_slice(), b"hello");

        buf.mark_read(5);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn partial_reads_leave_tail() {
        let mut buf = Buffer::new(16);
        buf.space(6)[..6].copy_from_slice(b"abcdef");
        buf.mark_written(6);

        buf.mark_read(2);
        assert_eq!(buf.as_slice(), b"cdef");
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new(4);
        let payload = [7u8; 100];
        buf.space(payload.len())[..payload.len()].copy_from_slice(&payload);
        buf.mark_written(payload.len());

        assert_eq!(buf.remaining(), 100);
        assert_eq!(buf.as_slice(), &payload[..]);
    }

    #[test]
    fn compaction_reclaims_consumed_space() {
        let mut buf = Buffer::new(4);
        for _ in 0..8 {
            buf.space(4)[..4].copy_from_slice(b"data");
            buf.mark_written(4);
        }
        buf.mark_read(28);

        // After compaction the remaining 4 bytes sit at the front.
        assert_eq!(buf.as_slice(), b"data");
        buf.space(4)[..4].copy_from_slice(b"more");
        buf.mark_written(4);
        assert_eq!(buf.as_slice(), b"datamore");
    }

    #[test]
    fn empty_buffer_resets_offsets() {
        let mut buf = Buffer::new(8);
        buf.space(200);
        buf.mark_written(200);
        buf.mark_read(200);

        assert_eq!(buf.remaining(), 0);
        buf.space(3)[..3].copy_from_slice(b"abc");
        buf.mark_written(3);
        assert_eq!(buf.as_slice(), b"abc");
    }
}
