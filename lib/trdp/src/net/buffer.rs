//! A bounded FIFO byte buffer used for TCP stream reassembly and write
//! buffering. Data is appended at the tail and consumed from the head; the
//! storage compacts itself once the dead prefix grows past half the
//! capacity.

use std::io;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer { data: Vec::with_capacity(capacity.min(4096)), head: 0, capacity }
    }

    /// The number of unconsumed bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Slice containing the unconsumed data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Drops `count` bytes off the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        self.compact();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Appends bytes at the tail; fails when the buffer would exceed its
    /// capacity.
    pub fn extend(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.free_capacity() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads from the supplied reader until the buffer is full or the reader
    /// would block. `WouldBlock` propagates as an error after any amount of
    /// data was read; a zero-byte read (EOF on sockets) ends the loop with
    /// the byte count so far.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        while self.len() < self.capacity {
            let want = chunk.len().min(self.free_capacity());
            let count = match reader.read(&mut chunk[..want]) {
                Ok(count) => count,
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock && total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            };
            if count == 0 {
                return Ok(total);
            }
            self.data.extend_from_slice(&chunk[..count]);
            total += count;
        }
        Ok(total)
    }

    /// Writes the buffered data to the supplied writer, consuming whatever
    /// was accepted. `WouldBlock` after partial progress reports the
    /// progress.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            let count = match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => count,
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock && total > 0 {
                        return Ok(total);
                    }
                    return Err(err);
                }
            };
            self.head += count;
            total += count;
        }
        self.compact();
        Ok(total)
    }

    fn compact(&mut self) {
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > self.capacity / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
