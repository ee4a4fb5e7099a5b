use core::cmp;
use core::sync::atomic::{AtomicU16, Ordering};

/// A fixed-capacity byte ring.
///
/// Used for the driver's read and write data buffers, and suitable as the
/// backing store of a buffered serial port implementation. The fill level is
/// kept in an explicit counter rather than derived from head/tail equality,
/// so full and empty are never ambiguous. The counter is atomic: a platform
/// where an ISR produces into one end can still observe sane values through
/// `available`/`space`, although the ring itself provides no locking.
///
/// All operations are O(1) in the number of bytes moved.
#[derive(Debug)]
pub struct RingBuffer<const N: usize> {
    buffer: [u8; N],
    write_at: u16,
    read_at: u16,
    available: AtomicU16,
}

impl<const N: usize> RingBuffer<N> {
    pub const fn new() -> Self {
        assert!(N > 0 && N <= u16::MAX as usize);
        RingBuffer {
            buffer: [0; N],
            write_at: 0,
            read_at: 0,
            available: AtomicU16::new(0),
        }
    }

    /// Push a single byte. If the ring is full, the oldest byte is dropped
    /// to make room.
    pub fn push(&mut self, byte: u8) {
        if self.is_full() {
            self.read_at = wrap::<N>(self.read_at);
        } else {
            self.available
                .store(self.available() + 1, Ordering::Release);
        }
        self.buffer[self.write_at as usize] = byte;
        self.write_at = wrap::<N>(self.write_at);
    }

    /// Copy as much of `data` into the ring as fits, returning the number of
    /// bytes copied.
    pub fn push_slice(&mut self, data: &[u8]) -> u16 {
        let count = cmp::min(data.len(), self.space() as usize);
        for &byte in &data[..count] {
            self.buffer[self.write_at as usize] = byte;
            self.write_at = wrap::<N>(self.write_at);
        }
        self.available
            .store(self.available() + count as u16, Ordering::Release);
        count as u16
    }

    /// Pull the oldest byte. The caller must ensure the ring is not empty;
    /// pulling from an empty ring returns stale data.
    pub fn pull(&mut self) -> u8 {
        debug_assert!(!self.is_empty());
        let byte = self.buffer[self.read_at as usize];
        self.read_at = wrap::<N>(self.read_at);
        let available = self.available();
        if available > 0 {
            self.available.store(available - 1, Ordering::Release);
        }
        byte
    }

    /// Pull up to `data.len()` bytes, returning the number of bytes copied.
    pub fn pull_slice(&mut self, data: &mut [u8]) -> u16 {
        let count = cmp::min(data.len(), self.available() as usize);
        for slot in &mut data[..count] {
            *slot = self.buffer[self.read_at as usize];
            self.read_at = wrap::<N>(self.read_at);
        }
        self.available
            .store(self.available() - count as u16, Ordering::Release);
        count as u16
    }

    /// Read the oldest byte without removing it. As with [`pull`],
    /// the caller must check for emptiness first.
    ///
    /// [`pull`]: RingBuffer::pull
    pub fn peek(&self) -> u8 {
        debug_assert!(!self.is_empty());
        self.buffer[self.read_at as usize]
    }

    /// Empty the ring by resetting all counters.
    pub fn flush(&mut self) {
        self.write_at = 0;
        self.read_at = 0;
        self.available.store(0, Ordering::Release);
    }

    pub fn available(&self) -> u16 {
        self.available.load(Ordering::Acquire)
    }

    pub fn space(&self) -> u16 {
        N as u16 - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.available() == N as u16
    }

    pub const fn capacity(&self) -> u16 {
        N as u16
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap<const N: usize>(head: u16) -> u16 {
    if head + 1 >= N as u16 {
        0
    } else {
        head + 1
    }
}
