use std::io::{self, IoSlice, Write};

/// Bytes that were read from one end of a relay and are waiting to be written to the other.
pub(super) struct RingBuffer {
    storage: Box<[u8; Self::LEN]>,
    // Index of the oldest byte.
    start: usize,
    // Number of bytes waiting.
    len: usize,
}

impl RingBuffer {
    pub(super) const LEN: usize = 8 * 1024;

    pub(super) fn new() -> Self {
        Self {
            storage: Box::new([0; Self::LEN]),
            start: 0,
            len: 0,
        }
    }

    pub(super) fn is_full(&self) -> bool {
        self.len == Self::LEN
    }

    pub(super) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(super) fn free_space(&self) -> usize {
        Self::LEN - self.len
    }

    /// Append as much of `data` as fits and return how many bytes were taken.
    pub(super) fn push(&mut self, data: &[u8]) -> usize {
        let taken = data.len().min(self.free_space());
        let end = (self.start + self.len) % Self::LEN;

        // The free section may wrap around the end of the storage.
        let first = taken.min(Self::LEN - end);
        self.storage[end..end + first].copy_from_slice(&data[..first]);
        self.storage[..taken - first].copy_from_slice(&data[first..taken]);

        self.len += taken;
        debug_assert!(self.len <= Self::LEN);

        taken
    }

    /// The waiting bytes, oldest first. The second slice is empty unless the data wraps around.
    pub(super) fn as_slices(&self) -> (&[u8], &[u8]) {
        let end = self.start + self.len;
        if end <= Self::LEN {
            (&self.storage[self.start..end], &[])
        } else {
            (
                &self.storage[self.start..],
                &self.storage[..end % Self::LEN],
            )
        }
    }

    pub(super) fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    fn consume(&mut self, amount: usize) {
        debug_assert!(amount <= self.len);
        self.len -= amount;
        self.start = if self.len == 0 {
            0
        } else {
            (self.start + amount) % Self::LEN
        };
    }

    /// Write as many waiting bytes as `write` accepts in one call.
    // rustc 1.77.1 clippy gives false diagnostics, https://github.com/rust-lang/rust-clippy/issues/12519
    #[allow(clippy::unused_io_amount)]
    pub(super) fn remove<W: Write>(&mut self, write: &mut W) -> io::Result<usize> {
        let removed_len = match self.as_slices() {
            (first, []) => write.write(first)?,
            (first, second) => write.write_vectored(&[IoSlice::new(first), IoSlice::new(second)])?,
        };

        self.consume(removed_len);

        Ok(removed_len)
    }
}
