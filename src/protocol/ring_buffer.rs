use thiserror::Error;

/// Errors raised by [`RingBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    #[error(
        "invalid ring buffer geometry: capacity={capacity}, growth={multiplier}x+{constant}"
    )]
    InvalidGeometry {
        capacity: usize,
        multiplier: usize,
        constant: usize,
    },
    #[error("requested {requested} bytes but only {available} are buffered")]
    OutOfRange { requested: usize, available: usize },
}

/// Growable circular byte buffer.
///
/// Appends never fail: when free space runs out the storage is reallocated to
/// `capacity * multiplier + constant`, repeated until the write fits. Byte
/// order is preserved across growth and the buffer never shrinks on its own.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    size: usize,
    grow_multiplier: usize,
    grow_constant: usize,
}

impl RingBuffer {
    pub fn new(
        capacity: usize,
        grow_multiplier: usize,
        grow_constant: usize,
    ) -> Result<Self, RingBufferError> {
        if capacity == 0 || grow_multiplier == 0 || (grow_multiplier == 1 && grow_constant == 0) {
            return Err(RingBufferError::InvalidGeometry {
                capacity,
                multiplier: grow_multiplier,
                constant: grow_constant,
            });
        }

        Ok(Self {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
            size: 0,
            grow_multiplier,
            grow_constant,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop every buffered byte without releasing storage.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
    }

    pub fn put(&mut self, src: &[u8]) {
        let count = src.len();
        if count == 0 {
            return;
        }
        if count > self.capacity() - self.size {
            self.grow(self.size + count);
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.tail);
        self.data[self.tail..self.tail + first].copy_from_slice(&src[..first]);
        let rest = count - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }

        self.tail = (self.tail + count) % capacity;
        self.size += count;
    }

    pub fn put_byte(&mut self, byte: u8) {
        self.put(&[byte]);
    }

    /// Remove and return exactly `count` bytes from the front.
    pub fn get(&mut self, count: usize) -> Result<Vec<u8>, RingBufferError> {
        let out = self.copy_front(count)?;
        self.advance(count);
        Ok(out)
    }

    pub fn get_byte(&mut self) -> Result<u8, RingBufferError> {
        if self.size == 0 {
            return Err(RingBufferError::OutOfRange {
                requested: 1,
                available: 0,
            });
        }
        let byte = self.data[self.head];
        self.advance(1);
        Ok(byte)
    }

    /// Discard `count` bytes from the front without copying them.
    pub fn skip(&mut self, count: usize) -> Result<(), RingBufferError> {
        if count > self.size {
            return Err(RingBufferError::OutOfRange {
                requested: count,
                available: self.size,
            });
        }
        self.advance(count);
        Ok(())
    }

    /// Copy the buffered bytes in order, leaving the buffer untouched.
    pub fn peek_to_vec(&self) -> Vec<u8> {
        self.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.size).map(move |offset| self.at(offset))
    }

    pub fn contains(&self, byte: u8) -> bool {
        self.index_of(byte).is_some()
    }

    /// Offset of the first occurrence of `byte`, counted from the front.
    pub fn index_of(&self, byte: u8) -> Option<usize> {
        self.index_of_from(byte, 0)
    }

    /// Like [`index_of`](Self::index_of) but ignores the first `start` bytes.
    pub fn index_of_from(&self, byte: u8, start: usize) -> Option<usize> {
        (start..self.size).find(|&offset| self.at(offset) == byte)
    }

    /// Offset of the first occurrence of `seq`, counted from the front.
    ///
    /// Greedy matcher: on a mismatch after a partial match the scan restarts
    /// one byte past the start of the broken candidate, so self-overlapping
    /// patterns resolve to the same offset a naive search would find.
    pub fn index_of_seq(&self, seq: &[u8]) -> Option<usize> {
        if seq.is_empty() {
            return Some(0);
        }
        if self.size < seq.len() {
            return None;
        }

        let mut matched = 0usize;
        let mut candidate: Option<usize> = None;
        let mut offset = 0usize;

        while offset < self.size {
            if self.at(offset) == seq[matched] {
                if matched == 0 {
                    candidate = Some(offset);
                }
                matched += 1;
                if matched == seq.len() {
                    return candidate;
                }
            } else {
                matched = 0;
                if let Some(start) = candidate.take() {
                    offset = start;
                }
            }
            offset += 1;
        }

        None
    }

    fn at(&self, offset: usize) -> u8 {
        self.data[(self.head + offset) % self.capacity()]
    }

    fn copy_front(&self, count: usize) -> Result<Vec<u8>, RingBufferError> {
        if count > self.size {
            return Err(RingBufferError::OutOfRange {
                requested: count,
                available: self.size,
            });
        }

        let capacity = self.capacity();
        let first = count.min(capacity - self.head);
        let mut out = Vec::with_capacity(count);
        out.extend_from_slice(&self.data[self.head..self.head + first]);
        out.extend_from_slice(&self.data[..count - first]);
        Ok(out)
    }

    fn advance(&mut self, count: usize) {
        self.head = (self.head + count) % self.capacity();
        self.size -= count;
        if self.size == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    fn grow(&mut self, target: usize) {
        let mut new_capacity = self.capacity();
        while new_capacity < target {
            new_capacity = new_capacity * self.grow_multiplier + self.grow_constant;
        }

        let mut data = vec![0; new_capacity];
        for (slot, byte) in data.iter_mut().zip(self.iter()) {
            *slot = byte;
        }
        log::trace!(
            "ring buffer grew {} -> {} bytes ({} buffered)",
            self.capacity(),
            new_capacity,
            self.size
        );

        self.data = data;
        self.head = 0;
        self.tail = self.size % new_capacity;
    }
}
