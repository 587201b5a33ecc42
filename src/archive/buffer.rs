/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::fmt;

/// Position of a byte in the archive buffer. Buffered objects are named by
/// offset, never by address, because the buffer moves while it grows.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferOffset(usize);

impl BufferOffset {
    #[inline]
    pub(crate) const fn new(offset: usize) -> Self {
        BufferOffset(offset)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BufferOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer+{:#x}", self.0)
    }
}

/// Growable byte image of the heap region. Allocation only ever bumps the
/// used size; new space reads as zero.
#[derive(Default)]
pub struct ArchiveBuffer {
    bytes: Vec<u8>,
}

impl ArchiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn allocate(&mut self, size: usize) -> BufferOffset {
        let offset = self.bytes.len();
        self.bytes.resize(offset + size, 0);
        BufferOffset(offset)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn slice(&self, at: BufferOffset, len: usize) -> &[u8] {
        &self.bytes[at.0..at.0 + len]
    }

    pub fn slice_mut(&mut self, at: BufferOffset, len: usize) -> &mut [u8] {
        &mut self.bytes[at.0..at.0 + len]
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}
