/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! How references are stored inside objects.
//!
//! With compressed oops a reference is a 32-bit value `(addr - base) >> shift`
//! and zero always means null. Without them a reference is the full 64-bit
//! address.
use crate::utils::{get_u32, get_u64, put_u32, put_u64};
use std::fmt;

pub const UNSCALED_OOP_HEAP_MAX: u64 = 1 << 32;
pub const LOG_OBJECT_ALIGNMENT: u32 = 3;
pub const OOP_ENCODING_HEAP_MAX: u64 = UNSCALED_OOP_HEAP_MAX << LOG_OBJECT_ALIGNMENT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NarrowOopMode {
    /// Base 0, shift 0; heap ends below 4G.
    Unscaled = 0,
    /// Base 0, shift 3; heap ends below 32G.
    ZeroBased = 1,
    /// Base aligned so that it can be or-ed in instead of added.
    DisjointBase = 2,
    /// Base just below the heap start.
    HeapBased = 3,
}

impl NarrowOopMode {
    pub fn from_u32(value: u32) -> Option<NarrowOopMode> {
        Some(match value {
            0 => NarrowOopMode::Unscaled,
            1 => NarrowOopMode::ZeroBased,
            2 => NarrowOopMode::DisjointBase,
            3 => NarrowOopMode::HeapBased,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            NarrowOopMode::Unscaled => "unscaled",
            NarrowOopMode::ZeroBased => "zero based",
            NarrowOopMode::DisjointBase => "disjoint base",
            NarrowOopMode::HeapBased => "heap based",
        }
    }
}

impl fmt::Display for NarrowOopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NarrowOopEncoding {
    pub base: u64,
    pub shift: u32,
    pub mode: NarrowOopMode,
}

impl NarrowOopEncoding {
    pub const fn new(base: u64, shift: u32, mode: NarrowOopMode) -> Self {
        Self { base, shift, mode }
    }

    /// Picks the cheapest encoding able to address `[start, end)`.
    pub fn for_heap(start: u64, end: u64, page_size: u64) -> Self {
        if end <= UNSCALED_OOP_HEAP_MAX {
            Self::new(0, 0, NarrowOopMode::Unscaled)
        } else if end <= OOP_ENCODING_HEAP_MAX {
            Self::new(0, LOG_OBJECT_ALIGNMENT, NarrowOopMode::ZeroBased)
        } else {
            Self::heap_based(start, LOG_OBJECT_ALIGNMENT, page_size)
        }
    }

    /// Base one page below `start` so that no object encodes to zero.
    pub fn heap_based(start: u64, shift: u32, page_size: u64) -> Self {
        Self::new(start - page_size, shift, NarrowOopMode::HeapBased)
    }

    /// Largest heap span this encoding can address.
    pub fn max_span(&self) -> u64 {
        UNSCALED_OOP_HEAP_MAX << self.shift
    }

    pub fn can_encode_range(&self, start: u64, end: u64) -> bool {
        start > self.base && end - self.base <= self.max_span()
    }

    #[inline]
    pub fn encode(&self, addr: u64) -> u32 {
        if addr == 0 {
            0
        } else {
            self.encode_not_null(addr)
        }
    }

    #[inline]
    pub fn encode_not_null(&self, addr: u64) -> u32 {
        debug_assert!(addr > self.base, "{:#x} is below the narrow oop base", addr);
        let value = (addr - self.base) >> self.shift;
        debug_assert!(value <= u32::MAX as u64, "{:#x} is not encodable", addr);
        value as u32
    }

    #[inline]
    pub fn decode(&self, value: u32) -> u64 {
        if value == 0 {
            0
        } else {
            self.decode_not_null(value)
        }
    }

    #[inline]
    pub fn decode_not_null(&self, value: u32) -> u64 {
        self.base + ((value as u64) << self.shift)
    }
}

/// Reference representation of one heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OopEncoding {
    Compressed(NarrowOopEncoding),
    Uncompressed,
}

impl OopEncoding {
    #[inline]
    pub fn oop_size(&self) -> usize {
        match self {
            OopEncoding::Compressed(_) => 4,
            OopEncoding::Uncompressed => 8,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, OopEncoding::Compressed(_))
    }

    pub fn narrow(&self) -> Option<&NarrowOopEncoding> {
        match self {
            OopEncoding::Compressed(narrow) => Some(narrow),
            OopEncoding::Uncompressed => None,
        }
    }

    /// Narrow oop base, zero without compressed oops.
    pub fn base(&self) -> u64 {
        self.narrow().map(|n| n.base).unwrap_or(0)
    }

    pub fn shift(&self) -> u32 {
        self.narrow().map(|n| n.shift).unwrap_or(0)
    }

    /// Reads the reference stored at `at` as an address; null is zero.
    #[inline]
    pub fn load(&self, bytes: &[u8], at: usize) -> u64 {
        match self {
            OopEncoding::Compressed(narrow) => narrow.decode(get_u32(bytes, at)),
            OopEncoding::Uncompressed => get_u64(bytes, at),
        }
    }

    #[inline]
    pub fn store(&self, bytes: &mut [u8], at: usize, addr: u64) {
        match self {
            OopEncoding::Compressed(narrow) => put_u32(bytes, at, narrow.encode(addr)),
            OopEncoding::Uncompressed => put_u64(bytes, at, addr),
        }
    }
}

/// Encoding of the klass word in object headers. The archive records it so
/// that a runtime with a different klass layout rejects the heap objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NarrowKlassEncoding {
    pub pointer_bits: i32,
    pub shift: i32,
}

impl NarrowKlassEncoding {
    pub const DEFAULT: NarrowKlassEncoding = NarrowKlassEncoding {
        pointer_bits: 32,
        shift: 0,
    };
}

impl Default for NarrowKlassEncoding {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::constants::GB;

    #[test]
    fn test_mode_selection() {
        let e = NarrowOopEncoding::for_heap(GB, 2 * GB, 4096);
        assert_eq!(e.mode, NarrowOopMode::Unscaled);
        assert_eq!((e.base, e.shift), (0, 0));

        let e = NarrowOopEncoding::for_heap(8 * GB, 16 * GB, 4096);
        assert_eq!(e.mode, NarrowOopMode::ZeroBased);
        assert_eq!((e.base, e.shift), (0, 3));

        let start = 0x7f00_0000_0000;
        let e = NarrowOopEncoding::for_heap(start, start + GB, 4096);
        assert_eq!(e.mode, NarrowOopMode::HeapBased);
        assert_eq!(e.base, start - 4096);
        assert!(e.can_encode_range(start, start + GB));
    }

    #[test]
    fn test_null_is_zero() {
        let e = NarrowOopEncoding::heap_based(0x8_0000_0000, 3, 4096);
        assert_eq!(e.encode(0), 0);
        assert_eq!(e.decode(0), 0);
        let addr = 0x8_0000_0040;
        let v = e.encode(addr);
        assert_ne!(v, 0);
        assert_eq!(e.decode(v), addr);
    }

    #[test]
    fn test_load_store_slots() {
        let mut bytes = [0u8; 16];
        let narrow = OopEncoding::Compressed(NarrowOopEncoding::new(0, 3, NarrowOopMode::ZeroBased));
        narrow.store(&mut bytes, 4, 0x1_0000_0008);
        assert_eq!(get_u32(&bytes, 4), 0x2000_0001);
        assert_eq!(narrow.load(&bytes, 4), 0x1_0000_0008);

        let wide = OopEncoding::Uncompressed;
        wide.store(&mut bytes, 8, 0xdead_0000);
        assert_eq!(wide.load(&bytes, 8), 0xdead_0000);
        assert_eq!(wide.oop_size(), 8);
        assert_eq!(narrow.oop_size(), 4);
    }
}
