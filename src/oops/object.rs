/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::klass::{KlassId, FILLER_KLASS};
use crate::gc::constants::{HEAP_WORD_SIZE, OBJECT_ALIGNMENT};
use crate::utils::{get_u32, get_u64, put_u32, put_u64};
use heapsnap_os::align_up;

pub const MARK_OFFSET: usize = 0;
pub const KLASS_OFFSET: usize = 8;
pub const LENGTH_OFFSET: usize = 12;
pub const HEADER_SIZE: usize = 16;
pub const ARRAY_BASE_OFFSET: usize = HEADER_SIZE;

/// Element size of the `int[]` filler arrays.
pub const FILLER_ELEMENT_SIZE: usize = 4;

/// The mark word: lock state in bits 0..2, GC age in bits 3..7 and the
/// identity hash in bits 8..39.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MarkWord(u64);

impl MarkWord {
    const LOCK_MASK: u64 = 0b11;
    const UNLOCKED: u64 = 0b01;
    const AGE_SHIFT: u32 = 3;
    const AGE_MASK: u64 = 0b1111;
    const HASH_SHIFT: u32 = 8;
    const HASH_MASK: u64 = 0x7fff_ffff;

    pub const fn from_raw(value: u64) -> Self {
        MarkWord(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Unlocked, age zero, no hash.
    pub const fn prototype() -> Self {
        MarkWord(Self::UNLOCKED)
    }

    pub fn is_unlocked(self) -> bool {
        self.0 & Self::LOCK_MASK == Self::UNLOCKED
    }

    pub fn age(self) -> u32 {
        ((self.0 >> Self::AGE_SHIFT) & Self::AGE_MASK) as u32
    }

    pub fn set_age(self, age: u32) -> Self {
        let cleared = self.0 & !(Self::AGE_MASK << Self::AGE_SHIFT);
        MarkWord(cleared | ((age as u64 & Self::AGE_MASK) << Self::AGE_SHIFT))
    }

    pub fn set_locked(self) -> Self {
        MarkWord(self.0 & !Self::LOCK_MASK)
    }

    pub fn hash(self) -> u32 {
        ((self.0 >> Self::HASH_SHIFT) & Self::HASH_MASK) as u32
    }

    pub fn has_no_hash(self) -> bool {
        self.hash() == 0
    }

    pub fn copy_set_hash(self, hash: u32) -> Self {
        let cleared = self.0 & !(Self::HASH_MASK << Self::HASH_SHIFT);
        MarkWord(cleared | ((hash as u64 & Self::HASH_MASK) << Self::HASH_SHIFT))
    }

    /// Header an object gets in the archive: the prototype plus the identity
    /// hash, if one was ever computed.
    pub fn for_archive(self) -> Self {
        let proto = Self::prototype();
        if self.has_no_hash() {
            proto
        } else {
            proto.copy_set_hash(self.hash())
        }
    }
}

#[inline]
pub fn mark(bytes: &[u8], at: usize) -> MarkWord {
    MarkWord(get_u64(bytes, at + MARK_OFFSET))
}

#[inline]
pub fn set_mark(bytes: &mut [u8], at: usize, mark: MarkWord) {
    put_u64(bytes, at + MARK_OFFSET, mark.0)
}

#[inline]
pub fn klass_id(bytes: &[u8], at: usize) -> KlassId {
    get_u32(bytes, at + KLASS_OFFSET)
}

#[inline]
pub fn array_length(bytes: &[u8], at: usize) -> usize {
    get_u32(bytes, at + LENGTH_OFFSET) as usize
}

/// Writes a fresh header with the prototype mark.
pub fn init_header(bytes: &mut [u8], at: usize, klass: KlassId, length: Option<usize>) {
    set_mark(bytes, at, MarkWord::prototype());
    put_u32(bytes, at + KLASS_OFFSET, klass);
    put_u32(bytes, at + LENGTH_OFFSET, length.unwrap_or(0) as u32);
}

#[inline]
pub const fn array_byte_size(elem_size: usize, length: usize) -> usize {
    align_up(ARRAY_BASE_OFFSET + elem_size * length, OBJECT_ALIGNMENT)
}

#[inline]
pub const fn filler_array_byte_size(length: usize) -> usize {
    array_byte_size(FILLER_ELEMENT_SIZE, length)
}

/// Smallest gap a filler can close.
pub const MIN_FILLER_BYTE_SIZE: usize = filler_array_byte_size(0);

/// Length of the filler array that is exactly `fill_bytes` long.
pub fn filler_array_length(fill_bytes: usize) -> Option<usize> {
    if fill_bytes < MIN_FILLER_BYTE_SIZE {
        return None;
    }
    let initial = fill_bytes / FILLER_ELEMENT_SIZE;
    (0..=initial)
        .rev()
        .find(|len| filler_array_byte_size(*len) == fill_bytes)
}

/// Header of a one-word filler. Lock bits `0b11` never appear in an object
/// header, so walkers recognise it before reading a klass id.
pub const FILLER_WORD: u64 = 0x0000_f111_f111_0003;

#[inline]
pub fn is_filler_word(bytes: &[u8], at: usize) -> bool {
    get_u64(bytes, at + MARK_OFFSET) == FILLER_WORD
}

/// Formats `[at, at + fill_bytes)` as dead space: a single [`FILLER_WORD`]
/// for one heap word, otherwise one `int[]`. Returns false when no filler
/// has that exact size.
pub fn write_filler(bytes: &mut [u8], at: usize, fill_bytes: usize) -> bool {
    if fill_bytes == HEAP_WORD_SIZE {
        put_u64(bytes, at, FILLER_WORD);
        return true;
    }
    let length = match filler_array_length(fill_bytes) {
        Some(length) => length,
        None => return false,
    };
    for b in &mut bytes[at..at + fill_bytes] {
        *b = 0;
    }
    init_header(bytes, at, FILLER_KLASS, Some(length));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filler_sizes() {
        assert_eq!(MIN_FILLER_BYTE_SIZE, 16);
        assert_eq!(filler_array_length(16), Some(0));
        assert_eq!(filler_array_length(24), Some(2));
        for fill in (16..4096).step_by(8) {
            let len = filler_array_length(fill).unwrap();
            assert_eq!(filler_array_byte_size(len), fill);
        }
        assert_eq!(filler_array_length(8), None);
    }

    #[test]
    fn test_write_filler() {
        let mut bytes = vec![0xffu8; 64];
        assert!(write_filler(&mut bytes, 8, 40));
        assert_eq!(bytes[0], 0xff);
        assert_eq!(klass_id(&bytes, 8), FILLER_KLASS);
        assert_eq!(array_length(&bytes, 8), 6);
        assert_eq!(mark(&bytes, 8), MarkWord::prototype());
        assert!(bytes[24..48].iter().all(|b| *b == 0));
        assert_eq!(bytes[48], 0xff);
    }

    #[test]
    fn test_one_word_filler() {
        let mut bytes = vec![0xffu8; 24];
        assert!(write_filler(&mut bytes, 8, 8));
        assert!(is_filler_word(&bytes, 8));
        assert!(!mark(&bytes, 8).is_unlocked());
        assert_eq!(bytes[16], 0xff);
        assert!(!write_filler(&mut bytes, 0, 12));

        let hashed = MarkWord::from_raw(FILLER_WORD).for_archive();
        assert_ne!(hashed.value(), FILLER_WORD);
    }

    #[test]
    fn test_archive_mark_keeps_hash_only() {
        let live = MarkWord::prototype()
            .copy_set_hash(0x1234_5678)
            .set_age(7)
            .set_locked();
        assert!(!live.is_unlocked());
        let archived = live.for_archive();
        assert!(archived.is_unlocked());
        assert_eq!(archived.age(), 0);
        assert_eq!(archived.hash(), 0x1234_5678);

        assert_eq!(MarkWord::prototype().set_age(3).for_archive(), MarkWord::prototype());
    }
}
