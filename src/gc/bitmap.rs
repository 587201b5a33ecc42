/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Relocation bitmaps.
//!
//! Bit `i` of a region's oop map stands for the reference slot at byte offset
//! `i * oop_size` of the region; bit `i` of a pointer map stands for the
//! metadata pointer at `i * 8`. On disk a bitmap is a run of little-endian
//! 64-bit words with leading and trailing zero bits trimmed; the number of
//! trimmed leading bits is the map's start position.
use core::fmt;
use core::mem::size_of;
use core::ops::Range;

pub const BITS_PER_WORD: usize = size_of::<u64>() * 8;
const LOG_BITS_PER_WORD: usize = 6;

#[inline]
pub const fn words_for(bits: usize) -> usize {
    (bits + BITS_PER_WORD - 1) >> LOG_BITS_PER_WORD
}

#[inline]
const fn word_index(bit: usize) -> usize {
    bit >> LOG_BITS_PER_WORD
}

#[inline]
const fn bit_mask(bit: usize) -> u64 {
    1 << (bit & (BITS_PER_WORD - 1))
}

/// Growable bitmap built at dump time.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RelocBitmap {
    words: Vec<u64>,
    size: usize,
}

impl RelocBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            words: vec![0; words_for(size)],
            size,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes this map occupies when written out.
    pub fn size_in_bytes(&self) -> usize {
        words_for(self.size) * size_of::<u64>()
    }

    pub fn resize(&mut self, size: usize) {
        self.words.resize(words_for(size), 0);
        if size < self.size {
            let tail = size & (BITS_PER_WORD - 1);
            if tail != 0 {
                if let Some(last) = self.words.last_mut() {
                    *last &= (1u64 << tail) - 1;
                }
            }
        }
        self.size = size;
    }

    /// Sets `bit`, growing the map when needed.
    #[inline]
    pub fn set(&mut self, bit: usize) {
        if bit >= self.size {
            self.resize(bit + 1);
        }
        self.words[word_index(bit)] |= bit_mask(bit);
    }

    #[inline]
    pub fn clear(&mut self, bit: usize) {
        if bit < self.size {
            self.words[word_index(bit)] &= !bit_mask(bit);
        }
    }

    #[inline]
    pub fn at(&self, bit: usize) -> bool {
        bit < self.size && self.words[word_index(bit)] & bit_mask(bit) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn find_first_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * BITS_PER_WORD + w.trailing_zeros() as usize)
    }

    pub fn find_last_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * BITS_PER_WORD + (BITS_PER_WORD - 1 - w.leading_zeros() as usize))
    }

    /// Keeps only bits `[start, end)`, shifted down to start at zero.
    pub fn truncate(&mut self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.size);
        let new_size = end - start;
        let first = word_index(start);
        let shift = start & (BITS_PER_WORD - 1);
        let mut words = vec![0u64; words_for(new_size)];
        for (i, word) in words.iter_mut().enumerate() {
            let lo = self.words[first + i] >> shift;
            let hi = match self.words.get(first + i + 1) {
                Some(next) if shift != 0 => next << (BITS_PER_WORD - shift),
                _ => 0,
            };
            *word = lo | hi;
        }
        // Clear whatever was shifted in past the new end.
        let tail = new_size & (BITS_PER_WORD - 1);
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        self.words = words;
        self.size = new_size;
    }

    /// Trims leading and trailing zero bits and returns how many leading bits
    /// were dropped. An all-zero map becomes empty with start position 0.
    pub fn remove_zeros(&mut self) -> usize {
        match (self.find_first_set(), self.find_last_set()) {
            (Some(first), Some(last)) => {
                self.truncate(first, last + 1);
                first
            }
            _ => {
                self.words.clear();
                self.size = 0;
                0
            }
        }
    }

    pub fn iter_set(&self) -> SetBits<'_> {
        SetBits::new(&self.words, 0)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.size_in_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
}

impl fmt::Debug for RelocBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelocBitmap")
            .field("size", &self.size)
            .field("set", &self.count_ones())
            .finish()
    }
}

/// Iterator over set bit positions.
pub struct SetBits<'a> {
    words: &'a [u64],
    index: usize,
    current: u64,
    base: usize,
}

impl<'a> SetBits<'a> {
    fn new(words: &'a [u64], base: usize) -> Self {
        Self {
            words,
            index: 0,
            current: words.first().copied().unwrap_or(0),
            base,
        }
    }
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.base + self.index * BITS_PER_WORD + bit);
            }
            self.index += 1;
            if self.index >= self.words.len() {
                return None;
            }
            self.current = self.words[self.index];
        }
    }
}

/// Read-only view of a bitmap stored in the archive's bitmap region.
#[derive(Clone, Copy)]
pub struct BitMapView<'a> {
    bytes: &'a [u8],
    size: usize,
    start_pos: usize,
}

impl<'a> BitMapView<'a> {
    /// `bytes` holds `size` bits; bit 0 of the view is region bit
    /// `start_pos`.
    pub fn new(bytes: &'a [u8], size: usize, start_pos: usize) -> Option<Self> {
        if bytes.len() < words_for(size) * size_of::<u64>() {
            return None;
        }
        Some(Self {
            bytes,
            size,
            start_pos,
        })
    }

    pub fn empty() -> Self {
        Self {
            bytes: &[],
            size: 0,
            start_pos: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn start_pos(&self) -> usize {
        self.start_pos
    }

    /// One past the highest region bit covered by this view.
    pub fn end_pos(&self) -> usize {
        self.start_pos + self.size
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        let at = index * size_of::<u64>();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    /// Tests region bit `bit`.
    pub fn at(&self, bit: usize) -> bool {
        if bit < self.start_pos || bit >= self.end_pos() {
            return false;
        }
        let rel = bit - self.start_pos;
        self.word(word_index(rel)) & bit_mask(rel) != 0
    }

    /// Region bit positions that are set, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter_set_in(0..self.size)
    }

    /// Region bit positions set within the view-relative range `bits`. The
    /// range start must be word aligned.
    pub fn iter_set_in(&self, bits: Range<usize>) -> impl Iterator<Item = usize> + '_ {
        debug_assert!(bits.start % BITS_PER_WORD == 0);
        let end = bits.end.min(self.size);
        let first_word = word_index(bits.start);
        let last_word = words_for(end);
        let start_pos = self.start_pos;
        (first_word..last_word).flat_map(move |w| {
            let mut word = self.word(w);
            let tail = end - w * BITS_PER_WORD;
            if tail < BITS_PER_WORD {
                word &= (1u64 << tail) - 1;
            }
            BitsOf(word).map(move |b| start_pos + w * BITS_PER_WORD + b)
        })
    }

    /// Splits the view into at most `parts` word-aligned, view-relative
    /// ranges of roughly equal size.
    pub fn split(&self, parts: usize) -> Vec<Range<usize>> {
        let words = words_for(self.size);
        if words == 0 {
            return vec![];
        }
        let parts = parts.max(1).min(words);
        let per = (words + parts - 1) / parts;
        (0..words)
            .step_by(per)
            .map(|w| w * BITS_PER_WORD..((w + per) * BITS_PER_WORD).min(self.size))
            .collect()
    }
}

struct BitsOf(u64);

impl Iterator for BitsOf {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(bit)
    }
}
