/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Pointer patching driven by relocation bitmaps.
//!
//! Every strategy shares one walk: for each set bit of a region's map, hand
//! the slot it marks to a [`SlotPatcher`]. The walk can be split over a
//! worker pool; chunks are word aligned in the bitmap and disjoint in the
//! region, so workers never touch the same bytes.
use crate::gc::bitmap::BitMapView;
use crate::gc::compressed::NarrowOopEncoding;
use crate::utils::{get_u32, get_u64, offset_address, put_u32, put_u64};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use yastl::Pool;

pub trait SlotPatcher: Sync {
    /// Bytes per slot; bit `i` of the map marks the slot at `i * slot_size`.
    fn slot_size(&self) -> usize;

    /// Rewrites the value in `slot`. Returns false when the slot held null
    /// and was left alone.
    fn patch(&self, slot: &mut [u8]) -> bool;
}

/// Decodes a narrow oop with the dump-time encoding, moves it with the
/// region and encodes it with the runtime encoding. Works for any pair of
/// encodings.
#[derive(Clone, Copy, Debug)]
pub struct FullDecode {
    pub dump: NarrowOopEncoding,
    pub runtime: NarrowOopEncoding,
    /// Where the region was requested to be at dump time.
    pub dumptime_bottom: u64,
    /// Where the region actually is.
    pub runtime_bottom: u64,
}

impl FullDecode {
    #[inline]
    pub fn relocate(&self, value: u32) -> u32 {
        let addr = self.dump.decode_not_null(value);
        let moved = addr
            .wrapping_sub(self.dumptime_bottom)
            .wrapping_add(self.runtime_bottom);
        self.runtime.encode_not_null(moved)
    }
}

impl SlotPatcher for FullDecode {
    fn slot_size(&self) -> usize {
        4
    }

    #[inline]
    fn patch(&self, slot: &mut [u8]) -> bool {
        let value = get_u32(slot, 0);
        if value == 0 {
            return false;
        }
        put_u32(slot, 0, self.relocate(value));
        true
    }
}

/// Adds one 32-bit delta to every narrow oop. Only valid when the dump-time
/// and runtime shifts are equal.
#[derive(Clone, Copy, Debug)]
pub struct QuickDelta {
    delta: u32,
    full: FullDecode,
}

impl QuickDelta {
    pub fn new(full: FullDecode) -> Option<Self> {
        if full.dump.shift != full.runtime.shift {
            return None;
        }
        let shift = full.dump.shift;
        let dumptime = ((full.dumptime_bottom - full.dump.base) >> shift) as u32;
        let runtime = ((full.runtime_bottom - full.runtime.base) >> shift) as u32;
        Some(Self {
            delta: runtime.wrapping_sub(dumptime),
            full,
        })
    }

    pub fn delta(&self) -> u32 {
        self.delta
    }
}

impl SlotPatcher for QuickDelta {
    fn slot_size(&self) -> usize {
        4
    }

    #[inline]
    fn patch(&self, slot: &mut [u8]) -> bool {
        let value = get_u32(slot, 0);
        if value == 0 {
            return false;
        }
        let patched = value.wrapping_add(self.delta);
        debug_assert_eq!(patched, self.full.relocate(value));
        put_u32(slot, 0, patched);
        true
    }
}

/// Adds one byte delta to every full-width reference of a copied region.
#[derive(Clone, Copy, Debug)]
pub struct FixedOffset(pub i64);

impl SlotPatcher for FixedOffset {
    fn slot_size(&self) -> usize {
        8
    }

    #[inline]
    fn patch(&self, slot: &mut [u8]) -> bool {
        let value = get_u64(slot, 0);
        if value == 0 {
            return false;
        }
        put_u64(slot, 0, offset_address(value, self.0));
        true
    }
}

/// Moves metadata pointers by the distance the metadata regions moved.
#[derive(Clone, Copy, Debug)]
pub struct NativeDelta(pub i64);

impl SlotPatcher for NativeDelta {
    fn slot_size(&self) -> usize {
        8
    }

    #[inline]
    fn patch(&self, slot: &mut [u8]) -> bool {
        let value = get_u64(slot, 0);
        if value == 0 {
            return false;
        }
        put_u64(slot, 0, offset_address(value, self.0));
        true
    }
}

/// Threads used for patching.
pub struct WorkerPool {
    pool: Pool,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            pool: Pool::new(threads),
            threads,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

fn patch_range<P: SlotPatcher>(
    map: &BitMapView<'_>,
    bits: Range<usize>,
    chunk_start: usize,
    chunk: &mut [u8],
    patcher: &P,
) -> usize {
    let slot_size = patcher.slot_size();
    let mut patched = 0;
    for bit in map.iter_set_in(bits) {
        let at = bit * slot_size - chunk_start;
        if patcher.patch(&mut chunk[at..at + slot_size]) {
            patched += 1;
        }
    }
    patched
}

/// Patches every slot of `region` marked in `map`. Returns how many
/// non-null slots were rewritten.
pub fn patch_embedded_pointers<P: SlotPatcher>(
    region: &mut [u8],
    map: &BitMapView<'_>,
    patcher: &P,
    workers: Option<&WorkerPool>,
) -> usize {
    let slot_size = patcher.slot_size();
    assert!(
        map.end_pos() * slot_size <= region.len(),
        "bitmap covers {} slots, region holds {}",
        map.end_pos(),
        region.len() / slot_size
    );
    let workers = match workers {
        Some(workers) if workers.threads() > 1 => workers,
        _ => return patch_range(map, 0..map.size(), 0, region, patcher),
    };

    let mut jobs = Vec::with_capacity(workers.threads());
    let mut rest: &mut [u8] = region;
    let mut consumed = 0;
    for bits in map.split(workers.threads()) {
        let lo = (map.start_pos() + bits.start) * slot_size;
        let hi = (map.start_pos() + bits.end) * slot_size;
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(lo - consumed);
        let (chunk, tail) = tail.split_at_mut(hi - lo);
        jobs.push((bits, lo, chunk));
        rest = tail;
        consumed = hi;
    }

    let total = AtomicUsize::new(0);
    workers.pool.scoped(|scope| {
        for (bits, chunk_start, chunk) in jobs {
            let total = &total;
            scope.execute(move || {
                let patched = patch_range(map, bits, chunk_start, chunk, patcher);
                total.fetch_add(patched, Ordering::Relaxed);
            });
        }
    });
    total.into_inner()
}
