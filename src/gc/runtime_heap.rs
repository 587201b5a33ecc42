/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! The heap archived objects are brought into at startup.
//!
//! [`ArchiveHeapSupport`] is everything the loader needs from a collector.
//! [`RuntimeHeap`] implements it over real reserved memory: normal
//! allocation bumps up from the bottom, archive regions are carved from the
//! top, and a region can be backed directly by the archive file.
use super::compressed::{NarrowOopEncoding, OopEncoding};
use super::constants::HEAP_WORD_SIZE;
use crate::error::{ArchiveError, Result};
use crate::oops::klass::{FieldType, KlassId, KlassTable};
use crate::oops::object::{self, HEADER_SIZE};
use crate::utils::{get_u32, get_u64};
use heapsnap_os::memory::{self, MemoryPermission, Reservation};
use heapsnap_os::{align_down_u64, align_up, is_aligned_u64, page_size, Address};
use std::fs::File;
use std::io;
use std::ops::Range;

/// Largest span a single `int[]` filler covers.
const MAX_FILLER_BYTE_SIZE: usize = object::filler_array_byte_size(u32::MAX as usize / 2);

pub trait ArchiveHeapSupport {
    fn encoding(&self) -> OopEncoding;

    fn klasses(&self) -> &KlassTable;

    fn reserved(&self) -> Range<u64>;

    /// Granularity of the collector's regions.
    fn region_size(&self) -> usize;

    /// True when an archive region can be placed at an address the
    /// collector hands out and backed by the file.
    fn can_map_archive(&self) -> bool;

    /// True when archive contents can be copied into ordinary heap memory.
    fn can_load_archive(&self) -> bool;

    /// Reserves space for a mapped archive region. Returns `requested` if
    /// that range is free and inside the heap, otherwise a region-aligned
    /// range at the top of the heap.
    fn alloc_archive_region(&mut self, byte_size: usize, requested: u64) -> Option<u64>;

    /// Backs `[start, start + byte_size)` with `byte_size` bytes of `file`
    /// read from `offset`.
    fn map_archive_file(
        &mut self,
        start: u64,
        byte_size: usize,
        file: &File,
        offset: u64,
    ) -> io::Result<()>;

    /// Releases a range obtained from `alloc_archive_region`, dropping any
    /// file mapping.
    fn dealloc_archive_region(&mut self, start: u64, byte_size: usize);

    /// Allocates ordinary heap memory for a loaded (copied) archive region.
    fn alloc_loaded_archive_space(&mut self, byte_size: usize) -> Option<u64>;

    /// Makes a range parseable again by covering it with dead filler objects.
    fn fill_with_fillers(&mut self, start: u64, byte_size: usize);

    /// Called once a region is fully patched; its objects are live from now
    /// on.
    fn complete_archive_region(&mut self, start: u64, byte_size: usize);

    fn memory(&self, start: u64, len: usize) -> &[u8];

    fn memory_mut(&mut self, start: u64, len: usize) -> &mut [u8];

    fn klass_of(&self, obj: u64) -> KlassId {
        object::klass_id(self.memory(obj, HEADER_SIZE), 0)
    }

    fn array_length(&self, obj: u64) -> usize {
        object::array_length(self.memory(obj, HEADER_SIZE), 0)
    }

    fn identity_hash(&self, obj: u64) -> u32 {
        object::mark(self.memory(obj, HEADER_SIZE), 0).hash()
    }

    fn load_oop(&self, slot: u64) -> u64 {
        let encoding = self.encoding();
        encoding.load(self.memory(slot, encoding.oop_size()), 0)
    }

    fn oop_field(&self, obj: u64, index: usize) -> Option<u64> {
        let field = self.klasses().klass(self.klass_of(obj)).field(index);
        debug_assert_eq!(field.ty, FieldType::Oop);
        match self.load_oop(obj + field.offset as u64) {
            0 => None,
            addr => Some(addr),
        }
    }

    fn int_field(&self, obj: u64, index: usize) -> i32 {
        let field = self.klasses().klass(self.klass_of(obj)).field(index);
        get_u32(self.memory(obj + field.offset as u64, 4), 0) as i32
    }

    fn metadata_field(&self, obj: u64, index: usize) -> u64 {
        let field = self.klasses().klass(self.klass_of(obj)).field(index);
        debug_assert_eq!(field.ty, FieldType::Metadata);
        get_u64(self.memory(obj + field.offset as u64, 8), 0)
    }

    fn element(&self, array: u64, index: usize) -> Option<u64> {
        debug_assert!(index < self.array_length(array));
        let slot = array + (HEADER_SIZE + index * self.encoding().oop_size()) as u64;
        match self.load_oop(slot) {
            0 => None,
            addr => Some(addr),
        }
    }
}

/// Shape of a [`RuntimeHeap`].
#[derive(Clone, Debug)]
pub struct RuntimeHeapConfig {
    pub heap_size: usize,
    pub region_size: usize,
    pub compressed_oops: bool,
    /// Forces a heap-based narrow oop encoding with this shift.
    pub oop_shift: Option<u32>,
    pub can_map: bool,
    pub can_load: bool,
}

impl Default for RuntimeHeapConfig {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024,
            region_size: 1024 * 1024,
            compressed_oops: true,
            oop_shift: None,
            can_map: memory::can_map_files(),
            can_load: true,
        }
    }
}

#[derive(Clone, Debug)]
struct ArchiveRange {
    start: u64,
    size: usize,
    live: bool,
}

pub struct RuntimeHeap {
    reservation: Reservation,
    region_size: usize,
    encoding: OopEncoding,
    klasses: KlassTable,
    top: u64,
    archive_ranges: Vec<ArchiveRange>,
    can_map: bool,
    can_load: bool,
}

impl RuntimeHeap {
    pub fn new(klasses: KlassTable, config: &RuntimeHeapConfig) -> Result<Self> {
        let region_size = config.region_size.max(page_size());
        if !region_size.is_power_of_two() {
            return Err(ArchiveError::Environment(format!(
                "region size {} is not a power of two",
                region_size
            )));
        }
        let size = align_up(config.heap_size, region_size);
        let reservation = Reservation::reserve_align(size, region_size)?;
        memory::commit_at(reservation.start(), size, MemoryPermission::ReadWrite)?;

        let start = reservation.start().to_u64();
        let end = reservation.end().to_u64();
        let encoding = if config.compressed_oops {
            let page = page_size() as u64;
            let narrow = match config.oop_shift {
                Some(shift) => NarrowOopEncoding::heap_based(start, shift, page),
                None => NarrowOopEncoding::for_heap(start, end, page),
            };
            if !narrow.can_encode_range(start, end) {
                return Err(ArchiveError::Environment(format!(
                    "a {} byte heap can not use compressed oops with shift {}",
                    size, narrow.shift
                )));
            }
            OopEncoding::Compressed(narrow)
        } else {
            OopEncoding::Uncompressed
        };
        if klasses.oop_size() != encoding.oop_size() {
            return Err(ArchiveError::Environment(format!(
                "klass table laid out for {} byte references, heap uses {}",
                klasses.oop_size(),
                encoding.oop_size()
            )));
        }
        log::debug!(
            target: "cds::heap",
            "runtime heap [{:#x}, {:#x}) region size {} encoding {:?}",
            start,
            end,
            region_size,
            encoding
        );

        Ok(Self {
            reservation,
            region_size,
            encoding,
            klasses,
            top: start,
            archive_ranges: vec![],
            can_map: config.can_map && memory::can_map_files(),
            can_load: config.can_load,
        })
    }

    pub fn start(&self) -> u64 {
        self.reservation.start().to_u64()
    }

    pub fn end(&self) -> u64 {
        self.reservation.end().to_u64()
    }

    /// Lowest address taken by an archive region, or the heap end.
    fn archive_bottom(&self) -> u64 {
        self.archive_ranges
            .iter()
            .map(|r| r.start)
            .min()
            .unwrap_or_else(|| self.end())
    }

    fn is_free(&self, start: u64, size: usize) -> bool {
        let end = start + size as u64;
        start >= self.top
            && end <= self.end()
            && self
                .archive_ranges
                .iter()
                .all(|r| end <= r.start || start >= r.start + r.size as u64)
    }

    /// Number of archive regions whose objects are live.
    pub fn live_archive_regions(&self) -> usize {
        self.archive_ranges.iter().filter(|r| r.live).count()
    }

    /// Bump allocates ordinary memory.
    pub fn allocate(&mut self, byte_size: usize) -> Option<u64> {
        let size = align_up(byte_size, crate::gc::constants::OBJECT_ALIGNMENT) as u64;
        if self.top + size > self.archive_bottom() {
            return None;
        }
        let result = self.top;
        self.top += size;
        Some(result)
    }

    fn check_range(&self, start: u64, len: usize) {
        assert!(
            self.reservation.contains(Address::from(start), len),
            "[{:#x}, +{}) is outside the heap",
            start,
            len
        );
    }
}

impl ArchiveHeapSupport for RuntimeHeap {
    fn encoding(&self) -> OopEncoding {
        self.encoding
    }

    fn klasses(&self) -> &KlassTable {
        &self.klasses
    }

    fn reserved(&self) -> Range<u64> {
        self.start()..self.end()
    }

    fn region_size(&self) -> usize {
        self.region_size
    }

    fn can_map_archive(&self) -> bool {
        self.can_map
    }

    fn can_load_archive(&self) -> bool {
        self.can_load
    }

    fn alloc_archive_region(&mut self, byte_size: usize, requested: u64) -> Option<u64> {
        let size = align_up(byte_size, self.region_size);
        let region = self.region_size as u64;
        let start = if is_aligned_u64(requested, region) && self.is_free(requested, size) {
            requested
        } else {
            // Highest free aligned range.
            if self.end() < self.top + size as u64 {
                return None;
            }
            let mut candidate = align_down_u64(self.end() - size as u64, region);
            loop {
                if candidate < self.top {
                    return None;
                }
                if self.is_free(candidate, size) {
                    break candidate;
                }
                candidate = candidate.checked_sub(region)?;
            }
        };
        self.archive_ranges.push(ArchiveRange {
            start,
            size,
            live: false,
        });
        log::debug!(
            target: "cds::heap",
            "archive region [{:#x}, {:#x}) requested {:#x}",
            start,
            start + size as u64,
            requested
        );
        Some(start)
    }

    fn map_archive_file(
        &mut self,
        start: u64,
        byte_size: usize,
        file: &File,
        offset: u64,
    ) -> io::Result<()> {
        self.check_range(start, byte_size);
        memory::map_file_at(
            Address::from(start),
            byte_size,
            file,
            offset,
            MemoryPermission::ReadWrite,
        )
    }

    fn dealloc_archive_region(&mut self, start: u64, byte_size: usize) {
        if let Some(index) = self.archive_ranges.iter().position(|r| r.start == start) {
            let range = self.archive_ranges.remove(index);
            debug_assert!(range.size >= byte_size);
            // Drops the file mapping; the range reads as zero again.
            if let Err(e) = memory::commit_at(
                Address::from(range.start),
                range.size,
                MemoryPermission::ReadWrite,
            ) {
                log::warn!(target: "cds::heap", "could not release archive region: {}", e);
            }
        }
    }

    fn alloc_loaded_archive_space(&mut self, byte_size: usize) -> Option<u64> {
        let region = self.region_size as u64;
        let start = heapsnap_os::align_up_u64(self.top, region);
        let size = align_up(byte_size, crate::gc::constants::OBJECT_ALIGNMENT) as u64;
        if start + size > self.archive_bottom() {
            return None;
        }
        self.top = start + size;
        Some(start)
    }

    fn fill_with_fillers(&mut self, start: u64, byte_size: usize) {
        let region = self.region_size as u64;
        let end = start + byte_size as u64;
        let mut cur = start;
        while cur < end {
            let boundary = align_down_u64(cur, region) + region;
            let chunk = (end.min(boundary) - cur) as usize;
            let chunk = chunk.min(MAX_FILLER_BYTE_SIZE);
            debug_assert!(
                chunk % HEAP_WORD_SIZE == 0,
                "filler chunk of {} bytes at {:#x}",
                chunk,
                cur
            );
            let mem = self.memory_mut(cur, chunk);
            let written = object::write_filler(mem, 0, chunk);
            debug_assert!(written, "no filler of {} bytes at {:#x}", chunk, cur);
            cur += chunk as u64;
        }
    }

    fn complete_archive_region(&mut self, start: u64, byte_size: usize) {
        if let Some(range) = self.archive_ranges.iter_mut().find(|r| r.start == start) {
            range.live = true;
        }
        log::debug!(
            target: "cds::heap",
            "archive objects [{:#x}, {:#x}) are live",
            start,
            start + byte_size as u64
        );
    }

    fn memory(&self, start: u64, len: usize) -> &[u8] {
        self.check_range(start, len);
        // The heap owns the whole reservation and keeps it committed.
        unsafe { std::slice::from_raw_parts(start as usize as *const u8, len) }
    }

    fn memory_mut(&mut self, start: u64, len: usize) -> &mut [u8] {
        self.check_range(start, len);
        unsafe { std::slice::from_raw_parts_mut(start as usize as *mut u8, len) }
    }
}
