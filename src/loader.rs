/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Brings archived heap objects into a running heap.
//!
//! Two strategies exist. Mapping backs an archive region of the collector
//! directly with the file; when the region lands where it was requested and
//! the narrow oop shift is unchanged nothing needs patching. Loading copies
//! the region into ordinary heap memory and patches every reference by the
//! distance it moved. Both finish with a pass over the pointer map that
//! moves metadata pointers by the metadata delta.
pub mod patch;

use crate::error::{ArchiveError, RegionFailure, Result};
use crate::filemap::header::default_vm_ident;
use crate::filemap::reader::CoreRegions;
use crate::filemap::{FileMapInfo, RegionIndex};
use crate::gc::bitmap::BitMapView;
use crate::gc::compressed::{NarrowKlassEncoding, OopEncoding};
use crate::gc::constants::{HEAP_WORD_SIZE, OBJECT_ALIGNMENT};
use crate::gc::runtime_heap::ArchiveHeapSupport;
use crate::oops::object::{self, HEADER_SIZE};
use patch::{patch_embedded_pointers, FixedOffset, FullDecode, NativeDelta, QuickDelta, WorkerPool};

/// How the loader treats an archive.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Check region crcs and walk the objects once they are in place.
    pub verify: bool,
    /// Turn every failure into [`ArchiveError::Unrecoverable`].
    pub require_archive: bool,
    /// Threads for pointer patching; 1 patches on the calling thread.
    pub workers: usize,
    pub verbose: bool,
    pub vm_ident: String,
    pub narrow_klass: NarrowKlassEncoding,
    /// Metadata delta to use instead of mapping the metadata regions.
    pub metadata_delta: Option<i64>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            verify: true,
            require_archive: false,
            workers: 1,
            verbose: false,
            vm_ident: default_vm_ident(),
            narrow_klass: NarrowKlassEncoding::DEFAULT,
            metadata_delta: None,
        }
    }
}

impl LoadOptions {
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_require_archive(mut self, require: bool) -> Self {
        self.require_archive = require;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_vm_ident(mut self, ident: impl Into<String>) -> Self {
        self.vm_ident = ident.into();
        self
    }

    pub fn with_metadata_delta(mut self, delta: i64) -> Self {
        self.metadata_delta = Some(delta);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapLoadMode {
    /// Backed by the archive file.
    Mapped,
    /// Copied into ordinary heap memory.
    Loaded,
}

/// Which patcher fixed the references of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    None,
    QuickDelta,
    FullDecode,
    FixedOffset,
}

/// Archived objects that are now part of the running heap.
pub struct LoadedHeap {
    pub mode: HeapLoadMode,
    pub patch: PatchKind,
    pub start: u64,
    pub byte_size: usize,
    /// Non-null references rewritten.
    pub patched_oops: usize,
    /// Non-null metadata pointers rewritten.
    pub patched_natives: usize,
    roots: u64,
    root_count: usize,
    metadata: Option<CoreRegions>,
}

impl LoadedHeap {
    pub fn roots_address(&self) -> u64 {
        self.roots
    }

    pub fn root_count(&self) -> usize {
        self.root_count
    }

    pub fn root<H: ArchiveHeapSupport + ?Sized>(&self, heap: &H, index: usize) -> Option<u64> {
        assert!(index < self.root_count, "root {} out of {}", index, self.root_count);
        heap.element(self.roots, index)
    }

    pub fn roots<H: ArchiveHeapSupport + ?Sized>(&self, heap: &H) -> Vec<Option<u64>> {
        (0..self.root_count).map(|i| self.root(heap, i)).collect()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.byte_size as u64
    }

    /// Address of the object at `offset` in the archived buffer.
    pub fn object_at(&self, offset: usize) -> u64 {
        debug_assert!(offset < self.byte_size);
        self.start + offset as u64
    }

    /// The relocated metadata regions, when the loader mapped them.
    pub fn metadata(&self) -> Option<&CoreRegions> {
        self.metadata.as_ref()
    }
}

pub struct ArchiveHeapLoader {
    options: LoadOptions,
    workers: Option<WorkerPool>,
}

impl ArchiveHeapLoader {
    pub fn new(options: LoadOptions) -> Self {
        let workers = if options.workers > 1 {
            Some(WorkerPool::new(options.workers))
        } else {
            None
        };
        Self { options, workers }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Mapping needs compressed oops on both sides and a collector that can
    /// back a region with a file.
    pub fn can_map<H: ArchiveHeapSupport + ?Sized>(info: &FileMapInfo, heap: &H) -> bool {
        heap.can_map_archive() && heap.encoding().is_compressed() && info.header().compressed_oops
    }

    pub fn can_load<H: ArchiveHeapSupport + ?Sized>(heap: &H) -> bool {
        heap.can_load_archive()
    }

    /// Maps the heap region when possible and loads it otherwise. Any
    /// failure leaves the heap walkable; with `require_archive` it is
    /// reported as unrecoverable.
    pub fn map_or_load<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &mut FileMapInfo,
        heap: &mut H,
    ) -> Result<LoadedHeap> {
        self.try_map_or_load(info, heap).map_err(|e| {
            log::warn!(
                target: "cds::heap",
                "archived heap objects from {} are not used: {}",
                info.path().display(),
                e
            );
            e.escalate(self.options.require_archive)
        })
    }

    fn try_map_or_load<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &mut FileMapInfo,
        heap: &mut H,
    ) -> Result<LoadedHeap> {
        self.check_environment(info, heap)?;
        info.map_bitmap_region()?;
        let metadata = match self.options.metadata_delta {
            Some(_) => None,
            None => info.map_core_regions()?,
        };
        let native_delta = match (&self.options.metadata_delta, &metadata) {
            (Some(delta), _) => *delta,
            (None, Some(core)) => core.delta(),
            (None, None) => 0,
        };

        let mut loaded = if Self::can_map(info, heap) {
            self.map_heap_region(info, heap, native_delta)?
        } else if Self::can_load(heap) {
            self.load_heap_region(info, heap, native_delta)?
        } else {
            return Err(ArchiveError::Environment(
                "the collector can neither map nor load archived objects".to_string(),
            ));
        };
        loaded.metadata = metadata;
        Ok(loaded)
    }

    /// Rejects archives this heap can not use before touching any memory.
    pub fn check_environment<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &FileMapInfo,
        heap: &H,
    ) -> Result<()> {
        let header = info.header();
        let env = |msg: String| Err(ArchiveError::Environment(msg));
        if !info.has_heap_region() {
            return env("the archive has no heap region".to_string());
        }
        if header.compressed_oops != heap.encoding().is_compressed() {
            return env(format!(
                "archive dumped with compressed oops {}, heap uses {}",
                header.compressed_oops,
                heap.encoding().is_compressed()
            ));
        }
        if header.narrow_klass != self.options.narrow_klass {
            return env(format!(
                "narrow klass encoding {:?} does not match {:?}",
                header.narrow_klass, self.options.narrow_klass
            ));
        }
        if header.obj_alignment as usize != OBJECT_ALIGNMENT {
            return env(format!(
                "object alignment {} does not match {}",
                header.obj_alignment, OBJECT_ALIGNMENT
            ));
        }
        if (heap.region_size() as u64) < header.heap_region_alignment {
            return env(format!(
                "heap regions of {} bytes are smaller than the archive's {}",
                heap.region_size(),
                header.heap_region_alignment
            ));
        }
        let used = info.region(RegionIndex::Heap).used;
        let reserved = heap.reserved();
        if used > reserved.end - reserved.start {
            return env(format!(
                "archived heap of {} bytes does not fit in a {} byte heap",
                used,
                reserved.end - reserved.start
            ));
        }
        if header.heap_roots_offset + HEADER_SIZE as u64 > used {
            return Err(ArchiveError::region(
                RegionIndex::Heap.name(),
                RegionFailure::ShortRead {
                    expected: header.heap_roots_offset as usize + HEADER_SIZE,
                    actual: used as usize,
                },
            ));
        }
        Ok(())
    }

    fn map_heap_region<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &FileMapInfo,
        heap: &mut H,
        native_delta: i64,
    ) -> Result<LoadedHeap> {
        let region = *info.region(RegionIndex::Heap);
        let byte_size = region.used as usize;
        let requested = info.heap_region_requested_address(&heap.encoding());
        let start = heap
            .alloc_archive_region(byte_size, requested)
            .ok_or(ArchiveError::HeapAllocation { size: byte_size })?;
        if start != requested {
            log::info!(
                target: "cds::heap",
                "heap region requested at {:#x} could not be reserved, using {:#x}",
                requested,
                start
            );
        }

        let result = heap
            .map_archive_file(start, byte_size, info.file(), region.file_offset)
            .map_err(|e| {
                ArchiveError::region(RegionIndex::Heap.name(), RegionFailure::Map(e.to_string()))
            })
            .and_then(|()| info.check_region_crc(RegionIndex::Heap, heap.memory(start, byte_size)))
            .and_then(|()| self.patch_heap(info, heap, start, byte_size, native_delta))
            .and_then(|patched| {
                self.verify_loaded_objects(heap, start, byte_size)?;
                Ok(patched)
            });
        let (patch, patched_oops, patched_natives) = match result {
            Ok(patched) => patched,
            Err(e) => {
                heap.dealloc_archive_region(start, byte_size);
                return Err(e);
            }
        };
        heap.complete_archive_region(start, byte_size);
        log::info!(
            target: "cds::heap",
            "heap region mapped at [{:#x}, {:#x}), patch {:?}",
            start,
            start + byte_size as u64,
            patch
        );
        Ok(self.loaded(info, HeapLoadMode::Mapped, patch, start, byte_size, patched_oops, patched_natives))
    }

    fn load_heap_region<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &FileMapInfo,
        heap: &mut H,
        native_delta: i64,
    ) -> Result<LoadedHeap> {
        let byte_size = info.region(RegionIndex::Heap).used as usize;
        let start = heap
            .alloc_loaded_archive_space(byte_size)
            .ok_or(ArchiveError::HeapAllocation { size: byte_size })?;

        let result = info
            .read_region_into(RegionIndex::Heap, heap.memory_mut(start, byte_size))
            .and_then(|()| self.patch_heap(info, heap, start, byte_size, native_delta))
            .and_then(|patched| {
                self.verify_loaded_objects(heap, start, byte_size)?;
                Ok(patched)
            });
        let (patch, patched_oops, patched_natives) = match result {
            Ok(patched) => patched,
            Err(e) => {
                // The space stays allocated; make it parseable.
                heap.fill_with_fillers(start, byte_size);
                return Err(e);
            }
        };
        heap.complete_archive_region(start, byte_size);
        log::info!(
            target: "cds::heap",
            "heap region loaded at [{:#x}, {:#x}), patch {:?}",
            start,
            start + byte_size as u64,
            patch
        );
        Ok(self.loaded(info, HeapLoadMode::Loaded, patch, start, byte_size, patched_oops, patched_natives))
    }

    #[allow(clippy::too_many_arguments)]
    fn loaded(
        &self,
        info: &FileMapInfo,
        mode: HeapLoadMode,
        patch: PatchKind,
        start: u64,
        byte_size: usize,
        patched_oops: usize,
        patched_natives: usize,
    ) -> LoadedHeap {
        let header = info.header();
        LoadedHeap {
            mode,
            patch,
            start,
            byte_size,
            patched_oops,
            patched_natives,
            roots: start + header.heap_roots_offset,
            root_count: header.heap_root_count as usize,
            metadata: None,
        }
    }

    fn check_bounds(map: &BitMapView<'_>, slot_size: usize, byte_size: usize) -> Result<()> {
        if map.end_pos() * slot_size > byte_size {
            return Err(ArchiveError::region(
                RegionIndex::Bitmap.name(),
                RegionFailure::BitmapOutOfRange,
            ));
        }
        Ok(())
    }

    /// Fixes references and metadata pointers of the region now at `start`.
    fn patch_heap<H: ArchiveHeapSupport + ?Sized>(
        &self,
        info: &FileMapInfo,
        heap: &mut H,
        start: u64,
        byte_size: usize,
        native_delta: i64,
    ) -> Result<(PatchKind, usize, usize)> {
        let oopmap = info.oopmap(RegionIndex::Heap)?;
        let ptrmap = info.ptrmap(RegionIndex::Heap)?;
        let runtime = heap.encoding();
        Self::check_bounds(&oopmap, runtime.oop_size(), byte_size)?;
        Self::check_bounds(&ptrmap, 8, byte_size)?;

        let dumptime_bottom = info.heap_region_dumptime_address();
        let workers = self.workers.as_ref();
        let region = heap.memory_mut(start, byte_size);
        let (kind, oops) = match (info.header().oop_encoding(), runtime) {
            (OopEncoding::Compressed(dump), OopEncoding::Compressed(runtime)) => {
                let full = FullDecode {
                    dump,
                    runtime,
                    dumptime_bottom,
                    runtime_bottom: start,
                };
                match QuickDelta::new(full) {
                    Some(quick) if quick.delta() == 0 => (PatchKind::None, 0),
                    Some(quick) => {
                        logln_if!(
                            self.options.verbose,
                            target: "cds::reloc",
                            "quick delta {:#x}",
                            quick.delta()
                        );
                        let n = patch_embedded_pointers(region, &oopmap, &quick, workers);
                        (PatchKind::QuickDelta, n)
                    }
                    None => {
                        logln_if!(
                            self.options.verbose,
                            target: "cds::reloc",
                            "full decode: {:?} -> {:?}",
                            dump,
                            runtime
                        );
                        let n = patch_embedded_pointers(region, &oopmap, &full, workers);
                        (PatchKind::FullDecode, n)
                    }
                }
            }
            (OopEncoding::Uncompressed, OopEncoding::Uncompressed) => {
                let delta = start.wrapping_sub(dumptime_bottom) as i64;
                if delta == 0 {
                    (PatchKind::None, 0)
                } else {
                    let n = patch_embedded_pointers(region, &oopmap, &FixedOffset(delta), workers);
                    (PatchKind::FixedOffset, n)
                }
            }
            (dump, runtime) => {
                return Err(ArchiveError::Environment(format!(
                    "can not relocate {:?} references to {:?}",
                    dump, runtime
                )))
            }
        };

        let natives = if native_delta != 0 && ptrmap.size() != 0 {
            patch_embedded_pointers(region, &ptrmap, &NativeDelta(native_delta), workers)
        } else {
            0
        };
        log::debug!(
            target: "cds::reloc",
            "patched {} references ({:?}) and {} metadata pointers (delta {:#x})",
            oops,
            kind,
            natives,
            native_delta
        );
        Ok((kind, oops, natives))
    }

    /// Walks the region object by object. Every header must name a known
    /// klass and every object must end inside the region.
    fn verify_loaded_objects<H: ArchiveHeapSupport + ?Sized>(
        &self,
        heap: &H,
        start: u64,
        byte_size: usize,
    ) -> Result<usize> {
        if !self.options.verify {
            return Ok(0);
        }
        let end = start + byte_size as u64;
        let mut cur = start;
        let mut count = 0;
        while cur < end {
            let corrupt = |what: String| {
                Err(ArchiveError::region(
                    RegionIndex::Heap.name(),
                    RegionFailure::Map(what),
                ))
            };
            if object::is_filler_word(heap.memory(cur, HEAP_WORD_SIZE), 0) {
                cur += HEAP_WORD_SIZE as u64;
                count += 1;
                continue;
            }
            if end - cur < HEADER_SIZE as u64 {
                return corrupt(format!("truncated object at {:#x}", cur));
            }
            let id = heap.klass_of(cur);
            if heap.klasses().get(id).is_none() {
                return corrupt(format!("unknown klass {} at {:#x}", id, cur));
            }
            let size = heap.klasses().object_size(heap.memory(cur, HEADER_SIZE), 0) as u64;
            if size == 0 || size > end - cur {
                return corrupt(format!("object at {:#x} of {} bytes overruns the region", cur, size));
            }
            cur += size;
            count += 1;
        }
        logln_if!(
            self.options.verbose,
            target: "cds::heap",
            "verified {} archived objects",
            count
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveSelection, DumpConfig, MetadataDelta};
    use crate::demo::{self, DemoGraph};
    use crate::dump::{dump_archive, HeapDump, MetadataArchive};
    use crate::filemap::ArchiveKind;
    use crate::gc::compressed::NarrowOopEncoding;
    use crate::gc::runtime_heap::{RuntimeHeap, RuntimeHeapConfig};
    use crate::gc::source_heap::SourceHeap;
    use crate::oops::klass::{FieldType, KlassId, KlassTable};
    use heapsnap_os::page_size;
    use std::fs;
    use std::path::Path;

    const MB: usize = 1024 * 1024;
    const DUMP_BASE: u64 = 0x8_0000_0000;

    fn pair_klasses(oop_size: usize) -> (KlassTable, KlassId) {
        let mut table = KlassTable::new(oop_size);
        let pair = table.register_instance("Pair", &[FieldType::Oop, FieldType::Int]);
        (table, pair)
    }

    fn runtime_heap(klasses: KlassTable, compressed: bool, oop_shift: Option<u32>, can_map: bool) -> RuntimeHeap {
        let config = RuntimeHeapConfig {
            heap_size: 16 * MB,
            region_size: MB,
            compressed_oops: compressed,
            oop_shift,
            can_map,
            can_load: true,
        };
        RuntimeHeap::new(klasses, &config).unwrap()
    }

    /// Dumps A <-> B with roots [A, B, A].
    fn dump_pair(path: &Path, klasses: &KlassTable, pair: KlassId, base: u64, capacity: usize, encoding: OopEncoding) {
        let mut heap = SourceHeap::new(klasses.clone(), base, capacity, encoding);
        let a = heap.allocate_instance(pair).unwrap();
        let b = heap.allocate_instance(pair).unwrap();
        heap.set_oop_field(a, 0, Some(b));
        heap.set_oop_field(b, 0, Some(a));
        heap.set_int_field(a, 1, 10);
        heap.set_int_field(b, 1, 20);
        let selection = ArchiveSelection {
            open: vec![a, b],
            closed: vec![],
            roots: vec![a, b, a],
        };
        dump_archive(
            path,
            &DumpConfig::default(),
            Some(HeapDump {
                heap: &heap,
                selection: &selection,
                relocator: &MetadataDelta(0),
            }),
            MetadataArchive::empty(DUMP_BASE),
        )
        .unwrap();
    }

    fn check_pair(heap: &RuntimeHeap, loaded: &LoadedHeap) {
        assert_eq!(loaded.root_count(), 3);
        let a = loaded.root(heap, 0).unwrap();
        let b = loaded.root(heap, 1).unwrap();
        assert_eq!(loaded.root(heap, 2), Some(a));
        assert!(loaded.contains(a) && loaded.contains(b));
        assert_eq!(heap.oop_field(a, 0), Some(b));
        assert_eq!(heap.oop_field(b, 0), Some(a));
        assert_eq!(heap.int_field(a, 1), 10);
        assert_eq!(heap.int_field(b, 1), 20);
    }

    fn load(path: &Path, heap: &mut RuntimeHeap, options: LoadOptions) -> Result<LoadedHeap> {
        let mut info = FileMapInfo::open(path, ArchiveKind::Static, &options.vm_ident, options.verify)?;
        ArchiveHeapLoader::new(options).map_or_load(&mut info, heap)
    }

    #[test]
    #[cfg(target_family = "unix")]
    fn test_map_at_requested_address_needs_no_patching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.jsa");
        let (klasses, pair) = pair_klasses(4);
        let mut heap = runtime_heap(klasses.clone(), true, None, true);
        dump_pair(&path, &klasses, pair, heap.start(), 16 * MB, heap.encoding());

        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.mode, HeapLoadMode::Mapped);
        assert_eq!(loaded.patch, PatchKind::None);
        assert_eq!(loaded.patched_oops, 0);
        assert_eq!(heap.live_archive_regions(), 1);
        check_pair(&heap, &loaded);
    }

    #[test]
    fn test_quick_delta_when_shift_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quick.jsa");
        let (klasses, pair) = pair_klasses(4);
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 3, page_size() as u64));
        // The dump heap is larger, so the requested range is outside the
        // runtime heap.
        dump_pair(&path, &klasses, pair, DUMP_BASE, 64 * MB, encoding);

        let mut heap = runtime_heap(klasses, true, Some(3), true);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.patch, PatchKind::QuickDelta);
        assert_eq!(loaded.patched_oops, 5);
        check_pair(&heap, &loaded);
    }

    #[test]
    fn test_full_decode_when_shift_differs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.jsa");
        let (klasses, pair) = pair_klasses(4);
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 0, page_size() as u64));
        dump_pair(&path, &klasses, pair, DUMP_BASE, 32 * MB, encoding);

        let mut heap = runtime_heap(klasses, true, Some(3), true);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.patch, PatchKind::FullDecode);
        check_pair(&heap, &loaded);
    }

    #[test]
    fn test_load_uncompressed_adds_fixed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.jsa");
        let (klasses, pair) = pair_klasses(8);
        dump_pair(&path, &klasses, pair, 0x7000_0000, 16 * MB, OopEncoding::Uncompressed);

        let mut heap = runtime_heap(klasses, false, None, true);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.mode, HeapLoadMode::Loaded);
        assert_eq!(loaded.patch, PatchKind::FixedOffset);
        assert_eq!(loaded.patched_oops, 5);
        check_pair(&heap, &loaded);
    }

    #[test]
    fn test_load_compressed_when_mapping_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nomap.jsa");
        let (klasses, pair) = pair_klasses(4);
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 3, page_size() as u64));
        dump_pair(&path, &klasses, pair, DUMP_BASE, 16 * MB, encoding);

        let mut heap = runtime_heap(klasses, true, Some(3), false);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.mode, HeapLoadMode::Loaded);
        check_pair(&heap, &loaded);
    }

    fn corrupt_heap_midpoint(path: &Path) {
        let header = FileMapInfo::read_header(path).unwrap();
        let hp = header.region(RegionIndex::Heap);
        let mut bytes = fs::read(path).unwrap();
        bytes[(hp.file_offset + hp.used / 2) as usize] ^= 0x5a;
        fs::write(path, &bytes).unwrap();
    }

    #[test]
    fn test_corrupted_heap_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.jsa");
        let (klasses, pair) = pair_klasses(8);
        dump_pair(&path, &klasses, pair, 0x7000_0000, 16 * MB, OopEncoding::Uncompressed);
        corrupt_heap_midpoint(&path);

        let mut heap = runtime_heap(klasses.clone(), false, None, true);
        let err = match load(&path, &mut heap, LoadOptions::default()) {
            Err(e) => e,
            Ok(_) => panic!("corrupted archive accepted"),
        };
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            ArchiveError::Region {
                region: "hp",
                kind: RegionFailure::Crc { .. }
            }
        ));
        assert_eq!(heap.live_archive_regions(), 0);

        let mut heap = runtime_heap(klasses, false, None, true);
        let options = LoadOptions::default().with_require_archive(true);
        let err = match load(&path, &mut heap, options) {
            Err(e) => e,
            Ok(_) => panic!("corrupted archive accepted"),
        };
        assert!(!err.is_recoverable());
    }

    #[test]
    #[cfg(target_family = "unix")]
    fn test_mapped_corruption_releases_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt-map.jsa");
        let (klasses, pair) = pair_klasses(4);
        let mut heap = runtime_heap(klasses.clone(), true, None, true);
        dump_pair(&path, &klasses, pair, heap.start(), 16 * MB, heap.encoding());
        corrupt_heap_midpoint(&path);

        assert!(load(&path, &mut heap, LoadOptions::default()).is_err());
        assert_eq!(heap.live_archive_regions(), 0);
        // The released range can be handed out again.
        assert!(heap.alloc_archive_region(MB, 0).is_some());
    }

    fn expect_heap_crc_failure(result: Result<LoadedHeap>) {
        match result {
            Err(ArchiveError::Region {
                region: "hp",
                kind: RegionFailure::Crc { .. },
            }) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("corrupted archive accepted"),
        }
    }

    /// One compressed A <-> B archive with roots [A, B, A], mapped and
    /// loaded, then rejected on both paths once the heap region is damaged.
    #[test]
    fn test_pair_archive_on_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.jsa");
        let (klasses, pair) = pair_klasses(4);
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 3, page_size() as u64));
        dump_pair(&path, &klasses, pair, DUMP_BASE, 64 * MB, encoding);

        let mut heap = runtime_heap(klasses.clone(), true, Some(3), false);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        assert_eq!(loaded.mode, HeapLoadMode::Loaded);
        check_pair(&heap, &loaded);

        #[cfg(target_family = "unix")]
        {
            let mut heap = runtime_heap(klasses.clone(), true, Some(3), true);
            let mapped = load(&path, &mut heap, LoadOptions::default()).unwrap();
            assert_eq!(mapped.mode, HeapLoadMode::Mapped);
            assert_eq!(mapped.patch, PatchKind::QuickDelta);
            assert_eq!(heap.live_archive_regions(), 1);
            check_pair(&heap, &mapped);
        }
        #[cfg(not(target_family = "unix"))]
        eprintln!("fixed-address file mapping unavailable, map path not exercised");

        corrupt_heap_midpoint(&path);

        let mut heap = runtime_heap(klasses.clone(), true, Some(3), false);
        expect_heap_crc_failure(load(&path, &mut heap, LoadOptions::default()));
        assert!(heap.alloc_loaded_archive_space(MB).is_some());

        #[cfg(target_family = "unix")]
        {
            let mut heap = runtime_heap(klasses, true, Some(3), true);
            expect_heap_crc_failure(load(&path, &mut heap, LoadOptions::default()));
            assert_eq!(heap.live_archive_regions(), 0);
        }
    }

    #[test]
    fn test_environment_mismatch_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.jsa");
        let (klasses, pair) = pair_klasses(4);
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 3, page_size() as u64));
        dump_pair(&path, &klasses, pair, DUMP_BASE, 16 * MB, encoding);

        let (klasses8, _) = pair_klasses(8);
        let mut heap = runtime_heap(klasses8, false, None, true);
        match load(&path, &mut heap, LoadOptions::default()) {
            Err(ArchiveError::Environment(_)) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("archive accepted"),
        }
    }

    fn dump_demo(path: &Path, nodes: usize) -> (KlassTable, KlassId) {
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(DUMP_BASE, 3, page_size() as u64));
        let graph = DemoGraph::build(encoding, DUMP_BASE, 32 * MB, nodes).unwrap();
        let config = DumpConfig::default();
        let metadata = DemoGraph::metadata(config.core_region_alignment as u64);
        dump_archive(
            path,
            &config,
            Some(HeapDump {
                heap: &graph.heap,
                selection: &graph.selection,
                relocator: &graph.relocator,
            }),
            metadata,
        )
        .unwrap();
        (graph.heap.klasses().clone(), graph.node_klass)
    }

    #[test]
    fn test_metadata_pointers_follow_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.jsa");
        let (klasses, node) = dump_demo(&path, 50);

        let mut heap = runtime_heap(klasses, true, Some(3), true);
        let loaded = load(&path, &mut heap, LoadOptions::default()).unwrap();
        let core = loaded.metadata().unwrap();
        assert_eq!(loaded.patched_natives, 50);
        demo::verify_demo(&heap, &loaded, 50, node, Some(core.base())).unwrap();
        let ro_base = core.ro().as_ptr() as u64;
        for k in 0..8 {
            assert_eq!(demo::metadata_slot(core, k), ro_base + k as u64 * 8);
        }
    }

    #[test]
    fn test_metadata_delta_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delta.jsa");
        let (klasses, node) = dump_demo(&path, 10);

        let mut heap = runtime_heap(klasses, true, Some(3), true);
        let options = LoadOptions::default().with_metadata_delta(0x1000);
        let loaded = load(&path, &mut heap, options).unwrap();
        assert!(loaded.metadata().is_none());
        demo::verify_demo(
            &heap,
            &loaded,
            10,
            node,
            Some(demo::METADATA_REQUESTED_BASE + 0x1000),
        )
        .unwrap();
    }

    #[test]
    fn test_parallel_patching_matches_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parallel.jsa");
        let (klasses, node) = dump_demo(&path, 3000);

        let mut sequential = runtime_heap(klasses.clone(), true, Some(3), false);
        let a = load(&path, &mut sequential, LoadOptions::default()).unwrap();
        let mut parallel = runtime_heap(klasses, true, Some(3), false);
        let b = load(&path, &mut parallel, LoadOptions::default().with_workers(4)).unwrap();

        assert_eq!(a.patch, b.patch);
        assert_eq!(a.patched_oops, b.patched_oops);
        assert_eq!(a.patched_natives, b.patched_natives);
        let core_a = a.metadata().unwrap().base();
        let core_b = b.metadata().unwrap().base();
        demo::verify_demo(&sequential, &a, 3000, node, Some(core_a)).unwrap();
        demo::verify_demo(&parallel, &b, 3000, node, Some(core_b)).unwrap();
    }
}
