/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::buffer::{ArchiveBuffer, BufferOffset};
use crate::filemap::header::{default_vm_ident, ArchiveKind};
use crate::gc::bitmap::RelocBitmap;
use crate::gc::compressed::NarrowKlassEncoding;
use crate::gc::constants::MIN_GC_REGION_ALIGNMENT;
use crate::gc::source_heap::SourceHeap;
use crate::oops::Oop;
use crate::utils::offset_address;
use fxhash::FxHashMap;

/// Knobs of one dump.
#[derive(Clone, Debug)]
pub struct DumpConfig {
    pub kind: ArchiveKind,
    /// No archived object straddles a multiple of this, counted from the
    /// start of the heap region.
    pub heap_region_alignment: usize,
    /// File offsets of regions are multiples of this.
    pub core_region_alignment: usize,
    /// Name of the static archive a dynamic archive extends.
    pub base_archive_name: Option<String>,
    pub vm_ident: String,
    pub narrow_klass: NarrowKlassEncoding,
    pub verbose: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            kind: ArchiveKind::Static,
            heap_region_alignment: MIN_GC_REGION_ALIGNMENT,
            core_region_alignment: heapsnap_os::page_size(),
            base_archive_name: None,
            vm_ident: default_vm_ident(),
            narrow_klass: NarrowKlassEncoding::DEFAULT,
            verbose: false,
        }
    }
}

impl DumpConfig {
    pub fn with_heap_region_alignment(mut self, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        self.heap_region_alignment = alignment;
        self
    }

    pub fn with_kind(mut self, kind: ArchiveKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_base_archive_name(mut self, name: impl Into<String>) -> Self {
        self.base_archive_name = Some(name.into());
        self
    }

    pub fn with_vm_ident(mut self, ident: impl Into<String>) -> Self {
        self.vm_ident = ident.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Objects chosen for archiving. Open objects may be written at runtime,
/// closed ones are immutable and must only reference archived objects.
/// Roots are the entry points recorded in the root table.
#[derive(Clone, Debug, Default)]
pub struct ArchiveSelection {
    pub open: Vec<Oop>,
    pub closed: Vec<Oop>,
    pub roots: Vec<Oop>,
}

impl ArchiveSelection {
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.closed.is_empty() && self.roots.is_empty()
    }
}

/// Translates a metadata pointer of the dumping process to the address that
/// metadata is requested to live at when the archive is mapped.
pub trait MetadataRelocator {
    fn requested_address(&self, ptr: u64) -> Option<u64>;
}

/// Metadata that moves by one constant delta.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataDelta(pub i64);

impl MetadataRelocator for MetadataDelta {
    fn requested_address(&self, ptr: u64) -> Option<u64> {
        Some(offset_address(ptr, self.0))
    }
}

/// State of one heap dump. Borrows the source heap, so it can not outlive
/// the dump pass.
pub struct ArchiveBuildContext<'a> {
    pub(crate) config: DumpConfig,
    pub(crate) heap: &'a SourceHeap,
    pub(crate) metadata: &'a dyn MetadataRelocator,
    pub(crate) buffer: ArchiveBuffer,

    pub(crate) source_to_buffer: FxHashMap<Oop, BufferOffset>,
    pub(crate) buffer_to_source: FxHashMap<BufferOffset, Oop>,
    /// Source objects in the order they were copied.
    pub(crate) copy_order: Vec<Oop>,
    pub(crate) fillers: Vec<(BufferOffset, usize)>,

    pub(crate) roots_offset: Option<BufferOffset>,
    pub(crate) open_end: usize,
    pub(crate) closed_start: usize,
    pub(crate) closed_end: usize,

    pub(crate) requested_bottom: u64,
    pub(crate) requested_top: u64,

    pub(crate) oopmap: RelocBitmap,
    pub(crate) ptrmap: RelocBitmap,
}

impl<'a> ArchiveBuildContext<'a> {
    pub fn new(
        heap: &'a SourceHeap,
        metadata: &'a dyn MetadataRelocator,
        config: DumpConfig,
    ) -> Self {
        Self {
            config,
            heap,
            metadata,
            buffer: ArchiveBuffer::with_capacity(heap.used().min(64 * 1024 * 1024)),
            source_to_buffer: FxHashMap::default(),
            buffer_to_source: FxHashMap::default(),
            copy_order: vec![],
            fillers: vec![],
            roots_offset: None,
            open_end: 0,
            closed_start: 0,
            closed_end: 0,
            requested_bottom: 0,
            requested_top: 0,
            oopmap: RelocBitmap::new(),
            ptrmap: RelocBitmap::new(),
        }
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    pub fn heap(&self) -> &'a SourceHeap {
        self.heap
    }

    pub fn buffer(&self) -> &ArchiveBuffer {
        &self.buffer
    }

    pub fn buffered_offset_of(&self, obj: Oop) -> Option<BufferOffset> {
        self.source_to_buffer.get(&obj).copied()
    }

    /// Source object copied to `offset`; fillers and the root table have
    /// none.
    pub fn source_at(&self, offset: BufferOffset) -> Option<Oop> {
        self.buffer_to_source.get(&offset).copied()
    }

    pub fn is_archived(&self, obj: Oop) -> bool {
        self.source_to_buffer.contains_key(&obj)
    }

    /// Filler arrays inserted so far as `(offset, byte size)`.
    pub fn fillers(&self) -> &[(BufferOffset, usize)] {
        &self.fillers
    }

    pub fn roots_offset(&self) -> Option<BufferOffset> {
        self.roots_offset
    }

    pub fn oopmap(&self) -> &RelocBitmap {
        &self.oopmap
    }

    pub fn ptrmap(&self) -> &RelocBitmap {
        &self.ptrmap
    }

    pub(crate) fn verbose(&self) -> bool {
        self.config.verbose
    }
}
