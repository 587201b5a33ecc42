/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Copies selected objects into the archive buffer.
//!
//! Buffer layout: open objects, the root table, filler up to the next region
//! boundary, closed objects. Before each object is placed the copier checks
//! whether it (plus room for a minimal filler after it) would cross a
//! multiple of the region alignment; if so the rest of the current region is
//! covered with a filler first. A runtime collector with regions
//! of that size or larger can therefore map the buffer at any aligned
//! address and see only whole objects in each region.
use super::buffer::BufferOffset;
use super::context::{ArchiveBuildContext, ArchiveSelection};
use crate::error::{DumpError, Result};
use crate::oops::klass::OBJECT_ARRAY_KLASS;
use crate::oops::object::{self, MIN_FILLER_BYTE_SIZE};
use crate::oops::Oop;
use heapsnap_os::{align_down, align_up};

impl<'a> ArchiveBuildContext<'a> {
    pub(crate) fn copy_source_objs_to_buffer(&mut self, selection: &ArchiveSelection) -> Result<()> {
        for obj in &selection.open {
            self.copy_one_source_obj_to_buffer(*obj)?;
        }
        self.copy_roots_to_buffer(selection.roots.len())?;
        self.open_end = self.buffer.used();

        self.fill_to_region_boundary()?;

        self.closed_start = self.buffer.used();
        for obj in &selection.closed {
            self.copy_one_source_obj_to_buffer(*obj)?;
        }
        self.closed_end = self.buffer.used();

        log::info!(
            target: "cds::heap",
            "copied {} open and {} closed objects: open [0, {:#x}) closed [{:#x}, {:#x}), {} fillers",
            selection.open.len(),
            selection.closed.len(),
            self.open_end,
            self.closed_start,
            self.closed_end,
            self.fillers.len()
        );
        Ok(())
    }

    fn copy_one_source_obj_to_buffer(&mut self, obj: Oop) -> Result<BufferOffset> {
        if self.source_to_buffer.contains_key(&obj) {
            return Err(DumpError::DuplicateObject(obj.address()).into());
        }
        let heap = self.heap;
        let size = heap.size_of(obj);
        let limit = self.config.heap_region_alignment;
        if size > limit {
            return Err(DumpError::ObjectTooLarge {
                object: obj.address(),
                size,
                limit,
            }
            .into());
        }

        self.maybe_fill_gc_region_gap(size)?;

        let at = self.buffer.allocate(size);
        let bytes = self.buffer.slice_mut(at, size);
        bytes.copy_from_slice(heap.object_bytes(obj));
        object::set_mark(bytes, 0, heap.mark(obj).for_archive());

        self.source_to_buffer.insert(obj, at);
        self.buffer_to_source.insert(at, obj);
        self.copy_order.push(obj);

        logln_if!(
            self.verbose(),
            target: "cds::heap",
            "copied {:?} ({} bytes) to {:?}",
            obj,
            size,
            at
        );
        Ok(at)
    }

    /// Reserves the root table as an object array whose elements are filled
    /// in once requested addresses are known.
    fn copy_roots_to_buffer(&mut self, count: usize) -> Result<()> {
        let size = object::array_byte_size(self.heap.encoding().oop_size(), count);
        let limit = self.config.heap_region_alignment;
        if size > limit {
            return Err(DumpError::RootTableTooLarge { roots: count, limit }.into());
        }
        self.maybe_fill_gc_region_gap(size)?;
        let at = self.buffer.allocate(size);
        object::init_header(
            self.buffer.slice_mut(at, size),
            0,
            OBJECT_ARRAY_KLASS,
            Some(count),
        );
        self.roots_offset = Some(at);
        logln_if!(
            self.verbose(),
            target: "cds::heap",
            "root table with {} entries at {:?}",
            count,
            at
        );
        Ok(())
    }

    /// Pads the current region when the next `required_byte_size` bytes
    /// would cross its end or leave a tail too short for an `int[]`. An object
    /// that exactly fills the region, or starts on a boundary, goes in as is;
    /// a tail it leaves behind is closed with a one-word filler later.
    pub(crate) fn maybe_fill_gc_region_gap(&mut self, required_byte_size: usize) -> Result<()> {
        let alignment = self.config.heap_region_alignment;
        let used = self.buffer.used();
        let region_bottom = align_down(used, alignment);
        let region_end = region_bottom + alignment;
        let new_used = used + required_byte_size;

        let fits = new_used == region_end || new_used + MIN_FILLER_BYTE_SIZE <= region_end;
        if !fits && used != region_bottom {
            self.insert_filler(region_end - used)?;
            debug_assert_eq!(self.buffer.used(), region_end);
        }
        Ok(())
    }

    fn fill_to_region_boundary(&mut self) -> Result<()> {
        let used = self.buffer.used();
        let end = align_up(used, self.config.heap_region_alignment);
        if end != used {
            self.insert_filler(end - used)?;
        }
        Ok(())
    }

    fn insert_filler(&mut self, fill_bytes: usize) -> Result<()> {
        let at = self.buffer.allocate(fill_bytes);
        if !object::write_filler(self.buffer.slice_mut(at, fill_bytes), 0, fill_bytes) {
            return Err(DumpError::UnfillableGap {
                offset: at.get(),
                size: fill_bytes,
            }
            .into());
        }
        self.fillers.push((at, fill_bytes));
        logln_if!(
            self.verbose(),
            target: "cds::heap",
            "inserted {} byte filler at {:?}",
            fill_bytes,
            at
        );
        Ok(())
    }
}
