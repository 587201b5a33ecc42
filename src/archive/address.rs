/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::buffer::BufferOffset;
use super::context::ArchiveBuildContext;
use crate::error::{DumpError, Result};
use crate::gc::compressed::OopEncoding;
use crate::gc::constants::NOCOOPS_REQUESTED_BASE;
use crate::oops::Oop;
use heapsnap_os::align_down_u64;

impl<'a> ArchiveBuildContext<'a> {
    /// Chooses where the buffer is requested to live at runtime.
    ///
    /// With compressed oops the closed objects end at the top of the dump
    /// heap (aligned down to the region alignment) and the open objects sit
    /// directly below them. With full-width references the buffer starts at
    /// [`NOCOOPS_REQUESTED_BASE`].
    pub(crate) fn set_requested_address_range(&mut self) -> Result<()> {
        let used = self.buffer.used();
        let alignment = self.config.heap_region_alignment as u64;
        let bottom = match self.heap.encoding() {
            OopEncoding::Compressed(_) => {
                let top = self.heap.reserved_end();
                let closed_size = (self.closed_end - self.closed_start) as u64;
                let too_small = || DumpError::HeapTooSmall { size: used, top };
                let closed_requested = top
                    .checked_sub(closed_size)
                    .map(|addr| align_down_u64(addr, alignment))
                    .ok_or_else(too_small)?;
                let bottom = closed_requested
                    .checked_sub(self.closed_start as u64)
                    .ok_or_else(too_small)?;
                if bottom < self.heap.base() {
                    return Err(too_small().into());
                }
                bottom
            }
            OopEncoding::Uncompressed => NOCOOPS_REQUESTED_BASE,
        };
        self.requested_bottom = bottom;
        self.requested_top = bottom + used as u64;

        log::info!(
            target: "cds::heap",
            "heap region requested at [{:#x}, {:#x}), closed objects from {:#x}",
            self.requested_bottom,
            self.requested_top,
            self.requested_bottom + self.closed_start as u64
        );
        Ok(())
    }

    pub fn requested_bottom(&self) -> u64 {
        self.requested_bottom
    }

    pub fn requested_address_of(&self, offset: BufferOffset) -> u64 {
        debug_assert!(offset.get() <= self.buffer.used());
        self.requested_bottom + offset.get() as u64
    }

    /// Requested address of an archived source object.
    pub fn source_to_requested(&self, obj: Oop) -> Option<u64> {
        self.buffered_offset_of(obj)
            .map(|offset| self.requested_address_of(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::super::context::{ArchiveSelection, DumpConfig, MetadataDelta};
    use super::*;
    use crate::gc::compressed::NarrowOopEncoding;
    use crate::gc::source_heap::SourceHeap;
    use crate::oops::klass::{KlassTable, FILLER_KLASS};

    const ALIGN: usize = 4096;

    fn run(heap: &SourceHeap, selection: &ArchiveSelection) -> (u64, usize, usize) {
        let meta = MetadataDelta(0);
        let config = DumpConfig::default().with_heap_region_alignment(ALIGN);
        let mut ctx = ArchiveBuildContext::new(heap, &meta, config);
        ctx.copy_source_objs_to_buffer(selection).unwrap();
        ctx.set_requested_address_range().unwrap();
        (ctx.requested_bottom, ctx.closed_start, ctx.closed_end)
    }

    #[test]
    fn test_closed_objects_end_at_heap_top() {
        let base = 0x8_0000_0000;
        let capacity = 1 << 22;
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(base, 3, 4096));
        let mut heap = SourceHeap::new(KlassTable::new(4), base, capacity, encoding);
        let open = heap.allocate_array(FILLER_KLASS, 10).unwrap();
        let closed = heap.allocate_array(FILLER_KLASS, 100).unwrap();
        let selection = ArchiveSelection {
            open: vec![open],
            closed: vec![closed],
            roots: vec![open],
        };
        let (bottom, closed_start, closed_end) = run(&heap, &selection);
        let top = base + capacity as u64;
        let closed_requested = bottom + closed_start as u64;
        assert_eq!(closed_requested % ALIGN as u64, 0);
        assert!(closed_requested + (closed_end - closed_start) as u64 <= top);
        assert!(top - closed_requested < 2 * ALIGN as u64);
        assert!(bottom >= base);
    }

    #[test]
    fn test_uncompressed_uses_fixed_base() {
        let mut heap = SourceHeap::new(
            KlassTable::new(8),
            0x7000_0000_0000,
            1 << 20,
            OopEncoding::Uncompressed,
        );
        let obj = heap.allocate_obj_array(2).unwrap();
        let selection = ArchiveSelection {
            open: vec![obj],
            closed: vec![],
            roots: vec![obj],
        };
        let (bottom, _, _) = run(&heap, &selection);
        assert_eq!(bottom, NOCOOPS_REQUESTED_BASE);
    }

    #[test]
    fn test_heap_too_small() {
        let base = 0x8_0000_0000;
        let encoding = OopEncoding::Compressed(NarrowOopEncoding::heap_based(base, 3, 4096));
        let mut heap = SourceHeap::new(KlassTable::new(4), base, 3 * ALIGN, encoding);
        // Four objects of almost a region each need four regions in the
        // buffer, one more than the heap has.
        let objs: Vec<_> = (0..4)
            .map(|_| heap.allocate_array(FILLER_KLASS, 740).unwrap())
            .collect();
        let meta = MetadataDelta(0);
        let config = DumpConfig::default().with_heap_region_alignment(ALIGN);
        let mut ctx = ArchiveBuildContext::new(&heap, &meta, config);
        let selection = ArchiveSelection {
            open: objs[..3].to_vec(),
            closed: objs[3..].to_vec(),
            roots: vec![],
        };
        ctx.copy_source_objs_to_buffer(&selection).unwrap();
        assert_eq!(ctx.closed_start, 3 * ALIGN);
        let err = ctx.set_requested_address_range().unwrap_err();
        assert!(matches!(
            err,
            crate::error::ArchiveError::Dump(DumpError::HeapTooSmall { .. })
        ));
    }
}
