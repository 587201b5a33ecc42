/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Rewrites buffered objects so that every reference holds the requested
//! address of its target, and marks each rewritten slot in the heap oop map
//! (references) or pointer map (metadata pointers).
use super::buffer::BufferOffset;
use super::context::ArchiveBuildContext;
use crate::error::{DumpError, Result};
use crate::gc::bitmap::RelocBitmap;
use crate::gc::constants::METADATA_POINTER_SIZE;
use crate::oops::object::{self, HEADER_SIZE};
use crate::oops::{Oop, Slot, SlotKind};
use crate::utils::{get_u64, put_u64};
use fxhash::FxHashSet;

impl<'a> ArchiveBuildContext<'a> {
    pub(crate) fn relocate_embedded_oops(&mut self, roots: &[Oop]) -> Result<()> {
        let used = self.buffer.used();
        self.oopmap = RelocBitmap::with_size(used / self.heap.encoding().oop_size());
        self.ptrmap = RelocBitmap::with_size(used / METADATA_POINTER_SIZE);

        let order = std::mem::take(&mut self.copy_order);
        let result = order.iter().try_for_each(|obj| self.relocate_object(*obj));
        self.copy_order = order;
        result?;

        self.relocate_root_table(roots)?;

        log::info!(
            target: "cds::heap",
            "relocated {} references and {} metadata pointers",
            self.oopmap.count_ones(),
            self.ptrmap.count_ones()
        );
        Ok(())
    }

    fn relocate_object(&mut self, obj: Oop) -> Result<()> {
        let heap = self.heap;
        let encoding = heap.encoding();
        let oop_size = encoding.oop_size();
        let buffered = match self.buffered_offset_of(obj) {
            Some(offset) => offset.get(),
            None => return Ok(()),
        };

        let mut slots: Vec<Slot> = vec![];
        heap.iterate_slots(obj, &mut |slot| slots.push(slot));

        for slot in slots {
            let at = buffered + slot.offset;
            match slot.kind {
                SlotKind::Oop => {
                    let target = heap.load_oop_at(obj, slot.offset);
                    if target == 0 {
                        continue;
                    }
                    let requested = self.source_to_requested(Oop(target)).ok_or(
                        DumpError::UnarchivedReference {
                            from: obj.address(),
                            to: target,
                        },
                    )?;
                    encoding.store(self.buffer.as_mut_slice(), at, requested);
                    debug_assert_eq!(at % oop_size, 0);
                    self.oopmap.set(at / oop_size);
                }
                SlotKind::Metadata => {
                    let value = heap.load_u64_at(obj, slot.offset);
                    if value == 0 {
                        continue;
                    }
                    let requested = self.metadata.requested_address(value).ok_or(
                        DumpError::UnrelocatableMetadata {
                            object: obj.address(),
                            value,
                        },
                    )?;
                    put_u64(self.buffer.as_mut_slice(), at, requested);
                    debug_assert_eq!(at % METADATA_POINTER_SIZE, 0);
                    self.ptrmap.set(at / METADATA_POINTER_SIZE);
                }
            }
        }
        logln_if!(
            self.verbose(),
            target: "cds::reloc",
            "relocated {:?} at buffer+{:#x}",
            obj,
            buffered
        );
        Ok(())
    }

    fn relocate_root_table(&mut self, roots: &[Oop]) -> Result<()> {
        let table = match self.roots_offset {
            Some(offset) => offset.get(),
            None => return Ok(()),
        };
        let encoding = self.heap.encoding();
        let oop_size = encoding.oop_size();
        for (i, root) in roots.iter().enumerate() {
            let requested = self
                .source_to_requested(*root)
                .ok_or(DumpError::UnarchivedRoot(root.address()))?;
            let at = table + HEADER_SIZE + i * oop_size;
            encoding.store(self.buffer.as_mut_slice(), at, requested);
            self.oopmap.set(at / oop_size);
        }
        Ok(())
    }

    /// Walks the finished buffer and checks that the bitmaps mark exactly the
    /// non-null pointer slots and that every reference lands on an object
    /// start inside the requested range. Every object other than a filler or
    /// the root table must map back to a source object with the same hash.
    pub fn verify_relocation(&self) -> std::result::Result<(), String> {
        let bytes = self.buffer.as_slice();
        let encoding = self.heap.encoding();
        let oop_size = encoding.oop_size();
        let klasses = self.heap.klasses();

        let mut starts = FxHashSet::default();
        let mut expected_oops = RelocBitmap::with_size(self.oopmap.size());
        let mut expected_ptrs = RelocBitmap::with_size(self.ptrmap.size());
        let fillers: FxHashSet<usize> =
            self.fillers.iter().map(|(at, _)| at.get()).collect();
        let roots = self.roots_offset.map(|at| at.get());
        let mut cur = 0;
        while cur < bytes.len() {
            starts.insert(cur);
            match self.source_at(BufferOffset::new(cur)) {
                Some(src) => {
                    let expected = self.heap.mark(src).for_archive();
                    if object::mark(bytes, cur) != expected {
                        return Err(format!(
                            "{:?} at {:#x} does not carry the identity hash of its source",
                            src, cur
                        ));
                    }
                }
                None if fillers.contains(&cur) || roots == Some(cur) => {}
                None => return Err(format!("no source object was copied to {:#x}", cur)),
            }
            let mut slots: Vec<Slot> = vec![];
            klasses.iterate_slots(
                bytes,
                cur,
                &mut crate::oops::SimpleVisitor::new(&mut |slot| slots.push(slot)),
            );
            for slot in slots {
                let at = cur + slot.offset;
                match slot.kind {
                    SlotKind::Oop if encoding.load(bytes, at) != 0 => {
                        expected_oops.set(at / oop_size)
                    }
                    SlotKind::Metadata if get_u64(bytes, at) != 0 => {
                        expected_ptrs.set(at / METADATA_POINTER_SIZE)
                    }
                    _ => {}
                }
            }
            cur += klasses.object_size(bytes, cur);
        }
        if cur != bytes.len() {
            return Err(format!("last object overruns the buffer by {}", cur - bytes.len()));
        }
        expected_oops.resize(self.oopmap.size());
        expected_ptrs.resize(self.ptrmap.size());
        if expected_oops != self.oopmap {
            return Err("oop map does not match the non-null reference slots".to_string());
        }
        if expected_ptrs != self.ptrmap {
            return Err("pointer map does not match the non-null metadata slots".to_string());
        }
        for bit in self.oopmap.iter_set() {
            let target = encoding.load(bytes, bit * oop_size);
            if target < self.requested_bottom || target >= self.requested_top {
                return Err(format!("slot {} points outside the region: {:#x}", bit, target));
            }
            if !starts.contains(&((target - self.requested_bottom) as usize)) {
                return Err(format!("slot {} points into the middle of an object", bit));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::context::{ArchiveSelection, DumpConfig, MetadataDelta};
    use super::*;
    use crate::error::ArchiveError;
    use crate::gc::compressed::{NarrowOopEncoding, OopEncoding};
    use crate::gc::source_heap::SourceHeap;
    use crate::oops::klass::{FieldType, KlassId, KlassTable};

    fn heap(compressed: bool) -> (SourceHeap, KlassId) {
        let oop_size = if compressed { 4 } else { 8 };
        let mut table = KlassTable::new(oop_size);
        let node = table.register_instance(
            "Node",
            &[FieldType::Oop, FieldType::Metadata, FieldType::Oop, FieldType::Int],
        );
        let base = 0x8_0000_0000;
        let encoding = if compressed {
            OopEncoding::Compressed(NarrowOopEncoding::heap_based(base, 3, 4096))
        } else {
            OopEncoding::Uncompressed
        };
        (SourceHeap::new(table, base, 1 << 22, encoding), node)
    }

    fn build<'h>(
        heap: &'h SourceHeap,
        selection: &ArchiveSelection,
        meta: &'h MetadataDelta,
    ) -> Result<ArchiveBuildContext<'h>> {
        let meta: &dyn super::super::context::MetadataRelocator = meta;
        let mut ctx = ArchiveBuildContext::new(
            heap,
            meta,
            DumpConfig::default().with_heap_region_alignment(4096),
        );
        ctx.copy_source_objs_to_buffer(selection)?;
        ctx.set_requested_address_range()?;
        ctx.relocate_embedded_oops(&selection.roots)?;
        Ok(ctx)
    }

    #[test]
    fn test_bitmaps_cover_all_pointers() {
        for compressed in &[true, false] {
            let (mut heap, node) = heap(*compressed);
            let nodes: Vec<Oop> = (0..50).map(|_| heap.allocate_instance(node).unwrap()).collect();
            for (i, n) in nodes.iter().enumerate() {
                heap.set_oop_field(*n, 0, Some(nodes[(i + 1) % nodes.len()]));
                if i % 3 == 0 {
                    heap.set_oop_field(*n, 2, Some(nodes[i / 2]));
                }
                if i % 2 == 0 {
                    heap.set_metadata_field(*n, 1, 0x7f00_0000 + i as u64 * 8);
                }
            }
            let selection = ArchiveSelection {
                open: nodes[..30].to_vec(),
                closed: nodes[30..].to_vec(),
                roots: vec![nodes[0], nodes[42]],
            };
            let meta = MetadataDelta(0x1000);
            let ctx = build(&heap, &selection, &meta).unwrap();
            ctx.verify_relocation().unwrap();
            // 50 next links, 17 extra links, 2 roots
            assert_eq!(ctx.oopmap().count_ones(), 50 + 17 + 2);
            assert_eq!(ctx.ptrmap().count_ones(), 25);

            let at = ctx.buffered_offset_of(nodes[4]).unwrap().get();
            let field = heap.klasses().klass(node).field(1).offset;
            assert_eq!(get_u64(ctx.buffer().as_slice(), at + field), 0x7f00_0000 + 32 + 0x1000);
        }
    }

    #[test]
    fn test_references_use_requested_addresses() {
        let (mut heap, node) = heap(true);
        let a = heap.allocate_instance(node).unwrap();
        let b = heap.allocate_instance(node).unwrap();
        heap.set_oop_field(a, 0, Some(b));
        heap.set_oop_field(b, 0, Some(a));
        let selection = ArchiveSelection {
            open: vec![a],
            closed: vec![b],
            roots: vec![a],
        };
        let meta = MetadataDelta(0);
        let ctx = build(&heap, &selection, &meta).unwrap();
        let encoding = heap.encoding();
        let bytes = ctx.buffer().as_slice();
        let a_at = ctx.buffered_offset_of(a).unwrap().get();
        let b_at = ctx.buffered_offset_of(b).unwrap().get();
        assert_eq!(encoding.load(bytes, a_at + 16), ctx.source_to_requested(b).unwrap());
        assert_eq!(encoding.load(bytes, b_at + 16), ctx.source_to_requested(a).unwrap());
        let roots = ctx.roots_offset().unwrap().get();
        assert_eq!(encoding.load(bytes, roots + 16), ctx.source_to_requested(a).unwrap());
    }

    #[test]
    fn test_verification_traces_objects_to_their_source() {
        let (mut heap, node) = heap(true);
        let a = heap.allocate_instance(node).unwrap();
        let b = heap.allocate_instance(node).unwrap();
        let hashed = heap.mark(a).copy_set_hash(0x77);
        heap.set_mark(a, hashed);
        let selection = ArchiveSelection {
            open: vec![a],
            closed: vec![b],
            roots: vec![b],
        };
        let meta = MetadataDelta(0);
        let mut ctx = build(&heap, &selection, &meta).unwrap();
        let a_at = ctx.buffered_offset_of(a).unwrap();
        assert_eq!(ctx.source_at(a_at), Some(a));
        assert_eq!(ctx.source_at(ctx.roots_offset().unwrap()), None);
        ctx.verify_relocation().unwrap();

        let lost = object::mark(ctx.buffer().as_slice(), a_at.get()).copy_set_hash(0);
        object::set_mark(ctx.buffer.slice_mut(a_at, HEADER_SIZE), 0, lost);
        let err = ctx.verify_relocation().unwrap_err();
        assert!(err.contains("identity hash"), "{}", err);
    }

    #[test]
    fn test_reference_to_unarchived_object_fails() {
        let (mut heap, node) = heap(true);
        let a = heap.allocate_instance(node).unwrap();
        let outside = heap.allocate_instance(node).unwrap();
        heap.set_oop_field(a, 0, Some(outside));
        let selection = ArchiveSelection {
            open: vec![],
            closed: vec![a],
            roots: vec![],
        };
        let meta = MetadataDelta(0);
        match build(&heap, &selection, &meta) {
            Err(ArchiveError::Dump(DumpError::UnarchivedReference { from, to })) => {
                assert_eq!(from, a.address());
                assert_eq!(to, outside.address());
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("dump should fail"),
        }
    }
}
