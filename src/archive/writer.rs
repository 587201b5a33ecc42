/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::context::{ArchiveBuildContext, ArchiveSelection};
use crate::error::Result;
use crate::gc::bitmap::RelocBitmap;
use crate::gc::compressed::OopEncoding;

/// Finished heap region, ready to be written to the archive file.
#[derive(Clone, Debug)]
pub struct ArchiveHeapInfo {
    pub buffer: Vec<u8>,
    pub oopmap: RelocBitmap,
    pub ptrmap: RelocBitmap,
    pub encoding: OopEncoding,
    /// Address the first byte of `buffer` is requested to be mapped at.
    pub requested_bottom: u64,
    pub roots_offset: usize,
    pub root_count: usize,
    pub open_used: usize,
    pub closed_start: usize,
    pub closed_used: usize,
    pub region_alignment: usize,
    pub max_heap_size: usize,
}

impl ArchiveHeapInfo {
    pub fn byte_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn requested_top(&self) -> u64 {
        self.requested_bottom + self.buffer.len() as u64
    }

    /// Offset of the region from the narrow oop base (zero without
    /// compressed oops), as recorded in the region table.
    pub fn mapping_offset(&self) -> u64 {
        self.requested_bottom - self.encoding.base()
    }
}

pub struct ArchiveHeapWriter;

impl ArchiveHeapWriter {
    /// Runs the whole heap dump for `selection`.
    pub fn write(
        mut ctx: ArchiveBuildContext<'_>,
        selection: &ArchiveSelection,
    ) -> Result<ArchiveHeapInfo> {
        ctx.write_heap(selection)?;
        Ok(ctx.into_heap_info(selection.roots.len()))
    }
}

impl<'a> ArchiveBuildContext<'a> {
    pub fn write_heap(&mut self, selection: &ArchiveSelection) -> Result<()> {
        self.copy_source_objs_to_buffer(selection)?;
        self.set_requested_address_range()?;
        self.relocate_embedded_oops(&selection.roots)?;
        if cfg!(debug_assertions) {
            if let Err(msg) = self.verify_relocation() {
                panic!("archived heap is inconsistent: {}", msg);
            }
        }
        Ok(())
    }

    pub fn into_heap_info(self, root_count: usize) -> ArchiveHeapInfo {
        ArchiveHeapInfo {
            encoding: self.heap.encoding(),
            requested_bottom: self.requested_bottom,
            roots_offset: self.roots_offset.map(|o| o.get()).unwrap_or(0),
            root_count,
            open_used: self.open_end,
            closed_start: self.closed_start,
            closed_used: self.closed_end - self.closed_start,
            region_alignment: self.config.heap_region_alignment,
            max_heap_size: self.heap.capacity(),
            oopmap: self.oopmap,
            ptrmap: self.ptrmap,
            buffer: self.buffer.into_vec(),
        }
    }
}
