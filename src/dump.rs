/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Writing a complete archive.
use crate::archive::{ArchiveBuildContext, ArchiveHeapWriter, ArchiveSelection, DumpConfig, MetadataRelocator};
use crate::error::{DumpError, Result};
use crate::filemap::{ArchiveKind, FileMapHeader, FileMapWriter, RegionIndex};
use crate::gc::bitmap::RelocBitmap;
use crate::gc::source_heap::SourceHeap;
use heapsnap_os::align_up_u64;
use std::path::Path;

/// Metadata regions produced by the metadata archiver. Their pointers are
/// already rewritten to requested addresses; the pointer maps mark them.
#[derive(Clone, Debug, Default)]
pub struct MetadataArchive {
    pub requested_base: u64,
    pub rw: Vec<u8>,
    pub ro: Vec<u8>,
    pub rw_ptrmap: RelocBitmap,
    pub ro_ptrmap: RelocBitmap,
    /// Generated code, written as the `ac` region.
    pub code: Vec<u8>,
}

impl MetadataArchive {
    pub fn empty(requested_base: u64) -> Self {
        Self {
            requested_base,
            ..Default::default()
        }
    }

    /// Offset of the ro region from the requested base.
    pub fn ro_mapping_offset(&self, alignment: u64) -> u64 {
        align_up_u64(self.rw.len() as u64, alignment)
    }

    pub fn code_mapping_offset(&self, alignment: u64) -> u64 {
        self.ro_mapping_offset(alignment) + align_up_u64(self.ro.len() as u64, alignment)
    }
}

/// Heap objects to archive and how their metadata pointers move.
pub struct HeapDump<'a> {
    pub heap: &'a SourceHeap,
    pub selection: &'a ArchiveSelection,
    pub relocator: &'a dyn MetadataRelocator,
}

/// Dumps `metadata` and, for static archives, the heap objects of `heap`
/// into a new archive at `path`. Returns the header as written.
pub fn dump_archive(
    path: impl AsRef<Path>,
    config: &DumpConfig,
    heap: Option<HeapDump<'_>>,
    metadata: MetadataArchive,
) -> Result<FileMapHeader> {
    let alignment = config.core_region_alignment as u64;
    let ro_offset = metadata.ro_mapping_offset(alignment);
    let code_offset = metadata.code_mapping_offset(alignment);
    let MetadataArchive {
        requested_base,
        rw,
        ro,
        mut rw_ptrmap,
        mut ro_ptrmap,
        code,
    } = metadata;
    if heap.is_some() && config.kind != ArchiveKind::Static {
        return Err(DumpError::HeapInDynamicArchive.into());
    }

    let mut heap_info = match heap {
        Some(dump) => {
            let ctx = ArchiveBuildContext::new(dump.heap, dump.relocator, config.clone());
            Some(ArchiveHeapWriter::write(ctx, dump.selection)?)
        }
        None => None,
    };

    let mut header = FileMapHeader::new(config.kind, &config.vm_ident);
    header.core_region_alignment = alignment;
    header.narrow_klass = config.narrow_klass;
    header.requested_base_address = requested_base;
    header.heap_region_alignment = config.heap_region_alignment as u64;
    match (config.kind, &config.base_archive_name) {
        (ArchiveKind::Dynamic, Some(name)) => header.base_archive_name = Some(name.clone()),
        (_, Some(name)) => log::warn!(
            target: "cds",
            "base archive name {} ignored for a {} archive",
            name,
            config.kind
        ),
        _ => {}
    }

    let mut writer = FileMapWriter::create(path, header)?;
    writer.write_region(RegionIndex::Rw, &rw, 0, false, false)?;
    writer.write_region(RegionIndex::Ro, &ro, ro_offset, true, false)?;
    writer.write_bitmap_region(&mut rw_ptrmap, &mut ro_ptrmap, heap_info.as_mut())?;
    match &heap_info {
        Some(info) => {
            writer.write_heap_region(info)?;
        }
        None => writer.write_region(RegionIndex::Heap, &[], 0, false, false)?,
    }
    writer.write_region(RegionIndex::Code, &code, code_offset, true, true)?;
    writer.write_header()?;
    writer.close()
}
