/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::header::{ArchiveKind, FileMapHeader};
use super::region::{FileMapRegion, RegionIndex, NUM_REGIONS};
use crate::archive::ArchiveHeapInfo;
use crate::error::{DumpError, Result};
use crate::gc::bitmap::RelocBitmap;
use heapsnap_os::align_up_u64;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    HeaderReserved,
    RegionsWritten,
    HeaderWritten,
}

/// Writes an archive file.
///
/// The header is written last, once every region crc is known: `create`
/// reserves room for it, the `write_*_region` calls append aligned regions,
/// `write_header` seeks back to offset 0 and `close` hands back the final
/// header. Any I/O failure removes the partial file.
pub struct FileMapWriter {
    path: PathBuf,
    file: Option<File>,
    header: FileMapHeader,
    alignment: u64,
    file_offset: u64,
    written: [bool; NUM_REGIONS],
    state: WriterState,
}

impl FileMapWriter {
    pub fn create(path: impl AsRef<Path>, header: FileMapHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Unlink rather than truncate so a process still mapping the old
        // archive keeps its pages.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let alignment = header.core_region_alignment.max(1);
        let mut this = Self {
            path,
            file: Some(file),
            alignment,
            file_offset: 0,
            written: [false; NUM_REGIONS],
            state: WriterState::HeaderReserved,
            header,
        };
        this.file_offset = align_up_u64(this.header.header_size() as u64, alignment);
        let pos = this.file_offset;
        this.seek_to(pos)?;
        log::debug!(
            target: "cds",
            "creating {} archive {}, header reserves {} bytes",
            this.header.kind().map(ArchiveKind::name).unwrap_or("?"),
            this.path.display(),
            pos
        );
        Ok(this)
    }

    pub fn header(&self) -> &FileMapHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut FileMapHeader {
        &mut self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Appends one region. `mapping_offset` is the region's offset from its
    /// requested base. The crc covers exactly `bytes`, not the padding.
    pub fn write_region(
        &mut self,
        index: RegionIndex,
        bytes: &[u8],
        mapping_offset: u64,
        read_only: bool,
        allow_exec: bool,
    ) -> Result<()> {
        assert!(
            self.state != WriterState::HeaderWritten,
            "region {} written after the header",
            index
        );
        assert!(!self.written[index.index()], "region {} written twice", index);
        self.written[index.index()] = true;
        self.state = WriterState::RegionsWritten;

        self.align_file_position()?;
        let crc = FileMapRegion::compute_crc(bytes);
        let file_offset = self.file_offset;
        let region = self.header.region_mut(index);
        region.file_offset = file_offset;
        region.init(
            index,
            mapping_offset,
            bytes.len() as u64,
            read_only,
            allow_exec,
            crc,
        );
        if !bytes.is_empty() {
            log::info!(
                target: "cds",
                "region {} ({}): {:8} bytes, mapping offset {:#x}, file offset {:#010x}, crc {:#010x}",
                index.index(),
                index,
                bytes.len(),
                mapping_offset,
                file_offset,
                crc
            );
            self.write_bytes(bytes)?;
            self.align_file_position()?;
        }
        Ok(())
    }

    /// Writes the bitmap region: rw ptrmap, ro ptrmap, then the heap oop
    /// map and pointer map when a heap is archived. Every map is trimmed of
    /// leading and trailing zeros first; the trimmed prefix goes into the
    /// header as the map's start position.
    pub fn write_bitmap_region(
        &mut self,
        rw_ptrmap: &mut RelocBitmap,
        ro_ptrmap: &mut RelocBitmap,
        heap: Option<&mut ArchiveHeapInfo>,
    ) -> Result<usize> {
        self.header.rw_ptrmap_start_pos = rw_ptrmap.remove_zeros() as u64;
        self.header.ro_ptrmap_start_pos = ro_ptrmap.remove_zeros() as u64;

        let mut buffer = Vec::new();
        self.header
            .region_mut(RegionIndex::Rw)
            .init_ptrmap(0, rw_ptrmap.size() as u64);
        rw_ptrmap.write_to(&mut buffer);
        self.header
            .region_mut(RegionIndex::Ro)
            .init_ptrmap(buffer.len() as u64, ro_ptrmap.size() as u64);
        ro_ptrmap.write_to(&mut buffer);

        if let Some(heap) = heap {
            self.header.heap_oopmap_start_pos = heap.oopmap.remove_zeros() as u64;
            self.header.heap_ptrmap_start_pos = heap.ptrmap.remove_zeros() as u64;
            let at = buffer.len() as u64;
            self.header
                .region_mut(RegionIndex::Heap)
                .init_oopmap(at, heap.oopmap.size() as u64);
            heap.oopmap.write_to(&mut buffer);
            let at = buffer.len() as u64;
            self.header
                .region_mut(RegionIndex::Heap)
                .init_ptrmap(at, heap.ptrmap.size() as u64);
            heap.ptrmap.write_to(&mut buffer);
        }

        self.write_region(RegionIndex::Bitmap, &buffer, 0, true, false)?;
        Ok(buffer.len())
    }

    /// Writes the archived heap objects and records their layout.
    pub fn write_heap_region(&mut self, heap: &ArchiveHeapInfo) -> Result<usize> {
        if self.header.kind() != Some(ArchiveKind::Static) {
            return Err(DumpError::HeapInDynamicArchive.into());
        }
        let header = &mut self.header;
        header.set_oop_encoding(heap.encoding);
        header.max_heap_size = heap.max_heap_size as u64;
        header.heap_region_alignment = heap.region_alignment as u64;
        header.heap_roots_offset = heap.roots_offset as u64;
        header.heap_root_count = heap.root_count as u64;
        header.heap_open_used = heap.open_used as u64;
        header.heap_closed_start = heap.closed_start as u64;
        header.heap_closed_used = heap.closed_used as u64;
        self.write_region(
            RegionIndex::Heap,
            &heap.buffer,
            heap.mapping_offset(),
            false,
            false,
        )?;
        log::info!(
            target: "cds::heap",
            "heap region requested at [{:#x}, {:#x}), {} roots",
            heap.requested_bottom,
            heap.requested_top(),
            heap.root_count
        );
        Ok(heap.byte_size())
    }

    pub fn write_header(&mut self) -> Result<()> {
        assert!(
            self.state != WriterState::HeaderWritten,
            "header written twice"
        );
        let bytes = self.header.finalize();
        self.file_offset = 0;
        self.seek_to(0)?;
        self.write_bytes(&bytes)?;
        self.state = WriterState::HeaderWritten;
        log::debug!(
            target: "cds",
            "header: {} bytes, crc {:#010x}",
            bytes.len(),
            self.header.generic.crc
        );
        Ok(())
    }

    /// Flushes and closes the file.
    pub fn close(mut self) -> Result<FileMapHeader> {
        assert_eq!(
            self.state,
            WriterState::HeaderWritten,
            "archive closed before its header was written"
        );
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                self.discard();
                return Err(e.into());
            }
        }
        log::info!(target: "cds", "wrote {}", self.path.display());
        Ok(self.header)
    }

    /// Pads the file to the next alignment boundary. The last padding byte
    /// is written so the file length covers the padding.
    fn align_file_position(&mut self) -> Result<()> {
        let aligned = align_up_u64(self.file_offset, self.alignment);
        if aligned != self.file_offset {
            self.file_offset = aligned - 1;
            self.seek_to(aligned - 1)?;
            self.write_bytes(&[0])?;
        }
        Ok(())
    }

    fn seek_to(&mut self, pos: u64) -> Result<()> {
        let result = match self.file.as_mut() {
            Some(file) => file.seek(SeekFrom::Start(pos)).map(|_| ()),
            None => Err(closed()),
        };
        self.check(result)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let result = match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(closed()),
        };
        self.check(result)?;
        self.file_offset += bytes.len() as u64;
        Ok(())
    }

    fn check(&mut self, result: io::Result<()>) -> Result<()> {
        if let Err(e) = result {
            log::error!(
                target: "cds",
                "unable to write archive {}: {}",
                self.path.display(),
                e
            );
            self.discard();
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes and deletes a damaged archive.
    fn discard(&mut self) {
        self.file = None;
        let _ = fs::remove_file(&self.path);
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "archive file is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::header::FIXED_HEADER_SIZE;

    fn header(alignment: u64) -> FileMapHeader {
        let mut header = FileMapHeader::new(ArchiveKind::Static, "writer test");
        header.core_region_alignment = alignment;
        header
    }

    #[test]
    fn test_regions_are_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jsa");
        let mut writer = FileMapWriter::create(&path, header(4096)).unwrap();
        assert_eq!(writer.file_offset(), 4096);
        writer
            .write_region(RegionIndex::Rw, &[1u8; 100], 0, false, false)
            .unwrap();
        writer
            .write_region(RegionIndex::Ro, &[2u8; 5000], 4096, true, false)
            .unwrap();
        writer.write_header().unwrap();
        let header = writer.close().unwrap();

        let rw = header.region(RegionIndex::Rw);
        let ro = header.region(RegionIndex::Ro);
        assert_eq!(rw.file_offset, 4096);
        assert_eq!(ro.file_offset, 8192);
        assert_eq!(ro.used, 5000);
        assert!(ro.read_only);
        assert_eq!(fs::metadata(&path).unwrap().len(), 8192 + 8192);

        let bytes = fs::read(&path).unwrap();
        assert!(bytes[8192..8192 + 5000].iter().all(|b| *b == 2));
        assert!(ro.check_crc(&bytes[8192..8192 + 5000]).is_ok());
        let parsed = FileMapHeader::parse(&bytes[..FIXED_HEADER_SIZE]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_create_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.jsa");
        fs::write(&path, vec![0xffu8; 100_000]).unwrap();
        let mut writer = FileMapWriter::create(&path, header(512)).unwrap();
        writer.write_header().unwrap();
        writer.close().unwrap();
        assert!(fs::metadata(&path).unwrap().len() < 100_000);
    }

    #[test]
    fn test_bitmap_region_trims_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileMapWriter::create(dir.path().join("bm.jsa"), header(512)).unwrap();
        let mut rw = RelocBitmap::with_size(1000);
        rw.set(130);
        rw.set(140);
        let mut ro = RelocBitmap::with_size(10);
        let size = writer.write_bitmap_region(&mut rw, &mut ro, None).unwrap();
        assert_eq!(size, 8);
        let h = writer.header();
        assert_eq!(h.rw_ptrmap_start_pos, 130);
        assert_eq!(h.region(RegionIndex::Rw).ptrmap_size_in_bits, 11);
        assert_eq!(h.region(RegionIndex::Ro).ptrmap_size_in_bits, 0);
        assert_eq!(h.region(RegionIndex::Ro).ptrmap_offset, 8);
        assert!(h.region(RegionIndex::Bitmap).is_bitmap_region);
    }

    #[test]
    #[should_panic]
    fn test_region_after_header_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileMapWriter::create(dir.path().join("x.jsa"), header(512)).unwrap();
        writer.write_header().unwrap();
        let _ = writer.write_region(RegionIndex::Rw, &[0u8; 8], 0, false, false);
    }
}
