/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::header::{
    ArchiveKind, FileMapHeader, GenericHeader, CURRENT_VERSION, FIXED_HEADER_SIZE,
    GENERIC_HEADER_SIZE,
};
use super::region::{FileMapRegion, RegionIndex};
use crate::error::{ArchiveError, FormatError, RegionFailure, Result};
use crate::gc::bitmap::{words_for, BitMapView};
use crate::gc::compressed::OopEncoding;
use crate::loader::patch::{patch_embedded_pointers, NativeDelta};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

enum BitmapStorage {
    #[allow(dead_code)]
    Mapped(Mmap),
    Read(Vec<u8>),
}

impl BitmapStorage {
    fn bytes(&self) -> &[u8] {
        match self {
            BitmapStorage::Mapped(map) => &map[..],
            BitmapStorage::Read(bytes) => bytes,
        }
    }
}

/// An archive opened for reuse. Opening validates the header; regions are
/// read, checked and mapped on demand.
pub struct FileMapInfo {
    path: PathBuf,
    file: File,
    file_len: u64,
    header: FileMapHeader,
    verify: bool,
    bitmap: Option<BitmapStorage>,
}

/// Reads the generic prefix and then the whole header, checking everything
/// that does not depend on the caller's expectations.
fn read_raw_header(file: &mut File, file_len: u64) -> Result<(GenericHeader, Vec<u8>)> {
    if file_len < GENERIC_HEADER_SIZE as u64 {
        return Err(FormatError::TooSmall(file_len).into());
    }
    let mut prefix = [0u8; GENERIC_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut prefix)?;
    let generic = GenericHeader::parse(&prefix)?;
    generic.validate(file_len)?;
    if (generic.header_size as usize) < FIXED_HEADER_SIZE {
        return Err(FormatError::Truncated("header").into());
    }

    let mut bytes = vec![0u8; generic.header_size as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes)?;
    Ok((generic, bytes))
}

impl FileMapInfo {
    /// Opens `path` and validates its header: generic prefix, header crc
    /// (when `verify`), base archive name, exact version, producer ident
    /// and region bounds, in that order.
    pub fn open(
        path: impl AsRef<Path>,
        expected: ArchiveKind,
        vm_ident: &str,
        verify: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let (generic, bytes) = read_raw_header(&mut file, file_len)?;

        let kind = generic.kind().ok_or(FormatError::BadMagic(generic.magic))?;
        if kind != expected {
            return Err(FormatError::KindMismatch {
                expected: expected.name(),
                found: kind.name(),
            }
            .into());
        }
        if verify {
            let actual = FileMapHeader::compute_crc(&bytes);
            if actual != generic.crc {
                return Err(FormatError::HeaderCrc {
                    expected: generic.crc,
                    actual,
                }
                .into());
            }
        }
        let header = FileMapHeader::parse(&bytes)?;
        if let Some(base) = &header.base_archive_name {
            if !Path::new(base).exists() {
                return Err(
                    FormatError::BaseArchiveName(format!("{} does not exist", base)).into(),
                );
            }
        }
        if header.generic.version != CURRENT_VERSION {
            return Err(FormatError::VersionMismatch {
                found: header.generic.version,
                expected: CURRENT_VERSION,
            }
            .into());
        }
        header.validate_ident(vm_ident)?;
        header.validate_regions(file_len)?;

        log::info!(
            target: "cds",
            "opened {} archive {} ({} bytes)",
            kind,
            path.display(),
            file_len
        );
        Ok(Self {
            path,
            file,
            file_len,
            header,
            verify,
            bitmap: None,
        })
    }

    /// Reads just the header, without crc, version or ident checks. Used
    /// for printing archives from other builds.
    pub fn read_header(path: impl AsRef<Path>) -> Result<FileMapHeader> {
        let mut file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let (_, bytes) = read_raw_header(&mut file, file_len)?;
        Ok(FileMapHeader::parse(&bytes)?)
    }

    pub fn header(&self) -> &FileMapHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn region(&self, index: RegionIndex) -> &FileMapRegion {
        self.header.region(index)
    }

    pub fn has_heap_region(&self) -> bool {
        self.region(RegionIndex::Heap).has_contents()
    }

    /// Checks `bytes` against the crc recorded for `index`, when verifying.
    pub fn check_region_crc(&self, index: RegionIndex, bytes: &[u8]) -> Result<()> {
        if !self.verify {
            return Ok(());
        }
        self.region(index).check_crc(bytes).map_err(|(expected, actual)| {
            log::warn!(
                target: "cds",
                "checksum verification failed for region {} of {}",
                index,
                self.path.display()
            );
            ArchiveError::region(index.name(), RegionFailure::Crc { expected, actual })
        })
    }

    /// Reads the used bytes of `index` into `dst`, which must be exactly
    /// that long, and verifies them.
    pub fn read_region_into(&self, index: RegionIndex, dst: &mut [u8]) -> Result<()> {
        let region = self.region(index);
        debug_assert_eq!(dst.len() as u64, region.used);
        let mut file = &self.file;
        file.seek(SeekFrom::Start(region.file_offset))?;
        if let Err(e) = file.read_exact(dst) {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                return Err(e.into());
            }
            let available = self.file.metadata()?.len().saturating_sub(region.file_offset);
            return Err(ArchiveError::region(
                index.name(),
                RegionFailure::ShortRead {
                    expected: dst.len(),
                    actual: available.min(dst.len() as u64) as usize,
                },
            ));
        }
        self.check_region_crc(index, dst)
    }

    pub fn read_region(&self, index: RegionIndex) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.region(index).used as usize];
        self.read_region_into(index, &mut bytes)?;
        Ok(bytes)
    }

    /// Makes the bitmap region available to [`FileMapInfo::oopmap`] and
    /// [`FileMapInfo::ptrmap`]. Mapped read-only where the platform allows,
    /// read otherwise.
    pub fn map_bitmap_region(&mut self) -> Result<()> {
        if self.bitmap.is_some() {
            return Ok(());
        }
        let region = *self.region(RegionIndex::Bitmap);
        if !region.has_contents() {
            self.bitmap = Some(BitmapStorage::Read(vec![]));
            return Ok(());
        }
        let storage = self.load_bitmap(&region)?;
        log::debug!(
            target: "cds",
            "bitmap region: {} bytes at file offset {:#x}",
            region.used,
            region.file_offset
        );
        self.bitmap = Some(storage);
        Ok(())
    }

    cfg_if::cfg_if! {
        if #[cfg(target_family = "unix")] {
            fn load_bitmap(&self, region: &FileMapRegion) -> Result<BitmapStorage> {
                let map = unsafe {
                    MmapOptions::new()
                        .offset(region.file_offset)
                        .len(region.used as usize)
                        .map(&self.file)
                }
                .map_err(|e| {
                    ArchiveError::region(
                        RegionIndex::Bitmap.name(),
                        RegionFailure::Map(e.to_string()),
                    )
                })?;
                self.check_region_crc(RegionIndex::Bitmap, &map[..])?;
                Ok(BitmapStorage::Mapped(map))
            }
        } else {
            fn load_bitmap(&self, _region: &FileMapRegion) -> Result<BitmapStorage> {
                Ok(BitmapStorage::Read(self.read_region(RegionIndex::Bitmap)?))
            }
        }
    }

    fn bitmap_view(&self, offset: u64, size: u64, start_pos: u64) -> Result<BitMapView<'_>> {
        let out_of_range =
            || ArchiveError::region(RegionIndex::Bitmap.name(), RegionFailure::BitmapOutOfRange);
        if size == 0 {
            return Ok(BitMapView::empty());
        }
        let bytes = match &self.bitmap {
            Some(storage) => storage.bytes(),
            None => {
                return Err(ArchiveError::region(
                    RegionIndex::Bitmap.name(),
                    RegionFailure::Map("bitmap region is not mapped".to_string()),
                ))
            }
        };
        let len = words_for(size as usize) * 8;
        let start = offset as usize;
        let end = start.checked_add(len).ok_or_else(out_of_range)?;
        if end > bytes.len() {
            return Err(out_of_range());
        }
        BitMapView::new(&bytes[start..end], size as usize, start_pos as usize)
            .ok_or_else(out_of_range)
    }

    /// Oop map of the heap region.
    pub fn oopmap(&self, index: RegionIndex) -> Result<BitMapView<'_>> {
        debug_assert_eq!(index, RegionIndex::Heap);
        let region = self.region(index);
        self.bitmap_view(
            region.oopmap_offset,
            region.oopmap_size_in_bits,
            self.header.heap_oopmap_start_pos,
        )
    }

    pub fn ptrmap(&self, index: RegionIndex) -> Result<BitMapView<'_>> {
        let start_pos = match index {
            RegionIndex::Rw => self.header.rw_ptrmap_start_pos,
            RegionIndex::Ro => self.header.ro_ptrmap_start_pos,
            RegionIndex::Heap => self.header.heap_ptrmap_start_pos,
            _ => 0,
        };
        let region = self.region(index);
        self.bitmap_view(region.ptrmap_offset, region.ptrmap_size_in_bits, start_pos)
    }

    /// Address the heap region was requested at when it was dumped.
    pub fn heap_region_dumptime_address(&self) -> u64 {
        self.header.narrow_oop_base + self.region(RegionIndex::Heap).mapping_offset
    }

    /// Address the heap region should be mapped at under `runtime` to need
    /// no patching: the same offset from the runtime narrow oop base.
    pub fn heap_region_requested_address(&self, runtime: &OopEncoding) -> u64 {
        let offset = self.region(RegionIndex::Heap).mapping_offset;
        match runtime {
            OopEncoding::Compressed(narrow) => narrow.base + offset,
            OopEncoding::Uncompressed => offset,
        }
    }

    /// Reads the rw and ro metadata regions into one fresh block and
    /// relocates their internal pointers to it. Returns `None` when the
    /// archive has no metadata.
    pub fn map_core_regions(&mut self) -> Result<Option<CoreRegions>> {
        let rw = *self.region(RegionIndex::Rw);
        let ro = *self.region(RegionIndex::Ro);
        let alignment = self.header.core_region_alignment.max(1);
        let size = (rw.mapping_offset + rw.used_aligned(alignment))
            .max(ro.mapping_offset + ro.used_aligned(alignment));
        if !rw.has_contents() && !ro.has_contents() {
            return Ok(None);
        }
        self.map_bitmap_region()?;

        let mut mapping = MmapMut::map_anon(size as usize)?;
        for (index, region) in &[(RegionIndex::Rw, rw), (RegionIndex::Ro, ro)] {
            let start = region.mapping_offset as usize;
            let dst = &mut mapping[start..start + region.used as usize];
            self.read_region_into(*index, dst)?;
        }

        let requested_base = self.header.requested_base_address;
        let base = mapping.as_ptr() as u64;
        let delta = base.wrapping_sub(requested_base) as i64;
        let mut patched = 0;
        if delta != 0 {
            for (index, region) in &[(RegionIndex::Rw, rw), (RegionIndex::Ro, ro)] {
                let map = self.ptrmap(*index)?;
                let start = region.mapping_offset as usize;
                let bytes = &mut mapping[start..start + region.used as usize];
                if map.end_pos() * 8 > bytes.len() {
                    return Err(ArchiveError::region(
                        index.name(),
                        RegionFailure::BitmapOutOfRange,
                    ));
                }
                patched += patch_embedded_pointers(bytes, &map, &NativeDelta(delta), None);
            }
        }
        log::info!(
            target: "cds::reloc",
            "metadata requested at {:#x} mapped at {:#x}, {} pointers relocated",
            requested_base,
            base,
            patched
        );
        Ok(Some(CoreRegions {
            mapping,
            requested_base,
            rw_offset: rw.mapping_offset as usize,
            rw_len: rw.used as usize,
            ro_offset: ro.mapping_offset as usize,
            ro_len: ro.used as usize,
        }))
    }
}

/// The metadata regions, relocated to wherever they landed.
pub struct CoreRegions {
    mapping: MmapMut,
    requested_base: u64,
    rw_offset: usize,
    rw_len: usize,
    ro_offset: usize,
    ro_len: usize,
}

impl CoreRegions {
    pub fn base(&self) -> u64 {
        self.mapping.as_ptr() as u64
    }

    pub fn requested_base(&self) -> u64 {
        self.requested_base
    }

    /// How far the metadata moved; also the delta for metadata pointers
    /// embedded in heap objects.
    pub fn delta(&self) -> i64 {
        self.base().wrapping_sub(self.requested_base) as i64
    }

    pub fn rw(&self) -> &[u8] {
        &self.mapping[self.rw_offset..self.rw_offset + self.rw_len]
    }

    pub fn ro(&self) -> &[u8] {
        &self.mapping[self.ro_offset..self.ro_offset + self.ro_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::header::FileMapHeader;
    use crate::filemap::writer::FileMapWriter;
    use crate::gc::bitmap::RelocBitmap;
    use crate::utils::{get_u64, put_u64};
    use std::fs;

    const IDENT: &str = "reader test";

    fn write(path: &Path, kind: ArchiveKind, base_name: Option<&str>) -> FileMapHeader {
        let mut header = FileMapHeader::new(kind, IDENT);
        header.core_region_alignment = 4096;
        header.requested_base_address = 0x8_0000_0000;
        header.base_archive_name = base_name.map(|s| s.to_string());
        let mut writer = FileMapWriter::create(path, header).unwrap();

        // rw: a pointer at slot 2 to ro + 16, ro: a pointer back to rw.
        let mut rw = vec![0u8; 64];
        put_u64(&mut rw, 16, 0x8_0000_1000 + 16);
        let mut ro = vec![0u8; 32];
        put_u64(&mut ro, 8, 0x8_0000_0000);
        let mut rw_map = RelocBitmap::with_size(8);
        rw_map.set(2);
        let mut ro_map = RelocBitmap::with_size(4);
        ro_map.set(1);

        writer.write_region(RegionIndex::Rw, &rw, 0, false, false).unwrap();
        writer.write_region(RegionIndex::Ro, &ro, 0x1000, true, false).unwrap();
        writer
            .write_bitmap_region(&mut rw_map, &mut ro_map, None)
            .unwrap();
        writer.write_header().unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn test_open_and_relocate_core_regions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.jsa");
        write(&path, ArchiveKind::Static, None);

        let mut info = FileMapInfo::open(&path, ArchiveKind::Static, IDENT, true).unwrap();
        assert!(!info.has_heap_region());
        let core = info.map_core_regions().unwrap().unwrap();
        let base = core.base();
        assert_eq!(get_u64(core.rw(), 16), base + 0x1000 + 16);
        assert_eq!(get_u64(core.ro(), 8), base);
        assert_eq!(core.delta(), base.wrapping_sub(0x8_0000_0000) as i64);
    }

    #[test]
    fn test_region_crc_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crc.jsa");
        let header = write(&path, ArchiveKind::Static, None);
        let ro = header.region(RegionIndex::Ro);
        let mut bytes = fs::read(&path).unwrap();
        bytes[(ro.file_offset + ro.used / 2) as usize] ^= 0x40;
        fs::write(&path, &bytes).unwrap();

        let info = FileMapInfo::open(&path, ArchiveKind::Static, IDENT, true).unwrap();
        match info.read_region(RegionIndex::Ro) {
            Err(ArchiveError::Region { region, kind }) => {
                assert_eq!(region, "ro");
                assert!(matches!(kind, RegionFailure::Crc { .. }));
            }
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }
        // Without verification the damaged bytes are handed out.
        let info = FileMapInfo::open(&path, ArchiveKind::Static, IDENT, false).unwrap();
        assert!(info.read_region(RegionIndex::Ro).is_ok());
    }

    #[test]
    fn test_region_truncated_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.jsa");
        let header = write(&path, ArchiveKind::Static, None);
        let ro = header.region(RegionIndex::Ro);

        let info = FileMapInfo::open(&path, ArchiveKind::Static, IDENT, true).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(ro.file_offset + ro.used / 2)
            .unwrap();
        match info.read_region(RegionIndex::Ro) {
            Err(ArchiveError::Region { region, kind }) => {
                assert_eq!(region, "ro");
                assert_eq!(
                    kind,
                    RegionFailure::ShortRead {
                        expected: ro.used as usize,
                        actual: (ro.used / 2) as usize,
                    }
                );
            }
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }
    }

    fn open_err(path: &Path, kind: ArchiveKind, ident: &str) -> FormatError {
        match FileMapInfo::open(path, kind, ident, true) {
            Err(ArchiveError::Format(e)) => e,
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("archive accepted"),
        }
    }

    #[test]
    fn test_header_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsa");
        write(&path, ArchiveKind::Static, None);
        let good = fs::read(&path).unwrap();

        assert!(matches!(
            open_err(&path, ArchiveKind::Dynamic, IDENT),
            FormatError::KindMismatch { .. }
        ));
        assert!(matches!(
            open_err(&path, ArchiveKind::Static, "other build"),
            FormatError::IdentMismatch { .. }
        ));

        let mut bytes = good.clone();
        bytes[0] ^= 1;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            open_err(&path, ArchiveKind::Static, IDENT),
            FormatError::BadMagic(_)
        ));

        let mut bytes = good.clone();
        bytes[100] ^= 1;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            open_err(&path, ArchiveKind::Static, IDENT),
            FormatError::HeaderCrc { .. }
        ));

        fs::write(&path, &good[..12]).unwrap();
        assert_eq!(
            open_err(&path, ArchiveKind::Static, IDENT),
            FormatError::TooSmall(12)
        );

        assert!(FileMapInfo::read_header(&path).is_err());

        // Cut inside the rw region.
        fs::write(&path, &good[..4096 + 10]).unwrap();
        assert!(matches!(
            open_err(&path, ArchiveKind::Static, IDENT),
            FormatError::RegionOutOfBounds { .. }
        ));
    }

    #[test]
    fn test_dynamic_base_archive_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.jsa");
        let top = dir.path().join("top.jsa");
        let base_name = base.to_str().unwrap();
        write(&top, ArchiveKind::Dynamic, Some(base_name));
        assert!(matches!(
            open_err(&top, ArchiveKind::Dynamic, IDENT),
            FormatError::BaseArchiveName(_)
        ));
        write(&base, ArchiveKind::Static, None);
        let info = FileMapInfo::open(&top, ArchiveKind::Dynamic, IDENT, true).unwrap();
        assert_eq!(info.header().base_archive_name.as_deref(), Some(base_name));
    }
}
