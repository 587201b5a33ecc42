/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::codec::{HeaderDeserializer, HeaderSerializer};
use crate::error::FormatError;
use core::fmt;

/// Regions of an archive, in file order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionIndex {
    /// Read-write metadata.
    Rw = 0,
    /// Read-only metadata.
    Ro = 1,
    /// Relocation bitmaps of the other regions.
    Bitmap = 2,
    /// Archived heap objects.
    Heap = 3,
    /// Archived generated code.
    Code = 4,
}

pub const NUM_REGIONS: usize = 5;

impl RegionIndex {
    pub const ALL: [RegionIndex; NUM_REGIONS] = [
        RegionIndex::Rw,
        RegionIndex::Ro,
        RegionIndex::Bitmap,
        RegionIndex::Heap,
        RegionIndex::Code,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RegionIndex::Rw => "rw",
            RegionIndex::Ro => "ro",
            RegionIndex::Bitmap => "bm",
            RegionIndex::Heap => "hp",
            RegionIndex::Code => "ac",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RegionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const READ_ONLY: u32 = 1 << 0;
const ALLOW_EXEC: u32 = 1 << 1;
const IS_HEAP: u32 = 1 << 2;
const IS_BITMAP: u32 = 1 << 3;

/// One entry of the region table in the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileMapRegion {
    pub crc: u32,
    pub read_only: bool,
    pub allow_exec: bool,
    pub is_heap_region: bool,
    pub is_bitmap_region: bool,
    pub file_offset: u64,
    /// Offset of the region from its requested base: the narrow oop base
    /// for the heap region, the metadata base otherwise, zero for bitmaps.
    pub mapping_offset: u64,
    pub used: u64,
    /// Byte offset of this region's oop map inside the bitmap region.
    pub oopmap_offset: u64,
    pub oopmap_size_in_bits: u64,
    /// Byte offset of this region's pointer map inside the bitmap region.
    pub ptrmap_offset: u64,
    pub ptrmap_size_in_bits: u64,
}

impl FileMapRegion {
    pub const RECORD_SIZE: usize = 64;

    pub fn init(
        &mut self,
        index: RegionIndex,
        mapping_offset: u64,
        used: u64,
        read_only: bool,
        allow_exec: bool,
        crc: u32,
    ) {
        self.is_heap_region = index == RegionIndex::Heap;
        self.is_bitmap_region = index == RegionIndex::Bitmap;
        self.mapping_offset = mapping_offset;
        self.used = used;
        self.read_only = read_only;
        self.allow_exec = allow_exec;
        self.crc = crc;
    }

    pub fn init_oopmap(&mut self, offset: u64, size_in_bits: u64) {
        self.oopmap_offset = offset;
        self.oopmap_size_in_bits = size_in_bits;
    }

    pub fn init_ptrmap(&mut self, offset: u64, size_in_bits: u64) {
        self.ptrmap_offset = offset;
        self.ptrmap_size_in_bits = size_in_bits;
    }

    pub fn used_aligned(&self, alignment: u64) -> u64 {
        heapsnap_os::align_up_u64(self.used, alignment)
    }

    pub fn has_contents(&self) -> bool {
        self.used != 0
    }

    pub fn compute_crc(bytes: &[u8]) -> u32 {
        crc32fast::hash(bytes)
    }

    /// Ok when `bytes` (the region's used bytes) match the recorded crc.
    pub fn check_crc(&self, bytes: &[u8]) -> Result<(), (u32, u32)> {
        let actual = Self::compute_crc(bytes);
        if actual == self.crc {
            Ok(())
        } else {
            Err((self.crc, actual))
        }
    }

    pub(crate) fn serialize(&self, ser: &mut HeaderSerializer) {
        let mut flags = 0;
        if self.read_only {
            flags |= READ_ONLY;
        }
        if self.allow_exec {
            flags |= ALLOW_EXEC;
        }
        if self.is_heap_region {
            flags |= IS_HEAP;
        }
        if self.is_bitmap_region {
            flags |= IS_BITMAP;
        }
        ser.write_u32(self.crc);
        ser.write_u32(flags);
        ser.write_u64(self.file_offset);
        ser.write_u64(self.mapping_offset);
        ser.write_u64(self.used);
        ser.write_u64(self.oopmap_offset);
        ser.write_u64(self.oopmap_size_in_bits);
        ser.write_u64(self.ptrmap_offset);
        ser.write_u64(self.ptrmap_size_in_bits);
    }

    pub(crate) fn deserialize(de: &mut HeaderDeserializer<'_>) -> Result<Self, FormatError> {
        let crc = de.get_u32("region crc")?;
        let flags = de.get_u32("region flags")?;
        Ok(Self {
            crc,
            read_only: flags & READ_ONLY != 0,
            allow_exec: flags & ALLOW_EXEC != 0,
            is_heap_region: flags & IS_HEAP != 0,
            is_bitmap_region: flags & IS_BITMAP != 0,
            file_offset: de.get_u64("region file offset")?,
            mapping_offset: de.get_u64("region mapping offset")?,
            used: de.get_u64("region used")?,
            oopmap_offset: de.get_u64("region oopmap offset")?,
            oopmap_size_in_bits: de.get_u64("region oopmap size")?,
            ptrmap_offset: de.get_u64("region ptrmap offset")?,
            ptrmap_size_in_bits: de.get_u64("region ptrmap size")?,
        })
    }

    /// One human-readable line per region, for `print-header`.
    pub fn print(&self, index: RegionIndex, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "============ region ============= {} \"{}\"",
            index.index(),
            index.name()
        )?;
        writeln!(out, "- crc:                            0x{:08x}", self.crc)?;
        writeln!(out, "- read_only:                      {}", self.read_only)?;
        writeln!(out, "- allow_exec:                     {}", self.allow_exec)?;
        writeln!(out, "- is_heap_region:                 {}", self.is_heap_region)?;
        writeln!(out, "- is_bitmap_region:               {}", self.is_bitmap_region)?;
        writeln!(out, "- file_offset:                    {:#x}", self.file_offset)?;
        writeln!(out, "- mapping_offset:                 {:#x}", self.mapping_offset)?;
        writeln!(out, "- used:                           {}", self.used)?;
        writeln!(out, "- oopmap_offset:                  {:#x}", self.oopmap_offset)?;
        writeln!(out, "- oopmap_size_in_bits:            {}", self.oopmap_size_in_bits)?;
        writeln!(out, "- ptrmap_offset:                  {:#x}", self.ptrmap_offset)?;
        writeln!(out, "- ptrmap_size_in_bits:            {}", self.ptrmap_size_in_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        let mut ser = HeaderSerializer::new();
        FileMapRegion::default().serialize(&mut ser);
        assert_eq!(ser.len(), FileMapRegion::RECORD_SIZE);
    }

    #[test]
    fn test_crc_detects_change() {
        let mut bytes = vec![1u8; 100];
        let mut region = FileMapRegion::default();
        region.init(
            RegionIndex::Heap,
            0,
            100,
            false,
            false,
            FileMapRegion::compute_crc(&bytes),
        );
        assert!(region.check_crc(&bytes).is_ok());
        bytes[50] ^= 0x10;
        assert!(region.check_crc(&bytes).is_err());
        assert!(region.is_heap_region && !region.is_bitmap_region);
    }

    #[test]
    fn test_names() {
        let names: Vec<&str> = RegionIndex::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["rw", "ro", "bm", "hp", "ac"]);
    }
}
