/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! The archive header.
//!
//! Every archive starts with a 24-byte generic header that all versions
//! share: magic, crc, version, header size and the location of the base
//! archive name. The full header follows, then the region table, then (for
//! dynamic archives) the NUL-terminated base archive name. The header crc
//! covers every byte after the `header_size` field up to `header_size`.
use super::codec::{HeaderDeserializer, HeaderSerializer};
use super::region::{FileMapRegion, RegionIndex, NUM_REGIONS};
use crate::error::FormatError;
use crate::gc::compressed::{NarrowKlassEncoding, NarrowOopEncoding, NarrowOopMode, OopEncoding};
use core::fmt;
use once_cell::sync::Lazy;

pub const MAGIC_STATIC: u32 = 0xf00b_aba2;
pub const MAGIC_DYNAMIC: u32 = 0xf00b_aba8;
pub const MAGIC_PREIMAGE: u32 = 0xcafe_a07c;

/// Oldest version whose generic header can be parsed.
pub const GENERIC_HEADER_MIN_VERSION: u32 = 12;
pub const CURRENT_VERSION: u32 = 18;

pub const IDENT_MAX: usize = 256;

/// Bytes covered by the generic header; the crc starts right after
/// `header_size`, at offset 16.
pub const GENERIC_HEADER_SIZE: usize = 24;
const CRC_START: usize = 16;
const CRC_OFFSET: usize = 4;

const FIXED_FIELDS_SIZE: usize = 136;
pub const FIXED_HEADER_SIZE: usize =
    GENERIC_HEADER_SIZE + FIXED_FIELDS_SIZE + IDENT_MAX + NUM_REGIONS * FileMapRegion::RECORD_SIZE;

const COMPRESSED_OOPS: u32 = 1 << 0;
const COMPRESSED_CLASS_PTRS: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Base archive; the only kind that carries heap objects.
    Static,
    /// Extends a static archive named in its header.
    Dynamic,
    /// Training output consumed by a later dump.
    Preimage,
}

impl ArchiveKind {
    pub fn magic(self) -> u32 {
        match self {
            ArchiveKind::Static => MAGIC_STATIC,
            ArchiveKind::Dynamic => MAGIC_DYNAMIC,
            ArchiveKind::Preimage => MAGIC_PREIMAGE,
        }
    }

    pub fn from_magic(magic: u32) -> Option<ArchiveKind> {
        match magic {
            MAGIC_STATIC => Some(ArchiveKind::Static),
            MAGIC_DYNAMIC => Some(ArchiveKind::Dynamic),
            MAGIC_PREIMAGE => Some(ArchiveKind::Preimage),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArchiveKind::Static => "static",
            ArchiveKind::Dynamic => "dynamic",
            ArchiveKind::Preimage => "preimage",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static CURRENT_VM_IDENT: Lazy<String> = Lazy::new(|| {
    format!(
        "heapsnap {} ({}-{}) version {}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        CURRENT_VERSION
    )
});

/// Identifier of this build, recorded in every archive it writes.
pub fn default_vm_ident() -> String {
    CURRENT_VM_IDENT.clone()
}

/// Fixed-size, NUL-terminated form of `ident`. An ident that does not fit is
/// cut to `IDENT_MAX - 9` bytes followed by eight hex digits of its hash, so
/// two long idents that share a prefix still compare different.
pub fn header_version(ident: &str) -> [u8; IDENT_MAX] {
    let bytes = ident.as_bytes();
    let mut out = [0u8; IDENT_MAX];
    if bytes.len() < IDENT_MAX - 1 {
        out[..bytes.len()].copy_from_slice(bytes);
    } else {
        let hash = fxhash::hash32(bytes);
        out[..IDENT_MAX - 9].copy_from_slice(&bytes[..IDENT_MAX - 9]);
        let hex = format!("{:08x}", hash);
        out[IDENT_MAX - 9..IDENT_MAX - 1].copy_from_slice(hex.as_bytes());
        out[IDENT_MAX - 1] = 0;
    }
    out
}

fn ident_str(ident: &[u8]) -> String {
    let end = ident.iter().position(|b| *b == 0).unwrap_or(ident.len());
    String::from_utf8_lossy(&ident[..end]).into_owned()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GenericHeader {
    pub magic: u32,
    pub crc: u32,
    pub version: u32,
    pub header_size: u32,
    pub base_archive_name_offset: u32,
    pub base_archive_name_size: u32,
}

impl GenericHeader {
    pub fn parse(bytes: &[u8]) -> Result<GenericHeader, FormatError> {
        let mut de = HeaderDeserializer::new(bytes);
        Ok(GenericHeader {
            magic: de.get_u32("magic")?,
            crc: de.get_u32("crc")?,
            version: de.get_u32("version")?,
            header_size: de.get_u32("header_size")?,
            base_archive_name_offset: de.get_u32("base_archive_name_offset")?,
            base_archive_name_size: de.get_u32("base_archive_name_size")?,
        })
    }

    fn serialize(&self, ser: &mut HeaderSerializer) {
        ser.write_u32(self.magic);
        ser.write_u32(self.crc);
        ser.write_u32(self.version);
        ser.write_u32(self.header_size);
        ser.write_u32(self.base_archive_name_offset);
        ser.write_u32(self.base_archive_name_size);
    }

    pub fn kind(&self) -> Option<ArchiveKind> {
        ArchiveKind::from_magic(self.magic)
    }

    /// Checks that need nothing but the generic header and the file length.
    pub fn validate(&self, file_len: u64) -> Result<ArchiveKind, FormatError> {
        let kind = self.kind().ok_or(FormatError::BadMagic(self.magic))?;
        if self.version < GENERIC_HEADER_MIN_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: self.version,
                min: GENERIC_HEADER_MIN_VERSION,
            });
        }
        if self.header_size as u64 >= file_len {
            return Err(FormatError::HeaderTooLarge {
                header_size: self.header_size,
                file_len,
            });
        }
        Ok(kind)
    }

    /// Validates the base archive name fields against the raw header and
    /// returns the name, if any.
    pub fn base_archive_name(&self, header: &[u8]) -> Result<Option<String>, FormatError> {
        let offset = self.base_archive_name_offset;
        let size = self.base_archive_name_size;
        let bad = |msg: String| Err(FormatError::BaseArchiveName(msg));

        let end = match offset.checked_add(size) {
            Some(end) => end,
            None => return bad(format!("offset/size overflow: {}/{}", offset, size)),
        };
        if self.magic != MAGIC_DYNAMIC {
            if offset != 0 || size != 0 {
                return bad(format!(
                    "{} archive must not name a base archive ({}/{})",
                    self.kind().map(ArchiveKind::name).unwrap_or("unknown"),
                    offset,
                    size
                ));
            }
            return Ok(None);
        }
        if (size == 0) != (offset == 0) {
            return bad(format!("invalid offset/size: {}/{}", offset, size));
        }
        if size == 0 {
            return Ok(None);
        }
        if end > self.header_size || end as usize > header.len() {
            return bad(format!(
                "offset/size out of range: {} + {} > {}",
                offset, size, self.header_size
            ));
        }
        let name = &header[offset as usize..end as usize];
        let nul = name.iter().position(|b| *b == 0);
        if nul != Some(name.len() - 1) {
            return bad("name is damaged".to_string());
        }
        match std::str::from_utf8(&name[..name.len() - 1]) {
            Ok(name) => Ok(Some(name.to_string())),
            Err(_) => bad("name is not valid UTF-8".to_string()),
        }
    }
}

/// Full archive header.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMapHeader {
    pub generic: GenericHeader,
    pub core_region_alignment: u64,
    pub obj_alignment: u32,
    pub compressed_oops: bool,
    pub compressed_class_ptrs: bool,
    pub narrow_oop_mode: NarrowOopMode,
    pub narrow_oop_shift: u32,
    pub narrow_oop_base: u64,
    pub narrow_klass: NarrowKlassEncoding,
    /// Capacity of the heap the objects were dumped from.
    pub max_heap_size: u64,
    /// No archived object crosses a multiple of this, relative to the heap
    /// region start.
    pub heap_region_alignment: u64,
    /// Address the metadata regions are requested to be mapped at.
    pub requested_base_address: u64,
    pub heap_roots_offset: u64,
    pub heap_root_count: u64,
    pub heap_open_used: u64,
    pub heap_closed_start: u64,
    pub heap_closed_used: u64,
    pub rw_ptrmap_start_pos: u64,
    pub ro_ptrmap_start_pos: u64,
    pub heap_oopmap_start_pos: u64,
    pub heap_ptrmap_start_pos: u64,
    pub vm_ident: Vec<u8>,
    pub regions: [FileMapRegion; NUM_REGIONS],
    pub base_archive_name: Option<String>,
}

impl FileMapHeader {
    pub fn new(kind: ArchiveKind, vm_ident: &str) -> Self {
        Self {
            generic: GenericHeader {
                magic: kind.magic(),
                version: CURRENT_VERSION,
                ..Default::default()
            },
            core_region_alignment: heapsnap_os::page_size() as u64,
            obj_alignment: crate::gc::constants::OBJECT_ALIGNMENT as u32,
            compressed_oops: false,
            compressed_class_ptrs: true,
            narrow_oop_mode: NarrowOopMode::Unscaled,
            narrow_oop_shift: 0,
            narrow_oop_base: 0,
            narrow_klass: NarrowKlassEncoding::DEFAULT,
            max_heap_size: 0,
            heap_region_alignment: 0,
            requested_base_address: 0,
            heap_roots_offset: 0,
            heap_root_count: 0,
            heap_open_used: 0,
            heap_closed_start: 0,
            heap_closed_used: 0,
            rw_ptrmap_start_pos: 0,
            ro_ptrmap_start_pos: 0,
            heap_oopmap_start_pos: 0,
            heap_ptrmap_start_pos: 0,
            vm_ident: header_version(vm_ident).to_vec(),
            regions: [FileMapRegion::default(); NUM_REGIONS],
            base_archive_name: None,
        }
    }

    pub fn kind(&self) -> Option<ArchiveKind> {
        self.generic.kind()
    }

    pub fn set_oop_encoding(&mut self, encoding: OopEncoding) {
        match encoding {
            OopEncoding::Compressed(narrow) => {
                self.compressed_oops = true;
                self.narrow_oop_mode = narrow.mode;
                self.narrow_oop_base = narrow.base;
                self.narrow_oop_shift = narrow.shift;
            }
            OopEncoding::Uncompressed => {
                self.compressed_oops = false;
                self.narrow_oop_mode = NarrowOopMode::Unscaled;
                self.narrow_oop_base = 0;
                self.narrow_oop_shift = 0;
            }
        }
    }

    /// Reference encoding of the heap the archive was dumped from.
    pub fn oop_encoding(&self) -> OopEncoding {
        if self.compressed_oops {
            OopEncoding::Compressed(NarrowOopEncoding::new(
                self.narrow_oop_base,
                self.narrow_oop_shift,
                self.narrow_oop_mode,
            ))
        } else {
            OopEncoding::Uncompressed
        }
    }

    pub fn region(&self, index: RegionIndex) -> &FileMapRegion {
        &self.regions[index.index()]
    }

    pub fn region_mut(&mut self, index: RegionIndex) -> &mut FileMapRegion {
        &mut self.regions[index.index()]
    }

    pub fn header_size(&self) -> usize {
        FIXED_HEADER_SIZE
            + self
                .base_archive_name
                .as_ref()
                .map(|name| name.len() + 1)
                .unwrap_or(0)
    }

    pub fn vm_ident(&self) -> String {
        ident_str(&self.vm_ident)
    }

    fn serialize(&self, ser: &mut HeaderSerializer) {
        self.generic.serialize(ser);
        ser.write_u64(self.core_region_alignment);
        ser.write_u32(self.obj_alignment);
        let mut flags = 0;
        if self.compressed_oops {
            flags |= COMPRESSED_OOPS;
        }
        if self.compressed_class_ptrs {
            flags |= COMPRESSED_CLASS_PTRS;
        }
        ser.write_u32(flags);
        ser.write_u32(self.narrow_oop_mode as u32);
        ser.write_u32(self.narrow_oop_shift);
        ser.write_u64(self.narrow_oop_base);
        ser.write_i32(self.narrow_klass.pointer_bits);
        ser.write_i32(self.narrow_klass.shift);
        ser.write_u64(self.max_heap_size);
        ser.write_u64(self.heap_region_alignment);
        ser.write_u64(self.requested_base_address);
        ser.write_u64(self.heap_roots_offset);
        ser.write_u64(self.heap_root_count);
        ser.write_u64(self.heap_open_used);
        ser.write_u64(self.heap_closed_start);
        ser.write_u64(self.heap_closed_used);
        ser.write_u64(self.rw_ptrmap_start_pos);
        ser.write_u64(self.ro_ptrmap_start_pos);
        ser.write_u64(self.heap_oopmap_start_pos);
        ser.write_u64(self.heap_ptrmap_start_pos);
        let mut ident = [0u8; IDENT_MAX];
        let len = self.vm_ident.len().min(IDENT_MAX);
        ident[..len].copy_from_slice(&self.vm_ident[..len]);
        ser.write_bytes(&ident);
        for region in &self.regions {
            region.serialize(ser);
        }
        debug_assert_eq!(ser.len(), FIXED_HEADER_SIZE);
        if let Some(name) = &self.base_archive_name {
            ser.write_bytes(name.as_bytes());
            ser.write_u8(0);
        }
    }

    /// Fills in the size fields and the crc, and returns the encoded header.
    pub fn finalize(&mut self) -> Vec<u8> {
        self.generic.header_size = self.header_size() as u32;
        match &self.base_archive_name {
            Some(name) => {
                self.generic.base_archive_name_offset = FIXED_HEADER_SIZE as u32;
                self.generic.base_archive_name_size = name.len() as u32 + 1;
            }
            None => {
                self.generic.base_archive_name_offset = 0;
                self.generic.base_archive_name_size = 0;
            }
        }
        let mut ser = HeaderSerializer::new();
        self.serialize(&mut ser);
        let crc = Self::compute_crc(&ser.output);
        ser.patch_u32(CRC_OFFSET, crc);
        self.generic.crc = crc;
        ser.finish()
    }

    /// Crc of an encoded header of `header_size` bytes.
    pub fn compute_crc(header: &[u8]) -> u32 {
        crc32fast::hash(&header[CRC_START..])
    }

    /// Decodes a header whose generic part already passed
    /// [`GenericHeader::validate`]. `bytes` is exactly `header_size` long.
    pub fn parse(bytes: &[u8]) -> Result<FileMapHeader, FormatError> {
        let generic = GenericHeader::parse(bytes)?;
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(FormatError::Truncated("header"));
        }
        let mut de = HeaderDeserializer::new(&bytes[GENERIC_HEADER_SIZE..]);
        let core_region_alignment = de.get_u64("core_region_alignment")?;
        let obj_alignment = de.get_u32("obj_alignment")?;
        let flags = de.get_u32("flags")?;
        let mode = de.get_u32("narrow_oop_mode")?;
        let narrow_oop_mode =
            NarrowOopMode::from_u32(mode).ok_or(FormatError::BadNarrowOopMode(mode))?;
        let narrow_oop_shift = de.get_u32("narrow_oop_shift")?;
        let narrow_oop_base = de.get_u64("narrow_oop_base")?;
        let narrow_klass = NarrowKlassEncoding {
            pointer_bits: de.get_i32("narrow_klass_pointer_bits")?,
            shift: de.get_i32("narrow_klass_shift")?,
        };
        let mut header = FileMapHeader {
            generic,
            core_region_alignment,
            obj_alignment,
            compressed_oops: flags & COMPRESSED_OOPS != 0,
            compressed_class_ptrs: flags & COMPRESSED_CLASS_PTRS != 0,
            narrow_oop_mode,
            narrow_oop_shift,
            narrow_oop_base,
            narrow_klass,
            max_heap_size: de.get_u64("max_heap_size")?,
            heap_region_alignment: de.get_u64("heap_region_alignment")?,
            requested_base_address: de.get_u64("requested_base_address")?,
            heap_roots_offset: de.get_u64("heap_roots_offset")?,
            heap_root_count: de.get_u64("heap_root_count")?,
            heap_open_used: de.get_u64("heap_open_used")?,
            heap_closed_start: de.get_u64("heap_closed_start")?,
            heap_closed_used: de.get_u64("heap_closed_used")?,
            rw_ptrmap_start_pos: de.get_u64("rw_ptrmap_start_pos")?,
            ro_ptrmap_start_pos: de.get_u64("ro_ptrmap_start_pos")?,
            heap_oopmap_start_pos: de.get_u64("heap_oopmap_start_pos")?,
            heap_ptrmap_start_pos: de.get_u64("heap_ptrmap_start_pos")?,
            vm_ident: de.get_bytes(IDENT_MAX, "vm_ident")?.to_vec(),
            regions: [FileMapRegion::default(); NUM_REGIONS],
            base_archive_name: None,
        };
        for region in header.regions.iter_mut() {
            *region = FileMapRegion::deserialize(&mut de)?;
        }
        header.base_archive_name = generic.base_archive_name(bytes)?;
        Ok(header)
    }

    /// Checks the recorded identifier against `expected`.
    pub fn validate_ident(&self, expected: &str) -> Result<(), FormatError> {
        if self.vm_ident.len() != IDENT_MAX || self.vm_ident[IDENT_MAX - 1] != 0 {
            return Err(FormatError::IdentCorrupted);
        }
        let expected_bytes = header_version(expected);
        if self.vm_ident[..IDENT_MAX - 1] != expected_bytes[..IDENT_MAX - 1] {
            return Err(FormatError::IdentMismatch {
                expected: ident_str(&expected_bytes),
                found: self.vm_ident(),
            });
        }
        Ok(())
    }

    /// Checks that every region lies inside a file of `file_len` bytes.
    pub fn validate_regions(&self, file_len: u64) -> Result<(), FormatError> {
        for index in RegionIndex::ALL.iter() {
            let r = self.region(*index);
            if r.file_offset > file_len || file_len - r.file_offset < r.used {
                return Err(FormatError::RegionOutOfBounds {
                    region: index.name(),
                });
            }
        }
        Ok(())
    }

    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "- magic:                          {:#010x}", self.generic.magic)?;
        writeln!(out, "- crc:                            {:#010x}", self.generic.crc)?;
        writeln!(out, "- version:                        {}", self.generic.version)?;
        writeln!(out, "- header_size:                    {}", self.generic.header_size)?;
        writeln!(
            out,
            "- base_archive_name:              {}",
            self.base_archive_name.as_deref().unwrap_or("<none>")
        )?;
        writeln!(out, "- core_region_alignment:          {}", self.core_region_alignment)?;
        writeln!(out, "- obj_alignment:                  {}", self.obj_alignment)?;
        writeln!(out, "- compressed_oops:                {}", self.compressed_oops)?;
        writeln!(out, "- compressed_class_ptrs:          {}", self.compressed_class_ptrs)?;
        writeln!(out, "- narrow_oop_mode:                {}", self.narrow_oop_mode)?;
        writeln!(out, "- narrow_oop_base:                {:#x}", self.narrow_oop_base)?;
        writeln!(out, "- narrow_oop_shift:               {}", self.narrow_oop_shift)?;
        writeln!(out, "- narrow_klass_pointer_bits:      {}", self.narrow_klass.pointer_bits)?;
        writeln!(out, "- narrow_klass_shift:             {}", self.narrow_klass.shift)?;
        writeln!(out, "- max_heap_size:                  {}", self.max_heap_size)?;
        writeln!(out, "- heap_region_alignment:          {}", self.heap_region_alignment)?;
        writeln!(out, "- requested_base_address:         {:#x}", self.requested_base_address)?;
        writeln!(out, "- heap_roots_offset:              {:#x}", self.heap_roots_offset)?;
        writeln!(out, "- heap_root_count:                {}", self.heap_root_count)?;
        writeln!(out, "- heap_open_used:                 {:#x}", self.heap_open_used)?;
        writeln!(out, "- heap_closed_start:              {:#x}", self.heap_closed_start)?;
        writeln!(out, "- heap_closed_used:               {:#x}", self.heap_closed_used)?;
        writeln!(out, "- rw_ptrmap_start_pos:            {}", self.rw_ptrmap_start_pos)?;
        writeln!(out, "- ro_ptrmap_start_pos:            {}", self.ro_ptrmap_start_pos)?;
        writeln!(out, "- heap_oopmap_start_pos:          {}", self.heap_oopmap_start_pos)?;
        writeln!(out, "- heap_ptrmap_start_pos:          {}", self.heap_ptrmap_start_pos)?;
        writeln!(out, "- vm_ident:                       {}", self.vm_ident())?;
        for index in RegionIndex::ALL.iter() {
            self.region(*index).print(*index, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: ArchiveKind) -> FileMapHeader {
        let mut header = FileMapHeader::new(kind, "heapsnap test");
        header.set_oop_encoding(OopEncoding::Compressed(NarrowOopEncoding::heap_based(
            0x8_0000_0000,
            3,
            4096,
        )));
        header.heap_roots_offset = 0x40;
        header.region_mut(RegionIndex::Heap).init(
            RegionIndex::Heap,
            0x3ff000,
            0x2000,
            false,
            false,
            0xabcd,
        );
        header
    }

    #[test]
    fn test_fixed_layout() {
        let bytes = sample(ArchiveKind::Static).finalize();
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE);
        assert_eq!(&bytes[0..4], &MAGIC_STATIC.to_le_bytes());
    }

    #[test]
    fn test_parse_recovers_header() {
        let mut header = sample(ArchiveKind::Dynamic);
        header.base_archive_name = Some("/tmp/base.jsa".to_string());
        let bytes = header.finalize();
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE + "/tmp/base.jsa".len() + 1);
        let parsed = FileMapHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.oop_encoding(), header.oop_encoding());
    }

    #[test]
    fn test_crc_covers_bytes_after_size_field() {
        let mut header = sample(ArchiveKind::Static);
        let mut bytes = header.finalize();
        assert_eq!(FileMapHeader::compute_crc(&bytes), header.generic.crc);
        // The magic and version are outside the checksum.
        bytes[8] ^= 1;
        assert_eq!(FileMapHeader::compute_crc(&bytes), header.generic.crc);
        bytes[FIXED_HEADER_SIZE - 1] ^= 1;
        assert_ne!(FileMapHeader::compute_crc(&bytes), header.generic.crc);
    }

    #[test]
    fn test_generic_validation() {
        let mut header = sample(ArchiveKind::Static);
        let bytes = header.finalize();
        let generic = GenericHeader::parse(&bytes).unwrap();
        assert_eq!(generic.validate(1 << 20), Ok(ArchiveKind::Static));
        assert_eq!(
            generic.validate(bytes.len() as u64),
            Err(FormatError::HeaderTooLarge {
                header_size: bytes.len() as u32,
                file_len: bytes.len() as u64
            })
        );

        let bad = GenericHeader {
            magic: 0x1234,
            ..generic
        };
        assert_eq!(bad.validate(1 << 20), Err(FormatError::BadMagic(0x1234)));
        let old = GenericHeader {
            version: 11,
            ..generic
        };
        assert!(matches!(
            old.validate(1 << 20),
            Err(FormatError::UnsupportedVersion { found: 11, .. })
        ));
    }

    #[test]
    fn test_base_archive_name_rules() {
        let mut header = sample(ArchiveKind::Dynamic);
        header.base_archive_name = Some("base".to_string());
        let mut bytes = header.finalize();
        let generic = GenericHeader::parse(&bytes).unwrap();
        assert_eq!(generic.base_archive_name(&bytes), Ok(Some("base".to_string())));

        // Static archives may not name a base.
        let as_static = GenericHeader {
            magic: MAGIC_STATIC,
            ..generic
        };
        assert!(as_static.base_archive_name(&bytes).is_err());

        // Offset without size.
        let half = GenericHeader {
            base_archive_name_size: 0,
            ..generic
        };
        assert!(half.base_archive_name(&bytes).is_err());

        // Out of range.
        let far = GenericHeader {
            base_archive_name_offset: generic.header_size,
            ..generic
        };
        assert!(far.base_archive_name(&bytes).is_err());

        // Missing terminator.
        let last = bytes.len() - 1;
        bytes[last] = b'x';
        assert!(generic.base_archive_name(&bytes).is_err());
    }

    #[test]
    fn test_ident_truncation() {
        let long: String = std::iter::repeat('v').take(400).collect();
        let a = header_version(&long);
        assert_eq!(a[IDENT_MAX - 1], 0);
        assert!(a[..IDENT_MAX - 9].iter().all(|b| *b == b'v'));
        assert!(a[IDENT_MAX - 9..IDENT_MAX - 1]
            .iter()
            .all(|b| b.is_ascii_hexdigit()));

        let mut other = long.clone();
        other.push('w');
        assert_ne!(a[..], header_version(&other)[..]);
        assert_eq!(a[..], header_version(&long)[..]);

        let short = header_version("short");
        assert_eq!(&short[..6], b"short\0");
    }

    #[test]
    fn test_ident_validation() {
        let header = FileMapHeader::new(ArchiveKind::Static, "build one");
        assert!(header.validate_ident("build one").is_ok());
        assert!(matches!(
            header.validate_ident("build two"),
            Err(FormatError::IdentMismatch { .. })
        ));
        let mut corrupt = header.clone();
        corrupt.vm_ident[IDENT_MAX - 1] = b'x';
        assert_eq!(corrupt.validate_ident("build one"), Err(FormatError::IdentCorrupted));
    }
}
