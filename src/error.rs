/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use std::io;
use thiserror::Error;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Everything that can go wrong while dumping or reusing an archive.
///
/// Only [`ArchiveError::Unrecoverable`] must stop the process; every other
/// variant lets the caller continue without the archive (or without its
/// heap objects).
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive file itself is unusable; reject the whole archive.
    #[error("invalid archive: {0}")]
    Format(#[from] FormatError),

    /// One region failed verification or could not be placed; reject the
    /// heap objects, keep the rest.
    #[error("region \"{region}\" rejected: {kind}")]
    Region {
        region: &'static str,
        kind: RegionFailure,
    },

    /// The archive was dumped under a configuration the running heap can
    /// not honor.
    #[error("archived heap disabled: {0}")]
    Environment(String),

    #[error("could not allocate {size} bytes for the archived heap")]
    HeapAllocation { size: usize },

    #[error("dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unable to use the archived heap and it is required: {0}")]
    Unrecoverable(String),
}

impl ArchiveError {
    pub fn region(region: &'static str, kind: RegionFailure) -> Self {
        ArchiveError::Region { region, kind }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ArchiveError::Unrecoverable(_))
    }

    /// Escalates a soft failure when the caller insisted on the archive.
    pub fn escalate(self, required: bool) -> Self {
        if required && self.is_recoverable() {
            ArchiveError::Unrecoverable(self.to_string())
        } else {
            self
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("file is too small to hold a header ({0} bytes)")]
    TooSmall(u64),

    #[error("bad magic number {0:#x}")]
    BadMagic(u32),

    #[error("archive kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("header version {found} is older than the minimum supported {min}")]
    UnsupportedVersion { found: u32, min: u32 },

    #[error("archive version {found} does not match the expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("header size {header_size} is not smaller than the file size {file_len}")]
    HeaderTooLarge { header_size: u32, file_len: u64 },

    #[error("header checksum {actual:#x} does not match the recorded {expected:#x}")]
    HeaderCrc { expected: u32, actual: u32 },

    #[error("header field {0} is out of bounds")]
    Truncated(&'static str),

    #[error("invalid base archive name: {0}")]
    BaseArchiveName(String),

    #[error("VM identifier is corrupted")]
    IdentCorrupted,

    #[error("archive was created by \"{found}\" but this is \"{expected}\"")]
    IdentMismatch { expected: String, found: String },

    #[error("region {region} extends past the end of the file")]
    RegionOutOfBounds { region: &'static str },

    #[error("invalid narrow oop mode {0}")]
    BadNarrowOopMode(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionFailure {
    #[error("checksum {actual:#x} does not match the recorded {expected:#x}")]
    Crc { expected: u32, actual: u32 },

    #[error("read {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("mapping failed: {0}")]
    Map(String),

    #[error("relocation bitmap does not cover the region")]
    BitmapOutOfRange,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DumpError {
    #[error("object at {object:#x} is {size} bytes, larger than the region granularity {limit}")]
    ObjectTooLarge { object: u64, size: usize, limit: usize },

    #[error("root table with {roots} entries does not fit in {limit} bytes")]
    RootTableTooLarge { roots: usize, limit: usize },

    #[error("gap of {size} bytes at buffer offset {offset:#x} can not hold a filler object")]
    UnfillableGap { offset: usize, size: usize },

    #[error("object at {from:#x} references {to:#x} which is not archived")]
    UnarchivedReference { from: u64, to: u64 },

    #[error("root {0:#x} is not archived")]
    UnarchivedRoot(u64),

    #[error("object at {0:#x} was selected twice")]
    DuplicateObject(u64),

    #[error("metadata pointer {value:#x} in object at {object:#x} has no requested address")]
    UnrelocatableMetadata { object: u64, value: u64 },

    #[error("archived heap of {size} bytes does not fit below the heap top {top:#x}")]
    HeapTooSmall { size: usize, top: u64 },

    #[error("the heap can only be archived into a static archive")]
    HeapInDynamicArchive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation() {
        let err = ArchiveError::region(
            "hp",
            RegionFailure::Crc {
                expected: 1,
                actual: 2,
            },
        );
        assert!(err.is_recoverable());
        let err = err.escalate(true);
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("hp"));
    }

    #[test]
    fn test_soft_errors_stay_soft() {
        let err = ArchiveError::Environment("compressed oops differ".to_string());
        assert!(err.escalate(false).is_recoverable());
    }
}
