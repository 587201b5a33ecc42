/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Dump-time construction of the archived heap region.
//!
//! The pipeline runs over one [`ArchiveBuildContext`]:
//!
//! 1. [`copier`] copies the open objects, the root table and the closed
//!    objects into an [`buffer::ArchiveBuffer`], padding with filler arrays
//!    so no object straddles a region boundary;
//! 2. [`address`] picks the address the buffer is requested to be mapped at;
//! 3. [`rewriter`] rewrites every embedded reference and metadata pointer to
//!    its requested value and records it in the relocation bitmaps.
//!
//! [`writer::ArchiveHeapWriter`] drives the steps and hands back an
//! [`ArchiveHeapInfo`] for the file writer.
pub mod address;
pub mod buffer;
pub mod context;
pub mod copier;
pub mod rewriter;
pub mod writer;

pub use context::{ArchiveBuildContext, ArchiveSelection, DumpConfig, MetadataDelta, MetadataRelocator};
pub use writer::{ArchiveHeapInfo, ArchiveHeapWriter};
