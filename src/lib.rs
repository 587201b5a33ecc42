/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Archived object heap snapshots.
//!
//! At dump time a selected subgraph of a [`gc::source_heap::SourceHeap`] is
//! copied into a contiguous buffer, every embedded reference is rewritten to
//! the address the object is *requested* to live at when the archive is
//! reused, and the result is written as the heap region of a multi-region
//! archive file together with relocation bitmaps. At startup the
//! [`loader::ArchiveHeapLoader`] maps that region into the running heap
//! (or copies it when mapping is impossible) and patches the references that
//! moved.
#[macro_use]
pub mod utils;
pub mod archive;
pub mod demo;
pub mod dump;
pub mod error;
pub mod filemap;
pub mod gc;
pub mod loader;
pub mod oops;
pub mod options;

pub mod prelude {
    pub use super::archive::{ArchiveBuildContext, ArchiveHeapInfo, ArchiveSelection, DumpConfig};
    pub use super::error::{ArchiveError, Result};
    pub use super::filemap::{ArchiveKind, FileMapHeader, FileMapInfo, RegionIndex};
    pub use super::gc::compressed::{NarrowOopEncoding, NarrowOopMode, OopEncoding};
    pub use super::gc::runtime_heap::{ArchiveHeapSupport, RuntimeHeap};
    pub use super::gc::source_heap::SourceHeap;
    pub use super::loader::{ArchiveHeapLoader, LoadOptions, LoadedHeap};
    pub use super::oops::{Oop, klass::{FieldType, KlassTable}};
    pub use super::options::Options;
}
