/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! The archive container: header, region table and region payloads.
pub mod codec;
pub mod header;
pub mod reader;
pub mod region;
pub mod writer;

pub use header::{ArchiveKind, FileMapHeader, GenericHeader};
pub use reader::{CoreRegions, FileMapInfo};
pub use region::{FileMapRegion, RegionIndex};
pub use writer::FileMapWriter;
