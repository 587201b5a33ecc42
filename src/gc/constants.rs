/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub const HEAP_WORD_SIZE: usize = 8;
pub const LOG_HEAP_WORD_SIZE: usize = 3;

/// Objects are aligned to one heap word.
pub const OBJECT_ALIGNMENT: usize = HEAP_WORD_SIZE;

/// Smallest region size any supported collector uses. Archived objects never
/// straddle a multiple of this value, measured from the start of the buffer.
pub const MIN_GC_REGION_ALIGNMENT: usize = 1024 * 1024;

/// Requested start of the archived heap when references are stored as full
/// 64-bit addresses.
pub const NOCOOPS_REQUESTED_BASE: u64 = 0x1000_0000;

/// Native word size of metadata pointers embedded in objects.
pub const METADATA_POINTER_SIZE: usize = 8;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: u64 = (MB * KB) as u64;
