/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Platform layer for the heap archive: page geometry, alignment math and
//! raw address-space management (reserve, commit, map a file at a fixed
//! address).

pub mod address;
pub mod align;
pub mod memory;
pub mod page;

pub use address::Address;
pub use align::{align_down, align_down_u64, align_up, align_up_u64, is_aligned, is_aligned_u64};
pub use memory::{MemoryPermission, Reservation};
pub use page::{is_page_aligned, page_size};
