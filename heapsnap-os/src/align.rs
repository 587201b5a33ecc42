/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Power-of-two alignment helpers. Every alignment passed here is a power of
//! two (page size, heap word, region granularity).

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    align_down(value + align - 1, align)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

#[inline(always)]
pub const fn align_down_u64(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline(always)]
pub const fn align_up_u64(value: u64, align: u64) -> u64 {
    align_down_u64(value + align - 1, align)
}

#[inline(always)]
pub const fn is_aligned_u64(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
