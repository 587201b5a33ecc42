/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::fmt;

/// A virtual address inside (or handed back by) the address-space calls of
/// this crate.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn to_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// `self + bytes`.
    #[inline]
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// Distance in bytes from `base` up to `self`.
    #[inline]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base, "{} is below {}", self, base);
        self.0 - base.0
    }

    pub fn is_page_aligned(self) -> bool {
        crate::page::is_page_aligned(self.0)
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

impl From<u64> for Address {
    fn from(val: u64) -> Address {
        Address(val as usize)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let base = Address::from(0x1000usize);
        let at = base.offset(0x230);
        assert_eq!(at.offset_from(base), 0x230);
        assert!(at > base);
        assert_eq!(format!("{}", at), "0x1230");
        assert_eq!(Address::from(0x2000u64).to_u64(), 0x2000);
    }
}
