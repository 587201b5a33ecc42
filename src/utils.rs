/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Emits a debug record on `target` when `$cond` holds. Used for the chatty
/// per-object logging that is switched on with `--verbose`.
#[macro_export]
macro_rules! logln_if {
    ($cond: expr, target: $target:expr, $($fmt:tt)*) => {
        if $cond {
            log::debug!(target: $target, $($fmt)*);
        }
    };
    ($cond: expr, $($fmt:tt)*) => {
        if $cond {
            log::debug!($($fmt)*);
        }
    };
}

// Object memory and archive buffers are little-endian byte images.

#[inline]
pub fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
pub fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Adds a signed delta to an address.
#[inline]
pub fn offset_address(addr: u64, delta: i64) -> u64 {
    (addr as i64).wrapping_add(delta) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_accessors() {
        let mut bytes = [0u8; 16];
        put_u32(&mut bytes, 4, 0xdead_beef);
        put_u64(&mut bytes, 8, 0x0102_0304_0506_0708);
        assert_eq!(bytes[4], 0xef);
        assert_eq!(get_u32(&bytes, 4), 0xdead_beef);
        assert_eq!(get_u64(&bytes, 8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_offset_address() {
        assert_eq!(offset_address(0x1000, -0x10), 0xff0);
        assert_eq!(offset_address(0x1000, 0x10), 0x1010);
    }
}
