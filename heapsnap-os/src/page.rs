/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Virtual memory page geometry.
use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = os_page_size();
    assert!(size.is_power_of_two(), "page size {} is not a power of two", size);
    size
});

/// Granularity of reservations and file mappings.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn is_page_aligned(val: usize) -> bool {
    crate::align::is_aligned(val, page_size())
}

#[cfg(target_family = "unix")]
fn os_page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        val if val > 0 => val as usize,
        _ => panic!("sysconf(_SC_PAGESIZE) failed: {}", errno::errno()),
    }
}

#[cfg(target_family = "windows")]
fn os_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, LPSYSTEM_INFO, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info as LPSYSTEM_INFO) };
    info.dwPageSize as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_geometry() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(3 * page));
        assert!(!is_page_aligned(page + 64));
    }
}
