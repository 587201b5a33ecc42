/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Address-space management used by the runtime heap.
//!
//! A [`Reservation`] owns a contiguous range of virtual memory. Parts of it
//! can be committed as anonymous read/write memory or replaced by a private
//! file mapping placed at a fixed address inside the range.
use crate::address::Address;
use crate::align::{align_up, is_aligned};
use crate::page::{is_page_aligned, page_size};
use std::fs::File;
use std::io;
use std::ptr;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemoryPermission {
    Read,
    ReadWrite,
}

fn last_error(what: &str) -> io::Error {
    let err = errno::errno();
    io::Error::new(
        io::Error::from_raw_os_error(err.0).kind(),
        format!("{} failed: {}", what, err),
    )
}

#[cfg(target_family = "unix")]
fn protection(permission: MemoryPermission) -> libc::c_int {
    match permission {
        MemoryPermission::Read => libc::PROT_READ,
        MemoryPermission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

#[cfg(target_family = "windows")]
fn protection(permission: MemoryPermission) -> u32 {
    use winapi::um::winnt::{PAGE_READONLY, PAGE_READWRITE};
    match permission {
        MemoryPermission::Read => PAGE_READONLY,
        MemoryPermission::ReadWrite => PAGE_READWRITE,
    }
}

#[cfg(target_family = "unix")]
fn reserve(size: usize) -> io::Result<Address> {
    debug_assert!(is_page_aligned(size));

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(last_error("mmap(PROT_NONE)"));
    }

    Ok(Address::from_ptr(ptr))
}

#[cfg(target_family = "windows")]
fn reserve(size: usize) -> io::Result<Address> {
    debug_assert!(is_page_aligned(size));

    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};

    let ptr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

    if ptr.is_null() {
        return Err(last_error("VirtualAlloc(MEM_RESERVE)"));
    }

    Ok(Address::from_ptr(ptr))
}

#[cfg(target_family = "unix")]
fn release(ptr: Address, size: usize) -> io::Result<()> {
    let result = unsafe { libc::munmap(ptr.to_mut_ptr(), size) };

    if result != 0 {
        return Err(last_error("munmap"));
    }
    Ok(())
}

#[cfg(target_family = "windows")]
fn release(ptr: Address, _size: usize) -> io::Result<()> {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    let result = unsafe { VirtualFree(ptr.to_mut_ptr(), 0, MEM_RELEASE) };

    if result == 0 {
        return Err(last_error("VirtualFree(MEM_RELEASE)"));
    }
    Ok(())
}

/// Commits `[ptr, ptr + size)` as fresh zeroed memory. Whatever was mapped
/// there before (including a file mapping) is discarded.
#[cfg(target_family = "unix")]
pub fn commit_at(ptr: Address, size: usize, permission: MemoryPermission) -> io::Result<()> {
    debug_assert!(ptr.is_page_aligned());
    debug_assert!(is_page_aligned(size));

    let val = unsafe {
        libc::mmap(
            ptr.to_mut_ptr(),
            size,
            protection(permission),
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if val == libc::MAP_FAILED {
        return Err(last_error("mmap(MAP_FIXED)"));
    }
    Ok(())
}

#[cfg(target_family = "windows")]
pub fn commit_at(ptr: Address, size: usize, permission: MemoryPermission) -> io::Result<()> {
    debug_assert!(ptr.is_page_aligned());
    debug_assert!(is_page_aligned(size));

    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::MEM_COMMIT;

    let result = unsafe { VirtualAlloc(ptr.to_mut_ptr(), size, MEM_COMMIT, protection(permission)) };

    if result != ptr.to_mut_ptr() {
        return Err(last_error("VirtualAlloc(MEM_COMMIT)"));
    }
    unsafe { ptr::write_bytes(ptr.to_mut_ptr::<u8>(), 0, size) };
    Ok(())
}

/// Maps `size` bytes of `file` starting at `offset` privately (copy on write)
/// at exactly `ptr`, replacing the memory that was there.
///
/// `ptr` and `offset` must be page aligned. Platforms without fixed file
/// mappings return [`io::ErrorKind::Other`] and callers read the bytes
/// instead.
#[cfg(target_family = "unix")]
pub fn map_file_at(
    ptr: Address,
    size: usize,
    file: &File,
    offset: u64,
    permission: MemoryPermission,
) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if !ptr.is_page_aligned() || !is_aligned(offset as usize, page_size()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "file mapping at {} (file offset {:#x}) is not page aligned",
                ptr, offset
            ),
        ));
    }

    let val = unsafe {
        libc::mmap(
            ptr.to_mut_ptr(),
            align_up(size, page_size()),
            protection(permission),
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    };

    if val == libc::MAP_FAILED {
        return Err(last_error("mmap(file, MAP_FIXED)"));
    }
    if val != ptr.to_mut_ptr() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("file mapped at {:p} instead of {}", val, ptr),
        ));
    }
    Ok(())
}

#[cfg(target_family = "windows")]
pub fn map_file_at(
    ptr: Address,
    _size: usize,
    _file: &File,
    _offset: u64,
    _permission: MemoryPermission,
) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("fixed-address file mapping at {} is not supported", ptr),
    ))
}

/// Returns true when [`map_file_at`] can succeed on this platform.
pub const fn can_map_files() -> bool {
    cfg!(target_family = "unix")
}

/// Owns a range of reserved address space. The range is released on drop.
pub struct Reservation {
    start: Address,
    size: usize,

    unaligned_start: Address,
    unaligned_size: usize,
}

impl Reservation {
    /// Reserves `size` bytes whose start is aligned to `align`.
    pub fn reserve_align(size: usize, align: usize) -> io::Result<Reservation> {
        debug_assert!(is_page_aligned(size));

        let align = if align == 0 { page_size() } else { align.max(page_size()) };
        let unaligned_size = size + align - page_size();

        let unaligned_start = reserve(unaligned_size)?;
        let aligned_start: Address = align_up(unaligned_start.to_usize(), align).into();

        let gap_start = aligned_start.offset_from(unaligned_start);
        let gap_end = unaligned_size - size - gap_start;

        if cfg!(target_family = "unix") {
            if gap_start > 0 {
                release(unaligned_start, gap_start)?;
            }
            if gap_end > 0 {
                release(aligned_start.offset(size), gap_end)?;
            }
            Ok(Reservation {
                start: aligned_start,
                size,
                unaligned_start: aligned_start,
                unaligned_size: size,
            })
        } else {
            Ok(Reservation {
                start: aligned_start,
                size,
                unaligned_start,
                unaligned_size,
            })
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: Address, size: usize) -> bool {
        addr >= self.start && addr.to_usize() + size <= self.end().to_usize()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // The process keeps running with a leaked range if this fails.
        let _ = release(self.unaligned_start, self.unaligned_size);
    }
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reserve_commit() {
        let align = 1 << 20;
        let res = Reservation::reserve_align(4 * align, align).unwrap();
        assert!(is_aligned(res.start().to_usize(), align));
        assert_eq!(res.size(), 4 * align);

        commit_at(res.start(), 2 * align, MemoryPermission::ReadWrite).unwrap();
        unsafe {
            let p = res.start().to_mut_ptr::<u8>();
            assert_eq!(*p, 0);
            *p = 42;
            assert_eq!(*p, 42);
        }
    }

    #[test]
    fn test_map_file_at_inside_reservation() {
        let page = page_size();
        let mut file = tempfile::tempfile().unwrap();
        let mut contents = vec![0u8; 2 * page];
        contents[page] = 0xab;
        contents[page + 1] = 0xcd;
        file.write_all(&contents).unwrap();

        let res = Reservation::reserve_align(4 * page, page).unwrap();
        commit_at(res.start(), 4 * page, MemoryPermission::ReadWrite).unwrap();

        let at = res.start().offset(page);
        map_file_at(at, page, &file, page as u64, MemoryPermission::ReadWrite).unwrap();
        unsafe {
            let p = at.to_mut_ptr::<u8>();
            assert_eq!(*p, 0xab);
            assert_eq!(*p.add(1), 0xcd);
            // private mapping: writes do not reach the file
            *p = 1;
        }

        commit_at(at, page, MemoryPermission::ReadWrite).unwrap();
        unsafe { assert_eq!(*at.to_ptr::<u8>(), 0) };
    }

    #[test]
    fn test_map_file_rejects_unaligned_offset() {
        let file = tempfile::tempfile().unwrap();
        let page = page_size();
        let res = Reservation::reserve_align(page, page).unwrap();
        assert!(map_file_at(res.start(), page, &file, 12, MemoryPermission::Read).is_err());
    }
}
