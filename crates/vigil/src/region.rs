// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Reserved native memory area with incremental commit/uncommit.
//!
//! One anonymous `PROT_NONE` reservation covers the whole buffer area;
//! individual buffers are committed on demand with `mprotect` and given back
//! to the OS with `madvise(MADV_DONTNEED)`. Committing can fail under memory
//! pressure and the failure is reported, never fatal.

use std::io;
use std::ptr;

use crate::{Error, Result};

/// Host page size, queried once.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// One contiguous reservation of virtual address space.
///
/// The mapping is released as a whole on drop; buffers inside it are never
/// unmapped individually.
pub struct ReservedRegion {
    base: *mut u8,
    len: usize,
}

// SAFETY: ReservedRegion is Send + Sync because the base pointer is fixed for
// the region's lifetime and all access control goes through commit/uncommit,
// which callers serialize per buffer.
unsafe impl Send for ReservedRegion {}
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Reserve `len` bytes of address space without backing memory.
    pub fn reserve(len: usize) -> Result<Self> {
        debug_assert!(len > 0 && len % page_size() == 0);
        // SAFETY: anonymous mapping, no file descriptor, length validated above.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::RegionReserve(io::Error::last_os_error()));
        }
        Ok(Self {
            base: base.cast::<u8>(),
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Commit physical memory for a page-aligned slice of the region.
    pub fn commit(&self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset % page_size() == 0 && len % page_size() == 0);
        debug_assert!(offset + len <= self.len);
        // SAFETY: the range lies within our own mapping.
        let rc = unsafe {
            libc::mprotect(
                self.base.add(offset).cast::<libc::c_void>(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(Error::CommitFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Return a committed slice to the OS. Returns false if the kernel
    /// declined; the caller keeps treating the buffer as committed then.
    pub fn uncommit(&self, offset: usize, len: usize) -> bool {
        debug_assert!(offset % page_size() == 0 && len % page_size() == 0);
        debug_assert!(offset + len <= self.len);
        // SAFETY: the range lies within our own mapping.
        unsafe {
            let p = self.base.add(offset).cast::<libc::c_void>();
            if libc::madvise(p, len, libc::MADV_DONTNEED) != 0 {
                return false;
            }
            // Protection failure after a successful madvise leaves the range
            // readable but empty; still report it as uncommitted.
            let _ = libc::mprotect(p, len, libc::PROT_NONE);
        }
        true
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len are exactly what mmap returned.
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_write_roundtrip() {
        let page = page_size();
        let region = ReservedRegion::reserve(4 * page).expect("reserve");
        region.commit(page, page).expect("commit");

        // SAFETY: just committed read/write on this page.
        unsafe {
            let p = region.base().add(page);
            p.write(0xAB);
            p.add(page - 1).write(0xCD);
            assert_eq!(p.read(), 0xAB);
            assert_eq!(p.add(page - 1).read(), 0xCD);
        }
    }

    #[test]
    fn uncommit_then_recommit_zeroes() {
        let page = page_size();
        let region = ReservedRegion::reserve(2 * page).expect("reserve");
        region.commit(0, page).expect("commit");
        // SAFETY: committed above.
        unsafe { region.base().write(42) };

        assert!(region.uncommit(0, page));
        region.commit(0, page).expect("recommit");
        // SAFETY: recommitted; DONTNEED dropped the dirty page.
        assert_eq!(unsafe { region.base().read() }, 0);
    }

    #[test]
    fn align_up_rounds_to_alignment() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
