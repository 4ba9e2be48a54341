//! Thin wrappers over the mapping syscalls
//!
//! Everything here is callable from signal context: the wrappers perform a
//! single syscall and report failure through [`MapError`], a plain errno
//! carrier that involves no allocation.

use std::os::fd::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Memory protection for a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: libc::c_int {
        /// Allow reading from the region.
        const READ = libc::PROT_READ;
        /// Allow writing to the region.
        const WRITE = libc::PROT_WRITE;
        /// Allow executing code in the region.
        const EXEC = libc::PROT_EXEC;
    }
}

/// A failed mapping syscall, carrying the errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError(pub i32);

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map one region of a file at a fixed address, private copy-on-write.
///
/// The new mapping exactly overlays `[addr, addr + len)`; writes never
/// propagate to the backing file. `addr` and `offset` must be page-aligned.
pub fn map_fixed_file(
    addr: usize,
    len: usize,
    prot: ProtFlags,
    fd: RawFd,
    offset: u64,
) -> Result<(), MapError> {
    // SAFETY: MAP_FIXED replaces whatever occupies the target range, which
    // is exactly the contract the caller asks for; the fd stays open for
    // the lifetime of the mapping's backing object per mmap semantics.
    let res = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if res == libc::MAP_FAILED {
        Err(MapError(last_errno()))
    } else {
        Ok(())
    }
}

/// Map a zero-filled anonymous region at a fixed address, private.
pub fn map_fixed_anon(addr: usize, len: usize, prot: ProtFlags) -> Result<(), MapError> {
    // SAFETY: as for map_fixed_file; anonymous mappings take no fd.
    let res = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        Err(MapError(last_errno()))
    } else {
        Ok(())
    }
}

/// Map a zero-filled anonymous region wherever the kernel places it.
pub fn map_anon(len: usize, prot: ProtFlags) -> Result<*mut u8, MapError> {
    // SAFETY: a NULL hint with no MAP_FIXED lets the kernel pick a free
    // range; nothing existing is replaced.
    let res = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        Err(MapError(last_errno()))
    } else {
        Ok(res as *mut u8)
    }
}

/// Change the protection of an existing mapping.
pub fn protect(addr: usize, len: usize, prot: ProtFlags) -> Result<(), MapError> {
    // SAFETY: operates on a range the caller mapped; mprotect on an
    // unmapped range fails cleanly with ENOMEM.
    let res = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) };
    if res == 0 {
        Ok(())
    } else {
        Err(MapError(last_errno()))
    }
}

/// Remove a mapping.
pub fn unmap(addr: usize, len: usize) -> Result<(), MapError> {
    // SAFETY: munmap on a range that is partly unmapped is still defined;
    // the caller only passes ranges it mapped.
    let res = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if res == 0 {
        Ok(())
    } else {
        Err(MapError(last_errno()))
    }
}
