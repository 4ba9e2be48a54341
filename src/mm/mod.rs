//! Memory management helpers
//!
//! Page-size discovery and page arithmetic shared by the loader and the
//! fault handler.

pub mod mmap;
pub mod tracker;

/// The host page size in bytes.
///
/// Queried from the kernel once per call; callers on the fault path cache
/// the value in the published loader state instead of calling this again.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    size as usize
}

/// Round `value` down to a multiple of `page_size`.
pub fn page_floor(value: usize, page_size: usize) -> usize {
    value & !(page_size - 1)
}

/// Number of pages needed to cover `len` bytes.
pub fn pages_spanned(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size)
}
