//! SIGSEGV fault handler — the demand-paging core
//!
//! The handler runs synchronously on whichever thread faulted, for every
//! access violation in the process. It either materializes the missing page
//! of a published segment or forwards the fault to whatever disposition was
//! installed before the loader, so the program's own crash semantics are
//! preserved bit for bit.
//!
//! Signal context is a restricted execution environment. Everything on the
//! fault path holds to that: a single atomic load finds the published
//! state, page claims are lock-free compare-exchanges, the mapping call is
//! one syscall, and the fatal path uses raw `write` + `_exit`. No
//! allocation, no locks, no `log` macros.

use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use std::os::fd::AsRawFd;

use crate::error::{LoaderError, Result};
use crate::image::{find_segment, Segment};
use crate::loader::{active_state, LoaderState};
use crate::mm::mmap::{self, ProtFlags};
use crate::mm::tracker::Claim;
use crate::slot::StateSlot;

/// The trap disposition that was active before [`install`].
///
/// Faults this system does not own are forwarded here.
pub(crate) struct PriorDisposition(libc::sigaction);

// SAFETY: sigaction is plain data (handler address, mask, flags); it is
// written once at install and only read afterwards.
unsafe impl Send for PriorDisposition {}
// SAFETY: see above.
unsafe impl Sync for PriorDisposition {}

static PRIOR: StateSlot<PriorDisposition> = StateSlot::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the fault handler, capturing the previous disposition for
/// chaining. Must complete before any segment is touched.
pub(crate) fn install() -> Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(LoaderError::AlreadyActive);
    }

    // SAFETY: zero-initializing sigaction before setting its fields is the
    // documented way to build one.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_flags = libc::SA_SIGINFO;
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_segv;
    action.sa_sigaction = handler as usize;

    // SAFETY: both structs are valid for the duration of the call; a
    // further SIGSEGV is masked while the handler runs.
    let mut prior: libc::sigaction = unsafe { mem::zeroed() };
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaddset(&mut action.sa_mask, libc::SIGSEGV);
        libc::sigaction(libc::SIGSEGV, &action, &mut prior)
    };
    if rc != 0 {
        INSTALLED.store(false, Ordering::Release);
        return Err(LoaderError::Registration {
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }

    // Cannot collide: uninstall drains the slot before INSTALLED clears.
    let _ = PRIOR.set(Box::new(PriorDisposition(prior)));
    Ok(())
}

/// Restore the prior disposition and allow a later reinstall.
pub(crate) fn uninstall() {
    if let Some(prior) = PRIOR.take() {
        // SAFETY: restoring a disposition previously returned by sigaction.
        unsafe {
            libc::sigaction(libc::SIGSEGV, &prior.0, core::ptr::null_mut());
        }
    }
    INSTALLED.store(false, Ordering::Release);
}

pub(crate) fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// The installed SIGSEGV handler.
extern "C" fn on_segv(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    // SAFETY: the kernel hands a SA_SIGINFO handler a valid siginfo_t.
    let addr = unsafe { (*info).si_addr() } as usize;

    let Some(state) = active_state() else {
        return forward_to_prior(signo, info, ctx);
    };
    let Some(segment) = find_segment(&state.segments, addr) else {
        // Not an address this system manages.
        return forward_to_prior(signo, info, ctx);
    };

    let page = segment.page_index(addr, state.page_size);
    match segment.pages.claim(page) {
        // Already materialized: a genuine protection violation, e.g. a
        // write to a read-only page. Never suppressed.
        Claim::AlreadyMapped => forward_to_prior(signo, info, ctx),
        // Another thread is filling this page; once it commits, returning
        // retries the access and it succeeds.
        Claim::InProgress => segment.pages.wait_mapped(page),
        Claim::Won => materialize(state, segment, page),
    }
}

/// Map page `page` of `segment` and mark it mapped.
///
/// The tracker entry is advanced only after the page content is fully
/// correct, so no partial state can ever be observed as `Mapped`.
fn materialize(state: &LoaderState, segment: &Segment, page: usize) {
    let info = segment.info();
    let page_size = state.page_size;
    let page_addr = segment.page_addr(page, page_size);
    let start = page * page_size;
    let end = start + page_size;

    if start >= info.file_size {
        // Entirely past the file-backed content: an anonymous mapping is
        // the zero page the segment tail requires.
        if mmap::map_fixed_anon(page_addr, page_size, info.prot).is_err() {
            fatal_mapping_failure();
        }
        segment.pages.commit(page);
        return;
    }

    // The page straddling the file_size boundary is zeroed in place, which
    // needs transient write access when the segment itself has none.
    let needs_zero = info.file_size < info.mem_size && end > info.file_size;
    let map_prot = if needs_zero {
        info.prot | ProtFlags::WRITE
    } else {
        info.prot
    };

    let file_offset = info.file_offset + start as u64;
    let mapped = mmap::map_fixed_file(
        page_addr,
        page_size,
        map_prot,
        state.file.as_raw_fd(),
        file_offset,
    );
    if mapped.is_err() {
        fatal_mapping_failure();
    }

    if needs_zero {
        let boundary = info.file_size - start;
        // SAFETY: the page was just mapped writable; the zero range starts
        // at the in-page boundary offset and stops at the page end.
        unsafe {
            core::ptr::write_bytes((page_addr + boundary) as *mut u8, 0, page_size - boundary);
        }
        if !info.prot.contains(ProtFlags::WRITE)
            && mmap::protect(page_addr, page_size, info.prot).is_err()
        {
            fatal_mapping_failure();
        }
    }

    segment.pages.commit(page);
}

/// A lazy mapping failed mid-execution. Resource exhaustion; not retried.
fn fatal_mapping_failure() -> ! {
    const MSG: &[u8] = b"lazyrun: fatal: lazy page mapping failed\n";
    // SAFETY: write with a static buffer and _exit are both safe to call
    // from signal context; _exit does not return.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            MSG.as_ptr() as *const libc::c_void,
            MSG.len(),
        );
        libc::_exit(-libc::ENOMEM);
    }
}

/// Hand the fault to the disposition that was active before the loader.
fn forward_to_prior(signo: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let Some(prior) = PRIOR.get() else {
        // Installed but no prior captured yet: fall back to the default
        // action on retry.
        // SAFETY: zeroed sigaction with SIG_DFL is a valid disposition.
        unsafe {
            let mut dfl: libc::sigaction = mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGSEGV, &dfl, core::ptr::null_mut());
        }
        return;
    };

    let handler = prior.0.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        // Reinstate the saved disposition and return; the retried access
        // faults again and the kernel applies it, exactly as if this
        // system were never installed.
        // SAFETY: restoring a disposition previously returned by sigaction.
        unsafe {
            libc::sigaction(libc::SIGSEGV, &prior.0, core::ptr::null_mut());
        }
        return;
    }

    if prior.0.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: the prior disposition declared a three-argument handler;
        // the address came from sigaction itself.
        let prev: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { mem::transmute(handler) };
        prev(signo, info, ctx);
    } else {
        // SAFETY: as above, for a one-argument handler.
        let prev: extern "C" fn(libc::c_int) = unsafe { mem::transmute(handler) };
        prev(signo);
    }
}
