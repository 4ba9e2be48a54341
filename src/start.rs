//! Program starter collaborator
//!
//! Transfers control to the loaded image. [`EntryStarter`] builds a minimal
//! System V style startup stack (argc, the argument pointers, empty
//! environment) and jumps to the entry point on the current thread; the
//! loaded program's first instruction fetch is usually also its first
//! demand-paging fault.

use std::convert::Infallible;

use crate::error::{LoaderError, Result};
use crate::image::LoadedImage;
use crate::mm::mmap::{self, ProtFlags};

/// The transfer-of-control collaborator.
pub trait ProgramStarter {
    /// Start the image's entry point with `argv` forwarded verbatim.
    ///
    /// On success this never returns; it returns only on failure to start.
    fn start(&self, image: &LoadedImage<'_>, argv: &[String]) -> Result<Infallible>;
}

/// Starter that jumps straight to the entry point.
pub struct EntryStarter;

const STARTUP_STACK_SIZE: usize = 128 * 1024;
/// Headroom kept free below the argument vector.
const STACK_RESERVE: usize = 64;

impl ProgramStarter for EntryStarter {
    #[cfg(target_arch = "x86_64")]
    fn start(&self, image: &LoadedImage<'_>, argv: &[String]) -> Result<Infallible> {
        let sp = build_startup_stack(argv)?;
        log::info!("transferring control to 0x{:x}", image.entry);
        // SAFETY: entry points into a published segment; the first fetch
        // traps and the fault handler materializes the page. sp points at
        // a valid argc/argv vector on a live mapping.
        unsafe { enter(image.entry as u64, sp) }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn start(&self, image: &LoadedImage<'_>, argv: &[String]) -> Result<Infallible> {
        let _ = (image, argv);
        Err(LoaderError::Start {
            reason: "entry transfer is only implemented for x86_64",
        })
    }
}

/// Lay out `[argc, argv..., NULL, NULL envp]` plus the argument strings on
/// a fresh anonymous stack. Returns the initial stack pointer, 16-byte
/// aligned with argc on top.
fn build_startup_stack(argv: &[String]) -> Result<*const u8> {
    let base = mmap::map_anon(STARTUP_STACK_SIZE, ProtFlags::READ | ProtFlags::WRITE)
        .map_err(|_| LoaderError::Start {
            reason: "cannot allocate startup stack",
        })? as usize;
    let mut cursor = base + STARTUP_STACK_SIZE;

    // Argument strings first, from the top down, each NUL-terminated.
    let mut string_ptrs: Vec<u64> = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        if arg.as_bytes().contains(&0) {
            return Err(LoaderError::Start {
                reason: "argument contains an interior NUL byte",
            });
        }
        let total = arg.len() + 1;
        if cursor - base < total + STACK_RESERVE {
            return Err(LoaderError::Start {
                reason: "argument strings overflow the startup stack",
            });
        }
        cursor -= total;
        // SAFETY: the range [cursor, cursor + total) lies within the
        // freshly mapped writable stack.
        unsafe {
            core::ptr::copy_nonoverlapping(arg.as_ptr(), cursor as *mut u8, arg.len());
            *((cursor as *mut u8).add(arg.len())) = 0;
        }
        string_ptrs.push(cursor as u64);
    }
    string_ptrs.reverse();

    cursor &= !0xf;
    // argc, the argv entries, the argv terminator, the envp terminator.
    let slots = 1 + string_ptrs.len() + 2;
    if cursor - base < (slots + 1) * 8 + STACK_RESERVE {
        return Err(LoaderError::Start {
            reason: "argument vector overflows the startup stack",
        });
    }
    if slots % 2 == 1 {
        // Pad so the final stack pointer stays 16-byte aligned.
        push(&mut cursor, 0);
    }
    push(&mut cursor, 0); // envp terminator
    push(&mut cursor, 0); // argv terminator
    for ptr in string_ptrs.iter().rev() {
        push(&mut cursor, *ptr);
    }
    push(&mut cursor, argv.len() as u64);

    Ok(cursor as *const u8)
}

fn push(cursor: &mut usize, value: u64) {
    *cursor -= 8;
    // SAFETY: the caller checked the cursor stays within the mapped stack;
    // cursor is 8-byte aligned after the 16-byte alignment step.
    unsafe { core::ptr::write(*cursor as *mut u64, value) };
}

/// Switch to the new stack and jump. Does not return.
///
/// # Safety
/// `entry` must be the entry point of the published image and `sp` a valid
/// startup stack; nothing from the current Rust frame survives the jump.
#[cfg(target_arch = "x86_64")]
unsafe fn enter(entry: u64, sp: *const u8) -> ! {
    // SAFETY: per the function contract; the outermost frame zeroes rbp
    // per the psABI.
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor ebp, ebp",
            "jmp {target}",
            stack = in(reg) sp,
            target = in(reg) entry,
            options(noreturn)
        )
    }
}
