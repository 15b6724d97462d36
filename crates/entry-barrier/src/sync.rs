//! Memory and Instruction Stream Synchronization
//!
//! Fences used around guard patching:
//!
//! - [`cross_modify_fence`]: executed by a thread that learned through data
//!   (the guard value) that code it is about to run was modified. Makes the
//!   modified instructions visible to its own instruction fetch.
//! - [`load_load_fence`]: orders the guard load before later loads of data
//!   the disarming thread published.
//! - [`clear_icache`]: executed by the patching thread after it wrote into
//!   the instruction stream.
//!
//! x86_64 keeps instruction and data caches coherent and only needs the
//! serializing effect of a full fence. AArch64 and RISC-V need explicit
//! maintenance.

use std::sync::atomic::{fence, Ordering};

/// Make code modified by another thread visible to this thread's fetch
#[inline]
pub fn cross_modify_fence() {
    fence(Ordering::SeqCst);

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `isb` only flushes the pipeline.
        unsafe {
            core::arch::asm!("isb", options(nostack, nomem, preserves_flags));
        }
    }

    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: `fence.i` only synchronizes this hart's instruction fetch.
        unsafe {
            core::arch::asm!("fence.i", options(nostack, nomem, preserves_flags));
        }
    }
}

/// Order the guard load before subsequent loads
#[inline(always)]
pub fn load_load_fence() {
    fence(Ordering::Acquire);
}

/// Write back data and invalidate instruction cache lines for a range
///
/// # Safety
///
/// `start..start + len` must be mapped memory owned by the caller.
#[inline]
pub unsafe fn clear_icache(start: usize, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        let ctr: u64;
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += dline;
        }
        core::arch::asm!("dsb ish", options(nostack, preserves_flags));

        let mut addr = start & !(iline - 1);
        while addr < end {
            core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += iline;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }

    #[cfg(target_arch = "riscv64")]
    {
        let _ = start;
        core::arch::asm!("fence.i", options(nostack, preserves_flags));
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
    {
        let _ = start;
        fence(Ordering::SeqCst);
    }
}
