//! ARMv7-M interrupt masking

use core::sync::atomic::{Ordering, compiler_fence};

/// Whether PRIMASK currently allows interrupts
#[inline]
pub fn interrupts_enabled() -> bool {
    let primask: u32;
    unsafe {
        core::arch::asm!("mrs {}, PRIMASK", out(reg) primask, options(nomem, nostack, preserves_flags));
    }
    primask & 1 == 0
}

/// Disable interrupts
#[inline]
pub fn cpsid() {
    unsafe {
        core::arch::asm!("cpsid i", options(nostack, preserves_flags));
    }
    compiler_fence(Ordering::SeqCst);
}

/// Enable interrupts
#[inline]
pub fn cpsie() {
    compiler_fence(Ordering::SeqCst);
    unsafe {
        core::arch::asm!("cpsie i", options(nostack, preserves_flags));
    }
}
