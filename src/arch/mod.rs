//! Architecture support
//!
//! The controller core only needs interrupt masking from the CPU. On
//! Cortex-M this is PRIMASK; on every other target (the development host
//! running unit tests) masking is a no-op.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m;
pub mod sync;

/// Interrupt enable state captured by [`disable_interrupts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptState {
    was_enabled: bool,
}

/// Mask interrupts and return the previous state
#[inline]
pub fn disable_interrupts() -> InterruptState {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    {
        let was_enabled = cortex_m::interrupts_enabled();
        cortex_m::cpsid();
        InterruptState { was_enabled }
    }

    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        InterruptState { was_enabled: false }
    }
}

/// Restore the state returned by [`disable_interrupts`]
#[inline]
pub fn restore_interrupts(state: InterruptState) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    if state.was_enabled {
        cortex_m::cpsie();
    }

    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let _ = state;
}
