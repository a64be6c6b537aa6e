//! dualusb - LPC43xx dual-mode USB controller core
//!
//! This library drives the ChipIdea/EHCI USB controllers found on LPC43xx
//! parts (USB0 and USB1) as either a USB device or a USB host:
//!
//! - device mode: endpoint queue heads, a dTD transfer queue per endpoint
//!   and a chapter 9 standard request state machine on EP0
//! - host mode: an asynchronous schedule of queue heads with qTDs
//!   retired from the interrupt handler
//!
//! Board code owns clocks, PHY setup and the NVIC; it creates a
//! [`drivers::usb::UsbPeripheral`] in a `static`, initializes it, registers
//! it and routes the controller interrupt to
//! [`drivers::usb::peripheral::usb0_isr`] or `usb1_isr`.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod arch;
pub mod config;
pub mod drivers;
pub mod error;
pub mod logger;
pub mod time;

pub use error::{Result, UsbError};

/// Initialize the crate-wide services (logging)
///
/// Call once, early, before any controller is brought up.
pub fn init() {
    logger::init();
    log::info!("dualusb v{} starting...", env!("CARGO_PKG_VERSION"));
}
