//! Hardware drivers
//!
//! This module contains the USB controller core.

pub mod usb;
