//! Error type shared by the USB controller core

use core::fmt;

/// Errors reported by controller operations
///
/// Bus-level transfer failures (halts, transaction errors) are not errors
/// here; they are handed to the transfer's completion callback as flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// A descriptor pool has no free entries
    ResourceExhausted,
    /// The request must be answered with a STALL handshake
    Stall,
    /// A bounded hardware wait expired
    Timeout,
    /// Operation does not apply to the peripheral's current mode
    WrongMode,
    /// Endpoint number out of range or not configured
    InvalidEndpoint,
    /// Argument outside what the hardware can describe
    InvalidParameter,
    /// No configuration with the requested value exists
    ConfigurationNotFound,
    /// A hardware link points outside the descriptor pools
    CorruptSchedule,
    /// The registry slot is already occupied
    AlreadyRegistered,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UsbError::ResourceExhausted => "descriptor pool exhausted",
            UsbError::Stall => "request stalled",
            UsbError::Timeout => "hardware wait timed out",
            UsbError::WrongMode => "operation not valid in current controller mode",
            UsbError::InvalidEndpoint => "invalid endpoint",
            UsbError::InvalidParameter => "invalid parameter",
            UsbError::ConfigurationNotFound => "configuration not found",
            UsbError::CorruptSchedule => "schedule link outside descriptor pools",
            UsbError::AlreadyRegistered => "controller already registered",
        };
        f.write_str(msg)
    }
}

/// Result alias for controller operations
pub type Result<T> = core::result::Result<T, UsbError>;
