//! Controller configuration and sizing constants

/// Number of USB controllers on the part (USB0, USB1)
pub const NUM_USB_CONTROLLERS: usize = 2;

/// Endpoint numbers implemented by USB0 (USB1 implements 4)
pub const NUM_DEVICE_ENDPOINTS: usize = 6;

/// Device queue heads: one per direction per endpoint number
pub const USB_TOTAL_QUEUE_HEADS: usize = NUM_DEVICE_ENDPOINTS * 2;

/// Host-mode queue heads available for asynchronous endpoints
pub const HOST_MAX_QUEUE_HEADS: usize = 8;

/// Host-mode transfer descriptors shared by all host endpoints
pub const HOST_MAX_TRANSFERS: usize = 8;

/// Device-mode transfer descriptors shared by all device endpoints
pub const DEVICE_MAX_TRANSFERS: usize = 16;

/// Entries in the (unused) periodic frame list
pub const USB_PERIODIC_LIST_SIZE: usize = 8;

/// Size of the in-memory log ring in bytes
pub const LOG_RING_SIZE: usize = 1024;

/// Default iteration bound for hardware busy-waits
pub const DEFAULT_POLL_LIMIT: u32 = 1_000_000;

/// Runtime options for a controller instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Iteration bound for busy-waits; `None` waits forever
    pub poll_limit: Option<u32>,
    /// Hold the port at full speed (PORTSC1.PFSC)
    pub force_full_speed: bool,
    /// Interrupt threshold control written to USBCMD.ITC
    pub interrupt_threshold: u8,
    /// Let host queue heads take the data toggle from each qTD
    pub data_toggle_control: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_limit: Some(DEFAULT_POLL_LIMIT),
            force_full_speed: false,
            interrupt_threshold: 0,
            data_toggle_control: false,
        }
    }
}

impl ControllerConfig {
    /// Configuration that never gives up on a hardware wait
    pub const fn unbounded() -> Self {
        Self {
            poll_limit: None,
            force_full_speed: false,
            interrupt_threshold: 0,
            data_toggle_control: false,
        }
    }
}
