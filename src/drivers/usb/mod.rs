//! USB controller core
//!
//! Dual-mode driver for the LPC43xx USB0/USB1 controllers. A peripheral is
//! brought up either as a USB device (endpoint queue heads, standard
//! request handling) or as a USB host (asynchronous schedule of queue
//! heads and transfer descriptors).

pub mod control;
pub mod descriptor_table;
pub mod device;
pub mod ehci;
pub mod endpoint;
pub mod host;
pub mod interrupt;
pub mod peripheral;
pub mod pool;
pub mod regs;
pub mod standard_request;

#[cfg(test)]
pub(crate) mod testing;

use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use control::{RequestHandler, RequestHandlers, RequestStatus, TransferStage};
pub use descriptor_table::{DescriptorTable, StringDescriptor};
pub use endpoint::{EndpointAddress, EndpointCallbacks};
pub use peripheral::UsbPeripheral;
pub use regs::{MmioRegisters, Register, RegisterAccess};

pub use crate::error::{Result, UsbError};

/// Completion callback for device-mode transfers
///
/// Receives the opaque pointer given at scheduling time and the number of
/// bytes actually moved.
pub type DeviceTransferCallback = fn(user_data: *mut (), bytes_transferred: u32);

/// Completion callback for host-mode transfers
pub type HostTransferCallback =
    fn(user_data: *mut (), bytes_transferred: u32, halted: bool, transaction_error: bool);

/// Opaque callback context carried alongside a queued transfer
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserData(pub(crate) *mut ());

// Safety: the pointer is never dereferenced by the core, only handed back
// to the callback that was scheduled with it.
unsafe impl Send for UserData {}

impl UserData {
    pub(crate) const NONE: UserData = UserData(core::ptr::null_mut());
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    Low,
    High,
}

impl UsbSpeed {
    /// Decode PORTSC1.PSPD
    pub fn from_pspd(value: u32) -> Self {
        match value {
            1 => UsbSpeed::Low,
            2 => UsbSpeed::High,
            _ => UsbSpeed::Full,
        }
    }
}

/// Endpoint transfer type, encoded as in endpoint descriptors and ENDPTCTRL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decode the low two bits of bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x3 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Token PID used by a host transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

/// Standard request codes (bRequest)
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// Descriptor type codes
pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
}

/// bmRequestType fields
pub mod req_type {
    /// Data stage direction bit (set: device to host)
    pub const DIRECTION_IN: u8 = 0x80;
    /// Request type field shift
    pub const TYPE_SHIFT: u8 = 5;
    /// Request type field mask (after shifting)
    pub const TYPE_MASK: u8 = 0x3;
    pub const STANDARD: u8 = 0;
    pub const CLASS: u8 = 1;
    pub const VENDOR: u8 = 2;
    pub const RESERVED: u8 = 3;
}

/// 8-byte SETUP packet, little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: U16,
    pub index: U16,
    pub length: U16,
}

impl SetupPacket {
    /// All-zero packet
    pub const EMPTY: SetupPacket = SetupPacket {
        request_type: 0,
        request: 0,
        value: U16::ZERO,
        index: U16::ZERO,
        length: U16::ZERO,
    };

    /// Build a packet from its fields
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    /// Decode the raw bytes latched by the controller
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        match Self::read_from_bytes(&bytes) {
            Ok(packet) => packet,
            Err(_) => Self::EMPTY,
        }
    }

    pub fn value(&self) -> u16 {
        self.value.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    /// Low byte of wValue
    pub fn value_low(&self) -> u8 {
        self.value.get() as u8
    }

    /// High byte of wValue
    pub fn value_high(&self) -> u8 {
        (self.value.get() >> 8) as u8
    }

    /// Data stage flows device to host
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & req_type::DIRECTION_IN != 0
    }

    /// Standard, class, vendor or reserved
    pub fn kind(&self) -> u8 {
        (self.request_type >> req_type::TYPE_SHIFT) & req_type::TYPE_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_is_little_endian() {
        let packet = SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x40, 0x00]);
        assert!(packet.is_device_to_host());
        assert_eq!(packet.kind(), req_type::STANDARD);
        assert_eq!(packet.request, request::GET_DESCRIPTOR);
        assert_eq!(packet.value_high(), desc_type::CONFIGURATION);
        assert_eq!(packet.value_low(), 0);
        assert_eq!(packet.length(), 64);
        assert_eq!(packet.as_bytes(), &[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn vendor_request_kind() {
        let packet = SetupPacket::new(0x40, 0x12, 0, 0, 0);
        assert_eq!(packet.kind(), req_type::VENDOR);
        assert!(!packet.is_device_to_host());
    }
}
