//! Descriptor tables served by the standard request handler
//!
//! Descriptors are stored as the raw byte images sent on the wire; typed
//! views are read out with zerocopy when a field is needed.

use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{UsbSpeed, desc_type};

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: U16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: U16,
    pub product_id: U16,
    pub device_version: U16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

/// Configuration descriptor header (9 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: U16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

/// Endpoint descriptor (7 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: U16,
    pub interval: u8,
}

const _: () = {
    assert!(core::mem::size_of::<DeviceDescriptor>() == 18);
    assert!(core::mem::size_of::<ConfigurationDescriptor>() == 9);
    assert!(core::mem::size_of::<EndpointDescriptor>() == 7);
};

/// One entry of the sparse string table
#[derive(Debug, Clone, Copy)]
pub struct StringDescriptor {
    /// String index the host asks for
    pub index: u8,
    /// Complete descriptor (bLength, bDescriptorType, UTF-16LE text)
    pub descriptor: &'static [u8],
}

/// Everything a device answers GET_DESCRIPTOR with
#[derive(Debug, Clone, Copy)]
pub struct DescriptorTable {
    /// Device descriptor
    pub device: &'static [u8],
    /// Device qualifier, for high-speed capable devices
    pub device_qualifier: Option<&'static [u8]>,
    /// Configurations used when the link runs at full speed
    pub full_speed_configurations: &'static [&'static [u8]],
    /// Configurations used when the link runs at high speed
    pub high_speed_configurations: &'static [&'static [u8]],
    /// String index 0, the supported language IDs
    pub language: Option<&'static [u8]>,
    /// Remaining strings, any order, gaps allowed
    pub strings: &'static [StringDescriptor],
}

impl DescriptorTable {
    /// Typed view of the device descriptor
    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        DeviceDescriptor::read_from_prefix(self.device)
            .ok()
            .map(|(descriptor, _)| descriptor)
    }

    /// EP0 max packet size from the device descriptor
    pub fn ep0_max_packet_size(&self) -> u16 {
        self.device_descriptor()
            .map(|d| d.max_packet_size0 as u16)
            .unwrap_or(64)
    }

    /// Configuration pool for the link's current speed
    pub fn configurations(&self, speed: UsbSpeed) -> &'static [&'static [u8]] {
        match speed {
            UsbSpeed::High if !self.high_speed_configurations.is_empty() => {
                self.high_speed_configurations
            }
            _ => self.full_speed_configurations,
        }
    }

    /// Configuration pool for the speed the link is not running at
    pub fn other_speed_configurations(&self, speed: UsbSpeed) -> &'static [&'static [u8]] {
        match speed {
            UsbSpeed::High => self.full_speed_configurations,
            _ => self.high_speed_configurations,
        }
    }

    /// Configuration whose bConfigurationValue is `value`
    pub fn find_configuration(&self, value: u8, speed: UsbSpeed) -> Option<&'static [u8]> {
        find_by_value(self.configurations(speed), value)
    }

    /// Other-speed configuration whose bConfigurationValue is `value`
    pub fn find_other_speed_configuration(&self, value: u8, speed: UsbSpeed) -> Option<&'static [u8]> {
        find_by_value(self.other_speed_configurations(speed), value)
    }

    /// String descriptor by index; index 0 is the language list
    pub fn string(&self, index: u8) -> Option<&'static [u8]> {
        if index == 0 {
            return self.language;
        }
        self.strings
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.descriptor)
    }
}

fn find_by_value(pool: &'static [&'static [u8]], value: u8) -> Option<&'static [u8]> {
    pool.iter()
        .copied()
        .find(|config| configuration_header(config).map(|h| h.configuration_value) == Some(value))
}

/// Typed view of a configuration descriptor's header
pub fn configuration_header(descriptor: &[u8]) -> Option<ConfigurationDescriptor> {
    ConfigurationDescriptor::read_from_prefix(descriptor)
        .ok()
        .map(|(header, _)| header)
}

/// bConfigurationValue of a configuration descriptor
pub fn configuration_value(descriptor: &[u8]) -> u8 {
    configuration_header(descriptor)
        .map(|h| h.configuration_value)
        .unwrap_or(0)
}

/// Bytes a GET_DESCRIPTOR reply carries before truncation
///
/// Configuration descriptors report wTotalLength so that the interface and
/// endpoint descriptors following the header go out with it; everything
/// else reports bLength.
pub fn descriptor_length(descriptor: &[u8]) -> usize {
    let declared = match descriptor.get(1).copied() {
        Some(desc_type::CONFIGURATION) | Some(desc_type::OTHER_SPEED_CONFIGURATION) => {
            configuration_header(descriptor)
                .map(|h| h.total_length.get() as usize)
                .unwrap_or(0)
        }
        _ => descriptor.first().copied().unwrap_or(0) as usize,
    };
    declared.min(descriptor.len())
}

/// Walk a configuration looking for the endpoint descriptor for `address`
pub fn find_endpoint_descriptor(configuration: &[u8], address: u8) -> Option<EndpointDescriptor> {
    let total = descriptor_length(configuration);
    let mut offset = 0;
    while offset + 2 <= total {
        let length = configuration[offset] as usize;
        if length == 0 {
            break;
        }
        if configuration[offset + 1] == desc_type::ENDPOINT {
            if let Ok((endpoint, _)) =
                EndpointDescriptor::read_from_prefix(&configuration[offset..total])
            {
                if endpoint.endpoint_address == address {
                    return Some(endpoint);
                }
            }
        }
        offset += length;
    }
    None
}
