//! Device-mode endpoint bookkeeping
//!
//! Endpoints are named by their USB address. Each (number, direction) pair
//! maps to one device queue head at index `number * 2 + is_in`; the
//! endpoint record for a queue head lives at the same index of the
//! endpoint table, which is how a queue head finds its endpoint again.

use super::peripheral::UsbPeripheral;
use super::regs::endpoint_bits;
use super::{Direction, Result, SetupPacket, UsbError};
use crate::config::{NUM_DEVICE_ENDPOINTS, USB_TOTAL_QUEUE_HEADS};

/// USB endpoint address: number in bits 0-3, bit 7 set for IN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Control OUT endpoint (0x00)
    pub const CONTROL_OUT: EndpointAddress = EndpointAddress(0x00);
    /// Control IN endpoint (0x80)
    pub const CONTROL_IN: EndpointAddress = EndpointAddress(0x80);

    /// Address for endpoint `number` in `direction`
    pub const fn new(number: u8, direction: Direction) -> Self {
        let dir = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        Self(dir | (number & 0x0F))
    }

    /// Address from its wire encoding
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw & 0x8F)
    }

    /// Wire encoding
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Endpoint number
    pub const fn number(self) -> u8 {
        self.0 & 0x0F
    }

    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub const fn direction(self) -> Direction {
        if self.is_in() {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Same endpoint number, opposite direction
    pub const fn sibling(self) -> Self {
        Self(self.0 ^ 0x80)
    }

    /// IN half of this endpoint pair
    pub const fn in_half(self) -> Self {
        Self(self.0 | 0x80)
    }

    /// OUT half of this endpoint pair
    pub const fn out_half(self) -> Self {
        Self(self.0 & 0x0F)
    }

    /// Index of the device queue head serving this endpoint
    pub const fn queue_head_index(self) -> usize {
        self.number() as usize * 2 + self.is_in() as usize
    }

    /// Inverse of [`Self::queue_head_index`]
    pub const fn from_queue_head_index(index: usize) -> Self {
        let direction = if index & 1 == 1 {
            Direction::In
        } else {
            Direction::Out
        };
        Self::new((index / 2) as u8, direction)
    }

    /// Bit for this endpoint in ENDPTPRIME/FLUSH/STAT/COMPLETE/NAK
    pub const fn bit(self) -> u32 {
        let shift = if self.is_in() {
            endpoint_bits::TX_SHIFT
        } else {
            endpoint_bits::RX_SHIFT
        };
        1 << (shift + self.number() as u32)
    }

    /// Bits for both directions of this endpoint number
    pub const fn pair_bits(self) -> u32 {
        self.in_half().bit() | self.out_half().bit()
    }

    /// Reject endpoint numbers the controller does not implement
    pub fn validate(self) -> Result<Self> {
        if (self.number() as usize) < NUM_DEVICE_ENDPOINTS {
            Ok(self)
        } else {
            Err(UsbError::InvalidEndpoint)
        }
    }
}

impl core::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EP{}{}", self.number(), if self.is_in() { "IN" } else { "OUT" })
    }
}

/// Endpoint event callback
pub type EndpointCallback<R> = fn(&UsbPeripheral<R>, EndpointAddress);

/// Callbacks attached to an endpoint
pub struct EndpointCallbacks<R> {
    /// A SETUP packet arrived (OUT endpoints of control pairs)
    pub setup_complete: Option<EndpointCallback<R>>,
    /// ENDPTCOMPLETE fired for this endpoint
    pub transfer_complete: Option<EndpointCallback<R>>,
}

impl<R> Clone for EndpointCallbacks<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for EndpointCallbacks<R> {}

impl<R> Default for EndpointCallbacks<R> {
    fn default() -> Self {
        Self {
            setup_complete: None,
            transfer_complete: None,
        }
    }
}

/// Software state of one endpoint
pub(crate) struct Endpoint<R> {
    pub(crate) address: EndpointAddress,
    /// Last SETUP packet seen on this endpoint pair
    pub(crate) setup: SetupPacket,
    pub(crate) callbacks: EndpointCallbacks<R>,
}

/// Endpoint records indexed like the queue head list
pub(crate) struct EndpointTable<R> {
    slots: [Option<Endpoint<R>>; USB_TOTAL_QUEUE_HEADS],
}

impl<R> EndpointTable<R> {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    pub(crate) fn insert(&mut self, address: EndpointAddress, callbacks: EndpointCallbacks<R>) {
        let setup = self
            .get(address)
            .map(|e| e.setup)
            .unwrap_or(SetupPacket::EMPTY);
        self.slots[address.queue_head_index()] = Some(Endpoint {
            address,
            setup,
            callbacks,
        });
    }

    pub(crate) fn get(&self, address: EndpointAddress) -> Option<&Endpoint<R>> {
        self.slots.get(address.queue_head_index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, address: EndpointAddress) -> Option<&mut Endpoint<R>> {
        self.slots.get_mut(address.queue_head_index())?.as_mut()
    }

    /// Endpoint record owning queue head `index`
    pub(crate) fn by_queue_head(&self, index: usize) -> Option<&Endpoint<R>> {
        self.slots.get(index)?.as_ref()
    }
}
