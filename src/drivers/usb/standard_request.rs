//! USB 2.0 chapter 9 standard requests
//!
//! Handles the requests every device must answer on EP0. Requests this
//! core does not implement (features, interfaces, SET_DESCRIPTOR,
//! SYNCH_FRAME) stall.

use super::control::{RequestStatus, TransferStage};
use super::descriptor_table::descriptor_length;
use super::endpoint::EndpointAddress;
use super::peripheral::UsbPeripheral;
use super::regs::RegisterAccess;
use super::{Result, SetupPacket, desc_type, request};

/// Standard request handler for [`super::RequestHandlers::standard`]
pub fn handle<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    stage: TransferStage,
) -> RequestStatus {
    // Data and status stages need no further work.
    if stage != TransferStage::Setup {
        return RequestStatus::Ok;
    }
    let Ok(setup) = usb.setup_packet(endpoint) else {
        return RequestStatus::Stall;
    };

    let result = match setup.request {
        request::GET_STATUS => get_status(usb, endpoint, &setup),
        request::SET_ADDRESS => set_address(usb, endpoint, &setup),
        request::GET_DESCRIPTOR => get_descriptor(usb, endpoint, &setup),
        request::GET_CONFIGURATION => get_configuration(usb, endpoint, &setup),
        request::SET_CONFIGURATION => set_configuration(usb, endpoint, &setup),
        other => {
            log::debug!("usb{}: unsupported standard request {}", usb.controller(), other);
            return RequestStatus::Stall;
        }
    };

    match result {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::Stall,
    }
}

/// Send `descriptor` truncated to wLength, then accept the status stage
fn send_descriptor<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
    descriptor: &'static [u8],
) -> Result<()> {
    let length = descriptor_length(descriptor).min(setup.length() as usize);
    usb.send_static(endpoint.in_half(), &descriptor[..length], None, core::ptr::null_mut())?;
    usb.transfer_schedule_ack(endpoint.out_half())
}

/// Send a short reply built in the control reply buffer
fn send_reply<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    data: &[u8],
) -> Result<()> {
    let state = usb.device_state()?;
    let buffer = state.reply.load(data);
    unsafe {
        usb.transfer_schedule_block(
            endpoint.in_half(),
            buffer,
            data.len() as u32,
            None,
            core::ptr::null_mut(),
        )?;
    }
    usb.transfer_schedule_ack(endpoint.out_half())
}

fn get_descriptor<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
) -> Result<()> {
    let descriptors = usb.descriptors()?;
    let speed = usb.current_speed();
    let index = setup.value_low();

    let descriptor = match setup.value_high() {
        desc_type::DEVICE => Some(descriptors.device),
        desc_type::CONFIGURATION => {
            descriptors.find_configuration(index.wrapping_add(1), speed)
        }
        desc_type::DEVICE_QUALIFIER => descriptors.device_qualifier,
        desc_type::OTHER_SPEED_CONFIGURATION => {
            descriptors.find_other_speed_configuration(index.wrapping_add(1), speed)
        }
        desc_type::STRING => descriptors.string(index),
        // Only reachable as part of a configuration descriptor.
        desc_type::INTERFACE | desc_type::ENDPOINT => None,
        _ => None,
    };

    match descriptor {
        Some(descriptor) => send_descriptor(usb, endpoint, setup, descriptor),
        None => {
            log::debug!(
                "usb{}: no descriptor type {} index {}",
                usb.controller(),
                setup.value_high(),
                index
            );
            Err(super::UsbError::Stall)
        }
    }
}

fn set_address<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
) -> Result<()> {
    // The controller latches the new address once this status stage is sent.
    usb.transfer_schedule_ack(endpoint.in_half())?;
    usb.set_address_deferred(setup.value_low())?;
    log::debug!("usb{}: address {}", usb.controller(), setup.value_low());
    Ok(())
}

fn set_configuration<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
) -> Result<()> {
    usb.set_configuration(setup.value_low())?;
    usb.transfer_schedule_ack(endpoint.in_half())
}

fn get_configuration<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
) -> Result<()> {
    if setup.length() != 1 {
        return Err(super::UsbError::Stall);
    }
    send_reply(usb, endpoint, &[usb.configuration_value()])
}

fn get_status<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    setup: &SetupPacket,
) -> Result<()> {
    if setup.length() != 2 {
        return Err(super::UsbError::Stall);
    }
    send_reply(usb, endpoint, &[0, 0])
}
