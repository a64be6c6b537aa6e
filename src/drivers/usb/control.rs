//! Control transfer dispatch
//!
//! Routes SETUP packets and control data/status completions to the
//! handler for the request's type (standard, class, vendor). Any stage a
//! handler does not accept stalls the control endpoint, as USB 2.0 section
//! 9.2.7 requires for request errors.

use super::endpoint::EndpointAddress;
use super::peripheral::UsbPeripheral;
use super::regs::RegisterAccess;
use super::req_type;
use super::standard_request;

/// Phase of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Setup,
    Data,
    Status,
}

/// Handler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Ok,
    Stall,
}

/// Handler for one request type
///
/// `endpoint` is either half of the control pair the request arrived on;
/// its SETUP packet is available through [`UsbPeripheral::setup_packet`].
pub type RequestHandler<R> = fn(&UsbPeripheral<R>, EndpointAddress, TransferStage) -> RequestStatus;

/// Handlers selected by bmRequestType bits 5-6
pub struct RequestHandlers<R> {
    pub standard: Option<RequestHandler<R>>,
    pub class: Option<RequestHandler<R>>,
    pub vendor: Option<RequestHandler<R>>,
    pub reserved: Option<RequestHandler<R>>,
}

impl<R> Clone for RequestHandlers<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for RequestHandlers<R> {}

impl<R: RegisterAccess> Default for RequestHandlers<R> {
    fn default() -> Self {
        Self {
            standard: Some(standard_request::handle::<R>),
            class: None,
            vendor: None,
            reserved: None,
        }
    }
}

impl<R> RequestHandlers<R> {
    fn for_kind(&self, kind: u8) -> Option<RequestHandler<R>> {
        match kind {
            req_type::STANDARD => self.standard,
            req_type::CLASS => self.class,
            req_type::VENDOR => self.vendor,
            _ => self.reserved,
        }
    }
}

fn request<R: RegisterAccess>(
    usb: &UsbPeripheral<R>,
    endpoint: EndpointAddress,
    stage: TransferStage,
) {
    let Ok(state) = usb.device_state() else {
        return;
    };
    let Ok(setup) = usb.setup_packet(endpoint) else {
        return;
    };

    let status = match state.handlers.for_kind(setup.kind()) {
        Some(handler) => handler(usb, endpoint, stage),
        None => RequestStatus::Stall,
    };

    if status != RequestStatus::Ok {
        log::debug!(
            "usb{}: stalling request {:#04x}/{:#04x} in {:?} stage",
            usb.controller(),
            setup.request_type,
            setup.request,
            stage
        );
        if let Err(err) = usb.endpoint_stall(endpoint) {
            log::error!("usb{}: stall failed: {}", usb.controller(), err);
        }
    }
}

/// SETUP packet received on a control OUT endpoint
pub fn setup_complete<R: RegisterAccess>(usb: &UsbPeripheral<R>, endpoint: EndpointAddress) {
    request(usb, endpoint, TransferStage::Setup);
}

/// A transfer finished on the control OUT endpoint
pub fn control_out_complete<R: RegisterAccess>(usb: &UsbPeripheral<R>, endpoint: EndpointAddress) {
    let device_to_host = usb
        .setup_packet(endpoint)
        .map(|s| s.is_device_to_host())
        .unwrap_or(false);
    let stage = if device_to_host {
        TransferStage::Status
    } else {
        TransferStage::Data
    };
    request(usb, endpoint, stage);
    let _ = usb.transfer_complete(endpoint);
}

/// A transfer finished on the control IN endpoint
pub fn control_in_complete<R: RegisterAccess>(usb: &UsbPeripheral<R>, endpoint: EndpointAddress) {
    let device_to_host = usb
        .setup_packet(endpoint)
        .map(|s| s.is_device_to_host())
        .unwrap_or(false);
    let stage = if device_to_host {
        TransferStage::Data
    } else {
        TransferStage::Status
    };
    request(usb, endpoint, stage);
    let _ = usb.transfer_complete(endpoint);
}
