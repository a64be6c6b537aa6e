//! Interrupt dispatch
//!
//! One entry point per controller. Pending causes are read from USBSTS,
//! masked with USBINTR and acknowledged before any of them is serviced,
//! then handled in a fixed order: setup, transfer completion, SOF, port
//! change, suspend, bus reset, system error, NAK.

use core::sync::atomic::{Ordering, fence};

use tock_registers::LocalRegisterCopy;

use super::endpoint::EndpointAddress;
use super::peripheral::{PeripheralMode, UsbPeripheral};
use super::regs::{PORTSC1, Register, RegisterAccess, USBCMD, USBSTS, endpoint_bits};
use super::{Direction, SetupPacket, UsbSpeed};
use crate::config::NUM_DEVICE_ENDPOINTS;

/// Bus event hook
pub type EventHook<R> = fn(&UsbPeripheral<R>);

/// Optional reactions to bus events, all off by default
pub struct EventHooks<R> {
    /// Start of frame received
    pub start_of_frame: Option<EventHook<R>>,
    /// Port status changed (attach, speed negotiation, resume)
    pub port_change: Option<EventHook<R>>,
    /// Bus entered suspend
    pub suspend: Option<EventHook<R>>,
    /// Runs after the core finished handling a bus reset
    pub bus_reset: Option<EventHook<R>>,
    /// An endpoint with NAK reporting enabled sent a NAK; receives ENDPTNAK
    pub nak: Option<fn(&UsbPeripheral<R>, u32)>,
}

impl<R> Default for EventHooks<R> {
    fn default() -> Self {
        Self {
            start_of_frame: None,
            port_change: None,
            suspend: None,
            bus_reset: None,
            nak: None,
        }
    }
}

impl<R> Clone for EventHooks<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for EventHooks<R> {}

type Status = LocalRegisterCopy<u32, USBSTS::Register>;

impl<R: RegisterAccess> UsbPeripheral<R> {
    /// Read, acknowledge and return the enabled pending interrupt causes
    pub fn take_interrupt_status(&self) -> u32 {
        let status = self.regs.read(Register::UsbSts) & self.regs.read(Register::UsbIntr);
        self.regs.write(Register::UsbSts, status);
        status
    }

    /// Service the controller's interrupt
    pub fn handle_interrupt(&self) {
        let raw = self.take_interrupt_status();
        if raw == 0 {
            return;
        }
        let status = Status::new(raw);
        match &self.mode {
            PeripheralMode::Device(_) => self.device_interrupt(status),
            PeripheralMode::Host(_) => self.host_interrupt(status),
        }
    }

    fn device_interrupt(&self, status: Status) {
        if status.is_set(USBSTS::UI) {
            self.handle_setup_events();
            self.handle_transfer_events();
        }
        if status.is_set(USBSTS::SRI) {
            if let Some(hook) = self.hooks.start_of_frame {
                hook(self);
            }
        }
        if status.is_set(USBSTS::PCI) {
            self.handle_port_change();
        }
        if status.is_set(USBSTS::SLI) {
            log::debug!("usb{}: suspend", self.controller());
            if let Some(hook) = self.hooks.suspend {
                hook(self);
            }
        }
        if status.is_set(USBSTS::URI) {
            log::debug!("usb{}: bus reset", self.controller());
            if let Err(err) = self.bus_reset() {
                log::error!("usb{}: bus reset failed: {}", self.controller(), err);
            }
            if let Some(hook) = self.hooks.bus_reset {
                hook(self);
            }
        }
        if status.is_set(USBSTS::SEI) {
            log::error!("usb{}: system error", self.controller());
        }
        if status.is_set(USBSTS::NAKI) {
            let naks = self.regs.read(Register::EndptNak);
            self.regs.write(Register::EndptNak, naks);
            if let Some(hook) = self.hooks.nak {
                hook(self, naks);
            }
        }
    }

    fn host_interrupt(&self, status: Status) {
        if status.is_set(USBSTS::UEI) {
            log::debug!("usb{}: transaction error interrupt", self.controller());
        }
        if status.is_set(USBSTS::UI) || status.is_set(USBSTS::UEI) || status.is_set(USBSTS::UAI) {
            if let Err(err) = self.handle_asynchronous_transfer_complete() {
                log::error!("usb{}: schedule walk failed: {}", self.controller(), err);
            }
        }
        if status.is_set(USBSTS::SRI) {
            if let Some(hook) = self.hooks.start_of_frame {
                hook(self);
            }
        }
        if status.is_set(USBSTS::PCI) {
            self.handle_port_change();
        }
        if status.is_set(USBSTS::SEI) {
            log::error!("usb{}: host system error", self.controller());
        }
    }

    fn handle_port_change(&self) {
        let portsc = self.regs.read(Register::PortSc1);
        let port = LocalRegisterCopy::<u32, PORTSC1::Register>::new(portsc);
        log::debug!(
            "usb{}: port change, connected={} speed={:?}",
            self.controller(),
            port.is_set(PORTSC1::CCS),
            UsbSpeed::from_pspd(port.read(PORTSC1::PSPD))
        );
        if let Some(hook) = self.hooks.port_change {
            hook(self);
        }
    }

    /// Copy the SETUP packet out of an OUT queue head using the setup
    /// tripwire, so a packet arriving mid-copy is not torn
    fn read_setup_packet(&self, out: EndpointAddress) -> Option<SetupPacket> {
        let state = self.device_state().ok()?;
        let qh = state.queue_head(out);
        let sutw = USBCMD::SUTW::SET.value;
        let mut bytes = [0u8; 8];
        let copied = self.wait_until("setup tripwire", || {
            self.regs.set_bits(Register::UsbCmd, sutw);
            bytes = qh.setup_bytes();
            self.regs.read(Register::UsbCmd) & sutw != 0
        });
        self.regs.clear_bits(Register::UsbCmd, sutw);
        fence(Ordering::SeqCst);
        copied.ok().map(|()| SetupPacket::from_bytes(bytes))
    }

    fn handle_setup_events(&self) {
        let Ok(state) = self.device_state() else {
            return;
        };
        let pending = self.endpoint_setup_status();
        for number in 0..NUM_DEVICE_ENDPOINTS as u8 {
            if pending & (1 << number) == 0 {
                continue;
            }
            let out = EndpointAddress::new(number, Direction::Out);
            let packet = self.read_setup_packet(out);

            let callback = {
                let mut endpoints = state.endpoints.lock();
                if let Some(packet) = packet {
                    for address in [out, out.in_half()] {
                        if let Some(endpoint) = endpoints.get_mut(address) {
                            endpoint.setup = packet;
                        }
                    }
                }
                endpoints.get(out).and_then(|e| e.callbacks.setup_complete)
            };

            if let Err(err) = self.clear_setup_status(1 << number) {
                log::error!("usb{}: {}", self.controller(), err);
            }
            // A new SETUP cancels whatever the previous control transfer left queued.
            let flushed = self
                .endpoint_flush(out)
                .and_then(|()| self.endpoint_flush(out.in_half()));
            if let Err(err) = flushed {
                log::error!("usb{}: {} not released: {}", self.controller(), out, err);
                continue;
            }

            match (callback, packet) {
                (Some(callback), Some(_)) => callback(self, out),
                (_, None) => log::warn!("usb{}: lost SETUP on {}", self.controller(), out),
                (None, _) => log::trace!("usb{}: SETUP on {} ignored", self.controller(), out),
            }
        }
    }

    fn handle_transfer_events(&self) {
        let Ok(state) = self.device_state() else {
            return;
        };
        let complete = self.take_endpoint_complete() & endpoint_bits::ALL;
        if complete == 0 {
            return;
        }
        for index in 0..NUM_DEVICE_ENDPOINTS * 2 {
            let address = EndpointAddress::from_queue_head_index(index);
            if complete & address.bit() == 0 {
                continue;
            }
            let callback = state
                .endpoints
                .lock()
                .by_queue_head(index)
                .and_then(|e| e.callbacks.transfer_complete);
            match callback {
                Some(callback) => callback(self, address),
                None => {
                    let _ = self.transfer_complete(address);
                }
            }
        }
    }
}
