//! USB peripheral instances and the controller registry
//!
//! A [`UsbPeripheral`] owns one controller's register block and runs in
//! exactly one mode, chosen when it is created. Device mode carries the
//! endpoint queue heads and request handling state; host mode carries the
//! asynchronous schedule.
//!
//! The controller reads queue heads and descriptors straight out of the
//! peripheral, so a peripheral must not move once `device_init` or
//! `host_init` has run. Put it in a `static` (or a `Box` in tests) first.

use spin::Once;

use super::device::DeviceState;
use super::host::HostState;
use super::interrupt::EventHooks;
use super::regs::{MmioRegisters, PORTSC1, Register, RegisterAccess, USBCMD};
use super::{DescriptorTable, Result, UsbError, UsbSpeed};
use crate::config::{ControllerConfig, NUM_USB_CONTROLLERS};
use crate::time::Timeout;

/// Mode-specific state of a peripheral
pub enum PeripheralMode<R> {
    Device(DeviceState<R>),
    Host(HostState),
}

/// One USB controller
pub struct UsbPeripheral<R> {
    pub(crate) regs: R,
    controller: u8,
    pub(crate) config: ControllerConfig,
    pub(crate) hooks: EventHooks<R>,
    pub(crate) mode: PeripheralMode<R>,
}

impl<R: RegisterAccess> UsbPeripheral<R> {
    /// Peripheral that will run as a USB device serving `descriptors`
    pub fn new_device(
        regs: R,
        controller: u8,
        config: ControllerConfig,
        descriptors: DescriptorTable,
    ) -> Self {
        Self {
            regs,
            controller,
            config,
            hooks: EventHooks::default(),
            mode: PeripheralMode::Device(DeviceState::new(descriptors)),
        }
    }

    /// Peripheral that will run as a USB host
    pub fn new_host(regs: R, controller: u8, config: ControllerConfig) -> Self {
        Self {
            regs,
            controller,
            config,
            hooks: EventHooks::default(),
            mode: PeripheralMode::Host(HostState::new()),
        }
    }

    /// Controller number (0 for USB0, 1 for USB1)
    pub fn controller(&self) -> u8 {
        self.controller
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Register access for board code (PHY setup, clocks)
    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode, PeripheralMode::Device(_))
    }

    pub fn is_host(&self) -> bool {
        matches!(self.mode, PeripheralMode::Host(_))
    }

    /// Install bus event hooks; call before the peripheral is shared
    pub fn set_event_hooks(&mut self, hooks: EventHooks<R>) {
        self.hooks = hooks;
    }

    /// Stop the controller and pulse USBCMD.RST
    ///
    /// In device mode every endpoint is disabled and flushed first so no
    /// transfer is cut off mid-DMA.
    pub fn controller_reset(&self) -> Result<()> {
        if self.is_device() {
            self.reset_all_endpoints()?;
        }
        self.stop();
        let reset = USBCMD::RST::SET.value;
        self.regs.set_bits(Register::UsbCmd, reset);
        self.wait_until("controller reset", || {
            self.regs.read(Register::UsbCmd) & reset == 0
        })
    }

    /// Set USBCMD.RS: attach to the bus (device) or start the schedules (host)
    pub fn run(&self) {
        self.regs.set_bits(Register::UsbCmd, USBCMD::RS::SET.value);
        log::debug!("usb{}: running", self.controller);
    }

    pub fn stop(&self) {
        self.regs.clear_bits(Register::UsbCmd, USBCMD::RS::SET.value);
    }

    /// Speed negotiated on the port
    pub fn current_speed(&self) -> UsbSpeed {
        let portsc = self.regs.read(Register::PortSc1);
        UsbSpeed::from_pspd((portsc >> PORTSC1::PSPD.shift) & PORTSC1::PSPD.mask)
    }

    pub(crate) fn device_state(&self) -> Result<&DeviceState<R>> {
        match &self.mode {
            PeripheralMode::Device(state) => Ok(state),
            PeripheralMode::Host(_) => Err(UsbError::WrongMode),
        }
    }

    pub(crate) fn device_state_mut(&mut self) -> Result<&mut DeviceState<R>> {
        match &mut self.mode {
            PeripheralMode::Device(state) => Ok(state),
            PeripheralMode::Host(_) => Err(UsbError::WrongMode),
        }
    }

    pub(crate) fn host_state(&self) -> Result<&HostState> {
        match &self.mode {
            PeripheralMode::Host(state) => Ok(state),
            PeripheralMode::Device(_) => Err(UsbError::WrongMode),
        }
    }

    /// Spin until `done` holds or the configured poll budget runs out
    pub(crate) fn wait_until(&self, what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
        let timeout = Timeout::from_limit(self.config.poll_limit);
        loop {
            if done() {
                return Ok(());
            }
            if timeout.is_expired() {
                log::warn!("usb{}: timed out waiting for {}", self.controller, what);
                return Err(UsbError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Controller Registry
// ============================================================================

/// Peripheral type used on hardware
pub type Usb = UsbPeripheral<MmioRegisters>;

static PERIPHERALS: [Once<&'static Usb>; NUM_USB_CONTROLLERS] = [Once::new(), Once::new()];

/// Publish a peripheral so its interrupt entry point can find it
pub fn register(peripheral: &'static Usb) -> Result<()> {
    let slot = PERIPHERALS
        .get(peripheral.controller() as usize)
        .ok_or(UsbError::InvalidParameter)?;
    if slot.is_completed() {
        return Err(UsbError::AlreadyRegistered);
    }
    slot.call_once(|| peripheral);
    log::debug!("usb{}: registered", peripheral.controller());
    Ok(())
}

/// Registered peripheral for `controller`
pub fn peripheral(controller: u8) -> Option<&'static Usb> {
    PERIPHERALS.get(controller as usize)?.get().copied()
}

/// USB0 interrupt entry point
pub fn usb0_isr() {
    if let Some(usb) = peripheral(0) {
        usb.handle_interrupt();
    }
}

/// USB1 interrupt entry point
pub fn usb1_isr() {
    if let Some(usb) = peripheral(1) {
        usb.handle_interrupt();
    }
}
