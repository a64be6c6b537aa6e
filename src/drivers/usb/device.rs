//! Device-mode controller operations
//!
//! Endpoint setup, the dTD transfer engine and controller-level device
//! state (address, configuration, speed).
//!
//! Each endpoint keeps a software queue of the dTDs it has handed to the
//! controller. The first dTD of an idle endpoint is primed directly;
//! later ones are appended to the hardware list using the ATDTW tripwire
//! so a prime is only issued if the controller already ran dry.
//!
//! # References
//! - LPC43xx User Manual, section 23.10 "Device operational model"

use core::sync::atomic::{AtomicU8, Ordering, fence};

use heapless::{Deque, Vec};

use super::control::{self, RequestHandlers};
use super::descriptor_table::{self, DescriptorTable};
use super::ehci::{
    DeviceQueueHead, DeviceQueueHeadList, DeviceTransferDescriptor, MAX_TRANSFER_LENGTH,
    TERMINATE, TokenStatus, dma_address, dqh_caps, dtd_token, fill_buffer_pages,
};
use super::endpoint::{EndpointAddress, EndpointCallbacks, EndpointTable};
use super::peripheral::UsbPeripheral;
use super::pool::{DescriptorPool, Handle};
use super::regs::{
    DEVICEADDR, ENDPTCTRL, OTGSC, PORTSC1, Register, RegisterAccess, USBCMD, USBINTR, USBMODE,
    endpoint_bits,
};
use super::{
    DeviceTransferCallback, Result, SetupPacket, TransferType, UsbError, UsbSpeed, UserData,
};
use crate::arch::sync::IrqMutex;
use crate::config::{DEVICE_MAX_TRANSFERS, NUM_DEVICE_ENDPOINTS, USB_TOTAL_QUEUE_HEADS};

type DtdHandle = Handle<DeviceTransferDescriptor>;

/// Called after every SET_CONFIGURATION, including de-configuration
pub type ConfigurationChangedCallback<R> = fn(&UsbPeripheral<R>);

// ============================================================================
// Device State
// ============================================================================

/// Bookkeeping for a dTD handed to the controller
#[derive(Clone, Copy)]
struct QueuedTransfer {
    maximum_length: u32,
    completion: Option<DeviceTransferCallback>,
    user_data: UserData,
}

impl QueuedTransfer {
    const EMPTY: QueuedTransfer = QueuedTransfer {
        maximum_length: 0,
        completion: None,
        user_data: UserData::NONE,
    };
}

/// dTD pool plus the per-endpoint software queues
pub(crate) struct DeviceTransfers {
    pub(crate) pool: DescriptorPool<DeviceTransferDescriptor, DEVICE_MAX_TRANSFERS>,
    transfers: [QueuedTransfer; DEVICE_MAX_TRANSFERS],
    pub(crate) queues: [Deque<DtdHandle, DEVICE_MAX_TRANSFERS>; USB_TOTAL_QUEUE_HEADS],
}

impl DeviceTransfers {
    fn new() -> Self {
        Self {
            pool: DescriptorPool::new(),
            transfers: [QueuedTransfer::EMPTY; DEVICE_MAX_TRANSFERS],
            queues: core::array::from_fn(|_| Deque::new()),
        }
    }

    /// Drop every queued dTD of one endpoint without running callbacks
    fn discard(&mut self, index: usize) {
        while let Some(handle) = self.queues[index].pop_front() {
            self.pool.free(handle);
        }
    }
}

/// Small DMA-visible buffer for replies built on the fly (GET_STATUS,
/// GET_CONFIGURATION)
#[repr(C, align(4))]
pub(crate) struct ControlReply {
    bytes: [AtomicU8; 8],
}

impl ControlReply {
    fn new() -> Self {
        Self {
            bytes: core::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    /// Copy `data` in and return the buffer address
    pub(crate) fn load(&self, data: &[u8]) -> *mut u8 {
        for (slot, byte) in self.bytes.iter().zip(data) {
            slot.store(*byte, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
        self.bytes.as_ptr() as *mut u8
    }
}

/// State owned by a device-mode peripheral
pub struct DeviceState<R> {
    pub(crate) queue_heads: DeviceQueueHeadList,
    pub(crate) endpoints: IrqMutex<EndpointTable<R>>,
    pub(crate) transfers: IrqMutex<DeviceTransfers>,
    pub(crate) descriptors: DescriptorTable,
    pub(crate) handlers: RequestHandlers<R>,
    pub(crate) active_configuration: IrqMutex<Option<&'static [u8]>>,
    pub(crate) configuration_changed: Option<ConfigurationChangedCallback<R>>,
    pub(crate) reply: ControlReply,
}

impl<R: RegisterAccess> DeviceState<R> {
    pub(crate) fn new(descriptors: DescriptorTable) -> Self {
        Self {
            queue_heads: DeviceQueueHeadList::default(),
            endpoints: IrqMutex::new(EndpointTable::new()),
            transfers: IrqMutex::new(DeviceTransfers::new()),
            descriptors,
            handlers: RequestHandlers::default(),
            active_configuration: IrqMutex::new(None),
            configuration_changed: None,
            reply: ControlReply::new(),
        }
    }
}

impl<R> DeviceState<R> {
    /// Queue head serving `address`
    pub(crate) fn queue_head(&self, address: EndpointAddress) -> &DeviceQueueHead {
        &self.queue_heads.heads[address.queue_head_index()]
    }
}

// ============================================================================
// Controller Lifecycle
// ============================================================================

impl<R: RegisterAccess> UsbPeripheral<R> {
    /// Replace the control request handler table
    pub fn set_request_handlers(&mut self, handlers: RequestHandlers<R>) -> Result<()> {
        self.device_state_mut()?.handlers = handlers;
        Ok(())
    }

    /// Install the SET_CONFIGURATION notification
    pub fn set_configuration_changed_callback(
        &mut self,
        callback: ConfigurationChangedCallback<R>,
    ) -> Result<()> {
        self.device_state_mut()?.configuration_changed = Some(callback);
        Ok(())
    }

    /// Reset the controller and bring it up in device mode
    ///
    /// Leaves the controller stopped; call [`Self::run`] to attach.
    pub fn device_init(&self) -> Result<()> {
        let state = self.device_state()?;
        self.controller_reset()?;

        self.regs.write(Register::UsbMode, USBMODE::CM::Device.value);
        if self.controller() == 0 {
            self.regs.set_bits(Register::OtgSc, OTGSC::OT::SET.value);
        }
        self.regs.modify(
            Register::UsbCmd,
            USBCMD::ITC::SET.value,
            USBCMD::ITC.val(self.config.interrupt_threshold as u32).value,
        );
        self.regs.write(
            Register::EndpointListAddr,
            dma_address(&state.queue_heads),
        );
        self.regs.write(
            Register::UsbIntr,
            (USBINTR::UE::SET
                + USBINTR::UEE::SET
                + USBINTR::PCE::SET
                + USBINTR::URE::SET
                + USBINTR::SLE::SET
                + USBINTR::NAKE::SET)
                .value,
        );
        if self.config.force_full_speed {
            self.prevent_high_speed();
        }

        log::info!("usb{}: device mode initialized", self.controller());
        Ok(())
    }

    /// Register EP0 with the control request machinery and configure it
    pub fn init_control_endpoints(&self) -> Result<()> {
        self.register_endpoint(
            EndpointAddress::CONTROL_OUT,
            EndpointCallbacks {
                setup_complete: Some(control::setup_complete::<R>),
                transfer_complete: Some(control::control_out_complete::<R>),
            },
        )?;
        self.register_endpoint(
            EndpointAddress::CONTROL_IN,
            EndpointCallbacks {
                setup_complete: None,
                transfer_complete: Some(control::control_in_complete::<R>),
            },
        )?;
        self.endpoint_init(EndpointAddress::CONTROL_OUT)?;
        self.endpoint_init(EndpointAddress::CONTROL_IN)
    }

    /// Disable, flush and clear every endpoint
    pub(crate) fn reset_all_endpoints(&self) -> Result<()> {
        let state = self.device_state()?;
        // EP0 cannot be disabled.
        for n in 1..NUM_DEVICE_ENDPOINTS {
            self.regs.clear_bits(
                Register::EndptCtrl(n as u8),
                (ENDPTCTRL::RXE::SET + ENDPTCTRL::TXE::SET).value,
            );
        }
        self.clear_pending_interrupts(endpoint_bits::ALL);
        self.clear_setup_status(endpoint_bits::ALL_SETUP)?;
        {
            let mut transfers = state.transfers.lock();
            for index in 0..USB_TOTAL_QUEUE_HEADS {
                transfers.discard(index);
            }
        }
        self.flush_endpoints(endpoint_bits::ALL)
    }

    /// Handle a USB bus reset from the host
    pub fn bus_reset(&self) -> Result<()> {
        self.reset_all_endpoints()?;
        self.set_address_immediate(0)?;
        self.set_configuration(0)
    }

    /// Hold the port at full speed
    pub fn prevent_high_speed(&self) {
        self.regs.set_bits(Register::PortSc1, PORTSC1::PFSC::SET.value);
    }

    /// Allow high-speed chirp negotiation
    pub fn allow_high_speed(&self) {
        self.regs.clear_bits(Register::PortSc1, PORTSC1::PFSC::SET.value);
    }

    // ========================================================================
    // Address and Configuration
    // ========================================================================

    /// Change the device address right away
    pub fn set_address_immediate(&self, address: u8) -> Result<()> {
        self.device_state()?;
        self.regs
            .write(Register::DeviceAddr, DEVICEADDR::USBADR.val(address as u32).value);
        Ok(())
    }

    /// Latch an address the controller applies after the next IN status stage
    pub fn set_address_deferred(&self, address: u8) -> Result<()> {
        self.device_state()?;
        self.regs.write(
            Register::DeviceAddr,
            (DEVICEADDR::USBADR.val(address as u32) + DEVICEADDR::USBADRA::SET).value,
        );
        Ok(())
    }

    /// Address programmed in DEVICEADDR
    pub fn device_address(&self) -> u8 {
        let raw = self.regs.read(Register::DeviceAddr);
        ((raw >> DEVICEADDR::USBADR.shift) & DEVICEADDR::USBADR.mask) as u8
    }

    /// Make configuration `value` active; 0 de-configures the device
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        let state = self.device_state()?;
        let configuration = if value == 0 {
            None
        } else {
            let found = state
                .descriptors
                .find_configuration(value, self.current_speed());
            Some(found.ok_or(UsbError::ConfigurationNotFound)?)
        };
        *state.active_configuration.lock() = configuration;
        log::debug!("usb{}: configuration {}", self.controller(), value);

        if let Some(callback) = state.configuration_changed {
            callback(self);
        }
        Ok(())
    }

    /// Descriptor of the active configuration
    pub fn active_configuration(&self) -> Option<&'static [u8]> {
        let state = self.device_state().ok()?;
        *state.active_configuration.lock()
    }

    /// bConfigurationValue of the active configuration, 0 if unconfigured
    pub fn configuration_value(&self) -> u8 {
        self.active_configuration()
            .map(descriptor_table::configuration_value)
            .unwrap_or(0)
    }

    /// Descriptor table served by this device
    pub fn descriptors(&self) -> Result<&DescriptorTable> {
        Ok(&self.device_state()?.descriptors)
    }

    // ========================================================================
    // Endpoint Setup
    // ========================================================================

    /// Attach callbacks to an endpoint
    pub fn register_endpoint(
        &self,
        address: EndpointAddress,
        callbacks: EndpointCallbacks<R>,
    ) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        state.endpoints.lock().insert(address, callbacks);
        Ok(())
    }

    /// Last SETUP packet seen on this endpoint pair
    pub fn setup_packet(&self, address: EndpointAddress) -> Result<SetupPacket> {
        let state = self.device_state()?;
        state
            .endpoints
            .lock()
            .get(address)
            .map(|e| e.setup)
            .ok_or(UsbError::InvalidEndpoint)
    }

    /// Program an endpoint's queue head and enable it
    pub fn configure_endpoint(
        &self,
        address: EndpointAddress,
        max_packet_size: u16,
        transfer_type: TransferType,
    ) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        self.endpoint_flush(address)?;

        let mut capabilities =
            (max_packet_size as u32 & dqh_caps::MPL_MASK) << dqh_caps::MPL_SHIFT;
        capabilities |= match transfer_type {
            TransferType::Control => dqh_caps::IOS,
            _ => dqh_caps::ZLT,
        };

        let qh = state.queue_head(address);
        qh.capabilities.store(capabilities, Ordering::Relaxed);
        qh.current.store(0, Ordering::Relaxed);
        qh.next.store(TERMINATE, Ordering::Relaxed);
        qh.token.store(0, Ordering::Relaxed);
        for page in &qh.buffer_pages {
            page.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);

        self.endpoint_set_type(address, transfer_type);
        self.endpoint_enable(address);
        log::trace!(
            "usb{}: {} configured, {:?}, max packet {}",
            self.controller(),
            address,
            transfer_type,
            max_packet_size
        );
        Ok(())
    }

    /// Configure an endpoint from the active configuration's descriptor
    ///
    /// Endpoints without a descriptor (EP0) get the device descriptor's EP0
    /// packet size and control semantics.
    pub fn endpoint_init(&self, address: EndpointAddress) -> Result<()> {
        let state = self.device_state()?;
        let mut max_packet_size = state.descriptors.ep0_max_packet_size();
        let mut transfer_type = TransferType::Control;
        if let Some(endpoint) = self.endpoint_descriptor(address) {
            max_packet_size = endpoint.max_packet_size.get() & 0x7FF;
            transfer_type = TransferType::from_attributes(endpoint.attributes);
        }
        self.configure_endpoint(address, max_packet_size, transfer_type)
    }

    /// Endpoint descriptor for `address` in the active configuration
    pub fn endpoint_descriptor(
        &self,
        address: EndpointAddress,
    ) -> Option<descriptor_table::EndpointDescriptor> {
        let configuration = self.active_configuration()?;
        descriptor_table::find_endpoint_descriptor(configuration, address.raw())
    }

    fn endpoint_set_type(&self, address: EndpointAddress, transfer_type: TransferType) {
        let ty = transfer_type as u32;
        self.regs.modify(
            Register::EndptCtrl(address.number()),
            (ENDPTCTRL::TXT::SET + ENDPTCTRL::RXT::SET).value,
            (ENDPTCTRL::TXT.val(ty) + ENDPTCTRL::RXT.val(ty)).value,
        );
    }

    fn endpoint_enable(&self, address: EndpointAddress) {
        let bits = if address.is_in() {
            ENDPTCTRL::TXE::SET + ENDPTCTRL::TXR::SET
        } else {
            ENDPTCTRL::RXE::SET + ENDPTCTRL::RXR::SET
        };
        self.regs
            .set_bits(Register::EndptCtrl(address.number()), bits.value);
    }

    /// Disable one direction of an endpoint and drop its queued transfers
    pub fn endpoint_disable(&self, address: EndpointAddress) -> Result<()> {
        self.device_state()?;
        let address = address.validate()?;
        let enable = if address.is_in() {
            ENDPTCTRL::TXE::SET
        } else {
            ENDPTCTRL::RXE::SET
        };
        self.regs
            .clear_bits(Register::EndptCtrl(address.number()), enable.value);
        self.endpoint_flush(address)?;
        self.clear_pending_interrupts(address.bit());
        Ok(())
    }

    /// Stall both directions of an endpoint number
    pub fn endpoint_stall(&self, address: EndpointAddress) -> Result<()> {
        self.device_state()?;
        let address = address.validate()?;
        self.regs.set_bits(
            Register::EndptCtrl(address.number()),
            (ENDPTCTRL::RXS::SET + ENDPTCTRL::TXS::SET).value,
        );
        if address.number() == 0 {
            self.endpoint_flush(address.in_half())?;
            self.endpoint_flush(address.out_half())?;
        }
        log::debug!("usb{}: stalled {}", self.controller(), address);
        Ok(())
    }

    /// Whether either direction of the endpoint number is stalled
    pub fn endpoint_is_stalled(&self, address: EndpointAddress) -> bool {
        let ctrl = self.regs.read(Register::EndptCtrl(address.number()));
        let bit = if address.is_in() {
            ENDPTCTRL::TXS::SET.value
        } else {
            ENDPTCTRL::RXS::SET.value
        };
        ctrl & bit != 0
    }

    /// Endpoint primed with a dTD the controller has not finished
    pub fn endpoint_is_ready(&self, address: EndpointAddress) -> bool {
        self.regs.read(Register::EndptStat) & address.bit() != 0
    }

    /// ENDPTCOMPLETE bit for the endpoint
    pub fn endpoint_is_complete(&self, address: EndpointAddress) -> bool {
        self.regs.read(Register::EndptComplete) & address.bit() != 0
    }

    /// Report NAKs sent on an endpoint through the NAK interrupt
    pub fn enable_nak_interrupt(&self, address: EndpointAddress) {
        self.regs.set_bits(Register::EndptNakEn, address.bit());
    }

    pub fn disable_nak_interrupt(&self, address: EndpointAddress) {
        self.regs.clear_bits(Register::EndptNakEn, address.bit());
    }

    // ========================================================================
    // Status Registers
    // ========================================================================

    /// Clear NAK and completion state for the endpoints in `mask`
    pub fn clear_pending_interrupts(&self, mask: u32) {
        self.regs.write(Register::EndptNak, mask);
        self.regs.write(Register::EndptComplete, mask);
    }

    /// Acknowledge latched SETUP packets and wait for the bits to drop
    pub fn clear_setup_status(&self, mask: u32) -> Result<()> {
        self.regs.write(Register::EndptSetupStat, mask);
        self.wait_until("setup status clear", || {
            self.regs.read(Register::EndptSetupStat) & mask == 0
        })
    }

    /// Endpoints with a latched SETUP packet
    pub fn endpoint_setup_status(&self) -> u32 {
        self.regs.read(Register::EndptSetupStat)
    }

    /// Read and acknowledge ENDPTCOMPLETE
    pub fn take_endpoint_complete(&self) -> u32 {
        let complete = self.regs.read(Register::EndptComplete);
        self.regs.write(Register::EndptComplete, complete);
        complete
    }

    /// Cancel whatever the controller holds for the endpoints in `mask`
    pub fn flush_endpoints(&self, mask: u32) -> Result<()> {
        self.wait_until("prime before flush", || {
            self.regs.read(Register::EndptPrime) & mask == 0
        })?;
        // A dTD can be primed while the flush runs; repeat until STAT is clear.
        let timeout = crate::time::Timeout::from_limit(self.config.poll_limit);
        loop {
            self.regs.write(Register::EndptFlush, mask);
            self.wait_until("endpoint flush", || {
                self.regs.read(Register::EndptFlush) & mask == 0
            })?;
            if self.regs.read(Register::EndptStat) & mask == 0 {
                return Ok(());
            }
            if timeout.is_expired() {
                return Err(UsbError::Timeout);
            }
        }
    }

    /// Drop queued transfers and flush the hardware for one endpoint
    pub fn endpoint_flush(&self, address: EndpointAddress) -> Result<()> {
        let address = address.validate()?;
        self.queue_flush(address)?;
        self.flush_endpoints(address.bit())
    }

    /// Drop queued transfers without completing them
    pub fn queue_flush(&self, address: EndpointAddress) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        state
            .transfers
            .lock()
            .discard(address.queue_head_index());
        Ok(())
    }

    // ========================================================================
    // dTD Engine
    // ========================================================================

    fn prime(&self, state: &DeviceState<R>, address: EndpointAddress, td_address: u32) {
        let qh = state.queue_head(address);
        qh.next.store(td_address, Ordering::Relaxed);
        qh.token.fetch_and(
            !(TokenStatus::ACTIVE | TokenStatus::HALTED).bits(),
            Ordering::Relaxed,
        );
        fence(Ordering::SeqCst);
        self.regs.write(Register::EndptPrime, address.bit());
    }

    /// Point the endpoint's queue head at `td` and prime it immediately
    ///
    /// # Safety
    ///
    /// `td` must stay valid, and describe valid buffers, until the
    /// controller retires it.
    pub unsafe fn endpoint_schedule(
        &self,
        address: EndpointAddress,
        td: *const DeviceTransferDescriptor,
    ) -> Result<()> {
        let state = self.device_state()?;
        self.prime(state, address.validate()?, dma_address(td));
        Ok(())
    }

    /// Like [`Self::endpoint_schedule`], but first waits for the endpoint
    /// to finish what it is doing
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::endpoint_schedule`].
    pub unsafe fn endpoint_schedule_wait(
        &self,
        address: EndpointAddress,
        td: *const DeviceTransferDescriptor,
    ) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        self.schedule_wait(state, address, unsafe { &*td }, dma_address(td))
    }

    fn schedule_wait(
        &self,
        state: &DeviceState<R>,
        address: EndpointAddress,
        td: &DeviceTransferDescriptor,
        td_address: u32,
    ) -> Result<()> {
        self.wait_until("endpoint idle", || !self.endpoint_is_ready(address))?;
        td.next.store(TERMINATE, Ordering::Relaxed);
        self.prime(state, address, td_address);
        Ok(())
    }

    /// Link `td_address` behind `tail`, priming only if the controller
    /// already drained the list
    fn schedule_append(
        &self,
        state: &DeviceState<R>,
        address: EndpointAddress,
        tail: &DeviceTransferDescriptor,
        td_address: u32,
    ) -> Result<()> {
        tail.next.store(td_address, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        if self.regs.read(Register::EndptPrime) & address.bit() != 0 {
            return Ok(());
        }

        let atdtw = USBCMD::ATDTW::SET.value;
        let mut ready = false;
        self.wait_until("add dTD tripwire", || {
            self.regs.set_bits(Register::UsbCmd, atdtw);
            ready = self.endpoint_is_ready(address);
            self.regs.read(Register::UsbCmd) & atdtw != 0
        })?;
        self.regs.clear_bits(Register::UsbCmd, atdtw);

        if !ready {
            self.prime(state, address, td_address);
        }
        Ok(())
    }

    // ========================================================================
    // Transfer Queue
    // ========================================================================

    /// Queue a transfer on an endpoint
    ///
    /// `completion` runs from interrupt context with `user_data` and the
    /// byte count once the dTD retires and the endpoint's transfer
    /// complete handler calls [`Self::transfer_complete`].
    ///
    /// # Safety
    ///
    /// `data` must be valid for `maximum_length` bytes (writable for OUT
    /// endpoints) until the transfer completes or the endpoint is flushed.
    pub unsafe fn transfer_schedule(
        &self,
        address: EndpointAddress,
        data: *mut u8,
        maximum_length: u32,
        completion: Option<DeviceTransferCallback>,
        user_data: *mut (),
    ) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        if maximum_length > MAX_TRANSFER_LENGTH {
            return Err(UsbError::InvalidParameter);
        }
        let index = address.queue_head_index();

        // Only thread context primes, so an endpoint seen idle here stays
        // idle until the prime below.
        if state.transfers.lock().queues[index].is_empty() {
            self.wait_until("endpoint idle", || !self.endpoint_is_ready(address))?;
        }

        let mut guard = state.transfers.lock();
        let transfers = &mut *guard;
        let handle = transfers
            .pool
            .allocate()
            .ok_or(UsbError::ResourceExhausted)?;

        let td = transfers.pool.get(handle);
        td.next.store(TERMINATE, Ordering::Relaxed);
        td.token.store(
            ((maximum_length & dtd_token::BYTES_MASK) << dtd_token::BYTES_SHIFT)
                | dtd_token::IOC
                | TokenStatus::ACTIVE.bits(),
            Ordering::Relaxed,
        );
        fill_buffer_pages(&td.buffer_pages, dma_address(data));
        let td_address = transfers.pool.address_of(handle);
        transfers.transfers[handle.index()] = QueuedTransfer {
            maximum_length,
            completion,
            user_data: UserData(user_data),
        };
        fence(Ordering::SeqCst);

        let linked = match transfers.queues[index].back().copied() {
            None => self.schedule_wait(state, address, transfers.pool.get(handle), td_address),
            Some(tail) => {
                self.schedule_append(state, address, transfers.pool.get(tail), td_address)
            }
        };
        if let Err(err) = linked {
            transfers.pool.free(handle);
            return Err(err);
        }
        // Queue capacity equals pool capacity.
        let _ = transfers.queues[index].push_back(handle);
        log::trace!(
            "usb{}: {} queued {} bytes",
            self.controller(),
            address,
            maximum_length
        );
        Ok(())
    }

    /// [`Self::transfer_schedule`], waiting for a free dTD first
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::transfer_schedule`].
    pub unsafe fn transfer_schedule_block(
        &self,
        address: EndpointAddress,
        data: *mut u8,
        maximum_length: u32,
        completion: Option<DeviceTransferCallback>,
        user_data: *mut (),
    ) -> Result<()> {
        let state = self.device_state()?;
        self.wait_until("free dTD", || state.transfers.lock().pool.free_count() > 0)?;
        unsafe { self.transfer_schedule(address, data, maximum_length, completion, user_data) }
    }

    /// Send a zero-length packet (control status stage)
    pub fn transfer_schedule_ack(&self, address: EndpointAddress) -> Result<()> {
        unsafe {
            self.transfer_schedule_block(
                address,
                core::ptr::null_mut(),
                0,
                None,
                core::ptr::null_mut(),
            )
        }
    }

    /// Queue static data on an IN endpoint
    pub fn send_static(
        &self,
        address: EndpointAddress,
        data: &'static [u8],
        completion: Option<DeviceTransferCallback>,
        user_data: *mut (),
    ) -> Result<()> {
        if !address.is_in() {
            return Err(UsbError::InvalidParameter);
        }
        // The controller only reads IN buffers.
        unsafe {
            self.transfer_schedule_block(
                address,
                data.as_ptr() as *mut u8,
                data.len() as u32,
                completion,
                user_data,
            )
        }
    }

    /// Retire finished dTDs of an endpoint in order and run their callbacks
    pub fn transfer_complete(&self, address: EndpointAddress) -> Result<()> {
        let state = self.device_state()?;
        let address = address.validate()?;
        let index = address.queue_head_index();
        let mut finished: Vec<(QueuedTransfer, u32), DEVICE_MAX_TRANSFERS> = Vec::new();
        {
            let mut guard = state.transfers.lock();
            let transfers = &mut *guard;
            while let Some(&handle) = transfers.queues[index].front() {
                let td = transfers.pool.get(handle);
                let status = td.status();
                if status.contains(TokenStatus::ACTIVE) {
                    break;
                }
                if status.intersects(
                    TokenStatus::HALTED | TokenStatus::BUFFER_ERROR | TokenStatus::TRANSACTION_ERROR,
                ) {
                    log::warn!(
                        "usb{}: {} transfer error {:?}",
                        self.controller(),
                        address,
                        status
                    );
                }
                let remaining = td.remaining_bytes();
                let transfer = transfers.transfers[handle.index()];
                transfers.queues[index].pop_front();
                transfers.pool.free(handle);
                let _ = finished.push((
                    transfer,
                    transfer.maximum_length.saturating_sub(remaining),
                ));
            }
        }

        for (transfer, bytes) in finished {
            if let Some(completion) = transfer.completion {
                completion(transfer.user_data.0, bytes);
            }
        }
        Ok(())
    }

    /// Transfers still owned by the controller on an endpoint
    pub fn pending_transfers(&self, address: EndpointAddress) -> usize {
        let Ok(address) = address.validate() else {
            return 0;
        };
        self.device_state()
            .map(|state| state.transfers.lock().queues[address.queue_head_index()].len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::testing::{self, complete_device_transfer, queued_device_transfers};
    use core::sync::atomic::AtomicU32;

    fn record(user_data: *mut (), bytes: u32) {
        let slot = unsafe { &*(user_data as *const AtomicU32) };
        slot.store(bytes, Ordering::SeqCst);
    }

    #[test]
    fn init_programs_device_mode() {
        let usb = testing::device();
        let regs = usb.registers();
        assert_eq!(regs.read(Register::UsbMode) & 0x3, 2);
        assert_ne!(regs.read(Register::OtgSc) & OTGSC::OT::SET.value, 0);
        let state = usb.device_state().unwrap();
        assert_eq!(
            regs.read(Register::EndpointListAddr),
            dma_address(&state.queue_heads)
        );
        assert_eq!(regs.read(Register::EndpointListAddr) & 0x7FF, 0);
        let intr = regs.read(Register::UsbIntr);
        assert_eq!(intr, 0x0001_0147);
    }

    #[test]
    fn configure_endpoint_writes_queue_head_and_control() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x81);
        usb.configure_endpoint(ep, 512, TransferType::Bulk).unwrap();

        let qh = usb.device_state().unwrap().queue_head(ep);
        assert_eq!(qh.max_packet_size(), 512);
        let caps = qh.capabilities.load(Ordering::Relaxed);
        assert_ne!(caps & dqh_caps::ZLT, 0);
        assert_eq!(caps & dqh_caps::IOS, 0);
        assert_eq!(qh.next.load(Ordering::Relaxed), TERMINATE);

        let ctrl = usb.registers().read(Register::EndptCtrl(1));
        assert_eq!((ctrl >> 18) & 0x3, TransferType::Bulk as u32);
        assert_eq!((ctrl >> 2) & 0x3, TransferType::Bulk as u32);
        assert_ne!(ctrl & ENDPTCTRL::TXE::SET.value, 0);
        assert_eq!(ctrl & ENDPTCTRL::RXE::SET.value, 0);
    }

    #[test]
    fn control_endpoint_gets_interrupt_on_setup() {
        let usb = testing::device();
        let qh = usb
            .device_state()
            .unwrap()
            .queue_head(EndpointAddress::CONTROL_OUT);
        assert_eq!(qh.max_packet_size(), 64);
        assert_ne!(qh.capabilities.load(Ordering::Relaxed) & dqh_caps::IOS, 0);
    }

    #[test]
    fn flush_of_idle_endpoint_changes_nothing() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x02);
        usb.configure_endpoint(ep, 64, TransferType::Bulk).unwrap();
        let stat = usb.registers().read(Register::EndptStat);
        usb.endpoint_flush(ep).unwrap();
        usb.endpoint_flush(ep).unwrap();
        assert_eq!(usb.registers().read(Register::EndptStat), stat);
        assert_eq!(usb.pending_transfers(ep), 0);
    }

    #[test]
    fn schedule_primes_idle_endpoint() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x81);
        usb.configure_endpoint(ep, 512, TransferType::Bulk).unwrap();
        let mut buffer = [0u8; 64];
        unsafe {
            usb.transfer_schedule(ep, buffer.as_mut_ptr(), 64, None, core::ptr::null_mut())
                .unwrap();
        }
        assert!(usb.endpoint_is_ready(ep));
        let queued = queued_device_transfers(&usb, ep);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].page0, dma_address(buffer.as_ptr()));
        assert_eq!(queued[0].total_bytes, 64);

        let qh = usb.device_state().unwrap().queue_head(ep);
        assert_eq!(qh.next.load(Ordering::Relaxed), queued[0].address);
    }

    #[test]
    fn second_transfer_appends_behind_tail() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x81);
        usb.configure_endpoint(ep, 512, TransferType::Bulk).unwrap();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        unsafe {
            usb.transfer_schedule(ep, a.as_mut_ptr(), 16, None, core::ptr::null_mut())
                .unwrap();
            usb.transfer_schedule(ep, b.as_mut_ptr(), 8, None, core::ptr::null_mut())
                .unwrap();
        }
        let queued = queued_device_transfers(&usb, ep);
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].next, queued[1].address);
        assert_eq!(queued[1].next, TERMINATE);
        // The controller was still busy, so the head stays on the first dTD.
        let qh = usb.device_state().unwrap().queue_head(ep);
        assert_eq!(qh.next.load(Ordering::Relaxed), queued[0].address);
        assert_eq!(usb.registers().read(Register::UsbCmd) & USBCMD::ATDTW::SET.value, 0);
    }

    #[test]
    fn completion_reports_bytes_in_order() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x02);
        usb.configure_endpoint(ep, 64, TransferType::Bulk).unwrap();
        let mut buffer = [0u8; 64];
        let first = AtomicU32::new(u32::MAX);
        let second = AtomicU32::new(u32::MAX);
        unsafe {
            usb.transfer_schedule(
                ep,
                buffer.as_mut_ptr(),
                64,
                Some(record),
                &first as *const AtomicU32 as *mut (),
            )
            .unwrap();
            usb.transfer_schedule(
                ep,
                buffer.as_mut_ptr(),
                32,
                Some(record),
                &second as *const AtomicU32 as *mut (),
            )
            .unwrap();
        }

        assert!(complete_device_transfer(&usb, ep, 24));
        usb.transfer_complete(ep).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 40);
        assert_eq!(second.load(Ordering::SeqCst), u32::MAX);
        assert_eq!(usb.pending_transfers(ep), 1);

        assert!(complete_device_transfer(&usb, ep, 0));
        usb.transfer_complete(ep).unwrap();
        assert_eq!(second.load(Ordering::SeqCst), 32);
        assert_eq!(usb.pending_transfers(ep), 0);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x81);
        usb.configure_endpoint(ep, 512, TransferType::Bulk).unwrap();
        let mut buffer = [0u8; 8];
        for _ in 0..DEVICE_MAX_TRANSFERS {
            unsafe {
                usb.transfer_schedule(ep, buffer.as_mut_ptr(), 8, None, core::ptr::null_mut())
                    .unwrap();
            }
        }
        let result = unsafe {
            usb.transfer_schedule(ep, buffer.as_mut_ptr(), 8, None, core::ptr::null_mut())
        };
        assert_eq!(result, Err(UsbError::ResourceExhausted));
    }

    #[test]
    fn stall_on_ep0_flushes_both_directions() {
        let usb = testing::device();
        usb.transfer_schedule_ack(EndpointAddress::CONTROL_IN).unwrap();
        assert!(usb.endpoint_is_ready(EndpointAddress::CONTROL_IN));

        usb.endpoint_stall(EndpointAddress::CONTROL_OUT).unwrap();
        let ctrl = usb.registers().read(Register::EndptCtrl(0));
        assert_ne!(ctrl & ENDPTCTRL::RXS::SET.value, 0);
        assert_ne!(ctrl & ENDPTCTRL::TXS::SET.value, 0);
        assert!(!usb.endpoint_is_ready(EndpointAddress::CONTROL_IN));
        assert_eq!(usb.pending_transfers(EndpointAddress::CONTROL_IN), 0);
        assert!(usb.endpoint_is_stalled(EndpointAddress::CONTROL_IN));
    }

    #[test]
    fn stuck_flush_times_out() {
        let usb = testing::device();
        usb.registers().set_stuck_flush(true);
        assert_eq!(
            usb.endpoint_flush(EndpointAddress::CONTROL_IN),
            Err(UsbError::Timeout)
        );
    }

    #[test]
    fn unimplemented_endpoints_are_rejected() {
        let usb = testing::device();
        let missing = EndpointAddress::from_raw(0x87);
        assert_eq!(usb.endpoint_flush(missing), Err(UsbError::InvalidEndpoint));
        assert_eq!(usb.queue_flush(missing), Err(UsbError::InvalidEndpoint));
        assert_eq!(
            usb.transfer_complete(EndpointAddress::from_raw(0x0F)),
            Err(UsbError::InvalidEndpoint)
        );
        assert_eq!(usb.pending_transfers(missing), 0);
    }

    #[test]
    fn busy_endpoint_times_out_scheduling() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x81);
        usb.configure_endpoint(ep, 512, TransferType::Bulk).unwrap();
        // Controller reports the endpoint primed with nothing queued.
        usb.registers().force(Register::EndptStat, ep.bit());
        let mut buffer = [0u8; 8];
        let result = unsafe {
            usb.transfer_schedule(ep, buffer.as_mut_ptr(), 8, None, core::ptr::null_mut())
        };
        assert_eq!(result, Err(UsbError::Timeout));
        assert_eq!(usb.pending_transfers(ep), 0);
        let state = usb.device_state().unwrap();
        assert_eq!(
            state.transfers.lock().pool.free_count(),
            DEVICE_MAX_TRANSFERS
        );
    }

    #[test]
    fn set_configuration_tracks_active_descriptor() {
        let usb = testing::device();
        usb.set_configuration(1).unwrap();
        assert_eq!(usb.configuration_value(), 1);
        assert_eq!(
            usb.set_configuration(9),
            Err(UsbError::ConfigurationNotFound)
        );
        assert_eq!(usb.configuration_value(), 1);
        usb.set_configuration(0).unwrap();
        assert!(usb.active_configuration().is_none());
    }

    #[test]
    fn endpoint_init_uses_active_configuration() {
        let usb = testing::device();
        testing::set_speed(&usb, UsbSpeed::High);
        usb.set_configuration(1).unwrap();
        let ep = EndpointAddress::from_raw(0x81);
        usb.endpoint_init(ep).unwrap();
        let qh = usb.device_state().unwrap().queue_head(ep);
        assert_eq!(qh.max_packet_size(), 512);
        assert_ne!(qh.capabilities.load(Ordering::Relaxed) & dqh_caps::ZLT, 0);
    }

    #[test]
    fn deferred_address_sets_latch_bit() {
        let usb = testing::device();
        usb.set_address_deferred(5).unwrap();
        let raw = usb.registers().read(Register::DeviceAddr);
        assert_ne!(raw & DEVICEADDR::USBADRA::SET.value, 0);
        assert_eq!(usb.device_address(), 5);
        usb.set_address_immediate(0).unwrap();
        assert_eq!(usb.registers().read(Register::DeviceAddr), 0);
    }

    #[test]
    fn high_speed_toggle() {
        let usb = testing::device();
        usb.prevent_high_speed();
        assert_ne!(usb.registers().read(Register::PortSc1) & PORTSC1::PFSC::SET.value, 0);
        usb.allow_high_speed();
        assert_eq!(usb.registers().read(Register::PortSc1) & PORTSC1::PFSC::SET.value, 0);
    }

    #[test]
    fn disable_clears_enable_and_queue() {
        let usb = testing::device();
        let ep = EndpointAddress::from_raw(0x02);
        usb.configure_endpoint(ep, 64, TransferType::Bulk).unwrap();
        let mut buffer = [0u8; 64];
        unsafe {
            usb.transfer_schedule(ep, buffer.as_mut_ptr(), 64, None, core::ptr::null_mut())
                .unwrap();
        }
        usb.endpoint_disable(ep).unwrap();
        assert_eq!(
            usb.registers().read(Register::EndptCtrl(2)) & ENDPTCTRL::RXE::SET.value,
            0
        );
        assert_eq!(usb.pending_transfers(ep), 0);
        assert!(!usb.endpoint_is_ready(ep));
    }

    #[test]
    fn wrong_mode_is_rejected() {
        let usb = testing::host();
        assert_eq!(usb.set_configuration(0), Err(UsbError::WrongMode));
        assert_eq!(
            usb.transfer_schedule_ack(EndpointAddress::CONTROL_IN),
            Err(UsbError::WrongMode)
        );
    }
}
