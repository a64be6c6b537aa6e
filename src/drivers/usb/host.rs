//! Host-mode asynchronous schedule
//!
//! The asynchronous schedule is a circular list of queue heads anchored at
//! a static head QH (H-bit set) that lives in the peripheral. Endpoint QHs
//! and qTDs come from fixed pools. Every scheduled qTD is also recorded in
//! a pending list that the interrupt handler walks to retire finished
//! transfers and run their callbacks.
//!
//! Splicing QHs in or out of the ring is only done with the schedule
//! stopped. Appending a qTD to a live QH chain happens under the schedule
//! lock, which masks interrupts.
//!
//! # References
//! - EHCI Specification 1.0, section 4.8 "Asynchronous Schedule"
//! - LPC43xx User Manual, section 23.9 "Host operational model"

use core::sync::atomic::{AtomicU32, Ordering, fence};

use heapless::{Deque, Vec};

use super::ehci::{
    MAX_TRANSFER_LENGTH, QueueHead, TERMINATE, TokenStatus, TransferDescriptor, TransferOverlay,
    dma_address, fill_buffer_pages, qh_ep_chars, qh_link, qtd_token,
};
use super::peripheral::UsbPeripheral;
use super::pool::{DescriptorPool, Handle};
use super::regs::{PORTSC1, Register, RegisterAccess, USBCMD, USBINTR, USBMODE, USBSTS};
use super::{HostTransferCallback, Pid, Result, UsbError, UsbSpeed, UserData};
use crate::arch::sync::IrqMutex;
use crate::config::{HOST_MAX_QUEUE_HEADS, HOST_MAX_TRANSFERS, USB_PERIODIC_LIST_SIZE};

/// Queue head allocated from a host peripheral's pool
pub type QueueHeadHandle = Handle<QueueHead>;
/// qTD allocated from a host peripheral's pool
pub type TransferHandle = Handle<TransferDescriptor>;

/// Error counter loaded into every qTD
const ERROR_RETRIES: u32 = 3;

/// Periodic frame list (4 KiB aligned)
#[repr(C, align(4096))]
pub struct PeriodicFrameList {
    pub entries: [AtomicU32; USB_PERIODIC_LIST_SIZE],
}

/// A qTD handed to the controller and not yet retired
#[derive(Clone, Copy)]
struct PendingTransfer {
    td: TransferHandle,
    maximum_length: u32,
    completion: Option<HostTransferCallback>,
    user_data: UserData,
}

/// Pools and the pending list, shared with the interrupt handler
pub(crate) struct HostSchedule {
    pub(crate) queue_heads: DescriptorPool<QueueHead, HOST_MAX_QUEUE_HEADS>,
    pub(crate) transfers: DescriptorPool<TransferDescriptor, HOST_MAX_TRANSFERS>,
    pending: Deque<PendingTransfer, HOST_MAX_TRANSFERS>,
}

impl HostSchedule {
    fn new() -> Self {
        Self {
            queue_heads: DescriptorPool::new(),
            transfers: DescriptorPool::new(),
            pending: Deque::new(),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// State owned by a host-mode peripheral
pub struct HostState {
    pub(crate) async_head: QueueHead,
    pub(crate) periodic_list: PeriodicFrameList,
    pub(crate) schedule: IrqMutex<HostSchedule>,
}

impl HostState {
    pub(crate) fn new() -> Self {
        Self {
            async_head: QueueHead::default(),
            periodic_list: PeriodicFrameList {
                entries: core::array::from_fn(|_| AtomicU32::new(TERMINATE)),
            },
            schedule: IrqMutex::new(HostSchedule::new()),
        }
    }

    /// Resolve a horizontal link to the QH it names
    fn resolve<'a>(&'a self, schedule: &'a HostSchedule, address: u32) -> Result<&'a QueueHead> {
        if address == dma_address(&self.async_head) {
            return Ok(&self.async_head);
        }
        schedule
            .queue_heads
            .handle_at(address)
            .map(|handle| schedule.queue_heads.get(handle))
            .ok_or(UsbError::CorruptSchedule)
    }

    /// QH in the asynchronous ring whose horizontal link points at `target`
    fn find_predecessor<'a>(
        &'a self,
        schedule: &'a HostSchedule,
        target: u32,
    ) -> Result<Option<&'a QueueHead>> {
        let head = dma_address(&self.async_head);
        let mut qh = &self.async_head;
        // The ring can hold every pooled QH plus the head.
        for _ in 0..=HOST_MAX_QUEUE_HEADS {
            if qh.horizontal.load(Ordering::Acquire) & qh_link::TERMINATE != 0 {
                return Ok(None);
            }
            let next = qh.next_address();
            if next == target {
                return Ok(Some(qh));
            }
            if next == head {
                return Ok(None);
            }
            qh = self.resolve(schedule, next)?;
        }
        Err(UsbError::CorruptSchedule)
    }
}

/// Build a qTD token
fn transfer_token(pid: Pid, data_toggle: bool, length: u32) -> u32 {
    let mut token = TokenStatus::ACTIVE.bits()
        | (pid as u32) << qtd_token::PID_SHIFT
        | ERROR_RETRIES << qtd_token::CERR_SHIFT
        | qtd_token::IOC
        | (length & qtd_token::BYTES_MASK) << qtd_token::BYTES_SHIFT;
    if data_toggle {
        token |= qtd_token::TOGGLE;
    }
    token
}

impl<R: RegisterAccess> UsbPeripheral<R> {
    // ========================================================================
    // Controller Lifecycle
    // ========================================================================

    /// Reset the controller and bring it up in host mode
    pub fn host_init(&self) -> Result<()> {
        let state = self.host_state()?;
        self.controller_reset()?;

        self.regs.write(Register::UsbMode, USBMODE::CM::Host.value);

        let head = &state.async_head;
        head.horizontal.store(head.link_to(), Ordering::Relaxed);
        head.characteristics
            .store(qh_ep_chars::HEAD, Ordering::Relaxed);
        head.capabilities.store(0, Ordering::Relaxed);
        head.current.store(0, Ordering::Relaxed);
        head.overlay.next.store(TERMINATE, Ordering::Relaxed);
        head.overlay
            .alternate_next
            .store(TERMINATE, Ordering::Relaxed);
        head.overlay
            .token
            .store(TokenStatus::HALTED.bits(), Ordering::Relaxed);
        for entry in &state.periodic_list.entries {
            entry.store(TERMINATE, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);

        self.regs
            .write(Register::PeriodicListBase, dma_address(&state.periodic_list));
        self.regs
            .write(Register::AsyncListAddr, dma_address(&state.async_head));

        // Eight-entry frame list.
        self.regs.modify(
            Register::UsbCmd,
            (USBCMD::FS0_1::SET + USBCMD::FS2::SET + USBCMD::ITC::SET).value,
            (USBCMD::FS0_1.val(3)
                + USBCMD::FS2::SET
                + USBCMD::ITC.val(self.config.interrupt_threshold as u32))
            .value,
        );
        self.regs.write(
            Register::UsbIntr,
            (USBINTR::UE::SET + USBINTR::UEE::SET + USBINTR::PCE::SET + USBINTR::SEE::SET).value,
        );
        self.regs.set_bits(Register::PortSc1, PORTSC1::PP::SET.value);

        log::info!("usb{}: host mode initialized", self.controller());
        Ok(())
    }

    /// Drive a bus reset on the port and wait for it to finish
    pub fn port_reset(&self) -> Result<()> {
        self.host_state()?;
        let reset = PORTSC1::PR::SET.value;
        // PE must be written as 0 while asserting reset.
        self.regs.modify(Register::PortSc1, PORTSC1::PE::SET.value, reset);
        self.wait_until("port reset", || self.regs.read(Register::PortSc1) & reset == 0)?;
        log::debug!(
            "usb{}: port reset done, speed {:?}",
            self.controller(),
            self.current_speed()
        );
        Ok(())
    }

    /// A device is attached to the port
    pub fn device_connected(&self) -> bool {
        self.regs.read(Register::PortSc1) & PORTSC1::CCS::SET.value != 0
    }

    /// Asynchronous schedule is running
    pub fn asynchronous_schedule_enabled(&self) -> bool {
        self.regs.read(Register::UsbSts) & USBSTS::AS::SET.value != 0
    }

    /// Start the asynchronous schedule and wait until the controller agrees
    pub fn enable_asynchronous_schedule(&self) -> Result<()> {
        self.regs.set_bits(Register::UsbCmd, USBCMD::ASE::SET.value);
        self.wait_until("async schedule start", || self.asynchronous_schedule_enabled())
    }

    /// Stop the asynchronous schedule; once this returns the ring may be edited
    pub fn disable_asynchronous_schedule(&self) -> Result<()> {
        self.regs.clear_bits(Register::UsbCmd, USBCMD::ASE::SET.value);
        self.wait_until("async schedule stop", || !self.asynchronous_schedule_enabled())
    }

    // ========================================================================
    // Descriptor Pools
    // ========================================================================

    /// Take a queue head from the pool
    pub fn allocate_queue_head(&self) -> Result<QueueHeadHandle> {
        let state = self.host_state()?;
        state
            .schedule
            .lock()
            .queue_heads
            .allocate()
            .ok_or(UsbError::ResourceExhausted)
    }

    /// Return a queue head to the pool
    ///
    /// The queue head must already be out of the asynchronous ring.
    pub fn free_queue_head(&self, qh: QueueHeadHandle) -> Result<()> {
        let state = self.host_state()?;
        let mut schedule = state.schedule.lock();
        debug_assert!(
            !matches!(
                state.find_predecessor(&schedule, schedule.queue_heads.address_of(qh)),
                Ok(Some(_))
            ),
            "freeing a linked queue head"
        );
        schedule.queue_heads.free(qh);
        Ok(())
    }

    /// Take a zeroed qTD from the pool
    pub fn allocate_transfer(&self) -> Result<TransferHandle> {
        let state = self.host_state()?;
        state
            .schedule
            .lock()
            .transfers
            .allocate()
            .ok_or(UsbError::ResourceExhausted)
    }

    pub fn free_transfer(&self, td: TransferHandle) -> Result<()> {
        let state = self.host_state()?;
        state.schedule.lock().transfers.free(td);
        Ok(())
    }

    /// Bus address of a pooled queue head
    pub fn queue_head_address(&self, qh: QueueHeadHandle) -> Result<u32> {
        let state = self.host_state()?;
        Ok(state.schedule.lock().queue_heads.address_of(qh))
    }

    // ========================================================================
    // Asynchronous Ring
    // ========================================================================

    /// Program a queue head's endpoint characteristics
    ///
    /// With `handle_toggle` set the controller tracks DATA0/DATA1 itself;
    /// otherwise every qTD carries the toggle it was scheduled with.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_queue_head(
        &self,
        qh: QueueHeadHandle,
        device_address: u8,
        endpoint_number: u8,
        speed: UsbSpeed,
        is_control: bool,
        handle_toggle: bool,
        max_packet_size: u16,
    ) -> Result<()> {
        let state = self.host_state()?;
        let schedule = state.schedule.lock();
        let qh = schedule.queue_heads.get(qh);

        let mut characteristics = (device_address as u32 & qh_ep_chars::DEVADDR_MASK)
            | (endpoint_number as u32 & 0xF) << qh_ep_chars::ENDPT_SHIFT
            | (max_packet_size as u32 & qh_ep_chars::MAXPKT_MASK) << qh_ep_chars::MAXPKT_SHIFT;
        characteristics |= match speed {
            UsbSpeed::Full => qh_ep_chars::EPS_FULL,
            UsbSpeed::Low => qh_ep_chars::EPS_LOW,
            UsbSpeed::High => qh_ep_chars::EPS_HIGH,
        };
        if !handle_toggle {
            characteristics |= qh_ep_chars::DTC;
        }
        if is_control && speed != UsbSpeed::High {
            characteristics |= qh_ep_chars::CTRL;
        }

        qh.characteristics.store(characteristics, Ordering::Relaxed);
        qh.capabilities.store(0, Ordering::Relaxed);
        qh.overlay.next.store(TERMINATE, Ordering::Relaxed);
        qh.overlay
            .alternate_next
            .store(TERMINATE, Ordering::Relaxed);
        qh.overlay.token.fetch_and(
            !(TokenStatus::ACTIVE | TokenStatus::HALTED | TokenStatus::PING).bits(),
            Ordering::Relaxed,
        );
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Queue head is linked into the asynchronous ring
    pub fn in_asynchronous_queue(&self, qh: QueueHeadHandle) -> Result<bool> {
        let state = self.host_state()?;
        let schedule = state.schedule.lock();
        let address = schedule.queue_heads.address_of(qh);
        Ok(state.find_predecessor(&schedule, address)?.is_some())
    }

    /// Prepare a queue head for an endpoint and make sure it is in the ring
    ///
    /// Allocates a queue head when `qh` is `None`. An already linked queue
    /// head is reprogrammed in place.
    #[allow(clippy::too_many_arguments)]
    pub fn set_up_asynchronous_endpoint_queue(
        &self,
        qh: Option<QueueHeadHandle>,
        device_address: u8,
        endpoint_number: u8,
        speed: UsbSpeed,
        is_control: bool,
        handle_toggle: bool,
        max_packet_size: u16,
    ) -> Result<QueueHeadHandle> {
        let state = self.host_state()?;
        let handle = match qh {
            Some(handle) => handle,
            None => self.allocate_queue_head()?,
        };
        let was_running = self.asynchronous_schedule_enabled();

        let linked = self
            .disable_asynchronous_schedule()
            .and_then(|()| {
                self.initialize_queue_head(
                    handle,
                    device_address,
                    endpoint_number,
                    speed,
                    is_control,
                    handle_toggle,
                    max_packet_size,
                )
            })
            .and_then(|()| {
                let schedule = state.schedule.lock();
                let qh = schedule.queue_heads.get(handle);
                let address = schedule.queue_heads.address_of(handle);
                if state.find_predecessor(&schedule, address)?.is_none() {
                    let head = &state.async_head;
                    qh.horizontal
                        .store(head.horizontal.load(Ordering::Acquire), Ordering::Relaxed);
                    fence(Ordering::SeqCst);
                    head.horizontal.store(qh.link_to(), Ordering::Release);
                    fence(Ordering::SeqCst);
                }
                Ok(())
            });

        if let Err(err) = linked {
            // A freshly allocated QH never made it into the ring.
            if qh.is_none() {
                state.schedule.lock().queue_heads.free(handle);
            }
            self.restore_asynchronous_schedule(was_running);
            return Err(err);
        }

        log::debug!(
            "usb{}: async endpoint {}.{} ({:?}, max packet {})",
            self.controller(),
            device_address,
            endpoint_number,
            speed,
            max_packet_size
        );
        self.enable_asynchronous_schedule()?;
        Ok(handle)
    }

    /// Allocate and link a queue head, with data toggle handling taken
    /// from the controller configuration
    pub fn open_asynchronous_endpoint(
        &self,
        device_address: u8,
        endpoint_number: u8,
        speed: UsbSpeed,
        is_control: bool,
        max_packet_size: u16,
    ) -> Result<QueueHeadHandle> {
        self.set_up_asynchronous_endpoint_queue(
            None,
            device_address,
            endpoint_number,
            speed,
            is_control,
            !self.config.data_toggle_control,
            max_packet_size,
        )
    }

    /// Unlink a queue head from the ring and return it to the pool
    ///
    /// Transfers still queued on it are dropped without running their
    /// callbacks.
    pub fn tear_down_asynchronous_endpoint(&self, qh: QueueHeadHandle) -> Result<()> {
        let state = self.host_state()?;
        let was_running = self.asynchronous_schedule_enabled();
        self.disable_asynchronous_schedule()?;

        let dropped = {
            let mut guard = state.schedule.lock();
            let schedule = &mut *guard;
            let address = schedule.queue_heads.address_of(qh);
            let node = schedule.queue_heads.get(qh);
            let predecessor = match state.find_predecessor(schedule, address) {
                Ok(predecessor) => predecessor,
                Err(err) => {
                    drop(guard);
                    self.restore_asynchronous_schedule(was_running);
                    return Err(err);
                }
            };
            if let Some(predecessor) = predecessor {
                predecessor
                    .horizontal
                    .store(node.horizontal.load(Ordering::Acquire), Ordering::Release);
            }
            node.horizontal.store(qh_link::TERMINATE, Ordering::Release);
            fence(Ordering::SeqCst);

            let mut chained: Vec<TransferHandle, HOST_MAX_TRANSFERS> = Vec::new();
            // A qTD the controller is executing is reachable only through
            // the current pointer; the overlay holds its successors.
            if node.overlay.is_active() {
                let current = node.current.load(Ordering::Acquire) & !0x1F;
                if let Some(td) = schedule.transfers.handle_at(current) {
                    let _ = chained.push(td);
                }
            }
            let mut link = &node.overlay;
            while !link.next_is_terminate() && !chained.is_full() {
                let next = link.next.load(Ordering::Acquire) & !0x1F;
                let Some(td) = schedule.transfers.handle_at(next) else {
                    break;
                };
                if chained.contains(&td) {
                    break;
                }
                let _ = chained.push(td);
                link = &schedule.transfers.get(td).hw;
            }
            node.overlay.next.store(TERMINATE, Ordering::Relaxed);
            node.overlay.token.store(0, Ordering::Relaxed);
            node.current.store(0, Ordering::Relaxed);

            for _ in 0..schedule.pending.len() {
                let Some(pending) = schedule.pending.pop_front() else {
                    break;
                };
                if chained.contains(&pending.td) {
                    schedule.transfers.free(pending.td);
                } else {
                    let _ = schedule.pending.push_back(pending);
                }
            }
            schedule.queue_heads.free(qh);
            chained.len()
        };

        log::debug!(
            "usb{}: async endpoint torn down, {} transfers dropped",
            self.controller(),
            dropped
        );
        if was_running && state.async_head.next_address() != dma_address(&state.async_head) {
            self.enable_asynchronous_schedule()?;
        }
        Ok(())
    }

    fn restore_asynchronous_schedule(&self, was_running: bool) {
        if !was_running {
            return;
        }
        if let Err(err) = self.enable_asynchronous_schedule() {
            log::error!("usb{}: async schedule not restarted: {}", self.controller(), err);
        }
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Queue a transfer behind whatever is already chained on `qh`
    ///
    /// `completion` runs from interrupt context once the controller retires
    /// the qTD, with the byte count and the halted / transaction error
    /// flags from the final token.
    ///
    /// # Safety
    ///
    /// `data` must be valid for `maximum_length` bytes (writable for IN and
    /// readable for OUT/SETUP) until the completion has run or the queue
    /// head is torn down.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn host_transfer_schedule(
        &self,
        qh: QueueHeadHandle,
        pid: Pid,
        data_toggle: bool,
        data: *mut u8,
        maximum_length: u32,
        completion: Option<HostTransferCallback>,
        user_data: *mut (),
    ) -> Result<()> {
        let state = self.host_state()?;
        if maximum_length > MAX_TRANSFER_LENGTH {
            return Err(UsbError::InvalidParameter);
        }

        let mut guard = state.schedule.lock();
        let schedule = &mut *guard;
        if !schedule.queue_heads.is_allocated(qh) {
            return Err(UsbError::InvalidParameter);
        }
        let handle = schedule
            .transfers
            .allocate()
            .ok_or(UsbError::ResourceExhausted)?;

        let td = schedule.transfers.get(handle);
        td.next.store(TERMINATE, Ordering::Relaxed);
        td.alternate_next.store(TERMINATE, Ordering::Relaxed);
        td.token.store(
            transfer_token(pid, data_toggle, maximum_length),
            Ordering::Relaxed,
        );
        fill_buffer_pages(&td.buffer_pages, dma_address(data));
        let td_address = schedule.transfers.address_of(handle);

        let pending = PendingTransfer {
            td: handle,
            maximum_length,
            completion,
            user_data: UserData(user_data),
        };
        if schedule.pending.push_back(pending).is_err() {
            schedule.transfers.free(handle);
            return Err(UsbError::ResourceExhausted);
        }

        // Walk to the terminating link and hang the new qTD there.
        let mut tail: &TransferOverlay = &schedule.queue_heads.get(qh).overlay;
        let mut steps = 0;
        while !tail.next_is_terminate() {
            let next = tail.next.load(Ordering::Acquire) & !0x1F;
            let found = schedule.transfers.handle_at(next).filter(|_| steps < HOST_MAX_TRANSFERS);
            let Some(next) = found else {
                schedule.pending.pop_back();
                schedule.transfers.free(handle);
                return Err(UsbError::CorruptSchedule);
            };
            tail = &schedule.transfers.get(next).hw;
            steps += 1;
        }
        fence(Ordering::SeqCst);
        tail.next.store(td_address, Ordering::Release);

        log::trace!(
            "usb{}: host {:?} of {} bytes queued",
            self.controller(),
            pid,
            maximum_length
        );
        Ok(())
    }

    /// Retire every finished transfer on the pending list
    ///
    /// Callbacks run in scheduling order after the schedule lock is
    /// released.
    pub fn handle_asynchronous_transfer_complete(&self) -> Result<()> {
        let state = self.host_state()?;
        let mut finished: Vec<(PendingTransfer, u32, TokenStatus), HOST_MAX_TRANSFERS> =
            Vec::new();
        {
            let mut guard = state.schedule.lock();
            let schedule = &mut *guard;
            for _ in 0..schedule.pending.len() {
                let Some(pending) = schedule.pending.pop_front() else {
                    break;
                };
                let td = schedule.transfers.get(pending.td);
                if td.is_active() {
                    let _ = schedule.pending.push_back(pending);
                    continue;
                }
                let status = td.status();
                let bytes = pending
                    .maximum_length
                    .saturating_sub(td.remaining_bytes());
                schedule.transfers.free(pending.td);
                let _ = finished.push((pending, bytes, status));
            }
        }

        for (pending, bytes, status) in finished {
            let halted = status.contains(TokenStatus::HALTED);
            let transaction_error = status.contains(TokenStatus::TRANSACTION_ERROR);
            if halted || transaction_error {
                log::debug!(
                    "usb{}: host transfer ended with {:?}",
                    self.controller(),
                    status
                );
            }
            if let Some(completion) = pending.completion {
                completion(pending.user_data.0, bytes, halted, transaction_error);
            }
        }
        Ok(())
    }

    /// Transfers scheduled and not yet retired
    pub fn pending_host_transfers(&self) -> usize {
        self.host_state()
            .map(|state| state.schedule.lock().pending_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::testing::{
        self, asynchronous_ring, complete_host_transfer, fetch_host_transfer,
    };
    use std::sync::Mutex;

    static LOG: Mutex<std::vec::Vec<(usize, u32, bool, bool)>> = Mutex::new(std::vec::Vec::new());

    fn record(user_data: *mut (), bytes: u32, halted: bool, transaction_error: bool) {
        LOG.lock()
            .unwrap()
            .push((user_data as usize, bytes, halted, transaction_error));
    }

    fn control_queue(usb: &UsbPeripheral<testing::SimulatedRegisters>) -> QueueHeadHandle {
        usb.set_up_asynchronous_endpoint_queue(None, 3, 0, UsbSpeed::Full, true, true, 64)
            .unwrap()
    }

    #[test]
    fn init_programs_host_mode() {
        let usb = testing::host();
        let state = usb.host_state().unwrap();
        let regs = usb.registers();
        assert_eq!(regs.read(Register::UsbMode) & 0x3, 3);
        assert_eq!(regs.read(Register::AsyncListAddr), dma_address(&state.async_head));
        assert_eq!(regs.read(Register::AsyncListAddr) & 0x1F, 0);
        assert_eq!(
            state.async_head.horizontal.load(Ordering::Relaxed),
            state.async_head.link_to()
        );
        assert_ne!(
            state.async_head.characteristics.load(Ordering::Relaxed) & qh_ep_chars::HEAD,
            0
        );
        assert_eq!(regs.read(Register::UsbIntr), 0x17);
        assert_eq!(
            regs.read(Register::PeriodicListBase) & 0xFFF,
            0,
            "frame list must be 4 KiB aligned"
        );
    }

    #[test]
    fn endpoint_queue_is_spliced_behind_head() {
        let usb = testing::host();
        let first = control_queue(&usb);
        let second = usb
            .set_up_asynchronous_endpoint_queue(None, 3, 1, UsbSpeed::Full, false, false, 64)
            .unwrap();

        let ring = asynchronous_ring(&usb);
        assert_eq!(
            ring,
            [
                usb.queue_head_address(second).unwrap(),
                usb.queue_head_address(first).unwrap()
            ]
        );
        assert!(usb.in_asynchronous_queue(first).unwrap());
        assert!(usb.asynchronous_schedule_enabled());

        let state = usb.host_state().unwrap();
        let schedule = state.schedule.lock();
        let qh = schedule.queue_heads.get(first);
        let characteristics = qh.characteristics.load(Ordering::Relaxed);
        assert_eq!(qh.device_address(), 3);
        assert_eq!(qh.max_packet_size(), 64);
        assert_ne!(characteristics & qh_ep_chars::CTRL, 0);
        assert_eq!(characteristics & qh_ep_chars::DTC, 0);
        let bulk = schedule.queue_heads.get(second).characteristics.load(Ordering::Relaxed);
        assert_ne!(bulk & qh_ep_chars::DTC, 0);
        assert_eq!(bulk & qh_ep_chars::CTRL, 0);
    }

    #[test]
    fn reusing_a_linked_queue_head_does_not_relink() {
        let usb = testing::host();
        let qh = control_queue(&usb);
        let again = usb
            .set_up_asynchronous_endpoint_queue(Some(qh), 4, 0, UsbSpeed::Full, true, true, 8)
            .unwrap();
        assert_eq!(again, qh);
        assert_eq!(asynchronous_ring(&usb).len(), 1);
    }

    #[test]
    fn high_speed_control_endpoint_has_no_control_flag() {
        let usb = testing::host();
        let qh = usb
            .set_up_asynchronous_endpoint_queue(None, 1, 0, UsbSpeed::High, true, true, 64)
            .unwrap();
        let state = usb.host_state().unwrap();
        let characteristics = state
            .schedule
            .lock()
            .queue_heads
            .get(qh)
            .characteristics
            .load(Ordering::Relaxed);
        assert_eq!(characteristics & qh_ep_chars::CTRL, 0);
        assert_eq!(characteristics & (3 << qh_ep_chars::EPS_SHIFT), qh_ep_chars::EPS_HIGH);
    }

    #[test]
    fn back_to_back_transfers_link_and_complete_in_order() {
        let usb = testing::host();
        let qh = control_queue(&usb);
        let mut setup = [0u8; 8];
        let mut data = [0u8; 64];
        unsafe {
            usb.host_transfer_schedule(qh, Pid::Setup, false, setup.as_mut_ptr(), 8, Some(record), 0x51 as *mut ())
                .unwrap();
            usb.host_transfer_schedule(qh, Pid::In, true, data.as_mut_ptr(), 64, Some(record), 0x52 as *mut ())
                .unwrap();
        }

        let chain = testing::queued_host_transfers(&usb, qh);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].next, chain[1].address);
        assert_eq!(chain[1].next, TERMINATE);
        assert_eq!(chain[0].page0, dma_address(setup.as_ptr()));
        assert_eq!(chain[0].token >> qtd_token::PID_SHIFT & 0x3, Pid::Setup as u32);
        assert_eq!(chain[1].token & qtd_token::TOGGLE, qtd_token::TOGGLE);
        assert_eq!(usb.pending_host_transfers(), 2);

        assert!(complete_host_transfer(&usb, qh, 0, TokenStatus::empty()));
        assert!(complete_host_transfer(&usb, qh, 46, TokenStatus::empty()));
        usb.handle_interrupt();

        let log = LOG.lock().unwrap();
        let ours: std::vec::Vec<_> = log
            .iter()
            .filter(|entry| entry.0 == 0x51 || entry.0 == 0x52)
            .copied()
            .collect();
        assert_eq!(ours, [(0x51, 8, false, false), (0x52, 18, false, false)]);
        drop(log);
        assert_eq!(usb.pending_host_transfers(), 0);
    }

    #[test]
    fn completion_reports_error_flags() {
        let usb = testing::host();
        let qh = control_queue(&usb);
        let mut data = [0u8; 8];
        unsafe {
            usb.host_transfer_schedule(qh, Pid::In, false, data.as_mut_ptr(), 8, Some(record), 0x61 as *mut ())
                .unwrap();
        }
        assert!(complete_host_transfer(
            &usb,
            qh,
            8,
            TokenStatus::HALTED | TokenStatus::TRANSACTION_ERROR
        ));
        usb.handle_asynchronous_transfer_complete().unwrap();
        let log = LOG.lock().unwrap();
        assert!(log.contains(&(0x61, 0, true, true)));
    }

    #[test]
    fn unfinished_transfers_stay_pending() {
        let usb = testing::host();
        let qh = control_queue(&usb);
        let mut data = [0u8; 8];
        unsafe {
            usb.host_transfer_schedule(qh, Pid::Out, false, data.as_mut_ptr(), 8, None, core::ptr::null_mut())
                .unwrap();
        }
        usb.handle_asynchronous_transfer_complete().unwrap();
        assert_eq!(usb.pending_host_transfers(), 1);
    }

    #[test]
    fn transfer_pool_exhaustion_is_reported() {
        let usb = testing::host();
        let qh = control_queue(&usb);
        let mut data = [0u8; 8];
        for _ in 0..HOST_MAX_TRANSFERS {
            unsafe {
                usb.host_transfer_schedule(qh, Pid::Out, false, data.as_mut_ptr(), 8, None, core::ptr::null_mut())
                    .unwrap();
            }
        }
        let result = unsafe {
            usb.host_transfer_schedule(qh, Pid::Out, false, data.as_mut_ptr(), 8, None, core::ptr::null_mut())
        };
        assert_eq!(result, Err(UsbError::ResourceExhausted));
        assert_eq!(testing::queued_host_transfers(&usb, qh).len(), HOST_MAX_TRANSFERS);
    }

    #[test]
    fn queue_head_pool_exhaustion_is_reported() {
        let usb = testing::host();
        for n in 0..HOST_MAX_QUEUE_HEADS {
            usb.set_up_asynchronous_endpoint_queue(None, 1, n as u8, UsbSpeed::Full, false, true, 64)
                .unwrap();
        }
        assert_eq!(
            usb.set_up_asynchronous_endpoint_queue(None, 1, 9, UsbSpeed::Full, false, true, 64),
            Err(UsbError::ResourceExhausted)
        );
        assert_eq!(asynchronous_ring(&usb).len(), HOST_MAX_QUEUE_HEADS);
    }

    #[test]
    fn tear_down_unlinks_and_frees() {
        let usb = testing::host();
        let first = control_queue(&usb);
        let second = usb
            .set_up_asynchronous_endpoint_queue(None, 3, 2, UsbSpeed::Full, false, true, 64)
            .unwrap();
        let mut data = [0u8; 8];
        unsafe {
            usb.host_transfer_schedule(second, Pid::In, false, data.as_mut_ptr(), 8, None, core::ptr::null_mut())
                .unwrap();
        }

        usb.tear_down_asynchronous_endpoint(second).unwrap();
        assert_eq!(
            asynchronous_ring(&usb),
            [usb.queue_head_address(first).unwrap()]
        );
        assert_eq!(usb.pending_host_transfers(), 0);
        assert!(usb.asynchronous_schedule_enabled());

        usb.tear_down_asynchronous_endpoint(first).unwrap();
        assert!(asynchronous_ring(&usb).is_empty());
        assert!(!usb.asynchronous_schedule_enabled());

        let state = usb.host_state().unwrap();
        assert_eq!(
            state.schedule.lock().queue_heads.free_count(),
            HOST_MAX_QUEUE_HEADS
        );
    }

    #[test]
    fn tear_down_reclaims_transfer_in_flight() {
        let usb = testing::host();
        let qh = usb
            .set_up_asynchronous_endpoint_queue(None, 2, 1, UsbSpeed::High, false, true, 512)
            .unwrap();
        let mut data = [0u8; 64];
        unsafe {
            usb.host_transfer_schedule(qh, Pid::In, false, data.as_mut_ptr(), 64, None, core::ptr::null_mut())
                .unwrap();
        }
        assert!(fetch_host_transfer(&usb, qh));

        usb.tear_down_asynchronous_endpoint(qh).unwrap();
        assert_eq!(usb.pending_host_transfers(), 0);
        let state = usb.host_state().unwrap();
        let schedule = state.schedule.lock();
        assert_eq!(schedule.transfers.free_count(), HOST_MAX_TRANSFERS);
        assert_eq!(schedule.queue_heads.free_count(), HOST_MAX_QUEUE_HEADS);
    }

    #[test]
    fn corrupt_ring_leaves_schedule_running() {
        let usb = testing::host();
        let first = control_queue(&usb);
        let state = usb.host_state().unwrap();
        // Horizontal link into memory no pooled QH occupies.
        state
            .schedule
            .lock()
            .queue_heads
            .get(first)
            .horizontal
            .store(0x40 | qh_link::TYPE_QH, Ordering::SeqCst);

        let result = usb.set_up_asynchronous_endpoint_queue(None, 3, 1, UsbSpeed::Full, false, true, 64);
        assert_eq!(result, Err(UsbError::CorruptSchedule));
        assert!(usb.asynchronous_schedule_enabled());
        assert_eq!(
            state.schedule.lock().queue_heads.free_count(),
            HOST_MAX_QUEUE_HEADS - 1
        );
    }

    #[test]
    fn port_reset_and_connection() {
        let usb = testing::host();
        assert!(!usb.device_connected());
        usb.registers()
            .force(Register::PortSc1, PORTSC1::CCS::SET.value);
        assert!(usb.device_connected());
        usb.port_reset().unwrap();
        assert_ne!(usb.registers().read(Register::PortSc1) & PORTSC1::PE::SET.value, 0);
    }

    #[test]
    fn configured_toggle_control_reaches_queue_head() {
        let usb = testing::host();
        let qh = usb
            .open_asynchronous_endpoint(2, 1, UsbSpeed::Full, false, 64)
            .unwrap();
        let state = usb.host_state().unwrap();
        let characteristics = state
            .schedule
            .lock()
            .queue_heads
            .get(qh)
            .characteristics
            .load(Ordering::Relaxed);
        // Default configuration lets the controller track toggles.
        assert_eq!(characteristics & qh_ep_chars::DTC, 0);
    }

    #[test]
    fn host_operations_need_host_mode() {
        let usb = testing::device();
        assert_eq!(usb.allocate_queue_head(), Err(UsbError::WrongMode));
        assert_eq!(usb.handle_asynchronous_transfer_complete(), Err(UsbError::WrongMode));
    }
}
