//! Simulated controller for unit tests
//!
//! `SimulatedRegisters` models the parts of the ChipIdea register
//! behaviour the core depends on: write-1-to-clear status registers,
//! instant priming and flushing, self-clearing reset bits and the
//! deferred address latch. Helper functions play the controller's side of
//! a transfer (SETUP arrival, dTD / qTD retirement).

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use zerocopy::IntoBytes;

use super::descriptor_table;
use super::ehci::{TERMINATE, TokenStatus, dtd_token, qtd_token};
use super::endpoint::EndpointAddress;
use super::host::QueueHeadHandle;
use super::peripheral::UsbPeripheral;
use super::regs::{DEVICEADDR, ENDPTCTRL, PORTSC1, Register, RegisterAccess, USBCMD, USBSTS};
use super::{Direction, SetupPacket, UsbSpeed};
use crate::config::ControllerConfig;

/// Interrupt bits of USBSTS; the rest are read-only status
const USBSTS_W1C: u32 = 0x000F_01FF;
const NO_ADDRESS: u32 = u32::MAX;

const SLOTS: usize = 16;

fn slot(reg: Register) -> usize {
    match reg {
        Register::UsbCmd => 0,
        Register::UsbSts => 1,
        Register::UsbIntr => 2,
        Register::FrIndex => 3,
        Register::DeviceAddr | Register::PeriodicListBase => 4,
        Register::EndpointListAddr | Register::AsyncListAddr => 5,
        Register::EndptNak => 6,
        Register::EndptNakEn => 7,
        Register::PortSc1 => 8,
        Register::OtgSc => 9,
        Register::UsbMode => 10,
        Register::EndptSetupStat => 11,
        Register::EndptPrime => 12,
        Register::EndptFlush => 13,
        Register::EndptStat => 14,
        Register::EndptComplete => 15,
        Register::EndptCtrl(_) => unreachable!("endpoint control has its own bank"),
    }
}

/// Register block that reacts like the controller, instantly
pub struct SimulatedRegisters {
    values: [AtomicU32; SLOTS],
    endpoint_control: [AtomicU32; 6],
    pending_address: AtomicU32,
    applied_address: AtomicU32,
    stuck_flush: AtomicBool,
}

impl SimulatedRegisters {
    pub fn new() -> Self {
        Self {
            values: core::array::from_fn(|_| AtomicU32::new(0)),
            endpoint_control: core::array::from_fn(|_| AtomicU32::new(0)),
            pending_address: AtomicU32::new(NO_ADDRESS),
            applied_address: AtomicU32::new(0),
            stuck_flush: AtomicBool::new(false),
        }
    }

    fn register(&self, reg: Register) -> &AtomicU32 {
        &self.values[slot(reg)]
    }

    fn cell(&self, reg: Register) -> Option<&AtomicU32> {
        match reg {
            Register::EndptCtrl(n) => self.endpoint_control.get(n as usize),
            _ => Some(self.register(reg)),
        }
    }

    /// Make ENDPTFLUSH hold its bits forever
    pub fn set_stuck_flush(&self, stuck: bool) {
        self.stuck_flush.store(stuck, Ordering::SeqCst);
    }

    /// Store a raw value, bypassing every side effect
    pub fn force(&self, reg: Register, value: u32) {
        if let Some(cell) = self.cell(reg) {
            cell.store(value, Ordering::SeqCst);
        }
    }

    /// OR bits into a register, bypassing every side effect
    pub fn assert_bits(&self, reg: Register, bits: u32) {
        if let Some(cell) = self.cell(reg) {
            cell.fetch_or(bits, Ordering::SeqCst);
        }
    }

    /// Latch interrupt causes in USBSTS
    pub fn raise(&self, bits: u32) {
        self.assert_bits(Register::UsbSts, bits);
    }

    /// Address the bus currently answers to
    pub fn applied_address(&self) -> u8 {
        self.applied_address.load(Ordering::SeqCst) as u8
    }

    /// Apply a USBADRA-latched address, as the controller does after an
    /// IN status stage
    pub fn apply_pending_address(&self) {
        let pending = self.pending_address.swap(NO_ADDRESS, Ordering::SeqCst);
        if pending != NO_ADDRESS {
            self.applied_address.store(pending, Ordering::SeqCst);
        }
    }

    /// Every register value, for before/after comparisons
    pub fn snapshot(&self) -> Vec<u32> {
        self.values
            .iter()
            .chain(self.endpoint_control.iter())
            .map(|cell| cell.load(Ordering::SeqCst))
            .collect()
    }
}

impl RegisterAccess for SimulatedRegisters {
    fn read(&self, reg: Register) -> u32 {
        match reg {
            Register::EndptPrime => 0,
            Register::EndptFlush if !self.stuck_flush.load(Ordering::SeqCst) => 0,
            _ => self
                .cell(reg)
                .map(|cell| cell.load(Ordering::SeqCst))
                .unwrap_or(0),
        }
    }

    fn write(&self, reg: Register, value: u32) {
        match reg {
            Register::UsbSts => {
                self.register(reg).fetch_and(!(value & USBSTS_W1C), Ordering::SeqCst);
            }
            Register::EndptSetupStat | Register::EndptComplete | Register::EndptNak => {
                self.register(reg).fetch_and(!value, Ordering::SeqCst);
            }
            Register::EndptPrime => {
                self.register(Register::EndptStat).fetch_or(value, Ordering::SeqCst);
            }
            Register::EndptFlush => {
                if self.stuck_flush.load(Ordering::SeqCst) {
                    self.register(reg).store(value, Ordering::SeqCst);
                } else {
                    self.register(Register::EndptStat).fetch_and(!value, Ordering::SeqCst);
                }
            }
            Register::UsbCmd => {
                let doorbell = USBCMD::IAA::SET.value;
                self.register(reg).store(
                    value & !(USBCMD::RST::SET.value | doorbell),
                    Ordering::SeqCst,
                );
                let status = self.register(Register::UsbSts);
                if value & USBCMD::ASE::SET.value != 0 {
                    status.fetch_or(USBSTS::AS::SET.value, Ordering::SeqCst);
                } else {
                    status.fetch_and(!USBSTS::AS::SET.value, Ordering::SeqCst);
                }
                if value & doorbell != 0 {
                    status.fetch_or(USBSTS::AAI::SET.value, Ordering::SeqCst);
                }
            }
            Register::DeviceAddr => {
                self.register(reg).store(value, Ordering::SeqCst);
                let address = (value >> DEVICEADDR::USBADR.shift) & DEVICEADDR::USBADR.mask;
                if value & DEVICEADDR::USBADRA::SET.value != 0 {
                    self.pending_address.store(address, Ordering::SeqCst);
                } else {
                    self.pending_address.store(NO_ADDRESS, Ordering::SeqCst);
                    self.applied_address.store(address, Ordering::SeqCst);
                }
            }
            Register::PortSc1 => {
                let reset = PORTSC1::PR::SET.value;
                if value & reset != 0 {
                    self.register(reg).store((value & !reset) | PORTSC1::PE::SET.value, Ordering::SeqCst);
                } else {
                    self.register(reg).store(value, Ordering::SeqCst);
                }
            }
            _ => self.force(reg, value),
        }
    }
}

type Sim = UsbPeripheral<SimulatedRegisters>;

fn config() -> ControllerConfig {
    ControllerConfig {
        poll_limit: Some(10_000),
        ..ControllerConfig::default()
    }
}

/// Device-mode peripheral on USB0 serving the test descriptor table, not
/// yet initialized
pub fn device_unstarted() -> Box<Sim> {
    Box::new(UsbPeripheral::new_device(
        SimulatedRegisters::new(),
        0,
        config(),
        descriptor_table::tests::table(),
    ))
}

/// Bring a device-mode peripheral up and attach it
pub fn start_device(usb: &Sim) {
    usb.device_init().unwrap();
    usb.init_control_endpoints().unwrap();
    usb.run();
}

/// Running device-mode peripheral
pub fn device() -> Box<Sim> {
    let usb = device_unstarted();
    start_device(&usb);
    usb
}

/// Running host-mode peripheral on USB1
pub fn host() -> Box<Sim> {
    let usb = Box::new(UsbPeripheral::new_host(SimulatedRegisters::new(), 1, config()));
    usb.host_init().unwrap();
    usb.run();
    usb
}

/// Report `speed` in PORTSC1.PSPD
pub fn set_speed(usb: &Sim, speed: UsbSpeed) {
    let pspd = match speed {
        UsbSpeed::Full => 0,
        UsbSpeed::Low => 1,
        UsbSpeed::High => 2,
    };
    usb.registers().modify(
        Register::PortSc1,
        PORTSC1::PSPD::SET.value,
        PORTSC1::PSPD.val(pspd).value,
    );
}

/// Land a SETUP packet in an endpoint's OUT queue head and raise USBINT
pub fn deliver_setup(usb: &Sim, number: u8, packet: SetupPacket) {
    let state = usb.device_state().unwrap();
    let qh = state.queue_head(EndpointAddress::new(number, Direction::Out));
    let bytes = packet.as_bytes();
    qh.setup[0].store(
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        Ordering::SeqCst,
    );
    qh.setup[1].store(
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        Ordering::SeqCst,
    );

    let regs = usb.registers();
    // A SETUP clears a protocol stall on the control endpoint.
    if number == 0 {
        regs.clear_bits(
            Register::EndptCtrl(0),
            (ENDPTCTRL::RXS::SET + ENDPTCTRL::TXS::SET).value,
        );
    }
    regs.assert_bits(Register::EndptSetupStat, 1 << number);
    regs.raise(USBSTS::UI::SET.value);
}

/// Retire the oldest active dTD on an endpoint with `remaining` bytes
/// left over
///
/// Returns false when nothing was queued.
pub fn complete_device_transfer(usb: &Sim, endpoint: EndpointAddress, remaining: u32) -> bool {
    let state = usb.device_state().unwrap();
    let more = {
        let transfers = state.transfers.lock();
        let mut active = transfers.queues[endpoint.queue_head_index()]
            .iter()
            .map(|handle| transfers.pool.get(*handle))
            .filter(|td| td.status().contains(TokenStatus::ACTIVE));
        let Some(td) = active.next() else {
            return false;
        };
        let token = td.token.load(Ordering::SeqCst)
            & !TokenStatus::ACTIVE.bits()
            & !(dtd_token::BYTES_MASK << dtd_token::BYTES_SHIFT);
        td.token.store(
            token | (remaining & dtd_token::BYTES_MASK) << dtd_token::BYTES_SHIFT,
            Ordering::SeqCst,
        );
        active.next().is_some()
    };

    let regs = usb.registers();
    if !more {
        let stat = regs.read(Register::EndptStat);
        regs.force(Register::EndptStat, stat & !endpoint.bit());
    }
    if endpoint == EndpointAddress::CONTROL_IN {
        regs.apply_pending_address();
    }
    regs.assert_bits(Register::EndptComplete, endpoint.bit());
    regs.raise(USBSTS::UI::SET.value);
    true
}

/// dTD as seen by the controller
#[derive(Debug, Clone, Copy)]
pub struct QueuedView {
    pub address: u32,
    pub next: u32,
    pub page0: u32,
    pub total_bytes: u32,
    pub active: bool,
}

/// dTDs queued on an endpoint, oldest first
pub fn queued_device_transfers(usb: &Sim, endpoint: EndpointAddress) -> Vec<QueuedView> {
    let state = usb.device_state().unwrap();
    let transfers = state.transfers.lock();
    transfers.queues[endpoint.queue_head_index()]
        .iter()
        .map(|handle| {
            let td = transfers.pool.get(*handle);
            QueuedView {
                address: transfers.pool.address_of(*handle),
                next: td.next.load(Ordering::SeqCst),
                page0: td.buffer_pages[0].load(Ordering::SeqCst),
                total_bytes: td.remaining_bytes(),
                active: td.status().contains(TokenStatus::ACTIVE),
            }
        })
        .collect()
}

/// Execute the qTD at the head of a queue head's overlay chain
///
/// The qTD is retired with `remaining` bytes untransferred and `status`
/// added to its token; the overlay advances to the next qTD.
pub fn complete_host_transfer(
    usb: &Sim,
    qh: QueueHeadHandle,
    remaining: u32,
    status: TokenStatus,
) -> bool {
    let state = usb.host_state().unwrap();
    {
        let schedule = state.schedule.lock();
        let overlay = &schedule.queue_heads.get(qh).overlay;
        if overlay.next_is_terminate() {
            return false;
        }
        let address = overlay.next.load(Ordering::SeqCst) & !0x1F;
        let Some(td) = schedule.transfers.handle_at(address) else {
            return false;
        };
        let td = schedule.transfers.get(td);
        let token = td.token.load(Ordering::SeqCst)
            & !TokenStatus::ACTIVE.bits()
            & !(qtd_token::BYTES_MASK << qtd_token::BYTES_SHIFT);
        td.token.store(
            token | status.bits() | (remaining & qtd_token::BYTES_MASK) << qtd_token::BYTES_SHIFT,
            Ordering::SeqCst,
        );
        overlay
            .next
            .store(td.next.load(Ordering::SeqCst), Ordering::SeqCst);
    }
    usb.registers().raise(USBSTS::UI::SET.value);
    true
}

/// Load the qTD at the head of the overlay chain into the overlay, as
/// the controller does when it starts executing it
pub fn fetch_host_transfer(usb: &Sim, qh: QueueHeadHandle) -> bool {
    let state = usb.host_state().unwrap();
    let schedule = state.schedule.lock();
    let node = schedule.queue_heads.get(qh);
    if node.overlay.next_is_terminate() {
        return false;
    }
    let address = node.overlay.next.load(Ordering::SeqCst) & !0x1F;
    let Some(td) = schedule.transfers.handle_at(address) else {
        return false;
    };
    let td = schedule.transfers.get(td);
    node.current.store(address, Ordering::SeqCst);
    node.overlay
        .next
        .store(td.next.load(Ordering::SeqCst), Ordering::SeqCst);
    node.overlay
        .token
        .store(td.token.load(Ordering::SeqCst), Ordering::SeqCst);
    true
}

/// qTD chained off a queue head
#[derive(Debug, Clone, Copy)]
pub struct HostQueuedView {
    pub address: u32,
    pub next: u32,
    pub page0: u32,
    pub token: u32,
}

/// qTDs reachable from a queue head's overlay, in execution order
pub fn queued_host_transfers(usb: &Sim, qh: QueueHeadHandle) -> Vec<HostQueuedView> {
    let state = usb.host_state().unwrap();
    let schedule = state.schedule.lock();
    let mut chain = Vec::new();
    let mut next = schedule.queue_heads.get(qh).overlay.next.load(Ordering::SeqCst);
    while next & TERMINATE == 0 {
        let handle = schedule.transfers.handle_at(next & !0x1F).unwrap();
        let td = schedule.transfers.get(handle);
        chain.push(HostQueuedView {
            address: next,
            next: td.next.load(Ordering::SeqCst),
            page0: td.buffer_pages[0].load(Ordering::SeqCst),
            token: td.token.load(Ordering::SeqCst),
        });
        next = td.next.load(Ordering::SeqCst);
    }
    chain
}

/// Queue heads in the asynchronous ring after the static head
pub fn asynchronous_ring(usb: &Sim) -> Vec<u32> {
    let state = usb.host_state().unwrap();
    let schedule = state.schedule.lock();
    let head = super::ehci::dma_address(&state.async_head);
    let mut ring = Vec::new();
    let mut next = state.async_head.next_address();
    while next != head {
        ring.push(next);
        let handle = schedule.queue_heads.handle_at(next).unwrap();
        next = schedule.queue_heads.get(handle).next_address();
    }
    ring
}
