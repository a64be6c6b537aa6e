//! Controller DMA data structures
//!
//! Queue heads and transfer descriptors shared with the controller's DMA
//! engine. Host mode uses the EHCI queue head / qTD layout; device mode
//! uses the ChipIdea dQH / dTD layout. Every hardware-visible word is an
//! `AtomicU32` so the CPU and the controller can both touch descriptors
//! through shared references.
//!
//! # References
//! - EHCI Specification 1.0, sections 3.5 and 3.6
//! - LPC43xx User Manual, "Device data structures"

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::config::USB_TOTAL_QUEUE_HEADS;

/// Link pointer terminate bit
pub const TERMINATE: u32 = 1;

/// Size of one buffer page
pub const PAGE_SIZE: u32 = 0x1000;

/// Buffer pages per transfer descriptor
pub const BUFFER_PAGES: usize = 5;

/// Longest transfer a single descriptor can describe with an unaligned buffer
pub const MAX_TRANSFER_LENGTH: u32 = PAGE_SIZE * 4;

/// 32-bit bus address of a DMA-visible object
#[inline]
pub fn dma_address<T>(object: *const T) -> u32 {
    object as usize as u32
}

/// Fill the five page pointers for a buffer starting at `data`
pub fn fill_buffer_pages(pages: &[AtomicU32; BUFFER_PAGES], data: u32) {
    pages[0].store(data, Ordering::Relaxed);
    for (n, page) in pages.iter().enumerate().skip(1) {
        let addr = data.wrapping_add(n as u32 * PAGE_SIZE) & !(PAGE_SIZE - 1);
        page.store(addr, Ordering::Relaxed);
    }
}

bitflags! {
    /// Status byte shared by qTD and dTD tokens
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenStatus: u32 {
        /// Ping state (host) / reserved (device)
        const PING = 1 << 0;
        /// Split transaction state
        const SPLIT = 1 << 1;
        /// Missed micro-frame
        const MISSED_UFRAME = 1 << 2;
        /// Transaction error
        const TRANSACTION_ERROR = 1 << 3;
        /// Babble detected
        const BABBLE = 1 << 4;
        /// Data buffer error
        const BUFFER_ERROR = 1 << 5;
        /// Halted
        const HALTED = 1 << 6;
        /// Active
        const ACTIVE = 1 << 7;
    }
}

impl TokenStatus {
    /// Status bits of a token word
    pub fn of(token: u32) -> Self {
        Self::from_bits_truncate(token & 0xFF)
    }
}

// ============================================================================
// Host Queue Head (QH) Constants
// ============================================================================

/// QH horizontal link pointer constants
pub mod qh_link {
    /// Terminate bit
    pub const TERMINATE: u32 = 1;
    /// Type: Queue Head
    pub const TYPE_QH: u32 = 1 << 1;
    /// Type mask
    pub const TYPE_MASK: u32 = 3 << 1;
    /// Address bits
    pub const ADDR_MASK: u32 = !0x1F;
}

/// QH endpoint characteristics constants
pub mod qh_ep_chars {
    /// Device Address mask
    pub const DEVADDR_MASK: u32 = 0x7F;
    /// Endpoint Number shift
    pub const ENDPT_SHIFT: u32 = 8;
    /// Endpoint Speed shift
    pub const EPS_SHIFT: u32 = 12;
    /// Endpoint Speed: Full Speed
    pub const EPS_FULL: u32 = 0 << 12;
    /// Endpoint Speed: Low Speed
    pub const EPS_LOW: u32 = 1 << 12;
    /// Endpoint Speed: High Speed
    pub const EPS_HIGH: u32 = 2 << 12;
    /// Data Toggle Control
    pub const DTC: u32 = 1 << 14;
    /// Head of Reclamation List Flag
    pub const HEAD: u32 = 1 << 15;
    /// Maximum Packet Length shift
    pub const MAXPKT_SHIFT: u32 = 16;
    /// Maximum Packet Length mask (unshifted)
    pub const MAXPKT_MASK: u32 = 0x7FF;
    /// Control Endpoint Flag
    pub const CTRL: u32 = 1 << 27;
    /// NAK Count Reload shift
    pub const RL_SHIFT: u32 = 28;
}

/// QH endpoint capabilities constants
pub mod qh_ep_caps {
    /// Interrupt Schedule Mask shift
    pub const SMASK_SHIFT: u32 = 0;
    /// Split Completion Mask shift
    pub const CMASK_SHIFT: u32 = 8;
    /// Hub Address shift
    pub const HUBADDR_SHIFT: u32 = 16;
    /// Port Number shift
    pub const PORTNUM_SHIFT: u32 = 23;
    /// High-Bandwidth Pipe Multiplier shift
    pub const MULT_SHIFT: u32 = 30;
}

/// qTD token constants (status bits are in [`TokenStatus`])
pub mod qtd_token {
    /// PID code shift
    pub const PID_SHIFT: u32 = 8;
    /// Error Counter shift
    pub const CERR_SHIFT: u32 = 10;
    /// Current Page shift
    pub const CPAGE_SHIFT: u32 = 12;
    /// Interrupt On Complete
    pub const IOC: u32 = 1 << 15;
    /// Total Bytes to Transfer shift
    pub const BYTES_SHIFT: u32 = 16;
    /// Total Bytes to Transfer mask (unshifted)
    pub const BYTES_MASK: u32 = 0x7FFF;
    /// Data Toggle
    pub const TOGGLE: u32 = 1 << 31;
}

// ============================================================================
// Device Queue Head (dQH) Constants
// ============================================================================

/// dQH endpoint capabilities constants
pub mod dqh_caps {
    /// Interrupt On Setup
    pub const IOS: u32 = 1 << 15;
    /// Maximum Packet Length shift
    pub const MPL_SHIFT: u32 = 16;
    /// Maximum Packet Length mask (unshifted)
    pub const MPL_MASK: u32 = 0x7FF;
    /// Zero Length Termination disable
    pub const ZLT: u32 = 1 << 29;
    /// Mult shift
    pub const MULT_SHIFT: u32 = 30;
}

/// dTD token constants (status bits are in [`TokenStatus`])
pub mod dtd_token {
    /// Multiplier override shift
    pub const MULTO_SHIFT: u32 = 10;
    /// Interrupt On Complete
    pub const IOC: u32 = 1 << 15;
    /// Total Bytes shift
    pub const BYTES_SHIFT: u32 = 16;
    /// Total Bytes mask (unshifted)
    pub const BYTES_MASK: u32 = 0x7FFF;
}

// ============================================================================
// Host Data Structures
// ============================================================================

/// qTD words, also embedded in a queue head as its transfer overlay
#[repr(C)]
#[derive(Default)]
pub struct TransferOverlay {
    /// Next qTD Pointer
    pub next: AtomicU32,
    /// Alternate Next qTD Pointer
    pub alternate_next: AtomicU32,
    /// Token
    pub token: AtomicU32,
    /// Buffer Pointers (5 pages max)
    pub buffer_pages: [AtomicU32; BUFFER_PAGES],
}

impl TransferOverlay {
    fn clear(&self) {
        self.next.store(0, Ordering::Relaxed);
        self.alternate_next.store(0, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        for page in &self.buffer_pages {
            page.store(0, Ordering::Relaxed);
        }
    }

    /// Status bits of the token
    pub fn status(&self) -> TokenStatus {
        TokenStatus::of(self.token.load(Ordering::Acquire))
    }

    /// Controller still owns the descriptor
    pub fn is_active(&self) -> bool {
        self.status().contains(TokenStatus::ACTIVE)
    }

    /// Bytes not yet transferred
    pub fn remaining_bytes(&self) -> u32 {
        (self.token.load(Ordering::Acquire) >> qtd_token::BYTES_SHIFT) & qtd_token::BYTES_MASK
    }

    /// The next pointer is a terminate link
    pub fn next_is_terminate(&self) -> bool {
        self.next.load(Ordering::Acquire) & TERMINATE != 0
    }
}

/// Queue element transfer descriptor (32 bytes, 32-byte aligned)
#[repr(C, align(32))]
#[derive(Default)]
pub struct TransferDescriptor {
    pub hw: TransferOverlay,
}

impl core::ops::Deref for TransferDescriptor {
    type Target = TransferOverlay;

    fn deref(&self) -> &TransferOverlay {
        &self.hw
    }
}

/// Host queue head (48 bytes, 64-byte aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct QueueHead {
    /// Horizontal Link Pointer
    pub horizontal: AtomicU32,
    /// Endpoint Characteristics
    pub characteristics: AtomicU32,
    /// Endpoint Capabilities
    pub capabilities: AtomicU32,
    /// Current qTD Pointer
    pub current: AtomicU32,
    /// Transfer Overlay
    pub overlay: TransferOverlay,
}

impl QueueHead {
    /// Address with the QH type bits, for use in a horizontal link
    pub fn link_to(&self) -> u32 {
        dma_address(self) | qh_link::TYPE_QH
    }

    /// Horizontal link address without type/terminate bits
    pub fn next_address(&self) -> u32 {
        self.horizontal.load(Ordering::Acquire) & qh_link::ADDR_MASK
    }

    /// Device address programmed in the characteristics word
    pub fn device_address(&self) -> u8 {
        (self.characteristics.load(Ordering::Relaxed) & qh_ep_chars::DEVADDR_MASK) as u8
    }

    /// Endpoint number programmed in the characteristics word
    pub fn endpoint_number(&self) -> u8 {
        ((self.characteristics.load(Ordering::Relaxed) >> qh_ep_chars::ENDPT_SHIFT) & 0xF) as u8
    }

    /// Maximum packet size programmed in the characteristics word
    pub fn max_packet_size(&self) -> u16 {
        ((self.characteristics.load(Ordering::Relaxed) >> qh_ep_chars::MAXPKT_SHIFT)
            & qh_ep_chars::MAXPKT_MASK) as u16
    }
}

// ============================================================================
// Device Data Structures
// ============================================================================

/// Device transfer descriptor (32 bytes, 32-byte aligned)
#[repr(C, align(32))]
#[derive(Default)]
pub struct DeviceTransferDescriptor {
    /// Next dTD Pointer
    pub next: AtomicU32,
    /// Token (status, IOC, total bytes)
    pub token: AtomicU32,
    /// Buffer Pointers
    pub buffer_pages: [AtomicU32; BUFFER_PAGES],
    _reserved: AtomicU32,
}

impl DeviceTransferDescriptor {
    /// Status bits of the token
    pub fn status(&self) -> TokenStatus {
        TokenStatus::of(self.token.load(Ordering::Acquire))
    }

    /// Bytes not yet transferred
    pub fn remaining_bytes(&self) -> u32 {
        (self.token.load(Ordering::Acquire) >> dtd_token::BYTES_SHIFT) & dtd_token::BYTES_MASK
    }
}

/// Device queue head (64 bytes, 64-byte aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct DeviceQueueHead {
    /// Endpoint Capabilities/Characteristics
    pub capabilities: AtomicU32,
    /// Current dTD Pointer
    pub current: AtomicU32,
    /// Next dTD Pointer (overlay)
    pub next: AtomicU32,
    /// Token (overlay)
    pub token: AtomicU32,
    /// Buffer Pointers (overlay)
    pub buffer_pages: [AtomicU32; BUFFER_PAGES],
    _reserved0: AtomicU32,
    /// Setup packet buffer
    pub setup: [AtomicU32; 2],
    _reserved1: [AtomicU32; 4],
}

impl DeviceQueueHead {
    /// Copy out the latched SETUP packet
    pub fn setup_bytes(&self) -> [u8; 8] {
        let low = self.setup[0].load(Ordering::Acquire).to_le_bytes();
        let high = self.setup[1].load(Ordering::Acquire).to_le_bytes();
        [
            low[0], low[1], low[2], low[3], high[0], high[1], high[2], high[3],
        ]
    }

    /// Maximum packet size from the capabilities word
    pub fn max_packet_size(&self) -> u16 {
        ((self.capabilities.load(Ordering::Relaxed) >> dqh_caps::MPL_SHIFT) & dqh_caps::MPL_MASK)
            as u16
    }
}

/// Endpoint list handed to ENDPOINTLISTADDR (2 KiB aligned)
#[repr(C, align(2048))]
pub struct DeviceQueueHeadList {
    pub heads: [DeviceQueueHead; USB_TOTAL_QUEUE_HEADS],
}

impl Default for DeviceQueueHeadList {
    fn default() -> Self {
        Self {
            heads: core::array::from_fn(|_| DeviceQueueHead::default()),
        }
    }
}

const _: () = {
    assert!(core::mem::size_of::<TransferDescriptor>() == 32);
    assert!(core::mem::size_of::<QueueHead>() == 64);
    assert!(core::mem::size_of::<DeviceTransferDescriptor>() == 32);
    assert!(core::mem::size_of::<DeviceQueueHead>() == 64);
    assert!(core::mem::offset_of!(QueueHead, overlay) == 16);
    assert!(core::mem::offset_of!(DeviceQueueHead, setup) == 40);
};

// ============================================================================
// Pool Entries
// ============================================================================

/// Descriptor that can live in a [`super::pool::DescriptorPool`]
pub trait PoolEntry: Default {
    /// Return the entry to its freshly-allocated state
    fn reset(&self);
}

impl PoolEntry for TransferDescriptor {
    fn reset(&self) {
        self.hw.clear();
    }
}

impl PoolEntry for QueueHead {
    fn reset(&self) {
        self.horizontal.store(qh_link::TERMINATE, Ordering::Relaxed);
        self.characteristics.store(0, Ordering::Relaxed);
        self.capabilities.store(0, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        self.overlay.clear();
    }
}

impl PoolEntry for DeviceTransferDescriptor {
    fn reset(&self) {
        self.next.store(TERMINATE, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        for page in &self.buffer_pages {
            page.store(0, Ordering::Relaxed);
        }
    }
}
