//! LPC43xx USB controller register definitions using tock-registers
//!
//! The USB0/USB1 blocks are ChipIdea cores: an EHCI operational register
//! set extended with device-mode endpoint registers. Several offsets are
//! shared between modes (PERIODICLISTBASE/DEVICEADDR,
//! ASYNCLISTADDR/ENDPOINTLISTADDR) and USBCMD/USBSTS/PORTSC1 carry
//! mode-specific bits.
//!
//! # References
//! - LPC43xx User Manual (UM10503), chapter 23 "USB0 Host/Device/OTG controller"
//! - EHCI Specification 1.0

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

/// USB0 register block base address
pub const USB0_BASE: usize = 0x4000_6000;
/// USB1 register block base address
pub const USB1_BASE: usize = 0x4000_7000;

// ============================================================================
// Command / Status Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// USB Command (USBCMD) - offset 0x140
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Controller Reset
        RST OFFSET(1) NUMBITS(1) [],
        /// Frame List Size bits 0-1 (host)
        FS0_1 OFFSET(2) NUMBITS(2) [],
        /// Periodic Schedule Enable (host)
        PSE OFFSET(4) NUMBITS(1) [],
        /// Asynchronous Schedule Enable (host)
        ASE OFFSET(5) NUMBITS(1) [],
        /// Interrupt on Async Advance Doorbell (host)
        IAA OFFSET(6) NUMBITS(1) [],
        /// Asynchronous Schedule Park Mode Count (host)
        ASP OFFSET(8) NUMBITS(2) [],
        /// Asynchronous Schedule Park Mode Enable (host)
        ASPE OFFSET(11) NUMBITS(1) [],
        /// Setup Tripwire (device)
        SUTW OFFSET(13) NUMBITS(1) [],
        /// Add dTD Tripwire (device)
        ATDTW OFFSET(14) NUMBITS(1) [],
        /// Frame List Size bit 2 (host)
        FS2 OFFSET(15) NUMBITS(1) [],
        /// Interrupt Threshold Control
        ITC OFFSET(16) NUMBITS(8) []
    ],

    /// USB Status (USBSTS) - offset 0x144, interrupt bits are write-1-to-clear
    pub USBSTS [
        /// USB Interrupt (transfer completion / setup)
        UI OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt
        UEI OFFSET(1) NUMBITS(1) [],
        /// Port Change Detect
        PCI OFFSET(2) NUMBITS(1) [],
        /// Frame List Rollover (host)
        FRI OFFSET(3) NUMBITS(1) [],
        /// System Error
        SEI OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance (host)
        AAI OFFSET(5) NUMBITS(1) [],
        /// USB Reset Received (device)
        URI OFFSET(6) NUMBITS(1) [],
        /// SOF Received
        SRI OFFSET(7) NUMBITS(1) [],
        /// DCSuspend (device)
        SLI OFFSET(8) NUMBITS(1) [],
        /// HCHalted (host)
        HCH OFFSET(12) NUMBITS(1) [],
        /// Reclamation (host)
        RCL OFFSET(13) NUMBITS(1) [],
        /// Periodic Schedule Status (host)
        PS OFFSET(14) NUMBITS(1) [],
        /// Asynchronous Schedule Status (host)
        AS OFFSET(15) NUMBITS(1) [],
        /// NAK Interrupt (device)
        NAKI OFFSET(16) NUMBITS(1) [],
        /// USB Host Asynchronous Interrupt
        UAI OFFSET(18) NUMBITS(1) [],
        /// USB Host Periodic Interrupt
        UPI OFFSET(19) NUMBITS(1) []
    ],

    /// USB Interrupt Enable (USBINTR) - offset 0x148
    pub USBINTR [
        /// USB Interrupt Enable
        UE OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt Enable
        UEE OFFSET(1) NUMBITS(1) [],
        /// Port Change Detect Enable
        PCE OFFSET(2) NUMBITS(1) [],
        /// Frame List Rollover Enable (host)
        FRE OFFSET(3) NUMBITS(1) [],
        /// System Error Enable
        SEE OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance Enable (host)
        AAE OFFSET(5) NUMBITS(1) [],
        /// USB Reset Enable (device)
        URE OFFSET(6) NUMBITS(1) [],
        /// SOF Received Enable
        SRE OFFSET(7) NUMBITS(1) [],
        /// Sleep Enable (device)
        SLE OFFSET(8) NUMBITS(1) [],
        /// NAK Interrupt Enable (device)
        NAKE OFFSET(16) NUMBITS(1) [],
        /// USB Host Asynchronous Interrupt Enable
        UAIE OFFSET(18) NUMBITS(1) [],
        /// USB Host Periodic Interrupt Enable
        UPIA OFFSET(19) NUMBITS(1) []
    ],

    /// Device Address (DEVICEADDR) - offset 0x154, device mode
    pub DEVICEADDR [
        /// Latch USBADR after the next IN status stage
        USBADRA OFFSET(24) NUMBITS(1) [],
        /// Device address
        USBADR OFFSET(25) NUMBITS(7) []
    ]
];

// ============================================================================
// Port / Mode Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Port Status and Control (PORTSC1) - offset 0x184
    pub PORTSC1 [
        /// Current Connect Status
        CCS OFFSET(0) NUMBITS(1) [],
        /// Connect Status Change (host, write 1 to clear)
        CSC OFFSET(1) NUMBITS(1) [],
        /// Port Enabled
        PE OFFSET(2) NUMBITS(1) [],
        /// Port Enable Change (host, write 1 to clear)
        PEC OFFSET(3) NUMBITS(1) [],
        /// Force Port Resume
        FPR OFFSET(6) NUMBITS(1) [],
        /// Suspend
        SUSP OFFSET(7) NUMBITS(1) [],
        /// Port Reset
        PR OFFSET(8) NUMBITS(1) [],
        /// High-Speed Port
        HSP OFFSET(9) NUMBITS(1) [],
        /// Line Status
        LS OFFSET(10) NUMBITS(2) [],
        /// Port Power
        PP OFFSET(12) NUMBITS(1) [],
        /// Port Test Control
        PTC OFFSET(16) NUMBITS(4) [],
        /// PHY Low Power Suspend
        PHCD OFFSET(23) NUMBITS(1) [],
        /// Port Force Full Speed Connect
        PFSC OFFSET(24) NUMBITS(1) [],
        /// Port Speed
        PSPD OFFSET(26) NUMBITS(2) [
            FullSpeed = 0,
            LowSpeed = 1,
            HighSpeed = 2
        ]
    ],

    /// OTG Status and Control (OTGSC) - offset 0x1A4
    pub OTGSC [
        /// VBUS Discharge
        VD OFFSET(0) NUMBITS(1) [],
        /// VBUS Charge
        VC OFFSET(1) NUMBITS(1) [],
        /// OTG Termination (required for device mode on USB0)
        OT OFFSET(3) NUMBITS(1) [],
        /// USB ID
        ID OFFSET(8) NUMBITS(1) []
    ],

    /// USB Mode (USBMODE) - offset 0x1A8
    pub USBMODE [
        /// Controller Mode
        CM OFFSET(0) NUMBITS(2) [
            Idle = 0,
            Device = 2,
            Host = 3
        ],
        /// Endian Select
        ES OFFSET(2) NUMBITS(1) [],
        /// Setup Lockout Mode
        SLOM OFFSET(3) NUMBITS(1) [],
        /// Stream Disable
        SDIS OFFSET(4) NUMBITS(1) [],
        /// VBUS Power Select (host)
        VBPS OFFSET(5) NUMBITS(1) []
    ],

    /// Endpoint Control (ENDPTCTRL0..5) - offset 0x1C0 + 4n
    pub ENDPTCTRL [
        /// RX Endpoint Stall
        RXS OFFSET(0) NUMBITS(1) [],
        /// RX Endpoint Type
        RXT OFFSET(2) NUMBITS(2) [],
        /// RX Data Toggle Inhibit
        RXI OFFSET(5) NUMBITS(1) [],
        /// RX Data Toggle Reset
        RXR OFFSET(6) NUMBITS(1) [],
        /// RX Endpoint Enable
        RXE OFFSET(7) NUMBITS(1) [],
        /// TX Endpoint Stall
        TXS OFFSET(16) NUMBITS(1) [],
        /// TX Endpoint Type
        TXT OFFSET(18) NUMBITS(2) [],
        /// TX Data Toggle Inhibit
        TXI OFFSET(21) NUMBITS(1) [],
        /// TX Data Toggle Reset
        TXR OFFSET(22) NUMBITS(1) [],
        /// TX Endpoint Enable
        TXE OFFSET(23) NUMBITS(1) []
    ]
];

/// Endpoint bit vectors shared by ENDPTNAK, ENDPTNAKEN, ENDPTPRIME,
/// ENDPTFLUSH, ENDPTSTAT and ENDPTCOMPLETE: OUT (receive) endpoints in the
/// low half-word, IN (transmit) endpoints in the high half-word.
pub mod endpoint_bits {
    /// Shift of the receive (OUT) bits
    pub const RX_SHIFT: u32 = 0;
    /// Shift of the transmit (IN) bits
    pub const TX_SHIFT: u32 = 16;
    /// Every implemented endpoint in both directions
    pub const ALL: u32 = 0x003F_003F;
    /// ENDPTSETUPSTAT bits for every endpoint
    pub const ALL_SETUP: u32 = 0x3F;
}

// ============================================================================
// Register Block Memory Map
// ============================================================================

/// USB0/USB1 register block
#[repr(C)]
pub struct UsbRegisterBlock {
    _reserved0: [u32; 64],
    /// Capability register length
    pub caplength: ReadOnly<u32>,
    /// Host controller structural parameters
    pub hcsparams: ReadOnly<u32>,
    /// Host controller capability parameters
    pub hccparams: ReadOnly<u32>,
    _reserved1: [u32; 5],
    /// Device interface version number
    pub dciversion: ReadOnly<u32>,
    /// Device controller parameters
    pub dccparams: ReadOnly<u32>,
    _reserved2: [u32; 6],
    /// USB command
    pub usbcmd: ReadWrite<u32, USBCMD::Register>,
    /// USB status
    pub usbsts: ReadWrite<u32, USBSTS::Register>,
    /// USB interrupt enable
    pub usbintr: ReadWrite<u32, USBINTR::Register>,
    /// Frame index
    pub frindex: ReadWrite<u32>,
    _reserved3: u32,
    /// PERIODICLISTBASE in host mode, DEVICEADDR in device mode
    pub periodiclistbase_deviceaddr: ReadWrite<u32>,
    /// ASYNCLISTADDR in host mode, ENDPOINTLISTADDR in device mode
    pub asynclistaddr_endpointlistaddr: ReadWrite<u32>,
    /// TT control
    pub ttctrl: ReadWrite<u32>,
    /// Burst size
    pub burstsize: ReadWrite<u32>,
    /// Transmit FIFO fill tuning
    pub txfilltuning: ReadWrite<u32>,
    _reserved4: [u32; 2],
    /// ULPI viewport (USB1 only)
    pub ulpiviewport: ReadWrite<u32>,
    /// Length of virtual frame
    pub binterval: ReadWrite<u32>,
    /// Endpoint NAK
    pub endptnak: ReadWrite<u32>,
    /// Endpoint NAK enable
    pub endptnaken: ReadWrite<u32>,
    _reserved5: u32,
    /// Port status and control
    pub portsc1: ReadWrite<u32, PORTSC1::Register>,
    _reserved6: [u32; 7],
    /// OTG status and control
    pub otgsc: ReadWrite<u32, OTGSC::Register>,
    /// USB mode
    pub usbmode: ReadWrite<u32, USBMODE::Register>,
    /// Endpoint setup status
    pub endptsetupstat: ReadWrite<u32>,
    /// Endpoint initialization (prime)
    pub endptprime: ReadWrite<u32>,
    /// Endpoint de-initialization (flush)
    pub endptflush: ReadWrite<u32>,
    /// Endpoint status
    pub endptstat: ReadWrite<u32>,
    /// Endpoint complete
    pub endptcomplete: ReadWrite<u32>,
    /// Endpoint control, one per endpoint number
    pub endptctrl: [ReadWrite<u32, ENDPTCTRL::Register>; 6],
}

const _: () = {
    assert!(core::mem::offset_of!(UsbRegisterBlock, caplength) == 0x100);
    assert!(core::mem::offset_of!(UsbRegisterBlock, dciversion) == 0x120);
    assert!(core::mem::offset_of!(UsbRegisterBlock, usbcmd) == 0x140);
    assert!(core::mem::offset_of!(UsbRegisterBlock, periodiclistbase_deviceaddr) == 0x154);
    assert!(core::mem::offset_of!(UsbRegisterBlock, asynclistaddr_endpointlistaddr) == 0x158);
    assert!(core::mem::offset_of!(UsbRegisterBlock, ulpiviewport) == 0x170);
    assert!(core::mem::offset_of!(UsbRegisterBlock, endptnak) == 0x178);
    assert!(core::mem::offset_of!(UsbRegisterBlock, portsc1) == 0x184);
    assert!(core::mem::offset_of!(UsbRegisterBlock, otgsc) == 0x1A4);
    assert!(core::mem::offset_of!(UsbRegisterBlock, usbmode) == 0x1A8);
    assert!(core::mem::offset_of!(UsbRegisterBlock, endptsetupstat) == 0x1AC);
    assert!(core::mem::offset_of!(UsbRegisterBlock, endptcomplete) == 0x1BC);
    assert!(core::mem::offset_of!(UsbRegisterBlock, endptctrl) == 0x1C0);
    assert!(core::mem::size_of::<UsbRegisterBlock>() == 0x1D8);
};

// ============================================================================
// Register Access
// ============================================================================

/// Registers the controller core touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    /// Device-mode alias of PERIODICLISTBASE
    DeviceAddr,
    PeriodicListBase,
    /// Device-mode alias of ASYNCLISTADDR
    EndpointListAddr,
    AsyncListAddr,
    EndptNak,
    EndptNakEn,
    PortSc1,
    OtgSc,
    UsbMode,
    EndptSetupStat,
    EndptPrime,
    EndptFlush,
    EndptStat,
    EndptComplete,
    EndptCtrl(u8),
}

/// Raw 32-bit access to the controller registers
///
/// The core never holds references into the register block; everything
/// goes through this trait so it can run against real MMIO or a model of
/// the hardware.
pub trait RegisterAccess {
    /// Read a register
    fn read(&self, reg: Register) -> u32;

    /// Write a register
    fn write(&self, reg: Register, value: u32);

    /// Read-modify-write; never use on write-1-to-clear registers
    fn modify(&self, reg: Register, clear: u32, set: u32) {
        let value = self.read(reg);
        self.write(reg, (value & !clear) | set);
    }

    /// Set bits with read-modify-write
    fn set_bits(&self, reg: Register, bits: u32) {
        self.modify(reg, 0, bits);
    }

    /// Clear bits with read-modify-write
    fn clear_bits(&self, reg: Register, bits: u32) {
        self.modify(reg, bits, 0);
    }
}

/// Memory-mapped register block
pub struct MmioRegisters {
    base: usize,
}

// Safety: the register block is device memory accessed only with volatile
// reads and writes; sharing the base address between contexts is sound.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap the register block at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the address of a USB controller register block
    /// (e.g. [`USB0_BASE`]) that stays mapped for the program's lifetime.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn block(&self) -> &UsbRegisterBlock {
        unsafe { &*(self.base as *const UsbRegisterBlock) }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read(&self, reg: Register) -> u32 {
        let b = self.block();
        match reg {
            Register::UsbCmd => b.usbcmd.get(),
            Register::UsbSts => b.usbsts.get(),
            Register::UsbIntr => b.usbintr.get(),
            Register::FrIndex => b.frindex.get(),
            Register::DeviceAddr | Register::PeriodicListBase => {
                b.periodiclistbase_deviceaddr.get()
            }
            Register::EndpointListAddr | Register::AsyncListAddr => {
                b.asynclistaddr_endpointlistaddr.get()
            }
            Register::EndptNak => b.endptnak.get(),
            Register::EndptNakEn => b.endptnaken.get(),
            Register::PortSc1 => b.portsc1.get(),
            Register::OtgSc => b.otgsc.get(),
            Register::UsbMode => b.usbmode.get(),
            Register::EndptSetupStat => b.endptsetupstat.get(),
            Register::EndptPrime => b.endptprime.get(),
            Register::EndptFlush => b.endptflush.get(),
            Register::EndptStat => b.endptstat.get(),
            Register::EndptComplete => b.endptcomplete.get(),
            Register::EndptCtrl(n) => b
                .endptctrl
                .get(n as usize)
                .map(|r| r.get())
                .unwrap_or(0),
        }
    }

    fn write(&self, reg: Register, value: u32) {
        let b = self.block();
        match reg {
            Register::UsbCmd => b.usbcmd.set(value),
            Register::UsbSts => b.usbsts.set(value),
            Register::UsbIntr => b.usbintr.set(value),
            Register::FrIndex => b.frindex.set(value),
            Register::DeviceAddr | Register::PeriodicListBase => {
                b.periodiclistbase_deviceaddr.set(value)
            }
            Register::EndpointListAddr | Register::AsyncListAddr => {
                b.asynclistaddr_endpointlistaddr.set(value)
            }
            Register::EndptNak => b.endptnak.set(value),
            Register::EndptNakEn => b.endptnaken.set(value),
            Register::PortSc1 => b.portsc1.set(value),
            Register::OtgSc => b.otgsc.set(value),
            Register::UsbMode => b.usbmode.set(value),
            Register::EndptSetupStat => b.endptsetupstat.set(value),
            Register::EndptPrime => b.endptprime.set(value),
            Register::EndptFlush => b.endptflush.set(value),
            Register::EndptStat => b.endptstat.set(value),
            Register::EndptComplete => b.endptcomplete.set(value),
            Register::EndptCtrl(n) => {
                if let Some(r) = b.endptctrl.get(n as usize) {
                    r.set(value);
                }
            }
        }
    }
}
