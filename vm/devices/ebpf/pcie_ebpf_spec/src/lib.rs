// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions for the eBPF offload PCI device: its PCI identity, the layout
//! of its single memory BAR, the command register file, and the opcode table.
//!
//! The BAR is 16 MiB. The device's RAM spans the whole BAR, and the command
//! register file (the "I/O area") shadows the first MiB of it. All offsets in
//! this crate are relative to the start of the BAR.
//!
//! ```text
//! 0x000000  I/O area: command registers (1 MiB)
//! 0x100000  code segment length (u32)
//! 0x100004  data segment length (u32)
//! 0x100100  code segment
//! 0x200000  return code (u64; byte 4 is shared with the finished flag)
//! 0x200004  finished flag (u8)
//! 0x200008  register snapshot (16 x u64)
//! 0x400000  data segment
//! 0x800000  peer-to-peer staging area (to the end of the BAR)
//! ```

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use thiserror::Error;

/// One mebibyte.
pub const MIB: u32 = 1024 * 1024;

/// PCI vendor ID (Eideticom).
pub const VENDOR_ID: u16 = 0x1de5;
/// PCI device ID.
pub const DEVICE_ID: u16 = 0x3000;
/// PCI revision ID.
pub const REVISION_ID: u8 = 0x10;
/// PCI base class: "device does not fit any defined class".
pub const CLASS_CODE_OTHER: u8 = 0xff;

/// The index of the device's memory BAR.
pub const BAR_INDEX: u8 = 4;
/// The length of the memory BAR.
pub const BAR_LEN: u32 = 16 * MIB;
/// The length of the I/O area at the start of the BAR.
pub const IO_AREA_LEN: u32 = MIB;

/// The natural page size of host DMA buffers.
pub const DMA_PAGE_SIZE: usize = 4096;

/// The number of general-purpose registers in the execution snapshot.
pub const REGISTER_COUNT: usize = 16;

/// The return code reported when a program could not be run.
pub const RETURN_CODE_FAILURE: i64 = -1;

/// Decodes the host-visible return code from the raw 8-byte return-code
/// slot, as read from the BAR.
///
/// Byte 4 of the slot doubles as the finished flag, so only the low 32 bits
/// carry the return code. They are sign-extended.
pub fn return_code_from_slot(slot: u64) -> i64 {
    (slot as u32 as i32).into()
}

/// Value of the finished flag while a program is running.
pub const NOT_FINISHED: u8 = 0;
/// Value of the finished flag once the result block is stable.
pub const FINISHED: u8 = 1;

/// Offsets of the command registers in the I/O area.
pub mod io {
    /// Opcode of the next command (1 byte).
    pub const OPCODE: u32 = 0x0;
    /// Control and status bits (1 byte). See [`Control`](crate::Control).
    pub const CONTROL: u32 = 0x1;
    /// Transfer length in bytes (4 bytes).
    pub const LENGTH: u32 = 0x4;
    /// Destination offset within the target segment (4 bytes). RUN_PROG
    /// reuses it as the start offset within the data segment.
    pub const DEST_OFFSET: u32 = 0x8;
    /// Host-visible source address (8 bytes, or its low half as 4 bytes).
    pub const SOURCE_ADDRESS: u32 = 0xc;
    /// High half of the source address (4 bytes).
    pub const SOURCE_ADDRESS_HIGH: u32 = 0x10;
}

/// Offsets of the fields and segments in device RAM.
pub mod ram {
    use crate::BAR_LEN;
    use crate::REGISTER_COUNT;

    /// Valid length of the code segment (u32).
    pub const CODE_LEN: u32 = 0x100000;
    /// Valid length of the data segment (u32).
    pub const DATA_LEN: u32 = 0x100004;
    /// End of the segment metadata block.
    pub const METADATA_END: u32 = 0x100100;
    /// Start of the code segment.
    pub const CODE: u32 = 0x100100;
    /// Program return code (u64).
    pub const RETURN_CODE: u32 = 0x200000;
    /// Finished flag (u8), set once the result block is stable.
    pub const FINISHED: u32 = 0x200004;
    /// Register snapshot, [`REGISTER_COUNT`] native-endian u64 values.
    pub const REGISTERS: u32 = 0x200008;
    /// End of the execution result block.
    pub const RESULT_END: u32 = REGISTERS + (REGISTER_COUNT * 8) as u32;
    /// Start of the data segment.
    pub const DATA: u32 = 0x400000;
    /// Start of the peer-to-peer staging area.
    pub const STAGING: u32 = 0x800000;

    /// Capacity of the code segment.
    pub const CODE_CAPACITY: u32 = RETURN_CODE - CODE;
    /// Capacity of the data segment.
    pub const DATA_CAPACITY: u32 = STAGING - DATA;
    /// Capacity of the staging area.
    pub const STAGING_CAPACITY: u32 = BAR_LEN - STAGING;
}

const _: () = assert!(ram::CODE >= ram::METADATA_END);
const _: () = assert!(ram::RESULT_END <= ram::DATA);
const _: () = assert!(ram::CODE_LEN >= IO_AREA_LEN);

/// Command opcodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Host DMA into the code segment.
    DmaText = 0x00,
    /// Staging area to code segment copy.
    MoveP2pText = 0x01,
    /// Host DMA into the data segment.
    DmaData = 0x02,
    /// Staging area to data segment copy.
    MoveP2pData = 0x03,
    /// Run the loaded program.
    RunProg = 0x04,
    /// Log the code and data segments on the device side.
    DumpMem = 0xff,
}

/// The opcode register held a value outside the opcode table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("invalid opcode {0:#04x}")]
pub struct InvalidOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let op = match value {
            0x00 => Self::DmaText,
            0x01 => Self::MoveP2pText,
            0x02 => Self::DmaData,
            0x03 => Self::MoveP2pData,
            0x04 => Self::RunProg,
            0xff => Self::DumpMem,
            _ => return Err(InvalidOpcode(value)),
        };
        Ok(op)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

/// The control register.
///
/// The host sets `start` to hand the staged command to the device. Every
/// other bit is owned by the device.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Control {
    /// Written by the host to issue the staged command.
    pub start: bool,
    /// A command is in flight.
    pub busy: bool,
    /// The last transfer chunk landed in device memory.
    pub dma_done: bool,
    /// The last command completed with an error.
    pub error: bool,
    /// The last command gave up waiting for a transfer chunk.
    pub timed_out: bool,
    #[bits(3)]
    reserved: u8,
}

impl Control {
    /// The status bits that describe the outcome of the last command.
    pub const STATUS_MASK: u8 = Self::new()
        .with_dma_done(true)
        .with_error(true)
        .with_timed_out(true)
        .into_bits();
}

/// Hard-coded hardware IDs, as reflected in PCI configuration space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HardwareIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub base_class: u8,
    pub bar_index: u8,
    pub bar_len: u32,
    /// The BAR is prefetchable memory.
    pub prefetchable: bool,
}

/// The identity the device presents on the bus.
pub const HARDWARE_IDS: HardwareIds = HardwareIds {
    vendor_id: VENDOR_ID,
    device_id: DEVICE_ID,
    revision_id: REVISION_ID,
    base_class: CLASS_CODE_OTHER,
    bar_index: BAR_INDEX,
    bar_len: BAR_LEN,
    prefetchable: true,
};
