// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated eBPF offload accelerator.
//!
//! The host stages a command in the register file at the start of the
//! device's memory BAR and strobes the control register. The device then
//! loads program code and input data into its RAM (by DMA from host memory
//! or by copying from its peer-to-peer staging area), runs the program on a
//! pluggable bytecode [`Interpreter`], and publishes the result in a fixed
//! result block. There are no interrupts: the host learns about progress
//! only by polling control bits and the finished flag.
//!
//! See [`pcie_ebpf_spec`] for the BAR layout.

#![forbid(unsafe_code)]

mod device;
mod dispatch;
mod dump;
mod error;
mod executor;
mod memory;
mod registers;
mod transfer;

#[cfg(test)]
mod tests;

pub use pcie_ebpf_spec as spec;

pub use device::DeviceError;
pub use device::PcieEbpfConfig;
pub use device::PcieEbpfDevice;
pub use dispatch::Command;
pub use dispatch::DispatchState;
pub use dispatch::Dispatcher;
pub use dispatch::Operation;
pub use dump::HexDump;
pub use dump::MemoryDump;
pub use dump::dump_memory;
pub use error::CommandError;
pub use error::CommandStatus;
pub use error::SegmentError;
pub use executor::Execution;
pub use executor::ExecutionCoordinator;
pub use executor::Interpreter;
pub use executor::InterpreterError;
pub use executor::LoadedProgram;
pub use executor::Program;
pub use executor::ProgramFormat;
pub use executor::ProgramMemory;
pub use memory::DeviceRam;
pub use memory::ExecutionResult;
pub use memory::REGIONS;
pub use memory::Region;
pub use memory::RegionKind;
pub use memory::Segment;
pub use memory::SegmentKind;
pub use memory::find_region;
pub use registers::Access;
pub use registers::ControlRegister;
pub use registers::Field;
pub use registers::RegisterError;
pub use registers::RegisterFile;
pub use registers::decode;
pub use transfer::HeapHostMemory;
pub use transfer::HostChunk;
pub use transfer::HostMemory;
pub use transfer::HostMemoryError;
pub use transfer::PageChunks;
pub use transfer::TransferEngine;
pub use transfer::page_chunks;
