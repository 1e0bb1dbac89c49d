// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side driver for the eBPF offload device.
//!
//! The driver talks to the device only through its memory BAR, via a
//! [`DeviceRegisterIo`] mapping: it loads code and data (by DMA from host
//! memory or from the device's staging area), runs the program, and polls
//! for the result.

#![forbid(unsafe_code)]

mod client;
mod registers;

#[cfg(test)]
mod tests;

pub use client::DriverError;
pub use client::EbpfOffload;
pub use client::ProgramResult;
pub use registers::Bar;
pub use registers::BarAccessError;
pub use registers::DeviceRegisterIo;
