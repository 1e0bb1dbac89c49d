// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error and status types for command processing.

use crate::executor::InterpreterError;
use crate::memory::RegionKind;
use crate::memory::SegmentKind;
use crate::spec::InvalidOpcode;
use crate::transfer::HostMemoryError;
use poll_budget::PollTimeout;
use thiserror::Error;

/// The outcome of a command, as recorded by the dispatcher.
///
/// The host never sees this value directly; it observes the `error` and
/// `timed_out` control bits, and for RUN_PROG the return code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandStatus {
    Success = 0,
    InvalidOpcode = 1,
    OutOfBounds = 2,
    InvalidSegment = 3,
    Timeout = 4,
    TransferFailure = 5,
    ExecutionFailed = 6,
}

/// A segment could not be used as program input.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("code segment is empty")]
    EmptyCode,
    #[error("data offset {offset:#x} is outside the {len:#x}-byte data segment")]
    DataOffset { offset: u32, len: u32 },
    #[error("{kind} segment length {len:#x} exceeds its capacity of {capacity:#x} bytes")]
    Overflow {
        kind: SegmentKind,
        len: u32,
        capacity: u32,
    },
}

/// A command failed. Detected on the device and reported to the host only
/// through register-visible state.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    InvalidOpcode(#[from] InvalidOpcode),
    #[error("{len:#x} bytes at offset {offset:#x} exceed the {region} capacity of {capacity:#x} bytes")]
    OutOfBounds {
        region: RegionKind,
        offset: u32,
        len: u32,
        capacity: u32,
    },
    #[error("invalid segment")]
    InvalidSegment(#[from] SegmentError),
    #[error("transfer chunk {chunk} did not complete")]
    Timeout {
        chunk: usize,
        #[source]
        source: PollTimeout,
    },
    #[error("host transfer failed")]
    TransferFailure(#[from] HostMemoryError),
    #[error("program execution failed")]
    ExecutionFailed(#[from] InterpreterError),
}

impl CommandError {
    /// Returns the status code recorded for this error.
    pub fn status(&self) -> CommandStatus {
        match self {
            CommandError::InvalidOpcode(_) => CommandStatus::InvalidOpcode,
            CommandError::OutOfBounds { .. } => CommandStatus::OutOfBounds,
            CommandError::InvalidSegment(_) => CommandStatus::InvalidSegment,
            CommandError::Timeout { .. } => CommandStatus::Timeout,
            CommandError::TransferFailure(_) => CommandStatus::TransferFailure,
            CommandError::ExecutionFailed(_) => CommandStatus::ExecutionFailed,
        }
    }
}
