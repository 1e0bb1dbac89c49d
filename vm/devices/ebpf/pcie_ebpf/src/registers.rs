// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The register file: the command registers in the I/O area, plus the
//! host-visible fields of device RAM.
//!
//! Every access is decoded against an explicit field table before it touches
//! any state. The control register is the linearization point: a write with
//! the `start` bit hands the staged fields to the dispatcher as one
//! [`Command`], and until that command completes every further write is
//! rejected.

use crate::dispatch::Command;
use crate::dispatch::DispatchState;
use crate::error::CommandError;
use crate::error::CommandStatus;
use crate::memory::RegionKind;
use crate::memory::find_region;
use crate::spec;
use crate::spec::Control;
use crate::spec::io;
use crate::spec::ram;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// A rejected register access.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("no register at offset {offset:#x} for a {len}-byte access")]
    InvalidAddress { offset: u64, len: usize },
    #[error("{len}-byte access to {field:?} at offset {offset:#x}")]
    InvalidAccessSize {
        field: Field,
        offset: u64,
        len: usize,
    },
    #[error("a command is in progress")]
    CommandInProgress,
}

/// A named register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Field {
    Opcode,
    Control,
    Length,
    DestOffset,
    /// The full source address, or its low half for 4-byte accesses.
    SourceAddress,
    SourceAddressHigh,
    CodeLength,
    DataLength,
}

struct FieldDef {
    field: Field,
    offset: u32,
    widths: &'static [usize],
}

const FIELDS: [FieldDef; 8] = [
    FieldDef {
        field: Field::Opcode,
        offset: io::OPCODE,
        widths: &[1],
    },
    FieldDef {
        field: Field::Control,
        offset: io::CONTROL,
        widths: &[1],
    },
    FieldDef {
        field: Field::Length,
        offset: io::LENGTH,
        widths: &[4],
    },
    FieldDef {
        field: Field::DestOffset,
        offset: io::DEST_OFFSET,
        widths: &[4],
    },
    FieldDef {
        field: Field::SourceAddress,
        offset: io::SOURCE_ADDRESS,
        widths: &[4, 8],
    },
    FieldDef {
        field: Field::SourceAddressHigh,
        offset: io::SOURCE_ADDRESS_HIGH,
        widths: &[4],
    },
    FieldDef {
        field: Field::CodeLength,
        offset: ram::CODE_LEN,
        widths: &[4],
    },
    FieldDef {
        field: Field::DataLength,
        offset: ram::DATA_LEN,
        widths: &[4],
    },
];

/// A decoded BAR access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// A command register.
    Register(Field),
    /// Raw device RAM within one region.
    Ram {
        kind: RegionKind,
        range: Range<usize>,
    },
}

/// Decodes an access of `len` bytes at BAR offset `offset`.
///
/// The segment length words and the staging area are the only writable RAM;
/// everything else in RAM is read-only to the host.
pub fn decode(offset: u64, len: usize, write: bool) -> Result<Access, RegisterError> {
    let is_register = offset < spec::IO_AREA_LEN.into();
    let mut length_word = false;
    if let Some(def) = FIELDS.iter().find(|def| u64::from(def.offset) == offset) {
        if def.widths.contains(&len) {
            if is_register {
                return Ok(Access::Register(def.field));
            }
            length_word = true;
        } else if is_register || write {
            return Err(RegisterError::InvalidAccessSize {
                field: def.field,
                offset,
                len,
            });
        }
    }

    match find_region(offset, len) {
        Some(region) if region.kind == RegionKind::IoArea => {
            Err(RegisterError::InvalidAddress { offset, len })
        }
        Some(region) if !write || length_word || region.kind == RegionKind::Staging => {
            Ok(Access::Ram {
                kind: region.kind,
                range: offset as usize..offset as usize + len,
            })
        }
        _ => Err(RegisterError::InvalidAddress { offset, len }),
    }
}

/// The control register.
///
/// Kept outside the register lock so that host polls never wait behind a
/// running command.
#[derive(Debug, Default)]
pub struct ControlRegister(AtomicU8);

impl ControlRegister {
    /// Returns the current control bits.
    pub fn get(&self) -> Control {
        self.0.load(Ordering::Acquire).into()
    }

    /// Sets `bits`.
    pub fn set(&self, bits: Control) {
        self.0.fetch_or(bits.into(), Ordering::Release);
    }

    /// Clears `bits`.
    pub fn clear(&self, bits: Control) {
        self.0.fetch_and(!u8::from(bits), Ordering::Release);
    }

    fn store(&self, value: Control) {
        self.0.store(value.into(), Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct RegisterState {
    staged: Command,
    dispatch: DispatchState,
}

/// The device's command registers.
#[derive(Debug, Default)]
pub struct RegisterFile {
    control: ControlRegister,
    state: Mutex<RegisterState>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> &ControlRegister {
        &self.control
    }

    /// The dispatcher's current state.
    pub fn state(&self) -> DispatchState {
        self.state.lock().dispatch
    }

    /// The command fields as currently staged.
    pub fn staged(&self) -> Command {
        self.state.lock().staged
    }

    /// Runs `f` if no command is in flight, holding off any strobe until it
    /// returns.
    pub fn with_idle<R>(&self, f: impl FnOnce() -> R) -> Result<R, RegisterError> {
        let state = self.state.lock();
        if state.dispatch.is_busy() {
            return Err(RegisterError::CommandInProgress);
        }
        let r = f();
        drop(state);
        Ok(r)
    }

    /// Reads a register. `data` must be a valid width for `field`.
    pub(crate) fn read(&self, field: Field, data: &mut [u8]) {
        let value = if field == Field::Control {
            u8::from(self.control.get()).into()
        } else {
            let staged = self.state.lock().staged;
            match field {
                Field::Opcode => staged.opcode.into(),
                Field::Length => staged.length.into(),
                Field::DestOffset => staged.dest_offset.into(),
                Field::SourceAddress => staged.source_address,
                Field::SourceAddressHigh => staged.source_address >> 32,
                Field::Control | Field::CodeLength | Field::DataLength => {
                    unreachable!("not an I/O register: {field:?}")
                }
            }
        };
        fill(data, value);
    }

    /// Writes a register. `data` must be a valid width for `field`.
    ///
    /// Returns the command to run if this write was a strobe.
    pub(crate) fn write(
        &self,
        field: Field,
        data: &[u8],
    ) -> Result<Option<Command>, RegisterError> {
        let value = value_of(data);
        let mut state = self.state.lock();
        if state.dispatch.is_busy() {
            tracing::warn!(?field, value, "register write while a command is in progress");
            return Err(RegisterError::CommandInProgress);
        }
        let staged = &mut state.staged;
        match field {
            Field::Opcode => staged.opcode = value as u8,
            Field::Length => staged.length = value as u32,
            Field::DestOffset => staged.dest_offset = value as u32,
            Field::SourceAddress => {
                staged.source_address = if data.len() == 8 {
                    value
                } else {
                    (staged.source_address & !u64::from(u32::MAX)) | value
                };
            }
            Field::SourceAddressHigh => {
                staged.source_address =
                    (staged.source_address & u64::from(u32::MAX)) | (value << 32);
            }
            Field::Control => {
                if Control::from(value as u8).start() {
                    let command = state.staged;
                    state.dispatch = DispatchState::Issued;
                    self.control.store(Control::new().with_busy(true));
                    tracing::debug!(?command, "command issued");
                    return Ok(Some(command));
                }
                // The host has observed the previous outcome.
                self.control.clear(Control::from(Control::STATUS_MASK));
                state.dispatch = DispatchState::Idle;
            }
            Field::CodeLength | Field::DataLength => {
                unreachable!("not an I/O register: {field:?}")
            }
        }
        Ok(None)
    }

    pub(crate) fn begin_running(&self) {
        self.state.lock().dispatch = DispatchState::Running;
    }

    /// Records the outcome of the in-flight command and releases the device
    /// for the next one.
    pub(crate) fn complete(&self, result: &Result<(), CommandError>) -> DispatchState {
        let mut state = self.state.lock();
        let (bits, next) = match result {
            Ok(()) => (
                Control::new(),
                DispatchState::Completed(CommandStatus::Success),
            ),
            Err(CommandError::Timeout { .. }) => (
                Control::new().with_error(true).with_timed_out(true),
                DispatchState::TimedOut,
            ),
            Err(err) => (
                Control::new().with_error(true),
                DispatchState::Completed(err.status()),
            ),
        };
        state.dispatch = next;
        self.control.set(bits);
        // Clearing busy publishes everything above.
        self.control.clear(Control::new().with_busy(true));
        next
    }
}

fn value_of(data: &[u8]) -> u64 {
    match *data {
        [a] => a.into(),
        [a, b, c, d] => u32::from_ne_bytes([a, b, c, d]).into(),
        [a, b, c, d, e, f, g, h] => u64::from_ne_bytes([a, b, c, d, e, f, g, h]),
        _ => unreachable!("unvalidated access width {}", data.len()),
    }
}

fn fill(data: &mut [u8], value: u64) {
    match data.len() {
        1 => data[0] = value as u8,
        4 => data.copy_from_slice(&(value as u32).to_ne_bytes()),
        8 => data.copy_from_slice(&value.to_ne_bytes()),
        n => unreachable!("unvalidated access width {n}"),
    }
}
