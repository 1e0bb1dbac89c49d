// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command dispatcher.

use crate::dump::dump_memory;
use crate::error::CommandError;
use crate::error::CommandStatus;
use crate::executor::ExecutionCoordinator;
use crate::executor::LoadedProgram;
use crate::memory::DeviceRam;
use crate::memory::RegionKind;
use crate::memory::SegmentKind;
use crate::registers::RegisterFile;
use crate::spec;
use crate::spec::Opcode;
use crate::transfer::HostMemory;
use crate::transfer::TransferEngine;
use parking_lot::Mutex;

/// The command fields, as staged in the I/O area.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub length: u32,
    pub dest_offset: u32,
    pub source_address: u64,
}

impl Command {
    /// Decodes the command into the operation it names.
    pub fn decode(&self) -> Result<Operation, CommandError> {
        let op = match Opcode::try_from(self.opcode)? {
            Opcode::DmaText => self.dma(SegmentKind::Code),
            Opcode::DmaData => self.dma(SegmentKind::Data),
            Opcode::MoveP2pText => self.move_p2p(SegmentKind::Code),
            Opcode::MoveP2pData => self.move_p2p(SegmentKind::Data),
            Opcode::RunProg => Operation::RunProgram {
                data_offset: self.dest_offset,
            },
            Opcode::DumpMem => Operation::DumpMemory,
        };
        Ok(op)
    }

    fn dma(&self, target: SegmentKind) -> Operation {
        Operation::Dma {
            target,
            source: self.source_address,
            length: self.length,
            dest_offset: self.dest_offset,
        }
    }

    fn move_p2p(&self, target: SegmentKind) -> Operation {
        Operation::MoveP2p {
            target,
            length: self.length,
            dest_offset: self.dest_offset,
        }
    }
}

/// A decoded command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Host DMA into a segment.
    Dma {
        target: SegmentKind,
        source: u64,
        length: u32,
        dest_offset: u32,
    },
    /// Copy from the staging area into a segment.
    MoveP2p {
        target: SegmentKind,
        length: u32,
        dest_offset: u32,
    },
    /// Run the loaded program, with its input starting at `data_offset`
    /// into the data segment.
    RunProgram { data_offset: u32 },
    /// Log both segments.
    DumpMemory,
}

impl Operation {
    /// Checks the operands against the region map.
    ///
    /// Segment metadata is checked separately, before the command runs.
    pub fn validate(&self) -> Result<(), CommandError> {
        match *self {
            Operation::Dma {
                target,
                length,
                dest_offset,
                ..
            } => {
                target.window(dest_offset, length)?;
            }
            Operation::MoveP2p {
                target,
                length,
                dest_offset,
            } => {
                if length > spec::ram::STAGING_CAPACITY {
                    return Err(CommandError::OutOfBounds {
                        region: RegionKind::Staging,
                        offset: 0,
                        len: length,
                        capacity: spec::ram::STAGING_CAPACITY,
                    });
                }
                target.window(dest_offset, length)?;
            }
            Operation::RunProgram { .. } | Operation::DumpMemory => {}
        }
        Ok(())
    }
}

/// The dispatcher's state.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for a strobe.
    #[default]
    Idle,
    /// A command was strobed but has not been picked up yet.
    Issued,
    /// A command is being processed.
    Running,
    /// The last command finished with the given status.
    Completed(CommandStatus),
    /// The last command gave up waiting for a transfer chunk.
    TimedOut,
}

impl DispatchState {
    /// Returns true while a command is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, DispatchState::Issued | DispatchState::Running)
    }
}

/// A command whose operands passed [`Dispatcher::prepare`].
#[derive(Debug)]
pub(crate) enum Prepared {
    /// A program run, with its segments already checked and copied out.
    Run(LoadedProgram),
    Operation(Operation),
}

/// Runs commands against device memory, one at a time.
pub struct Dispatcher {
    transfer: TransferEngine,
    coordinator: ExecutionCoordinator,
    host: Box<dyn HostMemory>,
    track_segment_lengths: bool,
}

impl Dispatcher {
    pub fn new(
        transfer: TransferEngine,
        coordinator: ExecutionCoordinator,
        host: Box<dyn HostMemory>,
        track_segment_lengths: bool,
    ) -> Self {
        Self {
            transfer,
            coordinator,
            host,
            track_segment_lengths,
        }
    }

    /// Runs an issued command to completion and publishes the outcome in
    /// the register file.
    pub fn dispatch(
        &mut self,
        command: &Command,
        registers: &RegisterFile,
        ram: &Mutex<DeviceRam>,
    ) -> DispatchState {
        let result = self.run(command, registers, ram);
        if let Err(err) = &result {
            tracing::warn!(
                opcode = command.opcode,
                status = ?err.status(),
                error = err as &dyn std::error::Error,
                "command failed"
            );
        }
        registers.complete(&result)
    }

    fn run(
        &mut self,
        command: &Command,
        registers: &RegisterFile,
        ram: &Mutex<DeviceRam>,
    ) -> Result<(), CommandError> {
        let prepared = self.prepare(command, ram)?;
        registers.begin_running();
        tracing::info!("processing command");

        match prepared {
            Prepared::Run(loaded) => {
                self.coordinator.execute(ram, loaded)?;
            }
            Prepared::Operation(Operation::Dma {
                target,
                source,
                length,
                dest_offset,
            }) => {
                self.transfer.dma(
                    self.host.as_ref(),
                    ram,
                    registers.control(),
                    target,
                    source,
                    length,
                    dest_offset,
                )?;
                self.update_segment_len(ram, target, length, dest_offset);
            }
            Prepared::Operation(Operation::MoveP2p {
                target,
                length,
                dest_offset,
            }) => {
                self.transfer.copy_from_staging(
                    ram,
                    registers.control(),
                    target,
                    length,
                    dest_offset,
                )?;
                self.update_segment_len(ram, target, length, dest_offset);
            }
            Prepared::Operation(Operation::RunProgram { data_offset }) => {
                self.coordinator.run_program(ram, data_offset)?;
            }
            Prepared::Operation(Operation::DumpMemory) => {
                dump_memory(&ram.lock())?;
            }
        }
        Ok(())
    }

    /// Decodes the command and checks all of its operands, including the
    /// segment metadata a run or dump depends on.
    ///
    /// A command that fails here completes without entering
    /// [`DispatchState::Running`]. A rejected run still publishes the failure
    /// sentinel.
    pub(crate) fn prepare(
        &self,
        command: &Command,
        ram: &Mutex<DeviceRam>,
    ) -> Result<Prepared, CommandError> {
        let op = command.decode()?;
        op.validate()?;
        let prepared = match op {
            Operation::RunProgram { data_offset } => {
                Prepared::Run(self.coordinator.load(ram, data_offset)?)
            }
            Operation::DumpMemory => {
                let ram = ram.lock();
                ram.segment(SegmentKind::Code)?;
                ram.segment(SegmentKind::Data)?;
                Prepared::Operation(op)
            }
            Operation::Dma { .. } | Operation::MoveP2p { .. } => Prepared::Operation(op),
        };
        Ok(prepared)
    }

    /// A load at offset 0 replaces the segment length; a load anywhere else
    /// extends it.
    fn update_segment_len(
        &self,
        ram: &Mutex<DeviceRam>,
        target: SegmentKind,
        length: u32,
        dest_offset: u32,
    ) {
        if !self.track_segment_lengths {
            return;
        }
        let mut ram = ram.lock();
        let len = if dest_offset == 0 {
            length
        } else {
            ram.segment_len(target).saturating_add(length)
        };
        ram.set_segment_len(target, len);
        tracing::debug!(segment = %target, len, "segment length updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_opcodes() {
        let command = Command {
            opcode: 0x01,
            length: 8,
            dest_offset: 4,
            source_address: 0xdead_0000,
        };
        assert_eq!(
            command.decode().unwrap(),
            Operation::MoveP2p {
                target: SegmentKind::Code,
                length: 8,
                dest_offset: 4
            }
        );
        let run = Command {
            opcode: 0x04,
            ..command
        };
        assert_eq!(
            run.decode().unwrap(),
            Operation::RunProgram { data_offset: 4 }
        );
        for opcode in [0x05, 0x42, 0xfe] {
            let err = Command { opcode, ..command }.decode().unwrap_err();
            assert_eq!(err.status(), CommandStatus::InvalidOpcode);
        }
    }

    #[test]
    fn validate_bounds() {
        let op = Operation::Dma {
            target: SegmentKind::Data,
            source: 0,
            length: spec::ram::DATA_CAPACITY,
            dest_offset: 0,
        };
        assert!(op.validate().is_ok());
        let op = Operation::Dma {
            target: SegmentKind::Data,
            source: 0,
            length: spec::ram::DATA_CAPACITY,
            dest_offset: 1,
        };
        assert_eq!(op.validate().unwrap_err().status(), CommandStatus::OutOfBounds);

        let op = Operation::MoveP2p {
            target: SegmentKind::Data,
            length: spec::ram::STAGING_CAPACITY + 1,
            dest_offset: 0,
        };
        assert_eq!(op.validate().unwrap_err().status(), CommandStatus::OutOfBounds);
    }

    #[test]
    fn busy_states() {
        assert!(!DispatchState::Idle.is_busy());
        assert!(DispatchState::Issued.is_busy());
        assert!(DispatchState::Running.is_busy());
        assert!(!DispatchState::TimedOut.is_busy());
        assert!(!DispatchState::Completed(CommandStatus::Success).is_busy());
    }
}
