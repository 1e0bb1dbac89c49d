// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Issuing commands and collecting results.

use crate::registers::Bar;
use crate::registers::BarAccessError;
use crate::registers::DeviceRegisterIo;
use pcie_ebpf_spec::Control;
use pcie_ebpf_spec::Opcode;
use pcie_ebpf_spec::REGISTER_COUNT;
use poll_budget::PollBudget;
use poll_budget::PollTimeout;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device register access failed")]
    Access(#[from] BarAccessError),
    #[error("device is busy with another command")]
    DeviceBusy,
    #[error("timed out waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        #[source]
        source: PollTimeout,
    },
    #[error("device reported an error for {opcode:?}")]
    CommandFailed { opcode: Opcode },
    #[error("device timed out a transfer for {opcode:?}")]
    CommandTimedOut { opcode: Opcode },
}

/// The result block of a finished program run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProgramResult {
    pub return_code: i64,
    pub registers: [u64; REGISTER_COUNT],
    /// The device set the `error` control bit for the run.
    pub device_error: bool,
}

impl ProgramResult {
    /// Returns true if the device could not run the program, or the
    /// interpreter failed.
    ///
    /// A failed run also carries the `-1` failure return code,
    /// but so does a program that returns `0xffff_ffff`. Only the `error`
    /// bit tells the two apart.
    pub fn is_failure(&self) -> bool {
        self.device_error
    }
}

/// A client for one eBPF offload device.
///
/// Commands are issued one at a time: each call stages the command
/// registers, strobes the control register, and polls until the device
/// releases it. There are no interrupts, so every wait is bounded by the
/// client's [`PollBudget`].
pub struct EbpfOffload<T> {
    bar: Bar<T>,
    poll: PollBudget,
}

impl<T: DeviceRegisterIo> EbpfOffload<T> {
    pub fn new(bar: T, poll: PollBudget) -> Self {
        Self {
            bar: Bar(bar),
            poll,
        }
    }

    /// Direct register access.
    pub fn bar(&self) -> &Bar<T> {
        &self.bar
    }

    /// Sets the valid lengths of the code and data segments.
    pub fn set_segment_lengths(&self, code: u32, data: u32) -> Result<(), DriverError> {
        self.bar.set_code_len(code)?;
        self.bar.set_data_len(data)?;
        Ok(())
    }

    /// DMAs program code from host address `source`.
    pub fn load_text_dma(
        &self,
        source: u64,
        length: u32,
        dest_offset: u32,
    ) -> Result<(), DriverError> {
        self.execute(Opcode::DmaText, length, dest_offset, source)
    }

    /// Copies program code from the device's staging area.
    pub fn load_text_p2p(&self, length: u32, dest_offset: u32) -> Result<(), DriverError> {
        self.execute(Opcode::MoveP2pText, length, dest_offset, 0)
    }

    /// DMAs program input from host address `source`.
    pub fn load_data_dma(
        &self,
        source: u64,
        length: u32,
        dest_offset: u32,
    ) -> Result<(), DriverError> {
        self.execute(Opcode::DmaData, length, dest_offset, source)
    }

    /// Copies program input from the device's staging area.
    pub fn load_data_p2p(&self, length: u32, dest_offset: u32) -> Result<(), DriverError> {
        self.execute(Opcode::MoveP2pData, length, dest_offset, 0)
    }

    /// Asks the device to log its code and data segments.
    pub fn dump_memory(&self) -> Result<(), DriverError> {
        self.execute(Opcode::DumpMem, 0, 0, 0)
    }

    /// Runs the loaded program with its input starting `data_offset` bytes
    /// into the data segment, and waits for the result.
    ///
    /// A run the device rejects still produces a result, carrying the
    /// failure return code; see [`ProgramResult::is_failure`].
    pub fn run_program(&self, data_offset: u32) -> Result<ProgramResult, DriverError> {
        self.start(Opcode::RunProg, 0, data_offset, 0)?;
        self.wait("program completion", || self.bar.finished())?;
        let control = self.wait_idle()?;
        let result = ProgramResult {
            return_code: self.bar.return_code()?,
            registers: self.bar.registers()?,
            device_error: control.error(),
        };
        self.bar.set_control(Control::new())?;
        tracing::debug!(
            return_code = result.return_code,
            device_error = result.device_error,
            "program finished"
        );
        Ok(result)
    }

    /// Reads the result block, if the last run has finished.
    ///
    /// The `error` bit is cleared when the command is acknowledged, which
    /// [`run_program`](Self::run_program) does before returning. After that
    /// a failed run shows only through its return code.
    pub fn read_result(&self) -> Result<Option<ProgramResult>, DriverError> {
        if !self.bar.finished()? {
            return Ok(None);
        }
        Ok(Some(ProgramResult {
            return_code: self.bar.return_code()?,
            registers: self.bar.registers()?,
            device_error: self.bar.control()?.error(),
        }))
    }

    fn start(
        &self,
        opcode: Opcode,
        length: u32,
        dest_offset: u32,
        source: u64,
    ) -> Result<(), DriverError> {
        if self.bar.control()?.busy() {
            return Err(DriverError::DeviceBusy);
        }
        self.bar.set_opcode(opcode.into())?;
        self.bar.set_length(length)?;
        self.bar.set_dest_offset(dest_offset)?;
        self.bar.set_source_address(source)?;
        self.bar.set_control(Control::new().with_start(true))?;
        tracing::debug!(?opcode, length, dest_offset, source, "command issued");
        Ok(())
    }

    fn execute(
        &self,
        opcode: Opcode,
        length: u32,
        dest_offset: u32,
        source: u64,
    ) -> Result<(), DriverError> {
        self.start(opcode, length, dest_offset, source)?;
        let control = self.wait_idle()?;
        self.bar.set_control(Control::new())?;
        if control.timed_out() {
            Err(DriverError::CommandTimedOut { opcode })
        } else if control.error() {
            Err(DriverError::CommandFailed { opcode })
        } else {
            Ok(())
        }
    }

    fn wait_idle(&self) -> Result<Control, DriverError> {
        let mut control = Control::new();
        self.wait("command completion", || {
            control = self.bar.control()?;
            Ok(!control.busy())
        })?;
        Ok(control)
    }

    fn wait(
        &self,
        waiting_for: &'static str,
        mut cond: impl FnMut() -> Result<bool, BarAccessError>,
    ) -> Result<(), DriverError> {
        let mut failure = None;
        let r = self.poll.watch(|| match cond() {
            Ok(done) => done,
            Err(err) => {
                failure = Some(err);
                true
            }
        });
        if let Some(err) = failure {
            return Err(err.into());
        }
        r.map_err(|source| DriverError::Timeout {
            waiting_for,
            source,
        })?;
        Ok(())
    }
}
