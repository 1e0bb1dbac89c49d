// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device: BAR access from the host, and the worker thread that runs
//! commands.

use crate::dispatch::Command;
use crate::dispatch::DispatchState;
use crate::dispatch::Dispatcher;
use crate::executor::ExecutionCoordinator;
use crate::executor::Interpreter;
use crate::memory::DeviceRam;
use crate::memory::ExecutionResult;
use crate::memory::SegmentKind;
use crate::registers::Access;
use crate::registers::RegisterError;
use crate::registers::RegisterFile;
use crate::registers::decode;
use crate::spec;
use crate::spec::Control;
use crate::spec::HardwareIds;
use crate::spec::Opcode;
use crate::transfer::HostMemory;
use crate::transfer::TransferEngine;
use parking_lot::Condvar;
use parking_lot::Mutex;
use poll_budget::PollBudget;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Device configuration.
#[derive(Debug, Clone)]
pub struct PcieEbpfConfig {
    /// How long to wait for each DMA chunk to land.
    pub chunk_poll: PollBudget,
    /// The host addresses the device can DMA from.
    pub dma_mask: u64,
    /// Update the segment length words on every successful load.
    pub track_segment_lengths: bool,
}

impl Default for PcieEbpfConfig {
    fn default() -> Self {
        Self {
            chunk_poll: PollBudget::new(1000, Duration::from_micros(10)),
            dma_mask: u64::MAX,
            track_segment_lengths: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn the command worker")]
    SpawnWorker(#[source] std::io::Error),
}

#[derive(Default)]
struct WorkQueue {
    pending: Option<Command>,
    stopping: bool,
}

struct Shared {
    registers: RegisterFile,
    ram: Mutex<DeviceRam>,
    work: Mutex<WorkQueue>,
    work_ready: Condvar,
}

impl Shared {
    fn submit(&self, command: Command) {
        self.work.lock().pending = Some(command);
        self.work_ready.notify_one();
    }

    fn next_command(&self) -> Option<Command> {
        let mut work = self.work.lock();
        loop {
            if work.stopping {
                return None;
            }
            if let Some(command) = work.pending.take() {
                return Some(command);
            }
            self.work_ready.wait(&mut work);
        }
    }

    fn run_worker(&self, mut dispatcher: Dispatcher) {
        while let Some(command) = self.next_command() {
            let span = tracing::info_span!(
                "pcie_ebpf_command",
                opcode = command.opcode,
                length = command.length,
                dest_offset = command.dest_offset,
                source_address = command.source_address,
            );
            let _enter = span.enter();
            let state = dispatcher.dispatch(&command, &self.registers, &self.ram);
            tracing::debug!(?state, "command processed");
        }
        tracing::debug!("worker stopped");
    }
}

/// An emulated eBPF offload device.
///
/// The host drives it purely through [`mmio_read`](Self::mmio_read) and
/// [`mmio_write`](Self::mmio_write) on the memory BAR. Commands run on a
/// dedicated worker thread, so the host must poll for completion.
pub struct PcieEbpfDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PcieEbpfDevice {
    /// Creates the device and starts its worker.
    pub fn new(
        config: PcieEbpfConfig,
        host: Box<dyn HostMemory>,
        interpreter: Box<dyn Interpreter>,
    ) -> Result<Self, DeviceError> {
        let dispatcher = Dispatcher::new(
            TransferEngine::new(config.chunk_poll, config.dma_mask),
            ExecutionCoordinator::new(interpreter),
            host,
            config.track_segment_lengths,
        );
        let shared = Arc::new(Shared {
            registers: RegisterFile::new(),
            ram: Mutex::new(DeviceRam::new()),
            work: Mutex::new(WorkQueue::default()),
            work_ready: Condvar::new(),
        });
        let worker = std::thread::Builder::new()
            .name("pcie-ebpf".into())
            .spawn({
                let shared = shared.clone();
                move || shared.run_worker(dispatcher)
            })
            .map_err(DeviceError::SpawnWorker)?;

        tracing::info!(config = ?config, "pcie ebpf device created");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// The identity the device presents on the bus.
    pub fn hardware_ids(&self) -> HardwareIds {
        spec::HARDWARE_IDS
    }

    /// Reads `data.len()` bytes at `offset` into the BAR.
    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) -> Result<(), RegisterError> {
        let access = decode(offset, data.len(), false).inspect_err(|err| {
            tracing::warn!(
                offset,
                len = data.len(),
                error = err as &dyn std::error::Error,
                "rejected mmio read"
            );
        })?;
        match access {
            Access::Register(field) => self.shared.registers.read(field, data),
            Access::Ram { range, .. } => data.copy_from_slice(self.shared.ram.lock().bytes(range)),
        }
        Ok(())
    }

    /// Writes `data` at `offset` into the BAR.
    ///
    /// A write to the control register with `start` set issues the staged
    /// command. While that command is in flight every write fails with
    /// [`RegisterError::CommandInProgress`].
    pub fn mmio_write(&self, offset: u64, data: &[u8]) -> Result<(), RegisterError> {
        let result = self.write_inner(offset, data);
        if let Err(err) = &result {
            tracing::warn!(
                offset,
                len = data.len(),
                error = err as &dyn std::error::Error,
                "rejected mmio write"
            );
        }
        result
    }

    fn write_inner(&self, offset: u64, data: &[u8]) -> Result<(), RegisterError> {
        match decode(offset, data.len(), true)? {
            Access::Register(field) => {
                if let Some(command) = self.shared.registers.write(field, data)? {
                    // Drop the finished flag before the strobe returns, so the
                    // host never polls the previous run's flag.
                    if command.opcode == u8::from(Opcode::RunProg) {
                        self.shared.ram.lock().set_finished(false);
                    }
                    self.shared.submit(command);
                }
            }
            Access::Ram { range, .. } => {
                self.shared.registers.with_idle(|| {
                    self.shared
                        .ram
                        .lock()
                        .bytes_mut(range)
                        .copy_from_slice(data)
                })?;
            }
        }
        Ok(())
    }

    /// Fills the staging area at `offset`, as the peer-to-peer writer does.
    pub fn write_staging(&self, offset: u32, data: &[u8]) -> Result<(), RegisterError> {
        self.mmio_write(u64::from(spec::ram::STAGING) + u64::from(offset), data)
    }

    /// The current control bits.
    pub fn control(&self) -> Control {
        self.shared.registers.control().get()
    }

    /// The dispatcher's state.
    pub fn state(&self) -> DispatchState {
        self.shared.registers.state()
    }

    /// The current value of a segment's length word.
    pub fn segment_len(&self, kind: SegmentKind) -> u32 {
        self.shared.ram.lock().segment_len(kind)
    }

    /// The result block as it currently reads.
    pub fn execution_result(&self) -> ExecutionResult {
        self.shared.ram.lock().execution_result()
    }
}

impl Drop for PcieEbpfDevice {
    fn drop(&mut self) {
        self.shared.work.lock().stopping = true;
        self.shared.work_ready.notify_one();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("pcie ebpf worker panicked");
            }
        }
    }
}
