// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests against the emulated device.

use crate::BarAccessError;
use crate::DeviceRegisterIo;
use crate::DriverError;
use crate::EbpfOffload;
use pcie_ebpf::Execution;
use pcie_ebpf::HeapHostMemory;
use pcie_ebpf::HostChunk;
use pcie_ebpf::HostMemory;
use pcie_ebpf::HostMemoryError;
use pcie_ebpf::Interpreter;
use pcie_ebpf::InterpreterError;
use pcie_ebpf::PcieEbpfConfig;
use pcie_ebpf::PcieEbpfDevice;
use pcie_ebpf::Program;
use pcie_ebpf::ProgramFormat;
use pcie_ebpf::spec::Control;
use pcie_ebpf::spec::Opcode;
use pcie_ebpf::spec::REGISTER_COUNT;
use pcie_ebpf::spec::RETURN_CODE_FAILURE;
use poll_budget::PollBudget;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

const HOST_BASE: u64 = 0x1_0000_0000;

/// `mov r0, 42; exit`, padded to 64 bytes with `ja +0`.
const PROGRAM: [u8; 64] = {
    let mut code = [0; 64];
    code[0] = 0xb7;
    code[4] = 42;
    code[8] = 0x95;
    let mut i = 16;
    while i < 64 {
        code[i] = 0x05;
        i += 8;
    }
    code
};

/// The device's BAR, mapped directly.
struct EmulatedBar(Arc<PcieEbpfDevice>);

impl DeviceRegisterIo for EmulatedBar {
    fn read(&self, offset: usize, data: &mut [u8]) -> Result<(), BarAccessError> {
        let len = data.len();
        self.0
            .mmio_read(offset as u64, data)
            .map_err(|err| BarAccessError {
                offset,
                len,
                source: err.into(),
            })
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), BarAccessError> {
        self.0
            .mmio_write(offset as u64, data)
            .map_err(|err| BarAccessError {
                offset,
                len: data.len(),
                source: err.into(),
            })
    }
}

/// Host memory whose DMA chunks never complete.
struct Unresponsive(HeapHostMemory);

impl HostMemory for Unresponsive {
    fn read_chunk(&self, chunk: &HostChunk, buf: &mut [u8]) -> Result<(), HostMemoryError> {
        self.0.read_chunk(chunk, buf)
    }

    fn chunk_complete(&self, _chunk: &HostChunk) -> bool {
        false
    }
}

fn interpreter<F>(f: F) -> Box<dyn Interpreter>
where
    F: FnMut(&Program<'_>, &[u8]) -> Result<Execution, InterpreterError> + Send + 'static,
{
    Box::new(f)
}

/// Returns 42 for [`PROGRAM`], with the input length in r1.
fn answer(program: &Program<'_>, data: &[u8]) -> Result<Execution, InterpreterError> {
    if program.format != ProgramFormat::Raw || program.code != PROGRAM.as_slice() {
        return Err(InterpreterError::Load("unexpected program".into()));
    }
    let mut registers = [0; REGISTER_COUNT];
    registers[0] = 42;
    registers[1] = data.len() as u64;
    Ok(Execution {
        return_value: 42,
        registers,
    })
}

fn poll() -> PollBudget {
    PollBudget::new(5000, Duration::from_millis(1))
}

fn setup(
    host: impl HostMemory + 'static,
    interpreter: Box<dyn Interpreter>,
) -> (Arc<PcieEbpfDevice>, EbpfOffload<EmulatedBar>) {
    test_tracing::init();
    let device = Arc::new(
        PcieEbpfDevice::new(PcieEbpfConfig::default(), Box::new(host), interpreter).unwrap(),
    );
    let client = EbpfOffload::new(EmulatedBar(device.clone()), poll());
    (device, client)
}

#[test]
fn dma_load_and_run() -> anyhow::Result<()> {
    let host = HeapHostMemory::new(HOST_BASE, 0x10000);
    host.write_at(HOST_BASE + 0xff8, &PROGRAM)?;
    let input = (0..200).map(|i| i as u8).collect::<Vec<_>>();
    host.write_at(HOST_BASE + 0x3000, &input)?;
    let (_device, client) = setup(host, interpreter(answer));

    client.set_segment_lengths(64, 200)?;
    client.load_text_dma(HOST_BASE + 0xff8, 64, 0)?;
    client.load_data_dma(HOST_BASE + 0x3000, 200, 0)?;

    let result = client.run_program(0)?;
    assert!(!result.is_failure());
    assert_eq!(result.return_code, 42);
    assert_eq!(result.registers[1], 200);

    // The same input, sliced differently.
    let result = client.run_program(150)?;
    assert_eq!(result.registers[1], 50);
    assert_eq!(client.read_result()?, Some(result));
    Ok(())
}

#[test]
fn p2p_load_and_run() -> anyhow::Result<()> {
    let (device, client) = setup(HeapHostMemory::new(0, 0), interpreter(answer));
    device.write_staging(0, &PROGRAM)?;

    client.set_segment_lengths(64, 0)?;
    client.load_text_p2p(64, 0)?;
    let result = client.run_program(0)?;
    assert_eq!(result.return_code, 42);
    assert_eq!(result.registers[1], 0);

    client.dump_memory()?;
    assert_eq!(client.read_result()?, Some(result));
    Ok(())
}

#[test]
fn rejected_run_reports_failure_code() -> anyhow::Result<()> {
    let (_device, client) = setup(HeapHostMemory::new(0, 0), interpreter(answer));
    assert_eq!(client.read_result()?, None);

    let result = client.run_program(0)?;
    assert!(result.is_failure());
    assert_eq!(result.return_code, RETURN_CODE_FAILURE);

    // Data offset past an empty data segment.
    client.set_segment_lengths(64, 0)?;
    let result = client.run_program(4)?;
    assert!(result.is_failure());
    Ok(())
}

#[test]
fn program_returning_all_ones_is_not_a_failure() -> anyhow::Result<()> {
    let all_ones = interpreter(|program, data| {
        let mut execution = answer(program, data)?;
        execution.return_value = 0xffff_ffff;
        Ok(execution)
    });
    let (device, client) = setup(HeapHostMemory::new(0, 0), all_ones);
    device.write_staging(0, &PROGRAM)?;
    client.set_segment_lengths(64, 0)?;
    client.load_text_p2p(64, 0)?;

    let result = client.run_program(0)?;
    assert_eq!(result.return_code, RETURN_CODE_FAILURE);
    assert!(!result.is_failure());
    assert_eq!(result.registers[0], 42);
    Ok(())
}

#[test]
fn failed_transfers() -> anyhow::Result<()> {
    let host = HeapHostMemory::new(HOST_BASE, 0x1000);
    let (_device, client) = setup(host, interpreter(answer));

    let err = client
        .load_data_dma(HOST_BASE + 0x800, 0x1000, 0)
        .unwrap_err();
    assert!(
        matches!(
            err,
            DriverError::CommandFailed {
                opcode: Opcode::DmaData
            }
        ),
        "{err}"
    );

    let err = client.load_text_p2p(0x10_0000, 0).unwrap_err();
    assert!(matches!(err, DriverError::CommandFailed { .. }), "{err}");

    // The device keeps accepting commands.
    client.load_data_dma(HOST_BASE, 0x1000, 0)?;
    Ok(())
}

#[test]
fn device_transfer_timeout() {
    test_tracing::init();
    let device = Arc::new(
        PcieEbpfDevice::new(
            PcieEbpfConfig {
                chunk_poll: PollBudget::new(3, Duration::from_micros(100)),
                ..Default::default()
            },
            Box::new(Unresponsive(HeapHostMemory::new(HOST_BASE, 0x2000))),
            interpreter(answer),
        )
        .unwrap(),
    );
    let client = EbpfOffload::new(EmulatedBar(device.clone()), poll());
    let err = client.load_text_dma(HOST_BASE, 0x2000, 0).unwrap_err();
    assert!(
        matches!(
            err,
            DriverError::CommandTimedOut {
                opcode: Opcode::DmaText
            }
        ),
        "{err}"
    );
    assert!(!client.bar().control().unwrap().busy());
}

#[test]
fn host_gives_up_on_slow_program() -> anyhow::Result<()> {
    let (release, release_recv) = mpsc::channel::<()>();
    let slow = interpreter(move |program, data| {
        let _ = release_recv.recv_timeout(Duration::from_secs(10));
        answer(program, data)
    });
    let (device, client) = setup(HeapHostMemory::new(0, 0), slow);
    device.write_staging(0, &PROGRAM)?;
    client.set_segment_lengths(64, 0)?;
    client.load_text_p2p(64, 0)?;

    let impatient = EbpfOffload::new(
        EmulatedBar(device.clone()),
        PollBudget::new(3, Duration::from_millis(1)),
    );
    let err = impatient.run_program(0).unwrap_err();
    assert!(
        matches!(
            err,
            DriverError::Timeout {
                waiting_for: "program completion",
                ..
            }
        ),
        "{err}"
    );
    assert!(matches!(
        impatient.dump_memory(),
        Err(DriverError::DeviceBusy)
    ));

    // The device still finishes the run.
    release.send(())?;
    poll().watch(|| !device.control().busy())?;
    let result = client.read_result()?.expect("run finished");
    assert_eq!(result.return_code, 42);
    client.bar().set_control(Control::new())?;
    client.dump_memory()?;
    Ok(())
}
