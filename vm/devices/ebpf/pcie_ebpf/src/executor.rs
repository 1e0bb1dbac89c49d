// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The execution coordinator, and the interface to the bytecode interpreter
//! that actually runs programs.

use crate::error::CommandError;
use crate::error::SegmentError;
use crate::memory::DeviceRam;
use crate::memory::SegmentKind;
use crate::spec::REGISTER_COUNT;
use crate::spec::RETURN_CODE_FAILURE;
use parking_lot::Mutex;
use thiserror::Error;

/// How the code segment is encoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgramFormat {
    /// Raw bytecode.
    Raw,
    /// An ELF object containing the program.
    Elf,
}

impl ProgramFormat {
    const ELF_MAGIC: &'static [u8; 4] = b"\x7fELF";

    /// Detects the format from the leading bytes of `code`.
    pub fn detect(code: &[u8]) -> Self {
        if code.starts_with(Self::ELF_MAGIC) {
            Self::Elf
        } else {
            Self::Raw
        }
    }
}

/// A program handed to the interpreter.
#[derive(Debug, Copy, Clone)]
pub struct Program<'a> {
    pub code: &'a [u8],
    pub format: ProgramFormat,
}

/// The outcome of a successful run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Execution {
    pub return_value: u64,
    pub registers: [u64; REGISTER_COUNT],
}

/// The interpreter could not run a program.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("failed to load program: {0}")]
    Load(String),
    #[error("program faulted: {0}")]
    Fault(String),
}

/// A bytecode interpreter.
pub trait Interpreter: Send {
    /// Loads and runs `program` against `data`, blocking until it finishes.
    fn execute(
        &mut self,
        program: &Program<'_>,
        data: &[u8],
    ) -> Result<Execution, InterpreterError>;
}

impl<F> Interpreter for F
where
    F: FnMut(&Program<'_>, &[u8]) -> Result<Execution, InterpreterError> + Send,
{
    fn execute(
        &mut self,
        program: &Program<'_>,
        data: &[u8],
    ) -> Result<Execution, InterpreterError> {
        self(program, data)
    }
}

/// The parts of device memory a program run reads and writes.
pub trait ProgramMemory {
    /// Returns a copy of the valid part of a segment.
    fn segment(&self, kind: SegmentKind) -> Result<Vec<u8>, SegmentError>;
    fn write_return_code(&self, value: i64);
    fn write_registers(&self, registers: &[u64; REGISTER_COUNT]);
    fn set_finished(&self, finished: bool);
}

impl ProgramMemory for Mutex<DeviceRam> {
    fn segment(&self, kind: SegmentKind) -> Result<Vec<u8>, SegmentError> {
        Ok(self.lock().segment_bytes(kind)?.to_vec())
    }

    fn write_return_code(&self, value: i64) {
        self.lock().write_return_code(value);
    }

    fn write_registers(&self, registers: &[u64; REGISTER_COUNT]) {
        self.lock().write_registers(registers);
    }

    fn set_finished(&self, finished: bool) {
        self.lock().set_finished(finished);
    }
}

/// A program whose segments passed the run checks, copied out of device
/// memory.
pub struct LoadedProgram {
    code: Vec<u8>,
    data: Vec<u8>,
    data_offset: u32,
}

impl std::fmt::Debug for LoadedProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedProgram")
            .field("code_len", &self.code.len())
            .field("data_len", &self.data.len())
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

/// Runs the loaded program and publishes its result.
pub struct ExecutionCoordinator {
    interpreter: Box<dyn Interpreter>,
}

impl ExecutionCoordinator {
    pub fn new(interpreter: Box<dyn Interpreter>) -> Self {
        Self { interpreter }
    }

    /// Checks the code and data segments for a run starting `data_offset`
    /// bytes into the data segment.
    ///
    /// If the program cannot be run, the failure sentinel is published and
    /// the interpreter is never invoked.
    pub fn load(
        &self,
        mem: &dyn ProgramMemory,
        data_offset: u32,
    ) -> Result<LoadedProgram, CommandError> {
        match check_segments(mem, data_offset) {
            Ok((code, data)) => Ok(LoadedProgram {
                code,
                data,
                data_offset,
            }),
            Err(err) => {
                tracing::warn!(
                    data_offset,
                    error = &err as &dyn std::error::Error,
                    "cannot run program"
                );
                publish_failure(mem);
                Err(err.into())
            }
        }
    }

    /// Runs a loaded program.
    ///
    /// The return code and registers are written before the finished flag is
    /// set.
    pub fn execute(
        &mut self,
        mem: &dyn ProgramMemory,
        loaded: LoadedProgram,
    ) -> Result<Execution, CommandError> {
        let LoadedProgram {
            code,
            data,
            data_offset,
        } = loaded;

        mem.set_finished(false);
        let program = Program {
            code: &code,
            format: ProgramFormat::detect(&code),
        };
        tracing::info!(
            code_len = code.len(),
            data_len = data.len(),
            data_offset,
            format = ?program.format,
            "running program"
        );

        let input = data.get(data_offset as usize..).unwrap_or_default();
        match self.interpreter.execute(&program, input) {
            Ok(execution) => {
                mem.write_return_code(execution.return_value as i64);
                mem.write_registers(&execution.registers);
                mem.set_finished(true);
                tracing::info!(return_value = execution.return_value, "program finished");
                Ok(execution)
            }
            Err(err) => {
                tracing::warn!(error = &err as &dyn std::error::Error, "program failed");
                publish_failure(mem);
                Err(err.into())
            }
        }
    }

    /// [`load`](Self::load) followed by [`execute`](Self::execute).
    pub fn run_program(
        &mut self,
        mem: &dyn ProgramMemory,
        data_offset: u32,
    ) -> Result<Execution, CommandError> {
        let loaded = self.load(mem, data_offset)?;
        self.execute(mem, loaded)
    }
}

fn check_segments(
    mem: &dyn ProgramMemory,
    data_offset: u32,
) -> Result<(Vec<u8>, Vec<u8>), SegmentError> {
    let code = mem.segment(SegmentKind::Code)?;
    if code.is_empty() {
        return Err(SegmentError::EmptyCode);
    }
    let data = mem.segment(SegmentKind::Data)?;
    let valid = if data.is_empty() {
        data_offset == 0
    } else {
        (data_offset as usize) < data.len()
    };
    if !valid {
        return Err(SegmentError::DataOffset {
            offset: data_offset,
            len: data.len() as u32,
        });
    }
    Ok((code, data))
}

fn publish_failure(mem: &dyn ProgramMemory) {
    mem.write_return_code(RETURN_CODE_FAILURE);
    mem.set_finished(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_helpers::ANSWER_PROGRAM;
    use crate::tests::test_helpers::RecordingMemory;
    use crate::tests::test_helpers::ResultWrite;
    use crate::tests::test_helpers::answer_interpreter;
    use crate::tests::test_helpers::interpreter_fn;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn counting_interpreter(calls: Arc<AtomicUsize>) -> Box<dyn Interpreter> {
        interpreter_fn(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Execution {
                return_value: 0,
                registers: [0; REGISTER_COUNT],
            })
        })
    }

    #[test]
    fn detects_elf() {
        assert_eq!(ProgramFormat::detect(b"\x7fELF\x02\x01"), ProgramFormat::Elf);
        assert_eq!(ProgramFormat::detect(b"\x7fEL"), ProgramFormat::Raw);
        assert_eq!(ProgramFormat::detect(&[0xb7, 0, 0, 0]), ProgramFormat::Raw);
    }

    #[test]
    fn result_is_written_before_finished() {
        let mem = RecordingMemory::new(ANSWER_PROGRAM.to_vec(), vec![1, 2, 3]);
        let mut coordinator = ExecutionCoordinator::new(answer_interpreter());
        let execution = coordinator.run_program(&mem, 0).unwrap();
        assert_eq!(execution.return_value, 42);
        assert_eq!(
            mem.writes(),
            [
                ResultWrite::Finished(false),
                ResultWrite::ReturnCode(42),
                ResultWrite::Registers(execution.registers),
                ResultWrite::Finished(true),
            ]
        );
    }

    #[test]
    fn empty_code_publishes_failure_without_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mem = RecordingMemory::new(Vec::new(), vec![1]);
        let mut coordinator = ExecutionCoordinator::new(counting_interpreter(calls.clone()));
        let err = coordinator.run_program(&mem, 0).unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidSegment(SegmentError::EmptyCode)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            mem.writes(),
            [
                ResultWrite::ReturnCode(RETURN_CODE_FAILURE),
                ResultWrite::Finished(true),
            ]
        );
    }

    #[test]
    fn data_offset_must_be_inside_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ExecutionCoordinator::new(counting_interpreter(calls.clone()));

        let mem = RecordingMemory::new(vec![0x95; 8], vec![0; 16]);
        assert!(coordinator.run_program(&mem, 15).is_ok());
        assert!(matches!(
            coordinator.run_program(&mem, 16),
            Err(CommandError::InvalidSegment(SegmentError::DataOffset {
                offset: 16,
                len: 16
            }))
        ));

        let empty = RecordingMemory::new(vec![0x95; 8], Vec::new());
        assert!(coordinator.run_program(&empty, 0).is_ok());
        assert!(coordinator.run_program(&empty, 1).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn data_is_sliced_at_offset() {
        let mem = RecordingMemory::new(vec![0x95; 8], vec![10, 20, 30, 40]);
        let mut coordinator = ExecutionCoordinator::new(interpreter_fn(|_, data| {
            Ok(Execution {
                return_value: data.iter().map(|&b| u64::from(b)).sum(),
                registers: [0; REGISTER_COUNT],
            })
        }));
        assert_eq!(coordinator.run_program(&mem, 2).unwrap().return_value, 70);
    }

    #[test]
    fn interpreter_failure_publishes_sentinel() {
        let mem = RecordingMemory::new(vec![0x95; 8], Vec::new());
        let mut coordinator = ExecutionCoordinator::new(interpreter_fn(|_, _| {
            Err(InterpreterError::Load("bad instruction".into()))
        }));
        let err = coordinator.run_program(&mem, 0).unwrap_err();
        assert!(matches!(err, CommandError::ExecutionFailed(_)));
        assert_eq!(
            mem.writes(),
            [
                ResultWrite::Finished(false),
                ResultWrite::ReturnCode(RETURN_CODE_FAILURE),
                ResultWrite::Finished(true),
            ]
        );
    }
}
