// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use pcie_ebpf_spec as spec;
use spec::Control;
use spec::REGISTER_COUNT;
use spec::io;
use spec::ram;
use thiserror::Error;

/// A BAR access failed.
#[derive(Debug, Error)]
#[error("{len}-byte bar access at offset {offset:#x} failed")]
pub struct BarAccessError {
    pub offset: usize,
    pub len: usize,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Access to a mapped device BAR.
pub trait DeviceRegisterIo: Send + Sync {
    /// Reads `data.len()` bytes at `offset`.
    fn read(&self, offset: usize, data: &mut [u8]) -> Result<(), BarAccessError>;

    /// Writes `data` at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), BarAccessError>;

    fn read_u8(&self, offset: usize) -> Result<u8, BarAccessError> {
        let mut v = [0; 1];
        self.read(offset, &mut v)?;
        Ok(v[0])
    }

    fn read_u32(&self, offset: usize) -> Result<u32, BarAccessError> {
        let mut v = [0; 4];
        self.read(offset, &mut v)?;
        Ok(u32::from_ne_bytes(v))
    }

    fn read_u64(&self, offset: usize) -> Result<u64, BarAccessError> {
        let mut v = [0; 8];
        self.read(offset, &mut v)?;
        Ok(u64::from_ne_bytes(v))
    }

    fn write_u8(&self, offset: usize, data: u8) -> Result<(), BarAccessError> {
        self.write(offset, &[data])
    }

    fn write_u32(&self, offset: usize, data: u32) -> Result<(), BarAccessError> {
        self.write(offset, &data.to_ne_bytes())
    }

    fn write_u64(&self, offset: usize, data: u64) -> Result<(), BarAccessError> {
        self.write(offset, &data.to_ne_bytes())
    }
}

/// The device's memory BAR.
pub struct Bar<T>(pub T);

macro_rules! reg8 {
    ($get:ident, $set:ident, $offset:expr, $ty:ty) => {
        pub fn $get(&self) -> Result<$ty, BarAccessError> {
            Ok(<$ty>::from(self.0.read_u8($offset as usize)?))
        }
        pub fn $set(&self, v: $ty) -> Result<(), BarAccessError> {
            self.0.write_u8($offset as usize, v.into())
        }
    };
}

macro_rules! reg32 {
    ($get:ident, $set:ident, $offset:expr) => {
        pub fn $get(&self) -> Result<u32, BarAccessError> {
            self.0.read_u32($offset as usize)
        }
        pub fn $set(&self, v: u32) -> Result<(), BarAccessError> {
            self.0.write_u32($offset as usize, v)
        }
    };
}

impl<T: DeviceRegisterIo> Bar<T> {
    reg8!(opcode, set_opcode, io::OPCODE, u8);
    reg8!(control, set_control, io::CONTROL, Control);
    reg32!(length, set_length, io::LENGTH);
    reg32!(dest_offset, set_dest_offset, io::DEST_OFFSET);
    reg32!(code_len, set_code_len, ram::CODE_LEN);
    reg32!(data_len, set_data_len, ram::DATA_LEN);

    pub fn source_address(&self) -> Result<u64, BarAccessError> {
        self.0.read_u64(io::SOURCE_ADDRESS as usize)
    }

    /// Writes the source address as two 4-byte halves, low half first.
    pub fn set_source_address(&self, v: u64) -> Result<(), BarAccessError> {
        self.0.write_u32(io::SOURCE_ADDRESS as usize, v as u32)?;
        self.0
            .write_u32(io::SOURCE_ADDRESS_HIGH as usize, (v >> 32) as u32)
    }

    pub fn finished(&self) -> Result<bool, BarAccessError> {
        Ok(self.0.read_u8(ram::FINISHED as usize)? != spec::NOT_FINISHED)
    }

    pub fn return_code(&self) -> Result<i64, BarAccessError> {
        let slot = self.0.read_u64(ram::RETURN_CODE as usize)?;
        Ok(spec::return_code_from_slot(slot))
    }

    pub fn registers(&self) -> Result<[u64; REGISTER_COUNT], BarAccessError> {
        let mut registers = [0; REGISTER_COUNT];
        for (i, reg) in registers.iter_mut().enumerate() {
            *reg = self.0.read_u64(ram::REGISTERS as usize + i * 8)?;
        }
        Ok(registers)
    }
}
