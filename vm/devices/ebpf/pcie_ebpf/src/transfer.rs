// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transfer engine: host DMA into a device segment, and peer-to-peer
//! copies from the staging area.

use crate::error::CommandError;
use crate::memory::DeviceRam;
use crate::memory::SegmentKind;
use crate::registers::ControlRegister;
use crate::spec;
use crate::spec::Control;
use parking_lot::Mutex;
use poll_budget::PollBudget;
use std::sync::Arc;
use thiserror::Error;

/// A physically contiguous run of host memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostChunk {
    pub addr: u64,
    pub len: usize,
}

/// Splits `len` bytes at `addr` into page-aligned chunks: the first chunk
/// ends at a page boundary, the middle chunks are full pages, and the last
/// chunk holds the remainder.
pub fn page_chunks(addr: u64, len: usize, page_size: usize) -> PageChunks {
    assert!(page_size.is_power_of_two(), "bad page size {page_size}");
    PageChunks {
        addr,
        remaining: len,
        page_size,
    }
}

/// Iterator returned by [`page_chunks`].
#[derive(Debug, Clone)]
pub struct PageChunks {
    addr: u64,
    remaining: usize,
    page_size: usize,
}

impl Iterator for PageChunks {
    type Item = HostChunk;

    fn next(&mut self) -> Option<HostChunk> {
        if self.remaining == 0 {
            return None;
        }
        let page_offset = self.addr as usize & (self.page_size - 1);
        let len = (self.page_size - page_offset).min(self.remaining);
        let chunk = HostChunk {
            addr: self.addr,
            len,
        };
        self.addr = self.addr.wrapping_add(len as u64);
        self.remaining -= len;
        Some(chunk)
    }
}

/// A failure of the host side of a transfer.
#[derive(Debug, Error)]
pub enum HostMemoryError {
    #[error("host range {addr:#x}+{len:#x} is not mapped")]
    Unmapped { addr: u64, len: usize },
    #[error("host range {addr:#x}+{len:#x} is not addressable under dma mask {mask:#x}")]
    DmaMask { addr: u64, len: usize, mask: u64 },
    #[error("mapping covers {covered:#x} of {expected:#x} bytes")]
    IncompleteMapping { covered: usize, expected: usize },
    #[error("host memory error")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Host-visible memory that the device can DMA from.
///
/// This stands in for the host's scatter/gather machinery. The engine asks
/// for the chunk list once per transfer, issues each chunk with
/// [`read_chunk`](Self::read_chunk), and then polls
/// [`chunk_complete`](Self::chunk_complete) until the chunk lands.
pub trait HostMemory: Send {
    /// The natural page size of host buffers.
    fn page_size(&self) -> usize {
        spec::DMA_PAGE_SIZE
    }

    /// Returns the ordered chunks covering `len` bytes at `addr`.
    fn map(&self, addr: u64, len: usize) -> Result<Vec<HostChunk>, HostMemoryError> {
        Ok(page_chunks(addr, len, self.page_size()).collect())
    }

    /// Copies `chunk` into `buf`, which is exactly `chunk.len` bytes.
    fn read_chunk(&self, chunk: &HostChunk, buf: &mut [u8]) -> Result<(), HostMemoryError>;

    /// Returns true once the transfer of `chunk` has completed.
    fn chunk_complete(&self, chunk: &HostChunk) -> bool {
        let _ = chunk;
        true
    }
}

/// Host memory backed by a heap buffer at a fixed base address.
#[derive(Debug, Clone)]
pub struct HeapHostMemory {
    base: u64,
    page_size: usize,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HeapHostMemory {
    /// Returns `len` bytes of zeroed host memory starting at `base`.
    pub fn new(base: u64, len: usize) -> Self {
        Self::with_page_size(base, len, spec::DMA_PAGE_SIZE)
    }

    pub fn with_page_size(base: u64, len: usize, page_size: usize) -> Self {
        Self {
            base,
            page_size,
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// The first host address backed by this buffer.
    pub fn base(&self) -> u64 {
        self.base
    }

    fn offset_of(&self, addr: u64, len: usize, size: usize) -> Option<usize> {
        let offset = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        (offset.checked_add(len)? <= size).then_some(offset)
    }

    /// Writes `data` at host address `addr`.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), HostMemoryError> {
        let mut bytes = self.bytes.lock();
        let offset = self
            .offset_of(addr, data.len(), bytes.len())
            .ok_or(HostMemoryError::Unmapped {
                addr,
                len: data.len(),
            })?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads `data.len()` bytes at host address `addr`.
    pub fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), HostMemoryError> {
        let bytes = self.bytes.lock();
        let offset = self
            .offset_of(addr, data.len(), bytes.len())
            .ok_or(HostMemoryError::Unmapped {
                addr,
                len: data.len(),
            })?;
        data.copy_from_slice(&bytes[offset..offset + data.len()]);
        Ok(())
    }
}

impl HostMemory for HeapHostMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, addr: u64, len: usize) -> Result<Vec<HostChunk>, HostMemoryError> {
        if self.offset_of(addr, len, self.bytes.lock().len()).is_none() {
            return Err(HostMemoryError::Unmapped { addr, len });
        }
        Ok(page_chunks(addr, len, self.page_size).collect())
    }

    fn read_chunk(&self, chunk: &HostChunk, buf: &mut [u8]) -> Result<(), HostMemoryError> {
        self.read_at(chunk.addr, buf)
    }
}

/// Moves bytes into the code and data segments.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    chunk_poll: PollBudget,
    dma_mask: u64,
}

impl TransferEngine {
    pub fn new(chunk_poll: PollBudget, dma_mask: u64) -> Self {
        Self {
            chunk_poll,
            dma_mask,
        }
    }

    /// DMAs `length` bytes from host address `source` into `target` at
    /// `dest_offset`, one chunk at a time.
    ///
    /// `dma_done` is cleared when each chunk is issued and set once it lands.
    /// An empty transfer just sets it.
    /// On failure, chunks before the failing one are left in place.
    ///
    /// Returns the number of chunks transferred.
    pub fn dma(
        &self,
        host: &dyn HostMemory,
        ram: &Mutex<DeviceRam>,
        control: &ControlRegister,
        target: SegmentKind,
        source: u64,
        length: u32,
        dest_offset: u32,
    ) -> Result<usize, CommandError> {
        let dest = target.window(dest_offset, length)?;
        let done = Control::new().with_dma_done(true);
        if length == 0 {
            control.set(done);
            return Ok(0);
        }
        self.check_mask(source, length as usize)?;

        let chunks = host.map(source, length as usize)?;
        let covered = chunks.iter().map(|chunk| chunk.len).sum::<usize>();
        if covered != length as usize {
            return Err(HostMemoryError::IncompleteMapping {
                covered,
                expected: length as usize,
            }
            .into());
        }

        let mut pos = dest.start;
        for (i, chunk) in chunks.iter().enumerate() {
            control.clear(done);
            host.read_chunk(chunk, ram.lock().bytes_mut(pos..pos + chunk.len))?;
            let checks = self
                .chunk_poll
                .watch(|| host.chunk_complete(chunk))
                .map_err(|source| CommandError::Timeout { chunk: i, source })?;
            control.set(done);
            tracing::debug!(
                chunk = i,
                addr = chunk.addr,
                len = chunk.len,
                checks,
                "dma chunk complete"
            );
            pos += chunk.len;
        }
        Ok(chunks.len())
    }

    /// Copies the first `length` bytes of the staging area into `target` at
    /// `dest_offset`.
    pub fn copy_from_staging(
        &self,
        ram: &Mutex<DeviceRam>,
        control: &ControlRegister,
        target: SegmentKind,
        length: u32,
        dest_offset: u32,
    ) -> Result<(), CommandError> {
        let dest = target.window(dest_offset, length)?;
        let done = Control::new().with_dma_done(true);
        control.clear(done);
        ram.lock().copy_from_staging(dest)?;
        control.set(done);
        Ok(())
    }

    fn check_mask(&self, addr: u64, len: usize) -> Result<(), HostMemoryError> {
        let last = addr.checked_add(len as u64 - 1);
        match last {
            Some(last) if (addr | last) & !self.dma_mask == 0 => Ok(()),
            _ => Err(HostMemoryError::DmaMask {
                addr,
                len,
                mask: self.dma_mask,
            }),
        }
    }
}
