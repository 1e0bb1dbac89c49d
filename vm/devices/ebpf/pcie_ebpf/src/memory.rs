// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device's memory region map and its RAM.

use crate::error::CommandError;
use crate::error::SegmentError;
use crate::spec;
use crate::spec::REGISTER_COUNT;
use crate::spec::ram;
use crate::spec::return_code_from_slot;
use std::fmt;
use std::ops::Range;
use zerocopy::IntoBytes;

/// What a region of the BAR is used for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegionKind {
    IoArea,
    SegmentMetadata,
    Code,
    ExecutionResult,
    Data,
    Staging,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionKind::IoArea => "I/O area",
            RegionKind::SegmentMetadata => "segment metadata",
            RegionKind::Code => "code segment",
            RegionKind::ExecutionResult => "execution result",
            RegionKind::Data => "data segment",
            RegionKind::Staging => "staging area",
        };
        f.pad(s)
    }
}

/// A fixed region of the BAR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub len: u32,
    pub kind: RegionKind,
}

impl Region {
    /// The first offset past the region.
    pub const fn end(&self) -> u32 {
        self.base + self.len
    }

    /// Returns true if `len` bytes at `offset` lie entirely within the region.
    pub fn contains(&self, offset: u64, len: usize) -> bool {
        offset >= u64::from(self.base)
            && offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= u64::from(self.end()))
    }
}

/// The region map. Regions are sorted and do not overlap; offsets between
/// them are unassigned.
pub const REGIONS: [Region; 6] = [
    Region {
        base: 0,
        len: spec::IO_AREA_LEN,
        kind: RegionKind::IoArea,
    },
    Region {
        base: ram::CODE_LEN,
        len: ram::METADATA_END - ram::CODE_LEN,
        kind: RegionKind::SegmentMetadata,
    },
    Region {
        base: ram::CODE,
        len: ram::CODE_CAPACITY,
        kind: RegionKind::Code,
    },
    Region {
        base: ram::RETURN_CODE,
        len: ram::RESULT_END - ram::RETURN_CODE,
        kind: RegionKind::ExecutionResult,
    },
    Region {
        base: ram::DATA,
        len: ram::DATA_CAPACITY,
        kind: RegionKind::Data,
    },
    Region {
        base: ram::STAGING,
        len: ram::STAGING_CAPACITY,
        kind: RegionKind::Staging,
    },
];

/// Returns the region that wholly contains `len` bytes at `offset`, if any.
pub fn find_region(offset: u64, len: usize) -> Option<&'static Region> {
    REGIONS.iter().find(|r| r.contains(offset, len))
}

/// A segment that commands load into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Code,
    Data,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SegmentKind::Code => "code",
            SegmentKind::Data => "data",
        })
    }
}

impl SegmentKind {
    /// The region backing the segment.
    pub const fn region(self) -> Region {
        match self {
            SegmentKind::Code => REGIONS[2],
            SegmentKind::Data => REGIONS[4],
        }
    }

    /// The offset of the segment's length word.
    pub const fn length_field(self) -> u32 {
        match self {
            SegmentKind::Code => ram::CODE_LEN,
            SegmentKind::Data => ram::DATA_LEN,
        }
    }

    /// Returns the BAR range covering `len` bytes at `offset` into the
    /// segment, or an error if it does not fit.
    pub fn window(self, offset: u32, len: u32) -> Result<Range<usize>, CommandError> {
        let region = self.region();
        window(region, offset, len)
    }
}

fn window(region: Region, offset: u32, len: u32) -> Result<Range<usize>, CommandError> {
    match offset.checked_add(len) {
        Some(end) if end <= region.len => {
            let start = (region.base + offset) as usize;
            Ok(start..start + len as usize)
        }
        _ => Err(CommandError::OutOfBounds {
            region: region.kind,
            offset,
            len,
            capacity: region.len,
        }),
    }
}

/// The valid part of a segment: `len` bytes at `offset` into the BAR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub len: u32,
}

impl Segment {
    /// The segment's bytes as a BAR range.
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }
}

/// The outcome of the most recent program run, as laid out in the result
/// block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The host-visible return code: the low 32 bits of the return-code
    /// slot, sign-extended. The upper half of the slot overlaps the finished
    /// flag.
    pub return_code: i64,
    pub finished: bool,
    pub registers: [u64; REGISTER_COUNT],
}

/// The device's RAM, spanning the whole BAR.
///
/// The first MiB is shadowed by the I/O area and never read or written
/// through this type.
pub struct DeviceRam {
    bytes: Box<[u8]>,
}

impl Default for DeviceRam {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRam {
    /// Returns zeroed device memory.
    pub fn new() -> Self {
        Self {
            bytes: vec![0; spec::BAR_LEN as usize].into_boxed_slice(),
        }
    }

    /// Returns the bytes in `range`. Panics if `range` is outside the BAR.
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.bytes[range]
    }

    /// Returns the bytes in `range` mutably. Panics if `range` is outside
    /// the BAR.
    pub fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.bytes[range]
    }

    fn read_u32(&self, offset: u32) -> u32 {
        let mut v = [0; 4];
        v.copy_from_slice(self.bytes(offset as usize..offset as usize + 4));
        u32::from_ne_bytes(v)
    }

    fn write_u32(&mut self, offset: u32, value: u32) {
        self.bytes_mut(offset as usize..offset as usize + 4)
            .copy_from_slice(&value.to_ne_bytes());
    }

    /// The value of a segment's length word.
    pub fn segment_len(&self, kind: SegmentKind) -> u32 {
        self.read_u32(kind.length_field())
    }

    /// Sets a segment's length word.
    pub fn set_segment_len(&mut self, kind: SegmentKind, len: u32) {
        self.write_u32(kind.length_field(), len);
    }

    /// Returns the valid part of a segment, as declared by its length word.
    pub fn segment(&self, kind: SegmentKind) -> Result<Segment, SegmentError> {
        let region = kind.region();
        let len = self.segment_len(kind);
        if len > region.len {
            return Err(SegmentError::Overflow {
                kind,
                len,
                capacity: region.len,
            });
        }
        Ok(Segment {
            offset: region.base,
            len,
        })
    }

    /// Returns the valid bytes of a segment.
    pub fn segment_bytes(&self, kind: SegmentKind) -> Result<&[u8], SegmentError> {
        let segment = self.segment(kind)?;
        Ok(self.bytes(segment.range()))
    }

    /// Copies the first `len` bytes of the staging area into `dest`.
    pub fn copy_from_staging(&mut self, dest: Range<usize>) -> Result<(), CommandError> {
        let len = (dest.end - dest.start) as u32;
        let src = window(REGIONS[5], 0, len)?;
        self.bytes.copy_within(src, dest.start);
        Ok(())
    }

    /// Writes the return-code slot.
    ///
    /// Byte 4 of the slot is the finished flag, so it is left clear here and
    /// only [`Self::set_finished`] ever sets it.
    pub fn write_return_code(&mut self, value: i64) {
        let offset = ram::RETURN_CODE as usize;
        self.bytes_mut(offset..offset + 8)
            .copy_from_slice(&value.to_ne_bytes());
        self.set_finished(false);
    }

    /// Writes the register snapshot.
    pub fn write_registers(&mut self, registers: &[u64; REGISTER_COUNT]) {
        self.bytes_mut(ram::REGISTERS as usize..ram::RESULT_END as usize)
            .copy_from_slice(registers.as_bytes());
    }

    /// Writes the finished flag.
    pub fn set_finished(&mut self, finished: bool) {
        self.bytes[ram::FINISHED as usize] = if finished {
            spec::FINISHED
        } else {
            spec::NOT_FINISHED
        };
    }

    /// Reads the result block.
    pub fn execution_result(&self) -> ExecutionResult {
        let mut slot = [0; 8];
        slot.copy_from_slice(self.bytes(ram::RETURN_CODE as usize..ram::RETURN_CODE as usize + 8));
        let mut registers = [0u64; REGISTER_COUNT];
        registers
            .as_mut_bytes()
            .copy_from_slice(self.bytes(ram::REGISTERS as usize..ram::RESULT_END as usize));
        ExecutionResult {
            return_code: return_code_from_slot(u64::from_ne_bytes(slot)),
            finished: self.bytes[ram::FINISHED as usize] != spec::NOT_FINISHED,
            registers,
        }
    }
}
