// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DUMP_MEM: device-side logging of the code and data segments.

use crate::error::SegmentError;
use crate::memory::DeviceRam;
use crate::memory::SegmentKind;
use std::fmt;

const BYTES_PER_LINE: usize = 16;

/// A classic hex dump: an offset column, the bytes in hex, and the printable
/// ASCII characters.
pub struct HexDump<'a> {
    pub desc: &'a str,
    pub bytes: &'a [u8],
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} bytes):", self.desc, self.bytes.len())?;
        if self.bytes.is_empty() {
            return writeln!(f, "  ZERO LENGTH");
        }
        for (i, line) in self.bytes.chunks(BYTES_PER_LINE).enumerate() {
            write!(f, "  {:04x} ", i * BYTES_PER_LINE)?;
            for b in line {
                write!(f, " {b:02x}")?;
            }
            for _ in line.len()..BYTES_PER_LINE {
                f.write_str("   ")?;
            }
            f.write_str("  ")?;
            for &b in line {
                let c = if (0x20..=0x7e).contains(&b) {
                    b as char
                } else {
                    '.'
                };
                write!(f, "{c}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Copies of both segments, as dumped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDump {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
}

/// Logs the valid parts of the code and data segments.
///
/// Nothing is written to device memory or to the result block.
pub fn dump_memory(ram: &DeviceRam) -> Result<MemoryDump, SegmentError> {
    let dump = MemoryDump {
        code: ram.segment_bytes(SegmentKind::Code)?.to_vec(),
        data: ram.segment_bytes(SegmentKind::Data)?.to_vec(),
    };
    tracing::info!(
        "{}{}",
        HexDump {
            desc: "prog",
            bytes: &dump.code,
        },
        HexDump {
            desc: "data",
            bytes: &dump.data,
        }
    );
    Ok(dump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ram;

    #[test]
    fn empty() {
        let s = HexDump {
            desc: "prog",
            bytes: &[],
        }
        .to_string();
        assert_eq!(s, "prog (0 bytes):\n  ZERO LENGTH\n");
    }

    #[test]
    fn partial_last_line() {
        let bytes = (0x40..0x51).collect::<Vec<u8>>();
        let s = HexDump {
            desc: "data",
            bytes: &bytes,
        }
        .to_string();
        let expected = format!(
            "data (17 bytes):\n  0000  40 41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f  @ABCDEFGHIJKLMNO\n  0010  50{}  P\n",
            "   ".repeat(15)
        );
        assert_eq!(s, expected);
    }

    #[test]
    fn non_printable_bytes() {
        let s = HexDump {
            desc: "x",
            bytes: &[0x00, 0x7f, b'a'],
        }
        .to_string();
        assert!(s.ends_with("  ..a\n"), "{s}");
    }

    #[test]
    fn dump_reads_valid_segment_bytes_only() {
        let mut mem = DeviceRam::new();
        let code = ram::CODE as usize;
        mem.bytes_mut(code..code + 8).copy_from_slice(&[1; 8]);
        mem.set_segment_len(SegmentKind::Code, 4);
        let before = mem.execution_result();

        let dump = dump_memory(&mem).unwrap();
        assert_eq!(dump.code, [1; 4]);
        assert!(dump.data.is_empty());
        assert_eq!(mem.execution_result(), before);
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut mem = DeviceRam::new();
        mem.set_segment_len(SegmentKind::Code, u32::MAX);
        assert!(dump_memory(&mem).is_err());
    }
}
