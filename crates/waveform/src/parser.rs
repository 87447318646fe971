//! WBF container parsing.
//!
//! WBF is the vendor format for waveform data. No official description has
//! been published; the layout implemented here follows the unofficial
//! sources that the e-ink community has assembled (inkwave, metronomefb,
//! vendor mode declaration sheets). All multi-byte values are little-endian.
//!
//! Integrity is layered: a CRC-32 over the whole file (with the first four
//! bytes zeroed), two 8-bit additive checksums inside the header, and an
//! 8-bit additive checksum after the temperature table and after every
//! 24-bit section pointer.

use std::fmt;
use std::io;

use crate::codec;
use crate::phase::{Temperature, Waveform};

/// Size of the fixed WBF header.
pub const HEADER_LEN: usize = 48;

// Header fields that are not expected to vary between files. Their meaning
// is not fully understood, so parsing refuses files where they differ.
const EXPECTED_RUN_TYPE: u8 = 17;
const EXPECTED_FPL_PLATFORM: u8 = 0;
const EXPECTED_ADHESIVE_RUN: u8 = 25;
const EXPECTED_WAVEFORM_TYPE: u8 = 81;
const EXPECTED_WAVEFORM_REVISION: u8 = 0;
const EXPECTED_VCOM_OFFSET: u8 = 0;
const EXPECTED_FVSN: u8 = 1;
const EXPECTED_LUTS: u8 = 4;
const EXPECTED_ADVANCED_WFM_FLAGS: u8 = 3;

/// Frame rate assumed when the header leaves the field at zero.
pub const DEFAULT_FRAME_RATE: u8 = 85;

/// Errors raised while parsing a WBF container.
#[derive(Debug)]
pub enum ParseError {
    /// Reading the file failed
    Io(io::Error),
    /// Shorter than the fixed header
    TooShort { actual: usize },
    /// Header filesize does not match the byte count
    SizeMismatch { declared: u32, actual: usize },
    /// CRC-32 over the file body does not match the header
    Crc { expected: u32, actual: u32 },
    /// One of the two additive header checksums does not match
    HeaderChecksum { index: u8, expected: u8, actual: u8 },
    /// Additive checksum of the temperature table does not match
    TemperatureChecksum { expected: u8, actual: u8 },
    /// Additive checksum of a section pointer does not match
    PointerChecksum { expected: u8, actual: u8 },
    /// A fixed header field holds an unexpected value
    UnexpectedField {
        field: &'static str,
        expected: u32,
        actual: u32,
    },
    /// A section extends past the end of the file
    Truncated { section: &'static str },
    /// The decoded contents do not form a valid table
    Invalid(crate::table::TableError),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Io(err) => write!(f, "I/O error: {}", err),
            ParseError::TooShort { actual } => write!(
                f,
                "too short to be a WBF file: {} bytes, header alone is {}",
                actual, HEADER_LEN
            ),
            ParseError::SizeMismatch { declared, actual } => write!(
                f,
                "invalid filesize in WBF header: declared {} bytes, actual {}",
                declared, actual
            ),
            ParseError::Crc { expected, actual } => write!(
                f,
                "corrupted WBF file: expected CRC32 {:#010x}, actual {:#010x}",
                expected, actual
            ),
            ParseError::HeaderChecksum {
                index,
                expected,
                actual,
            } => write!(
                f,
                "corrupted WBF header: expected checksum{} {:#04x}, actual {:#04x}",
                index, expected, actual
            ),
            ParseError::TemperatureChecksum { expected, actual } => write!(
                f,
                "corrupted WBF temperature table: expected checksum {:#04x}, actual {:#04x}",
                expected, actual
            ),
            ParseError::PointerChecksum { expected, actual } => write!(
                f,
                "corrupted WBF pointer: expected checksum {:#04x}, actual {:#04x}",
                expected, actual
            ),
            ParseError::UnexpectedField {
                field,
                expected,
                actual,
            } => write!(
                f,
                "invalid {} in WBF header: expected {}, actual {}",
                field, expected, actual
            ),
            ParseError::Truncated { section } => {
                write!(f, "WBF {} extends past the end of the file", section)
            }
            ParseError::Invalid(err) => write!(f, "invalid waveform table: {}", err),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Io(err) => Some(err),
            ParseError::Invalid(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        ParseError::Io(err)
    }
}

impl From<crate::table::TableError> for ParseError {
    fn from(err: crate::table::TableError) -> Self {
        ParseError::Invalid(err)
    }
}

/// Parsed WBF header.
///
/// Only the fields the driver consumes are retained; reserved and legacy
/// fields are validated where required and otherwise dropped.
#[derive(Debug, Clone)]
pub struct Header {
    /// CRC-32 over the file with the first four bytes zeroed
    pub checksum: u32,
    /// Total file length in bytes
    pub filesize: u32,
    /// Unique serial number of the waveform file
    pub serial: u32,
    /// Front panel laminate lot the file was tuned for
    pub fpl_lot: u16,
    pub waveform_version: u8,
    pub waveform_subversion: u8,
    pub fpl_size: u8,
    pub mfg_code: u8,
    /// Frame rate in Hz; zero means [`DEFAULT_FRAME_RATE`]
    pub frame_rate: u8,
    /// Index of the last mode (actual count is `mode_count + 1`)
    pub mode_count: u8,
    /// Index of the last temperature range (actual count is
    /// `temp_range_count + 1`)
    pub temp_range_count: u8,
}

/// Sum of bytes, wrapping on overflow.
fn additive_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn check_field(
    field: &'static str,
    expected: u8,
    actual: u8,
) -> Result<(), ParseError> {
    if actual != expected {
        return Err(ParseError::UnexpectedField {
            field,
            expected: u32::from(expected),
            actual: u32::from(actual),
        });
    }

    Ok(())
}

impl Header {
    /// Parse and verify the fixed 48-byte header.
    ///
    /// Checks both additive header checksums and every fixed-constant field,
    /// but not the whole-file CRC (the caller may only hold the header, as
    /// device discovery does).
    pub fn parse(buffer: &[u8]) -> Result<Self, ParseError> {
        if buffer.len() < HEADER_LEN {
            return Err(ParseError::TooShort {
                actual: buffer.len(),
            });
        }

        let checksum1 = additive_checksum(&buffer[8..31]);
        if buffer[31] != checksum1 {
            return Err(ParseError::HeaderChecksum {
                index: 1,
                expected: buffer[31],
                actual: checksum1,
            });
        }

        let checksum2 = additive_checksum(&buffer[32..47]);
        if buffer[47] != checksum2 {
            return Err(ParseError::HeaderChecksum {
                index: 2,
                expected: buffer[47],
                actual: checksum2,
            });
        }

        check_field("run type", EXPECTED_RUN_TYPE, buffer[12])?;
        check_field("FPL platform", EXPECTED_FPL_PLATFORM, buffer[13])?;
        check_field("adhesive run", EXPECTED_ADHESIVE_RUN, buffer[16])?;
        check_field("waveform type", EXPECTED_WAVEFORM_TYPE, buffer[19])?;
        check_field(
            "waveform revision",
            EXPECTED_WAVEFORM_REVISION,
            buffer[22],
        )?;
        check_field("VCOM offset", EXPECTED_VCOM_OFFSET, buffer[25])?;
        check_field("FVSN", EXPECTED_FVSN, buffer[35])?;
        check_field("LUTS", EXPECTED_LUTS, buffer[36])?;
        check_field(
            "advanced waveform flags",
            EXPECTED_ADVANCED_WFM_FLAGS,
            buffer[39],
        )?;

        Ok(Header {
            checksum: u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]),
            filesize: u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            serial: u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
            fpl_lot: u16::from_le_bytes([buffer[14], buffer[15]]),
            waveform_version: buffer[17],
            waveform_subversion: buffer[18],
            fpl_size: buffer[20],
            mfg_code: buffer[21],
            frame_rate: buffer[24],
            mode_count: buffer[37],
            temp_range_count: buffer[38],
        })
    }
}

/// Byte cursor over the container with checked reads.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Cursor { data, pos }
    }

    fn take(&mut self, len: usize, section: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(ParseError::Truncated { section })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, section: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, section)?[0])
    }

    /// Read a 24-bit little-endian section pointer followed by its additive
    /// checksum byte.
    fn pointer(&mut self, section: &'static str) -> Result<u32, ParseError> {
        let bytes = self.take(4, section)?;
        let pointer =
            u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
        let checksum = additive_checksum(&bytes[..3]);

        if bytes[3] != checksum {
            return Err(ParseError::PointerChecksum {
                expected: bytes[3],
                actual: checksum,
            });
        }

        Ok(pointer)
    }
}

/// Fully decoded container contents, before table construction.
pub(crate) struct Container {
    pub header: Header,
    pub temperatures: Vec<Temperature>,
    pub waveforms: Vec<Waveform>,
    pub lookup: Vec<Vec<usize>>,
}

fn parse_temperatures(
    header: &Header,
    cursor: &mut Cursor<'_>,
) -> Result<Vec<Temperature>, ParseError> {
    let count = usize::from(header.temp_range_count) + 2;
    let bytes = cursor.take(count, "temperature table")?;
    let checksum = additive_checksum(bytes);
    let expected = cursor.u8("temperature table")?;

    if expected != checksum {
        return Err(ParseError::TemperatureChecksum {
            expected,
            actual: checksum,
        });
    }

    Ok(bytes.iter().map(|&b| b as Temperature).collect())
}

/// Collect the sorted, deduplicated waveform block offsets referenced from
/// the two-level pointer table.
fn find_blocks(
    header: &Header,
    buffer: &[u8],
    mode_table: Cursor<'_>,
) -> Result<Vec<u32>, ParseError> {
    let mode_count = usize::from(header.mode_count) + 1;
    let temp_count = usize::from(header.temp_range_count) + 1;

    let mut offsets = std::collections::BTreeSet::new();
    let mut modes = mode_table;

    for _ in 0..mode_count {
        let mode_offset = modes.pointer("mode table")? as usize;
        if mode_offset > buffer.len() {
            return Err(ParseError::Truncated {
                section: "mode table",
            });
        }

        let mut temps = Cursor::at(buffer, mode_offset);
        for _ in 0..temp_count {
            offsets.insert(temps.pointer("temperature pointer table")?);
        }
    }

    Ok(offsets.into_iter().collect())
}

/// Decode every block and rebuild the `(mode, temperature range)` lookup as
/// indices into the deduplicated block list.
fn parse_waveforms(
    header: &Header,
    buffer: &[u8],
    mode_table: Cursor<'_>,
    blocks: &[u32],
) -> Result<(Vec<Waveform>, Vec<Vec<usize>>), ParseError> {
    let mut waveforms = Vec::with_capacity(blocks.len());

    for pair in blocks.windows(2) {
        let start = pair[0] as usize;
        // The last two bytes of each block are a trailing checksum the
        // decoder does not consume
        let end = (pair[1] as usize).saturating_sub(2).max(start);

        if start > buffer.len() || end > buffer.len() {
            return Err(ParseError::Truncated {
                section: "waveform block",
            });
        }

        waveforms.push(codec::decode(&buffer[start..end]));
    }

    let mode_count = usize::from(header.mode_count) + 1;
    let temp_count = usize::from(header.temp_range_count) + 1;
    let mut lookup = Vec::with_capacity(mode_count);
    let mut modes = mode_table;

    for _ in 0..mode_count {
        let mode_offset = modes.pointer("mode table")? as usize;
        let mut temps = Cursor::at(buffer, mode_offset);
        let mut per_temp = Vec::with_capacity(temp_count);

        for _ in 0..temp_count {
            let offset = temps.pointer("temperature pointer table")?;
            per_temp.push(blocks.partition_point(|&block| block < offset));
        }

        lookup.push(per_temp);
    }

    Ok((waveforms, lookup))
}

/// Parse a complete WBF container.
pub(crate) fn parse(buffer: &[u8]) -> Result<Container, ParseError> {
    let header = Header::parse(buffer)?;

    if header.filesize as usize != buffer.len() {
        return Err(ParseError::SizeMismatch {
            declared: header.filesize,
            actual: buffer.len(),
        });
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[0, 0, 0, 0]);
    hasher.update(&buffer[4..]);
    let crc = hasher.finalize();

    if crc != header.checksum {
        return Err(ParseError::Crc {
            expected: header.checksum,
            actual: crc,
        });
    }

    let mut cursor = Cursor::at(buffer, HEADER_LEN);
    let temperatures = parse_temperatures(&header, &mut cursor)?;

    // Skip the extra-information string (length byte, string, checksum)
    let extra_len = cursor.u8("extra information")?;
    cursor.take(usize::from(extra_len) + 1, "extra information")?;

    let mode_table = cursor;
    let mut blocks = find_blocks(&header, buffer, mode_table)?;
    blocks.push(buffer.len() as u32);

    let (waveforms, lookup) = parse_waveforms(&header, buffer, mode_table, &blocks)?;

    Ok(Container {
        header,
        temperatures,
        waveforms,
        lookup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_checksum_wraps() {
        assert_eq!(additive_checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(additive_checksum(&[]), 0);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            Header::parse(&[0u8; 12]),
            Err(ParseError::TooShort { actual: 12 })
        ));
    }

    #[test]
    fn test_pointer_checksum() {
        let data = [0x10, 0x20, 0x01, 0x31];
        let mut cursor = Cursor::at(&data, 0);
        assert_eq!(cursor.pointer("test").unwrap(), 0x01_2010);

        let bad = [0x10, 0x20, 0x01, 0x32];
        let mut cursor = Cursor::at(&bad, 0);
        assert!(matches!(
            cursor.pointer("test"),
            Err(ParseError::PointerChecksum { .. })
        ));
    }

    #[test]
    fn test_cursor_truncation() {
        let data = [0u8; 3];
        let mut cursor = Cursor::at(&data, 0);
        assert!(matches!(
            cursor.pointer("test"),
            Err(ParseError::Truncated { .. })
        ));
    }
}
