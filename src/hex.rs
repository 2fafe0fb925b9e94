//! Intel-HEX codec over a dense, growable memory image.
//!
//! Decoding writes every data record at its absolute address and backfills
//! any gap with [`FILL_BYTE`], so `bytes[i]` is always address `i`. Several
//! decodes can be layered into the same image (firmware plus bootloader).
//! Encoding walks the image in fixed-size lines and emits an
//! extended-linear-address record whenever the upper 16 address bits change.

use std::fs;
use std::num::NonZeroU8;
use std::path::Path;

use tracing::debug;

use crate::checksum::{byte_sum, hex_line_checksum};
use crate::error::HexError;

pub type Result<T> = std::result::Result<T, HexError>;

/// Value of unprogrammed flash.
pub const FILL_BYTE: u8 = 0xFF;
pub const DEFAULT_LINE_SIZE: NonZeroU8 = NonZeroU8::new(16).unwrap();
pub const EOF_LINE: &str = ":00000001FF";

/// Highest exclusive address reachable with extended linear addressing.
const ADDRESS_LIMIT: u64 = 1 << 32;
/// Byte count, two address bytes, record type and checksum.
const RECORD_OVERHEAD: usize = 5;
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    ExtendedLinearAddress,
    /// Any other type code, including start-address records (3 and 5).
    Unsupported(u8),
}

impl From<u8> for RecordType {
    fn from(code: u8) -> Self {
        match code {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Unsupported(other),
        }
    }
}

impl RecordType {
    pub fn code(self) -> u8 {
        match self {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::Unsupported(code) => code,
        }
    }
}

/// One line of HEX text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Low 16 address bits, before any extended base is applied.
    pub address: u16,
    pub record_type: RecordType,
    /// At most 255 bytes.
    pub data: Vec<u8>,
}

impl Record {
    pub fn extended_linear(upper: u16) -> Self {
        Self {
            address: 0,
            record_type: RecordType::ExtendedLinearAddress,
            data: upper.to_be_bytes().to_vec(),
        }
    }

    /// Parse a single trimmed, non-empty line. `line_no` is only used for
    /// error reporting.
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let malformed = |reason| HexError::Format {
            line: line_no,
            content: line.to_string(),
            reason,
        };

        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing ':' start code"))?;
        if digits.len() % 2 != 0 {
            return Err(malformed("odd number of hex digits"));
        }
        let bytes = digits
            .as_bytes()
            .chunks(2)
            .map(|pair| Some(hex_value(pair[0])? << 4 | hex_value(pair[1])?))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| malformed("invalid hex digit"))?;

        if bytes.len() < RECORD_OVERHEAD {
            return Err(malformed("record too short"));
        }
        let count = usize::from(bytes[0]);
        if bytes.len() != count + RECORD_OVERHEAD {
            return Err(malformed("byte count does not match record length"));
        }

        let computed = byte_sum(&bytes);
        if computed != 0 {
            return Err(HexError::Checksum {
                line: line_no,
                content: line.to_string(),
                computed,
            });
        }

        Ok(Self {
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            record_type: RecordType::from(bytes[3]),
            data: bytes[4..4 + count].to_vec(),
        })
    }

    /// Render as `:BBAAAATTDD..CC` with uppercase digits and no newline.
    pub fn to_line(&self) -> String {
        let mut bytes = Vec::with_capacity(self.data.len() + RECORD_OVERHEAD);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.address.to_be_bytes());
        bytes.push(self.record_type.code());
        bytes.extend_from_slice(&self.data);
        bytes.push(hex_line_checksum(&bytes));

        let mut line = String::with_capacity(1 + bytes.len() * 2);
        line.push(':');
        for byte in bytes {
            line.push(HEX_DIGITS[usize::from(byte >> 4)] as char);
            line.push(HEX_DIGITS[usize::from(byte & 0x0F)] as char);
        }
        line
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|d| d as u8)
}

/// What to do with record types the codec does not interpret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnsupportedRecords {
    #[default]
    Ignore,
    Reject,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub unsupported: UnsupportedRecords,
}

/// Flat memory image addressed from zero.
///
/// Two images are equal when they hold the same bytes; the extended address
/// base is decoder state, not content.
#[derive(Debug, Clone, Default)]
pub struct HexImage {
    bytes: Vec<u8>,
    extended_address_base: u16,
}

impl PartialEq for HexImage {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for HexImage {}

impl HexImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a complete HEX text into a fresh image.
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut image = Self::new();
        image.decode(text, 0)?;
        Ok(image)
    }

    /// Read and decode a HEX file on top of this image.
    pub fn load(&mut self, path: impl AsRef<Path>, offset: usize) -> Result<()> {
        self.load_with(path, offset, DecodeOptions::default())
    }

    pub fn load_with(
        &mut self,
        path: impl AsRef<Path>,
        offset: usize,
        options: DecodeOptions,
    ) -> Result<()> {
        let text = fs::read_to_string(path)?;
        self.decode_with(&text, offset, options)
    }

    /// Encode the image and write it to `path`.
    pub fn save(&self, path: impl AsRef<Path>, line_size: NonZeroU8) -> Result<()> {
        fs::write(path, self.encode(line_size))?;
        Ok(())
    }

    /// Decode `text` on top of this image, ignoring unsupported record types.
    /// `offset` is added to every data record address.
    pub fn decode(&mut self, text: &str, offset: usize) -> Result<()> {
        self.decode_with(text, offset, DecodeOptions::default())
    }

    pub fn decode_with(
        &mut self,
        text: &str,
        offset: usize,
        options: DecodeOptions,
    ) -> Result<()> {
        let offset = offset as u64;
        let mut records = 0usize;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let record = Record::parse(line, line_no)?;
            records += 1;

            match record.record_type {
                RecordType::Data => self.write_data(&record, offset, line_no, line)?,
                RecordType::EndOfFile => {}
                RecordType::ExtendedLinearAddress => {
                    let [hi, lo] = address_bytes(&record, line_no, line)?;
                    self.extended_address_base = u16::from_be_bytes([hi, lo]);
                    debug!(line = line_no, base = self.extended_address_base, "extended linear address");
                }
                RecordType::ExtendedSegmentAddress => {
                    let [hi, lo] = address_bytes(&record, line_no, line)?;
                    // Only the upper nibble of the segment moves data; the
                    // remaining segment bits never reach the data records.
                    self.extended_address_base = u16::from(hi >> 4);
                    debug!(line = line_no, base = self.extended_address_base, segment = u16::from_be_bytes([hi, lo]), "extended segment address");
                }
                RecordType::Unsupported(code) => match options.unsupported {
                    UnsupportedRecords::Ignore => {
                        debug!(line = line_no, record_type = code, "ignoring unsupported record");
                    }
                    UnsupportedRecords::Reject => {
                        return Err(HexError::UnsupportedRecord {
                            line: line_no,
                            record_type: code,
                        });
                    }
                },
            }
        }

        debug!(records, len = self.bytes.len(), "decoded hex text");
        Ok(())
    }

    fn write_data(
        &mut self,
        record: &Record,
        offset: u64,
        line_no: usize,
        line: &str,
    ) -> Result<()> {
        if record.data.is_empty() {
            return Ok(());
        }

        let start = (u64::from(self.extended_address_base) << 16) + u64::from(record.address) + offset;
        let end = start + record.data.len() as u64;
        let out_of_range = || HexError::Format {
            line: line_no,
            content: line.to_string(),
            reason: "record extends beyond the 32-bit address space",
        };
        if end > ADDRESS_LIMIT {
            return Err(out_of_range());
        }
        let start = usize::try_from(start).map_err(|_| out_of_range())?;
        let end = usize::try_from(end).map_err(|_| out_of_range())?;

        if end > self.bytes.len() {
            self.bytes.resize(end, FILL_BYTE);
        }
        self.bytes[start..end].copy_from_slice(&record.data);
        Ok(())
    }

    /// Encode the whole image, `line_size` data bytes per line, followed by
    /// the end-of-file record. Lines never straddle a 64 KiB boundary.
    pub fn encode(&self, line_size: NonZeroU8) -> String {
        let line_size = usize::from(line_size.get());
        let mut out = String::new();
        let mut upper = 0usize;
        let mut address = 0usize;

        while address < self.bytes.len() {
            let high = address >> 16;
            if high != upper {
                upper = high;
                push_line(&mut out, &Record::extended_linear(upper as u16));
            }

            let boundary = (high + 1) << 16;
            let end = (address + line_size).min(self.bytes.len()).min(boundary);
            let record = Record {
                address: (address & 0xFFFF) as u16,
                record_type: RecordType::Data,
                data: self.bytes[address..end].to_vec(),
            };
            push_line(&mut out, &record);
            address = end;
        }

        out.push_str(EOF_LINE);
        out.push('\n');
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Upper address bits set by the most recent extended address record.
    pub fn extended_address_base(&self) -> u16 {
        self.extended_address_base
    }

    /// Bytes that differ from [`FILL_BYTE`].
    pub fn populated(&self) -> usize {
        self.bytes.iter().filter(|&&b| b != FILL_BYTE).count()
    }
}

impl From<Vec<u8>> for HexImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extended_address_base: 0,
        }
    }
}

fn address_bytes(record: &Record, line_no: usize, line: &str) -> Result<[u8; 2]> {
    <[u8; 2]>::try_from(record.data.as_slice()).map_err(|_| HexError::Format {
        line: line_no,
        content: line.to_string(),
        reason: "extended address record must carry 2 data bytes",
    })
}

fn push_line(out: &mut String, record: &Record) {
    out.push_str(&record.to_line());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn line_size(n: u8) -> NonZeroU8 {
        NonZeroU8::new(n).unwrap()
    }

    /// Deterministic xorshift bytes.
    fn random_bytes(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect()
    }

    #[test]
    fn decodes_single_data_record() {
        let image = HexImage::from_hex(":04000000DEADBEEFC4\n:00000001FF\n").unwrap();
        assert_eq!(image.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn encodes_back_to_identical_text() {
        let text = ":04000000DEADBEEFC4\n:00000001FF\n";
        let image = HexImage::from_hex(text).unwrap();
        assert_eq!(image.encode(DEFAULT_LINE_SIZE), text);
    }

    #[test]
    fn empty_image_encodes_to_eof_only() {
        assert_eq!(HexImage::new().encode(DEFAULT_LINE_SIZE), ":00000001FF\n");
    }

    #[test]
    fn accepts_full_line_with_valid_checksum() {
        let image = HexImage::from_hex(":10000000AABBCCDDEEFF00112233445566778899F8").unwrap();
        assert_eq!(image.len(), 16);
        assert_eq!(image.as_bytes()[15], 0x99);
    }

    #[rstest]
    #[case(":10000000AABBCCDDEEFF00112233445566778899FF")]
    #[case(":10000000AABBCCDDEEFF00112233445566778899F9")]
    fn rejects_corrupted_checksum(#[case] line: &str) {
        let text = format!(":00000001FF\n{line}\n");
        let result = HexImage::from_hex(&text);
        assert_matches!(result, Err(HexError::Checksum { line: 2, content, .. }) if content == line);
    }

    #[rstest]
    #[case("04000000DEADBEEFC4", "missing ':' start code")]
    #[case(":04000000DEADBEEFC", "odd number of hex digits")]
    #[case(":04000000DEADBEXFC4", "invalid hex digit")]
    #[case(":000000", "record too short")]
    #[case(":05000000DEADBEEFC4", "byte count does not match record length")]
    #[case(":0100000400FB", "extended address record must carry 2 data bytes")]
    fn rejects_malformed_lines(#[case] line: &str, #[case] expected: &str) {
        let result = HexImage::from_hex(line);
        assert_matches!(result, Err(HexError::Format { line: 1, reason, .. }) if reason == expected);
    }

    #[test]
    fn backfills_gaps_with_fill_byte() {
        let text = ":0400000001020304F2\n:04001000A1A2A3A462\n:00000001FF\n";
        let image = HexImage::from_hex(text).unwrap();

        assert_eq!(image.len(), 0x14);
        assert_eq!(&image.as_bytes()[..4], &[1, 2, 3, 4]);
        assert!(image.as_bytes()[4..16].iter().all(|&b| b == FILL_BYTE));
        assert_eq!(&image.as_bytes()[16..], &[0xA1, 0xA2, 0xA3, 0xA4]);
        assert_eq!(image.populated(), 8);
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        let text = "\r\n:04000000DEADBEEFC4\r\n\r\n:00000001FF\r\n";
        let image = HexImage::from_hex(text).unwrap();
        assert_eq!(image.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn extended_linear_address_moves_data_up() {
        let image = HexImage::from_hex(":020000040001F9\n:0100000042BD\n:00000001FF\n").unwrap();

        assert_eq!(image.len(), 0x10001);
        assert_eq!(image.as_bytes()[0x10000], 0x42);
        assert_eq!(image.as_bytes()[0xFFFF], FILL_BYTE);
        assert_eq!(image.extended_address_base(), 1);
    }

    #[test]
    fn extended_segment_address_maps_to_physical_address() {
        // Segment 0x1000 is physical 0x10000.
        let image = HexImage::from_hex(":020000021000EC\n:0100000042BD\n").unwrap();

        assert_eq!(image.len(), 0x10001);
        assert_eq!(image.as_bytes()[0x10000], 0x42);
        assert_eq!(image.extended_address_base(), 1);
    }

    #[test]
    fn segment_record_does_not_shift_later_records() {
        let text = ":020000021000EC\n:0100000042BD\n:0100100043AC\n";
        let image = HexImage::from_hex(text).unwrap();

        assert_eq!(image.len(), 0x10011);
        assert_eq!(image.as_bytes()[0x10000], 0x42);
        assert_eq!(image.as_bytes()[0x10010], 0x43);
    }

    #[test]
    fn segment_record_keeps_caller_offset() {
        let mut image = HexImage::new();
        image.decode(":020000021000EC\n:0100000042BD\n", 0x20).unwrap();

        assert_eq!(image.len(), 0x10021);
        assert_eq!(image.as_bytes()[0x10020], 0x42);
    }

    #[test]
    fn caller_offset_shifts_data_records() {
        let mut image = HexImage::new();
        image.decode(":0100000042BD\n", 0x100).unwrap();

        assert_eq!(image.len(), 0x101);
        assert_eq!(image.as_bytes()[0x100], 0x42);
    }

    #[test]
    fn layered_decodes_merge_into_one_image() {
        let mut image = HexImage::new();
        image.decode(":0400000001020304F2\n:00000001FF\n", 0).unwrap();
        image.decode(":02000000AABB99\n:00000001FF\n", 0x20).unwrap();

        assert_eq!(image.len(), 0x22);
        assert_eq!(&image.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(&image.as_bytes()[0x20..], &[0xAA, 0xBB]);
    }

    #[test]
    fn overlapping_decode_rewrites_only_its_range() {
        let mut image = HexImage::new();
        image.decode(":0400000001020304F2\n", 0).unwrap();
        image.decode(":02000100AABB98\n", 0).unwrap();

        assert_eq!(image.as_bytes(), &[1, 0xAA, 0xBB, 4]);
    }

    #[test]
    fn unsupported_records_are_ignored_by_default() {
        let image = HexImage::from_hex(":0400000500000000F7\n:00000001FF\n").unwrap();
        assert!(image.is_empty());
    }

    #[test]
    fn unsupported_records_can_be_rejected() {
        let options = DecodeOptions {
            unsupported: UnsupportedRecords::Reject,
        };
        let result =
            HexImage::new().decode_with(":00000001FF\n:0400000500000000F7\n", 0, options);
        assert_matches!(
            result,
            Err(HexError::UnsupportedRecord {
                line: 2,
                record_type: 0x05,
            })
        );
    }

    #[test]
    fn record_type_codes_are_stable() {
        for code in 0..=u8::MAX {
            assert_eq!(RecordType::from(code).code(), code);
        }
        assert_eq!(RecordType::from(3), RecordType::Unsupported(3));
    }

    #[rstest]
    fn round_trips_random_images(
        #[values(8, 16, 32)] size: u8,
        #[values(0, 1, 15, 16, 17, 1000)] len: usize,
    ) {
        let image = HexImage::from(random_bytes(len, 0x1234_5678 ^ len as u32));
        let decoded = HexImage::from_hex(&image.encode(line_size(size))).unwrap();
        assert_eq!(decoded, image);
    }

    #[rstest]
    #[case(8)]
    #[case(16)]
    #[case(24)]
    #[case(255)]
    fn round_trips_across_64k_boundaries(#[case] size: u8) {
        let image = HexImage::from(random_bytes(0x2_0010, 0xC0FF_EE11));
        let text = image.encode(line_size(size));

        let decoded = HexImage::from_hex(&text).unwrap();
        assert_eq!(decoded.extended_address_base(), 2);
        assert!(decoded == image);
    }

    #[test]
    fn emits_extended_linear_record_at_64k() {
        let mut bytes = vec![0u8; 0x10010];
        bytes[0xFFFF] = 0x5A;
        bytes[0x10000] = 0xA5;
        let image = HexImage::from(bytes);

        let text = image.encode(DEFAULT_LINE_SIZE);
        let lines: Vec<&str> = text.lines().collect();

        let ext = lines.iter().position(|l| *l == ":020000040001F9").unwrap();
        assert_eq!(ext, 0x1000);
        assert!(lines[ext - 1].starts_with(":10FFF000"));
        assert!(lines[ext + 1].starts_with(":10000000A5"));
        assert_eq!(lines.last(), Some(&EOF_LINE));

        let decoded = HexImage::from_hex(&text).unwrap();
        assert_eq!(decoded.as_bytes()[0xFFFF], 0x5A);
        assert_eq!(decoded.as_bytes()[0x10000], 0xA5);
    }

    #[test]
    fn odd_line_size_splits_at_64k_boundary() {
        let image = HexImage::from(vec![0x11; 0x10008]);
        let text = image.encode(line_size(24));
        let lines: Vec<&str> = text.lines().collect();

        let ext = lines.iter().position(|l| *l == ":020000040001F9").unwrap();
        // 0x10000 = 2730 * 24 + 16
        assert!(lines[ext - 1].starts_with(":10FFF000"));
        assert!(lines[ext + 1].starts_with(":08000000"));
    }

    #[test]
    fn last_line_is_shortened() {
        let image = HexImage::from(vec![0x00; 20]);
        let text = image.encode(DEFAULT_LINE_SIZE);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], ":0400100000000000EC");
    }

    #[test]
    fn images_compare_by_content() {
        let decoded = HexImage::from_hex(":020000040001F9\n:0100000042BD\n").unwrap();
        let mut bytes = vec![FILL_BYTE; 0x10001];
        bytes[0x10000] = 0x42;

        assert_eq!(decoded, HexImage::from(bytes));
        assert_ne!(decoded, HexImage::new());
    }

    #[test]
    fn load_with_applies_decode_options() {
        let path = std::env::temp_dir().join(format!("stkflash-strict-{}.hex", std::process::id()));
        fs::write(&path, ":0400000500000000F7\n:00000001FF\n").unwrap();
        let options = DecodeOptions {
            unsupported: UnsupportedRecords::Reject,
        };

        let result = HexImage::new().load_with(&path, 0, options);
        let _ = fs::remove_file(&path);

        assert_matches!(result, Err(HexError::UnsupportedRecord { line: 1, record_type: 0x05 }));
    }

    #[test]
    fn save_then_load_reproduces_image() {
        let path = std::env::temp_dir().join(format!("stkflash-{}.hex", std::process::id()));
        let image = HexImage::from(random_bytes(300, 7));

        image.save(&path, line_size(32)).unwrap();
        let mut loaded = HexImage::new();
        loaded.load(&path, 0).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, image);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = HexImage::new().load("/nonexistent/stkflash/firmware.hex", 0);
        assert_matches!(result, Err(HexError::Io(_)));
    }
}
