//! Intel HEX decoder.
//!
//! Flattens the data records of a HEX file into one contiguous buffer. Record
//! addresses are parsed but not used for placement: data records are
//! concatenated in file order, so images with gaps or out-of-order records are
//! not reproduced at their real offsets.

use log::debug;

use super::error::{FlashError, FlashResult};

/// Record type for a data record.
pub const RECORD_TYPE_DATA: u8 = 0x00;

/// Options controlling how strictly records are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HexParseOptions {
    /// Reject lines whose checksum byte does not match.
    pub verify_checksums: bool,
}

/// One parsed record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub byte_count: u8,
    pub address: u16,
    pub record_type: u8,
    pub data: Vec<u8>,
    pub checksum: Option<u8>,
}

impl HexRecord {
    /// Two's-complement checksum over count, address, type and data.
    pub fn computed_checksum(&self) -> u8 {
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        let sum = self
            .data
            .iter()
            .fold(
                self.byte_count
                    .wrapping_add(addr_hi)
                    .wrapping_add(addr_lo)
                    .wrapping_add(self.record_type),
                |acc, &b| acc.wrapping_add(b),
            );
        (!sum).wrapping_add(1)
    }
}

/// Result of decoding a HEX file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHex {
    /// Concatenated payloads of all data records.
    pub data: Vec<u8>,
    /// Address field of the first data record, if any.
    pub first_address: Option<u16>,
    /// Number of data records seen.
    pub data_records: usize,
}

/// Decode HEX text into a flat byte buffer using default options.
pub fn parse_hex(text: &str) -> FlashResult<Vec<u8>> {
    Ok(parse_hex_with(text, HexParseOptions::default())?.data)
}

/// Decode HEX text with explicit options.
pub fn parse_hex_with(text: &str, options: HexParseOptions) -> FlashResult<ParsedHex> {
    let mut parsed = ParsedHex::default();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if !line.starts_with(':') {
            continue;
        }

        let record = parse_record(line, index + 1)?;

        if options.verify_checksums {
            verify_checksum(&record, index + 1)?;
        }

        if record.record_type != RECORD_TYPE_DATA {
            continue;
        }

        if parsed.first_address.is_none() {
            parsed.first_address = Some(record.address);
        }
        parsed.data_records += 1;
        parsed.data.extend_from_slice(&record.data);
    }

    debug!(
        "Parsed {} HEX data records ({} bytes)",
        parsed.data_records,
        parsed.data.len()
    );

    Ok(parsed)
}

/// Parse a single record line (starting with ':').
fn parse_record(line: &str, line_number: usize) -> FlashResult<HexRecord> {
    let malformed = |reason: String| FlashError::MalformedRecord {
        line: line_number,
        reason,
    };

    // ':' + count(2) + address(4) + type(2)
    const HEADER_LEN: usize = 9;
    if line.len() < HEADER_LEN {
        return Err(malformed(format!(
            "record is {} characters, header needs {}",
            line.len(),
            HEADER_LEN
        )));
    }
    if !line.is_ascii() {
        return Err(malformed("record contains non-ASCII characters".into()));
    }

    let byte_count = hex_byte(line, 1).ok_or_else(|| malformed("invalid byte count".into()))?;
    let address_hi = hex_byte(line, 3).ok_or_else(|| malformed("invalid address".into()))?;
    let address_lo = hex_byte(line, 5).ok_or_else(|| malformed("invalid address".into()))?;
    let record_type = hex_byte(line, 7).ok_or_else(|| malformed("invalid record type".into()))?;

    let data_end = HEADER_LEN + byte_count as usize * 2;
    if line.len() < data_end {
        return Err(malformed(format!(
            "declared {} data bytes but record is only {} characters",
            byte_count,
            line.len()
        )));
    }

    let data = (0..byte_count as usize)
        .map(|i| hex_byte(line, HEADER_LEN + i * 2))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| malformed("invalid data byte".into()))?;

    let checksum = if line.len() >= data_end + 2 {
        Some(hex_byte(line, data_end).ok_or_else(|| malformed("invalid checksum".into()))?)
    } else {
        None
    };

    Ok(HexRecord {
        byte_count,
        address: u16::from_be_bytes([address_hi, address_lo]),
        record_type,
        data,
        checksum,
    })
}

fn verify_checksum(record: &HexRecord, line_number: usize) -> FlashResult<()> {
    let expected = record.computed_checksum();
    match record.checksum {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(FlashError::MalformedRecord {
            line: line_number,
            reason: format!(
                "checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
                expected, actual
            ),
        }),
        None => Err(FlashError::MalformedRecord {
            line: line_number,
            reason: "missing checksum".into(),
        }),
    }
}

/// Read two hex digits at `offset`.
fn hex_byte(line: &str, offset: usize) -> Option<u8> {
    line.get(offset..offset + 2)
        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
}
