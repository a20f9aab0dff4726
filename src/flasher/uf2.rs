//! UF2 block encoding and decoding.
//!
//! Each block is 512 bytes: a 32-byte header of eight little-endian u32
//! fields, a 476-byte data region and a 4-byte trailing magic.
//!
//! | Offset | Field          |
//! |--------|----------------|
//! | 0      | magic start 0  |
//! | 4      | magic start 1  |
//! | 8      | flags          |
//! | 12     | target address |
//! | 16     | payload size   |
//! | 20     | block index    |
//! | 24     | total blocks   |
//! | 28     | family ID      |
//! | 32     | data (476)     |
//! | 508    | magic end      |

use log::debug;

use super::config::{
    UF2_BLOCK_SIZE, UF2_FLAG_FAMILY_ID_PRESENT, UF2_HEADER_SIZE, UF2_MAGIC_END,
    UF2_MAGIC_START0, UF2_MAGIC_START1, UF2_PAYLOAD_CAPACITY,
};
use super::error::{FlashError, FlashResult};

const MAGIC_END_OFFSET: usize = UF2_HEADER_SIZE + UF2_PAYLOAD_CAPACITY;

/// A single UF2 block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Block {
    pub flags: u32,
    pub target_address: u32,
    pub payload_size: u32,
    pub block_index: u32,
    pub total_blocks: u32,
    /// Raw family ID field (only meaningful when the family flag is set).
    pub family_field: u32,
    pub data: [u8; UF2_PAYLOAD_CAPACITY],
}

impl Uf2Block {
    /// Family ID, if the block declares one.
    pub fn family_id(&self) -> Option<u32> {
        if self.flags & UF2_FLAG_FAMILY_ID_PRESENT != 0 {
            Some(self.family_field)
        } else {
            None
        }
    }

    /// The meaningful part of the data region.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_size as usize).min(UF2_PAYLOAD_CAPACITY);
        &self.data[..len]
    }

    /// Serialize to the 512-byte wire format.
    pub fn to_bytes(&self) -> [u8; UF2_BLOCK_SIZE] {
        let mut block = [0u8; UF2_BLOCK_SIZE];

        let header = [
            UF2_MAGIC_START0,
            UF2_MAGIC_START1,
            self.flags,
            self.target_address,
            self.payload_size,
            self.block_index,
            self.total_blocks,
            self.family_field,
        ];
        for (i, word) in header.iter().enumerate() {
            block[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }

        block[UF2_HEADER_SIZE..MAGIC_END_OFFSET].copy_from_slice(&self.data);
        block[MAGIC_END_OFFSET..].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());

        block
    }
}

/// Build a UF2 block around `payload`.
///
/// Payloads shorter than the 476-byte data region are zero-padded.
pub fn encode(
    payload: &[u8],
    block_index: u32,
    total_blocks: u32,
    target_address: u32,
    family_id: Option<u32>,
) -> FlashResult<Uf2Block> {
    if payload.len() > UF2_PAYLOAD_CAPACITY {
        return Err(FlashError::BlockOverflow {
            size: payload.len(),
            max_size: UF2_PAYLOAD_CAPACITY,
        });
    }

    let padding = UF2_PAYLOAD_CAPACITY - payload.len();
    if padding > 0 {
        debug!(
            "UF2 block {}/{}: {} payload bytes, {} bytes zero padding",
            block_index,
            total_blocks,
            payload.len(),
            padding
        );
    }

    let mut data = [0u8; UF2_PAYLOAD_CAPACITY];
    data[..payload.len()].copy_from_slice(payload);

    let (flags, family_field) = match family_id {
        Some(id) => (UF2_FLAG_FAMILY_ID_PRESENT, id),
        None => (0, 0),
    };

    Ok(Uf2Block {
        flags,
        target_address,
        payload_size: payload.len() as u32,
        block_index,
        total_blocks,
        family_field,
        data,
    })
}

/// Parse and validate a 512-byte UF2 block.
pub fn decode(bytes: &[u8]) -> FlashResult<Uf2Block> {
    if bytes.len() != UF2_BLOCK_SIZE {
        return Err(FlashError::InvalidBlock {
            reason: format!("expected {} bytes, got {}", UF2_BLOCK_SIZE, bytes.len()),
        });
    }

    let word = |offset: usize| {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };

    check_magic("start 0", word(0), UF2_MAGIC_START0)?;
    check_magic("start 1", word(4), UF2_MAGIC_START1)?;
    check_magic("end", word(MAGIC_END_OFFSET), UF2_MAGIC_END)?;

    let mut data = [0u8; UF2_PAYLOAD_CAPACITY];
    data.copy_from_slice(&bytes[UF2_HEADER_SIZE..MAGIC_END_OFFSET]);

    Ok(Uf2Block {
        flags: word(8),
        target_address: word(12),
        payload_size: word(16),
        block_index: word(20),
        total_blocks: word(24),
        family_field: word(28),
        data,
    })
}

/// Like [`decode`], but also rejects blocks whose header is inconsistent.
pub fn decode_strict(bytes: &[u8]) -> FlashResult<Uf2Block> {
    let block = decode(bytes)?;

    if block.payload_size as usize > UF2_PAYLOAD_CAPACITY {
        return Err(FlashError::InvalidBlock {
            reason: format!(
                "payload size {} exceeds capacity {}",
                block.payload_size, UF2_PAYLOAD_CAPACITY
            ),
        });
    }
    if block.block_index >= block.total_blocks {
        return Err(FlashError::InvalidBlock {
            reason: format!(
                "block index {} out of range for {} blocks",
                block.block_index, block.total_blocks
            ),
        });
    }

    Ok(block)
}

fn check_magic(name: &str, actual: u32, expected: u32) -> FlashResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(FlashError::InvalidBlock {
            reason: format!(
                "magic {} mismatch: expected 0x{:08X}, got 0x{:08X}",
                name, expected, actual
            ),
        })
    }
}
