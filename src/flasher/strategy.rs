//! Block encoding strategies.
//!
//! The orchestrator only knows how many blocks an image has and how to get the
//! bytes for block `i`; the strategies decide what those bytes are.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{block_count, DEFAULT_CHUNK_SIZE, INTER_CHUNK_DELAY, UF2_PAYLOAD_CAPACITY};
use super::error::{FlashError, FlashResult};
use super::firmware::FirmwareImage;
use super::uf2;

/// Turns a firmware image into an ordered sequence of wire blocks.
pub trait BlockEncodingStrategy: Send + Sync {
    /// Short name for logs and progress events.
    fn name(&self) -> &'static str;

    /// Image bytes carried per block.
    fn block_size(&self) -> usize;

    /// Number of blocks needed for `image`.
    fn block_count(&self, image: &FirmwareImage) -> usize {
        block_count(image.len(), self.block_size())
    }

    /// Wire bytes for block `index` of `total`.
    fn encode_block(&self, image: &FirmwareImage, index: usize, total: usize)
        -> FlashResult<Vec<u8>>;

    /// Pause after each block is written.
    fn inter_block_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Image bytes covered by block `index`.
fn block_slice(image: &FirmwareImage, index: usize, size: usize) -> &[u8] {
    let start = (index * size).min(image.len());
    let end = (start + size).min(image.len());
    &image.data()[start..end]
}

/// Unframed chunks written as-is.
///
/// There is no flow control from the device, so a fixed delay after each
/// chunk keeps a slow receiver from overflowing.
#[derive(Debug, Clone)]
pub struct RawChunked {
    chunk_size: usize,
    delay: Duration,
}

impl RawChunked {
    pub fn new(chunk_size: usize) -> FlashResult<Self> {
        if chunk_size == 0 {
            return Err(FlashError::InvalidConfig {
                reason: "chunk size must be at least 1 byte".into(),
            });
        }
        Ok(Self {
            chunk_size,
            delay: INTER_CHUNK_DELAY,
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl BlockEncodingStrategy for RawChunked {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn block_size(&self) -> usize {
        self.chunk_size
    }

    fn encode_block(
        &self,
        image: &FirmwareImage,
        index: usize,
        _total: usize,
    ) -> FlashResult<Vec<u8>> {
        Ok(block_slice(image, index, self.chunk_size).to_vec())
    }

    fn inter_block_delay(&self) -> Duration {
        self.delay
    }
}

/// 512-byte UF2 blocks.
///
/// The last piece is zero-padded to `data_per_block`, so every block declares
/// the same payload size.
#[derive(Debug, Clone)]
pub struct Uf2Framed {
    data_per_block: usize,
    family_id: Option<u32>,
}

impl Uf2Framed {
    /// `data_per_block` must fit the 476-byte data region.
    pub fn new(data_per_block: usize) -> FlashResult<Self> {
        if data_per_block > UF2_PAYLOAD_CAPACITY {
            return Err(FlashError::BlockOverflow {
                size: data_per_block,
                max_size: UF2_PAYLOAD_CAPACITY,
            });
        }
        if data_per_block == 0 {
            return Err(FlashError::InvalidConfig {
                reason: "UF2 data per block must be at least 1 byte".into(),
            });
        }
        Ok(Self {
            data_per_block,
            family_id: None,
        })
    }

    pub fn with_family_id(mut self, family_id: Option<u32>) -> Self {
        self.family_id = family_id;
        self
    }
}

impl BlockEncodingStrategy for Uf2Framed {
    fn name(&self) -> &'static str {
        "uf2"
    }

    fn block_size(&self) -> usize {
        self.data_per_block
    }

    fn encode_block(
        &self,
        image: &FirmwareImage,
        index: usize,
        total: usize,
    ) -> FlashResult<Vec<u8>> {
        let mut payload = block_slice(image, index, self.data_per_block).to_vec();
        payload.resize(self.data_per_block, 0);

        let offset = (index * self.data_per_block) as u32;
        let block = uf2::encode(
            &payload,
            index as u32,
            total as u32,
            image.load_address().wrapping_add(offset),
            self.family_id,
        )?;
        Ok(block.to_bytes().to_vec())
    }
}

/// Serializable selection of a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum FlashMode {
    #[serde(rename_all = "camelCase")]
    RawChunked { chunk_size: usize },
    #[serde(rename_all = "camelCase")]
    Uf2Framed {
        data_per_block: usize,
        #[serde(default)]
        family_id: Option<u32>,
    },
}

impl Default for FlashMode {
    fn default() -> Self {
        FlashMode::RawChunked {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl FlashMode {
    /// Build the strategy; `inter_chunk_delay` applies to raw mode only.
    pub fn strategy(
        &self,
        inter_chunk_delay: Duration,
    ) -> FlashResult<Box<dyn BlockEncodingStrategy>> {
        Ok(match self {
            FlashMode::RawChunked { chunk_size } => {
                Box::new(RawChunked::new(*chunk_size)?.with_delay(inter_chunk_delay))
            }
            FlashMode::Uf2Framed {
                data_per_block,
                family_id,
            } => Box::new(Uf2Framed::new(*data_per_block)?.with_family_id(*family_id)),
        })
    }
}
