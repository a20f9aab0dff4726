//! Firmware image loading.
//!
//! Images come either as raw binaries or as Intel HEX text, which is decoded
//! to a flat buffer before streaming.

use std::path::Path;

use log::info;
use sha2::{Digest, Sha256};

use super::error::FlashResult;
use super::hex::{parse_hex_with, HexParseOptions};

/// Immutable firmware bytes plus the address they are loaded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    load_address: u32,
}

impl FirmwareImage {
    /// Wrap a raw binary; load address 0.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            load_address: 0,
        }
    }

    /// Decode Intel HEX text.
    ///
    /// The load address stays 0; use [`with_load_address`](Self::with_load_address)
    /// to target a different base.
    pub fn from_hex(text: &str, options: HexParseOptions) -> FlashResult<Self> {
        let parsed = parse_hex_with(text, options)?;
        Ok(Self::from_bytes(parsed.data))
    }

    /// Read an image from disk.
    ///
    /// Files ending in `.hex` or `.ihex` are decoded as Intel HEX; anything
    /// else is taken as a raw binary.
    pub fn load<P: AsRef<Path>>(path: P, options: HexParseOptions) -> FlashResult<Self> {
        let path = path.as_ref();
        let is_hex = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex"))
            .unwrap_or(false);

        let image = if is_hex {
            let text = std::fs::read_to_string(path)?;
            Self::from_hex(&text, options)?
        } else {
            Self::from_bytes(std::fs::read(path)?)
        };

        info!(
            "Loaded {} ({} bytes, sha256 {})",
            path.display(),
            image.len(),
            image.sha256()
        );
        Ok(image)
    }

    pub fn with_load_address(mut self, load_address: u32) -> Self {
        self.load_address = load_address;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lowercase hex SHA-256 of the image bytes.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        format!("{:x}", hasher.finalize())
    }
}
