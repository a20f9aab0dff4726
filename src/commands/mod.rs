//! Async wrappers for callers running on tokio.

pub mod flash;

pub use flash::{detect_devices, flash_firmware, flash_image, FlashProgressEvent, FlashRequest};
