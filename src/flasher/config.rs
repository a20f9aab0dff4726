//! Configuration constants for the firmware transfer engine.

use std::time::Duration;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate used for normal operation and for talking to the bootloader.
pub const NORMAL_BAUD_RATE: u32 = 115_200;

/// Baud rate that the application firmware interprets as "reset into bootloader".
pub const TOUCH_BAUD_RATE: u32 = 1200;

/// Serial read timeout for individual read operations.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout used when opening the port for the touch trigger.
pub const TOUCH_OPEN_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the control signals stay asserted before the trigger edge.
pub const TOUCH_SIGNAL_HOLD: Duration = Duration::from_millis(50);

// ============================================================================
// Bootloader Handshake Timing
// ============================================================================

/// Wait after the touch before looking for the re-enumerated device.
///
/// Windows needs extra time for USB driver re-enumeration.
#[cfg(target_os = "windows")]
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Wait after the touch before looking for the re-enumerated device.
#[cfg(not(target_os = "windows"))]
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(400);

/// Timeout waiting for the bootloader to appear after the touch.
pub const REENUMERATION_TIMEOUT_MS: u64 = 10_000;

/// Interval between port scans when waiting for re-enumeration.
pub const PORT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts made to open a port that reports a transient error.
pub const MAX_OPEN_RETRIES: u32 = 10;

/// Delay between open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Block Streaming
// ============================================================================

/// Default chunk size for raw (unframed) writes.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Delay between raw chunks so a slow receiver does not overflow.
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(50);

// ============================================================================
// UF2 Layout
// ============================================================================

/// Size of one UF2 block on the wire.
pub const UF2_BLOCK_SIZE: usize = 512;

/// Bytes before the data region (eight u32 fields).
pub const UF2_HEADER_SIZE: usize = 32;

/// Bytes after the data region (magic-end).
pub const UF2_FOOTER_SIZE: usize = 4;

/// Usable data bytes per block: 512 - 32 - 4.
pub const UF2_PAYLOAD_CAPACITY: usize = UF2_BLOCK_SIZE - UF2_HEADER_SIZE - UF2_FOOTER_SIZE;

/// First magic word.
pub const UF2_MAGIC_START0: u32 = 0x0A32_4655;

/// Second magic word.
pub const UF2_MAGIC_START1: u32 = 0x9E5D_5157;

/// Final magic word.
pub const UF2_MAGIC_END: u32 = 0x0AB1_6F30;

/// Flag set when the family ID field is meaningful.
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

// ============================================================================
// Command Channel
// ============================================================================

/// Line terminator appended to every outbound command.
pub const COMMAND_TERMINATOR: &str = "\n";

/// Read timeout for one iteration of the receive loop.
///
/// Bounds how long the loop can take to notice a disconnect.
pub const RECEIVE_POLL_TIMEOUT_MS: u64 = 100;

/// Buffer size for one read in the receive loop.
pub const RECEIVE_BUFFER_SIZE: usize = 256;

/// Calculate how many blocks of `block_size` are needed for `len` bytes.
///
/// Rounds up so a trailing partial block is never dropped.
pub fn block_count(len: usize, block_size: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    len.div_ceil(block_size)
}

/// Percentage of `done` out of `total`, rounded to the nearest integer.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total) as u64;
    let total = total as u64;
    ((done * 200 + total) / (2 * total)) as u8
}
