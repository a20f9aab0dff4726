//! Serial firmware flasher.
//!
//! [`flasher`] holds the blocking engine, [`commands`] the async wrappers and
//! [`settings`] the persisted tunables.

pub mod commands;
pub mod flasher;
pub mod settings;

#[cfg(test)]
pub mod test_helpers;
