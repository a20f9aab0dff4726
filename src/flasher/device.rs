//! Device discovery across mode switches.
//!
//! After the bootloader touch the device drops off the bus and re-enumerates,
//! possibly under a different port name. A [`DeviceWatcher`] finds it again.

use std::time::{Duration, Instant};

use log::debug;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

use super::config::PORT_SCAN_INTERVAL;
use super::error::{FlashError, FlashResult};

/// Information about a detected serial device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDevice {
    /// Serial port path.
    pub port: String,
    /// USB Vendor ID (if a USB device).
    pub vid: Option<u16>,
    /// USB Product ID (if a USB device).
    pub pid: Option<u16>,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
    /// Product name (if available).
    pub product_name: Option<String>,
}

/// Supplies the port of a device that has just re-enumerated.
#[cfg_attr(test, automock)]
pub trait DeviceWatcher: Send {
    /// Called right before the touch so the watcher can snapshot the bus.
    fn prepare(&mut self, previous_port: &str);

    /// Block until the device shows up again and return its port name.
    fn wait_for_device(&mut self, previous_port: &str, timeout: Duration) -> FlashResult<String>;
}

/// Watcher for devices that keep their port identity across the reset.
#[derive(Debug, Default, Clone)]
pub struct SamePortWatcher;

impl DeviceWatcher for SamePortWatcher {
    fn prepare(&mut self, _previous_port: &str) {}

    fn wait_for_device(&mut self, previous_port: &str, _timeout: Duration) -> FlashResult<String> {
        Ok(previous_port.to_string())
    }
}

/// Watcher that polls the system's serial port list.
///
/// Tracks the device by USB serial number when one is known; otherwise picks
/// the first port that was not present before the touch. A port that existed
/// before the touch only counts once the previous port has been seen gone.
#[derive(Debug, Default, Clone)]
pub struct SerialPortWatcher {
    serial_number: Option<String>,
    known_ports: Vec<String>,
    previous_gone: bool,
}

impl SerialPortWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the device by its USB serial number.
    pub fn with_serial_number(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: Some(serial_number.into()),
            ..Self::default()
        }
    }

    /// Inspect one scan of the bus and return the device's port once it is back.
    fn observe(&mut self, devices: &[SerialDevice], previous_port: &str) -> Option<String> {
        let previous_present = devices.iter().any(|d| d.port == previous_port);
        if !previous_present && !self.previous_gone {
            debug!("{} dropped off the bus", previous_port);
            self.previous_gone = true;
        }

        if let Some(port) = pick_reenumerated(
            devices,
            self.serial_number.as_deref(),
            &self.known_ports,
            self.previous_gone,
        ) {
            return Some(port);
        }

        if self.serial_number.is_none() && previous_present && self.previous_gone {
            return Some(previous_port.to_string());
        }
        None
    }
}

impl DeviceWatcher for SerialPortWatcher {
    fn prepare(&mut self, previous_port: &str) {
        self.known_ports = list_serial_devices()
            .into_iter()
            .map(|d| d.port)
            .collect();

        if self.serial_number.is_none() {
            self.serial_number = list_serial_devices()
                .into_iter()
                .find(|d| d.port == previous_port)
                .and_then(|d| d.serial_number);
        }
        self.previous_gone = false;
        debug!(
            "Watching for re-enumeration of {} (serial {:?})",
            previous_port, self.serial_number
        );
    }

    fn wait_for_device(&mut self, previous_port: &str, timeout: Duration) -> FlashResult<String> {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if let Some(port) = self.observe(&list_serial_devices(), previous_port) {
                debug!("Device re-enumerated on {}", port);
                return Ok(port);
            }
            std::thread::sleep(PORT_SCAN_INTERVAL);
        }

        Err(FlashError::BootloaderTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

/// Choose the port a re-enumerated device appeared on.
///
/// Ports in `known_ports` were there before the touch and are skipped until
/// the previous port has gone away.
fn pick_reenumerated(
    devices: &[SerialDevice],
    serial_number: Option<&str>,
    known_ports: &[String],
    previous_gone: bool,
) -> Option<String> {
    let is_new = |d: &&SerialDevice| !known_ports.contains(&d.port);
    match serial_number {
        Some(serial) => devices
            .iter()
            .filter(|d| d.serial_number.as_deref() == Some(serial))
            .find(|d| previous_gone || is_new(d))
            .map(|d| d.port.clone()),
        None => devices.iter().find(is_new).map(|d| d.port.clone()),
    }
}

/// Find all serial devices currently attached.
///
/// On macOS, filters out `tty.*` ports to avoid duplicates (each device
/// appears as both `cu.*` and `tty.*`).
pub fn list_serial_devices() -> Vec<SerialDevice> {
    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(_) => return Vec::new(),
    };

    ports
        .into_iter()
        .filter(|port| !(cfg!(target_os = "macos") && port.port_name.contains("/dev/tty.")))
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDevice {
                port: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                product_name: usb_info.product,
            },
            _ => SerialDevice {
                port: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                product_name: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(port: &str, serial: Option<&str>) -> SerialDevice {
        SerialDevice {
            port: port.to_string(),
            vid: Some(0x239A),
            pid: Some(0x0029),
            serial_number: serial.map(str::to_string),
            product_name: None,
        }
    }

    #[test]
    fn test_same_port_watcher_returns_previous_port() {
        let mut watcher = SamePortWatcher;
        watcher.prepare("COM3");
        let port = watcher
            .wait_for_device("COM3", Duration::from_millis(1))
            .unwrap();
        assert_eq!(port, "COM3");
    }

    fn watcher(serial: Option<&str>, known: &[&str]) -> SerialPortWatcher {
        SerialPortWatcher {
            serial_number: serial.map(str::to_string),
            known_ports: known.iter().map(|p| p.to_string()).collect(),
            previous_gone: false,
        }
    }

    #[test]
    fn test_pick_by_serial_number() {
        let devices = vec![
            device("/dev/ttyACM0", Some("OTHER")),
            device("/dev/ttyACM1", Some("ABC123")),
        ];
        assert_eq!(
            pick_reenumerated(&devices, Some("ABC123"), &[], false),
            Some("/dev/ttyACM1".to_string())
        );
        assert_eq!(pick_reenumerated(&devices, Some("MISSING"), &[], false), None);
    }

    #[test]
    fn test_pick_first_new_port_without_serial() {
        let devices = vec![device("/dev/ttyACM0", None), device("/dev/ttyACM2", None)];
        let known = vec!["/dev/ttyACM0".to_string()];
        assert_eq!(
            pick_reenumerated(&devices, None, &known, false),
            Some("/dev/ttyACM2".to_string())
        );
    }

    #[test]
    fn test_serial_device_on_pre_touch_port_is_not_accepted() {
        let mut watcher = watcher(Some("ABC123"), &["/dev/ttyACM0"]);
        let before_reset = vec![device("/dev/ttyACM0", Some("ABC123"))];

        // Still the application port; the reset has not happened yet
        assert_eq!(watcher.observe(&before_reset, "/dev/ttyACM0"), None);
        assert_eq!(watcher.observe(&before_reset, "/dev/ttyACM0"), None);
    }

    #[test]
    fn test_serial_device_accepted_after_port_drops_and_returns() {
        let mut watcher = watcher(Some("ABC123"), &["/dev/ttyACM0"]);
        let present = vec![device("/dev/ttyACM0", Some("ABC123"))];

        assert_eq!(watcher.observe(&present, "/dev/ttyACM0"), None);
        assert_eq!(watcher.observe(&[], "/dev/ttyACM0"), None);
        assert_eq!(
            watcher.observe(&present, "/dev/ttyACM0"),
            Some("/dev/ttyACM0".to_string())
        );
    }

    #[test]
    fn test_serial_device_on_new_port_accepted_immediately() {
        let mut watcher = watcher(Some("ABC123"), &["/dev/ttyACM0"]);
        let devices = vec![
            device("/dev/ttyACM0", Some("ABC123")),
            device("/dev/ttyACM1", Some("ABC123")),
        ];

        assert_eq!(
            watcher.observe(&devices, "/dev/ttyACM0"),
            Some("/dev/ttyACM1".to_string())
        );
    }

    #[test]
    fn test_previous_port_without_serial_needs_to_drop_first() {
        let mut watcher = watcher(None, &["/dev/ttyACM0"]);
        let present = vec![device("/dev/ttyACM0", None)];

        assert_eq!(watcher.observe(&present, "/dev/ttyACM0"), None);
        assert_eq!(watcher.observe(&[], "/dev/ttyACM0"), None);
        assert_eq!(
            watcher.observe(&present, "/dev/ttyACM0"),
            Some("/dev/ttyACM0".to_string())
        );
    }
}
