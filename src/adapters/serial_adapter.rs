//! Byte-level serial link to the LED/indicator controller.
//!
//! The controller is a small USB-CDC board. It is found by USB vendor/product id
//! and then identified by asking for its version string (`v`), which it answers
//! with the instrument id it was flashed with. Several instruments may share one
//! host, so the identity check is what ties a port to this runner.
//!
//! Everything above this module talks to a [`SerialTransport`]; the
//! `serialport`-backed implementation is compiled with the `instrument_serial`
//! feature, simulated controllers live in [`crate::hardware::mock`].

use std::io;
use tracing::debug;
#[cfg(feature = "instrument_serial")]
use tracing::{error, info};

use crate::config::SerialConfig;
use crate::error::SerialError;

/// Identity query understood by the controller firmware.
pub const VERSION_QUERY: &[u8] = b"v";

/// Which OS buffer to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearBuffer {
    /// Bytes received but not yet read
    Input,
    /// Bytes written but not yet transmitted
    Output,
    /// Both directions
    All,
}

/// Minimal blocking byte link.
///
/// Implementations apply their own per-operation timeouts; a timeout is
/// reported as an `io::Error` like any other transport failure.
pub trait SerialTransport: Send {
    /// Port name for logs (e.g. "/dev/ttyACM0", "COM3").
    fn name(&self) -> &str;

    /// Write every byte and flush.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to and including the next `\n`, returned without the line ending.
    fn read_line(&mut self) -> io::Result<String>;

    /// Discard buffered data.
    fn clear(&mut self, buffer: ClearBuffer) -> io::Result<()>;
}

/// Ask a freshly opened link for its identity string.
pub fn identify(link: &mut dyn SerialTransport) -> io::Result<String> {
    link.write_all(VERSION_QUERY)?;
    Ok(link.read_line()?.trim().to_string())
}

/// Pick the first candidate link whose identity equals `target_id`.
///
/// Non-matching links are dropped, which closes them.
pub fn select_link<I>(candidates: I, target_id: &str) -> Result<Box<dyn SerialTransport>, SerialError>
where
    I: IntoIterator<Item = Box<dyn SerialTransport>>,
{
    for mut link in candidates {
        match identify(link.as_mut()) {
            Ok(identity) if identity == target_id => {
                debug!("{} identified as {}", link.name(), identity);
                return Ok(link);
            }
            Ok(identity) => {
                debug!("{} belongs to '{}', closing", link.name(), identity);
            }
            Err(e) => {
                debug!("{} did not answer the identity query: {}", link.name(), e);
            }
        }
    }
    Err(SerialError::NotDetected)
}

/// Find and open the controller for `target_id`.
///
/// Ports that cannot be opened (typically held by another runner) are skipped.
#[cfg(feature = "instrument_serial")]
pub fn discover(target_id: &str, config: &SerialConfig) -> Result<Box<dyn SerialTransport>, SerialError> {
    let ports = serialport::available_ports().map_err(|e| {
        error!("Cannot enumerate serial ports: {}", e);
        SerialError::NotDetected
    })?;

    let candidates = ports
        .into_iter()
        .filter(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                usb.vid == config.vendor_id && usb.pid == config.product_id
            }
            _ => false,
        })
        .filter_map(|port| match SerialPortTransport::open(&port.port_name, config) {
            Ok(link) => Some(Box::new(link) as Box<dyn SerialTransport>),
            Err(e) => {
                debug!("{} is already opened ({})", port.port_name, e);
                None
            }
        });

    match select_link(candidates, target_id) {
        Ok(link) => {
            info!("Successfully connected serial device on {}", link.name());
            Ok(link)
        }
        Err(e) => {
            error!("Cannot find serial device '{}'", target_id);
            Err(e)
        }
    }
}

/// Find and open the controller for `target_id` (always fails without serial support).
#[cfg(not(feature = "instrument_serial"))]
pub fn discover(target_id: &str, config: &SerialConfig) -> Result<Box<dyn SerialTransport>, SerialError> {
    let _ = (target_id, config);
    Err(SerialError::FeatureDisabled)
}

/// [`SerialTransport`] over a real serial port.
#[cfg(feature = "instrument_serial")]
pub struct SerialPortTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    timeout: std::time::Duration,
}

#[cfg(feature = "instrument_serial")]
impl SerialPortTransport {
    /// Open `port_name` with the configured baud rate and timeout.
    pub fn open(port_name: &str, config: &SerialConfig) -> io::Result<Self> {
        let port = serialport::new(port_name, config.baud_rate)
            .timeout(std::time::Duration::from_millis(100)) // Internal read timeout
            .open()
            .map_err(io::Error::from)?;

        debug!("Serial port '{}' opened at {} baud", port_name, config.baud_rate);
        Ok(Self {
            port,
            name: port_name.to_string(),
            timeout: config.timeout(),
        })
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport for SerialPortTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;

        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        use std::io::Read;

        let mut line = Vec::new();
        let mut buffer = [0u8; 1];
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() > self.timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Serial read timeout after {:?}", self.timeout),
                ));
            }

            match self.port.read(&mut buffer) {
                Ok(0) => {
                    // EOF - the USB device went away
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Unexpected EOF"));
                }
                Ok(_) if buffer[0] == b'\n' => break,
                Ok(_) => line.push(buffer[0]),
                // Port timeout is shorter than the line timeout
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }

    fn clear(&mut self, buffer: ClearBuffer) -> io::Result<()> {
        let which = match buffer {
            ClearBuffer::Input => serialport::ClearBuffer::Input,
            ClearBuffer::Output => serialport::ClearBuffer::Output,
            ClearBuffer::All => serialport::ClearBuffer::All,
        };
        self.port.clear(which).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedController;

    #[test]
    fn test_select_link_picks_matching_identity() {
        let other = SimulatedController::new("HelloPCR00001");
        let ours = SimulatedController::new("HelloPCR00002");
        let candidates: Vec<Box<dyn SerialTransport>> =
            vec![Box::new(other.clone()), Box::new(ours.clone())];

        let link = select_link(candidates, "HelloPCR00002").unwrap();
        assert_eq!(link.name(), ours.name());
        assert_eq!(other.commands(), vec!["v".to_string()]);
    }

    #[test]
    fn test_select_link_without_match_fails() {
        let candidates: Vec<Box<dyn SerialTransport>> =
            vec![Box::new(SimulatedController::new("HelloPCR00001"))];
        assert_eq!(
            select_link(candidates, "HelloPCR99999").err(),
            Some(SerialError::NotDetected)
        );
    }

    #[test]
    fn test_select_link_skips_silent_device() {
        let silent = SimulatedController::new("HelloPCR00002");
        silent.fail_reads(u32::MAX);
        let ours = SimulatedController::new("HelloPCR00002");
        let candidates: Vec<Box<dyn SerialTransport>> =
            vec![Box::new(silent), Box::new(ours.clone())];

        let link = select_link(candidates, "HelloPCR00002").unwrap();
        assert_eq!(link.name(), ours.name());
    }

    #[test]
    fn test_identify_trims_identity() {
        let mut controller = SimulatedController::new("HelloPCR00007");
        assert_eq!(identify(&mut controller).unwrap(), "HelloPCR00007");
    }
}
