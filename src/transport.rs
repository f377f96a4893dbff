//! Owns the serial handle: line parameters, timed reads/writes, and the
//! DTR/RTS signal dances used to enter and exit bootloader mode.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Fixed read timeout for every serial transaction.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

const BAUD_RATE: u32 = 115_200;

/// Minimal surface `Transport` needs from a serial handle, so tests can
/// substitute an in-memory fake without a real port.
pub trait SerialIo: Read + Write {
    fn set_dtr(&mut self, asserted: bool) -> io::Result<()>;
    fn set_rts(&mut self, asserted: bool) -> io::Result<()>;
}

impl SerialIo for Box<dyn serialport::SerialPort> {
    fn set_dtr(&mut self, asserted: bool) -> io::Result<()> {
        self.as_mut()
            .write_data_terminal_ready(asserted)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn set_rts(&mut self, asserted: bool) -> io::Result<()> {
        self.as_mut()
            .write_request_to_send(asserted)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// A real, opened serial port.
pub type RealSerialPort = Box<dyn serialport::SerialPort>;

/// Owns a serial handle for its lifetime. Exclusively held: there is no
/// sharing, so there is no locking.
pub struct Transport<P: SerialIo = RealSerialPort> {
    port: P,
}

impl Transport<RealSerialPort> {
    /// Opens a serial port. If `port_hint` is `None`, enumerates available
    /// devices, preferring one whose description contains `tock`, else the
    /// first available device. Fails with [`Error::NoPort`] if none exist.
    pub fn open(port_hint: Option<&str>) -> Result<Self> {
        let port_name = match port_hint {
            Some(name) => name.to_string(),
            None => {
                let ports =
                    serialport::available_ports().map_err(|e| Error::OpenFailed(e.to_string()))?;
                if ports.is_empty() {
                    return Err(Error::NoPort);
                }
                let preferred = ports.iter().find(|p| describes_tock_board(p));
                preferred
                    .or_else(|| ports.first())
                    .map(|p| p.port_name.clone())
                    .ok_or(Error::NoPort)?
            }
        };

        log::debug!("opening serial port {port_name}");

        let port = serialport::new(&port_name, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::OpenFailed(e.to_string()))?;

        let mut transport = Transport { port };
        // Not all hosts honor initial DTR/RTS state before open, so
        // deassert both explicitly right away.
        transport.port.set_dtr(false)?;
        transport.port.set_rts(false)?;
        Ok(transport)
    }
}

fn describes_tock_board(port: &serialport::SerialPortInfo) -> bool {
    if let serialport::SerialPortType::UsbPort(info) = &port.port_type {
        let haystacks = [info.product.as_deref(), info.manufacturer.as_deref()];
        return haystacks
            .iter()
            .flatten()
            .any(|s| s.to_lowercase().contains("tock"));
    }
    false
}

impl<P: SerialIo> Transport<P> {
    /// Wraps an already-open serial-like handle. Used directly by tests with
    /// a fake `SerialIo`.
    pub fn from_port(port: P) -> Self {
        Transport { port }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    /// Reads up to `n` bytes, blocking until either `n` bytes have arrived
    /// or the cumulative read timeout elapses. May return fewer than `n`
    /// bytes if the target stops responding mid-frame.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        let deadline = Instant::now() + READ_TIMEOUT;

        while filled < n && Instant::now() < deadline {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    /// Resets the target (DTR high), selects bootloader mode (RTS high),
    /// releases reset, then de-selects the bootloader pin. This is the exact
    /// signal dance the target expects to enter bootloader mode.
    pub fn toggle_bootloader_entry(&mut self) -> Result<()> {
        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.set_dtr(false)?;
        std::thread::sleep(Duration::from_millis(500));
        self.port.set_rts(false)?;
        Ok(())
    }

    /// Resets the target with the bootloader-select pin released, handing
    /// control back to the installed application.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.port.set_dtr(true)?;
        self.port.set_rts(false)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.set_dtr(false)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory stand-in for a serial port: `to_read` is drained by
    /// `read`, `written` records everything passed to `write`.
    pub struct FakeSerial {
        pub to_read: VecDeque<u8>,
        pub written: Vec<u8>,
        pub dtr_history: Vec<bool>,
        pub rts_history: Vec<bool>,
    }

    impl FakeSerial {
        pub fn new(to_read: Vec<u8>) -> Self {
            FakeSerial {
                to_read: to_read.into(),
                written: Vec::new(),
                dtr_history: Vec::new(),
                rts_history: Vec::new(),
            }
        }

        pub fn push_read(&mut self, bytes: &[u8]) {
            self.to_read.extend(bytes.iter().copied());
        }
    }

    impl Read for FakeSerial {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.to_read.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.to_read.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeSerial {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialIo for FakeSerial {
        fn set_dtr(&mut self, asserted: bool) -> io::Result<()> {
            self.dtr_history.push(asserted);
            Ok(())
        }

        fn set_rts(&mut self, asserted: bool) -> io::Result<()> {
            self.rts_history.push(asserted);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeSerial;
    use super::*;

    #[test]
    fn write_passes_bytes_through() {
        let fake = FakeSerial::new(Vec::new());
        let mut transport = Transport::from_port(fake);
        transport.write(&[1, 2, 3]).unwrap();
        assert_eq!(transport.port.written, vec![1, 2, 3]);
    }

    #[test]
    fn read_exact_returns_short_on_empty_source() {
        let fake = FakeSerial::new(vec![1, 2]);
        let mut transport = Transport::from_port(fake);
        // Immediate timeout: nothing more arrives after the first 2 bytes.
        let got = transport.read_exact(5).unwrap();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn read_exact_returns_full_buffer_when_available() {
        let fake = FakeSerial::new(vec![9, 8, 7, 6]);
        let mut transport = Transport::from_port(fake);
        let got = transport.read_exact(4).unwrap();
        assert_eq!(got, vec![9, 8, 7, 6]);
    }

    #[test]
    fn toggle_bootloader_entry_drives_expected_sequence() {
        let fake = FakeSerial::new(Vec::new());
        let mut transport = Transport::from_port(fake);
        transport.toggle_bootloader_entry().unwrap();
        assert_eq!(transport.port.dtr_history, vec![true, false]);
        assert_eq!(transport.port.rts_history, vec![true, false]);
    }

    #[test]
    fn exit_bootloader_drives_expected_sequence() {
        let fake = FakeSerial::new(Vec::new());
        let mut transport = Transport::from_port(fake);
        transport.exit_bootloader().unwrap();
        assert_eq!(transport.port.dtr_history, vec![true, false]);
        assert_eq!(transport.port.rts_history, vec![false]);
    }
}
