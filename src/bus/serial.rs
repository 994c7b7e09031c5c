// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Serial (UART) port
//!
//! The port runs raw 8N1. Reads are bounded by a configurable timeout;
//! string reads apply one overall deadline for the whole string rather than
//! per byte, so a chatty peer cannot stretch the call indefinitely.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Baud rates accepted by [`Serial::begin`].
pub const SUPPORTED_BAUD_RATES: [u32; 13] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Default bound on blocking reads.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport seam under [`Serial`]; the production implementation wraps a
/// kernel TTY through the `serialport` crate.
pub trait SerialTransport: Send {
    /// Bytes already buffered by the kernel, readable without blocking.
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// Read one byte, waiting up to `timeout`. `Ok(None)` on timeout.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Block until all written bytes left the transmitter.
    fn flush(&mut self) -> Result<()>;
}

/// Factory opening a transport for a TTY path at a baud rate.
pub type SerialFactory = Box<dyn Fn(&Path, u32) -> Result<Box<dyn SerialTransport>> + Send + Sync>;

/// Line-oriented serial port on one TTY device.
pub struct Serial {
    dev: PathBuf,
    factory: SerialFactory,
    transport: Option<Box<dyn SerialTransport>>,
    baud: u32,
    timeout: Duration,
}

impl Serial {
    /// Port on `path`; the TTY is not opened until [`begin`](Self::begin).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_factory(path, Box::new(|p, baud| SerialportTransport::open(p, baud)))
    }

    /// Port with an explicit transport factory (tests inject mocks here).
    pub fn with_factory(path: impl Into<PathBuf>, factory: SerialFactory) -> Self {
        Serial {
            dev: path.into(),
            factory,
            transport: None,
            baud: 0,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Open the TTY at `baud`, 8 data bits, no parity, one stop bit.
    /// Reopens at the new rate if already open at a different one; calling
    /// again with the same rate is a no-op.
    pub fn begin(&mut self, baud: u32) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&baud) {
            return Err(Error::InvalidState(format!(
                "unsupported baud rate {baud}"
            )));
        }
        if self.transport.is_some() && self.baud == baud {
            return Ok(());
        }
        self.transport = None;
        self.transport = Some((self.factory)(&self.dev, baud)?);
        self.baud = baud;
        tracing::debug!(dev = %self.dev.display(), baud, "serial port opened");
        Ok(())
    }

    /// Open at `baud` on `path`, replacing the configured device node.
    /// Keeps the classic call shape where the port and rate are named
    /// together; a port already open on the same path and rate is left
    /// untouched.
    pub fn begin_on(&mut self, baud: u32, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if self.transport.is_some() && self.dev == path && self.baud == baud {
            return Ok(());
        }
        self.end();
        self.dev = path;
        self.begin(baud)
    }

    /// Release the TTY. Idempotent.
    pub fn end(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!(dev = %self.dev.display(), "serial port closed");
        }
        self.baud = 0;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Bound for blocking reads (per byte for [`read`](Self::read), overall
    /// for the string reads).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn transport(&mut self) -> Result<&mut Box<dyn SerialTransport>> {
        self.transport
            .as_mut()
            .ok_or(Error::NotInitialized("Serial"))
    }

    /// Whether at least one byte is readable without blocking.
    pub fn available(&mut self) -> Result<bool> {
        Ok(self.bytes_available()? > 0)
    }

    /// Bytes readable without blocking.
    pub fn bytes_available(&mut self) -> Result<u32> {
        self.transport()?.bytes_to_read()
    }

    /// Read one byte, waiting up to the configured timeout. `Ok(None)` when
    /// nothing arrived in time.
    pub fn read(&mut self) -> Result<Option<u8>> {
        let timeout = self.timeout;
        self.transport()?.read_byte(timeout)
    }

    /// Read bytes into `buf` until it is full or the overall timeout
    /// elapses. Returns the number of bytes read.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let transport = self.transport.as_mut().ok_or(Error::NotInitialized("Serial"))?;
        let mut count = 0;
        while count < buf.len() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match transport.read_byte(remaining)? {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    /// Read a string until `terminator` arrives or the overall timeout
    /// elapses. The terminator is consumed but not included. Bytes that are
    /// not valid UTF-8 are replaced with U+FFFD.
    pub fn read_string_until(&mut self, terminator: u8) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let transport = self.transport.as_mut().ok_or(Error::NotInitialized("Serial"))?;
        let mut bytes = Vec::new();
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match transport.read_byte(remaining)? {
                Some(byte) if byte == terminator => break,
                Some(byte) => bytes.push(byte),
                None => break,
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read everything that arrives until the line goes quiet for the
    /// configured timeout.
    pub fn read_string(&mut self) -> Result<String> {
        let timeout = self.timeout;
        let transport = self.transport.as_mut().ok_or(Error::NotInitialized("Serial"))?;
        let mut bytes = Vec::new();
        while let Some(byte) = transport.read_byte(timeout)? {
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write one byte.
    pub fn write(&mut self, byte: u8) -> Result<()> {
        self.transport()?.write_all(&[byte])
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.transport()?.write_all(data)
    }

    /// Write a string without a line ending.
    pub fn print(&mut self, text: &str) -> Result<()> {
        self.transport()?.write_all(text.as_bytes())
    }

    /// Write a string followed by CRLF.
    pub fn println(&mut self, text: &str) -> Result<()> {
        let transport = self.transport()?;
        transport.write_all(text.as_bytes())?;
        transport.write_all(b"\r\n")
    }

    /// Block until everything written has left the transmitter.
    pub fn flush(&mut self) -> Result<()> {
        self.transport()?.flush()
    }
}

/* ------------------------------------------------------------------ */
/*                     serialport transport                           */
/* ------------------------------------------------------------------ */

use serialport::SerialPort;

/// Production transport over a kernel TTY in raw 8N1.
pub struct SerialportTransport {
    port: Box<dyn SerialPort>,
}

impl SerialportTransport {
    pub fn open(path: &Path, baud: u32) -> Result<Box<dyn SerialTransport>> {
        let port = serialport::new(path.to_string_lossy(), baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open()
            .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))?;
        Ok(Box::new(SerialportTransport { port }))
    }
}

impl SerialTransport for SerialportTransport {
    fn bytes_to_read(&mut self) -> Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| Error::DeviceIo(e.to_string()))
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| Error::DeviceIo(e.to_string()))?;
        let mut byte = [0u8; 1];
        match std::io::Read::read(&mut self.port, &mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(Error::DeviceIo(e.to_string())),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, data)
            .map_err(|e| Error::DeviceIo(e.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut self.port).map_err(|e| Error::DeviceIo(e.to_string()))
    }
}
