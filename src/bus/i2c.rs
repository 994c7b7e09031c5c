// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! I2C controller bus (`Wire`)
//!
//! Buffered transmissions follow the classic two-phase shape:
//! `begin_transmission`, queued `write`s, `end_transmission`. Ending without
//! a stop bit defers the queued bytes; the next `request_from` combines them
//! with the read into one kernel I2C_RDWR transaction, which is how the
//! Linux i2c-dev interface expresses a repeated start.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Queue capacity of the transmit and receive buffers, in bytes.
pub const BUFFER_LENGTH: usize = 32;

/// First and last addresses probed by [`Wire::scan`]. 0x00..0x02 and
/// 0x78..0x7f are reserved by the I2C specification.
pub const SCAN_FIRST_ADDR: u8 = 0x03;
pub const SCAN_LAST_ADDR: u8 = 0x77;

/// Outcome of [`Wire::end_transmission`], with the conventional numeric
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    DataTooLong,
    AddrNack,
    DataNack,
    Other,
}

impl TxStatus {
    pub fn code(self) -> u8 {
        match self {
            TxStatus::Success => 0,
            TxStatus::DataTooLong => 1,
            TxStatus::AddrNack => 2,
            TxStatus::DataNack => 3,
            TxStatus::Other => 4,
        }
    }

    pub fn is_success(self) -> bool {
        self == TxStatus::Success
    }
}

/// Transport seam under [`Wire`]; the production implementation drives the
/// i2c-dev character device, tests substitute an in-memory device map.
pub trait I2cTransport: Send {
    /// Address an empty write at `addr` and report whether it was ACKed.
    fn probe(&mut self, addr: u8) -> bool;

    /// Write `data` to `addr` as one transaction.
    fn write(&mut self, addr: u8, data: &[u8]) -> TxStatus;

    /// Read up to `buf.len()` bytes from `addr`.
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` then read into `buf` with a repeated start in between.
    fn write_read(&mut self, addr: u8, data: &[u8], buf: &mut [u8]) -> Result<usize>;
}

/// Factory opening a transport for a bus device path.
pub type I2cFactory = Box<dyn Fn(&Path) -> Result<Box<dyn I2cTransport>> + Send + Sync>;

/// Buffered I2C controller endpoint on one bus device.
pub struct Wire {
    bus: PathBuf,
    factory: I2cFactory,
    transport: Option<Box<dyn I2cTransport>>,
    tx_addr: u8,
    tx: Vec<u8>,
    tx_overflow: bool,
    rx: Vec<u8>,
    rx_pos: usize,
    /// Queued write deferred by `end_transmission(false)`, waiting to be
    /// combined with the next `request_from`.
    pending_write: Option<(u8, Vec<u8>)>,
}

impl Wire {
    /// Bus on `path`; the device is not opened until [`begin`](Self::begin).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_factory(path, Box::new(|p| LinuxI2c::open(p)))
    }

    /// Bus with an explicit transport factory (tests inject mocks here).
    pub fn with_factory(path: impl Into<PathBuf>, factory: I2cFactory) -> Self {
        Wire {
            bus: path.into(),
            factory,
            transport: None,
            tx_addr: 0,
            tx: Vec::with_capacity(BUFFER_LENGTH),
            tx_overflow: false,
            rx: Vec::with_capacity(BUFFER_LENGTH),
            rx_pos: 0,
            pending_write: None,
        }
    }

    /// Open the bus device. Calling again while open is a no-op.
    pub fn begin(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.transport = Some((self.factory)(&self.bus)?);
        tracing::debug!(bus = %self.bus.display(), "I2C bus opened");
        Ok(())
    }

    /// Release the bus device and discard all buffered state. Idempotent.
    pub fn end(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!(bus = %self.bus.display(), "I2C bus closed");
        }
        self.tx.clear();
        self.tx_overflow = false;
        self.rx.clear();
        self.rx_pos = 0;
        self.pending_write = None;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&mut self) -> Result<&mut Box<dyn I2cTransport>> {
        self.transport
            .as_mut()
            .ok_or(Error::NotInitialized("Wire"))
    }

    /// Start queueing a transmission to `addr`. Resets the transmit buffer.
    pub fn begin_transmission(&mut self, addr: u8) {
        self.tx_addr = addr;
        self.tx.clear();
        self.tx_overflow = false;
    }

    /// Queue one byte; returns how many bytes were accepted (0 once the
    /// buffer is full, which turns the transmission into `DataTooLong`).
    pub fn write(&mut self, byte: u8) -> usize {
        self.write_bytes(&[byte])
    }

    /// Queue a byte slice, accepting at most the remaining buffer capacity.
    pub fn write_bytes(&mut self, data: &[u8]) -> usize {
        let room = BUFFER_LENGTH - self.tx.len();
        let accepted = data.len().min(room);
        self.tx.extend_from_slice(&data[..accepted]);
        if accepted < data.len() {
            self.tx_overflow = true;
        }
        accepted
    }

    /// Transmit the queued bytes, ending with a stop bit.
    pub fn end_transmission(&mut self) -> Result<TxStatus> {
        self.end_transmission_with(true)
    }

    /// Transmit the queued bytes. With `send_stop == false` the bytes are
    /// held back and combined with the next [`request_from`](Self::request_from)
    /// into a single repeated-start transaction; any device error then
    /// surfaces from that call.
    ///
    /// An empty transmission with a stop bit acts as an address probe and
    /// reports `AddrNack` when no device answers.
    pub fn end_transmission_with(&mut self, send_stop: bool) -> Result<TxStatus> {
        let addr = self.tx_addr;
        let data = std::mem::take(&mut self.tx);
        let overflow = std::mem::replace(&mut self.tx_overflow, false);
        let transport = self.transport()?;

        if overflow {
            return Ok(TxStatus::DataTooLong);
        }
        if !send_stop {
            self.pending_write = Some((addr, data));
            return Ok(TxStatus::Success);
        }
        if data.is_empty() {
            return Ok(if transport.probe(addr) {
                TxStatus::Success
            } else {
                TxStatus::AddrNack
            });
        }
        Ok(transport.write(addr, &data))
    }

    /// Read `count` bytes from `addr` into the receive buffer, consuming any
    /// deferred write to the same address as the leading half of a
    /// repeated-start transaction. Returns the number of bytes buffered.
    pub fn request_from(&mut self, addr: u8, count: usize) -> Result<usize> {
        let count = count.min(BUFFER_LENGTH);
        let pending = match self.pending_write.take() {
            Some((pending_addr, data)) if pending_addr == addr => Some(data),
            other => {
                // A deferred write to a different address cannot be joined;
                // it is dropped rather than sent to the wrong device.
                if other.is_some() {
                    tracing::warn!(addr, "discarding deferred write to different address");
                }
                None
            }
        };
        let transport = self.transport()?;

        let mut buf = vec![0u8; count];
        let got = match pending {
            Some(data) if !data.is_empty() => transport.write_read(addr, &data, &mut buf)?,
            _ => transport.read(addr, &mut buf)?,
        };
        buf.truncate(got);
        self.rx = buf;
        self.rx_pos = 0;
        Ok(got)
    }

    /// Bytes left to [`read`](Self::read) in the receive buffer.
    pub fn available(&self) -> usize {
        self.rx.len() - self.rx_pos
    }

    /// Pop the next received byte, if any.
    pub fn read(&mut self) -> Option<u8> {
        let byte = self.rx.get(self.rx_pos).copied();
        if byte.is_some() {
            self.rx_pos += 1;
        }
        byte
    }

    /// Probe every valid 7-bit address and return the ones that ACK.
    pub fn scan(&mut self) -> Result<Vec<u8>> {
        let transport = self.transport()?;
        let mut found = Vec::new();
        for addr in SCAN_FIRST_ADDR..=SCAN_LAST_ADDR {
            if transport.probe(addr) {
                found.push(addr);
            }
        }
        tracing::debug!(count = found.len(), "I2C scan complete");
        Ok(found)
    }

    /// Read one register with a repeated start.
    pub fn read_register(&mut self, addr: u8, reg: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        let got = self.transport()?.write_read(addr, &[reg], &mut buf)?;
        if got == 0 {
            return Err(Error::DeviceIo(format!(
                "device 0x{addr:02x} returned no data for register 0x{reg:02x}"
            )));
        }
        Ok(buf[0])
    }

    /// Read consecutive registers starting at `reg` into `buf`.
    pub fn read_registers(&mut self, addr: u8, reg: u8, buf: &mut [u8]) -> Result<usize> {
        self.transport()?.write_read(addr, &[reg], buf)
    }

    /// Write one register value.
    pub fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<()> {
        let status = self.transport()?.write(addr, &[reg, value]);
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::DeviceIo(format!(
                "write to 0x{addr:02x} register 0x{reg:02x} failed with status {}",
                status.code()
            )))
        }
    }
}

/* ------------------------------------------------------------------ */
/*                      i2c-dev transport                             */
/* ------------------------------------------------------------------ */

use i2cdev::core::{I2CDevice, I2CMessage, I2CTransfer};
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CMessage};

/// Production transport over the Linux i2c-dev character device.
pub struct LinuxI2c {
    device: LinuxI2CDevice,
}

impl LinuxI2c {
    pub fn open(path: &Path) -> Result<Box<dyn I2cTransport>> {
        // The slave address is set per transaction; 0 is a placeholder.
        let device = LinuxI2CDevice::new(path, 0)
            .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))?;
        Ok(Box::new(LinuxI2c { device }))
    }

    fn set_addr(&mut self, addr: u8) -> Result<()> {
        self.device
            .set_slave_address(u16::from(addr))
            .map_err(|e| Error::DeviceIo(format!("address 0x{addr:02x}: {e}")))
    }
}

/// Errno text indicating the device did not ACK its address.
fn is_nack(msg: &str) -> bool {
    msg.contains("ENXIO")
        || msg.contains("EREMOTEIO")
        || msg.contains("No such device or address")
        || msg.contains("Remote I/O error")
}

impl I2cTransport for LinuxI2c {
    fn probe(&mut self, addr: u8) -> bool {
        if self.set_addr(addr).is_err() {
            return false;
        }
        // A quick write is the least intrusive ACK check the kernel offers.
        self.device.smbus_write_quick(false).is_ok()
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> TxStatus {
        if self.set_addr(addr).is_err() {
            return TxStatus::Other;
        }
        match self.device.write(data) {
            Ok(()) => TxStatus::Success,
            Err(e) => {
                let msg = e.to_string();
                if is_nack(&msg) {
                    TxStatus::AddrNack
                } else {
                    tracing::warn!(addr, error = %msg, "I2C write failed");
                    TxStatus::Other
                }
            }
        }
    }

    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<usize> {
        self.set_addr(addr)?;
        self.device
            .read(buf)
            .map_err(|e| Error::DeviceIo(format!("read from 0x{addr:02x}: {e}")))?;
        Ok(buf.len())
    }

    fn write_read(&mut self, addr: u8, data: &[u8], buf: &mut [u8]) -> Result<usize> {
        let addr16 = u16::from(addr);
        let mut msgs = [
            LinuxI2CMessage::write(data).with_address(addr16),
            LinuxI2CMessage::read(buf).with_address(addr16),
        ];
        self.device
            .transfer(&mut msgs)
            .map_err(|e| Error::DeviceIo(format!("transfer with 0x{addr:02x}: {e}")))?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    /// In-memory bus: a map of device address to register file. `write`
    /// records the last transmission, `write_read` serves registers.
    struct MockBus {
        devices: AHashMap<u8, AHashMap<u8, u8>>,
    }

    impl MockBus {
        fn with_devices(addrs: &[u8]) -> Self {
            let mut devices = AHashMap::new();
            for addr in addrs {
                devices.insert(*addr, AHashMap::new());
            }
            MockBus { devices }
        }
    }

    impl I2cTransport for MockBus {
        fn probe(&mut self, addr: u8) -> bool {
            self.devices.contains_key(&addr)
        }

        fn write(&mut self, addr: u8, data: &[u8]) -> TxStatus {
            if !self.devices.contains_key(&addr) {
                return TxStatus::AddrNack;
            }
            if let [reg, value] = data {
                if let Some(regs) = self.devices.get_mut(&addr) {
                    regs.insert(*reg, *value);
                }
            }
            TxStatus::Success
        }

        fn read(&mut self, addr: u8, buf: &mut [u8]) -> crate::error::Result<usize> {
            if !self.devices.contains_key(&addr) {
                return Err(Error::DeviceIo("no device".to_string()));
            }
            buf.fill(0xaa);
            Ok(buf.len())
        }

        fn write_read(
            &mut self,
            addr: u8,
            data: &[u8],
            buf: &mut [u8],
        ) -> crate::error::Result<usize> {
            let regs = self
                .devices
                .get(&addr)
                .ok_or_else(|| Error::DeviceIo("no device".to_string()))?;
            let base = data[0];
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *regs.get(&(base + i as u8)).unwrap_or(&0);
            }
            Ok(buf.len())
        }
    }

    fn wire_with(addrs: &'static [u8]) -> Wire {
        Wire::with_factory(
            "/dev/i2c-mock",
            Box::new(move |_| Ok(Box::new(MockBus::with_devices(addrs)))),
        )
    }

    #[test]
    fn test_ops_before_begin_fail() {
        let mut wire = wire_with(&[]);
        assert!(matches!(
            wire.request_from(0x42, 4),
            Err(Error::NotInitialized("Wire"))
        ));
        assert!(matches!(wire.scan(), Err(Error::NotInitialized("Wire"))));
        wire.begin_transmission(0x42);
        assert!(matches!(
            wire.end_transmission(),
            Err(Error::NotInitialized("Wire"))
        ));
    }

    #[test]
    fn test_repeated_begin_is_noop() {
        let mut wire = wire_with(&[0x42]);
        wire.begin().unwrap();
        wire.begin().unwrap();
        assert!(wire.is_open());
        wire.end();
        wire.end();
        assert!(!wire.is_open());
    }

    #[test]
    fn test_scan_reports_ack_addresses() {
        let mut wire = wire_with(&[0x23, 0x68]);
        wire.begin().unwrap();
        assert_eq!(wire.scan().unwrap(), vec![0x23, 0x68]);
    }

    #[test]
    fn test_empty_transmission_probes() {
        let mut wire = wire_with(&[0x23]);
        wire.begin().unwrap();

        wire.begin_transmission(0x23);
        assert_eq!(wire.end_transmission().unwrap(), TxStatus::Success);

        wire.begin_transmission(0x24);
        assert_eq!(wire.end_transmission().unwrap(), TxStatus::AddrNack);
    }

    #[test]
    fn test_buffer_overflow_is_data_too_long() {
        let mut wire = wire_with(&[0x23]);
        wire.begin().unwrap();
        wire.begin_transmission(0x23);
        let accepted = wire.write_bytes(&[0u8; BUFFER_LENGTH + 5]);
        assert_eq!(accepted, BUFFER_LENGTH);
        assert_eq!(wire.write(0xff), 0);
        assert_eq!(wire.end_transmission().unwrap(), TxStatus::DataTooLong);
        // The failed transmission does not poison the next one.
        wire.begin_transmission(0x23);
        wire.write(0x01);
        assert_eq!(wire.end_transmission().unwrap(), TxStatus::Success);
    }

    #[test]
    fn test_repeated_start_register_read() {
        let mut wire = Wire::with_factory(
            "/dev/i2c-mock",
            Box::new(|_| {
                let mut bus = MockBus::with_devices(&[0x68]);
                if let Some(regs) = bus.devices.get_mut(&0x68) {
                    regs.insert(0x75, 0x71);
                }
                Ok(Box::new(bus))
            }),
        );
        wire.begin().unwrap();

        wire.begin_transmission(0x68);
        wire.write(0x75);
        assert_eq!(
            wire.end_transmission_with(false).unwrap(),
            TxStatus::Success
        );
        assert_eq!(wire.request_from(0x68, 1).unwrap(), 1);
        assert_eq!(wire.available(), 1);
        assert_eq!(wire.read(), Some(0x71));
        assert_eq!(wire.read(), None);
    }

    #[test]
    fn test_register_helpers() {
        let mut wire = wire_with(&[0x68]);
        wire.begin().unwrap();
        wire.write_register(0x68, 0x6b, 0x00).unwrap();
        assert_eq!(wire.read_register(0x68, 0x6b).unwrap(), 0x00);
        wire.write_register(0x68, 0x6b, 0x40).unwrap();
        assert_eq!(wire.read_register(0x68, 0x6b).unwrap(), 0x40);
        assert!(wire.write_register(0x10, 0x00, 0x00).is_err());
    }

    #[test]
    fn test_request_from_caps_at_buffer_length() {
        let mut wire = wire_with(&[0x23]);
        wire.begin().unwrap();
        assert_eq!(wire.request_from(0x23, 100).unwrap(), BUFFER_LENGTH);
        assert_eq!(wire.available(), BUFFER_LENGTH);
    }

    #[test]
    fn test_end_clears_pending_state() {
        let mut wire = wire_with(&[0x68]);
        wire.begin().unwrap();
        wire.begin_transmission(0x68);
        wire.write(0x75);
        wire.end_transmission_with(false).unwrap();
        wire.end();
        wire.begin().unwrap();
        // The deferred write did not survive the end/begin cycle; the read
        // goes out as a plain read (the mock fills those with 0xaa).
        wire.request_from(0x68, 1).unwrap();
        assert_eq!(wire.read(), Some(0xaa));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TxStatus::Success.code(), 0);
        assert_eq!(TxStatus::DataTooLong.code(), 1);
        assert_eq!(TxStatus::AddrNack.code(), 2);
        assert_eq!(TxStatus::DataNack.code(), 3);
        assert_eq!(TxStatus::Other.code(), 4);
    }
}
