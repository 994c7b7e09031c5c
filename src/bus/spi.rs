// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! SPI controller bus
//!
//! Settings changes (`set_clock_divider`, `set_data_mode`, `set_bit_order`)
//! take effect immediately when the bus is open and are remembered for the
//! next `begin()` otherwise. Transfers are full duplex: every byte shifted
//! out shifts one in.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Reference clock the dividers derive from, in Hz.
pub const BASE_CLOCK_HZ: u32 = 250_000_000;

/// Power-of-two clock dividers applied to [`BASE_CLOCK_HZ`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDivider {
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    Div128,
}

impl ClockDivider {
    pub fn divisor(self) -> u32 {
        match self {
            ClockDivider::Div2 => 2,
            ClockDivider::Div4 => 4,
            ClockDivider::Div8 => 8,
            ClockDivider::Div16 => 16,
            ClockDivider::Div32 => 32,
            ClockDivider::Div64 => 64,
            ClockDivider::Div128 => 128,
        }
    }

    /// Resulting SCK frequency in Hz.
    pub fn frequency_hz(self) -> u32 {
        BASE_CLOCK_HZ / self.divisor()
    }
}

/// Clock polarity and phase, modes 0 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

/// Shift direction on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Full bus configuration pushed to the kernel on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    pub speed_hz: u32,
    pub mode: DataMode,
    pub bit_order: BitOrder,
}

impl Default for SpiSettings {
    fn default() -> Self {
        SpiSettings {
            speed_hz: ClockDivider::Div64.frequency_hz(),
            mode: DataMode::Mode0,
            bit_order: BitOrder::MsbFirst,
        }
    }
}

/// Transport seam under [`Spi`]; the production implementation drives the
/// spidev character device.
pub trait SpiTransport: Send {
    fn configure(&mut self, settings: &SpiSettings) -> Result<()>;

    /// Full-duplex transfer; `tx` and `rx` are the same length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;
}

/// Factory opening a transport for a device path.
pub type SpiFactory = Box<dyn Fn(&Path) -> Result<Box<dyn SpiTransport>> + Send + Sync>;

/// SPI controller endpoint on one spidev node.
pub struct Spi {
    dev: PathBuf,
    factory: SpiFactory,
    transport: Option<Box<dyn SpiTransport>>,
    settings: SpiSettings,
}

impl Spi {
    /// Bus on `path`; the device is not opened until [`begin`](Self::begin).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_factory(path, Box::new(|p| SpidevTransport::open(p)))
    }

    /// Bus with an explicit transport factory (tests inject mocks here).
    pub fn with_factory(path: impl Into<PathBuf>, factory: SpiFactory) -> Self {
        Spi {
            dev: path.into(),
            factory,
            transport: None,
            settings: SpiSettings::default(),
        }
    }

    /// Open the device and push the current settings. Calling again while
    /// open is a no-op.
    pub fn begin(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let mut transport = (self.factory)(&self.dev)?;
        transport.configure(&self.settings)?;
        self.transport = Some(transport);
        tracing::debug!(dev = %self.dev.display(), speed_hz = self.settings.speed_hz, "SPI bus opened");
        Ok(())
    }

    /// Release the device. Settings are kept for the next `begin()`.
    pub fn end(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!(dev = %self.dev.display(), "SPI bus closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn settings(&self) -> SpiSettings {
        self.settings
    }

    fn reconfigure(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.as_mut() {
            transport.configure(&self.settings)?;
        }
        Ok(())
    }

    /// Select the SCK frequency as a divider of [`BASE_CLOCK_HZ`].
    pub fn set_clock_divider(&mut self, divider: ClockDivider) -> Result<()> {
        self.settings.speed_hz = divider.frequency_hz();
        self.reconfigure()
    }

    /// Select the SCK frequency directly in Hz.
    pub fn set_clock_hz(&mut self, speed_hz: u32) -> Result<()> {
        if speed_hz == 0 {
            return Err(Error::InvalidState(
                "SPI clock must be non-zero".to_string(),
            ));
        }
        self.settings.speed_hz = speed_hz;
        self.reconfigure()
    }

    pub fn set_data_mode(&mut self, mode: DataMode) -> Result<()> {
        self.settings.mode = mode;
        self.reconfigure()
    }

    pub fn set_bit_order(&mut self, order: BitOrder) -> Result<()> {
        self.settings.bit_order = order;
        self.reconfigure()
    }

    fn transport(&mut self) -> Result<&mut Box<dyn SpiTransport>> {
        self.transport.as_mut().ok_or(Error::NotInitialized("SPI"))
    }

    /// Shift one byte out and return the byte shifted in.
    pub fn transfer(&mut self, byte: u8) -> Result<u8> {
        let mut rx = [0u8; 1];
        self.transport()?.transfer(&[byte], &mut rx)?;
        Ok(rx[0])
    }

    /// Shift `buf` out, replacing it in place with the bytes shifted in.
    pub fn transfer_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let tx = buf.to_vec();
        self.transport()?.transfer(&tx, buf)
    }

    /// Shift `tx` out and fill `rx` with the bytes shifted in.
    pub fn transfer_buffers(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidState(format!(
                "SPI transfer length mismatch: tx {} bytes, rx {} bytes",
                tx.len(),
                rx.len()
            )));
        }
        self.transport()?.transfer(tx, rx)
    }

    /// Shift `data` out, discarding the incoming bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut sink = vec![0u8; data.len()];
        self.transport()?.transfer(data, &mut sink)
    }
}

/* ------------------------------------------------------------------ */
/*                      spidev transport                              */
/* ------------------------------------------------------------------ */

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

/// Production transport over the Linux spidev character device.
pub struct SpidevTransport {
    device: Spidev,
}

impl SpidevTransport {
    pub fn open(path: &Path) -> Result<Box<dyn SpiTransport>> {
        let device = Spidev::open(path)
            .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))?;
        Ok(Box::new(SpidevTransport { device }))
    }
}

fn mode_flags(settings: &SpiSettings) -> SpiModeFlags {
    match settings.mode {
        DataMode::Mode0 => SpiModeFlags::SPI_MODE_0,
        DataMode::Mode1 => SpiModeFlags::SPI_MODE_1,
        DataMode::Mode2 => SpiModeFlags::SPI_MODE_2,
        DataMode::Mode3 => SpiModeFlags::SPI_MODE_3,
    }
}

impl SpiTransport for SpidevTransport {
    fn configure(&mut self, settings: &SpiSettings) -> Result<()> {
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(settings.speed_hz)
            .lsb_first(settings.bit_order == BitOrder::LsbFirst)
            .mode(mode_flags(settings))
            .build();
        self.device
            .configure(&options)
            .map_err(|e| Error::DeviceIo(format!("SPI configure: {e}")))
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        self.device
            .transfer(&mut transfer)
            .map_err(|e| Error::DeviceIo(format!("SPI transfer: {e}")))
    }
}
