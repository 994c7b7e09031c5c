// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Platform adapter: kernel GPIO chip access and board detection
//!
//! The adapter is a trait seam so tests substitute a mock backend; the
//! production [`CdevBackend`] drives the GPIO character device through the
//! `gpiocdev` crate. Logical pin numbers are mapped to (chip, line offset)
//! by cumulative line counts across the configured chips.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{EdgeEvent, EdgeKind, Edge, Level, PinMode};

/// A requested GPIO line held by the registry (and shared with the PWM
/// scheduler for output pins).
pub trait LineHandle: Send + Sync {
    fn set(&self, level: Level) -> Result<()>;
    fn get(&self) -> Result<Level>;
}

/// Blocking source of edge events for one watched line.
pub trait EventSource: Send {
    /// Wait up to `timeout` for the next edge event. `Ok(None)` on timeout.
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>>;
}

/// Platform adapter seam: opens kernel line requests for logical pins.
///
/// Implementations must hand out at most one request per line; a second
/// incompatible request fails with [`Error::LineBusy`].
pub trait GpioBackend: Send + Sync {
    /// Total number of logical pins the adapter can address
    fn line_count(&self) -> u32;

    /// Request the line as an output, driving `initial`
    fn request_output(&self, pin: u32, initial: Level) -> Result<Box<dyn LineHandle>>;

    /// Request the line as an input with the bias implied by `mode`
    fn request_input(&self, pin: u32, mode: PinMode) -> Result<Box<dyn LineHandle>>;

    /// Request the line as an input with edge detection; the returned
    /// handle stays readable while the source reports events.
    fn request_edges(
        &self,
        pin: u32,
        edge: Edge,
        mode: PinMode,
    ) -> Result<(Box<dyn LineHandle>, Box<dyn EventSource>)>;
}

/* ------------------------------------------------------------------ */
/*                         Configuration                              */
/* ------------------------------------------------------------------ */

/// Device-node configuration for the HAL.
///
/// All kernel device paths are inputs; nothing is hardcoded at the call
/// sites. Environment variables (`PINION_GPIO_CHIP`, `PINION_I2C_BUS`,
/// `PINION_SPI_DEV`, `PINION_SERIAL_DEV`, `PINION_CONSUMER`) override the
/// corresponding fields via [`HalConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalConfig {
    /// GPIO chip devices, in logical pin order. Empty = discover
    /// `/dev/gpiochip*` at open time.
    pub gpio_chips: Vec<PathBuf>,
    /// Consumer label attached to kernel line requests
    pub consumer: String,
    /// Default I2C bus node for `Wire`
    pub i2c_bus: PathBuf,
    /// Default SPI device node for `Spi`
    pub spi_dev: PathBuf,
    /// Default serial TTY node for `Serial`
    pub serial_dev: PathBuf,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            gpio_chips: Vec::new(),
            consumer: "pinion".to_string(),
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            spi_dev: PathBuf::from("/dev/spidev0.0"),
            serial_dev: PathBuf::from("/dev/ttyAMA0"),
        }
    }
}

impl HalConfig {
    /// Build a config from detected board capabilities.
    pub fn detect() -> Self {
        let info = detect();
        let mut cfg = HalConfig::default();
        cfg.gpio_chips = info.gpio_chips.clone();
        if let Some(bus) = info.default_i2c_bus() {
            cfg.i2c_bus = bus;
        }
        cfg
    }

    /// Apply environment-variable overrides on top of `self`.
    pub fn from_env(mut self) -> Self {
        if let Ok(chip) = std::env::var("PINION_GPIO_CHIP") {
            self.gpio_chips = vec![PathBuf::from(chip)];
        }
        if let Ok(bus) = std::env::var("PINION_I2C_BUS") {
            self.i2c_bus = PathBuf::from(bus);
        }
        if let Ok(dev) = std::env::var("PINION_SPI_DEV") {
            self.spi_dev = PathBuf::from(dev);
        }
        if let Ok(dev) = std::env::var("PINION_SERIAL_DEV") {
            self.serial_dev = PathBuf::from(dev);
        }
        if let Ok(name) = std::env::var("PINION_CONSUMER") {
            self.consumer = name;
        }
        self
    }
}

/* ------------------------------------------------------------------ */
/*                        Board detection                             */
/* ------------------------------------------------------------------ */

/// Recognized single-board computer families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Board {
    RaspberryPi3,
    RaspberryPi4,
    RaspberryPi5,
    RaspberryPiCm4,
    RaspberryPiZero,
    RaspberryPiZero2,
    OrangePi,
    BeagleBone,
    JetsonNano,
    Unknown,
}

impl Board {
    pub fn is_raspberry_pi(self) -> bool {
        matches!(
            self,
            Board::RaspberryPi3
                | Board::RaspberryPi4
                | Board::RaspberryPi5
                | Board::RaspberryPiCm4
                | Board::RaspberryPiZero
                | Board::RaspberryPiZero2
        )
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Board::RaspberryPi3 => "Raspberry Pi 3",
            Board::RaspberryPi4 => "Raspberry Pi 4",
            Board::RaspberryPi5 => "Raspberry Pi 5",
            Board::RaspberryPiCm4 => "Raspberry Pi Compute Module 4",
            Board::RaspberryPiZero => "Raspberry Pi Zero",
            Board::RaspberryPiZero2 => "Raspberry Pi Zero 2",
            Board::OrangePi => "Orange Pi",
            Board::BeagleBone => "BeagleBone",
            Board::JetsonNano => "NVIDIA Jetson Nano",
            Board::Unknown => "Unknown board",
        };
        f.write_str(name)
    }
}

/// Detected board model plus the device nodes found on it
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub board: Board,
    pub gpio_chips: Vec<PathBuf>,
    /// (bus number, device path) pairs present under /dev
    pub i2c_buses: Vec<(u32, PathBuf)>,
}

impl PlatformInfo {
    /// Preferred I2C bus node for this board.
    ///
    /// Pi 5 exposes the header bus as /dev/i2c-20; everything else uses the
    /// first available bus.
    pub fn default_i2c_bus(&self) -> Option<PathBuf> {
        if self.board == Board::RaspberryPi5 {
            if let Some((_, path)) = self.i2c_buses.iter().find(|(n, _)| *n == 20) {
                return Some(path.clone());
            }
        }
        self.i2c_buses.first().map(|(_, path)| path.clone())
    }

    pub fn default_gpio_chip(&self) -> Option<PathBuf> {
        self.gpio_chips.first().cloned()
    }
}

/// Detect the running board and enumerate GPIO/I2C device nodes.
pub fn detect() -> PlatformInfo {
    let board = board_from_device_tree().unwrap_or_else(board_from_cpuinfo);
    PlatformInfo {
        board,
        gpio_chips: enumerate_gpio_chips(),
        i2c_buses: enumerate_i2c_buses(),
    }
}

fn board_from_device_tree() -> Option<Board> {
    let raw = std::fs::read("/proc/device-tree/model").ok()?;
    let model: String = raw
        .iter()
        .filter(|b| **b != 0 && **b != b'\n')
        .map(|b| *b as char)
        .collect();
    board_from_model(&model)
}

fn board_from_model(model: &str) -> Option<Board> {
    // Order matters: "Raspberry Pi Zero 2" contains "Raspberry Pi Zero".
    let table = [
        ("Raspberry Pi 5", Board::RaspberryPi5),
        ("Raspberry Pi 4", Board::RaspberryPi4),
        ("Raspberry Pi Compute Module 4", Board::RaspberryPiCm4),
        ("Raspberry Pi 3", Board::RaspberryPi3),
        ("Raspberry Pi Zero 2", Board::RaspberryPiZero2),
        ("Raspberry Pi Zero", Board::RaspberryPiZero),
        ("Orange Pi", Board::OrangePi),
        ("BeagleBone", Board::BeagleBone),
        ("TI AM335", Board::BeagleBone),
        ("Jetson", Board::JetsonNano),
    ];
    table
        .iter()
        .find(|(needle, _)| model.contains(needle))
        .map(|(_, board)| *board)
}

fn board_from_cpuinfo() -> Board {
    let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") else {
        return Board::Unknown;
    };
    if cpuinfo.contains("BCM2712") {
        Board::RaspberryPi5
    } else if cpuinfo.contains("BCM2711") {
        if cpuinfo.contains("Compute Module 4") {
            Board::RaspberryPiCm4
        } else {
            Board::RaspberryPi4
        }
    } else if cpuinfo.contains("BCM2837") {
        if cpuinfo.contains("Raspberry Pi Zero 2") {
            Board::RaspberryPiZero2
        } else {
            Board::RaspberryPi3
        }
    } else if cpuinfo.contains("BCM2836") {
        Board::RaspberryPi3
    } else if cpuinfo.contains("BCM2835") {
        Board::RaspberryPiZero
    } else if cpuinfo.contains("Allwinner") || cpuinfo.contains("sun") {
        Board::OrangePi
    } else if cpuinfo.contains("AM33XX") || cpuinfo.contains("AM335") {
        Board::BeagleBone
    } else if cpuinfo.contains("Tegra") {
        Board::JetsonNano
    } else {
        Board::Unknown
    }
}

fn enumerate_gpio_chips() -> Vec<PathBuf> {
    (0..16)
        .map(|n| PathBuf::from(format!("/dev/gpiochip{n}")))
        .filter(|p| p.exists())
        .collect()
}

fn enumerate_i2c_buses() -> Vec<(u32, PathBuf)> {
    (0..=20)
        .map(|n| (n, PathBuf::from(format!("/dev/i2c-{n}"))))
        .filter(|(_, p)| p.exists())
        .collect()
}

/* ------------------------------------------------------------------ */
/*                   Character device backend                         */
/* ------------------------------------------------------------------ */

use gpiocdev::chip::Chip;
use gpiocdev::line::{Bias, EdgeDetection, Value};
use gpiocdev::request::Request;
use std::sync::Arc;

struct ChipSlot {
    path: PathBuf,
    lines: u32,
}

/// Production adapter over the GPIO character device.
///
/// Opening fails if no configured (or discovered) chip is reachable; this
/// is reported before any pin operation is attempted.
pub struct CdevBackend {
    chips: Vec<ChipSlot>,
    consumer: String,
    total_lines: u32,
}

impl CdevBackend {
    pub fn open(config: &HalConfig) -> Result<Self> {
        let paths = if config.gpio_chips.is_empty() {
            enumerate_gpio_chips()
        } else {
            config.gpio_chips.clone()
        };
        if paths.is_empty() {
            return Err(Error::DeviceIo(
                "no GPIO chip device found (is /dev/gpiochip0 present?)".to_string(),
            ));
        }

        let mut chips = Vec::with_capacity(paths.len());
        let mut total_lines = 0;
        for path in paths {
            let chip = Chip::from_path(&path)
                .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))?;
            let info = chip
                .info()
                .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))?;
            tracing::info!(
                chip = %path.display(),
                lines = info.num_lines,
                "opened GPIO chip"
            );
            total_lines += info.num_lines;
            chips.push(ChipSlot {
                path,
                lines: info.num_lines,
            });
        }

        Ok(CdevBackend {
            chips,
            consumer: config.consumer.clone(),
            total_lines,
        })
    }

    /// Map a logical pin to (chip path, line offset) by cumulative counts.
    fn resolve(&self, pin: u32) -> Result<(&Path, u32)> {
        let mut remaining = pin;
        for chip in &self.chips {
            if remaining < chip.lines {
                return Ok((&chip.path, remaining));
            }
            remaining -= chip.lines;
        }
        Err(Error::InvalidPin(pin))
    }

    fn map_request_err(pin: u32, err: gpiocdev::Error) -> Error {
        let msg = err.to_string();
        if msg.contains("busy") || msg.contains("Busy") {
            Error::LineBusy(pin)
        } else {
            Error::DeviceIo(msg)
        }
    }
}

fn bias_for(mode: PinMode) -> Bias {
    match mode {
        PinMode::InputPullup => Bias::PullUp,
        PinMode::InputPulldown => Bias::PullDown,
        _ => Bias::Disabled,
    }
}

fn edge_detection_for(edge: Edge) -> EdgeDetection {
    match edge {
        Edge::Rising => EdgeDetection::RisingEdge,
        Edge::Falling => EdgeDetection::FallingEdge,
        Edge::Change => EdgeDetection::BothEdges,
    }
}

fn level_to_value(level: Level) -> Value {
    match level {
        Level::High => Value::Active,
        Level::Low => Value::Inactive,
    }
}

fn value_to_level(value: Value) -> Level {
    match value {
        Value::Active => Level::High,
        Value::Inactive => Level::Low,
    }
}

/// One held line request, shared between the registry and any event source
/// reading from the same request.
struct CdevLine {
    request: Arc<Request>,
    offset: u32,
    pin: u32,
}

impl LineHandle for CdevLine {
    fn set(&self, level: Level) -> Result<()> {
        self.request
            .set_value(self.offset, level_to_value(level))
            .map_err(|e| Error::DeviceIo(format!("pin {}: {e}", self.pin)))?;
        Ok(())
    }

    fn get(&self) -> Result<Level> {
        let value = self
            .request
            .value(self.offset)
            .map_err(|e| Error::DeviceIo(format!("pin {}: {e}", self.pin)))?;
        Ok(value_to_level(value))
    }
}

struct CdevEvents {
    request: Arc<Request>,
    pin: u32,
    /// Last line sequence number seen, for overflow detection
    last_line_seqno: Option<u32>,
}

impl EventSource for CdevEvents {
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        let ready = self
            .request
            .wait_edge_event(timeout)
            .map_err(|e| Error::DeviceIo(format!("pin {}: {e}", self.pin)))?;
        if !ready {
            return Ok(None);
        }
        let event = self
            .request
            .read_edge_event()
            .map_err(|e| Error::DeviceIo(format!("pin {}: {e}", self.pin)))?;

        // A gap in the per-line sequence numbers means the kernel's event
        // buffer overflowed between reads.
        let dropped = match self.last_line_seqno {
            Some(prev) => event.line_seqno.saturating_sub(prev).saturating_sub(1),
            None => 0,
        };
        self.last_line_seqno = Some(event.line_seqno);

        let edge = match event.kind {
            gpiocdev::line::EdgeKind::Rising => EdgeKind::Rising,
            gpiocdev::line::EdgeKind::Falling => EdgeKind::Falling,
        };
        Ok(Some(EdgeEvent {
            edge,
            timestamp_ns: event.timestamp_ns,
            dropped,
        }))
    }
}

impl GpioBackend for CdevBackend {
    fn line_count(&self) -> u32 {
        self.total_lines
    }

    fn request_output(&self, pin: u32, initial: Level) -> Result<Box<dyn LineHandle>> {
        let (chip, offset) = self.resolve(pin)?;
        let request = Request::builder()
            .on_chip(chip)
            .with_consumer(&self.consumer)
            .with_line(offset)
            .as_output(level_to_value(initial))
            .request()
            .map_err(|e| Self::map_request_err(pin, e))?;
        Ok(Box::new(CdevLine {
            request: Arc::new(request),
            offset,
            pin,
        }))
    }

    fn request_input(&self, pin: u32, mode: PinMode) -> Result<Box<dyn LineHandle>> {
        let (chip, offset) = self.resolve(pin)?;
        let request = Request::builder()
            .on_chip(chip)
            .with_consumer(&self.consumer)
            .with_line(offset)
            .as_input()
            .with_bias(bias_for(mode))
            .request()
            .map_err(|e| Self::map_request_err(pin, e))?;
        Ok(Box::new(CdevLine {
            request: Arc::new(request),
            offset,
            pin,
        }))
    }

    fn request_edges(
        &self,
        pin: u32,
        edge: Edge,
        mode: PinMode,
    ) -> Result<(Box<dyn LineHandle>, Box<dyn EventSource>)> {
        let (chip, offset) = self.resolve(pin)?;
        let request = Request::builder()
            .on_chip(chip)
            .with_consumer(&self.consumer)
            .with_line(offset)
            .as_input()
            .with_bias(bias_for(mode))
            .with_edge_detection(edge_detection_for(edge))
            .request()
            .map_err(|e| Self::map_request_err(pin, e))?;
        let request = Arc::new(request);
        let line = Box::new(CdevLine {
            request: Arc::clone(&request),
            offset,
            pin,
        });
        let events = Box::new(CdevEvents {
            request,
            pin,
            last_line_seqno: None,
        });
        Ok((line, events))
    }
}
