// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Pinion - Arduino-style GPIO for Linux single-board computers
//!
//! Pinion maps the familiar sketch API (`pin_mode`, `digital_write`,
//! `analog_write`, `attach_interrupt`, `Wire`, `SPI`, `Serial`) onto the
//! kernel interfaces a modern Linux board actually exposes: the GPIO
//! character device, i2c-dev, spidev and TTYs. No memory-mapped register
//! access, no root-only `/sys` pokes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pinion::prelude::*;
//!
//! let hal = Pinion::open(&HalConfig::detect())?;
//!
//! hal.pin_mode(17, PinMode::Output)?;
//! hal.digital_write(17, Level::High)?;
//!
//! hal.pin_mode(4, PinMode::InputPullup)?;
//! hal.attach_interrupt(4, Edge::Falling, || {
//!     println!("button pressed");
//! })?;
//! # Ok::<(), pinion::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Controller: Pinion                                     │
//! │  (pin modes, digital I/O, PWM, interrupts)              │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Registry: per-pin slots, independent locking           │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Platform adapter: GpioBackend over /dev/gpiochip*      │
//! └─────────────────────────────────────────────────────────┘
//!
//! Buses (independent of the pin controller):
//!   Wire   → /dev/i2c-*        Spi → /dev/spidev*
//!   Serial → /dev/tty*
//! ```
//!
//! Software PWM runs one scheduler thread per channel; interrupts run one
//! watcher thread per bound pin. Background failures are routed to a
//! configurable error sink and logged through `tracing` by default. Pins
//! backed by a SoC PWM block can use [`HardwarePwm`] over `/sys/class/pwm`
//! instead of the software scheduler.
//!
//! ## License
//!
//! Apache-2.0

pub mod bus;
pub mod error;
pub mod gpio;
pub mod hwpwm;
pub mod interrupt;
pub mod platform;
pub mod pwm;
mod registry;
pub mod types;

pub use bus::i2c::{TxStatus, Wire};
pub use bus::serial::Serial;
pub use bus::spi::{BitOrder, ClockDivider, DataMode, Spi};
pub use error::{Error, ErrorSink, Result};
pub use gpio::{delay, delay_micros, Pinion};
pub use hwpwm::{HardwarePwm, Polarity};
pub use platform::{detect, Board, HalConfig, PlatformInfo};
pub use types::{Edge, EdgeEvent, EdgeKind, Level, PinMode};

/// Crate version, for logging and agent handshakes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::bus::i2c::{TxStatus, Wire};
    pub use crate::bus::serial::Serial;
    pub use crate::bus::spi::{BitOrder, ClockDivider, DataMode, Spi};
    pub use crate::error::{Error, Result};
    pub use crate::gpio::{delay, delay_micros, Pinion};
    pub use crate::hwpwm::{HardwarePwm, Polarity};
    pub use crate::platform::HalConfig;
    pub use crate::types::{Edge, Level, PinMode};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version_is_set() {
        assert!(!crate::VERSION.is_empty());
    }
}
