// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware PWM via the kernel's `/sys/class/pwm` interface
//!
//! Unlike the software scheduler in [`crate::pwm`], a hardware channel is
//! driven by the SoC's PWM block and is jitter-free, which matters for
//! servos and motor drivers. On a Raspberry Pi the header pins map to
//! pwmchip0: GPIO12/GPIO18 are channel 0, GPIO13/GPIO19 are channel 1.
//!
//! Lifecycle follows the buses: construct with chip/channel numbers,
//! `begin(frequency)` exports the channel and enables the output, `end()`
//! disables and unexports. Some PWM blocks reject period changes while
//! enabled, so frequency and polarity updates disable the output around the
//! write and restore it afterward.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Frequency bounds accepted by [`HardwarePwm::begin`] and
/// [`HardwarePwm::set_frequency`], in Hz.
pub const MIN_FREQUENCY_HZ: u32 = 1;
pub const MAX_FREQUENCY_HZ: u32 = 25_000_000;

/// Output polarity of a hardware channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Active-high signal
    Normal,
    /// Active-low (inverted) signal
    Inversed,
}

impl Polarity {
    fn sysfs_value(self) -> &'static str {
        match self {
            Polarity::Normal => "normal",
            Polarity::Inversed => "inversed",
        }
    }
}

/// Transport seam under [`HardwarePwm`]: one exported kernel channel. The
/// production implementation writes the sysfs attribute files; tests
/// substitute a recording device.
pub trait PwmTransport: Send {
    fn set_period_ns(&mut self, period_ns: u64) -> Result<()>;
    fn set_duty_ns(&mut self, duty_ns: u64) -> Result<()>;
    fn set_polarity(&mut self, polarity: Polarity) -> Result<()>;
    fn set_enabled(&mut self, enabled: bool) -> Result<()>;
}

/// Factory exporting a (chip, channel) pair and returning its transport.
pub type PwmFactory = Box<dyn Fn(u32, u32) -> Result<Box<dyn PwmTransport>> + Send + Sync>;

/// One hardware PWM channel.
pub struct HardwarePwm {
    chip: u32,
    channel: u32,
    factory: PwmFactory,
    transport: Option<Box<dyn PwmTransport>>,
    period_ns: u64,
    duty_ns: u64,
    polarity: Polarity,
    enabled: bool,
}

impl HardwarePwm {
    /// Channel `channel` on pwmchip `chip`; nothing is exported until
    /// [`begin`](Self::begin).
    pub fn new(chip: u32, channel: u32) -> Self {
        Self::with_factory(chip, channel, Box::new(SysfsPwm::export))
    }

    /// Channel with an explicit transport factory (tests inject mocks here).
    pub fn with_factory(chip: u32, channel: u32, factory: PwmFactory) -> Self {
        HardwarePwm {
            chip,
            channel,
            factory,
            transport: None,
            period_ns: 0,
            duty_ns: 0,
            polarity: Polarity::Normal,
            enabled: false,
        }
    }

    /// The pwmchip channel a header pin maps to, if it has one.
    pub fn channel_for_pin(pin: u32) -> Option<(u32, u32)> {
        match pin {
            12 | 18 => Some((0, 0)),
            13 | 19 => Some((0, 1)),
            _ => None,
        }
    }

    /// Export the channel, program `frequency_hz` at zero duty, and enable
    /// the output. Calling again while open is a no-op.
    pub fn begin(&mut self, frequency_hz: u32) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let period_ns = period_for(frequency_hz)?;
        let mut transport = (self.factory)(self.chip, self.channel)?;
        // The kernel rejects a duty cycle before the period is set.
        transport.set_period_ns(period_ns)?;
        transport.set_duty_ns(0)?;
        transport.set_enabled(true)?;
        self.transport = Some(transport);
        self.period_ns = period_ns;
        self.duty_ns = 0;
        self.enabled = true;
        tracing::debug!(
            chip = self.chip,
            channel = self.channel,
            frequency_hz,
            "hardware PWM enabled"
        );
        Ok(())
    }

    /// Disable the output and unexport the channel. Idempotent.
    pub fn end(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if self.enabled {
                if let Err(err) = transport.set_enabled(false) {
                    tracing::warn!(
                        chip = self.chip,
                        channel = self.channel,
                        "failed to disable hardware PWM: {err}"
                    );
                }
            }
            tracing::debug!(chip = self.chip, channel = self.channel, "hardware PWM released");
        }
        self.enabled = false;
        self.period_ns = 0;
        self.duty_ns = 0;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn transport(&mut self) -> Result<&mut Box<dyn PwmTransport>> {
        self.transport
            .as_mut()
            .ok_or(Error::NotInitialized("HardwarePwm"))
    }

    /// Change the carrier frequency, preserving the duty cycle as a
    /// fraction of the period. The output is disabled around the period
    /// write and restored afterward.
    pub fn set_frequency(&mut self, frequency_hz: u32) -> Result<()> {
        let period_ns = period_for(frequency_hz)?;
        let duty_ns = if self.period_ns > 0 {
            (u128::from(self.duty_ns) * u128::from(period_ns) / u128::from(self.period_ns)) as u64
        } else {
            0
        };
        let was_enabled = self.enabled;
        let transport = self.transport()?;
        if was_enabled {
            transport.set_enabled(false)?;
        }
        transport.set_period_ns(period_ns)?;
        transport.set_duty_ns(duty_ns)?;
        if was_enabled {
            transport.set_enabled(true)?;
        }
        self.period_ns = period_ns;
        self.duty_ns = duty_ns;
        Ok(())
    }

    /// Duty cycle as a percentage of the period, 0.0 to 100.0.
    pub fn set_duty_percent(&mut self, percent: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(Error::InvalidState(format!(
                "duty cycle {percent}% outside 0..=100"
            )));
        }
        let duty_ns = ((percent / 100.0) * self.period_ns as f64) as u64;
        self.set_duty_ns(duty_ns)
    }

    /// Duty cycle as an 8-bit value: 0 maps to 0%, 255 to 100%.
    pub fn set_duty_8bit(&mut self, value: u8) -> Result<()> {
        let duty_ns = (u128::from(self.period_ns) * u128::from(value) / 255) as u64;
        self.set_duty_ns(duty_ns)
    }

    /// Pulse width in nanoseconds, clamped to the period.
    pub fn set_duty_ns(&mut self, duty_ns: u64) -> Result<()> {
        let duty_ns = if duty_ns > self.period_ns {
            tracing::warn!(
                duty_ns,
                period_ns = self.period_ns,
                "duty cycle exceeds period, clamping"
            );
            self.period_ns
        } else {
            duty_ns
        };
        self.transport()?.set_duty_ns(duty_ns)?;
        self.duty_ns = duty_ns;
        Ok(())
    }

    /// Period in nanoseconds. A duty cycle longer than the new period is
    /// clamped down first so the kernel never sees duty > period.
    pub fn set_period_ns(&mut self, period_ns: u64) -> Result<()> {
        if period_ns == 0 {
            return Err(Error::InvalidState("PWM period must be non-zero".to_string()));
        }
        let was_enabled = self.enabled;
        let clamp = self.duty_ns > period_ns;
        let transport = self.transport()?;
        if was_enabled {
            transport.set_enabled(false)?;
        }
        if clamp {
            transport.set_duty_ns(period_ns)?;
        }
        transport.set_period_ns(period_ns)?;
        if was_enabled {
            transport.set_enabled(true)?;
        }
        self.period_ns = period_ns;
        if clamp {
            self.duty_ns = period_ns;
        }
        Ok(())
    }

    /// Output polarity. The output is disabled around the write; polarity
    /// cannot change while the channel runs.
    pub fn set_polarity(&mut self, polarity: Polarity) -> Result<()> {
        let was_enabled = self.enabled;
        let transport = self.transport()?;
        if was_enabled {
            transport.set_enabled(false)?;
        }
        transport.set_polarity(polarity)?;
        if was_enabled {
            transport.set_enabled(true)?;
        }
        self.polarity = polarity;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.transport()?.set_enabled(true)?;
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        self.transport()?.set_enabled(false)?;
        self.enabled = false;
        Ok(())
    }

    /// Current frequency in Hz (0 before `begin`).
    pub fn frequency_hz(&self) -> u32 {
        if self.period_ns == 0 {
            0
        } else {
            (NANOS_PER_SEC / self.period_ns) as u32
        }
    }

    /// Current duty cycle percentage (0.0 before `begin`).
    pub fn duty_percent(&self) -> f64 {
        if self.period_ns == 0 {
            0.0
        } else {
            100.0 * self.duty_ns as f64 / self.period_ns as f64
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn duty_ns(&self) -> u64 {
        self.duty_ns
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }
}

impl Drop for HardwarePwm {
    fn drop(&mut self) {
        self.end();
    }
}

fn period_for(frequency_hz: u32) -> Result<u64> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&frequency_hz) {
        return Err(Error::InvalidState(format!(
            "PWM frequency {frequency_hz} Hz outside {MIN_FREQUENCY_HZ}..={MAX_FREQUENCY_HZ}"
        )));
    }
    Ok(NANOS_PER_SEC / u64::from(frequency_hz))
}

/* ------------------------------------------------------------------ */
/*                       sysfs transport                              */
/* ------------------------------------------------------------------ */

/// Production transport writing the pwmchip attribute files. Unexports the
/// channel on drop.
pub struct SysfsPwm {
    channel_dir: PathBuf,
    chip_dir: PathBuf,
    channel: u32,
}

impl SysfsPwm {
    pub fn export(chip: u32, channel: u32) -> Result<Box<dyn PwmTransport>> {
        let chip_dir = PathBuf::from(format!("/sys/class/pwm/pwmchip{chip}"));
        if !chip_dir.exists() {
            return Err(Error::DeviceIo(format!(
                "{} not present (hardware PWM overlay enabled?)",
                chip_dir.display()
            )));
        }
        let channel_dir = chip_dir.join(format!("pwm{channel}"));
        if !channel_dir.exists() {
            std::fs::write(chip_dir.join("export"), channel.to_string())
                .map_err(|e| Error::DeviceIo(format!("export pwm{channel}: {e}")))?;
            // sysfs creates the channel directory asynchronously.
            let mut ready = false;
            for _ in 0..50 {
                if channel_dir.join("period").exists() {
                    ready = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if !ready {
                return Err(Error::Timeout(format!(
                    "{} did not appear after export",
                    channel_dir.display()
                )));
            }
        }
        tracing::debug!(chip, channel, "PWM channel exported");
        Ok(Box::new(SysfsPwm {
            channel_dir,
            chip_dir,
            channel,
        }))
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<()> {
        let path = self.channel_dir.join(attr);
        std::fs::write(&path, value)
            .map_err(|e| Error::DeviceIo(format!("{}: {e}", path.display())))
    }
}

impl PwmTransport for SysfsPwm {
    fn set_period_ns(&mut self, period_ns: u64) -> Result<()> {
        self.write_attr("period", &period_ns.to_string())
    }

    fn set_duty_ns(&mut self, duty_ns: u64) -> Result<()> {
        self.write_attr("duty_cycle", &duty_ns.to_string())
    }

    fn set_polarity(&mut self, polarity: Polarity) -> Result<()> {
        self.write_attr("polarity", polarity.sysfs_value())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.write_attr("enable", if enabled { "1" } else { "0" })
    }
}

impl Drop for SysfsPwm {
    fn drop(&mut self) {
        let _ = std::fs::write(self.chip_dir.join("unexport"), self.channel.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every attribute write in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Period(u64),
        Duty(u64),
        Polarity(Polarity),
        Enable(bool),
    }

    struct RecordingPwm {
        ops: Arc<Mutex<Vec<Op>>>,
    }

    impl PwmTransport for RecordingPwm {
        fn set_period_ns(&mut self, period_ns: u64) -> Result<()> {
            self.ops.lock().push(Op::Period(period_ns));
            Ok(())
        }

        fn set_duty_ns(&mut self, duty_ns: u64) -> Result<()> {
            self.ops.lock().push(Op::Duty(duty_ns));
            Ok(())
        }

        fn set_polarity(&mut self, polarity: Polarity) -> Result<()> {
            self.ops.lock().push(Op::Polarity(polarity));
            Ok(())
        }

        fn set_enabled(&mut self, enabled: bool) -> Result<()> {
            self.ops.lock().push(Op::Enable(enabled));
            Ok(())
        }
    }

    fn pwm_with_recorder() -> (HardwarePwm, Arc<Mutex<Vec<Op>>>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::clone(&ops);
        let pwm = HardwarePwm::with_factory(
            0,
            0,
            Box::new(move |_, _| {
                Ok(Box::new(RecordingPwm {
                    ops: Arc::clone(&handle),
                }) as Box<dyn PwmTransport>)
            }),
        );
        (pwm, ops)
    }

    #[test]
    fn test_ops_before_begin_fail() {
        let (mut pwm, _) = pwm_with_recorder();
        assert!(matches!(
            pwm.set_duty_percent(50.0),
            Err(Error::NotInitialized("HardwarePwm"))
        ));
        assert!(matches!(
            pwm.enable(),
            Err(Error::NotInitialized("HardwarePwm"))
        ));
    }

    #[test]
    fn test_begin_programs_period_before_duty() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(50).unwrap();
        assert_eq!(
            *ops.lock(),
            vec![Op::Period(20_000_000), Op::Duty(0), Op::Enable(true)]
        );
        assert_eq!(pwm.frequency_hz(), 50);
        assert!(pwm.is_enabled());

        // Repeated begin is a no-op.
        pwm.begin(1000).unwrap();
        assert_eq!(ops.lock().len(), 3);
        assert_eq!(pwm.frequency_hz(), 50);
    }

    #[test]
    fn test_frequency_bounds() {
        let (mut pwm, _) = pwm_with_recorder();
        assert!(matches!(pwm.begin(0), Err(Error::InvalidState(_))));
        assert!(matches!(
            pwm.begin(MAX_FREQUENCY_HZ + 1),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_duty_conversions() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(1000).unwrap();

        pwm.set_duty_percent(25.0).unwrap();
        assert_eq!(pwm.duty_ns(), 250_000);

        pwm.set_duty_8bit(255).unwrap();
        assert_eq!(pwm.duty_ns(), 1_000_000);
        pwm.set_duty_8bit(0).unwrap();
        assert_eq!(pwm.duty_ns(), 0);

        assert!(pwm.set_duty_percent(100.1).is_err());
        assert_eq!(ops.lock().last(), Some(&Op::Duty(0)));
    }

    #[test]
    fn test_duty_clamped_to_period() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(1000).unwrap();
        pwm.set_duty_ns(5_000_000).unwrap();
        assert_eq!(pwm.duty_ns(), 1_000_000);
        assert_eq!(ops.lock().last(), Some(&Op::Duty(1_000_000)));
    }

    #[test]
    fn test_frequency_change_preserves_duty_fraction() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(1000).unwrap();
        pwm.set_duty_percent(50.0).unwrap();

        ops.lock().clear();
        pwm.set_frequency(2000).unwrap();
        // Disabled around the period write, duty rescaled to 50% of 500µs.
        assert_eq!(
            *ops.lock(),
            vec![
                Op::Enable(false),
                Op::Period(500_000),
                Op::Duty(250_000),
                Op::Enable(true),
            ]
        );
        assert_eq!(pwm.frequency_hz(), 2000);
        assert_eq!(pwm.duty_percent(), 50.0);
    }

    #[test]
    fn test_polarity_change_toggles_enable() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(50).unwrap();
        ops.lock().clear();
        pwm.set_polarity(Polarity::Inversed).unwrap();
        assert_eq!(
            *ops.lock(),
            vec![
                Op::Enable(false),
                Op::Polarity(Polarity::Inversed),
                Op::Enable(true),
            ]
        );
        assert_eq!(pwm.polarity(), Polarity::Inversed);
    }

    #[test]
    fn test_end_disables_and_is_idempotent() {
        let (mut pwm, ops) = pwm_with_recorder();
        pwm.begin(50).unwrap();
        pwm.end();
        assert_eq!(ops.lock().last(), Some(&Op::Enable(false)));
        assert!(!pwm.is_open());
        assert_eq!(pwm.frequency_hz(), 0);
        let writes = ops.lock().len();
        pwm.end();
        assert_eq!(ops.lock().len(), writes);
    }

    #[test]
    fn test_pin_channel_mapping() {
        assert_eq!(HardwarePwm::channel_for_pin(12), Some((0, 0)));
        assert_eq!(HardwarePwm::channel_for_pin(18), Some((0, 0)));
        assert_eq!(HardwarePwm::channel_for_pin(13), Some((0, 1)));
        assert_eq!(HardwarePwm::channel_for_pin(19), Some((0, 1)));
        assert_eq!(HardwarePwm::channel_for_pin(17), None);
    }
}
