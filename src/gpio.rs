// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pin controller: configuration, digital I/O, PWM and interrupt wiring
//!
//! All operations validate the pin number against the platform adapter and
//! route state through the per-pin registry. Teardown discipline: PWM
//! channels and interrupt bindings are taken out of the slot under its lock
//! but stopped with the lock released, so a handler running concurrently can
//! call back into the controller without deadlocking.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{logging_sink, Error, ErrorSink, Result};
use crate::interrupt::InterruptBinding;
use crate::platform::{CdevBackend, GpioBackend, HalConfig};
use crate::pwm::{Clock, MonotonicClock, PwmChannel, DEFAULT_PWM_PERIOD_MICROS};
use crate::registry::PinRegistry;
use crate::types::{Edge, Level, PinMode};

/// Block the calling thread for `millis` milliseconds.
pub fn delay(millis: u64) {
    std::thread::sleep(Duration::from_millis(millis));
}

/// Block the calling thread for `micros` microseconds.
pub fn delay_micros(micros: u64) {
    std::thread::sleep(Duration::from_micros(micros));
}

/// GPIO controller over one platform adapter.
///
/// The controller is `Send + Sync`; methods take `&self` and are safe to
/// call from multiple threads, including from inside interrupt handlers.
pub struct Pinion {
    backend: Arc<dyn GpioBackend>,
    registry: PinRegistry,
    error_sink: ErrorSink,
    clock: Arc<dyn Clock>,
}

impl Pinion {
    /// Open the character-device adapter described by `config`.
    pub fn open(config: &HalConfig) -> Result<Self> {
        let backend = CdevBackend::open(config)?;
        Ok(Self::with_backend(Arc::new(backend)))
    }

    /// Build a controller over an explicit adapter (tests use a mock here).
    pub fn with_backend(backend: Arc<dyn GpioBackend>) -> Self {
        Pinion {
            backend,
            registry: PinRegistry::new(),
            error_sink: logging_sink(),
            clock: Arc::new(MonotonicClock),
        }
    }

    /// Replace the sink receiving errors raised on background threads
    /// (interrupt watchers, PWM schedulers).
    pub fn set_error_sink(&mut self, sink: ErrorSink) {
        self.error_sink = sink;
    }

    fn validate(&self, pin: u32) -> Result<()> {
        if pin >= self.backend.line_count() {
            return Err(Error::InvalidPin(pin));
        }
        Ok(())
    }

    /// Configure `pin` for `mode`, tearing down any PWM channel, interrupt
    /// binding and prior line request first. [`PinMode::Unset`] releases the
    /// pin entirely.
    pub fn pin_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);

        let (pwm, irq) = {
            let mut st = slot.state.lock();
            (st.pwm.take(), st.irq.take())
        };
        if let Some(pwm) = pwm {
            pwm.stop();
        }
        if let Some(irq) = irq {
            irq.stop();
        }

        let mut st = slot.state.lock();
        // The old request must be dropped before the kernel accepts a new
        // one on the same line.
        st.line = None;
        st.mode = PinMode::Unset;

        if mode == PinMode::Unset {
            tracing::debug!(pin, "pin released");
            return Ok(());
        }

        let line = if mode.is_output() {
            self.backend.request_output(pin, st.last_level)?
        } else {
            self.backend.request_input(pin, mode)?
        };
        st.line = Some(Arc::from(line));
        st.mode = mode;
        tracing::debug!(pin, ?mode, "pin configured");
        Ok(())
    }

    /// Current mode of `pin` ([`PinMode::Unset`] if never configured).
    pub fn mode_of(&self, pin: u32) -> PinMode {
        self.registry.mode_of(pin)
    }

    /// Drive an output pin to `level`. Stops any PWM channel on the pin.
    pub fn digital_write(&self, pin: u32, level: Level) -> Result<()> {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);

        let pwm = {
            let mut st = slot.state.lock();
            if !st.mode.is_output() {
                return Err(Error::NotConfigured(pin));
            }
            st.pwm.take()
        };
        if let Some(pwm) = pwm {
            pwm.stop();
        }

        let mut st = slot.state.lock();
        // The lock was released while the channel stopped; a concurrent
        // pin_mode may have reconfigured the pin in the gap.
        if !st.mode.is_output() {
            return Err(Error::NotConfigured(pin));
        }
        let line = st.line.clone().ok_or(Error::NotConfigured(pin))?;
        line.set(level)?;
        st.last_level = level;
        Ok(())
    }

    /// Sample the current level of a configured pin.
    pub fn digital_read(&self, pin: u32) -> Result<Level> {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);
        let st = slot.state.lock();
        if st.mode == PinMode::Unset {
            return Err(Error::NotConfigured(pin));
        }
        let line = st.line.clone().ok_or(Error::NotConfigured(pin))?;
        line.get()
    }

    /// Invert an output pin's driven level.
    pub fn digital_toggle(&self, pin: u32) -> Result<Level> {
        self.validate(pin)?;
        let next = {
            let slot = self.registry.slot(pin);
            let st = slot.state.lock();
            if !st.mode.is_output() {
                return Err(Error::NotConfigured(pin));
            }
            st.last_level.toggled()
        };
        self.digital_write(pin, next)?;
        Ok(next)
    }

    /// Emit a PWM waveform with `duty` in 0..=255 at the conventional rate
    /// of roughly 490 Hz. Configures the pin as an output if needed; an
    /// existing channel is retuned in place without restarting its thread.
    pub fn analog_write(&self, pin: u32, duty: u8) -> Result<()> {
        self.analog_write_with_period(pin, duty, DEFAULT_PWM_PERIOD_MICROS)
    }

    /// [`analog_write`](Self::analog_write) at an explicit carrier frequency.
    pub fn analog_write_with_frequency(&self, pin: u32, duty: u8, frequency_hz: u32) -> Result<()> {
        if frequency_hz == 0 {
            return Err(Error::InvalidState(
                "PWM frequency must be non-zero".to_string(),
            ));
        }
        self.analog_write_with_period(pin, duty, 1_000_000 / u64::from(frequency_hz))
    }

    fn analog_write_with_period(&self, pin: u32, duty: u8, period_micros: u64) -> Result<()> {
        self.validate(pin)?;
        if self.mode_of(pin) != PinMode::Output {
            self.pin_mode(pin, PinMode::Output)?;
        }
        let slot = self.registry.slot(pin);
        let mut st = slot.state.lock();
        if let Some(pwm) = &st.pwm {
            pwm.set_period_micros(period_micros);
            pwm.set_duty(duty);
            return Ok(());
        }
        let line = st.line.clone().ok_or(Error::NotConfigured(pin))?;
        st.pwm = Some(PwmChannel::spawn(
            pin,
            line,
            duty,
            period_micros,
            Arc::clone(&self.clock),
            Arc::clone(&self.error_sink),
        ));
        Ok(())
    }

    /// Stop the PWM channel on `pin`, if any. Idempotent; the line level is
    /// left wherever the last toggle put it.
    pub fn no_analog_write(&self, pin: u32) -> Result<()> {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);
        let pwm = slot.state.lock().pwm.take();
        if let Some(pwm) = pwm {
            pwm.stop();
        }
        Ok(())
    }

    /// Bind `handler` to edge events on an input pin. The handler runs on a
    /// dedicated watcher thread; a prior binding on the pin is replaced.
    pub fn attach_interrupt<F>(&self, pin: u32, edge: Edge, handler: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);

        let (mode, prior) = {
            let mut st = slot.state.lock();
            if !st.mode.is_input() {
                return Err(Error::InvalidState(format!(
                    "attach_interrupt requires an input mode on pin {pin}"
                )));
            }
            (st.mode, st.irq.take())
        };
        if let Some(prior) = prior {
            prior.stop();
        }

        let mut st = slot.state.lock();
        // The plain input request must be released before the edge-detecting
        // request on the same line is accepted.
        st.line = None;
        match self.backend.request_edges(pin, edge, mode) {
            Ok((line, source)) => {
                st.line = Some(Arc::from(line));
                st.irq = Some(InterruptBinding::spawn(
                    pin,
                    edge,
                    source,
                    Box::new(handler),
                    Arc::clone(&self.error_sink),
                ));
                Ok(())
            }
            Err(err) => {
                // Restore a readable request so digital_read keeps working.
                st.line = self
                    .backend
                    .request_input(pin, mode)
                    .ok()
                    .map(Arc::from);
                Err(err)
            }
        }
    }

    /// Remove the interrupt binding on `pin`. Returns whether one existed.
    /// Safe to call from inside the pin's own handler; the watcher thread
    /// then winds down on its own instead of being joined.
    pub fn detach_interrupt(&self, pin: u32) -> Result<bool> {
        self.validate(pin)?;
        let slot = self.registry.slot(pin);
        let irq = slot.state.lock().irq.take();
        match irq {
            Some(irq) => {
                irq.stop();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{EventSource, LineHandle};
    use crate::types::EdgeEvent;
    use ahash::AHashMap;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory adapter: levels live in a shared map, edge sources never
    /// fire. Enough to exercise the controller's state machine.
    struct MockBackend {
        lines: u32,
        levels: Arc<Mutex<AHashMap<u32, Level>>>,
        active_requests: Arc<AtomicUsize>,
    }

    impl MockBackend {
        fn new(lines: u32) -> Arc<Self> {
            Arc::new(MockBackend {
                lines,
                levels: Arc::new(Mutex::new(AHashMap::new())),
                active_requests: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn handle(&self, pin: u32) -> Box<dyn LineHandle> {
            self.active_requests.fetch_add(1, Ordering::SeqCst);
            Box::new(MockLine {
                pin,
                levels: Arc::clone(&self.levels),
                active_requests: Arc::clone(&self.active_requests),
            })
        }
    }

    struct MockLine {
        pin: u32,
        levels: Arc<Mutex<AHashMap<u32, Level>>>,
        active_requests: Arc<AtomicUsize>,
    }

    impl Drop for MockLine {
        fn drop(&mut self) {
            self.active_requests.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl LineHandle for MockLine {
        fn set(&self, level: Level) -> crate::error::Result<()> {
            self.levels.lock().insert(self.pin, level);
            Ok(())
        }

        fn get(&self) -> crate::error::Result<Level> {
            Ok(*self.levels.lock().get(&self.pin).unwrap_or(&Level::Low))
        }
    }

    struct SilentSource;

    impl EventSource for SilentSource {
        fn wait(&mut self, timeout: Duration) -> crate::error::Result<Option<EdgeEvent>> {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(None)
        }
    }

    impl GpioBackend for MockBackend {
        fn line_count(&self) -> u32 {
            self.lines
        }

        fn request_output(&self, pin: u32, initial: Level) -> crate::error::Result<Box<dyn LineHandle>> {
            self.levels.lock().insert(pin, initial);
            Ok(self.handle(pin))
        }

        fn request_input(&self, pin: u32, _mode: PinMode) -> crate::error::Result<Box<dyn LineHandle>> {
            Ok(self.handle(pin))
        }

        fn request_edges(
            &self,
            pin: u32,
            _edge: Edge,
            _mode: PinMode,
        ) -> crate::error::Result<(Box<dyn LineHandle>, Box<dyn EventSource>)> {
            Ok((self.handle(pin), Box::new(SilentSource)))
        }
    }

    #[test]
    fn test_invalid_pin_rejected() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        assert!(matches!(
            hal.pin_mode(28, PinMode::Output),
            Err(Error::InvalidPin(28))
        ));
        assert!(matches!(
            hal.digital_write(99, Level::High),
            Err(Error::InvalidPin(99))
        ));
    }

    #[test]
    fn test_write_requires_output_mode() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        assert!(matches!(
            hal.digital_write(4, Level::High),
            Err(Error::NotConfigured(4))
        ));
        hal.pin_mode(4, PinMode::Input).unwrap();
        assert!(matches!(
            hal.digital_write(4, Level::High),
            Err(Error::NotConfigured(4))
        ));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let backend = MockBackend::new(28);
        let hal = Pinion::with_backend(backend.clone());
        hal.pin_mode(17, PinMode::Output).unwrap();
        hal.digital_write(17, Level::High).unwrap();
        assert_eq!(hal.digital_read(17).unwrap(), Level::High);
        assert_eq!(hal.digital_toggle(17).unwrap(), Level::Low);
        assert_eq!(hal.digital_read(17).unwrap(), Level::Low);
    }

    #[test]
    fn test_unset_releases_line_request() {
        let backend = MockBackend::new(28);
        let hal = Pinion::with_backend(backend.clone());
        hal.pin_mode(17, PinMode::Output).unwrap();
        assert_eq!(backend.active_requests.load(Ordering::SeqCst), 1);
        hal.pin_mode(17, PinMode::Unset).unwrap();
        assert_eq!(backend.active_requests.load(Ordering::SeqCst), 0);
        assert_eq!(hal.mode_of(17), PinMode::Unset);
        assert!(matches!(
            hal.digital_read(17),
            Err(Error::NotConfigured(17))
        ));
    }

    #[test]
    fn test_reconfigure_swaps_request_not_leaks() {
        let backend = MockBackend::new(28);
        let hal = Pinion::with_backend(backend.clone());
        hal.pin_mode(17, PinMode::Output).unwrap();
        hal.pin_mode(17, PinMode::InputPullup).unwrap();
        assert_eq!(backend.active_requests.load(Ordering::SeqCst), 1);
        assert_eq!(hal.mode_of(17), PinMode::InputPullup);
    }

    #[test]
    fn test_analog_write_auto_configures_output() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        assert_eq!(hal.mode_of(12), PinMode::Unset);
        hal.analog_write(12, 128).unwrap();
        assert_eq!(hal.mode_of(12), PinMode::Output);
        hal.no_analog_write(12).unwrap();
        // Idempotent.
        hal.no_analog_write(12).unwrap();
    }

    #[test]
    fn test_digital_write_stops_pwm() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        hal.analog_write(12, 128).unwrap();
        hal.digital_write(12, Level::Low).unwrap();
        assert_eq!(hal.digital_read(12).unwrap(), Level::Low);
    }

    #[test]
    fn test_attach_requires_input_mode() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        hal.pin_mode(4, PinMode::Output).unwrap();
        assert!(matches!(
            hal.attach_interrupt(4, Edge::Rising, || {}),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_attach_detach_lifecycle() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        hal.pin_mode(4, PinMode::InputPullup).unwrap();
        hal.attach_interrupt(4, Edge::Falling, || {}).unwrap();
        assert!(hal.detach_interrupt(4).unwrap());
        assert!(!hal.detach_interrupt(4).unwrap());
        // Pin stays readable after detach.
        assert_eq!(hal.digital_read(4).unwrap(), Level::Low);
    }

    #[test]
    fn test_pin_mode_clears_interrupt() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        hal.pin_mode(4, PinMode::Input).unwrap();
        hal.attach_interrupt(4, Edge::Change, || {}).unwrap();
        hal.pin_mode(4, PinMode::Output).unwrap();
        assert!(!hal.detach_interrupt(4).unwrap());
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let hal = Pinion::with_backend(MockBackend::new(28));
        assert!(matches!(
            hal.analog_write_with_frequency(12, 128, 0),
            Err(Error::InvalidState(_))
        ));
    }
}
