// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Software PWM: per-pin deadline schedulers
//!
//! Most target lines lack hardware PWM, so the duty cycle is emulated by a
//! dedicated thread per channel toggling the line. Deadlines are absolute
//! (`prior + period`), so an oversleep in one iteration never accumulates
//! into drift across the cycle train. Duty 0 and 255 hold the level with no
//! toggling at all.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ErrorSink;
use crate::platform::LineHandle;
use crate::types::Level;

/// Default period ≈ 490 Hz, the conventional analogWrite rate.
pub const DEFAULT_PWM_PERIOD_MICROS: u64 = 2041;

/// Time source for the scheduler, substitutable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    /// Sleep until `deadline`; returns immediately if it already passed.
    fn sleep_until(&self, deadline: Instant);
}

/// Production clock over the monotonic system clock.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if let Some(remaining) = deadline.checked_duration_since(now) {
            std::thread::sleep(remaining);
        }
    }
}

/// A running software PWM channel on one pin.
///
/// Stopping (or dropping) the channel leaves the pin level unspecified;
/// callers needing a defined level must issue a `digital_write` afterward.
pub(crate) struct PwmChannel {
    pin: u32,
    duty: Arc<AtomicU8>,
    period_micros: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PwmChannel {
    pub fn spawn(
        pin: u32,
        line: Arc<dyn LineHandle>,
        duty: u8,
        period_micros: u64,
        clock: Arc<dyn Clock>,
        sink: ErrorSink,
    ) -> PwmChannel {
        let duty = Arc::new(AtomicU8::new(duty));
        let period = Arc::new(AtomicU64::new(period_micros.max(1)));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let duty = Arc::clone(&duty);
            let period = Arc::clone(&period);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("pinion-pwm-{pin}"))
                .spawn(move || run_channel(pin, line, duty, period, stop, clock, sink))
                .expect("failed to spawn PWM thread")
        };

        tracing::debug!(pin, period_micros, "software PWM started");
        PwmChannel {
            pin,
            duty,
            period_micros: period,
            stop,
            thread: Some(thread),
        }
    }

    /// Update the duty cycle of the running channel.
    pub fn set_duty(&self, duty: u8) {
        self.duty.store(duty, Ordering::Relaxed);
    }

    pub fn set_period_micros(&self, period_micros: u64) {
        self.period_micros
            .store(period_micros.max(1), Ordering::Relaxed);
    }

    pub fn duty(&self) -> u8 {
        self.duty.load(Ordering::Relaxed)
    }

    /// Signal the scheduler to exit and wait for it. Latency is bounded by
    /// one period (the scheduler re-checks the flag at each deadline).
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(pin = self.pin, "PWM thread panicked");
            }
        }
        tracing::debug!(pin = self.pin, "software PWM stopped");
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

fn high_time(period: Duration, duty: u8) -> Duration {
    Duration::from_nanos(period.as_nanos() as u64 / 255 * duty as u64)
}

fn run_channel(
    pin: u32,
    line: Arc<dyn LineHandle>,
    duty: Arc<AtomicU8>,
    period_micros: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    sink: ErrorSink,
) {
    let mut deadline = clock.now();
    // Avoid a redundant kernel write per cycle at the duty extremes.
    let mut held: Option<Level> = None;

    while !stop.load(Ordering::Relaxed) {
        let duty = duty.load(Ordering::Relaxed);
        let period = Duration::from_micros(period_micros.load(Ordering::Relaxed));

        let result = match duty {
            0 => {
                let r = if held != Some(Level::Low) {
                    held = Some(Level::Low);
                    line.set(Level::Low)
                } else {
                    Ok(())
                };
                deadline += period;
                clock.sleep_until(deadline);
                r
            }
            255 => {
                let r = if held != Some(Level::High) {
                    held = Some(Level::High);
                    line.set(Level::High)
                } else {
                    Ok(())
                };
                deadline += period;
                clock.sleep_until(deadline);
                r
            }
            _ => {
                held = None;
                let r = line.set(Level::High);
                clock.sleep_until(deadline + high_time(period, duty));
                let r = r.and(if stop.load(Ordering::Relaxed) {
                    Ok(())
                } else {
                    line.set(Level::Low)
                });
                deadline += period;
                clock.sleep_until(deadline);
                r
            }
        };

        if let Err(err) = result {
            sink(&err);
            break;
        }
    }
    // The final pin level is intentionally left wherever the last toggle
    // put it (undefined-on-stop contract).
}
