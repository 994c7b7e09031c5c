// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the pinion HAL

use std::sync::Arc;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for pin, PWM, interrupt and bus operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pin number outside the range of the platform adapter
    #[error("invalid pin {0}")]
    InvalidPin(u32),

    /// Operation incompatible with the pin's current mode
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Pin used before pin_mode() configured it, or with a mismatched mode
    #[error("pin {0} not configured for this operation - call pin_mode() first")]
    NotConfigured(u32),

    /// Bus used before begin()
    #[error("{0} used before begin()")]
    NotInitialized(&'static str),

    /// GPIO line already claimed by another consumer
    #[error("GPIO line for pin {0} is busy")]
    LineBusy(u32),

    /// Transport-level failure talking to a kernel device
    #[error("device I/O error: {0}")]
    DeviceIo(String),

    /// Bounded wait elapsed without the expected condition
    #[error("timed out: {0}")]
    Timeout(String),

    /// Kernel edge-event buffer overflowed; events were lost (non-fatal)
    #[error("kernel dropped {count} edge event(s) on pin {pin}")]
    DroppedEvents { pin: u32, count: u32 },

    /// User interrupt handler panicked; the watcher keeps running
    #[error("interrupt handler for pin {0} panicked")]
    HandlerPanic(u32),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout(err.to_string())
        } else {
            Error::DeviceIo(err.to_string())
        }
    }
}

impl Error {
    /// Check if the error is a non-fatal delivery condition rather than a
    /// hard failure (dispatchers report these and keep running).
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Error::DroppedEvents { .. } | Error::HandlerPanic(_))
    }
}

/// Sink receiving errors raised on background contexts (interrupt watchers,
/// PWM schedulers) where no caller is available to observe a `Result`.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Default sink: log through tracing at error level.
pub(crate) fn logging_sink() -> ErrorSink {
    Arc::new(|err| tracing::error!("background error: {err}"))
}
