// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Edge-triggered interrupt dispatch
//!
//! One watcher thread per bound pin blocks on the kernel edge-event source
//! with a bounded poll timeout, so the stop flag is observed within
//! [`POLL_TIMEOUT`] even when no edges arrive. Handlers run synchronously on
//! the watcher thread, never the caller's. Handler panics and kernel buffer
//! overflows are reported through the error sink and never terminate the
//! watcher; one faulty handler cannot disable delivery for other pins.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::{Error, ErrorSink};
use crate::platform::EventSource;
use crate::types::Edge;

/// How often a watcher re-checks its stop flag while idle. This bounds both
/// detach latency and pin_mode teardown time.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Callback invoked on the watcher thread for each matching edge.
pub type InterruptHandler = Box<dyn FnMut() + Send + 'static>;

/// An active edge watcher on one pin.
pub(crate) struct InterruptBinding {
    pin: u32,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl InterruptBinding {
    pub fn spawn(
        pin: u32,
        edge: Edge,
        source: Box<dyn EventSource>,
        handler: InterruptHandler,
        sink: ErrorSink,
    ) -> InterruptBinding {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("pinion-irq-{pin}"))
                .spawn(move || watch(pin, source, handler, stop, sink))
                .expect("failed to spawn interrupt watcher thread")
        };
        let thread_id = thread.thread().id();
        tracing::debug!(pin, ?edge, "interrupt attached");
        InterruptBinding {
            pin,
            stop,
            thread: Some(thread),
            thread_id,
        }
    }

    /// Signal the watcher to exit and, unless called from the watcher
    /// thread itself, wait for it. A same-thread stop (detach from inside
    /// the handler) only sets the flag; the thread unwinds on its own and
    /// the finished handle is reaped when the binding drops elsewhere.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if std::thread::current().id() == self.thread_id {
            // Joining our own thread would self-deadlock; the loop exits at
            // the next flag check.
            self.thread.take();
            tracing::debug!(pin = self.pin, "deferred interrupt detach from handler");
            return;
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(pin = self.pin, "interrupt watcher panicked");
            }
        }
        tracing::debug!(pin = self.pin, "interrupt detached");
    }
}

impl Drop for InterruptBinding {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

fn watch(
    pin: u32,
    mut source: Box<dyn EventSource>,
    mut handler: InterruptHandler,
    stop: Arc<AtomicBool>,
    sink: ErrorSink,
) {
    while !stop.load(Ordering::Relaxed) {
        let event = match source.wait(POLL_TIMEOUT) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                sink(&err);
                // Back off so a persistently failing source cannot spin.
                std::thread::sleep(POLL_TIMEOUT);
                continue;
            }
        };

        if event.dropped > 0 {
            sink(&Error::DroppedEvents {
                pin,
                count: event.dropped,
            });
        }

        // The kernel already filtered on the requested edge; anything read
        // here is a matching event.
        if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
            sink(&Error::HandlerPanic(pin));
        }
    }
}
