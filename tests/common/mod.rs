// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared mocks for integration tests: an in-memory GPIO adapter with edge
//! injection, and in-memory bus transports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use pinion::error::{Error, Result};
use pinion::platform::{EventSource, GpioBackend, LineHandle};
use pinion::types::{Edge, EdgeEvent, EdgeKind, Level, PinMode};

/// In-memory GPIO adapter. Levels live in a shared map readable by the
/// test; edge events are injected per pin through a channel.
pub struct MockBackend {
    lines: u32,
    pub levels: Arc<Mutex<AHashMap<u32, Level>>>,
    edge_taps: Mutex<AHashMap<u32, Sender<EdgeEvent>>>,
}

impl MockBackend {
    pub fn new(lines: u32) -> Arc<Self> {
        Arc::new(MockBackend {
            lines,
            levels: Arc::new(Mutex::new(AHashMap::new())),
            edge_taps: Mutex::new(AHashMap::new()),
        })
    }

    /// Deliver one edge event to the watcher on `pin`, if any.
    pub fn inject(&self, pin: u32, edge: EdgeKind, dropped: u32) {
        if let Some(tap) = self.edge_taps.lock().get(&pin) {
            let _ = tap.send(EdgeEvent {
                edge,
                timestamp_ns: 0,
                dropped,
            });
        }
    }

    /// Level the controller last drove on `pin`.
    pub fn level(&self, pin: u32) -> Level {
        *self.levels.lock().get(&pin).unwrap_or(&Level::Low)
    }

    /// Externally set the sampled level of `pin` (simulates the wire).
    pub fn set_level(&self, pin: u32, level: Level) {
        self.levels.lock().insert(pin, level);
    }

    fn handle(&self, pin: u32) -> Box<dyn LineHandle> {
        Box::new(MockLine {
            pin,
            levels: Arc::clone(&self.levels),
        })
    }
}

struct MockLine {
    pin: u32,
    levels: Arc<Mutex<AHashMap<u32, Level>>>,
}

impl LineHandle for MockLine {
    fn set(&self, level: Level) -> Result<()> {
        self.levels.lock().insert(self.pin, level);
        Ok(())
    }

    fn get(&self) -> Result<Level> {
        Ok(*self.levels.lock().get(&self.pin).unwrap_or(&Level::Low))
    }
}

struct ChannelSource {
    rx: Receiver<EdgeEvent>,
}

impl EventSource for ChannelSource {
    fn wait(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl GpioBackend for MockBackend {
    fn line_count(&self) -> u32 {
        self.lines
    }

    fn request_output(&self, pin: u32, initial: Level) -> Result<Box<dyn LineHandle>> {
        self.levels.lock().insert(pin, initial);
        Ok(self.handle(pin))
    }

    fn request_input(&self, pin: u32, _mode: PinMode) -> Result<Box<dyn LineHandle>> {
        Ok(self.handle(pin))
    }

    fn request_edges(
        &self,
        pin: u32,
        _edge: Edge,
        _mode: PinMode,
    ) -> Result<(Box<dyn LineHandle>, Box<dyn EventSource>)> {
        let (tx, rx) = unbounded();
        self.edge_taps.lock().insert(pin, tx);
        Ok((self.handle(pin), Box::new(ChannelSource { rx })))
    }
}

/// Adapter that refuses every line request, for failure-path tests.
pub struct FailingBackend {
    pub lines: u32,
}

impl GpioBackend for FailingBackend {
    fn line_count(&self) -> u32 {
        self.lines
    }

    fn request_output(&self, pin: u32, _initial: Level) -> Result<Box<dyn LineHandle>> {
        Err(Error::LineBusy(pin))
    }

    fn request_input(&self, pin: u32, _mode: PinMode) -> Result<Box<dyn LineHandle>> {
        Err(Error::LineBusy(pin))
    }

    fn request_edges(
        &self,
        pin: u32,
        _edge: Edge,
        _mode: PinMode,
    ) -> Result<(Box<dyn LineHandle>, Box<dyn EventSource>)> {
        Err(Error::LineBusy(pin))
    }
}

/// Poll `predicate` until it holds or a one-second deadline passes.
pub fn wait_for(predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}
