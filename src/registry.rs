// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide pin table with per-pin locking
//!
//! The registry map is only locked long enough to fetch or insert a slot;
//! all pin state lives behind each slot's own mutex so unrelated pins never
//! contend.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::interrupt::InterruptBinding;
use crate::platform::LineHandle;
use crate::pwm::PwmChannel;
use crate::types::{Level, PinMode};

/// Mutable state of one pin
pub(crate) struct PinState {
    pub mode: PinMode,
    pub last_level: Level,
    /// Kernel line request held while the pin is configured
    pub line: Option<Arc<dyn LineHandle>>,
    /// At most one software PWM channel per pin
    pub pwm: Option<PwmChannel>,
    /// At most one interrupt binding per pin
    pub irq: Option<InterruptBinding>,
}

impl Default for PinState {
    fn default() -> Self {
        PinState {
            mode: PinMode::Unset,
            last_level: Level::Low,
            line: None,
            pwm: None,
            irq: None,
        }
    }
}

/// One independently lockable registry entry
pub(crate) struct PinSlot {
    pub state: Mutex<PinState>,
}

pub(crate) struct PinRegistry {
    slots: Mutex<AHashMap<u32, Arc<PinSlot>>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        PinRegistry {
            slots: Mutex::new(AHashMap::new()),
        }
    }

    /// Fetch the slot for `pin`, registering it lazily on first reference.
    pub fn slot(&self, pin: u32) -> Arc<PinSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(pin).or_insert_with(|| {
            Arc::new(PinSlot {
                state: Mutex::new(PinState::default()),
            })
        }))
    }

    /// Current mode of `pin` without registering it.
    ///
    /// The map lock is released before the slot lock is taken; a pin whose
    /// slot is busy (a write in flight) must not stall lookups of other
    /// pins behind the map lock.
    pub fn mode_of(&self, pin: u32) -> PinMode {
        let slot = {
            let slots = self.slots.lock();
            slots.get(&pin).map(Arc::clone)
        };
        slot.map(|slot| slot.state.lock().mode)
            .unwrap_or(PinMode::Unset)
    }

    /// Pins currently holding any slot (registered at least once).
    #[cfg(test)]
    pub fn registered(&self) -> Vec<u32> {
        let slots = self.slots.lock();
        let mut pins: Vec<u32> = slots.keys().copied().collect();
        pins.sort_unstable();
        pins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_registration() {
        let registry = PinRegistry::new();
        assert_eq!(registry.mode_of(17), PinMode::Unset);
        assert!(registry.registered().is_empty());

        let slot = registry.slot(17);
        slot.state.lock().mode = PinMode::Output;
        assert_eq!(registry.mode_of(17), PinMode::Output);
        assert_eq!(registry.registered(), vec![17]);
    }

    #[test]
    fn test_slot_identity() {
        let registry = PinRegistry::new();
        let a = registry.slot(4);
        let b = registry.slot(4);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_mode_of_does_not_hold_map_lock_across_slot_lock() {
        use std::time::{Duration, Instant};

        let registry = std::sync::Arc::new(PinRegistry::new());
        let busy = registry.slot(4);
        registry.slot(20);

        // Hold pin 4's slot lock, as a write in flight would.
        let guard = busy.state.lock();

        // mode_of(4) must block on the slot lock only, leaving the map free.
        let prober = {
            let registry = std::sync::Arc::clone(&registry);
            std::thread::spawn(move || registry.mode_of(4))
        };
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(registry.mode_of(20), PinMode::Unset);
        registry.slot(21);
        assert!(start.elapsed() < Duration::from_millis(100));

        drop(guard);
        assert_eq!(prober.join().unwrap(), PinMode::Unset);
    }

    #[test]
    fn test_default_state() {
        let state = PinState::default();
        assert_eq!(state.mode, PinMode::Unset);
        assert_eq!(state.last_level, Level::Low);
        assert!(state.line.is_none());
        assert!(state.pwm.is_none());
        assert!(state.irq.is_none());
    }
}
