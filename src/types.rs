// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared value types for pins, levels and edges

use serde::{Deserialize, Serialize};

/// Digital signal level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// The opposite level (used by digital_toggle and the PWM scheduler)
    pub fn toggled(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }

    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Pin operating mode
///
/// A pin holds at most one mode at a time; changing it invalidates any PWM
/// channel or interrupt binding active on that pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinMode {
    /// Never configured (or explicitly released)
    Unset,
    Output,
    Input,
    InputPullup,
    InputPulldown,
}

impl PinMode {
    /// Whether the mode drives the line
    pub fn is_output(self) -> bool {
        self == PinMode::Output
    }

    /// Whether the mode samples the line (any of the input variants)
    pub fn is_input(self) -> bool {
        matches!(
            self,
            PinMode::Input | PinMode::InputPullup | PinMode::InputPulldown
        )
    }
}

impl Default for PinMode {
    fn default() -> Self {
        PinMode::Unset
    }
}

/// Edge selection for interrupt bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// LOW to HIGH transition
    Rising,
    /// HIGH to LOW transition
    Falling,
    /// Either transition
    Change,
}

/// A single edge event reported by the kernel event source.
#[derive(Debug, Clone, Copy)]
pub struct EdgeEvent {
    /// Which transition occurred
    pub edge: EdgeKind,
    /// Kernel timestamp, nanoseconds (monotonic)
    pub timestamp_ns: u64,
    /// Events lost since the previous one, detected from sequence-number
    /// gaps when the kernel's event buffer overflowed
    pub dropped: u32,
}

/// Concrete transition carried by an [`EdgeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

impl Edge {
    /// Whether an observed transition matches this selection
    pub fn matches(self, kind: EdgeKind) -> bool {
        match self {
            Edge::Rising => kind == EdgeKind::Rising,
            Edge::Falling => kind == EdgeKind::Falling,
            Edge::Change => true,
        }
    }
}
