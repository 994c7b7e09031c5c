// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bus peripherals over kernel device nodes
//!
//! Each bus follows the same lifecycle: construct with a device path (or a
//! transport factory in tests), `begin()` to open the kernel device, use,
//! `end()` to release it. Operations before `begin()` fail with
//! [`Error::NotInitialized`](crate::error::Error::NotInitialized) instead of
//! touching hardware.

pub mod i2c;
pub mod serial;
pub mod spi;
