// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware-independent core of the OTA bootloader: the flash programming
//! engine, the dual-copy boot record store, the application selector and the
//! serial command monitor.
//!
//! All hardware access goes through seams the firmware shell implements: the
//! [`embedded_storage`] NOR flash traits for the storage driver and the
//! [`monitor::Transport`] trait for the USB CDC byte stream. The shell also
//! owns everything irreversible, most notably the jump into an application
//! described by a [`select::Handoff`]. That keeps this whole crate runnable
//! under `cargo test` on the host.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod diag;
pub mod flash;
pub mod hash;
pub mod monitor;
pub mod select;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
