// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Application selection at boot.

use embedded_storage::nor_flash::ReadNorFlash;
use host_protocol::{AppRecord, APP_VECTOR_OFFSET};

use crate::diag::BootLog;
use crate::flash::Flash;
use crate::hash::sha256_flash;
use crate::store::BootStore;

/// Result of application selection.
///
/// The core never performs the jump itself. On [`SelectorOutcome::Handoff`]
/// the firmware shell must disable interrupts, retarget the vector table to
/// [`Handoff::vector_table`], load [`Handoff::stack_pointer`] into MSP and
/// branch to [`Handoff::entry`], re-enabling interrupts only once control
/// is inside the application's own initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelectorOutcome {
    /// Transfer control to a verified application.
    Handoff(Handoff),
    /// No startable application, fall through to the command monitor.
    Continue,
}

/// Addresses for the irreversible jump into an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handoff {
    /// New vector table base, image address plus [`APP_VECTOR_OFFSET`].
    pub vector_table: u32,
    /// Initial stack pointer, the first vector word.
    pub stack_pointer: u32,
    /// Application entry point, the reset vector word.
    pub entry: u32,
}

/// Pick the application to boot.
///
/// Slots marked active are tried first (slot 0, then slot 1), then any slot
/// whose size is merely plausible, active or not. Every candidate must pass
/// a live hash check over its image; a failure logs a diagnostic and the
/// next candidate is tried. Nothing here is a hard fault.
pub fn select_application<F: ReadNorFlash>(
    store: &BootStore,
    flash: &mut Flash<F>,
    log: &mut BootLog,
) -> SelectorOutcome {
    let apps = store.record().apps;

    for (i, app) in apps.iter().enumerate() {
        if app.active {
            if let Some(handoff) = try_start(app, flash, log) {
                return SelectorOutcome::Handoff(handoff);
            }
            log.line(format_args!("Active app{i} not started"));
        }
    }

    // No active slot started; fall back to anything with a sane size.
    for (i, app) in apps.iter().enumerate() {
        if app.is_plausible() {
            if let Some(handoff) = try_start(app, flash, log) {
                return SelectorOutcome::Handoff(handoff);
            }
            log.line(format_args!("App{i} not started"));
        } else {
            log.line(format_args!("App{i} not configured"));
        }
    }

    SelectorOutcome::Continue
}

fn try_start<F: ReadNorFlash>(
    app: &AppRecord,
    flash: &mut Flash<F>,
    log: &mut BootLog,
) -> Option<Handoff> {
    if !app.is_plausible() {
        log.line(format_args!("Start app: wrong size"));
        return None;
    }
    if sha256_flash(flash, app.address, app.size) != app.sha256 {
        log.line(format_args!("Start app: wrong hash"));
        return None;
    }

    let vector_table = app.address + APP_VECTOR_OFFSET;
    let mut vectors = [0u8; 8];
    flash.read(vector_table, &mut vectors).ok()?;
    Some(Handoff {
        vector_table,
        stack_pointer: u32::from_le_bytes([vectors[0], vectors[1], vectors[2], vectors[3]]),
        entry: u32::from_le_bytes([vectors[4], vectors[5], vectors[6], vectors[7]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{install_image, MemFlash};
    use host_protocol::MIN_APP_SIZE;

    const CAP: usize = 0x4_0000;
    const APP0: u32 = 0x6001_0000;
    const APP1: u32 = 0x6002_0000;

    fn setup() -> (Flash<MemFlash>, BootStore, BootLog) {
        (
            Flash::new(MemFlash::new(CAP)),
            BootStore::new(),
            BootLog::new(),
        )
    }

    fn store_with(apps: [AppRecord; 2]) -> BootStore {
        let mut store = BootStore::new();
        store.record_mut().apps = apps;
        store
    }

    #[test]
    fn nothing_configured_continues() {
        let (mut flash, store, mut log) = setup();
        assert_eq!(
            select_application(&store, &mut flash, &mut log),
            SelectorOutcome::Continue
        );
        assert!(log.as_str().contains("App0 not configured"));
    }

    #[test]
    fn active_trusted_slot_hands_off() {
        let (mut flash, _, mut log) = setup();
        let mut app = install_image(&mut flash, APP0, MIN_APP_SIZE, 0x11);
        app.active = true;
        let store = store_with([app, AppRecord::empty()]);

        let outcome = select_application(&store, &mut flash, &mut log);
        let SelectorOutcome::Handoff(handoff) = outcome else {
            panic!("expected handoff");
        };
        assert_eq!(handoff.vector_table, APP0 + APP_VECTOR_OFFSET);
        // Vector words come from the image itself.
        assert_eq!(handoff.stack_pointer, u32::from_le_bytes([0x11; 4]));
        assert_eq!(handoff.entry, u32::from_le_bytes([0x11; 4]));
    }

    #[test]
    fn active_slot_one_beats_inactive_slot_zero() {
        let (mut flash, _, mut log) = setup();
        let app0 = install_image(&mut flash, APP0, MIN_APP_SIZE, 0x22);
        let mut app1 = install_image(&mut flash, APP1, MIN_APP_SIZE, 0x33);
        app1.active = true;
        let store = store_with([app0, app1]);

        let outcome = select_application(&store, &mut flash, &mut log);
        let SelectorOutcome::Handoff(handoff) = outcome else {
            panic!("expected handoff");
        };
        assert_eq!(handoff.vector_table, APP1 + APP_VECTOR_OFFSET);
    }

    // The fallback chain: the active slot fails its hash check, then the
    // inactive-but-plausible slot boots on the plausibility rule.
    #[test]
    fn corrupt_active_slot_falls_back_to_plausible_slot() {
        let (mut flash, _, mut log) = setup();
        let app0 = install_image(&mut flash, APP0, MIN_APP_SIZE, 0x44);
        let mut app1 = install_image(&mut flash, APP1, MIN_APP_SIZE, 0x55);
        app1.active = true;
        app1.sha256[0] ^= 0xFF;
        let store = store_with([app0, app1]);

        let outcome = select_application(&store, &mut flash, &mut log);
        let SelectorOutcome::Handoff(handoff) = outcome else {
            panic!("expected handoff");
        };
        assert_eq!(handoff.vector_table, APP0 + APP_VECTOR_OFFSET);
        assert!(log.as_str().contains("Start app: wrong hash"));
        assert!(log.as_str().contains("Active app1 not started"));
    }

    // The boot sequence end to end: repair the store, fall through to the
    // monitor on blank flash, hand off once an image is installed.
    #[test]
    fn boot_flow_from_blank_flash_to_handoff() {
        let (mut flash, mut store, mut log) = setup();
        store.ensure_valid(&mut flash, &mut log);
        assert_eq!(
            select_application(&store, &mut flash, &mut log),
            SelectorOutcome::Continue
        );

        let mut app = install_image(&mut flash, APP0, MIN_APP_SIZE, 0x7E);
        app.active = true;
        store.update_app(&mut flash, 0, app).unwrap();

        store.ensure_valid(&mut flash, &mut log);
        let outcome = select_application(&store, &mut flash, &mut log);
        assert!(matches!(outcome, SelectorOutcome::Handoff(_)));
    }

    #[test]
    fn implausible_size_never_hashes() {
        let (mut flash, _, mut log) = setup();
        let mut app = install_image(&mut flash, APP0, MIN_APP_SIZE, 0x66);
        app.active = true;
        app.size = MIN_APP_SIZE - 1;
        let store = store_with([app, AppRecord::empty()]);

        assert_eq!(
            select_application(&store, &mut flash, &mut log),
            SelectorOutcome::Continue
        );
        assert!(log.as_str().contains("Start app: wrong size"));
    }
}
