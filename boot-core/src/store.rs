// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dual-copy boot record store.
//!
//! Two flash sectors hold the boot record, main and backup. Every boot (and
//! every record update) runs the repair pass until both copies are valid
//! and byte-identical; that is the only steady state the rest of the
//! bootloader ever observes. Writes are always erase-then-program of a
//! single sector, and the two copies are never written in the same step.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use host_protocol::{
    AppRecord, BootRecord, RecordError, BOOT_BACKUP_RECORD_ADDRESS, BOOT_RECORD_ADDRESS,
    PAGE_SIZE, SECTOR_SIZE,
};

use crate::diag::BootLog;
use crate::flash::{Flash, FlashError};

/// Which persisted copy of the boot record to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordCopy {
    Main,
    Backup,
}

impl RecordCopy {
    pub fn address(self) -> u32 {
        match self {
            Self::Main => BOOT_RECORD_ADDRESS,
            Self::Backup => BOOT_BACKUP_RECORD_ADDRESS,
        }
    }
}

/// Validation state of the two persisted copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreState {
    Unknown,
    /// Main is valid, backup is missing, corrupted or different.
    MainValid,
    /// Backup is valid, main is missing or corrupted.
    BackupValid,
    /// Both copies valid and byte-identical, the only acceptable steady
    /// state.
    BothValid,
    BothInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    Record(RecordError),
    Flash(FlashError),
}

impl From<RecordError> for StoreError {
    fn from(e: RecordError) -> Self {
        Self::Record(e)
    }
}

impl From<FlashError> for StoreError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Record(e) => write!(f, "{e}"),
            Self::Flash(e) => write!(f, "{e}"),
        }
    }
}

/// Failures of the application record update path, one per protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateError {
    /// The main record could not be read back before the update.
    Read,
    /// The backup copy could not be written.
    BackupWrite,
    /// The main copy could not be written.
    MainWrite,
}

/// Owner of the in-memory working copy of the boot record and the only
/// mutation path to its two flash copies.
pub struct BootStore {
    record: BootRecord,
}

impl BootStore {
    pub const fn new() -> Self {
        Self {
            record: BootRecord::new(),
        }
    }

    pub fn record(&self) -> &BootRecord {
        &self.record
    }

    /// Working copy access. Changes are not persisted until a write.
    pub fn record_mut(&mut self) -> &mut BootRecord {
        &mut self.record
    }

    /// Read one copy from flash, validate it and make it the working copy.
    pub fn check<F: ReadNorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        copy: RecordCopy,
    ) -> Result<(), StoreError> {
        let (_, record) = Self::read_valid(flash, copy)?;
        self.record = record;
        Ok(())
    }

    /// Erase-then-program the working copy into one record sector, padded
    /// to a full page with the erased-byte value.
    pub fn write<F: NorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        copy: RecordCopy,
    ) -> Result<(), StoreError> {
        let mut page = [0xFFu8; PAGE_SIZE];
        page[..BootRecord::SIZE].copy_from_slice(&self.record.serialize());
        flash.erase(copy.address(), SECTOR_SIZE as u32)?;
        flash.program_page(copy.address(), &page)?;
        Ok(())
    }

    fn read_valid<F: ReadNorFlash>(
        flash: &mut Flash<F>,
        copy: RecordCopy,
    ) -> Result<([u8; BootRecord::SIZE], BootRecord), StoreError> {
        let mut raw = [0u8; BootRecord::SIZE];
        flash.read(copy.address(), &mut raw)?;
        let record = BootRecord::parse(&raw)?;
        Ok((raw, record))
    }

    /// Classify the two persisted copies, leaving the working copy on the
    /// best available record.
    fn scan<F: ReadNorFlash>(&mut self, flash: &mut Flash<F>, log: &mut BootLog) -> StoreState {
        match Self::read_valid(flash, RecordCopy::Main) {
            Ok((main_raw, main)) => {
                self.record = main;
                match Self::read_valid(flash, RecordCopy::Backup) {
                    Ok((backup_raw, _)) if backup_raw == main_raw => StoreState::BothValid,
                    Ok(_) => {
                        log.line(format_args!("Backup boot rec differs"));
                        StoreState::MainValid
                    }
                    Err(_) => {
                        log.line(format_args!("No backup boot rec"));
                        StoreState::MainValid
                    }
                }
            }
            Err(_) => {
                log.line(format_args!("No main boot rec"));
                match Self::read_valid(flash, RecordCopy::Backup) {
                    Ok((_, backup)) => {
                        self.record = backup;
                        StoreState::BackupValid
                    }
                    Err(_) => StoreState::BothInvalid,
                }
            }
        }
    }

    /// Run the repair pass until main and backup are both valid and
    /// byte-identical.
    ///
    /// A persistent hardware fault keeps this looping forever: the store is
    /// the last line of recovery and has nowhere left to fail to.
    pub fn ensure_valid<F: NorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        log: &mut BootLog,
    ) -> StoreState {
        loop {
            match self.scan(flash, log) {
                StoreState::BothValid => return StoreState::BothValid,
                StoreState::MainValid => {
                    log.line(format_args!("main->backup"));
                    let _ = self.write(flash, RecordCopy::Backup);
                }
                StoreState::BackupValid => {
                    log.line(format_args!("backup->main"));
                    let _ = self.write(flash, RecordCopy::Main);
                }
                StoreState::BothInvalid | StoreState::Unknown => {
                    log.line(format_args!("Boot records init"));
                    self.record = BootRecord::new();
                    let _ = self.write(flash, RecordCopy::Main);
                    let _ = self.write(flash, RecordCopy::Backup);
                }
            }
        }
    }

    /// Install `record` into `slot`: re-read the main copy, back it up, and
    /// only then rewrite main with the slot replaced. Backup always goes
    /// first so a power cut between the two writes leaves one intact copy.
    pub fn update_app<F: NorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        slot: usize,
        record: AppRecord,
    ) -> Result<(), UpdateError> {
        self.check(flash, RecordCopy::Main)
            .map_err(|_| UpdateError::Read)?;
        self.write(flash, RecordCopy::Backup)
            .map_err(|_| UpdateError::BackupWrite)?;
        self.record.apps[slot] = record;
        self.write(flash, RecordCopy::Main)
            .map_err(|_| UpdateError::MainWrite)?;
        Ok(())
    }
}

impl Default for BootStore {
    fn default() -> Self {
        Self::new()
    }
}
