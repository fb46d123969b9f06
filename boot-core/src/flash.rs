// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash programming engine: sector erase, page program and readback
//! verification over the linear flash address space.
//!
//! Every write path checks the destination first and becomes a no-op when
//! flash already holds the requested bytes, so a retried update command
//! costs no erase cycles.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use host_protocol::{BOOT_BACKUP_RECORD_ADDRESS, FLASH_BASE, PAGE_SIZE, SECTOR_SIZE};

/// Flash programming errors. [`FlashError::code`] is the numeric status
/// carried in error responses to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address not aligned for the requested operation.
    AddressAlign,
    /// Address below the start of the erasable region.
    AddressMin,
    /// Range extends past the end of the device.
    AddressMax,
    /// Length invalid for the requested operation.
    Length,
    /// Sector still holds data after its erase cycle; carries the index of
    /// the first unerased byte within the sector.
    Erase { first_unerased: u32 },
    /// The driver rejected a page program.
    ProgramPage,
    /// The driver rejected a buffer program.
    ProgramBuffer,
    /// The driver rejected a read.
    Read,
}

impl FlashError {
    pub fn code(&self) -> u32 {
        match self {
            Self::AddressAlign => 99,
            Self::AddressMin => 98,
            Self::AddressMax => 97,
            Self::Erase { .. } => 96,
            Self::ProgramPage => 95,
            Self::ProgramBuffer => 94,
            Self::Length => 93,
            Self::Read => 92,
        }
    }
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AddressAlign => f.write_str("address not aligned"),
            Self::AddressMin => f.write_str("address below erasable region"),
            Self::AddressMax => f.write_str("range past end of device"),
            Self::Length => f.write_str("invalid length"),
            Self::Erase { first_unerased } => {
                write!(f, "sector not erased (first unerased byte {first_unerased})")
            }
            Self::ProgramPage => f.write_str("page program failed"),
            Self::ProgramBuffer => f.write_str("buffer program failed"),
            Self::Read => f.write_str("read failed"),
        }
    }
}

/// Absolute-address facade over the NOR flash driver.
///
/// The driver addresses flash from offset zero; everything here takes
/// absolute bus addresses starting at [`FLASH_BASE`].
pub struct Flash<F> {
    driver: F,
}

impl<F> Flash<F> {
    pub fn new(driver: F) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &F {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut F {
        &mut self.driver
    }
}

impl<F: ReadNorFlash> Flash<F> {
    /// Addressable flash length in bytes.
    pub fn capacity(&self) -> u32 {
        self.driver.capacity() as u32
    }

    /// Buffered read at an absolute address. The driver is responsible for
    /// cache coherence: the returned bytes must be current hardware state.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = address.checked_sub(FLASH_BASE).ok_or(FlashError::Read)?;
        self.driver.read(offset, buf).map_err(|_| FlashError::Read)
    }

    /// Index of the first byte in the sector at `address` that is not in
    /// the erased state, or [`SECTOR_SIZE`] when the sector is blank.
    pub fn first_unerased(&mut self, address: u32) -> Result<u32, FlashError> {
        let mut chunk = [0u8; PAGE_SIZE];
        for page in 0..SECTOR_SIZE / PAGE_SIZE {
            let offset = (page * PAGE_SIZE) as u32;
            self.read(address + offset, &mut chunk)?;
            if let Some(i) = chunk.iter().position(|&b| b != 0xFF) {
                return Ok(offset + i as u32);
            }
        }
        Ok(SECTOR_SIZE as u32)
    }

    /// Index of the first byte at `address` that differs from `data`, or
    /// `data.len()` when flash already matches.
    pub fn mismatch(&mut self, address: u32, data: &[u8]) -> Result<u32, FlashError> {
        let mut chunk = [0u8; PAGE_SIZE];
        let mut done = 0usize;
        while done < data.len() {
            let n = usize::min(PAGE_SIZE, data.len() - done);
            self.read(address + done as u32, &mut chunk[..n])?;
            if let Some(i) = chunk[..n]
                .iter()
                .zip(&data[done..done + n])
                .position(|(a, b)| a != b)
            {
                return Ok((done + i) as u32);
            }
            done += n;
        }
        Ok(data.len() as u32)
    }
}

impl<F: NorFlash> Flash<F> {
    /// Erase the sectors covering `address..address + length`.
    ///
    /// `address` must be sector aligned and at or above the backup boot
    /// record sector; the bootloader code below that is never erasable.
    /// Sectors that are already blank are skipped. A sector that still
    /// holds data after its erase cycle fails the whole call.
    pub fn erase(&mut self, address: u32, length: u32) -> Result<(), FlashError> {
        if address % SECTOR_SIZE as u32 != 0 {
            return Err(FlashError::AddressAlign);
        }
        if address < BOOT_BACKUP_RECORD_ADDRESS {
            return Err(FlashError::AddressMin);
        }
        let end = (address - FLASH_BASE)
            .checked_add(length)
            .ok_or(FlashError::AddressMax)?;
        if end > self.capacity() {
            return Err(FlashError::AddressMax);
        }

        let sectors = length.div_ceil(SECTOR_SIZE as u32);
        let mut sector = address;
        for _ in 0..sectors {
            if self.first_unerased(sector)? < SECTOR_SIZE as u32 {
                let from = sector - FLASH_BASE;
                if self.driver.erase(from, from + SECTOR_SIZE as u32).is_err() {
                    let first_unerased = self.first_unerased(sector).unwrap_or(0);
                    return Err(FlashError::Erase { first_unerased });
                }
                let first_unerased = self.first_unerased(sector)?;
                if first_unerased < SECTOR_SIZE as u32 {
                    return Err(FlashError::Erase { first_unerased });
                }
            }
            sector += SECTOR_SIZE as u32;
        }
        Ok(())
    }

    /// Program exactly one page into previously erased flash.
    ///
    /// A page that already matches `data` is left untouched. No readback is
    /// performed on success; verification happens at the buffer level.
    pub fn program_page(&mut self, address: u32, data: &[u8; PAGE_SIZE]) -> Result<(), FlashError> {
        if address % PAGE_SIZE as u32 != 0 {
            return Err(FlashError::AddressAlign);
        }
        if self.mismatch(address, data)? < PAGE_SIZE as u32 {
            self.driver
                .write(address - FLASH_BASE, data)
                .map_err(|_| FlashError::ProgramPage)?;
        }
        Ok(())
    }

    /// Program `data` at `address`, page by page, within a single sector.
    ///
    /// A destination that already matches is reported as success with no
    /// flash access at all. Writing from a sector boundary erases the
    /// sector first; writing into the middle of a sector assumes the caller
    /// erased it beforehand. A trailing partial page is padded with `0xFF`,
    /// which leaves the erased bytes past the data untouched.
    pub fn program_buffer(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let sector_offset = address % SECTOR_SIZE as u32;
        if sector_offset as usize + data.len() > SECTOR_SIZE {
            return Err(FlashError::Length);
        }
        if address % PAGE_SIZE as u32 != 0 {
            return Err(FlashError::AddressAlign);
        }
        if data.is_empty() || self.mismatch(address, data)? == data.len() as u32 {
            return Ok(());
        }

        if sector_offset == 0 {
            self.erase(address, SECTOR_SIZE as u32)?;
        }

        let mut page = [0xFFu8; PAGE_SIZE];
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            page.fill(0xFF);
            page[..chunk.len()].copy_from_slice(chunk);
            self.program_page(address + (i * PAGE_SIZE) as u32, &page)
                .map_err(|e| match e {
                    FlashError::ProgramPage => FlashError::ProgramBuffer,
                    other => other,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemFlash;
    use host_protocol::WRITABLE_START;

    const CAP: usize = 0x4_0000;

    fn flash() -> Flash<MemFlash> {
        Flash::new(MemFlash::new(CAP))
    }

    #[test]
    fn erase_rejects_bad_geometry() {
        let mut flash = flash();
        assert_eq!(
            flash.erase(WRITABLE_START + 1, SECTOR_SIZE as u32),
            Err(FlashError::AddressAlign)
        );
        assert_eq!(
            flash.erase(FLASH_BASE, SECTOR_SIZE as u32),
            Err(FlashError::AddressMin)
        );
        assert_eq!(
            flash.erase(FLASH_BASE + CAP as u32, SECTOR_SIZE as u32),
            Err(FlashError::AddressMax)
        );
    }

    #[test]
    fn erase_skips_blank_sectors() {
        let mut flash = flash();
        flash.erase(WRITABLE_START, 3 * SECTOR_SIZE as u32).unwrap();
        assert_eq!(flash.driver().erases, 0);
    }

    #[test]
    fn erase_covers_only_dirty_sectors() {
        let mut flash = flash();
        // Dirty the first and third sector of the range.
        flash.driver_mut().fill(0x1_0000, &[0x12]);
        flash.driver_mut().fill(0x1_2000, &[0x34, 0x56]);

        flash.erase(WRITABLE_START, 3 * SECTOR_SIZE as u32).unwrap();
        assert_eq!(flash.driver().erases, 2);
        assert_eq!(flash.first_unerased(WRITABLE_START).unwrap(), SECTOR_SIZE as u32);
        assert_eq!(
            flash.first_unerased(WRITABLE_START + 2 * SECTOR_SIZE as u32).unwrap(),
            SECTOR_SIZE as u32
        );
    }

    #[test]
    fn erase_handles_partial_trailing_sector() {
        let mut flash = flash();
        flash.driver_mut().fill(0x1_1000, &[0xAA]);
        // One byte past a sector boundary still erases the covering sector.
        flash.erase(WRITABLE_START, SECTOR_SIZE as u32 + 1).unwrap();
        assert_eq!(flash.driver().erases, 1);
    }

    #[test]
    fn program_page_skips_identical_data() {
        let mut flash = flash();
        let page = [0x42u8; PAGE_SIZE];
        flash.program_page(WRITABLE_START, &page).unwrap();
        assert_eq!(flash.driver().writes, 1);

        flash.program_page(WRITABLE_START, &page).unwrap();
        assert_eq!(flash.driver().writes, 1);
    }

    #[test]
    fn program_buffer_rejects_sector_crossing() {
        let mut flash = flash();
        let data = [0u8; 512];
        assert_eq!(
            flash.program_buffer(WRITABLE_START + SECTOR_SIZE as u32 - 256, &data),
            Err(FlashError::Length)
        );
        assert_eq!(
            flash.program_buffer(WRITABLE_START + 3, &data[..32]),
            Err(FlashError::AddressAlign)
        );
    }

    #[test]
    fn program_buffer_is_idempotent() {
        let mut flash = flash();
        let mut data = [0u8; SECTOR_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        flash.program_buffer(WRITABLE_START, &data).unwrap();
        let ops = flash.driver().ops();
        assert!(ops > 0);

        // The second identical write never reaches the driver.
        flash.program_buffer(WRITABLE_START, &data).unwrap();
        assert_eq!(flash.driver().ops(), ops);

        let mut readback = [0u8; SECTOR_SIZE];
        flash.read(WRITABLE_START, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn program_buffer_erases_dirty_sector_at_boundary() {
        let mut flash = flash();
        flash.driver_mut().fill(0x1_0000, &[0x00; 16]);

        let data = [0xA5u8; 1024];
        flash.program_buffer(WRITABLE_START, &data).unwrap();
        assert_eq!(flash.driver().erases, 1);

        let mut readback = [0u8; 1024];
        flash.read(WRITABLE_START, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn program_buffer_pads_trailing_partial_page() {
        let mut flash = flash();
        let data = [0x33u8; 300];
        flash.program_buffer(WRITABLE_START, &data).unwrap();

        let mut readback = [0u8; 2 * PAGE_SIZE];
        flash.read(WRITABLE_START, &mut readback).unwrap();
        assert_eq!(&readback[..300], &data[..]);
        // Bytes past the data stay erased.
        assert!(readback[300..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn mismatch_reports_first_differing_byte() {
        let mut flash = flash();
        let data = [0x77u8; 600];
        flash.program_buffer(WRITABLE_START, &data).unwrap();

        let mut probe = [0x77u8; 600];
        probe[311] = 0x78;
        assert_eq!(flash.mismatch(WRITABLE_START, &probe).unwrap(), 311);
        assert_eq!(flash.mismatch(WRITABLE_START, &data).unwrap(), 600);
    }
}
