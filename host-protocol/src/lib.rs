// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire protocol and persisted layouts shared by the bootloader and the host
//! flasher tool. The host is the update tool on the PC side, the target is
//! the bootloader running on the i.MX RT MCU.
//!
//! Everything here is little-endian, fixed-size and `core`-only so the same
//! codecs run on both sides of the serial link.

#![no_std]

use crc::{Crc, CRC_32_ISO_HDLC};


/// Flash page size in bytes, the unit of one program operation.
pub const PAGE_SIZE: usize = 256;

/// Flash sector size in bytes, the unit of one erase operation.
pub const SECTOR_SIZE: usize = 4096;

/// Base of the memory-mapped flash address space.
pub const FLASH_BASE: u32 = 0x6000_0000;

/// First address past the end of the flash address space.
pub const FLASH_END: u32 = 0x6080_0000;

/// Lowest address the host is allowed to program. Everything below it is
/// reserved for the bootloader and the boot record sectors.
pub const WRITABLE_START: u32 = 0x6001_0000;

/// First address past the region where application images may be installed.
pub const APP_REGION_END: u32 = 0x6020_0000;

/// Flash address of the main boot record copy. The record owns the full
/// erase sector even though it is far smaller.
pub const BOOT_RECORD_ADDRESS: u32 = 0x6000_F000;

/// Flash address of the backup boot record copy.
pub const BOOT_BACKUP_RECORD_ADDRESS: u32 = 0x6000_E000;

/// Magic identifier distinguishing a programmed boot record from erased or
/// garbage flash.
pub const BOOT_RECORD_ID: [u8; 16] = *b"i.MXRT10XX_boot\0";

/// Smallest application image a record may describe (64 KiB).
pub const MIN_APP_SIZE: u32 = 0x1_0000;

/// Largest application image a record may describe (2 MiB).
pub const MAX_APP_SIZE: u32 = 0x20_0000;

/// Offset of the application vector table within its image.
pub const APP_VECTOR_OFFSET: u32 = 0x2000;

/// Payload size of one READ_FLASH/WRITE_FLASH transfer, one erase sector.
pub const DATA_BLOCK_SIZE: usize = 4096;

/// Capacity of a frame payload buffer: one flash block plus slack for
/// responses that are not block shaped (info string, application records).
pub const DATA_CAPACITY: usize = DATA_BLOCK_SIZE + 256;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 with seed 0 over `data`, as used by the frame header, frame
/// payloads and the persisted boot record.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Binary command opcodes.
///
/// The wire word carries the opcode in its low half; the upper half is
/// reserved for per-command flag bits (see [`SlotSelect`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Opcode {
    /// Return the bootloader info string.
    GetVersion = 0xD001,
    /// Read one [`DATA_BLOCK_SIZE`] block of flash.
    ReadFlash = 0xD102,
    /// Two-phase write of up to one block of flash.
    WriteFlash = 0xD103,
    /// Return the application records selected by the slot flag bits.
    AppRecordRead = 0xD204,
    /// Two-phase install of an application record into the selected slot.
    AppRecordWrite = 0xD205,
    /// Compute the SHA-256 over an arbitrary flash range.
    AppGetHash = 0xD206,
}

const SLOT0_FLAG: u32 = 0x0001_0000;
const SLOT1_FLAG: u32 = 0x0002_0000;

/// Slot request flags carried in the upper half of an application record
/// command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotSelect {
    pub slot0: bool,
    pub slot1: bool,
}

impl SlotSelect {
    pub const fn both() -> Self {
        Self { slot0: true, slot1: true }
    }

    fn from_word(word: u32) -> Self {
        Self {
            slot0: word & SLOT0_FLAG != 0,
            slot1: word & SLOT1_FLAG != 0,
        }
    }

    fn to_word(self) -> u32 {
        let mut word = 0;
        if self.slot0 {
            word |= SLOT0_FLAG;
        }
        if self.slot1 {
            word |= SLOT1_FLAG;
        }
        word
    }
}

/// A decoded command word: opcode plus slot flag bits, extracted once at the
/// frame boundary and never re-derived by masking deeper in the logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub opcode: Opcode,
    pub slots: SlotSelect,
}

impl Command {
    /// Decode a request word. The low 16 bits select the opcode.
    pub fn decode(word: u32) -> Option<Self> {
        let opcode = match word as u16 {
            0xD001 => Opcode::GetVersion,
            0xD102 => Opcode::ReadFlash,
            0xD103 => Opcode::WriteFlash,
            0xD204 => Opcode::AppRecordRead,
            0xD205 => Opcode::AppRecordWrite,
            0xD206 => Opcode::AppGetHash,
            _ => return None,
        };
        Some(Self {
            opcode,
            slots: SlotSelect::from_word(word),
        })
    }

    pub fn encode(self) -> u32 {
        self.opcode as u32 | self.slots.to_word()
    }
}

impl From<Opcode> for Command {
    fn from(opcode: Opcode) -> Self {
        Self {
            opcode,
            slots: SlotSelect::default(),
        }
    }
}

/// Result codes returned in the `cmd` word of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Status {
    Ok = 0x0000_0000,
    /// Request header failed its CRC check.
    FrameCrc = 0x0000_E101,
    /// The flash driver rejected a program operation.
    FlashWrite = 0x0000_E102,
    UnknownCommand = 0x0000_E103,
    /// Address outside the region the command may touch.
    Address = 0x0000_E104,
    /// Request length invalid for the command.
    Length = 0x0000_E105,
    /// Second-phase payload not fully received before the timeout.
    DataReceive = 0x0000_E106,
    /// Second-phase payload failed its CRC check.
    DataCrc = 0x0000_E107,
    AppRecordRead = 0x0000_E108,
    /// Live image hash does not match the hash the record claims.
    HashMismatch = 0x0000_E109,
    BootRecordRead = 0x0000_E10A,
    /// Main boot record copy could not be written.
    BootRecordWrite = 0x0000_E10B,
    /// Backup boot record copy could not be written.
    BackupRecordWrite = 0x0000_E10C,
    /// Flash readback after a write did not match the payload.
    FlashVerify = 0x0000_E10D,
    /// A sector still held data after its erase cycle.
    FlashErase = 0x0000_E10E,
}

impl Status {
    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            0x0000_0000 => Self::Ok,
            0x0000_E101 => Self::FrameCrc,
            0x0000_E102 => Self::FlashWrite,
            0x0000_E103 => Self::UnknownCommand,
            0x0000_E104 => Self::Address,
            0x0000_E105 => Self::Length,
            0x0000_E106 => Self::DataReceive,
            0x0000_E107 => Self::DataCrc,
            0x0000_E108 => Self::AppRecordRead,
            0x0000_E109 => Self::HashMismatch,
            0x0000_E10A => Self::BootRecordRead,
            0x0000_E10B => Self::BootRecordWrite,
            0x0000_E10C => Self::BackupRecordWrite,
            0x0000_E10D => Self::FlashVerify,
            0x0000_E10E => Self::FlashErase,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::FrameCrc => "Command CRC error",
            Self::FlashWrite => "Flash write error",
            Self::UnknownCommand => "Unknown command",
            Self::Address => "Wrong address received",
            Self::Length => "Wrong length received",
            Self::DataReceive => "Data receive error",
            Self::DataCrc => "Data CRC error",
            Self::AppRecordRead => "Error reading app record",
            Self::HashMismatch => "Firmware SHA error",
            Self::BootRecordRead => "Boot record read error",
            Self::BootRecordWrite => "Main boot record write error",
            Self::BackupRecordWrite => "Backup boot record write error",
            Self::FlashVerify => "Flash data verify error",
            Self::FlashErase => "Flash erase error",
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Header CRC does not match the header contents.
    Crc,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Crc => f.write_str("frame header CRC mismatch"),
        }
    }
}

/// Fixed-size frame header exchanged in binary mode.
///
/// On the wire: five little-endian `u32` words `{cmd, param, data_len,
/// data_crc, crc}`. `crc` covers only the 16 bytes before it, so a receiver
/// authenticates the header before trusting `cmd` or `data_len`.
///
/// Responses echo the result code in `cmd`. When an error response carries
/// no payload, `data_crc` is reused as a 32-bit detail word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub cmd: u32,
    pub param: u32,
    pub data_len: u32,
    pub data_crc: u32,
}

impl Header {
    /// Encoded size including the trailing CRC word.
    pub const SIZE: usize = 20;

    /// Bytes covered by the header CRC.
    const CRC_COVERAGE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&self.param.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_crc.to_le_bytes());
        let crc = crc32(&buf[..Self::CRC_COVERAGE]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8; Self::SIZE]) -> Result<Self, FrameError> {
        let crc = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if crc != crc32(&buf[..Self::CRC_COVERAGE]) {
            return Err(FrameError::Crc);
        }
        Ok(Self {
            cmd: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            param: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_crc: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Persisted record decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError {
    /// Buffer shorter than the record layout.
    Length,
    /// Magic identifier missing, the sector holds erased or foreign data.
    Id,
    /// Record CRC does not match its contents.
    Crc,
}

impl core::fmt::Display for RecordError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Length => f.write_str("record buffer too short"),
            Self::Id => f.write_str("boot record id mismatch"),
            Self::Crc => f.write_str("boot record CRC mismatch"),
        }
    }
}

const APP_FLAG_ACTIVE: u32 = 0x0100_0000;
const APP_SIZE_MASK: u32 = 0x00FF_FFFF;

/// One application slot descriptor, 60 bytes in flash and on the wire.
///
/// The stored size word packs flag bits into its high byte; they are decoded
/// into [`AppRecord::active`] here at the codec boundary and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppRecord {
    /// NUL-padded application name, informational only.
    pub name: [u8; 16],
    /// Absolute flash address of the image.
    pub address: u32,
    /// Image length in bytes (the low 24 bits of the stored word).
    pub size: u32,
    /// Prefer this slot at boot.
    pub active: bool,
    /// Creation time in seconds since the Unix epoch, informational.
    pub timestamp: u32,
    /// SHA-256 over `size` bytes at `address`.
    pub sha256: [u8; 32],
}

impl AppRecord {
    pub const SIZE: usize = 60;

    /// An unconfigured slot, as written by boot record initialization.
    pub const fn empty() -> Self {
        Self {
            name: [0; 16],
            address: 0,
            size: 0,
            active: false,
            timestamp: 0,
            sha256: [0; 32],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < Self::SIZE {
            return Err(RecordError::Length);
        }
        let mut name = [0u8; 16];
        name.copy_from_slice(&buf[0..16]);
        let size_word = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&buf[28..60]);
        Ok(Self {
            name,
            address: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            size: size_word & APP_SIZE_MASK,
            active: size_word & APP_FLAG_ACTIVE != 0,
            timestamp: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            sha256,
        })
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..16].copy_from_slice(&self.name);
        buf[16..20].copy_from_slice(&self.address.to_le_bytes());
        let mut size_word = self.size & APP_SIZE_MASK;
        if self.active {
            size_word |= APP_FLAG_ACTIVE;
        }
        buf[20..24].copy_from_slice(&size_word.to_le_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..60].copy_from_slice(&self.sha256);
        buf
    }

    /// Size falls within the configured application bounds.
    pub fn is_plausible(&self) -> bool {
        (MIN_APP_SIZE..=MAX_APP_SIZE).contains(&self.size)
    }

    /// Slot has an address and a size set.
    pub fn is_configured(&self) -> bool {
        self.address != 0 && self.size != 0
    }

    /// Name up to the first NUL, for display.
    pub fn display_name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// The persistent root object: magic id, two application slots, CRC-32 over
/// everything before it. 140 bytes in flash, stored twice (main and backup).
///
/// The id is implicit: [`BootRecord::parse`] rejects anything but
/// [`BOOT_RECORD_ID`] and [`BootRecord::serialize`] always writes it, so a
/// decoded record carries only the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootRecord {
    pub apps: [AppRecord; 2],
}

impl BootRecord {
    pub const SIZE: usize = 140;

    const CRC_COVERAGE: usize = 136;

    /// Fresh record: magic id, two unconfigured slots.
    pub const fn new() -> Self {
        Self {
            apps: [AppRecord::empty(); 2],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < Self::SIZE {
            return Err(RecordError::Length);
        }
        if buf[0..16] != BOOT_RECORD_ID {
            return Err(RecordError::Id);
        }
        let crc = u32::from_le_bytes([buf[136], buf[137], buf[138], buf[139]]);
        if crc != crc32(&buf[..Self::CRC_COVERAGE]) {
            return Err(RecordError::Crc);
        }
        Ok(Self {
            apps: [
                AppRecord::parse(&buf[16..76])?,
                AppRecord::parse(&buf[76..136])?,
            ],
        })
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..16].copy_from_slice(&BOOT_RECORD_ID);
        buf[16..76].copy_from_slice(&self.apps[0].serialize());
        buf[76..136].copy_from_slice(&self.apps[1].serialize());
        let crc = crc32(&buf[..Self::CRC_COVERAGE]);
        buf[136..140].copy_from_slice(&crc.to_le_bytes());
        buf
    }
}

impl Default for BootRecord {
    fn default() -> Self {
        Self::new()
    }
}
