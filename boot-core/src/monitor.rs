// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial command monitor: the framed binary protocol, the line-oriented
//! terminal mode and the state machine switching between them.
//!
//! The monitor is strictly synchronous: wait for the transport, read one
//! header's worth of bytes, dispatch, respond, repeat. Flash work blocks
//! the link for its duration; there is exactly one host on the other end.

use core::fmt;

use chrono::{DateTime, Datelike, Timelike};
use embedded_storage::nor_flash::NorFlash;
use host_protocol::{
    crc32, AppRecord, BootRecord, Command, Header, Opcode, SlotSelect, Status,
    APP_REGION_END, BOOT_RECORD_ADDRESS, BOOT_RECORD_ID, DATA_BLOCK_SIZE, DATA_CAPACITY,
    FLASH_BASE, FLASH_END, WRITABLE_START,
};

use crate::diag::BootLog;
use crate::flash::{Flash, FlashError};
use crate::hash::sha256_flash;
use crate::store::{BootStore, RecordCopy, UpdateError};

/// Bootloader identification returned by GET_VERSION and the terminal `v`
/// command.
pub const INFO_STRING: &str = "[i.MXRT OTA Bootloader v.1.2]";

/// Board identification appended by the terminal `v` command.
pub const BOARD_NAME: &str = "SEEED ARCH-MIX";

/// Read timeout for a command header in binary mode, milliseconds.
const BINARY_TIMEOUT_MS: u32 = 200;

/// Read timeout for a command character in terminal mode, milliseconds.
const TERMINAL_TIMEOUT_MS: u32 = 400;

/// Timeout for the payload phase of WRITE_FLASH, milliseconds.
const WRITE_DATA_TIMEOUT_MS: u32 = 1000;

/// Timeout for the payload phase of APP_RECORD_WRITE, milliseconds.
const RECORD_DATA_TIMEOUT_MS: u32 = 500;

/// Byte-stream transport the monitor runs over, USB CDC on the device.
///
/// `read` blocks until the buffer is full or the timeout expires and
/// returns the number of bytes actually received. Timeout bookkeeping
/// (cycle counter on the device) lives in the implementation.
pub trait Transport {
    fn is_ready(&mut self) -> bool;
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> usize;
    fn write(&mut self, buf: &[u8]) -> usize;
    fn discard_pending(&mut self);
}

/// Command protocol engine and transport mode state machine.
pub struct Monitor<T> {
    transport: T,
    term_mode: bool,
    data: [u8; DATA_CAPACITY],
}

impl<T: Transport> Monitor<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            term_mode: false,
            data: [0; DATA_CAPACITY],
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Service commands forever.
    pub fn run<F: NorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        store: &mut BootStore,
        log: &mut BootLog,
    ) -> ! {
        loop {
            self.poll(flash, store, log);
        }
    }

    /// One iteration of the monitor loop.
    pub fn poll<F: NorFlash>(
        &mut self,
        flash: &mut Flash<F>,
        store: &mut BootStore,
        log: &mut BootLog,
    ) {
        if !self.transport.is_ready() {
            // An idle link always drops back to binary framing.
            self.term_mode = false;
            return;
        }

        let timeout = if self.term_mode {
            TERMINAL_TIMEOUT_MS
        } else {
            BINARY_TIMEOUT_MS
        };
        let mut header = [0u8; Header::SIZE];
        let received = self.transport.read(&mut header, timeout);
        if received == 0 {
            return;
        }

        if self.term_mode {
            self.terminal_command(header[0], flash, store, log);
        } else if received != Header::SIZE {
            // Short reads are how a human on a terminal looks: check for
            // the mode-switch character, drop anything else.
            if header[0] == b't' || header[0] == b'T' {
                self.print(format_args!("\r\n{INFO_STRING}\r\nTerminal mode\r\n> "));
                self.term_mode = true;
            }
        } else {
            match Header::parse(&header) {
                Ok(request) => self.binary_command(request, flash, store),
                Err(_) => self.respond(Status::FrameCrc, 0, 0),
            }
        }
    }

    // ------------------------------------------------------------------
    // Binary mode
    // ------------------------------------------------------------------

    fn binary_command<F: NorFlash>(
        &mut self,
        request: Header,
        flash: &mut Flash<F>,
        store: &mut BootStore,
    ) {
        let Some(command) = Command::decode(request.cmd) else {
            self.respond(Status::UnknownCommand, request.param, 0);
            return;
        };

        match command.opcode {
            Opcode::GetVersion => {
                let info = INFO_STRING.as_bytes();
                self.data[..info.len()].copy_from_slice(info);
                self.respond_data(request.param, info.len());
            }
            Opcode::ReadFlash => self.read_flash(&request, flash),
            Opcode::WriteFlash => {
                let (status, detail) = self.write_flash(&request, flash);
                self.respond(status, request.param, detail);
                self.transport.discard_pending();
            }
            Opcode::AppGetHash => {
                let digest = sha256_flash(flash, request.param, request.data_len);
                self.data[..digest.len()].copy_from_slice(&digest);
                self.respond_data(request.param, digest.len());
            }
            Opcode::AppRecordRead => self.app_record_read(&request, command.slots, store),
            Opcode::AppRecordWrite => {
                let (status, detail) = self.app_record_write(&request, command.slots, flash, store);
                self.respond(status, request.param, detail);
            }
        }
    }

    fn read_flash<F: NorFlash>(&mut self, request: &Header, flash: &mut Flash<F>) {
        if request.data_len as usize != DATA_BLOCK_SIZE {
            self.respond(Status::Length, request.param, 0);
            return;
        }
        let address = request.param;
        let end = address.checked_add(DATA_BLOCK_SIZE as u32);
        if address < FLASH_BASE || end.map_or(true, |end| end > FLASH_END) {
            self.respond(Status::Address, request.param, 0);
            return;
        }
        match flash.read(address, &mut self.data[..DATA_BLOCK_SIZE]) {
            Ok(()) => self.respond_data(request.param, DATA_BLOCK_SIZE),
            Err(e) => self.respond(Status::Address, request.param, e.code()),
        }
    }

    /// Two-phase flash write: validate the request, acknowledge, receive
    /// the block, check its CRC, program and verify by readback.
    fn write_flash<F: NorFlash>(
        &mut self,
        request: &Header,
        flash: &mut Flash<F>,
    ) -> (Status, u32) {
        let data_len = request.data_len as usize;
        if data_len > DATA_BLOCK_SIZE {
            return (Status::Length, 0);
        }
        let address = request.param;
        let end = address.checked_add(request.data_len);
        if address < WRITABLE_START || end.map_or(true, |end| end >= FLASH_END) {
            return (Status::Address, 0);
        }

        // Confirm the command; the host sends the block next.
        self.transport.discard_pending();
        self.respond(Status::Ok, request.param, 0);
        let received = self
            .transport
            .read(&mut self.data[..data_len], WRITE_DATA_TIMEOUT_MS);
        if received != data_len {
            return (Status::DataReceive, (request.data_len << 16) | received as u32);
        }
        if crc32(&self.data[..data_len]) != request.data_crc {
            return (Status::DataCrc, self.first_payload_word(data_len));
        }

        match flash.program_buffer(address, &self.data[..data_len]) {
            Err(FlashError::Erase { first_unerased }) => (Status::FlashErase, first_unerased),
            Err(e) => (Status::FlashWrite, e.code()),
            Ok(()) => match flash.mismatch(address, &self.data[..data_len]) {
                Ok(index) if index == request.data_len => (Status::Ok, 0),
                Ok(index) => (Status::FlashVerify, index),
                Err(e) => (Status::FlashVerify, e.code()),
            },
        }
    }

    fn app_record_read(&mut self, request: &Header, slots: SlotSelect, store: &BootStore) {
        let mut len = 0;
        self.data[..AppRecord::SIZE * 2].fill(0);
        if slots.slot0 {
            self.data[..AppRecord::SIZE].copy_from_slice(&store.record().apps[0].serialize());
            len += AppRecord::SIZE;
        }
        if slots.slot1 {
            self.data[len..len + AppRecord::SIZE]
                .copy_from_slice(&store.record().apps[1].serialize());
            len += AppRecord::SIZE;
        }
        self.respond_data(request.param, len);
    }

    /// Two-phase record install: receive the candidate record, check its
    /// CRC, recompute the image hash it claims, then let the store update
    /// the slot backup-first.
    fn app_record_write<F: NorFlash>(
        &mut self,
        request: &Header,
        slots: SlotSelect,
        flash: &mut Flash<F>,
        store: &mut BootStore,
    ) -> (Status, u32) {
        if request.data_len as usize != AppRecord::SIZE {
            return (Status::Length, 0);
        }
        if !(WRITABLE_START..APP_REGION_END).contains(&request.param) {
            return (Status::Address, 0);
        }

        self.respond(Status::Ok, request.param, 0);
        let received = self
            .transport
            .read(&mut self.data[..AppRecord::SIZE], RECORD_DATA_TIMEOUT_MS);
        if received != AppRecord::SIZE {
            return (Status::DataReceive, (request.data_len << 16) | received as u32);
        }
        if crc32(&self.data[..AppRecord::SIZE]) != request.data_crc {
            return (Status::DataCrc, self.first_payload_word(AppRecord::SIZE));
        }
        let Ok(record) = AppRecord::parse(&self.data[..AppRecord::SIZE]) else {
            return (Status::Length, 0);
        };

        // The record is only as good as the image it points at.
        if sha256_flash(flash, record.address, record.size) != record.sha256 {
            return (Status::HashMismatch, 0);
        }

        let slot = usize::from(slots.slot1);
        match store.update_app(flash, slot, record) {
            Ok(()) => (Status::Ok, 0),
            Err(UpdateError::Read) => (Status::BootRecordRead, 0),
            Err(UpdateError::BackupWrite) => (Status::BackupRecordWrite, 0),
            Err(UpdateError::MainWrite) => (Status::BootRecordWrite, 0),
        }
    }

    fn first_payload_word(&self, len: usize) -> u32 {
        if len >= 4 {
            u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
        } else {
            0
        }
    }

    /// Send a payload-free response; `detail` rides in the `data_crc` word.
    fn respond(&mut self, status: Status, param: u32, detail: u32) {
        let header = Header {
            cmd: status as u32,
            param,
            data_len: 0,
            data_crc: detail,
        };
        self.transport.write(&header.encode());
    }

    /// Send a success response carrying the first `len` payload bytes.
    fn respond_data(&mut self, param: u32, len: usize) {
        let header = Header {
            cmd: Status::Ok as u32,
            param,
            data_len: len as u32,
            data_crc: if len == 0 { 0 } else { crc32(&self.data[..len]) },
        };
        self.transport.write(&header.encode());
        if len > 0 {
            self.transport.write(&self.data[..len]);
        }
    }

    // ------------------------------------------------------------------
    // Terminal mode
    // ------------------------------------------------------------------

    fn terminal_command<F: NorFlash>(
        &mut self,
        cmd: u8,
        flash: &mut Flash<F>,
        store: &mut BootStore,
        log: &BootLog,
    ) {
        match cmd {
            b'v' => self.print(format_args!("{INFO_STRING} on {BOARD_NAME} board\r\n> ")),
            b'V' => {
                let id = nul_trimmed(&BOOT_RECORD_ID);
                self.print(format_args!("Boot record ID: {id}\r\n> "));
            }
            b'L' => {
                self.print(format_args!("Boot log:\r\n"));
                if !log.is_empty() {
                    self.print(format_args!("{}", log.as_str()));
                }
                self.print(format_args!("\r\n> "));
            }
            b'B' => self.show_boot_records(flash, store),
            b't' | b'T' => {
                self.print(format_args!("Binary transfer mode\r\n\r\n"));
                self.term_mode = false;
            }
            c if (0x20..0x80).contains(&c) => {
                self.print(format_args!("Unsupported command ('{}')\r\n> ", c as char));
            }
            c => self.print(format_args!("Unsupported command (0x{c:02X})\r\n> ")),
        }
    }

    /// Pretty-print both application records, re-verifying each image hash
    /// live. An unreadable boot record is dumped as raw hex instead.
    fn show_boot_records<F: NorFlash>(&mut self, flash: &mut Flash<F>, store: &mut BootStore) {
        if store.check(flash, RecordCopy::Main).is_err() {
            let mut raw = [0u8; BootRecord::SIZE];
            let _ = flash.read(BOOT_RECORD_ADDRESS, &mut raw);
            self.print_hex(&raw, true);
            self.print(format_args!("brec_size={}\r\n", BootRecord::SIZE));
            self.print(format_args!("No valid boot record found\r\n> "));
            return;
        }

        self.print(format_args!("Boot applications:\r\n"));
        for (i, app) in store.record().apps.into_iter().enumerate() {
            if !app.is_configured() {
                self.print(format_args!("{i}: Not configured\r\n"));
                continue;
            }
            let verdict = if sha256_flash(flash, app.address, app.size) == app.sha256 {
                "Checked"
            } else {
                "Check error"
            };
            self.print(format_args!(
                "{i}: [{}]\r\n   addr={:08X}; size={:7}; active={}; time=",
                app.display_name(),
                app.address,
                app.size,
                if app.active { "yes" } else { "no" },
            ));
            self.print_timestamp(app.timestamp);
            self.print(format_args!("\r\n   sha256=["));
            self.print_hex(&app.sha256, false);
            self.print(format_args!("] ({verdict})\r\n"));
        }
        self.print(format_args!("> "));
    }

    fn print_timestamp(&mut self, timestamp: u32) {
        match DateTime::from_timestamp(i64::from(timestamp), 0) {
            Some(t) => self.print(format_args!(
                "{:02}:{:02}:{:02} {:04}/{:02}/{:02}",
                t.hour(),
                t.minute(),
                t.second(),
                t.year(),
                t.month(),
                t.day(),
            )),
            None => self.print(format_args!("--:--:--")),
        }
    }

    fn print_hex(&mut self, bytes: &[u8], split: bool) {
        if split {
            self.print(format_args!("\r\n"));
        }
        for (i, b) in bytes.iter().enumerate() {
            if split {
                self.print(format_args!("{b:02X} "));
                if i > 0 && i % 32 == 0 {
                    self.print(format_args!("\r\n"));
                }
            } else {
                self.print(format_args!("{b:02X}"));
            }
        }
        if split {
            self.print(format_args!("\r\n"));
        }
    }

    fn print(&mut self, args: fmt::Arguments<'_>) {
        let mut printer = Printer {
            transport: &mut self.transport,
        };
        let _ = fmt::write(&mut printer, args);
    }
}

fn nul_trimmed(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

struct Printer<'a, T> {
    transport: &'a mut T,
}

impl<T: Transport> fmt::Write for Printer<'_, T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.transport.write(s.as_bytes());
        Ok(())
    }
}
