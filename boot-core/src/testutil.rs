// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory flash and scripted transport doubles for the host test suite.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use host_protocol::{AppRecord, FLASH_BASE, PAGE_SIZE, SECTOR_SIZE};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::vec::Vec;

use crate::flash::Flash;
use crate::monitor::Transport;

#[derive(Debug)]
pub struct MemFlashError(NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// NOR flash double: `write` can only clear bits, `erase` restores `0xFF`,
/// and operation counters make wear observable.
pub struct MemFlash {
    pub mem: Vec<u8>,
    pub erases: usize,
    pub writes: usize,
}

impl MemFlash {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xFF; size],
            erases: 0,
            writes: 0,
        }
    }

    pub fn ops(&self) -> usize {
        self.erases + self.writes
    }

    /// Place bytes directly, bypassing NOR semantics and the counters.
    pub fn fill(&mut self, offset: usize, data: &[u8]) {
        self.mem[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), MemFlashError> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len());
        match end {
            Some(end) if end <= self.mem.len() => {
                bytes.copy_from_slice(&self.mem[start..end]);
                Ok(())
            }
            _ => Err(MemFlashError(NorFlashErrorKind::OutOfBounds)),
        }
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = PAGE_SIZE;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), MemFlashError> {
        let (from, to) = (from as usize, to as usize);
        if from % SECTOR_SIZE != 0 || to % SECTOR_SIZE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        if to > self.mem.len() || from > to {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[from..to].fill(0xFF);
        self.erases += (to - from) / SECTOR_SIZE;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), MemFlashError> {
        let start = offset as usize;
        if start % PAGE_SIZE != 0 || bytes.len() % PAGE_SIZE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        let Some(end) = start.checked_add(bytes.len()) else {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        };
        if end > self.mem.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        for (dst, src) in self.mem[start..end].iter_mut().zip(bytes) {
            *dst &= src;
        }
        self.writes += 1;
        Ok(())
    }
}

/// Transport double fed from a script of input chunks. Each `read` drains at
/// most one chunk, so chunk boundaries model short reads and timeouts.
pub struct ScriptTransport {
    input: VecDeque<Vec<u8>>,
    pub output: Vec<u8>,
    pub discards: usize,
}

impl ScriptTransport {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: Vec::new(),
            discards: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.input.push_back(chunk.to_vec());
    }
}

impl Transport for ScriptTransport {
    fn is_ready(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> usize {
        let Some(mut chunk) = self.input.pop_front() else {
            return 0;
        };
        let n = usize::min(buf.len(), chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if chunk.len() > n {
            chunk.drain(..n);
            self.input.push_front(chunk);
        }
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.output.extend_from_slice(buf);
        buf.len()
    }

    // Scripted chunks model data that has not arrived yet, so nothing is
    // dropped here.
    fn discard_pending(&mut self) {
        self.discards += 1;
    }
}

/// An application record describing `size` bytes at `address`, with a hash
/// matching nothing in particular.
pub fn sample_app(address: u32, size: u32) -> AppRecord {
    let mut name = [0u8; 16];
    name[..4].copy_from_slice(b"test");
    AppRecord {
        name,
        address,
        size,
        active: false,
        timestamp: 1_700_000_000,
        sha256: [0xAB; 32],
    }
}

/// Fill flash with a `seed`-byte image at `address` and return a record
/// whose hash matches the installed bytes.
pub fn install_image(flash: &mut Flash<MemFlash>, address: u32, size: u32, seed: u8) -> AppRecord {
    let image = vec![seed; size as usize];
    flash
        .driver_mut()
        .fill((address - FLASH_BASE) as usize, &image);
    let mut record = sample_app(address, size);
    record.sha256 = Sha256::digest(&image).into();
    record
}
