// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial client for the bootloader's binary protocol.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use host_protocol::{
    crc32, AppRecord, Command, Header, Opcode, SlotSelect, Status, DATA_BLOCK_SIZE,
};
use log::debug;
use serialport::SerialPort;

const BAUD_RATE: u32 = 115_200;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1250);

/// Pause between the command acknowledgment and the payload phase, giving
/// the device time to arm its receive buffer.
const PAYLOAD_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum DeviceError {
    Serial(serialport::Error),
    Io(std::io::Error),
    /// The device answered with an error status and its detail word.
    Device(Status, u32),
    /// Response code outside the protocol status set.
    UnknownStatus(u32),
    /// Response header failed its CRC check.
    ResponseCrc,
    /// Response payload failed its CRC check.
    PayloadCrc,
    /// Response payload missing or not the expected shape.
    ShortPayload,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(e) => write!(f, "serial port error: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Device(status, detail) => {
                write!(f, "device reported: {status} (detail 0x{detail:08X})")
            }
            Self::UnknownStatus(word) => write!(f, "unknown response code 0x{word:08X}"),
            Self::ResponseCrc => f.write_str("response header CRC error"),
            Self::PayloadCrc => f.write_str("response data CRC error"),
            Self::ShortPayload => f.write_str("response data missing or truncated"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<serialport::Error> for DeviceError {
    fn from(e: serialport::Error) -> Self {
        Self::Serial(e)
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Response to one binary command.
pub struct Response {
    pub status: Status,
    pub detail: u32,
    pub payload: Vec<u8>,
}

pub struct Device {
    port: Box<dyn SerialPort>,
}

impl Device {
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(RESPONSE_TIMEOUT)
            .open()?;
        Ok(Self { port })
    }

    pub fn version(&mut self) -> Result<String, DeviceError> {
        let payload = expect_ok(self.transact(Opcode::GetVersion.into(), 0, 0, 0)?)?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    pub fn read_block(&mut self, address: u32) -> Result<Vec<u8>, DeviceError> {
        let response = self.transact(Opcode::ReadFlash.into(), address, DATA_BLOCK_SIZE as u32, 0)?;
        let block = expect_ok(response)?;
        if block.len() != DATA_BLOCK_SIZE {
            return Err(DeviceError::ShortPayload);
        }
        Ok(block)
    }

    /// Two-phase block write. The caller decides about retries.
    pub fn write_block(&mut self, address: u32, block: &[u8]) -> Result<(), DeviceError> {
        let response = self.transact(
            Opcode::WriteFlash.into(),
            address,
            block.len() as u32,
            crc32(block),
        )?;
        expect_ok(response)?;
        std::thread::sleep(PAYLOAD_DELAY);
        expect_ok(self.send_payload(block)?)?;
        Ok(())
    }

    pub fn app_hash(&mut self, address: u32, length: u32) -> Result<[u8; 32], DeviceError> {
        let payload = expect_ok(self.transact(Opcode::AppGetHash.into(), address, length, 0)?)?;
        payload.try_into().map_err(|_| DeviceError::ShortPayload)
    }

    pub fn read_records(&mut self) -> Result<[AppRecord; 2], DeviceError> {
        let command = Command {
            opcode: Opcode::AppRecordRead,
            slots: SlotSelect::both(),
        };
        let payload = expect_ok(self.transact(command, 0, 0, 0)?)?;
        if payload.len() != 2 * AppRecord::SIZE {
            return Err(DeviceError::ShortPayload);
        }
        Ok([
            AppRecord::parse(&payload[..AppRecord::SIZE]).map_err(|_| DeviceError::ShortPayload)?,
            AppRecord::parse(&payload[AppRecord::SIZE..]).map_err(|_| DeviceError::ShortPayload)?,
        ])
    }

    /// Two-phase record install into the given slot.
    pub fn install_record(&mut self, slot: u8, record: &AppRecord) -> Result<(), DeviceError> {
        let command = Command {
            opcode: Opcode::AppRecordWrite,
            slots: SlotSelect {
                slot0: slot == 0,
                slot1: slot == 1,
            },
        };
        let payload = record.serialize();
        let response = self.transact(
            command,
            record.address,
            payload.len() as u32,
            crc32(&payload),
        )?;
        expect_ok(response)?;
        std::thread::sleep(PAYLOAD_DELAY);
        expect_ok(self.send_payload(&payload)?)?;
        Ok(())
    }

    fn transact(
        &mut self,
        command: Command,
        param: u32,
        data_len: u32,
        data_crc: u32,
    ) -> Result<Response, DeviceError> {
        let header = Header {
            cmd: command.encode(),
            param,
            data_len,
            data_crc,
        };
        debug!(
            "request cmd=0x{:08X} param=0x{param:08X} len={data_len}",
            header.cmd
        );
        self.port.write_all(&header.encode())?;
        self.read_response()
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<Response, DeviceError> {
        debug!("payload len={}", payload.len());
        self.port.write_all(payload)?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<Response, DeviceError> {
        let mut raw = [0u8; Header::SIZE];
        self.port.read_exact(&mut raw)?;
        let header = Header::parse(&raw).map_err(|_| DeviceError::ResponseCrc)?;
        debug!(
            "response cmd=0x{:08X} len={} crc=0x{:08X}",
            header.cmd, header.data_len, header.data_crc
        );

        let mut payload = vec![0u8; header.data_len as usize];
        if !payload.is_empty() {
            self.port.read_exact(&mut payload)?;
            if crc32(&payload) != header.data_crc {
                return Err(DeviceError::PayloadCrc);
            }
        }

        let status = Status::from_word(header.cmd).ok_or(DeviceError::UnknownStatus(header.cmd))?;
        let detail = if payload.is_empty() { header.data_crc } else { 0 };
        Ok(Response {
            status,
            detail,
            payload,
        })
    }
}

fn expect_ok(response: Response) -> Result<Vec<u8>, DeviceError> {
    match response.status {
        Status::Ok => Ok(response.payload),
        status => Err(DeviceError::Device(status, response.detail)),
    }
}
