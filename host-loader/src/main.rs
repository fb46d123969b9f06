// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash loader for the OTA bootloader: query the device, read flash and
//! write firmware images block by block over the serial link.

use std::error::Error;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Timelike};
use clap::{Parser, Subcommand};
use host_protocol::{
    AppRecord, APP_REGION_END, DATA_BLOCK_SIZE, MAX_APP_SIZE, MIN_APP_SIZE, WRITABLE_START,
};
use log::warn;
use sha2::{Digest, Sha256};

mod device;

use device::Device;

/// Attempts per block before the write is abandoned.
const BLOCK_RETRIES: usize = 5;

#[derive(Debug, Parser)]
#[command(about = "Flash loader for the i.MX RT OTA bootloader")]
struct Args {
    /// Serial port the device is attached to
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Show the bootloader version and the installed application records
    Info,
    /// Read flash into a file, one 4 KiB block at a time
    Read {
        /// Flash address to read from, 4 KiB aligned (0x prefix for hex)
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Number of bytes to read, rounded up to whole blocks
        #[arg(value_parser = parse_u32)]
        length: u32,
        /// Destination file
        out: PathBuf,
    },
    /// Write a firmware image and install its application record
    Write {
        /// Flash address to program, 4 KiB aligned (0x prefix for hex)
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Firmware image file
        file: PathBuf,
        /// Record name stored alongside the image
        #[arg(long, default_value = "application")]
        name: String,
        /// Slot to install the record into (0 or 1)
        #[arg(long, default_value_t = 0)]
        slot: u8,
        /// Mark the slot active so it is preferred at boot
        #[arg(long)]
        activate: bool,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => s.parse().map_err(|e: std::num::ParseIntError| e.to_string()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();
    let args = Args::parse();
    let mut device = Device::open(&args.port)?;

    match args.command {
        Cmd::Info => info(&mut device)?,
        Cmd::Read {
            address,
            length,
            out,
        } => read(&mut device, address, length, &out)?,
        Cmd::Write {
            address,
            file,
            name,
            slot,
            activate,
        } => write(&mut device, address, &file, &name, slot, activate)?,
    }
    Ok(())
}

fn info(device: &mut Device) -> Result<(), Box<dyn Error>> {
    println!("Device detected: {}\n", device.version()?);

    let records = device.read_records()?;
    println!("Boot application records:");
    println!("--------------------------");
    for (slot, record) in records.iter().enumerate() {
        if !record.is_configured() {
            println!("Slot {slot}: Not configured");
            continue;
        }
        println!("Slot {slot}:");
        println!("     Name: '{}'", record.display_name());
        println!("  Address: 0x{:08X}", record.address);
        println!("     Size: {}", record.size);
        println!("Timestamp: {}", format_timestamp(record.timestamp));
        println!("   Active: {}", if record.active { "Yes" } else { "No" });
        println!("   SHA256: [{}]", hex(&record.sha256));
    }
    println!("--------------------------");
    Ok(())
}

fn read(device: &mut Device, address: u32, length: u32, out: &Path) -> Result<(), Box<dyn Error>> {
    if address % DATA_BLOCK_SIZE as u32 != 0 {
        return Err("address must be 4 KiB aligned".into());
    }
    if length == 0 {
        return Err("length must be greater than zero".into());
    }

    let blocks = length.div_ceil(DATA_BLOCK_SIZE as u32);
    let mut data = Vec::with_capacity((blocks as usize) * DATA_BLOCK_SIZE);
    println!("Reading {blocks} blocks from 0x{address:08X}...");
    let started = Instant::now();
    for i in 0..blocks {
        let block = device.read_block(address + i * DATA_BLOCK_SIZE as u32)?;
        data.extend_from_slice(&block);
    }
    fs::write(out, &data)?;

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "{} bytes received in {elapsed:.3} seconds ({:.2} KB/sec) to '{}'",
        data.len(),
        data.len() as f64 / elapsed / 1024.0,
        out.display()
    );
    Ok(())
}

fn write(
    device: &mut Device,
    address: u32,
    file: &Path,
    name: &str,
    slot: u8,
    activate: bool,
) -> Result<(), Box<dyn Error>> {
    if slot > 1 {
        return Err("slot must be 0 or 1".into());
    }
    if address % DATA_BLOCK_SIZE as u32 != 0 {
        return Err("address must be 4 KiB aligned".into());
    }
    if !(WRITABLE_START..APP_REGION_END).contains(&address) {
        return Err(format!(
            "address must be in 0x{WRITABLE_START:08X}..0x{APP_REGION_END:08X}"
        )
        .into());
    }

    let mut image = fs::read(file)?;
    if image.len() < MIN_APP_SIZE as usize || image.len() > MAX_APP_SIZE as usize {
        return Err("image size must be between 64 KiB and 2 MiB".into());
    }
    // Pad to whole blocks; erased flash reads back 0xFF anyway.
    let tail = image.len() % DATA_BLOCK_SIZE;
    if tail != 0 {
        image.resize(image.len() + DATA_BLOCK_SIZE - tail, 0xFF);
    }
    let local_hash: [u8; 32] = Sha256::digest(&image).into();

    println!(
        "Writing {} bytes to 0x{address:08X} from '{}'...",
        image.len(),
        file.display()
    );
    let started = Instant::now();
    let mut retries = 0usize;
    for (i, block) in image.chunks(DATA_BLOCK_SIZE).enumerate() {
        let at = address + (i * DATA_BLOCK_SIZE) as u32;
        let mut attempt = 0;
        loop {
            match device.write_block(at, block) {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    retries += 1;
                    warn!("block at 0x{at:08X} failed ({e}), attempt {attempt}");
                    if attempt >= BLOCK_RETRIES {
                        return Err(e.into());
                    }
                }
            }
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "{} bytes written in {elapsed:.3} seconds ({:.2} KB/sec); retries: {retries}",
        image.len(),
        image.len() as f64 / elapsed / 1024.0,
    );

    let device_hash = device.app_hash(address, image.len() as u32)?;
    println!("SHA256 flashed: [{}]", hex(&device_hash));
    println!("SHA256    file: [{}]", hex(&local_hash));
    if device_hash != local_hash {
        return Err("device hash does not match the local image".into());
    }

    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32;
    let mut record_name = [0u8; 16];
    let n = name.len().min(record_name.len() - 1);
    record_name[..n].copy_from_slice(&name.as_bytes()[..n]);
    let record = AppRecord {
        name: record_name,
        address,
        size: image.len() as u32,
        active: activate,
        timestamp,
        sha256: local_hash,
    };

    println!("Installing application record into slot {slot}");
    device.install_record(slot, &record)?;
    println!("Done.");
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02X}");
    }
    s
}

fn format_timestamp(timestamp: u32) -> String {
    match DateTime::from_timestamp(i64::from(timestamp), 0) {
        Some(t) => format!(
            "{:02}:{:02}:{:02} {:04}/{:02}/{:02}",
            t.hour(),
            t.minute(),
            t.second(),
            t.year(),
            t.month(),
            t.day()
        ),
        None => String::from("-"),
    }
}
