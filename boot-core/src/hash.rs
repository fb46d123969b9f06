// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! SHA-256 over flash ranges.

use embedded_storage::nor_flash::ReadNorFlash;
use host_protocol::PAGE_SIZE;
use sha2::{Digest, Sha256};

use crate::flash::Flash;

/// SHA-256 over `length` bytes of flash at `address`, hashed in page-sized
/// chunks. An unreadable range yields the all-zero digest.
pub fn sha256_flash<F: ReadNorFlash>(flash: &mut Flash<F>, address: u32, length: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; PAGE_SIZE];
    let mut done = 0u32;
    while done < length {
        let n = u32::min(PAGE_SIZE as u32, length - done);
        let Some(at) = address.checked_add(done) else {
            return [0; 32];
        };
        if flash.read(at, &mut chunk[..n as usize]).is_err() {
            return [0; 32];
        }
        hasher.update(&chunk[..n as usize]);
        done += n;
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemFlash;
    use host_protocol::{FLASH_BASE, WRITABLE_START};

    #[test]
    fn hashes_flash_contents() {
        let mut flash = Flash::new(MemFlash::new(0x2_0000));
        let data: std::vec::Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        flash.driver_mut().fill(0x1_0000, &data);

        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(sha256_flash(&mut flash, WRITABLE_START, 1000), expected);
    }

    #[test]
    fn unreadable_range_yields_zero_digest() {
        let mut flash = Flash::new(MemFlash::new(0x2_0000));
        assert_eq!(sha256_flash(&mut flash, FLASH_BASE + 0x2_0000, 64), [0; 32]);
        assert_eq!(sha256_flash(&mut flash, u32::MAX - 4, 64), [0; 32]);
    }
}
