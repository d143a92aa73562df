//! # CRC Engine
//!
//! Purpose: Compute table-driven CRCs for any register width between 8 and 64
//! bits, so routing (CRC-32) and framing helpers (CRC-16, CRC-CCITT) share one
//! implementation.
//!
//! ## Design Principles
//! 1. **Precomputed Table**: The 256-entry table is built once per parameter set.
//! 2. **Byte-Wise Loop**: One lookup per input byte keeps the hot path branch-free.
//! 3. **Immutable Engine**: A built `Crc` holds no mutable state and is `Sync`.
//!
//! ## Usage
//!
//! ```rust
//! use mcpool_common::crc::{crc32, Crc, CrcParams};
//!
//! assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
//!
//! let ccitt = Crc::new(CrcParams::CRC_CCITT);
//! assert_eq!(ccitt.checksum(b"123456789"), 0x29B1);
//! ```

use std::sync::OnceLock;

/// Parameters describing one CRC variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcParams {
    /// Register width in bits (8..=64).
    pub width: u32,
    /// Generator polynomial without the implicit top bit.
    pub poly: u64,
    /// Initial register value.
    pub init: u64,
    /// Value xored into the final register.
    pub xor_out: u64,
    /// Process input bytes least-significant bit first.
    pub reflect_in: bool,
    /// Reflect the final register before the output xor.
    pub reflect_out: bool,
}

impl CrcParams {
    /// CRC-CCITT (a.k.a. CRC-16/CCITT-FALSE).
    pub const CRC_CCITT: CrcParams = CrcParams {
        width: 16,
        poly: 0x1021,
        init: 0xFFFF,
        xor_out: 0,
        reflect_in: false,
        reflect_out: false,
    };

    /// CRC-16 (a.k.a. CRC-16/ARC).
    pub const CRC_16: CrcParams = CrcParams {
        width: 16,
        poly: 0x8005,
        init: 0,
        xor_out: 0,
        reflect_in: true,
        reflect_out: true,
    };

    /// Standard CRC-32 as used by zlib and Ethernet.
    pub const CRC_32: CrcParams = CrcParams {
        width: 32,
        poly: 0x04C1_1DB7,
        init: 0xFFFF_FFFF,
        xor_out: 0xFFFF_FFFF,
        reflect_in: true,
        reflect_out: true,
    };
}

/// Table-driven CRC engine for a fixed parameter set.
#[derive(Clone)]
pub struct Crc {
    params: CrcParams,
    mask: u64,
    table: [u64; 256],
}

impl Crc {
    /// Builds the lookup table for `params`.
    ///
    /// # Panics
    /// Panics when `params.width` is outside `8..=64`.
    pub fn new(params: CrcParams) -> Self {
        assert!(
            (8..=64).contains(&params.width),
            "crc width must be within 8..=64, got {}",
            params.width
        );

        let width = params.width;
        let mask = width_mask(width);
        let high_bit = 1u64 << (width - 1);
        let mut table = [0u64; 256];

        for (byte, slot) in table.iter_mut().enumerate() {
            let mut crc = byte as u64;
            if params.reflect_in {
                crc = reflect(crc, 8);
            }
            crc <<= width - 8;

            for _ in 0..8 {
                let bit = crc & high_bit;
                crc <<= 1;
                if bit != 0 {
                    crc ^= params.poly;
                }
            }

            if params.reflect_in {
                crc = reflect(crc, width);
            }
            *slot = crc & mask;
        }

        Crc {
            params,
            mask,
            table,
        }
    }

    /// Returns the parameter set this engine was built for.
    pub fn params(&self) -> &CrcParams {
        &self.params
    }

    /// Computes the CRC of `data`.
    pub fn checksum(&self, data: &[u8]) -> u64 {
        let width = self.params.width;
        let mut crc = self.params.init & self.mask;

        if self.params.reflect_in {
            crc = reflect(crc, width);
            for &byte in data {
                crc = (crc >> 8) ^ self.table[((crc ^ byte as u64) & 0xFF) as usize];
            }
        } else {
            let shift = width - 8;
            for &byte in data {
                crc = (crc << 8) ^ self.table[(((crc >> shift) ^ byte as u64) & 0xFF) as usize];
            }
        }

        if self.params.reflect_out != self.params.reflect_in {
            crc = reflect(crc, width);
        }
        (crc ^ self.params.xor_out) & self.mask
    }
}

impl std::fmt::Debug for Crc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc").field("params", &self.params).finish()
    }
}

/// Computes the standard CRC-32 of `data` with a shared, lazily built table.
pub fn crc32(data: &[u8]) -> u32 {
    static CRC32: OnceLock<Crc> = OnceLock::new();
    CRC32.get_or_init(|| Crc::new(CrcParams::CRC_32)).checksum(data) as u32
}

/// Reverses the low `bits` bits of `value`; higher bits are dropped.
fn reflect(value: u64, bits: u32) -> u64 {
    (value & width_mask(bits)).reverse_bits() >> (64 - bits)
}

fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK_INPUT: &[u8] = b"123456789";

    #[test]
    fn crc32_matches_check_value() {
        assert_eq!(crc32(CHECK_INPUT), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn crc16_matches_check_value() {
        let crc = Crc::new(CrcParams::CRC_16);
        assert_eq!(crc.checksum(CHECK_INPUT), 0xBB3D);
    }

    #[test]
    fn crc_ccitt_matches_check_value() {
        let crc = Crc::new(CrcParams::CRC_CCITT);
        assert_eq!(crc.checksum(CHECK_INPUT), 0x29B1);
    }

    #[test]
    fn crc64_xz_matches_check_value() {
        let crc = Crc::new(CrcParams {
            width: 64,
            poly: 0x42F0_E1EB_A9EA_3693,
            init: u64::MAX,
            xor_out: u64::MAX,
            reflect_in: true,
            reflect_out: true,
        });
        assert_eq!(crc.checksum(CHECK_INPUT), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn reflect_reverses_low_bits_only() {
        assert_eq!(reflect(0b0000_0001, 8), 0b1000_0000);
        assert_eq!(reflect(0x1_0001, 16), 0x8000);
        assert_eq!(reflect(0x0F, 4), 0x0F);
    }

    #[test]
    #[should_panic(expected = "crc width")]
    fn rejects_narrow_width() {
        let _ = Crc::new(CrcParams {
            width: 4,
            ..CrcParams::CRC_16
        });
    }
}
