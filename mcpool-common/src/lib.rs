// mcpool-common - Lock-free building blocks for the cache connection pool
//
// This crate holds the pure pieces: CRC checksums and key-to-bucket routing.

pub mod crc;
pub mod hash;

// Re-export for convenience
pub use crc::{crc32, Crc, CrcParams};
pub use hash::{HashRouter, HashingAlgorithm, Probe};
