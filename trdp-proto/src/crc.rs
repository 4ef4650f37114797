//! The safety frame check sequence.
//!
//! TRDP protects header and payload blocks with a 32-bit CRC that is
//! independent of the transport checksums: polynomial 0x04C11DB7
//! (reflected), initial value 0xFFFFFFFF, and no final XOR. The raw
//! residue is transmitted big-endian. This is the catalogued
//! CRC-32/JAMCRC algorithm.

use crc::{Crc, CRC_32_JAMCRC};

const SAFETY: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Computes the safety FCS over `data`.
pub fn safety_crc(data: &[u8]) -> u32 {
    SAFETY.checksum(data)
}
