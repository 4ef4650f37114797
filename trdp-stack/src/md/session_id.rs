//! Transaction identifier generation.
//!
//! SessionIds follow the RFC 4122 version-1 layout: a 60-bit timestamp
//! in 100 ns units since the Gregorian epoch, a clock sequence, and a
//! 48-bit node id. No OS UUID facility is consulted; the node id is
//! random with the multicast bit set, as RFC 4122 §4.5 prescribes for
//! node ids that are not MAC addresses. A per-generator counter is
//! folded into the sub-millisecond timestamp bits so ids stay unique
//! within one clock reading.

use rand::{Rng, RngCore};
use trdp_proto::SessionId;

/// Offset from 1582-10-15 to 1970-01-01 in 100 ns units.
const GREGORIAN_UNIX_OFFSET: u64 = 0x01B2_1DD2_1381_4000;

pub struct SessionIdGen {
    clock_seq: u16,
    node: [u8; 6],
    counter: u16,
    last_ms: i64,
}

impl SessionIdGen {
    pub fn new(rng: &mut dyn RngCore) -> Self {
        let mut node = [0u8; 6];
        rng.fill_bytes(&mut node);
        node[0] |= 0x01; // multicast bit marks a non-MAC node id
        SessionIdGen {
            clock_seq: rng.gen::<u16>() & 0x3fff,
            node,
            counter: 0,
            last_ms: 0,
        }
    }

    /// Produces the next id for the given wall-clock reading.
    pub fn next(&mut self, unix_ms: i64) -> SessionId {
        if unix_ms < self.last_ms {
            // Clock went backwards; bump the sequence per RFC 4122.
            self.clock_seq = (self.clock_seq + 1) & 0x3fff;
        }
        if unix_ms != self.last_ms {
            self.counter = 0;
            self.last_ms = unix_ms;
        }
        // 10_000 hundred-nanosecond slots per millisecond.
        let sub_ms = u64::from(self.counter % 10_000);
        self.counter = self.counter.wrapping_add(1);
        let timestamp = (unix_ms.max(0) as u64)
            .wrapping_mul(10_000)
            .wrapping_add(sub_ms)
            .wrapping_add(GREGORIAN_UNIX_OFFSET);

        let time_low = (timestamp & 0xffff_ffff) as u32;
        let time_mid = ((timestamp >> 32) & 0xffff) as u16;
        let time_hi_version = (((timestamp >> 48) & 0x0fff) as u16) | 0x1000;

        let mut id = [0u8; 16];
        id[0..4].copy_from_slice(&time_low.to_be_bytes());
        id[4..6].copy_from_slice(&time_mid.to_be_bytes());
        id[6..8].copy_from_slice(&time_hi_version.to_be_bytes());
        id[8] = ((self.clock_seq >> 8) as u8 & 0x3f) | 0x80; // variant 10
        id[9] = self.clock_seq as u8;
        id[10..16].copy_from_slice(&self.node);
        SessionId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn version_and_variant_bits() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut gen = SessionIdGen::new(&mut rng);
        let id = gen.next(1_700_000_000_000);
        assert_eq!(id.0[6] >> 4, 0x1, "version nibble");
        assert_eq!(id.0[8] & 0xc0, 0x80, "variant bits");
        assert!(!id.is_nil());
    }

    #[test]
    fn ids_are_unique_within_one_clock_reading() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut gen = SessionIdGen::new(&mut rng);
        let a = gen.next(42);
        let b = gen.next(42);
        let c = gen.next(42);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn node_id_has_multicast_bit() {
        let mut rng = StdRng::seed_from_u64(3);
        let gen = SessionIdGen::new(&mut rng);
        assert_eq!(gen.node[0] & 0x01, 0x01);
    }
}
