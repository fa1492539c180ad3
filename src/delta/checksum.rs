//! Block checksums
//!
//! The weak checksum is an Adler-32 variant: cheap, collision-prone, and
//! rollable one byte at a time. The strong checksum is SHA-256 and is the only
//! thing that may confirm a match.

use crate::upload::compute_hash;

/// Largest prime below 2^16
pub const MOD_ADLER: u32 = 65521;

/// Weak checksum of a block: `(b << 16) | a`, starting from `a = 1, b = 0`
pub fn weak_hash(block: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for &byte in block {
        a = (a + byte as u32) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }

    (b << 16) | a
}

/// Strong checksum of a block: lowercase hex SHA-256
pub fn strong_hash(block: &[u8]) -> String {
    compute_hash(block)
}

/// Weak checksum over a sliding window, updated in O(1) per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    a: u64,
    b: u64,
    len: u64,
}

impl RollingChecksum {
    /// Start a window over `window`
    pub fn new(window: &[u8]) -> Self {
        let value = weak_hash(window);
        Self {
            a: (value & 0xffff) as u64,
            b: (value >> 16) as u64,
            len: window.len() as u64,
        }
    }

    pub fn value(&self) -> u32 {
        ((self.b as u32) << 16) | self.a as u32
    }

    /// Window length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slide the window one byte: drop `out` from the front, append `incoming`
    pub fn roll(&mut self, out: u8, incoming: u8) {
        let m = MOD_ADLER as u64;
        let out = out as u64;
        let incoming = incoming as u64;

        self.a = (self.a + m - out + incoming) % m;
        let shed = (self.len % m) * out % m;
        self.b = (self.b + m - shed + self.a + m - 1) % m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_weak_hash_known_values() {
        assert_eq!(weak_hash(b""), 1);
        // Adler-32 of "Wikipedia"
        assert_eq!(weak_hash(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_engineered_weak_collision() {
        let left = [0u8, 2, 0];
        let right = [1u8, 0, 1];
        assert_eq!(weak_hash(&left), weak_hash(&right));
        assert_ne!(strong_hash(&left), strong_hash(&right));
    }

    #[test]
    fn test_rolling_matches_fresh_at_every_offset() {
        let data = pseudo_random(2000, 7);
        for window in [1usize, 3, 16, 257] {
            let mut rolling = RollingChecksum::new(&data[..window]);
            for start in 1..=(data.len() - window) {
                rolling.roll(data[start - 1], data[start + window - 1]);
                assert_eq!(
                    rolling.value(),
                    weak_hash(&data[start..start + window]),
                    "window {} offset {}",
                    window,
                    start
                );
            }
        }
    }

    #[test]
    fn test_rolling_with_saturated_bytes() {
        // Long runs of 0xff push both sums through the modulus many times
        let mut data = vec![0xffu8; 70_000];
        data.extend_from_slice(&[0u8; 10]);
        let window = 66_000;

        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..=(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
        }
        let last = data.len() - window;
        assert_eq!(rolling.value(), weak_hash(&data[last..]));
        assert_eq!(rolling.len(), window);
    }
}
