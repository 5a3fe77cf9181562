//! Scalar and bit math helpers

use std::f32::consts::PI;

/// Converts degrees to radians
#[inline]
pub fn deg_to_rad(deg: f32) -> f32 {
    deg * PI / 180.0
}

/// Get the next power of 2 greater than or equal to x
#[inline]
pub fn next_pow2(x: u32) -> u32 {
    if x == 0 {
        return 1;
    }
    let mut n = x - 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n.wrapping_add(1)
}

/// Integer log base 2
#[inline]
pub fn ilog2(x: u32) -> u32 {
    if x == 0 {
        return 0;
    }
    31 - x.leading_zeros()
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a (64 bit) hasher.
///
/// Output is stable across platforms and runs.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64(u64);

impl Fnv1a64 {
    pub fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a sub-hash into a running hash (`h = (h ^ sub) * prime`).
#[inline]
pub fn fnv_fold(hash: u64, sub: u64) -> u64 {
    (hash ^ sub).wrapping_mul(FNV_PRIME)
}

/// Starting value for [`fnv_fold`] chains
pub const FNV_SEED: u64 = FNV_OFFSET_BASIS;
