//! Small PCG32 generator for protocol randomness.
//!
//! The connection protocol needs two kinds of random numbers: a non-zero magic
//! number that identifies one handshake epoch, and a nonce per handshake
//! request. Neither needs cryptographic strength, but both need to differ between
//! processes, and tests need to be able to pin them down. [`Pcg32`] covers both:
//! seed it explicitly for reproducible runs, or use [`Pcg32::from_entropy`].
//!
//! ```
//! use rollback_netplay::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.next_u32(), b.next_u32());
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG-XSH-RR with 64 bits of state. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from a state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator that always produces the same sequence for `seed`.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Creates a generator seeded from the process' hash keys and the clock.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }

    /// Returns the next 32 random bits.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Returns a random `u16` that is never zero. Zero is reserved for
    /// "no magic number received yet".
    pub fn next_nonzero_u16(&mut self) -> u16 {
        loop {
            let value = (self.next_u32() >> 16) as u16;
            if value != 0 {
                return value;
            }
        }
    }
}

// `RandomState` is keyed from OS randomness once per process; mixing in the
// clock separates generators created within the same process.
fn entropy_seed() -> u64 {
    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(nanos);
    hasher.write_u32(std::process::id());
    hasher.finish()
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let a_values: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let b_values: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_ne!(a_values, b_values);
    }

    #[test]
    fn nonzero_u16_is_never_zero() {
        let mut rng = Pcg32::seed_from_u64(0);
        for _ in 0..10_000 {
            assert_ne!(rng.next_nonzero_u16(), 0);
        }
    }

    #[test]
    fn entropy_generators_differ() {
        let mut a = Pcg32::from_entropy();
        let mut b = Pcg32::from_entropy();
        let a_values: Vec<u32> = (0..4).map(|_| a.next_u32()).collect();
        let b_values: Vec<u32> = (0..4).map(|_| b.next_u32()).collect();
        assert_ne!(a_values, b_values);
    }
}
