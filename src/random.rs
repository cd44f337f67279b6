//! Deterministic-shaped, seedable source of uniformly distributed integers.
//!
//! Single-threaded, not `Sync`; the engine never touches it from more than
//! one place at a time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Thin wrapper over a `StdRng`, seeded from OS entropy at construction.
pub struct Prng {
    rng: StdRng,
}

impl Prng {
    /// Seed from the OS entropy source.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed deterministically. Exposed for tests; the engine itself always
    /// calls [`Prng::from_entropy`].
    #[cfg(test)]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A uniformly distributed `u32` covering the full range.
    pub fn uint32(&mut self) -> u32 {
        self.rng.gen()
    }

    /// A uniformly distributed `u64` covering the full range.
    pub fn uint64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// A uniformly distributed integer in `[lo, hi]`, inclusive of both
    /// bounds.
    pub fn int_ranged<T>(&mut self, lo: T, hi: T) -> T
    where
        T: rand::distributions::uniform::SampleUniform + PartialOrd + Copy,
    {
        self.rng.gen_range(lo..=hi)
    }
}

impl Default for Prng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
