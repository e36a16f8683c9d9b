//! Deterministic seed splitting.
//!
//! Every independent sub-computation (a pipeline stage, an environment slice,
//! an agent) draws its own `u64` seed split from a parent seed, so a run is
//! reproducible from its top-level seed alone.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Split `seed` into `n` independent child seeds, in a fixed order
pub fn split_seed(seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.next_u64()).collect()
}

/// Random generator for a given seed
pub fn rng_from_seed(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Stream of fresh seeds owned by a long-lived component
#[derive(Debug, Clone)]
pub struct SeedStream {
    rng: StdRng,
}

impl SeedStream {
    pub fn new(seed: u64) -> Self {
        SeedStream {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next seed of the stream
    pub fn next_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Generator seeded from the next seed of the stream
    pub fn next_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.next_seed())
    }
}
