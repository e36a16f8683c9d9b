use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{PallasError, Result};

/// Storage shared by the off-policy and on-policy buffers
pub trait ExperienceBuffer<T> {
    /// Append one record
    fn add(&mut self, experience: T);

    /// Number of stored records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-capacity ring buffer sampled uniformly with replacement.
///
/// Once full, every insertion overwrites the oldest record. Sampling is driven
/// by a generator owned by the buffer so a seeded run is reproducible.
#[derive(Clone, Debug)]
pub struct ReplayBuffer<T> {
    buffer: Vec<T>,
    capacity: usize,
    position: usize,
    rng: StdRng,
}

impl<T: Clone> ReplayBuffer<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        ReplayBuffer {
            buffer: Vec::with_capacity(capacity),
            capacity,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Draw `batch_size` records uniformly, with replacement
    pub fn sample(&mut self, batch_size: usize) -> Result<Vec<T>> {
        let available = self.buffer.len();
        if batch_size > available {
            return Err(PallasError::BufferUnderrun {
                requested: batch_size,
                available,
            });
        }
        let indices: Vec<usize> = (0..batch_size).map(|_| self.rng.gen_range(0..available)).collect();
        Ok(indices.into_iter().map(|idx| self.buffer[idx].clone()).collect())
    }

    /// Records from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.buffer.split_at(self.position);
        older.iter().chain(newer.iter())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }
}

impl<T: Clone> ExperienceBuffer<T> for ReplayBuffer<T> {
    fn add(&mut self, experience: T) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() < self.capacity {
            self.buffer.push(experience);
        } else {
            self.buffer[self.position] = experience;
            self.position = (self.position + 1) % self.capacity;
        }
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Trajectory store consumed whole once per update epoch
#[derive(Clone, Debug)]
pub struct RolloutBuffer<T> {
    buffer: Vec<T>,
    max_size: usize,
}

impl<T> RolloutBuffer<T> {
    pub fn new(max_size: usize) -> Self {
        RolloutBuffer {
            buffer: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// True once an epoch worth of records has been collected
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }

    /// Every record in insertion order; the buffer is left empty
    pub fn take_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.buffer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl<T> ExperienceBuffer<T> for RolloutBuffer<T> {
    fn add(&mut self, experience: T) {
        self.buffer.push(experience);
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Shuffled minibatch index sets covering `0..len`.
///
/// The final minibatch is shorter when `minibatch_size` does not divide `len`.
pub fn shuffled_minibatches(len: usize, minibatch_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    indices
        .chunks(minibatch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
