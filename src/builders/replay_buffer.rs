use crate::error::{PallasError, Result};
use crate::replay_buffer::{ReplayBuffer, RolloutBuffer};

fn check_capacity(capacity: Option<usize>) -> Result<usize> {
    let capacity = capacity.ok_or_else(|| PallasError::InvalidParameter {
        name: "capacity".to_string(),
        reason: "Capacity not specified".to_string(),
    })?;

    if capacity == 0 {
        return Err(PallasError::InvalidParameter {
            name: "capacity".to_string(),
            reason: "Capacity must be greater than 0".to_string(),
        });
    }
    Ok(capacity)
}

/// Builder for ReplayBuffer
pub struct ReplayBufferBuilder {
    capacity: Option<usize>,
    seed: u64,
}

impl ReplayBufferBuilder {
    /// Create a new replay buffer builder
    pub fn new() -> Self {
        ReplayBufferBuilder { capacity: None, seed: 0 }
    }

    /// Set the capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Seed of the sampling generator
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Build the replay buffer
    pub fn build<T: Clone>(self) -> Result<ReplayBuffer<T>> {
        let capacity = check_capacity(self.capacity)?;
        Ok(ReplayBuffer::new(capacity, self.seed))
    }
}

impl Default for ReplayBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for RolloutBuffer
pub struct RolloutBufferBuilder {
    capacity: Option<usize>,
}

impl RolloutBufferBuilder {
    pub fn new() -> Self {
        RolloutBufferBuilder { capacity: None }
    }

    /// Number of steps collected before an update
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn build<T>(self) -> Result<RolloutBuffer<T>> {
        let capacity = check_capacity(self.capacity)?;
        Ok(RolloutBuffer::new(capacity))
    }
}

impl Default for RolloutBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay_buffer::ExperienceBuffer;

    #[test]
    fn test_replay_buffer_builder() {
        let buffer: ReplayBuffer<u32> = ReplayBufferBuilder::new().capacity(1000).seed(3).build().unwrap();
        assert_eq!(buffer.capacity(), 1000);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_required() {
        assert!(ReplayBufferBuilder::new().build::<u32>().is_err());
        assert!(ReplayBufferBuilder::new().capacity(0).build::<u32>().is_err());
    }

    #[test]
    fn test_rollout_buffer_builder() {
        let buffer: RolloutBuffer<u32> = RolloutBufferBuilder::new().capacity(16).build().unwrap();
        assert_eq!(buffer.max_size(), 16);
        assert!(RolloutBufferBuilder::new().capacity(0).build::<u32>().is_err());
    }
}
