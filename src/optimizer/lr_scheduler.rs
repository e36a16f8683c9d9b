use serde::{Deserialize, Serialize};

/// Learning rate scheduling strategies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant { lr: f32 },

    /// Linear decay: lr = initial_lr * (1 - step / max_steps) + final_lr * step / max_steps
    LinearDecay {
        initial_lr: f32,
        final_lr: f32,
        max_steps: usize,
    },
}

impl LearningRateScheduler {
    /// Get the learning rate for a given optimizer step
    pub fn get_lr(&self, step: usize) -> f32 {
        match self {
            LearningRateScheduler::Constant { lr } => *lr,

            LearningRateScheduler::LinearDecay { initial_lr, final_lr, max_steps } => {
                if step >= *max_steps {
                    *final_lr
                } else {
                    let progress = step as f32 / *max_steps as f32;
                    initial_lr * (1.0 - progress) + final_lr * progress
                }
            }
        }
    }

    /// Create a constant learning rate scheduler
    pub fn constant(lr: f32) -> Self {
        LearningRateScheduler::Constant { lr }
    }

    /// Linear annealing to zero over the number of optimizer steps a run performs.
    ///
    /// One update consumes `max_buffer_size * n_envs` transitions and makes
    /// `n_epochs * ceil(max_buffer_size * n_envs / batch_size)` optimizer steps.
    pub fn linear_annealing(
        learning_rate: f32,
        n_envs: usize,
        n_env_steps: usize,
        max_buffer_size: usize,
        batch_size: usize,
        n_epochs: usize,
    ) -> Self {
        let transitions_per_update = (max_buffer_size * n_envs).max(1);
        let n_updates = n_env_steps / max_buffer_size.max(1);
        let minibatches = (transitions_per_update + batch_size.max(1) - 1) / batch_size.max(1);
        LearningRateScheduler::LinearDecay {
            initial_lr: learning_rate,
            final_lr: 0.0,
            max_steps: (n_updates * n_epochs * minibatches).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_decay_endpoints() {
        let schedule = LearningRateScheduler::LinearDecay {
            initial_lr: 1.0,
            final_lr: 0.0,
            max_steps: 10,
        };
        assert_eq!(schedule.get_lr(0), 1.0);
        assert!((schedule.get_lr(5) - 0.5).abs() < 1e-6);
        assert_eq!(schedule.get_lr(20), 0.0);
    }

    #[test]
    fn test_linear_annealing_steps() {
        let schedule = LearningRateScheduler::linear_annealing(3e-4, 2, 100, 10, 8, 3);
        match schedule {
            // 10 updates, 3 epochs, ceil(20 / 8) = 3 minibatches
            LearningRateScheduler::LinearDecay { max_steps, .. } => assert_eq!(max_steps, 90),
            other => panic!("unexpected schedule {:?}", other),
        }
    }
}
