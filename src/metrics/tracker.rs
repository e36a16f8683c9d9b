use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::pipeline::Diagnostics;

/// Bounded histories collected during training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Undiscounted return of every finished episode
    pub episode_returns: VecDeque<f32>,

    /// Length of every finished episode
    pub episode_lengths: VecDeque<usize>,

    /// `total_loss` of every update
    pub losses: VecDeque<f32>,

    /// Every other update diagnostic, by name
    pub diagnostics: BTreeMap<String, VecDeque<f32>>,
}

/// Summary of a tracker's recent history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_steps: usize,
    pub episodes: usize,
    pub updates: usize,
    pub mean_return: Option<f32>,
    pub mean_length: Option<f32>,
    pub mean_loss: Option<f32>,
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, limit: usize) {
    if history.len() >= limit {
        history.pop_front();
    }
    history.push_back(value);
}

fn mean_of_last<I: DoubleEndedIterator<Item = f32>>(values: I, len: usize, window: usize) -> Option<f32> {
    if len == 0 {
        return None;
    }
    let n = window.min(len);
    Some(values.rev().take(n).sum::<f32>() / n as f32)
}

/// Tracks per-environment episodes and update diagnostics
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    metrics: TrainingMetrics,
    history_size: usize,

    // Running episodes, one slot per environment
    current_returns: Vec<f32>,
    current_lengths: Vec<usize>,

    episode_count: usize,
    update_count: usize,
    total_steps: usize,
}

impl MetricsTracker {
    pub fn new(num_envs: usize, history_size: usize) -> Self {
        MetricsTracker {
            metrics: TrainingMetrics::default(),
            history_size: history_size.max(1),
            current_returns: vec![0.0; num_envs],
            current_lengths: vec![0; num_envs],
            episode_count: 0,
            update_count: 0,
            total_steps: 0,
        }
    }

    /// Record one vectorized step.
    ///
    /// `rewards` and `dones` hold one entry per environment; returns the
    /// `(return, length)` of every episode that just finished.
    pub fn step(&mut self, rewards: &[f32], dones: &[bool]) -> Result<Vec<(usize, f32, usize)>> {
        let n = self.current_returns.len();
        if rewards.len() != n || dones.len() != n {
            return Err(PallasError::dimension_mismatch(
                format!("{} environments", n),
                format!("{} rewards and {} done flags", rewards.len(), dones.len()),
            ));
        }
        self.total_steps += 1;
        let mut finished = Vec::new();
        for env in 0..n {
            self.current_returns[env] += rewards[env];
            self.current_lengths[env] += 1;
            if dones[env] {
                let (ret, len) = (self.current_returns[env], self.current_lengths[env]);
                push_bounded(&mut self.metrics.episode_returns, ret, self.history_size);
                push_bounded(&mut self.metrics.episode_lengths, len, self.history_size);
                self.episode_count += 1;
                self.current_returns[env] = 0.0;
                self.current_lengths[env] = 0;
                finished.push((env, ret, len));
            }
        }
        Ok(finished)
    }

    /// Record the diagnostics of one update
    pub fn record_update(&mut self, diagnostics: &Diagnostics) {
        self.update_count += 1;
        for (name, value) in diagnostics {
            if name == "total_loss" {
                push_bounded(&mut self.metrics.losses, *value, self.history_size);
            } else {
                let history = self.metrics.diagnostics.entry(name.clone()).or_default();
                push_bounded(history, *value, self.history_size);
            }
        }
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn episode_count(&self) -> usize {
        self.episode_count
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Mean return of the last `window` finished episodes
    pub fn avg_episode_return(&self, window: usize) -> Option<f32> {
        let returns = &self.metrics.episode_returns;
        mean_of_last(returns.iter().cloned(), returns.len(), window)
    }

    pub fn avg_episode_length(&self, window: usize) -> Option<f32> {
        let lengths = &self.metrics.episode_lengths;
        mean_of_last(lengths.iter().map(|&l| l as f32), lengths.len(), window)
    }

    pub fn avg_loss(&self, window: usize) -> Option<f32> {
        let losses = &self.metrics.losses;
        mean_of_last(losses.iter().cloned(), losses.len(), window)
    }

    pub fn summary(&self) -> MetricsSummary {
        let window = self.history_size;
        MetricsSummary {
            total_steps: self.total_steps,
            episodes: self.episode_count,
            updates: self.update_count,
            mean_return: self.avg_episode_return(window),
            mean_length: self.avg_episode_length(window),
            mean_loss: self.avg_loss(window),
        }
    }

    /// Save metrics to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.metrics)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    /// Load metrics from file
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let data = std::fs::read_to_string(path)?;
        self.metrics = serde_json::from_str(&data)?;
        Ok(())
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(1, 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episodes_are_tracked_per_env() {
        let mut tracker = MetricsTracker::new(2, 10);
        assert!(tracker.step(&[1.0, 2.0], &[false, false]).unwrap().is_empty());
        let finished = tracker.step(&[1.0, 2.0], &[false, true]).unwrap();
        assert_eq!(finished, vec![(1, 4.0, 2)]);
        let finished = tracker.step(&[1.0, 5.0], &[true, true]).unwrap();
        assert_eq!(finished, vec![(0, 3.0, 3), (1, 5.0, 1)]);
        assert_eq!(tracker.episode_count(), 3);
        assert_eq!(tracker.total_steps(), 3);
        assert_eq!(tracker.avg_episode_return(2), Some(4.0));
        assert_eq!(tracker.avg_episode_length(10), Some(2.0));
    }

    #[test]
    fn test_histories_are_bounded() {
        let mut tracker = MetricsTracker::new(1, 3);
        for i in 0..5 {
            tracker.step(&[i as f32], &[true]).unwrap();
            let mut d = Diagnostics::new();
            d.insert("total_loss".to_string(), i as f32);
            d.insert("q_mean".to_string(), 1.0);
            tracker.record_update(&d);
        }
        assert_eq!(tracker.metrics().episode_returns, VecDeque::from(vec![2.0, 3.0, 4.0]));
        assert_eq!(tracker.metrics().losses.len(), 3);
        assert_eq!(tracker.metrics().diagnostics["q_mean"].len(), 3);
        let summary = tracker.summary();
        assert_eq!(summary.updates, 5);
        assert_eq!(summary.mean_loss, Some(3.0));
    }

    #[test]
    fn test_rejects_wrong_env_count() {
        let mut tracker = MetricsTracker::new(2, 10);
        assert!(tracker.step(&[1.0], &[false]).is_err());
        assert_eq!(tracker.avg_loss(5), None);
    }
}
