use std::sync::Arc;

use ndarray::parallel::prelude::*;

use crate::error::{PallasError, Result};
use crate::experience::AgentData;
use crate::seed::split_seed;
use crate::tensor::{self, TensorTree};

/// Stage function: `(state, seed, experience) -> experience`
pub type ProcessFn<S, E> = Arc<dyn Fn(&S, u64, E) -> Result<E> + Send + Sync>;

/// A pure experience transform paired with the state it reads
pub struct ExperienceTransform<S, E> {
    pub state: S,
    process_fn: ProcessFn<S, E>,
}

impl<S: Clone, E> Clone for ExperienceTransform<S, E> {
    fn clone(&self) -> Self {
        ExperienceTransform {
            state: self.state.clone(),
            process_fn: Arc::clone(&self.process_fn),
        }
    }
}

impl<S, E> ExperienceTransform<S, E> {
    pub fn new(state: S, process_fn: ProcessFn<S, E>) -> Self {
        ExperienceTransform { state, process_fn }
    }

    pub fn from_fn<F>(state: S, f: F) -> Self
    where
        F: Fn(&S, u64, E) -> Result<E> + Send + Sync + 'static,
    {
        ExperienceTransform::new(state, Arc::new(f))
    }

    pub fn process(&self, seed: u64, experience: E) -> Result<E> {
        (self.process_fn)(&self.state, seed, experience)
    }
}

/// Which extra axes an experience batch carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapeRegime {
    /// Leaves are `[T, n_envs, ...]`
    pub vectorized: bool,
    /// Experience is keyed by agent
    pub parallel: bool,
}

impl ShapeRegime {
    pub fn scalar() -> Self {
        ShapeRegime::default()
    }

    pub fn new(vectorized: bool, parallel: bool) -> Self {
        ShapeRegime { vectorized, parallel }
    }

    /// Regime matching a number of environments and agents
    pub fn for_counts(n_envs: usize, n_agents: usize) -> Self {
        ShapeRegime {
            vectorized: n_envs > 1,
            parallel: n_agents > 1,
        }
    }
}

/// Run every stage in order on one slice, each with its own sub-seed
fn run_stages<S, E>(transforms: &[ExperienceTransform<S, E>], seed: u64, experience: E) -> Result<E> {
    let seeds = split_seed(seed, transforms.len());
    transforms
        .iter()
        .zip(seeds)
        .try_fold(experience, |exp, (transform, stage_seed)| transform.process(stage_seed, exp))
}

/// Map independent seeded slices in parallel; output order follows input order
fn broadcast<S, E>(transforms: &[ExperienceTransform<S, E>], jobs: Vec<(u64, E)>) -> Result<Vec<E>>
where
    S: Sync,
    E: Send,
{
    jobs.into_par_iter()
        .map(|(seed, slice)| run_stages(transforms, seed, slice))
        .collect()
}

/// Slices along the environment axis, or the whole record when not vectorized
fn env_slices<E: TensorTree>(experience: &E, vectorized: bool) -> Result<Vec<E>> {
    if vectorized {
        tensor::unstack_axis(experience, 1)
    } else {
        Ok(vec![experience.clone()])
    }
}

/// Process a batch through every stage and flatten it to a single leading axis.
///
/// * scalar: stages run once on the batch with `seed`.
/// * vectorized: leaves are `[T, n_envs, ...]`; stages run per environment with
///   seeds split from `seed`, and the result is `[T * n_envs, ...]`.
/// * parallel: stages run per agent (sorted agent order) with split seeds; agents
///   are stacked on axis 1 and flattened to `[T * n_agents, ...]`. With both flags
///   every agent seed is split again per environment and slices are laid out
///   agent-major before flattening to `[T * n_agents * n_envs, ...]`.
///
/// Identical inputs and seed always give identical outputs.
pub fn process_experience_pipeline<S, E>(
    transforms: &[ExperienceTransform<S, E>],
    regime: ShapeRegime,
    seed: u64,
    experience: AgentData<E>,
) -> Result<E>
where
    S: Sync,
    E: TensorTree,
{
    let jobs: Vec<(u64, E)> = match (experience, regime.parallel) {
        (AgentData::Single(e), false) => {
            if !regime.vectorized {
                return run_stages(transforms, seed, e);
            }
            let slices = env_slices(&e, true)?;
            split_seed(seed, slices.len()).into_iter().zip(slices).collect()
        }
        (AgentData::Parallel(agents), true) => {
            if agents.is_empty() {
                return Err(PallasError::EmptyBatch("no agents in experience".to_string()));
            }
            let agent_seeds = split_seed(seed, agents.len());
            let mut jobs = Vec::new();
            for (agent_seed, e) in agent_seeds.into_iter().zip(agents.into_values()) {
                let slices = env_slices(&e, regime.vectorized)?;
                if regime.vectorized {
                    jobs.extend(split_seed(agent_seed, slices.len()).into_iter().zip(slices));
                } else {
                    jobs.extend(std::iter::once(agent_seed).zip(slices));
                }
            }
            jobs
        }
        (data, parallel) => {
            return Err(PallasError::invalid_parameter(
                "regime".to_string(),
                format!(
                    "parallel={} does not match {} experience",
                    parallel,
                    if data.is_parallel() { "multi-agent" } else { "single-agent" }
                ),
            ))
        }
    };

    let processed = broadcast(transforms, jobs)?;
    let stacked = tensor::stack_axis(&processed, 1)?;
    tensor::merge_leading(&stacked)
}

/// Stack per-step records along time, then process them
pub fn process_records<S, E>(
    transforms: &[ExperienceTransform<S, E>],
    regime: ShapeRegime,
    seed: u64,
    records: &[AgentData<E>],
) -> Result<E>
where
    S: Sync,
    E: TensorTree,
{
    let batch = AgentData::stack(records)?;
    process_experience_pipeline(transforms, regime, seed, batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::Experience;
    use crate::types::{AgentMap, Tensor};
    use ndarray::{Array, ArrayD, IxDyn};

    fn add_reward_transform(offset: f32) -> ExperienceTransform<f32, Experience> {
        ExperienceTransform::from_fn(offset, |offset: &f32, _seed, mut e: Experience| {
            e.reward = e.reward.mapv(|r| r + offset);
            Ok(e)
        })
    }

    fn noise_transform() -> ExperienceTransform<(), Experience> {
        ExperienceTransform::from_fn((), |_: &(), seed, e: Experience| {
            let noise = (seed % 1000) as f32;
            let reward = e.reward.mapv(|r| r + noise);
            Ok(Experience { reward, ..e })
        })
    }

    fn filled(shape: &[usize], start: f32) -> Tensor {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|i| start + i as f32).collect()).unwrap()
    }

    fn batch(shape: &[usize]) -> Experience {
        let mut obs_shape = shape.to_vec();
        obs_shape.push(2);
        Experience::new(
            filled(&obs_shape, 0.0),
            filled(shape, 0.0),
            filled(shape, 100.0),
            filled(&obs_shape, 1.0),
            Array::zeros(IxDyn(shape)),
        )
    }

    #[test]
    fn test_scalar_applies_stages_in_order() {
        let transforms = vec![add_reward_transform(1.0), add_reward_transform(10.0)];
        let out = process_experience_pipeline(&transforms, ShapeRegime::scalar(), 0, AgentData::Single(batch(&[3])))
            .unwrap();
        assert_eq!(out.reward.iter().cloned().collect::<Vec<_>>(), vec![111.0, 112.0, 113.0]);
    }

    #[test]
    fn test_vectorized_flattens_time_major() {
        let transforms = vec![add_reward_transform(0.0)];
        let out = process_experience_pipeline(
            &transforms,
            ShapeRegime::new(true, false),
            0,
            AgentData::Single(batch(&[2, 3])),
        )
        .unwrap();
        assert_eq!(out.reward.shape(), &[6]);
        assert_eq!(out.observation.shape(), &[6, 2]);
        assert_eq!(
            out.reward.iter().cloned().collect::<Vec<_>>(),
            vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0]
        );
    }

    #[test]
    fn test_parallel_and_vectorized_layout() {
        let mut agents = AgentMap::new();
        agents.insert("a".to_string(), batch(&[2, 2]));
        let mut b = batch(&[2, 2]);
        b.reward = b.reward.mapv(|r| r + 50.0);
        agents.insert("b".to_string(), b);

        let out = process_experience_pipeline(
            &[add_reward_transform(0.0)],
            ShapeRegime::new(true, true),
            0,
            AgentData::Parallel(agents),
        )
        .unwrap();
        // [T=2, (a,e0), (a,e1), (b,e0), (b,e1)]
        assert_eq!(
            out.reward.iter().cloned().collect::<Vec<_>>(),
            vec![100.0, 101.0, 150.0, 151.0, 102.0, 103.0, 152.0, 153.0]
        );
    }

    #[test]
    fn test_slices_get_distinct_seeds() {
        let out = process_experience_pipeline(
            &[noise_transform()],
            ShapeRegime::new(true, false),
            7,
            AgentData::Single(batch(&[1, 4])),
        )
        .unwrap();
        let offsets: Vec<f32> = out.reward.iter().enumerate().map(|(i, r)| r - 100.0 - i as f32).collect();
        let mut unique = offsets.clone();
        unique.sort_by(|a, b| a.partial_cmp(b).unwrap());
        unique.dedup();
        assert!(unique.len() > 1);
    }

    #[test]
    fn test_regime_mismatch() {
        let result = process_experience_pipeline(
            &[add_reward_transform(0.0)],
            ShapeRegime::new(false, true),
            0,
            AgentData::Single(batch(&[2])),
        );
        assert!(matches!(result, Err(PallasError::InvalidParameter { .. })));
    }

    #[test]
    fn test_stage_error_propagates() {
        let failing: ExperienceTransform<(), Experience> =
            ExperienceTransform::from_fn((), |_: &(), _, _| Err(PallasError::NumericalError("nan".into())));
        let result =
            process_experience_pipeline(&[failing], ShapeRegime::new(true, false), 0, AgentData::Single(batch(&[2, 2])));
        assert!(matches!(result, Err(PallasError::NumericalError(_))));
    }
}
