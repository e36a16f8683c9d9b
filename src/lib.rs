//! # Pallas - Reinforcement Learning with Functional Update Pipelines
//!
//! Pallas is a reinforcement learning library built around one training loop
//! shared by off-policy and on-policy algorithms. Learning steps are described
//! as pipelines of pure transforms over batched experience tensors, trainable
//! state is an immutable value replaced by every update, and environments run
//! in lock-step inside worker processes or threads.
//!
//! ## Key Features
//!
//! - **Algorithms**: DQN, TD3, SAC and an A2C policy/value actor-critic
//! - **Pipelines**: experience transforms that serve single, vectorized and
//!   multi-agent data alike, followed by ordered update modules
//! - **Target Networks**: Polyak-averaged copies kept next to the live parameters
//! - **Vectorized Environments**: a process (or thread) pool driven by a small
//!   message protocol, plus an in-thread implementation
//! - **Checkpoints**: numbered training-state snapshots with run metadata and
//!   structure-checked restore
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pallas::algorithms::DqnBuilder;
//! use pallas::config::EnvConfig;
//! use pallas::env::{make_env, ActionKind, EnvSpec};
//! use pallas::trainer::train;
//! use pallas::types::Space;
//! use pallas::vec_env::VecEnvPool;
//!
//! let spec = EnvSpec::Counter { episode_length: 10, action: ActionKind::Discrete { n: 2 } };
//! let mut env = VecEnvPool::spawn_threads(4, |_| make_env(&spec)).unwrap();
//!
//! let env_cfg = EnvConfig::new(Space::uniform_box(-1e6, 1e6, &[1]), Space::Discrete { n: 2 })
//!     .with_counts(4, 1);
//! let mut dqn = DqnBuilder::new(env_cfg).n_env_steps(10_000).build().unwrap();
//! let report = train(&mut dqn, &mut env, None, &mut []).unwrap();
//! println!("mean return {:?}", report.metrics.mean_return);
//! ```
//!
//! ## Module Organization
//!
//! - [`algorithms`] - The [`algorithms::Algorithm`] contract and its implementations
//! - [`builders`] - Builder patterns for buffers
//! - [`config`] - Serializable run configuration
//! - [`env`] - Environment traits and the built-in counter environments
//! - [`error`] - Error types and result handling
//! - [`experience`] - Experience records
//! - [`metrics`] - Episode and update metrics
//! - [`network`] - Differentiable MLP model
//! - [`optimizer`] - Optimizers, schedules and gradient clipping
//! - [`pipeline`] - Experience and update pipelines
//! - [`replay_buffer`] - Replay and rollout buffers
//! - [`saver`] - Checkpoints
//! - [`train_state`] - Trainable state with target parameters
//! - [`trainer`] - Training loop, resumption and evaluation
//! - [`vec_env`] - Vectorized environments and the worker protocol

#[macro_use]
mod macros;

pub mod algorithms;
pub mod builders;
pub mod config;
pub mod env;
pub mod error;
pub mod experience;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod params;
pub mod pipeline;
pub mod replay_buffer;
pub mod saver;
pub mod seed;
pub mod tensor;
pub mod train_state;
pub mod trainer;
pub mod transformation;
pub mod types;
pub mod vec_env;
