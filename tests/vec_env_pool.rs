use std::process::Command;

use ndarray::arr1;
use pallas::error::PallasError;
use pallas::types::{AgentMap, Tensor, DEFAULT_AGENT};
use pallas::vec_env::{VecEnv, VecEnvPool};

fn worker_pool(lengths: &[usize], verbose: bool) -> VecEnvPool {
    let lengths = lengths.to_vec();
    VecEnvPool::spawn_processes(lengths.len(), |i| {
        let mut command = Command::new(env!("CARGO_BIN_EXE_pallas-worker"));
        command
            .arg("--env")
            .arg("counter")
            .arg("--discrete")
            .arg("4")
            .arg("--episode-length")
            .arg(lengths[i].to_string());
        if verbose {
            command.arg("--verbose");
        }
        command
    })
    .unwrap()
}

fn process_pool(lengths: &[usize]) -> VecEnvPool {
    worker_pool(lengths, false)
}

fn actions(values: &[f32]) -> AgentMap<Tensor> {
    let mut actions = AgentMap::new();
    actions.insert(DEFAULT_AGENT.to_string(), arr1(values).into_dyn());
    actions
}

#[test]
fn test_process_pool_end_to_end() {
    let mut pool = process_pool(&[2, 3, 4, 5]);
    assert_eq!(pool.num_envs(), 4);
    assert_eq!(pool.agents(), &[DEFAULT_AGENT.to_string()]);

    let (obs, _) = pool.reset(Some(42)).unwrap();
    assert_eq!(obs[DEFAULT_AGENT].shape(), &[4, 1]);
    assert!(obs[DEFAULT_AGENT].iter().all(|&v| v == 0.0));

    let step = pool.step(&actions(&[1.0, 2.0, 3.0, 1.0])).unwrap();
    assert_eq!(step.rewards[DEFAULT_AGENT].to_vec(), vec![1.0, 2.0, 3.0, 1.0]);
    assert!(step.infos.ended_envs().is_empty());

    let step = pool.step(&actions(&[1.0, 2.0, 3.0, 1.0])).unwrap();
    assert_eq!(step.terminated[DEFAULT_AGENT].to_vec(), vec![true, false, false, false]);
    assert_eq!(step.infos.ended_envs(), vec![0]);
    let last = step.infos.final_observation(0).unwrap();
    assert_eq!(last[DEFAULT_AGENT].iter().cloned().collect::<Vec<_>>(), vec![2.0]);
    assert_eq!(step.observations[DEFAULT_AGENT][[0, 0]], 0.0);
    assert_eq!(step.observations[DEFAULT_AGENT][[1, 0]], 4.0);
    assert_eq!(step.observations[DEFAULT_AGENT][[2, 0]], 6.0);
    assert!(step.infos.final_observation(1).is_none());

    pool.close().unwrap();
}

#[test]
fn test_process_pool_rejects_double_step_async() {
    let mut pool = process_pool(&[3, 3, 3, 3]);
    pool.reset(None).unwrap();
    pool.step_async(&actions(&[0.0; 4])).unwrap();
    assert!(matches!(pool.step_async(&actions(&[0.0; 4])), Err(PallasError::StepPending)));
    let step = pool.step_wait().unwrap();
    assert_eq!(step.rewards[DEFAULT_AGENT].to_vec(), vec![0.0; 4]);
    assert!(matches!(pool.step_wait(), Err(PallasError::NoPendingStep)));
    pool.close().unwrap();
    assert!(matches!(pool.reset(None), Err(PallasError::PoolClosed)));
}

#[test]
fn test_verbose_workers_keep_stdout_for_frames() {
    let mut pool = worker_pool(&[2, 2], true);
    let (obs, _) = pool.reset(Some(1)).unwrap();
    assert_eq!(obs[DEFAULT_AGENT].shape(), &[2, 1]);
    for _ in 0..3 {
        let step = pool.step(&actions(&[1.0, 3.0])).unwrap();
        assert_eq!(step.rewards[DEFAULT_AGENT].to_vec(), vec![1.0, 3.0]);
    }
    pool.close().unwrap();
}
