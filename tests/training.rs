use pallas::algorithms::{A2cBuilder, Algorithm, DqnBuilder, SacBuilder, Td3Builder};
use pallas::config::EnvConfig;
use pallas::env::{make_env, ActionKind, EnvSpec};
use pallas::saver::{RunExtra, Saver};
use pallas::trainer::{evaluate, resume, train, TrainReport};
use pallas::types::Space;
use pallas::vec_env::{SyncVecEnv, VecEnv, VecEnvPool};

fn observation_space() -> Space {
    Space::uniform_box(-1e6, 1e6, &[1])
}

fn counters(n_envs: usize, action: ActionKind) -> SyncVecEnv {
    let spec = EnvSpec::Counter {
        episode_length: 5,
        action,
    };
    SyncVecEnv::from_fn(n_envs, |_| make_env(&spec)).unwrap()
}

fn assert_trained(report: &TrainReport, steps: usize, n_envs: usize) {
    assert_eq!(report.final_step, steps);
    assert_eq!(report.metrics.episodes, steps / 5 * n_envs);
    assert_eq!(report.metrics.mean_length, Some(5.0));
    assert!(report.metrics.updates > 0);
    let diagnostics = report.last_diagnostics.as_ref().unwrap();
    assert!(diagnostics.values().all(|v| v.is_finite()), "{:?}", diagnostics);
}

#[test]
fn test_dqn_on_thread_pool() {
    let env_cfg = EnvConfig::new(observation_space(), Space::Discrete { n: 2 }).with_counts(3, 1);
    let mut dqn = DqnBuilder::new(env_cfg).batch_size(8).n_env_steps(30).build().unwrap();
    let spec = EnvSpec::Counter {
        episode_length: 5,
        action: ActionKind::Discrete { n: 2 },
    };
    let mut pool = VecEnvPool::spawn_threads(3, |_| make_env(&spec)).unwrap();
    let report = train(&mut dqn, &mut pool, None, &mut []).unwrap();
    assert_trained(&report, 30, 3);
    assert_eq!(report.metrics.updates, 23);

    let eval = evaluate(&mut dqn, &mut pool, 4).unwrap();
    assert_eq!(eval.episode_lengths, vec![5; 4]);
    pool.close().unwrap();
}

#[test]
fn test_dqn_multi_agent() {
    let env_cfg = EnvConfig::new(observation_space(), Space::Discrete { n: 3 }).with_counts(2, 2);
    let mut dqn = DqnBuilder::new(env_cfg).batch_size(4).n_env_steps(20).build().unwrap();
    let spec = EnvSpec::MultiCounter {
        n_agents: 2,
        episode_length: 5,
        action: ActionKind::Discrete { n: 3 },
    };
    let mut env = SyncVecEnv::from_fn(2, |_| make_env(&spec)).unwrap();
    let report = train(&mut dqn, &mut env, None, &mut []).unwrap();
    assert_trained(&report, 20, 2);
}

#[test]
fn test_td3_and_sac_on_continuous_counter() {
    let env_cfg = EnvConfig::new(observation_space(), Space::uniform_box(-1.0, 1.0, &[1])).with_counts(2, 1);

    let mut td3 = Td3Builder::new(env_cfg.clone())
        .batch_size(8)
        .start_step(5)
        .n_env_steps(20)
        .build()
        .unwrap();
    let report = train(&mut td3, &mut counters(2, ActionKind::Continuous), None, &mut []).unwrap();
    assert_trained(&report, 20, 2);
    // 13 critic updates, the policy follows every second one
    let state = td3.training_state();
    assert_eq!(state.get("qvalue").unwrap().step, 13);
    assert_eq!(state.get("policy").unwrap().step, 6);

    let mut sac = SacBuilder::new(env_cfg)
        .batch_size(8)
        .start_step(5)
        .n_env_steps(20)
        .build()
        .unwrap();
    let report = train(&mut sac, &mut counters(2, ActionKind::Continuous), None, &mut []).unwrap();
    assert_trained(&report, 20, 2);
    assert!(sac.alpha().unwrap() > 0.0);
}

#[test]
fn test_a2c_discrete_and_continuous() {
    let discrete = EnvConfig::new(observation_space(), Space::Discrete { n: 2 }).with_counts(2, 1);
    let mut a2c = A2cBuilder::new(discrete)
        .buffer_size(10)
        .batch_size(5)
        .n_env_steps(30)
        .build()
        .unwrap();
    let report = train(&mut a2c, &mut counters(2, ActionKind::Discrete { n: 2 }), None, &mut []).unwrap();
    assert_trained(&report, 30, 2);
    assert_eq!(report.metrics.updates, 3);

    let continuous = EnvConfig::new(observation_space(), Space::uniform_box(-1.0, 1.0, &[1]));
    let mut a2c = A2cBuilder::new(continuous)
        .buffer_size(10)
        .batch_size(5)
        .n_env_steps(20)
        .entropy_coef(0.01)
        .build()
        .unwrap();
    let report = train(&mut a2c, &mut counters(1, ActionKind::Continuous), None, &mut []).unwrap();
    assert_trained(&report, 20, 1);
    assert_eq!(a2c.name(), "a2c");
}

#[test]
fn test_resume_continues_after_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let env_cfg = EnvConfig::new(observation_space(), Space::Discrete { n: 2 });
    let build = |steps: usize| {
        DqnBuilder::new(env_cfg.clone())
            .batch_size(4)
            .n_env_steps(steps)
            .save_frequency(-1)
            .build()
            .unwrap()
    };

    let mut first = build(10);
    let saver = Saver::new(
        dir.path(),
        &first.config_json().unwrap(),
        &RunExtra::new(env_cfg.clone(), "resume"),
    )
    .unwrap();
    train(&mut first, &mut counters(1, ActionKind::Discrete { n: 2 }), Some(&saver), &mut []).unwrap();
    assert_eq!(saver.saved_steps().unwrap(), vec![10]);

    let mut second = build(25);
    let report = resume(&mut second, &mut counters(1, ActionKind::Discrete { n: 2 }), &saver, &mut []).unwrap();
    assert_eq!(report.start_step, 10);
    assert_eq!(report.final_step, 25);
    assert_eq!(report.metrics.episodes, 3);
    assert_eq!(saver.latest_step().unwrap(), Some(25));
}
