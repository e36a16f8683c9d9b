use pallas::algorithms::{Algorithm, Td3, Td3Builder};
use pallas::config::EnvConfig;
use pallas::env::{make_env, ActionKind, EnvSpec};
use pallas::error::PallasError;
use pallas::saver::{RunExtra, Saver};
use pallas::train_state::TrainingState;
use pallas::trainer::train;
use pallas::types::Space;
use pallas::vec_env::SyncVecEnv;

fn env_cfg() -> EnvConfig {
    EnvConfig::new(Space::uniform_box(-1e6, 1e6, &[1]), Space::uniform_box(-1.0, 1.0, &[1]))
}

fn td3(seed: u64, hidden: usize) -> Td3 {
    Td3Builder::new(env_cfg())
        .seed(seed)
        .hidden_sizes(vec![hidden])
        .batch_size(4)
        .start_step(4)
        .n_env_steps(10)
        .save_frequency(5)
        .build()
        .unwrap()
}

fn counter() -> SyncVecEnv {
    let spec = EnvSpec::Counter {
        episode_length: 4,
        action: ActionKind::Continuous,
    };
    SyncVecEnv::from_fn(1, |_| make_env(&spec)).unwrap()
}

fn assert_leafwise_equal(a: &TrainingState, b: &TrainingState) {
    assert_eq!(a.names().collect::<Vec<_>>(), b.names().collect::<Vec<_>>());
    for ((name, x), (_, y)) in a.iter().zip(b.iter()) {
        assert_eq!(x.step, y.step, "{}", name);
        for ((key, p), (_, q)) in x.params.iter().zip(y.params.iter()) {
            assert_eq!(p, q, "{}/{}", name, key);
        }
        let (tx, ty) = (x.target().unwrap(), y.target().unwrap());
        for ((key, p), (_, q)) in tx.iter().zip(ty.iter()) {
            assert_eq!(p, q, "{}/target {}", name, key);
        }
        assert_eq!(x.opt_state, y.opt_state, "{}", name);
    }
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = td3(1, 8);
    let extra = RunExtra::new(algo.env_config().clone(), "round-trip");
    let saver = Saver::new(dir.path(), &algo.config_json().unwrap(), &extra).unwrap();

    train(&mut algo, &mut counter(), Some(&saver), &mut []).unwrap();
    assert_eq!(saver.saved_steps().unwrap(), vec![5, 10]);
    let saved = algo.training_state();

    // A differently seeded instance has different parameters until restored
    let mut other = td3(2, 8);
    assert_ne!(other.training_state(), saved);
    let (step, restored) = saver.restore_latest_step(&other.training_state()).unwrap();
    assert_eq!(step, 10);
    other.set_training_state(restored).unwrap();
    assert_leafwise_equal(&other.training_state(), &saved);

    let reopened = Saver::open(dir.path()).unwrap();
    assert_eq!(reopened.load_extra().unwrap(), extra);
    let config = reopened.load_config().unwrap();
    assert_eq!(config["seed"], 1);
    assert!(config.get("env_cfg").is_none());
}

#[test]
fn test_restore_rejects_other_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let mut algo = td3(1, 8);
    let extra = RunExtra::new(algo.env_config().clone(), "mismatch");
    let saver = Saver::new(dir.path(), &algo.config_json().unwrap(), &extra).unwrap();
    train(&mut algo, &mut counter(), Some(&saver), &mut []).unwrap();

    let wider = td3(1, 16);
    assert!(matches!(
        saver.restore_latest_step(&wider.training_state()),
        Err(PallasError::RestoreMismatch(_))
    ));
}
