//! Checkpoints of a training run.
//!
//! A run directory holds:
//!
//! - `config`: the algorithm hyperparameters as pretty-printed JSON
//! - `extra`: a bincode [`RunExtra`] with the environment description
//! - `<step>/training_state.bin`: one directory per saved step
//!
//! Every file is written to a temporary sibling first and renamed into place,
//! so a crash never leaves a half-written checkpoint behind.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::EnvConfig;
use crate::error::{PallasError, Result};
use crate::train_state::TrainingState;

const CONFIG_FILE: &str = "config";
const EXTRA_FILE: &str = "extra";
const STATE_FILE: &str = "training_state.bin";

/// Run metadata saved next to the checkpoints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunExtra {
    pub env_cfg: EnvConfig,
    pub run_name: String,
    /// Name of the observation preprocessing applied by the caller, if any
    pub preprocess: Option<String>,
}

impl RunExtra {
    pub fn new<S: Into<String>>(env_cfg: EnvConfig, run_name: S) -> Self {
        RunExtra {
            env_cfg,
            run_name: run_name.into(),
            preprocess: None,
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads and writes the checkpoints of one run directory
#[derive(Clone, Debug)]
pub struct Saver {
    dir: PathBuf,
}

impl Saver {
    /// Create the run directory and write its `config` and `extra` files
    pub fn new<P: AsRef<Path>>(dir: P, config: &serde_json::Value, extra: &RunExtra) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?.as_bytes())?;
        write_atomic(&dir.join(EXTRA_FILE), &bincode::serialize(extra)?)?;
        info!("Saving run '{}' to {}", extra.run_name, dir.display());
        Ok(Saver { dir })
    }

    /// Open an existing run directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.join(EXTRA_FILE).is_file() {
            return Err(PallasError::CheckpointNotFound(format!(
                "{} is not a run directory",
                dir.display()
            )));
        }
        Ok(Saver { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, step: usize, state: &TrainingState) -> Result<()> {
        let step_dir = self.dir.join(step.to_string());
        fs::create_dir_all(&step_dir)?;
        write_atomic(&step_dir.join(STATE_FILE), &bincode::serialize(state)?)?;
        debug!("Saved training state at step {}", step);
        Ok(())
    }

    /// Every step with a complete checkpoint, ascending
    pub fn saved_steps(&self) -> Result<Vec<usize>> {
        let mut steps = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let step = match name.to_str().and_then(|s| s.parse::<usize>().ok()) {
                Some(step) => step,
                None => continue,
            };
            if entry.path().join(STATE_FILE).is_file() {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn latest_step(&self) -> Result<Option<usize>> {
        Ok(self.saved_steps()?.last().copied())
    }

    /// Load the state saved at `step`; its structure must match `template`
    pub fn restore(&self, step: usize, template: &TrainingState) -> Result<TrainingState> {
        let path = self.dir.join(step.to_string()).join(STATE_FILE);
        if !path.is_file() {
            return Err(PallasError::CheckpointNotFound(format!("no checkpoint at {}", path.display())));
        }
        let state: TrainingState = bincode::deserialize(&fs::read(&path)?)?;
        if let Err(err) = state.check_matches(template) {
            warn!("Checkpoint at step {} does not fit the algorithm: {}", step, err);
            return Err(err);
        }
        info!("Restored training state from step {}", step);
        Ok(state)
    }

    /// Load the highest-numbered checkpoint
    pub fn restore_latest_step(&self, template: &TrainingState) -> Result<(usize, TrainingState)> {
        let step = self
            .latest_step()?
            .ok_or_else(|| PallasError::CheckpointNotFound(format!("no checkpoints in {}", self.dir.display())))?;
        Ok((step, self.restore(step, template)?))
    }

    pub fn load_extra(&self) -> Result<RunExtra> {
        Ok(bincode::deserialize(&fs::read(self.dir.join(EXTRA_FILE))?)?)
    }

    pub fn load_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&fs::read_to_string(self.dir.join(CONFIG_FILE))?)?)
    }
}

/// Periodic saving during a training loop.
///
/// A negative `save_frequency` disables periodic saves; [`SaverContext::finish`]
/// still writes the final state.
pub struct SaverContext<'a> {
    saver: &'a Saver,
    save_frequency: i64,
    last_saved: Option<usize>,
}

impl<'a> SaverContext<'a> {
    pub fn new(saver: &'a Saver, save_frequency: i64) -> Self {
        SaverContext {
            saver,
            save_frequency,
            last_saved: None,
        }
    }

    /// Save when `step` is on the schedule; the state is built only then
    pub fn update<F: FnOnce() -> TrainingState>(&mut self, step: usize, state: F) -> Result<bool> {
        if self.save_frequency <= 0 || step as i64 % self.save_frequency != 0 {
            return Ok(false);
        }
        self.saver.save(step, &state())?;
        self.last_saved = Some(step);
        Ok(true)
    }

    /// Write the final state unless `step` was just saved
    pub fn finish(self, step: usize, state: &TrainingState) -> Result<()> {
        if self.last_saved == Some(step) {
            return Ok(());
        }
        self.saver.save(step, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Optimizer;
    use crate::params::Params;
    use crate::train_state::TrainState;
    use crate::types::Space;
    use ndarray::arr1;

    fn state(v: f32) -> TrainingState {
        let mut params = Params::new();
        params.insert("w", arr1(&[v, v]).into_dyn());
        TrainingState::new().with("qvalue", TrainState::with_target(params, Optimizer::adam(1e-3)))
    }

    fn saver(dir: &Path) -> Saver {
        let env = EnvConfig::new(Space::uniform_box(-1.0, 1.0, &[2]), Space::Discrete { n: 2 });
        Saver::new(dir, &serde_json::json!({ "seed": 3 }), &RunExtra::new(env, "test")).unwrap()
    }

    #[test]
    fn test_latest_step_ignores_unrelated_entries() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());
        assert_eq!(saver.latest_step().unwrap(), None);
        saver.save(5, &state(1.0)).unwrap();
        saver.save(40, &state(2.0)).unwrap();
        saver.save(100, &state(3.0)).unwrap();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::create_dir_all(dir.path().join("200")).unwrap();
        assert_eq!(saver.saved_steps().unwrap(), vec![5, 40, 100]);
        let (step, restored) = saver.restore_latest_step(&state(0.0)).unwrap();
        assert_eq!(step, 100);
        assert_eq!(restored, state(3.0));
    }

    #[test]
    fn test_restore_errors() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());
        assert!(matches!(
            saver.restore_latest_step(&state(0.0)),
            Err(PallasError::CheckpointNotFound(_))
        ));
        saver.save(1, &state(1.0)).unwrap();
        let other = TrainingState::new().with("policy", state(1.0).get("qvalue").unwrap().clone());
        assert!(matches!(saver.restore(1, &other), Err(PallasError::RestoreMismatch(_))));
    }

    #[test]
    fn test_run_files() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());
        let reopened = Saver::open(dir.path()).unwrap();
        assert_eq!(reopened.load_extra().unwrap().run_name, "test");
        assert_eq!(reopened.load_config().unwrap()["seed"], 3);
        assert!(Saver::open(dir.path().join("missing")).is_err());
        assert_eq!(saver.dir(), dir.path());
    }

    #[test]
    fn test_saver_context_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let saver = saver(dir.path());
        let mut ctx = SaverContext::new(&saver, 3);
        let saved: Vec<bool> = (1..=7).map(|s| ctx.update(s, || state(s as f32)).unwrap()).collect();
        assert_eq!(saved, vec![false, false, true, false, false, true, false]);
        ctx.finish(7, &state(7.0)).unwrap();
        assert_eq!(saver.saved_steps().unwrap(), vec![3, 6, 7]);

        let mut disabled = SaverContext::new(&saver, -1);
        assert!(!disabled.update(9, || state(9.0)).unwrap());
        disabled.finish(9, &state(9.0)).unwrap();
        assert_eq!(saver.latest_step().unwrap(), Some(9));
    }
}
