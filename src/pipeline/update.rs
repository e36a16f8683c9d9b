use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PallasError, Result};
use crate::pipeline::experience::{ExperienceTransform, ProcessFn};
use crate::seed::split_seed;

/// Scalar diagnostics reported by update stages
pub type Diagnostics = BTreeMap<String, f32>;

/// Update function: `(state, seed, batch, peers) -> (new state, diagnostics)`
pub type UpdateFn<S, B> = Arc<dyn Fn(&S, u64, &B, &ModuleStates<'_, S>) -> Result<(S, Diagnostics)> + Send + Sync>;

/// A named state paired with the pure function that updates it
pub struct UpdateModule<S, B> {
    pub name: String,
    pub state: S,
    update_fn: UpdateFn<S, B>,
}

impl<S: Clone, B> Clone for UpdateModule<S, B> {
    fn clone(&self) -> Self {
        UpdateModule {
            name: self.name.clone(),
            state: self.state.clone(),
            update_fn: Arc::clone(&self.update_fn),
        }
    }
}

impl<S, B> UpdateModule<S, B> {
    pub fn new<N: Into<String>>(name: N, state: S, update_fn: UpdateFn<S, B>) -> Self {
        UpdateModule {
            name: name.into(),
            state,
            update_fn,
        }
    }

    pub fn from_fn<N, F>(name: N, state: S, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(&S, u64, &B, &ModuleStates<'_, S>) -> Result<(S, Diagnostics)> + Send + Sync + 'static,
    {
        UpdateModule::new(name, state, Arc::new(f))
    }
}

/// Read-only view of the current state of every module in a pipeline.
///
/// Modules earlier in the pipeline have already been updated in the current pass.
pub struct ModuleStates<'a, S> {
    modules: Vec<(&'a str, &'a S)>,
}

impl<'a, S> ModuleStates<'a, S> {
    pub fn get(&self, name: &str) -> Result<&'a S> {
        self.modules
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| PallasError::TrainingError(format!("no update module named '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.modules.iter().map(|(n, _)| *n)
    }
}

/// Apply every module in order to the same batch.
///
/// Each module gets its own sub-seed split from `seed`. Diagnostics are merged,
/// later modules overriding earlier keys. The caller's modules are never
/// modified: on error they still hold the pre-update states.
pub fn update_pipeline<S: Clone, B>(
    modules: &[UpdateModule<S, B>],
    seed: u64,
    batch: &B,
) -> Result<(Vec<UpdateModule<S, B>>, Diagnostics)> {
    let mut updated: Vec<UpdateModule<S, B>> = modules.to_vec();
    let seeds = split_seed(seed, modules.len());
    let mut diagnostics = Diagnostics::new();

    for (i, module_seed) in seeds.into_iter().enumerate() {
        let (state, info) = {
            let peers = ModuleStates {
                modules: updated.iter().map(|m| (m.name.as_str(), &m.state)).collect(),
            };
            let module = &updated[i];
            (module.update_fn)(&module.state, module_seed, batch, &peers)?
        };
        updated[i].state = state;
        diagnostics.extend(info);
    }

    Ok((updated, diagnostics))
}

/// One state shared by an experience transform and an update module
pub struct PipelineModule<S, E, B> {
    pub name: String,
    pub state: S,
    process_fn: ProcessFn<S, E>,
    update_fn: UpdateFn<S, B>,
}

impl<S: Clone, E, B> PipelineModule<S, E, B> {
    pub fn new<N: Into<String>>(name: N, state: S, process_fn: ProcessFn<S, E>, update_fn: UpdateFn<S, B>) -> Self {
        PipelineModule {
            name: name.into(),
            state,
            process_fn,
            update_fn,
        }
    }

    pub fn experience_transform(&self) -> ExperienceTransform<S, E> {
        ExperienceTransform::new(self.state.clone(), Arc::clone(&self.process_fn))
    }

    pub fn update_module(&self) -> UpdateModule<S, B> {
        UpdateModule::new(self.name.clone(), self.state.clone(), Arc::clone(&self.update_fn))
    }

    /// Take the state produced by an update pass
    pub fn with_state(&self, state: S) -> Self {
        PipelineModule {
            name: self.name.clone(),
            state,
            process_fn: Arc::clone(&self.process_fn),
            update_fn: Arc::clone(&self.update_fn),
        }
    }
}
