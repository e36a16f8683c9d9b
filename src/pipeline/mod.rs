//! Experience and update pipelines.
//!
//! An algorithm describes its learning step as two declarative lists:
//!
//! - [`ExperienceTransform`]s turn sampled records into a processed batch
//!   (regression targets, advantages, ...). The same stage function serves
//!   single environments, vectorized environments and multi-agent data: the
//!   pipeline splits the batch into independent seeded slices, maps them in
//!   parallel and flattens the results.
//! - [`UpdateModule`]s consume the processed batch in order, each returning a
//!   new state plus scalar diagnostics.

pub mod experience;
pub mod update;

pub use experience::{process_experience_pipeline, process_records, ExperienceTransform, ProcessFn, ShapeRegime};
pub use update::{update_pipeline, Diagnostics, ModuleStates, PipelineModule, UpdateFn, UpdateModule};
