pub mod tracker;

pub use tracker::{MetricsSummary, MetricsTracker, TrainingMetrics};
