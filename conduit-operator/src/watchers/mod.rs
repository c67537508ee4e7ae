//! K8s CR watchers.

mod pipelines;

pub use pipelines::PipelineWatcher;
