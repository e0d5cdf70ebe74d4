//! Task registry and data pipeline for image tasks.
//!
//! Data flows through the same stages for every task:
//!
//! ```text
//! InputSource ─► Input ─► InputTransform ─► Model ─► OutputTransform ─► Output
//!   (paths,       (load      (pre-tensor,      (user    (uncollate,        (labels,
//!    tensors,      samples)   to-tensor,        code)    per-sample)        boxes,
//!    FiftyOne)                collate, ...)                                 masks)
//! ```
//!
//! A [`tasks::TaskRegistry`] maps task names (`image_classification`,
//! `object_detection`, ...) to the input transform, output transform and
//! output each task uses by default. A [`data_module::DataModule`] owns the
//! per-stage datasets and hands out [`dataloader::DataLoader`]s.

pub mod collator;
pub mod data_module;
pub mod dataloader;
pub mod dataset;
pub mod error;
pub mod input_transform;
pub mod io;
pub mod minibatch;
pub mod model;
pub mod output_transform;
pub mod readers;
pub mod sample;
pub mod sampler;
pub mod stage;
pub mod tasks;
pub mod transforms;
pub mod utils;
pub mod visualization;

pub use collator::{AdaptiveBatchCollator, Collator, ListCollator, StackCollator};
pub use data_module::{DataModule, DataModuleConfig, StageSources};
pub use error::PipelineError;
pub use input_transform::{InputTransform, StageTransforms, TransformHook};
pub use minibatch::MiniBatch;
pub use model::{Model, Task, TaskHead};
pub use sample::{BoundingBox, DataKey, DataSample, Keypoint, Metadata, Sample, SampleInput, Target};
pub use stage::RunningStage;
pub use tasks::{TaskRegistry, TaskSpec, TaskType};
