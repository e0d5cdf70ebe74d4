use std::path::PathBuf;

use crate::io::input::InputFormat;
use crate::stage::RunningStage;

/// Failures callers may want to match on. Everything else is reported as a
/// plain `anyhow::Error` with context.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("File: {} has an unsupported extension. Supported extensions: {supported:?}.", path.display())]
    UnsupportedExtension {
        path: PathBuf,
        supported: Vec<String>,
    },

    #[error("The `{task}` task does not support the {stage} stage.")]
    StageNotSupported { task: String, stage: RunningStage },

    #[error("Input produced an iterable data source. Use `IterableInput` instead.")]
    IterableDataInSizedInput,

    #[error("IterableInput produced sized data. Use `Input` instead.")]
    SizedDataInIterableInput,

    #[error("No input registered for the {format:?} format")]
    MissingInput { format: InputFormat },

    #[error("Unknown task `{0}`")]
    UnknownTask(String),

    #[error("Task `{0}` is already registered")]
    DuplicateTask(String),

    #[error("Feature '{0}' not found")]
    MissingFeature(String),
}
