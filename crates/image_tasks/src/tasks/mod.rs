//! Built-in image tasks and the registry that finds them by name.
//!
//! ```text
//! src/tasks/
//! ├── mod.rs                     # TaskType, TaskSpec, TaskRegistry, TransformConfig
//! ├── image_classification.rs    # 196x196, flip + ImageNet normalize
//! ├── object_detection.rs        # 128x128, box-aware resize, ListCollator
//! ├── keypoint_detection.rs      # 128x128, COCO keypoints
//! ├── instance_segmentation.rs   # 128x128, COCO polygons → masks
//! ├── semantic_segmentation.rs   # 128x160, paired image/mask folders
//! ├── image_embedding.rs         # 196x196, no targets
//! ├── style_transfer.rs          # 256x256, train and predict only
//! └── face_detection.rs          # 128x128, adaptive batching
//! ```
//!
//! Each task module exposes its `TransformProvider`, an `input_transform`
//! constructor taking JSON-compatible arguments, `from_*` data module
//! helpers and `spec()` for the registry.

pub mod face_detection;
pub mod image_classification;
pub mod image_embedding;
pub mod instance_segmentation;
pub mod keypoint_detection;
pub mod object_detection;
pub mod semantic_segmentation;
pub mod style_transfer;

use crate::data_module::{DataModule, DataModuleConfig, StageSources};
use crate::error::PipelineError;
use crate::input_transform::{InputTransform, StageTransforms};
use crate::io::image::{ImageNumpyInput, ImagePathsInput, ImageTensorInput};
use crate::io::input::{InputFormat, InputSource};
use crate::io::output::Output;
use crate::output_transform::OutputTransform;
use crate::sample::DataSample;
use crate::transforms::vision::{EnsureRGB, Normalize, RandomHorizontalFlip, Resize, ToTensor};
use crate::transforms::Sequential;
use anyhow::{ensure, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// The built-in tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ImageClassification,
    ObjectDetection,
    KeypointDetection,
    InstanceSegmentation,
    SemanticSegmentation,
    ImageEmbedding,
    StyleTransfer,
    FaceDetection,
}

impl TaskType {
    pub const ALL: [TaskType; 8] = [
        TaskType::ImageClassification,
        TaskType::ObjectDetection,
        TaskType::KeypointDetection,
        TaskType::InstanceSegmentation,
        TaskType::SemanticSegmentation,
        TaskType::ImageEmbedding,
        TaskType::StyleTransfer,
        TaskType::FaceDetection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskType::ImageClassification => image_classification::NAME,
            TaskType::ObjectDetection => object_detection::NAME,
            TaskType::KeypointDetection => keypoint_detection::NAME,
            TaskType::InstanceSegmentation => instance_segmentation::NAME,
            TaskType::SemanticSegmentation => semantic_segmentation::NAME,
            TaskType::ImageEmbedding => image_embedding::NAME,
            TaskType::StyleTransfer => style_transfer::NAME,
            TaskType::FaceDetection => face_detection::NAME,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskType::ImageClassification => "Classify images into one or more classes.",
            TaskType::ObjectDetection => "Detect objects in images with bounding boxes.",
            TaskType::KeypointDetection => "Detect keypoints in images.",
            TaskType::InstanceSegmentation => "Segment every object instance in images.",
            TaskType::SemanticSegmentation => "Label every pixel of an image with a class.",
            TaskType::ImageEmbedding => "Embed images into a vector space.",
            TaskType::StyleTransfer => "Transfer the style of one image onto others.",
            TaskType::FaceDetection => "Detect faces in images.",
        }
    }

    pub fn spec(&self) -> TaskSpec {
        match self {
            TaskType::ImageClassification => image_classification::spec(),
            TaskType::ObjectDetection => object_detection::spec(),
            TaskType::KeypointDetection => keypoint_detection::spec(),
            TaskType::InstanceSegmentation => instance_segmentation::spec(),
            TaskType::SemanticSegmentation => semantic_segmentation::spec(),
            TaskType::ImageEmbedding => image_embedding::spec(),
            TaskType::StyleTransfer => style_transfer::spec(),
            TaskType::FaceDetection => face_detection::spec(),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type InputTransformBuilder = fn(&serde_json::Value) -> Result<InputTransform>;
pub type OutputTransformBuilder = fn() -> Arc<dyn OutputTransform>;
/// Builds the default output from task arguments and the class names, if known.
pub type OutputBuilder = fn(&serde_json::Value, Option<&[String]>) -> Result<Arc<dyn Output>>;

/// Everything the registry knows about a task.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    pub formats: Vec<InputFormat>,
    pub default_format: InputFormat,
    /// Dotted keys, e.g. `model.num_keypoints`.
    pub default_arguments: BTreeMap<String, serde_json::Value>,
    pub build_input_transform: InputTransformBuilder,
    pub build_output_transform: OutputTransformBuilder,
    pub build_output: OutputBuilder,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("formats", &self.formats)
            .field("default_format", &self.default_format)
            .field("default_arguments", &self.default_arguments)
            .finish()
    }
}

impl TaskSpec {
    /// Arguments under `prefix.` with the prefix stripped, as a JSON object.
    /// `input_transform` arguments are what `build_input_transform` takes.
    pub fn arguments(&self, prefix: &str) -> serde_json::Value {
        let prefix = format!("{}.", prefix);
        let map: serde_json::Map<String, serde_json::Value> = self
            .default_arguments
            .iter()
            .filter_map(|(key, value)| Some((key.strip_prefix(&prefix)?.to_string(), value.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Task specs by name.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in task.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for task in TaskType::ALL {
            // Built-in names are distinct.
            let _ = registry.register(task.spec());
        }
        registry
    }

    pub fn register(&mut self, spec: TaskSpec) -> Result<()> {
        if self.tasks.contains_key(&spec.name) {
            return Err(PipelineError::DuplicateTask(spec.name).into());
        }
        tracing::debug!(task = %spec.name, "Registered task");
        self.tasks.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TaskSpec> {
        self.tasks
            .get(name)
            .ok_or_else(|| PipelineError::UnknownTask(name.to_string()).into())
    }

    /// Sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.values()
    }
}

/// Transform settings shared by the tasks. Unset fields fall back to the
/// task's defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// `[height, width]`.
    pub image_size: Option<[u32; 2]>,
    pub mean: Option<Vec<f32>>,
    pub std: Option<Vec<f32>>,
    /// Horizontal flip probability during training.
    pub flip_prob: f64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            image_size: None,
            mean: None,
            std: None,
            flip_prob: 0.5,
        }
    }
}

impl TransformConfig {
    pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
        self.image_size = Some([height, width]);
        self
    }

    /// `(height, width)`.
    pub fn image_size_or(&self, default: (u32, u32)) -> (u32, u32) {
        self.image_size.map_or(default, |[h, w]| (h, w))
    }

    /// The configured normalization; `None` when neither mean nor std is set.
    pub fn normalize(&self) -> Result<Option<Normalize>> {
        match (&self.mean, &self.std) {
            (Some(mean), Some(std)) => Ok(Some(Normalize::new(mean, std)?)),
            (None, None) => Ok(None),
            _ => anyhow::bail!("Normalization needs both mean and std"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.flip_prob),
            "flip_prob must be in [0, 1], got {}",
            self.flip_prob
        );
        if let Some([h, w]) = self.image_size {
            ensure!(h > 0 && w > 0, "image_size must be positive, got {}x{}", h, w);
        }
        self.normalize().map(|_| ())
    }
}

/// Reads task arguments; `null` gives the defaults.
pub(crate) fn parse_args<T: DeserializeOwned + Default>(args: &serde_json::Value) -> Result<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args.clone()).context("Invalid task arguments")
}

pub(crate) fn to_state<T: Serialize>(args: &T) -> serde_json::Value {
    serde_json::to_value(args).unwrap_or(serde_json::Value::Null)
}

/// One path per stage: image folders, or label files for FiftyOne.
#[derive(Debug, Clone, Default)]
pub struct StagePaths {
    pub train: Option<PathBuf>,
    pub val: Option<PathBuf>,
    pub test: Option<PathBuf>,
    pub predict: Option<PathBuf>,
}

impl StagePaths {
    fn map(self, f: impl Fn(PathBuf) -> InputSource) -> StageSources {
        StageSources {
            train: self.train.map(&f),
            val: self.val.map(&f),
            test: self.test.map(&f),
            predict: self.predict.map(&f),
        }
    }

    pub fn into_folder_sources(self) -> StageSources {
        self.map(InputSource::Folder)
    }

    pub fn into_fiftyone_sources(self, label_field: &str) -> StageSources {
        self.map(|path| InputSource::FiftyOne {
            path,
            label_field: label_field.to_string(),
        })
    }
}

/// Registers the plain image inputs: files, folders, numpy and tensors.
pub(crate) fn with_image_inputs(transform: InputTransform) -> InputTransform {
    transform
        .with_input(InputFormat::Files, ImagePathsInput)
        .with_input(InputFormat::Folders, ImagePathsInput)
        .with_input(InputFormat::Numpy, ImageNumpyInput)
        .with_input(InputFormat::Tensors, ImageTensorInput)
}

/// A COCO annotation file and the folder its `file_name`s are relative to.
#[derive(Debug, Clone)]
pub struct CocoPaths {
    pub images_dir: PathBuf,
    pub annotations: PathBuf,
}

/// COCO annotations for the labelled stages, a plain folder for predict.
#[derive(Debug, Clone, Default)]
pub struct StageCoco {
    pub train: Option<CocoPaths>,
    pub val: Option<CocoPaths>,
    pub test: Option<CocoPaths>,
    pub predict_folder: Option<PathBuf>,
}

impl StageCoco {
    pub fn into_sources(self) -> StageSources {
        let coco = |paths: CocoPaths| InputSource::Coco {
            images_dir: paths.images_dir,
            annotations: paths.annotations,
        };
        StageSources {
            train: self.train.map(coco),
            val: self.val.map(coco),
            test: self.test.map(coco),
            predict: self.predict_folder.map(InputSource::Folder),
        }
    }
}

/// `EnsureRGB → Resize → RandomHorizontalFlip` before tensors, then
/// `ToTensor` and the optional normalization. No flip when `flip_prob` is
/// `None`.
pub(crate) fn resize_transforms(
    (height, width): (u32, u32),
    flip_prob: Option<f64>,
    to_tensor: ToTensor,
    normalize: Option<Normalize>,
) -> Result<StageTransforms> {
    let mut pre_tensor = Sequential::<DataSample>::new()
        .push(EnsureRGB)
        .push(Resize::new(height, width)?);
    if let Some(p) = flip_prob {
        pre_tensor = pre_tensor.push(RandomHorizontalFlip::new(p)?);
    }
    let transforms = StageTransforms::new()
        .with_pre_tensor(pre_tensor)
        .with_to_tensor(to_tensor);
    Ok(match normalize {
        Some(normalize) => transforms.with_post_tensor(normalize),
        None => transforms,
    })
}

/// Builds a data module through the registry entry for `task`.
pub fn data_module(
    spec: &TaskSpec,
    args: &serde_json::Value,
    format: InputFormat,
    sources: StageSources,
    config: DataModuleConfig,
) -> Result<DataModule> {
    let input_transform = (spec.build_input_transform)(args)
        .with_context(|| format!("Failed to build the {} input transform", spec.name))?;
    DataModule::from_input(
        input_transform,
        (spec.build_output_transform)(),
        format,
        sources,
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_transform::{StageTransforms, TransformProvider};
    use crate::io::output::EmbeddingOutput;
    use crate::output_transform::DefaultOutputTransform;
    use crate::stage::RunningStage;

    struct Custom;

    impl TransformProvider for Custom {
        fn name(&self) -> &'static str {
            "custom"
        }

        fn default_transforms(&self, _stage: RunningStage) -> Option<StageTransforms> {
            Some(StageTransforms::new())
        }
    }

    fn custom_spec() -> TaskSpec {
        TaskSpec {
            name: "custom".into(),
            description: "A custom task".into(),
            formats: vec![InputFormat::Files],
            default_format: InputFormat::Files,
            default_arguments: BTreeMap::new(),
            build_input_transform: |_| {
                Ok(InputTransform::new(Custom).with_input(InputFormat::Files, crate::io::image::ImagePathsInput))
            },
            build_output_transform: || Arc::new(DefaultOutputTransform),
            build_output: |_, _| Ok(Arc::new(EmbeddingOutput)),
        }
    }

    #[test]
    fn test_defaults_are_sorted() {
        let registry = TaskRegistry::with_defaults();
        let names = registry.names();
        assert_eq!(names.len(), 8);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"face_detection"));
    }

    #[test]
    fn test_register_and_lookup_errors() -> Result<()> {
        let mut registry = TaskRegistry::with_defaults();
        registry.register(custom_spec())?;
        assert_eq!(registry.get("custom")?.description, "A custom task");

        let duplicate = registry.register(custom_spec()).err();
        assert!(matches!(
            duplicate.as_ref().and_then(|e| e.downcast_ref::<PipelineError>()),
            Some(PipelineError::DuplicateTask(_))
        ));
        let unknown = registry.get("nope").err();
        assert!(matches!(
            unknown.as_ref().and_then(|e| e.downcast_ref::<PipelineError>()),
            Some(PipelineError::UnknownTask(_))
        ));
        Ok(())
    }

    #[test]
    fn test_every_builtin_builds() -> Result<()> {
        for task in TaskType::ALL {
            let spec = task.spec();
            assert_eq!(spec.name, task.name());
            let transform = (spec.build_input_transform)(&spec.arguments("input_transform"))?;
            assert_eq!(transform.default_format(), Some(spec.default_format));
            for format in &spec.formats {
                transform.input(*format)?;
            }
            (spec.build_output)(&serde_json::Value::Null, None)?;
        }
        Ok(())
    }

    #[test]
    fn test_state_dict_rebuilds_through_registry() -> Result<()> {
        let registry = TaskRegistry::with_defaults();
        let args = serde_json::json!({"image_size": [32, 48], "multi_label": true, "num_classes": 3});
        let transform = (registry.get("image_classification")?.build_input_transform)(&args)?;
        let state = transform.get_state_dict();
        let rebuilt = InputTransform::load_state_dict(&state, &registry)?;
        assert_eq!(rebuilt.get_state_dict(), state);
        assert_eq!(state["state"]["image_size"], serde_json::json!([32, 48]));
        Ok(())
    }

    #[test]
    fn test_transform_config() -> Result<()> {
        let config: TransformConfig = toml::from_str("image_size = [64, 32]\nmean = [0.5]\nstd = [0.5]")?;
        assert_eq!(config.image_size_or((1, 1)), (64, 32));
        assert!(config.normalize()?.is_some());
        assert_eq!(config.flip_prob, 0.5);

        let half = TransformConfig {
            mean: Some(vec![0.5]),
            ..Default::default()
        };
        assert!(half.validate().is_err());
        Ok(())
    }
}
