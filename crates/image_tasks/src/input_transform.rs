//! Per-stage preprocessing: which transform runs at which point, and which
//! [`Input`] reads which data format.
//!
//! A sample goes through the hooks in this order:
//!
//! ```text
//! DataSample ─ pre_tensor ─► DataSample ─ to_tensor ─► Sample ─ post_tensor ─► Sample
//!            ─ (to device) per_sample_on_device ─► Sample
//! [Sample]   ─ collate ─► MiniBatch ─ per_batch ─► MiniBatch ─ (to device) per_batch_on_device ─► MiniBatch
//! ```

use crate::collator::{Collator, StackCollator};
use crate::error::PipelineError;
use crate::io::input::{Input, InputFormat};
use crate::minibatch::MiniBatch;
use crate::sample::{DataSample, Sample};
use crate::stage::RunningStage;
use crate::transforms::vision::ToTensor;
use crate::transforms::Transform;
use crate::visualization::BaseVisualization;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tch::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformHook {
    PreTensorTransform,
    ToTensorTransform,
    PostTensorTransform,
    Collate,
    PerBatchTransform,
    PerSampleTransformOnDevice,
    PerBatchTransformOnDevice,
}

impl TransformHook {
    pub const ALL: [TransformHook; 7] = [
        TransformHook::PreTensorTransform,
        TransformHook::ToTensorTransform,
        TransformHook::PostTensorTransform,
        TransformHook::Collate,
        TransformHook::PerBatchTransform,
        TransformHook::PerSampleTransformOnDevice,
        TransformHook::PerBatchTransformOnDevice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformHook::PreTensorTransform => "pre_tensor_transform",
            TransformHook::ToTensorTransform => "to_tensor_transform",
            TransformHook::PostTensorTransform => "post_tensor_transform",
            TransformHook::Collate => "collate",
            TransformHook::PerBatchTransform => "per_batch_transform",
            TransformHook::PerSampleTransformOnDevice => "per_sample_transform_on_device",
            TransformHook::PerBatchTransformOnDevice => "per_batch_transform_on_device",
        }
    }
}

impl fmt::Display for TransformHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SampleTransform = Arc<dyn Transform<DataSample, DataSample>>;
pub type TensorizeTransform = Arc<dyn Transform<DataSample, Sample>>;
pub type TensorTransform = Arc<dyn Transform<Sample, Sample>>;
pub type BatchTransform = Arc<dyn Transform<MiniBatch, MiniBatch>>;

/// The transforms of one stage, one optional slot per hook.
#[derive(Clone, Default)]
pub struct StageTransforms {
    pub pre_tensor: Option<SampleTransform>,
    pub to_tensor: Option<TensorizeTransform>,
    pub post_tensor: Option<TensorTransform>,
    pub collate: Option<Arc<dyn Collator>>,
    pub per_batch: Option<BatchTransform>,
    pub per_sample_on_device: Option<TensorTransform>,
    pub per_batch_on_device: Option<BatchTransform>,
}

impl StageTransforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// What every stage falls back to: `ToTensor` and stacking.
    pub fn base() -> Self {
        Self::new()
            .with_to_tensor(ToTensor::new())
            .with_collate(StackCollator)
    }

    pub fn with_pre_tensor(mut self, t: impl Transform<DataSample, DataSample> + 'static) -> Self {
        self.pre_tensor = Some(Arc::new(t));
        self
    }

    pub fn with_to_tensor(mut self, t: impl Transform<DataSample, Sample> + 'static) -> Self {
        self.to_tensor = Some(Arc::new(t));
        self
    }

    pub fn with_post_tensor(mut self, t: impl Transform<Sample, Sample> + 'static) -> Self {
        self.post_tensor = Some(Arc::new(t));
        self
    }

    pub fn with_collate(mut self, c: impl Collator + 'static) -> Self {
        self.collate = Some(Arc::new(c));
        self
    }

    pub fn with_per_batch(mut self, t: impl Transform<MiniBatch, MiniBatch> + 'static) -> Self {
        self.per_batch = Some(Arc::new(t));
        self
    }

    pub fn with_per_sample_on_device(mut self, t: impl Transform<Sample, Sample> + 'static) -> Self {
        self.per_sample_on_device = Some(Arc::new(t));
        self
    }

    pub fn with_per_batch_on_device(mut self, t: impl Transform<MiniBatch, MiniBatch> + 'static) -> Self {
        self.per_batch_on_device = Some(Arc::new(t));
        self
    }

    /// Hooks that have a transform set.
    pub fn hooks(&self) -> Vec<TransformHook> {
        let set = [
            self.pre_tensor.is_some(),
            self.to_tensor.is_some(),
            self.post_tensor.is_some(),
            self.collate.is_some(),
            self.per_batch.is_some(),
            self.per_sample_on_device.is_some(),
            self.per_batch_on_device.is_some(),
        ];
        TransformHook::ALL
            .iter()
            .zip(set)
            .filter_map(|(hook, set)| set.then_some(*hook))
            .collect()
    }

    /// Fills every hook missing here from `defaults`.
    pub fn merge(self, defaults: StageTransforms) -> Self {
        Self {
            pre_tensor: self.pre_tensor.or(defaults.pre_tensor),
            to_tensor: self.to_tensor.or(defaults.to_tensor),
            post_tensor: self.post_tensor.or(defaults.post_tensor),
            collate: self.collate.or(defaults.collate),
            per_batch: self.per_batch.or(defaults.per_batch),
            per_sample_on_device: self.per_sample_on_device.or(defaults.per_sample_on_device),
            per_batch_on_device: self.per_batch_on_device.or(defaults.per_batch_on_device),
        }
    }
}

impl fmt::Debug for StageTransforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageTransforms").field("hooks", &self.hooks()).finish()
    }
}

/// Supplies a task's default transforms.
pub trait TransformProvider: Send + Sync {
    /// The task this provider belongs to; used to rebuild it from state.
    fn name(&self) -> &'static str;

    /// `None` means the stage is not supported.
    fn default_transforms(&self, stage: RunningStage) -> Option<StageTransforms>;

    /// Arguments needed to rebuild this provider.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn check_stage(&self, stage: RunningStage) -> Result<()> {
        if self.default_transforms(stage).is_none() {
            return Err(PipelineError::StageNotSupported {
                task: self.name().to_string(),
                stage,
            }
            .into());
        }
        Ok(())
    }
}

/// A task's preprocessing: default transforms from a provider, user
/// overrides per stage, and the inputs registered per data format.
#[derive(Clone)]
pub struct InputTransform {
    provider: Arc<dyn TransformProvider>,
    overrides: HashMap<RunningStage, StageTransforms>,
    inputs: BTreeMap<InputFormat, Arc<dyn Input>>,
    default_format: Option<InputFormat>,
    visualization: Option<Arc<BaseVisualization>>,
}

impl fmt::Debug for InputTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputTransform")
            .field("provider", &self.provider.name())
            .field("overrides", &self.overrides)
            .field("formats", &self.formats())
            .field("default_format", &self.default_format)
            .finish()
    }
}

impl InputTransform {
    pub fn new(provider: impl TransformProvider + 'static) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<dyn TransformProvider>) -> Self {
        Self {
            provider,
            overrides: HashMap::new(),
            inputs: BTreeMap::new(),
            default_format: None,
            visualization: None,
        }
    }

    pub fn provider(&self) -> &Arc<dyn TransformProvider> {
        &self.provider
    }

    /// Overrides some hooks of one stage. Hooks left unset keep the
    /// provider's defaults.
    pub fn with_transform(mut self, stage: RunningStage, transforms: StageTransforms) -> Result<Self> {
        self.provider.check_stage(stage)?;
        self.overrides.insert(stage, transforms);
        Ok(self)
    }

    /// Registers the input for a format. The first registered format
    /// becomes the default.
    pub fn with_input(mut self, format: InputFormat, input: impl Input + 'static) -> Self {
        self.inputs.insert(format, Arc::new(input));
        self.default_format.get_or_insert(format);
        self
    }

    pub fn with_default_format(mut self, format: InputFormat) -> Result<Self> {
        self.input(format)?;
        self.default_format = Some(format);
        Ok(self)
    }

    pub fn with_visualization(mut self, visualization: Arc<BaseVisualization>) -> Self {
        self.visualization = Some(visualization);
        self
    }

    pub fn visualization(&self) -> Option<&Arc<BaseVisualization>> {
        self.visualization.as_ref()
    }

    pub fn formats(&self) -> Vec<InputFormat> {
        self.inputs.keys().copied().collect()
    }

    pub fn default_format(&self) -> Option<InputFormat> {
        self.default_format
    }

    pub fn input(&self, format: InputFormat) -> Result<Arc<dyn Input>> {
        self.inputs
            .get(&format)
            .cloned()
            .ok_or_else(|| PipelineError::MissingInput { format }.into())
    }

    pub fn default_input(&self) -> Result<Arc<dyn Input>> {
        let format = self
            .default_format
            .context("No input has been registered")?;
        self.input(format)
    }

    /// Resolved transforms for a stage: user override, then the provider's
    /// defaults, then [`StageTransforms::base`].
    pub fn transforms(&self, stage: RunningStage) -> Result<StageTransforms> {
        self.provider.check_stage(stage)?;
        let defaults = self.provider.default_transforms(stage).unwrap_or_default();
        let user = self.overrides.get(&stage).cloned().unwrap_or_default();
        Ok(user.merge(defaults).merge(StageTransforms::base()))
    }

    pub fn pipeline(&self, stage: RunningStage, device: Device) -> Result<StagePipeline> {
        let transforms = self.transforms(stage)?;
        tracing::debug!(stage = %stage, hooks = ?transforms.hooks(), "Built stage pipeline");
        Ok(StagePipeline {
            stage,
            transforms,
            device,
            visualization: self.visualization.clone(),
        })
    }

    /// Everything needed to rebuild this transform through the task registry.
    /// User overrides are code and are listed by hook only.
    pub fn get_state_dict(&self) -> serde_json::Value {
        let overrides: BTreeMap<&str, Vec<&str>> = self
            .overrides
            .iter()
            .map(|(stage, t)| (stage.as_str(), t.hooks().iter().map(TransformHook::as_str).collect()))
            .collect();
        serde_json::json!({
            "task": self.provider.name(),
            "state": self.provider.state(),
            "default_format": self.default_format,
            "formats": self.formats(),
            "overrides": overrides,
        })
    }

    /// Rebuilds an input transform from [`get_state_dict`](Self::get_state_dict)
    /// output.
    pub fn load_state_dict(state: &serde_json::Value, registry: &crate::tasks::TaskRegistry) -> Result<Self> {
        let task = state
            .get("task")
            .and_then(|t| t.as_str())
            .context("State dict has no 'task' entry")?;
        let spec = registry.get(task)?;
        let args = state.get("state").cloned().unwrap_or(serde_json::Value::Null);
        let mut transform = (spec.build_input_transform)(&args)?;
        if let Some(format) = state.get("default_format").filter(|f| !f.is_null()) {
            let format: InputFormat = serde_json::from_value(format.clone())?;
            transform = transform.with_default_format(format)?;
        }
        Ok(transform)
    }
}

/// The resolved transforms of one stage, ready to run on worker threads.
#[derive(Clone)]
pub struct StagePipeline {
    stage: RunningStage,
    transforms: StageTransforms,
    device: Device,
    visualization: Option<Arc<BaseVisualization>>,
}

impl fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagePipeline")
            .field("stage", &self.stage)
            .field("transforms", &self.transforms)
            .field("device", &self.device)
            .finish()
    }
}

fn sample_to_device(sample: Sample, device: Device) -> Sample {
    let features = sample
        .features
        .into_iter()
        .map(|(k, v)| (k, v.to_device(device)))
        .collect();
    Sample {
        features,
        metadata: sample.metadata,
    }
}

impl StagePipeline {
    pub fn new(stage: RunningStage, transforms: StageTransforms, device: Device) -> Self {
        Self {
            stage,
            transforms: transforms.merge(StageTransforms::base()),
            device,
            visualization: None,
        }
    }

    pub fn stage(&self) -> RunningStage {
        self.stage
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn transforms(&self) -> &StageTransforms {
        &self.transforms
    }

    fn report_sample(&self, hook: TransformHook, sample: &Sample) {
        if let Some(vis) = &self.visualization {
            vis.record_sample(self.stage, hook, sample);
        }
    }

    fn report_batch(&self, hook: TransformHook, batch: &MiniBatch) {
        if let Some(vis) = &self.visualization {
            vis.record_batch(self.stage, hook, batch);
        }
    }

    /// Only the pre-tensor hook, e.g. to look at augmented images.
    pub fn pre_tensor(&self, sample: DataSample) -> Result<DataSample> {
        let sample = match &self.transforms.pre_tensor {
            Some(t) => t
                .apply(sample)
                .with_context(|| format!("{} failed ({} stage)", TransformHook::PreTensorTransform, self.stage))?,
            None => sample,
        };
        if let Some(vis) = &self.visualization {
            vis.record_data_sample(self.stage, TransformHook::PreTensorTransform, &sample);
        }
        Ok(sample)
    }

    pub fn process_sample(&self, sample: DataSample) -> Result<Sample> {
        let sample = self.pre_tensor(sample)?;

        let to_tensor = self
            .transforms
            .to_tensor
            .as_ref()
            .context("Stage pipeline has no to-tensor transform")?;
        let sample = to_tensor
            .apply(sample)
            .with_context(|| format!("{} failed ({} stage)", TransformHook::ToTensorTransform, self.stage))?;
        self.report_sample(TransformHook::ToTensorTransform, &sample);

        let sample = match &self.transforms.post_tensor {
            Some(t) => {
                let out = t
                    .apply(sample)
                    .with_context(|| format!("{} failed ({} stage)", TransformHook::PostTensorTransform, self.stage))?;
                self.report_sample(TransformHook::PostTensorTransform, &out);
                out
            }
            None => sample,
        };

        match &self.transforms.per_sample_on_device {
            Some(t) => {
                let out = t
                    .apply(sample_to_device(sample, self.device))
                    .with_context(|| {
                        format!("{} failed ({} stage)", TransformHook::PerSampleTransformOnDevice, self.stage)
                    })?;
                self.report_sample(TransformHook::PerSampleTransformOnDevice, &out);
                Ok(out)
            }
            None => Ok(sample),
        }
    }

    pub fn process_batch(&self, samples: Vec<DataSample>) -> Result<MiniBatch> {
        let samples = samples
            .into_iter()
            .map(|s| self.process_sample(s))
            .collect::<Result<Vec<_>>>()?;

        let collator = self
            .transforms
            .collate
            .as_ref()
            .context("Stage pipeline has no collator")?;
        let batch = MiniBatch::collate(samples, collator.as_ref())
            .with_context(|| format!("{} failed ({} stage)", TransformHook::Collate, self.stage))?;
        self.report_batch(TransformHook::Collate, &batch);

        let batch = match &self.transforms.per_batch {
            Some(t) => {
                let out = t
                    .apply(batch)
                    .with_context(|| format!("{} failed ({} stage)", TransformHook::PerBatchTransform, self.stage))?;
                self.report_batch(TransformHook::PerBatchTransform, &out);
                out
            }
            None => batch,
        };

        let batch = batch.to_device(self.device);
        match &self.transforms.per_batch_on_device {
            Some(t) => {
                let out = t.apply(batch).with_context(|| {
                    format!("{} failed ({} stage)", TransformHook::PerBatchTransformOnDevice, self.stage)
                })?;
                self.report_batch(TransformHook::PerBatchTransformOnDevice, &out);
                Ok(out)
            }
            None => Ok(batch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::input::PassThroughInput;
    use crate::transforms::from_fn;
    use crate::transforms::vision::Resize;
    use image::DynamicImage;
    use tch::Kind;

    struct TrainOnly;

    impl TransformProvider for TrainOnly {
        fn name(&self) -> &'static str {
            "train_only"
        }

        fn default_transforms(&self, stage: RunningStage) -> Option<StageTransforms> {
            match stage {
                RunningStage::Training => Resize::new(4, 4).ok().map(|r| StageTransforms::new().with_pre_tensor(r)),
                RunningStage::Predicting => Some(StageTransforms::new()),
                _ => None,
            }
        }
    }

    fn image_sample(w: u32, h: u32) -> DataSample {
        DataSample::from_image(DynamicImage::new_rgb8(w, h))
    }

    #[test]
    fn test_hook_names() {
        let names: Vec<_> = TransformHook::ALL.iter().map(|h| h.as_str()).collect();
        assert_eq!(names[0], "pre_tensor_transform");
        assert_eq!(names[6], "per_batch_transform_on_device");
    }

    #[test]
    fn test_merge_prefers_user_hooks() {
        let user = StageTransforms::new().with_post_tensor(from_fn(|s: Sample| Ok(s)));
        let merged = user.merge(StageTransforms::base());
        assert_eq!(
            merged.hooks(),
            vec![
                TransformHook::ToTensorTransform,
                TransformHook::PostTensorTransform,
                TransformHook::Collate
            ]
        );
    }

    #[test]
    fn test_unsupported_stage_is_rejected() {
        let transform = InputTransform::new(TrainOnly);
        let err = transform.transforms(RunningStage::Validating).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StageNotSupported { .. })
        ));
        assert!(InputTransform::new(TrainOnly)
            .with_transform(RunningStage::Testing, StageTransforms::new())
            .is_err());
    }

    #[test]
    fn test_inputs_by_format() -> Result<()> {
        let transform = InputTransform::new(TrainOnly).with_input(InputFormat::Datasets, PassThroughInput);
        assert_eq!(transform.default_format(), Some(InputFormat::Datasets));
        assert!(transform.default_input().is_ok());
        let err = transform.input(InputFormat::Coco).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<PipelineError>()),
            Some(PipelineError::MissingInput { format: InputFormat::Coco })
        ));
        Ok(())
    }

    #[test]
    fn test_pipeline_runs_hooks_in_order() -> Result<()> {
        let user = StageTransforms::new()
            .with_post_tensor(from_fn(|mut s: Sample| {
                let input = s.remove("input")?;
                s.insert("input", input + 1.0);
                Ok(s)
            }))
            .with_per_batch(from_fn(|mut b: MiniBatch| {
                let input = b.remove("input")?;
                b.insert("input", input * 2.0);
                Ok(b)
            }));
        let transform = InputTransform::new(TrainOnly).with_transform(RunningStage::Training, user)?;
        let pipeline = transform.pipeline(RunningStage::Training, Device::Cpu)?;

        let batch = pipeline.process_batch(vec![image_sample(8, 6), image_sample(3, 3)])?;
        let input = batch.get("input")?;
        assert_eq!(input.size(), vec![2, 3, 4, 4]);
        // Black pixels: (0 + 1) * 2.
        assert_eq!(input.to_kind(Kind::Float).mean(Kind::Float).double_value(&[]), 2.0);
        Ok(())
    }

    #[test]
    fn test_pipeline_reports_to_visualization() -> Result<()> {
        let vis = Arc::new(BaseVisualization::new());
        let transform = InputTransform::new(TrainOnly).with_visualization(vis.clone());
        let pipeline = transform.pipeline(RunningStage::Training, Device::Cpu)?;
        pipeline.process_batch(vec![image_sample(5, 5)])?;

        let collate = vis.get(RunningStage::Training, TransformHook::Collate);
        assert_eq!(collate.map(|r| r.count), Some(1));
        let pre = vis.get(RunningStage::Training, TransformHook::PreTensorTransform);
        assert_eq!(pre.and_then(|r| r.shapes.get("input").cloned()), Some(vec![3, 4, 4]));
        Ok(())
    }

    #[test]
    fn test_state_dict_lists_overrides() -> Result<()> {
        let transform = InputTransform::new(TrainOnly)
            .with_input(InputFormat::Datasets, PassThroughInput)
            .with_transform(RunningStage::Training, StageTransforms::new().with_collate(StackCollator))?;
        let state = transform.get_state_dict();
        assert_eq!(state["task"], "train_only");
        assert_eq!(state["default_format"], "datasets");
        assert_eq!(state["overrides"]["train"][0], "collate");
        Ok(())
    }
}
