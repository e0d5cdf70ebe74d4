//! Keypoint detection from COCO `keypoints` annotations.

use crate::collator::ListCollator;
use crate::data_module::{DataModule, DataModuleConfig};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::coco::{CocoInput, CocoTargetKind};
use crate::io::image::ImagePathsInput;
use crate::io::input::InputFormat;
use crate::io::output::{KeypointsOutput, Output};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::sample::{DataSample, Target};
use crate::stage::RunningStage;
use crate::tasks::{parse_args, resize_transforms, to_state, StageCoco, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::ToTensor;
use crate::transforms::{Sequential, Transform};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "keypoint_detection";
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (128, 128);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeypointDetectionArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
    /// Keypoints per object. When set, samples with a different count fail.
    pub num_keypoints: Option<usize>,
}

/// Rejects objects whose keypoint count differs from the expected one.
#[derive(Debug, Clone, Copy)]
pub struct CheckKeypointCount {
    expected: usize,
}

impl CheckKeypointCount {
    pub fn new(expected: usize) -> Self {
        Self { expected }
    }
}

impl Transform<DataSample, DataSample> for CheckKeypointCount {
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        if let Some(Target::Keypoints { keypoints, .. }) = &sample.target {
            for (object, points) in keypoints.iter().enumerate() {
                ensure!(
                    points.len() == self.expected,
                    "Object {} has {} keypoints, expected {}",
                    object,
                    points.len(),
                    self.expected
                );
            }
        }
        Ok(sample)
    }
}

pub struct KeypointDetectionInputTransform {
    args: KeypointDetectionArgs,
    train: StageTransforms,
    eval: StageTransforms,
}

impl KeypointDetectionInputTransform {
    pub fn new(args: KeypointDetectionArgs) -> Result<Self> {
        args.transform.validate()?;
        if let Some(n) = args.num_keypoints {
            ensure!(n > 0, "num_keypoints must be greater than 0");
        }
        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let normalize = args.transform.normalize()?;
        let train = resize_transforms(size, Some(args.transform.flip_prob), ToTensor::new(), normalize.clone())?;
        let eval = resize_transforms(size, None, ToTensor::new(), normalize)?;
        Ok(Self {
            train: Self::finish(train, args.num_keypoints),
            eval: Self::finish(eval, args.num_keypoints),
            args,
        })
    }

    fn finish(mut transforms: StageTransforms, num_keypoints: Option<usize>) -> StageTransforms {
        if let (Some(n), Some(pre_tensor)) = (num_keypoints, transforms.pre_tensor.take()) {
            transforms = transforms.with_pre_tensor(
                Sequential::<DataSample>::new()
                    .push(CheckKeypointCount::new(n))
                    .push(pre_tensor),
            );
        }
        transforms.with_collate(ListCollator::default())
    }
}

impl TransformProvider for KeypointDetectionInputTransform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_transforms(&self, stage: RunningStage) -> Option<StageTransforms> {
        Some(match stage {
            RunningStage::Training => self.train.clone(),
            _ => self.eval.clone(),
        })
    }

    fn state(&self) -> serde_json::Value {
        to_state(&self.args)
    }
}

pub fn input_transform(args: KeypointDetectionArgs) -> Result<InputTransform> {
    Ok(InputTransform::new(KeypointDetectionInputTransform::new(args)?)
        .with_input(InputFormat::Coco, CocoInput::new(CocoTargetKind::Keypoints))
        .with_input(InputFormat::Files, ImagePathsInput))
}

pub fn from_coco(stages: StageCoco, args: KeypointDetectionArgs, config: DataModuleConfig) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Coco,
        stages.into_sources(),
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::KeypointDetection.description().to_string(),
        formats: vec![InputFormat::Coco, InputFormat::Files],
        default_format: InputFormat::Coco,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.num_keypoints".to_string(), serde_json::json!(1)),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |_, _| -> Result<Arc<dyn Output>> { Ok(Arc::new(KeypointsOutput)) },
    }
}
