//! Bounding box detection.

use crate::collator::ListCollator;
use crate::data_module::{DataModule, DataModuleConfig};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::coco::{CocoInput, CocoTargetKind};
use crate::io::image::{ImageFiftyOneInput, ImagePathsInput};
use crate::io::input::InputFormat;
use crate::io::output::{DetectionLabelsOutput, Output};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::stage::RunningStage;
use crate::tasks::{parse_args, resize_transforms, to_state, StageCoco, StagePaths, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::ToTensor;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "object_detection";
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (128, 128);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDetectionArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
    /// Detections scoring below this are dropped from the output.
    pub threshold: f32,
}

impl Default for ObjectDetectionArgs {
    fn default() -> Self {
        Self {
            transform: TransformConfig::default(),
            threshold: 0.5,
        }
    }
}

/// Box-aware resize (and flip when training), to-tensor, and a
/// [`ListCollator`] so every image keeps its own number of boxes.
pub struct ObjectDetectionInputTransform {
    args: ObjectDetectionArgs,
    train: StageTransforms,
    eval: StageTransforms,
}

impl ObjectDetectionInputTransform {
    pub fn new(args: ObjectDetectionArgs) -> Result<Self> {
        args.transform.validate()?;
        ensure!(
            (0.0..=1.0).contains(&args.threshold),
            "threshold must be in [0, 1], got {}",
            args.threshold
        );
        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let normalize = args.transform.normalize()?;
        let train = resize_transforms(size, Some(args.transform.flip_prob), ToTensor::new(), normalize.clone())?
            .with_collate(ListCollator::default());
        let eval = resize_transforms(size, None, ToTensor::new(), normalize)?.with_collate(ListCollator::default());
        Ok(Self { args, train, eval })
    }
}

impl TransformProvider for ObjectDetectionInputTransform {
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

pub fn input_transform(args: ObjectDetectionArgs) -> Result<InputTransform> {
    Ok(InputTransform::new(ObjectDetectionInputTransform::new(args)?)
        .with_input(InputFormat::Coco, CocoInput::new(CocoTargetKind::Detection))
        .with_input(InputFormat::Files, ImagePathsInput)
        .with_input(InputFormat::Folders, ImagePathsInput)
        .with_input(InputFormat::FiftyOne, ImageFiftyOneInput))
}

pub fn from_coco(stages: StageCoco, args: ObjectDetectionArgs, config: DataModuleConfig) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Coco,
        stages.into_sources(),
        config,
    )
}

/// FiftyOne exports with `Detections` labels.
pub fn from_fiftyone(
    files: StagePaths,
    label_field: &str,
    args: ObjectDetectionArgs,
    config: DataModuleConfig,
) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::FiftyOne,
        files.into_fiftyone_sources(label_field),
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::ObjectDetection.description().to_string(),
        formats: vec![
            InputFormat::Coco,
            InputFormat::Files,
            InputFormat::Folders,
            InputFormat::FiftyOne,
        ],
        default_format: InputFormat::Coco,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.num_classes".to_string(), serde_json::json!(2)),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |args, labels| -> Result<Arc<dyn Output>> {
            let args: ObjectDetectionArgs = parse_args(args)?;
            Ok(Arc::new(DetectionLabelsOutput {
                labels: labels.map(<[String]>::to_vec),
                threshold: args.threshold,
            }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{keys, BoundingBox, DataSample, Target};
    use image::DynamicImage;
    use tch::Device;

    #[test]
    fn test_boxes_follow_resize_and_stay_ragged() -> Result<()> {
        let transform = input_transform(ObjectDetectionArgs::default())?;
        let pipeline = transform.pipeline(RunningStage::Validating, Device::Cpu)?;
        let samples = vec![
            DataSample::from_image(DynamicImage::new_rgb8(256, 64))
                .with_target(Target::detection(vec![BoundingBox::new(0.0, 0.0, 128.0, 32.0)], vec![0])?),
            DataSample::from_image(DynamicImage::new_rgb8(64, 64)).with_target(Target::detection(
                vec![BoundingBox::new(0.0, 0.0, 8.0, 8.0), BoundingBox::new(8.0, 8.0, 16.0, 16.0)],
                vec![1, 1],
            )?),
        ];
        let batch = pipeline.process_batch(samples)?;
        assert_eq!(batch.get("input")?.size(), vec![2, 3, 128, 128]);

        let boxes = batch.get_list(keys::TARGET_BOXES)?;
        assert_eq!(boxes[0].size(), vec![1, 4]);
        assert_eq!(boxes[1].size(), vec![2, 4]);
        let first = Vec::<f32>::try_from(&boxes[0].flatten(0, -1))?;
        assert_eq!(first, vec![0.0, 0.0, 64.0, 64.0]);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let args = ObjectDetectionArgs {
            threshold: 2.0,
            ..Default::default()
        };
        assert!(ObjectDetectionInputTransform::new(args).is_err());
    }
}
