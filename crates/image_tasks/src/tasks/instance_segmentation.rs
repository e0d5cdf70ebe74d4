//! Instance segmentation: boxes, labels and one mask per object.

use crate::collator::ListCollator;
use crate::data_module::{DataModule, DataModuleConfig};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::coco::{CocoInput, CocoTargetKind};
use crate::io::image::ImagePathsInput;
use crate::io::input::InputFormat;
use crate::io::output::{DetectionLabelsOutput, Output};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::stage::RunningStage;
use crate::tasks::{parse_args, resize_transforms, to_state, StageCoco, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::ToTensor;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "instance_segmentation";
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (128, 128);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSegmentationArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
}

pub struct InstanceSegmentationInputTransform {
    args: InstanceSegmentationArgs,
    train: StageTransforms,
    eval: StageTransforms,
}

impl InstanceSegmentationInputTransform {
    pub fn new(args: InstanceSegmentationArgs) -> Result<Self> {
        args.transform.validate()?;
        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let normalize = args.transform.normalize()?;
        let train = resize_transforms(size, Some(args.transform.flip_prob), ToTensor::new(), normalize.clone())?
            .with_collate(ListCollator::default());
        let eval = resize_transforms(size, None, ToTensor::new(), normalize)?.with_collate(ListCollator::default());
        Ok(Self { args, train, eval })
    }
}

impl TransformProvider for InstanceSegmentationInputTransform {
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

pub fn input_transform(args: InstanceSegmentationArgs) -> Result<InputTransform> {
    Ok(InputTransform::new(InstanceSegmentationInputTransform::new(args)?)
        .with_input(InputFormat::Coco, CocoInput::new(CocoTargetKind::Instances))
        .with_input(InputFormat::Files, ImagePathsInput))
}

/// Polygon annotations are rasterized into one mask per object.
pub fn from_coco(stages: StageCoco, args: InstanceSegmentationArgs, config: DataModuleConfig) -> Result<DataModule> {
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
        description: TaskType::InstanceSegmentation.description().to_string(),
        formats: vec![InputFormat::Coco, InputFormat::Files],
        default_format: InputFormat::Coco,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.num_classes".to_string(), serde_json::json!(2)),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |_, labels| -> Result<Arc<dyn Output>> {
            Ok(Arc::new(DetectionLabelsOutput {
                labels: labels.map(<[String]>::to_vec),
                ..Default::default()
            }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{keys, BoundingBox, DataSample, Target};
    use image::{DynamicImage, GrayImage, Luma};
    use tch::{Device, Kind};

    #[test]
    fn test_masks_resized_with_the_image() -> Result<()> {
        let args = InstanceSegmentationArgs {
            transform: TransformConfig::default().with_image_size(16, 16),
        };
        let pipeline = input_transform(args)?.pipeline(RunningStage::Validating, Device::Cpu)?;

        let mut mask = GrayImage::new(8, 8);
        for y in 0..4 {
            for x in 0..4 {
                mask.put_pixel(x, y, Luma([1]));
            }
        }
        let samples = vec![
            DataSample::from_image(DynamicImage::new_rgb8(8, 8)).with_target(Target::Instances {
                boxes: vec![BoundingBox::new(0.0, 0.0, 4.0, 4.0)],
                labels: vec![0],
                masks: vec![mask],
            }),
            DataSample::from_image(DynamicImage::new_rgb8(8, 8)).with_target(Target::Instances {
                boxes: vec![],
                labels: vec![],
                masks: vec![],
            }),
        ];
        let batch = pipeline.process_batch(samples)?;

        let masks = batch.get_list(keys::TARGET_MASKS)?;
        assert_eq!(masks[0].size(), vec![1, 16, 16]);
        assert_eq!(masks[0].to_kind(Kind::Int64).sum(Kind::Int64).int64_value(&[]), 64);
        assert_eq!(masks[1].size(), vec![0, 16, 16]);
        assert_eq!(batch.get_list(keys::TARGET_BOXES)?[1].size(), vec![0, 4]);
        Ok(())
    }
}
