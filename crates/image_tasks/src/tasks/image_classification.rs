//! Single- and multi-label image classification.

use crate::data_module::{DataModule, DataModuleConfig};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::image::ImageFiftyOneInput;
use crate::io::input::InputFormat;
use crate::io::output::{ClassesOutput, LabelsOutput, Output};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::stage::RunningStage;
use crate::tasks::{
    parse_args, resize_transforms, to_state, with_image_inputs, StagePaths, TaskSpec, TaskType, TransformConfig,
};
use crate::transforms::vision::{Normalize, ToTensor};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "image_classification";
/// `(height, width)`.
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (196, 196);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageClassificationArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
    pub multi_label: bool,
    /// Required for multi-label targets.
    pub num_classes: Option<usize>,
}

/// Train: resize, random flip, to-tensor, normalize. Other stages skip the
/// flip. Normalization defaults to ImageNet statistics.
pub struct ImageClassificationInputTransform {
    args: ImageClassificationArgs,
    train: StageTransforms,
    eval: StageTransforms,
}

impl ImageClassificationInputTransform {
    pub fn new(args: ImageClassificationArgs) -> Result<Self> {
        args.transform.validate()?;
        ensure!(
            !args.multi_label || args.num_classes.is_some(),
            "Multi-label classification needs num_classes"
        );
        let normalize = args.transform.normalize()?.unwrap_or_else(Normalize::imagenet);
        let to_tensor = match args.num_classes {
            Some(n) => ToTensor::new().with_num_classes(n),
            None => ToTensor::new(),
        };

        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let train = resize_transforms(
            size,
            Some(args.transform.flip_prob),
            to_tensor.clone(),
            Some(normalize.clone()),
        )?;
        let eval = resize_transforms(size, None, to_tensor, Some(normalize))?;
        Ok(Self { args, train, eval })
    }
}

impl TransformProvider for ImageClassificationInputTransform {
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

pub fn input_transform(args: ImageClassificationArgs) -> Result<InputTransform> {
    Ok(with_image_inputs(InputTransform::new(ImageClassificationInputTransform::new(args)?))
        .with_input(InputFormat::FiftyOne, ImageFiftyOneInput))
}

/// Class sub-folders per stage (`train/cat/*.png`, `train/dog/*.png`, ...).
pub fn from_folders(
    folders: StagePaths,
    args: ImageClassificationArgs,
    config: DataModuleConfig,
) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Folders,
        folders.into_folder_sources(),
        config,
    )
}

/// FiftyOne exports with `Classification` or `Classifications` labels.
pub fn from_fiftyone(
    files: StagePaths,
    label_field: &str,
    args: ImageClassificationArgs,
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

pub fn output(args: &ImageClassificationArgs, labels: Option<&[String]>) -> Arc<dyn Output> {
    let threshold = 0.5;
    match (labels, args.multi_label) {
        (Some(labels), true) => Arc::new(LabelsOutput::new(labels.to_vec()).multi_label(threshold)),
        (Some(labels), false) => Arc::new(LabelsOutput::new(labels.to_vec())),
        (None, true) => Arc::new(ClassesOutput::multi_label(threshold)),
        (None, false) => Arc::new(ClassesOutput::default()),
    }
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::ImageClassification.description().to_string(),
        formats: vec![
            InputFormat::Files,
            InputFormat::Folders,
            InputFormat::Numpy,
            InputFormat::Tensors,
            InputFormat::FiftyOne,
        ],
        default_format: InputFormat::Files,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.multi_label".to_string(), serde_json::json!(false)),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |args, labels| Ok(output(&parse_args(args)?, labels)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::output::Prediction;
    use crate::sample::{DataSample, Sample, Target};
    use image::DynamicImage;
    use tch::{Device, Tensor};

    #[test]
    fn test_train_and_eval_pipelines() -> Result<()> {
        let args = ImageClassificationArgs {
            transform: TransformConfig::default().with_image_size(8, 12),
            ..Default::default()
        };
        let transform = input_transform(args)?;
        for stage in RunningStage::ALL {
            let pipeline = transform.pipeline(stage, Device::Cpu)?;
            let sample = DataSample::from_image(DynamicImage::new_luma8(20, 10)).with_target(Target::Class(1));
            let out = pipeline.process_sample(sample)?;
            assert_eq!(out.input()?.size(), vec![3, 8, 12]);
            assert_eq!(out.get("target")?.int64_value(&[]), 1);
        }
        Ok(())
    }

    #[test]
    fn test_multi_label_needs_num_classes() -> Result<()> {
        let args = ImageClassificationArgs {
            multi_label: true,
            ..Default::default()
        };
        assert!(ImageClassificationInputTransform::new(args.clone()).is_err());

        let transform = input_transform(ImageClassificationArgs {
            num_classes: Some(4),
            ..args
        })?;
        let pipeline = transform.pipeline(RunningStage::Validating, Device::Cpu)?;
        let sample = DataSample::from_image(DynamicImage::new_rgb8(4, 4)).with_target(Target::MultiLabel(vec![0, 3]));
        let target = pipeline.process_sample(sample)?.get("target")?.shallow_clone();
        assert_eq!(Vec::<f32>::try_from(&target)?, vec![1.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_output_uses_labels_when_known() -> Result<()> {
        let labels = vec!["cat".to_string(), "dog".to_string()];
        let sample = Sample::from_single("preds", Tensor::from_slice(&[0.2f32, 1.5]));
        let out = output(&ImageClassificationArgs::default(), Some(labels.as_slice()));
        assert_eq!(out.transform(&sample)?, Prediction::Label { label: "dog".into() });
        let out = output(&ImageClassificationArgs::default(), None);
        assert_eq!(out.transform(&sample)?, Prediction::Class { index: 1 });
        Ok(())
    }
}
