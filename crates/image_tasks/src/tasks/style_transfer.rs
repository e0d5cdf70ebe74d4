//! Style transfer. Only training and prediction are supported: there is no
//! ground truth to validate or test against.

use crate::data_module::{DataModule, DataModuleConfig, StageSources};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::input::{InputFormat, InputSource};
use crate::io::output::{Output, StyledImageOutput};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::sample::DataSample;
use crate::stage::RunningStage;
use crate::tasks::{parse_args, to_state, with_image_inputs, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::{CenterCropTensor, EnsureRGB, Resize, ResizeTensor, ToTensor};
use crate::transforms::{ApplyToTensorInput, Sequential};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tch::Tensor;

pub const NAME: &str = "style_transfer";
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (256, 256);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleTransferArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
}

/// Train: to-tensor, then resize and center-crop on the device.
/// Predict: resize, then to-tensor.
pub struct StyleTransferInputTransform {
    args: StyleTransferArgs,
    train: StageTransforms,
    predict: StageTransforms,
}

impl StyleTransferInputTransform {
    pub fn new(args: StyleTransferArgs) -> Result<Self> {
        args.transform.validate()?;
        let (height, width) = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);

        let on_device = Sequential::<Tensor>::new()
            .push(ResizeTensor::new(height, width)?)
            .push(CenterCropTensor::new(height, width)?);
        let train = StageTransforms::new()
            .with_pre_tensor(EnsureRGB)
            .with_to_tensor(ToTensor::new())
            .with_per_sample_on_device(ApplyToTensorInput::new(on_device));

        let predict = StageTransforms::new()
            .with_pre_tensor(
                Sequential::<DataSample>::new()
                    .push(EnsureRGB)
                    .push(Resize::new(height, width)?),
            )
            .with_to_tensor(ToTensor::new());
        Ok(Self { args, train, predict })
    }
}

impl TransformProvider for StyleTransferInputTransform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_transforms(&self, stage: RunningStage) -> Option<StageTransforms> {
        match stage {
            RunningStage::Training => Some(self.train.clone()),
            RunningStage::Predicting => Some(self.predict.clone()),
            RunningStage::Validating | RunningStage::Testing => None,
        }
    }

    fn state(&self) -> serde_json::Value {
        to_state(&self.args)
    }
}

pub fn input_transform(args: StyleTransferArgs) -> Result<InputTransform> {
    Ok(with_image_inputs(InputTransform::new(StyleTransferInputTransform::new(args)?)))
}

/// Content images for training and prediction. Validation and test
/// folders are rejected.
pub fn from_folders(
    train: Option<PathBuf>,
    predict: Option<PathBuf>,
    args: StyleTransferArgs,
    config: DataModuleConfig,
) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Folders,
        StageSources {
            train: train.map(InputSource::Folder),
            predict: predict.map(InputSource::Folder),
            ..Default::default()
        },
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::StyleTransfer.description().to_string(),
        formats: vec![
            InputFormat::Files,
            InputFormat::Folders,
            InputFormat::Numpy,
            InputFormat::Tensors,
        ],
        default_format: InputFormat::Files,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("model.content_weight".to_string(), serde_json::json!(1e5)),
            ("model.style_weight".to_string(), serde_json::json!(1e10)),
            ("trainer.max_epochs".to_string(), serde_json::json!(2)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |_, _| -> Result<Arc<dyn Output>> { Ok(Arc::new(StyledImageOutput)) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use image::DynamicImage;
    use tch::Device;

    fn args() -> StyleTransferArgs {
        StyleTransferArgs {
            transform: TransformConfig::default().with_image_size(16, 16),
        }
    }

    #[test]
    fn test_train_resizes_on_device() -> Result<()> {
        let pipeline = input_transform(args())?.pipeline(RunningStage::Training, Device::Cpu)?;
        let samples = vec![
            DataSample::from_image(DynamicImage::new_luma8(40, 20)),
            DataSample::from_image(DynamicImage::new_rgb8(8, 8)),
        ];
        let batch = pipeline.process_batch(samples)?;
        assert_eq!(batch.get("input")?.size(), vec![2, 3, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_predict_resizes_before_tensor() -> Result<()> {
        let pipeline = input_transform(args())?.pipeline(RunningStage::Predicting, Device::Cpu)?;
        let sample = pipeline.process_sample(DataSample::from_image(DynamicImage::new_rgb8(30, 10)))?;
        assert_eq!(sample.input()?.size(), vec![3, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_val_and_test_are_rejected() -> Result<()> {
        let transform = input_transform(args())?;
        for stage in [RunningStage::Validating, RunningStage::Testing] {
            let err = transform.pipeline(stage, Device::Cpu).err();
            assert!(matches!(
                err.as_ref().and_then(|e| e.downcast_ref::<PipelineError>()),
                Some(PipelineError::StageNotSupported { .. })
            ));
        }
        Ok(())
    }
}
