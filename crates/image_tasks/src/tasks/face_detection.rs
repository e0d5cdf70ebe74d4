//! Face detection with adaptive batching.
//!
//! Images keep their size until collation: [`AdaptiveBatchCollator`] fits
//! every image of a batch into the largest one and records the scale and
//! padding, which [`FaceDetectionOutputTransform`] undoes on predictions.

use crate::collator::AdaptiveBatchCollator;
use crate::data_module::{DataModule, DataModuleConfig, StageSources};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::image::{load_image_sample, ImagePathsInput};
use crate::io::input::{Input, InputFormat, InputSource, LoadedInput};
use crate::io::output::{DetectionLabelsOutput, Output};
use crate::output_transform::{FaceDetectionOutputTransform, OutputTransform};
use crate::sample::{BoundingBox, DataSample, Metadata, Target};
use crate::stage::RunningStage;
use crate::tasks::{parse_args, to_state, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::{EnsureRGB, Resize, ToTensor};
use crate::transforms::Sequential;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const NAME: &str = "face_detection";
/// Model input size; images are only resized up front when `image_size` is set.
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (128, 128);
/// Every annotated box is a face.
pub const FACE_LABEL: usize = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
}

/// `(path, boxes)` pairs, e.g. from an FDDB-style annotation list.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceDetectionInput;

impl FaceDetectionInput {
    pub fn source(pairs: impl IntoIterator<Item = (PathBuf, Vec<BoundingBox>)>) -> InputSource {
        let samples = pairs
            .into_iter()
            .map(|(path, boxes)| {
                let labels = vec![FACE_LABEL; boxes.len()];
                DataSample::from_path(&path)
                    .with_target(Target::Detection { boxes, labels })
                    .with_metadata(Metadata::default().with_filepath(path))
            })
            .collect();
        InputSource::Samples(samples)
    }

    fn relabel(sample: DataSample) -> Result<DataSample> {
        let DataSample {
            input,
            target,
            metadata,
        } = sample;
        let target = match target {
            Some(Target::Detection { boxes, .. }) => {
                let labels = vec![FACE_LABEL; boxes.len()];
                Some(Target::Detection { boxes, labels })
            }
            None => None,
            Some(other) => bail!("Face detection needs box targets, got {:?}", other),
        };
        Ok(DataSample {
            input,
            target,
            metadata,
        })
    }
}

impl Input for FaceDetectionInput {
    fn name(&self) -> &'static str {
        "FaceDetectionInput"
    }

    fn load_data(&self, source: InputSource, stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Samples(samples) => {
                let samples = samples.into_iter().map(Self::relabel).collect::<Result<Vec<_>>>()?;
                Ok(LoadedInput::sized(samples).with_labels(vec!["background".into(), "face".into()]))
            }
            source @ (InputSource::Files { .. } | InputSource::Folder(_)) => ImagePathsInput.load_data(source, stage),
            other => bail!("{} cannot read {:?}", self.name(), other),
        }
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

pub struct FaceDetectionInputTransform {
    args: FaceDetectionArgs,
    transforms: StageTransforms,
}

impl FaceDetectionInputTransform {
    pub fn new(args: FaceDetectionArgs) -> Result<Self> {
        args.transform.validate()?;
        let pre_tensor = match args.transform.image_size {
            Some([height, width]) => Sequential::<DataSample>::new()
                .push(EnsureRGB)
                .push(Resize::new(height, width)?),
            None => Sequential::<DataSample>::new().push(EnsureRGB),
        };
        let mut transforms = StageTransforms::new()
            .with_pre_tensor(pre_tensor)
            .with_to_tensor(ToTensor::new())
            .with_collate(AdaptiveBatchCollator);
        if let Some(normalize) = args.transform.normalize()? {
            transforms = transforms.with_post_tensor(normalize);
        }
        Ok(Self { args, transforms })
    }
}

impl TransformProvider for FaceDetectionInputTransform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn default_transforms(&self, _stage: RunningStage) -> Option<StageTransforms> {
        Some(self.transforms.clone())
    }

    fn state(&self) -> serde_json::Value {
        to_state(&self.args)
    }
}

pub fn input_transform(args: FaceDetectionArgs) -> Result<InputTransform> {
    Ok(InputTransform::new(FaceDetectionInputTransform::new(args)?)
        .with_input(InputFormat::Files, ImagePathsInput)
        .with_input(InputFormat::Folders, ImagePathsInput)
        .with_input(InputFormat::Datasets, FaceDetectionInput))
}

/// Annotated `(path, boxes)` pairs per stage, plain files for predict.
#[derive(Debug, Clone, Default)]
pub struct StageFaces {
    pub train: Option<Vec<(PathBuf, Vec<BoundingBox>)>>,
    pub val: Option<Vec<(PathBuf, Vec<BoundingBox>)>>,
    pub test: Option<Vec<(PathBuf, Vec<BoundingBox>)>>,
    pub predict: Option<Vec<PathBuf>>,
}

pub fn from_datasets(faces: StageFaces, args: FaceDetectionArgs, config: DataModuleConfig) -> Result<DataModule> {
    let sources = StageSources {
        train: faces.train.map(FaceDetectionInput::source),
        val: faces.val.map(FaceDetectionInput::source),
        test: faces.test.map(FaceDetectionInput::source),
        predict: faces.predict.map(InputSource::files),
    };
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(FaceDetectionOutputTransform),
        InputFormat::Datasets,
        sources,
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::FaceDetection.description().to_string(),
        formats: vec![InputFormat::Files, InputFormat::Folders, InputFormat::Datasets],
        default_format: InputFormat::Files,
        default_arguments: BTreeMap::from([
            ("model.image_size".to_string(), serde_json::json!([height, width])),
            ("model.model".to_string(), serde_json::json!("lffd_slim")),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(FaceDetectionOutputTransform) },
        build_output: |_, _| -> Result<Arc<dyn Output>> {
            Ok(Arc::new(DetectionLabelsOutput {
                labels: None,
                threshold: 0.0,
            }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::output::tensor_to_vec;
    use crate::sample::keys;
    use image::DynamicImage;
    use tch::Device;

    #[test]
    fn test_datasets_input_labels_every_box_as_face() -> Result<()> {
        let source = FaceDetectionInput::source(vec![(
            PathBuf::from("a.png"),
            vec![BoundingBox::new(0.0, 0.0, 1.0, 1.0), BoundingBox::new(1.0, 1.0, 2.0, 2.0)],
        )]);
        let loaded = FaceDetectionInput.load_data(source, RunningStage::Training)?;
        let samples = match loaded.data {
            crate::io::input::LoadedData::Sized(samples) => samples,
            crate::io::input::LoadedData::Iterable(_) => bail!("expected sized data"),
        };
        assert_eq!(samples[0].target.as_ref().and_then(Target::labels), Some(&[1, 1][..]));
        assert_eq!(loaded.labels.map(|l| l.len()), Some(2));
        Ok(())
    }

    #[test]
    fn test_other_targets_rejected() {
        let sample = DataSample::from_path("a.png").with_target(Target::Class(0));
        let result = FaceDetectionInput.load_data(InputSource::Samples(vec![sample]), RunningStage::Training);
        assert!(result.is_err());
    }

    #[test]
    fn test_adaptive_batch_moves_boxes() -> Result<()> {
        let pipeline = input_transform(FaceDetectionArgs::default())?.pipeline(RunningStage::Training, Device::Cpu)?;
        let samples = vec![
            DataSample::from_image(DynamicImage::new_rgb8(20, 10))
                .with_target(Target::detection(vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)], vec![1])?),
            DataSample::from_image(DynamicImage::new_rgb8(10, 20))
                .with_target(Target::detection(vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)], vec![1])?),
        ];
        let batch = pipeline.process_batch(samples)?;
        assert_eq!(batch.get("input")?.size(), vec![2, 3, 20, 20]);
        assert_eq!(tensor_to_vec(batch.get(keys::SCALES)?)?, vec![1.0, 1.0]);
        assert_eq!(tensor_to_vec(batch.get(keys::PADDINGS)?)?, vec![0.0, 5.0, 5.0, 0.0]);

        let boxes = batch.get_list(keys::TARGET_BOXES)?;
        assert_eq!(tensor_to_vec(&boxes[0])?, vec![0.0, 5.0, 10.0, 15.0]);
        assert_eq!(tensor_to_vec(&boxes[1])?, vec![5.0, 0.0, 15.0, 10.0]);
        Ok(())
    }
}
