//! Per-pixel classification from paired image and mask files.

use crate::data_module::{DataModule, DataModuleConfig, StageSources};
use crate::input_transform::{InputTransform, StageTransforms, TransformProvider};
use crate::io::image::{ImagePathsInput, MASK_PATH_KEY};
use crate::io::input::{InputFormat, InputSource};
use crate::io::output::{Output, SegmentationLabelsOutput};
use crate::output_transform::{DefaultOutputTransform, OutputTransform};
use crate::sample::{DataKey, DataSample, Metadata, Sample};
use crate::stage::RunningStage;
use crate::tasks::{parse_args, resize_transforms, to_state, with_image_inputs, TaskSpec, TaskType, TransformConfig};
use crate::transforms::vision::ToTensor;
use crate::transforms::{Sequential, Transform};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tch::Kind;

pub const NAME: &str = "semantic_segmentation";
/// `(height, width)`.
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (128, 160);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticSegmentationArgs {
    #[serde(flatten)]
    pub transform: TransformConfig,
    pub num_classes: usize,
}

impl Default for SemanticSegmentationArgs {
    fn default() -> Self {
        Self {
            transform: TransformConfig::default(),
            num_classes: 2,
        }
    }
}

/// Fails on mask values outside `0..num_classes`.
#[derive(Debug, Clone, Copy)]
pub struct CheckMaskClasses {
    num_classes: usize,
}

impl CheckMaskClasses {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl Transform<Sample, Sample> for CheckMaskClasses {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        if let Some(target) = sample.features.get(DataKey::Target.as_str()) {
            if target.numel() > 0 {
                let max = target.max().to_kind(Kind::Int64).int64_value(&[]);
                ensure!(
                    max >= 0 && (max as usize) < self.num_classes,
                    "Mask contains class {} but num_classes is {}",
                    max,
                    self.num_classes
                );
            }
        }
        Ok(sample)
    }
}

/// Image and mask are resized together, masks with nearest-neighbour.
pub struct SemanticSegmentationInputTransform {
    args: SemanticSegmentationArgs,
    train: StageTransforms,
    eval: StageTransforms,
}

impl SemanticSegmentationInputTransform {
    pub fn new(args: SemanticSegmentationArgs) -> Result<Self> {
        args.transform.validate()?;
        ensure!(args.num_classes > 0, "num_classes must be greater than 0");
        let size = args.transform.image_size_or(DEFAULT_IMAGE_SIZE);
        let normalize = args.transform.normalize()?;
        let train = resize_transforms(size, Some(args.transform.flip_prob), ToTensor::new(), normalize.clone())?;
        let eval = resize_transforms(size, None, ToTensor::new(), normalize)?;
        Ok(Self {
            train: Self::finish(train, args.num_classes),
            eval: Self::finish(eval, args.num_classes),
            args,
        })
    }

    fn finish(mut transforms: StageTransforms, num_classes: usize) -> StageTransforms {
        let mut post_tensor = Sequential::<Sample>::new().push(CheckMaskClasses::new(num_classes));
        if let Some(normalize) = transforms.post_tensor.take() {
            post_tensor = post_tensor.push(normalize);
        }
        transforms.with_post_tensor(post_tensor)
    }
}

impl TransformProvider for SemanticSegmentationInputTransform {
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

pub fn input_transform(args: SemanticSegmentationArgs) -> Result<InputTransform> {
    let transform = InputTransform::new(SemanticSegmentationInputTransform::new(args)?)
        .with_input(InputFormat::Folders, ImagePathsInput)
        .with_input(InputFormat::Datasets, ImagePathsInput);
    Ok(with_image_inputs(transform))
}

/// Images matched to masks by position. The masks are read when the sample
/// is loaded.
pub fn paired_files_source(images: Vec<PathBuf>, masks: Vec<PathBuf>) -> Result<InputSource> {
    ensure!(
        images.len() == masks.len(),
        "Got {} images but {} masks",
        images.len(),
        masks.len()
    );
    let samples = images
        .into_iter()
        .zip(masks)
        .map(|(image, mask)| {
            let metadata = Metadata::default()
                .with_filepath(&image)
                .with_extra(MASK_PATH_KEY, serde_json::Value::String(mask.to_string_lossy().into_owned()));
            DataSample::from_path(image).with_metadata(metadata)
        })
        .collect();
    Ok(InputSource::Samples(samples))
}

/// An image folder and the mask folder paired with it by file stem.
#[derive(Debug, Clone)]
pub struct PairedFolders {
    pub images: PathBuf,
    pub masks: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct StageFolders {
    pub train: Option<PairedFolders>,
    pub val: Option<PairedFolders>,
    pub test: Option<PairedFolders>,
    /// Images only.
    pub predict: Option<PathBuf>,
}

impl StageFolders {
    pub fn into_sources(self) -> StageSources {
        let paired = |p: PairedFolders| InputSource::Folders {
            images: p.images,
            masks: p.masks,
        };
        StageSources {
            train: self.train.map(paired),
            val: self.val.map(paired),
            test: self.test.map(paired),
            predict: self.predict.map(InputSource::Folder),
        }
    }
}

pub fn from_folders(
    folders: StageFolders,
    args: SemanticSegmentationArgs,
    config: DataModuleConfig,
) -> Result<DataModule> {
    DataModule::from_input(
        input_transform(args)?,
        Arc::new(DefaultOutputTransform),
        InputFormat::Folders,
        folders.into_sources(),
        config,
    )
}

pub fn spec() -> TaskSpec {
    let (height, width) = DEFAULT_IMAGE_SIZE;
    TaskSpec {
        name: NAME.to_string(),
        description: TaskType::SemanticSegmentation.description().to_string(),
        formats: vec![
            InputFormat::Folders,
            InputFormat::Datasets,
            InputFormat::Files,
            InputFormat::Numpy,
            InputFormat::Tensors,
        ],
        default_format: InputFormat::Folders,
        default_arguments: BTreeMap::from([
            ("input_transform.image_size".to_string(), serde_json::json!([height, width])),
            ("input_transform.num_classes".to_string(), serde_json::json!(2)),
            ("trainer.max_epochs".to_string(), serde_json::json!(3)),
        ]),
        build_input_transform: |args| input_transform(parse_args(args)?),
        build_output_transform: || -> Arc<dyn OutputTransform> { Arc::new(DefaultOutputTransform) },
        build_output: |_, _| -> Result<Arc<dyn Output>> { Ok(Arc::new(SegmentationLabelsOutput)) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};
    use std::path::Path;

    fn write_pair(images: &Path, masks: &Path, stem: &str, class: u8) -> Result<()> {
        RgbImage::new(20, 16).save(images.join(format!("{}.png", stem)))?;
        GrayImage::from_pixel(20, 16, Luma([class])).save(masks.join(format!("{}.png", stem)))?;
        Ok(())
    }

    fn args() -> SemanticSegmentationArgs {
        SemanticSegmentationArgs {
            transform: TransformConfig::default().with_image_size(8, 10),
            num_classes: 3,
        }
    }

    #[test]
    fn test_paired_folders_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (images, masks) = (dir.path().join("images"), dir.path().join("masks"));
        std::fs::create_dir_all(&images)?;
        std::fs::create_dir_all(&masks)?;
        for (i, stem) in ["a", "b", "c"].iter().enumerate() {
            write_pair(&images, &masks, stem, i as u8)?;
        }

        let folders = StageFolders {
            train: Some(PairedFolders { images, masks }),
            ..Default::default()
        };
        let config = DataModuleConfig {
            batch_size: 3,
            shuffle: false,
            ..Default::default()
        };
        let data = from_folders(folders, args(), config)?;
        let batch = data.train_dataloader()?.iter()?.next().transpose()?;
        let batch = batch.ok_or_else(|| anyhow::anyhow!("no batch"))?;
        assert_eq!(batch.get("input")?.size(), vec![3, 3, 8, 10]);
        let target = batch.get("target")?;
        assert_eq!(target.size(), vec![3, 8, 10]);
        assert_eq!(target.kind(), Kind::Int64);
        assert_eq!(target.max().int64_value(&[]), 2);
        Ok(())
    }

    #[test]
    fn test_out_of_range_class_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::new(20, 16).save(dir.path().join("image.png"))?;
        let mask_path = dir.path().join("mask.png");
        GrayImage::from_pixel(20, 16, Luma([7])).save(&mask_path)?;

        let source = paired_files_source(vec![dir.path().join("image.png")], vec![mask_path])?;
        let data = DataModule::from_input(
            input_transform(args())?,
            Arc::new(DefaultOutputTransform),
            InputFormat::Datasets,
            StageSources::default().with_test(source),
            DataModuleConfig::default(),
        )?;
        let result = data.test_dataloader()?.iter()?.next().transpose();
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_paired_files_length_mismatch() {
        assert!(paired_files_source(vec![PathBuf::from("a.png")], vec![]).is_err());
    }
}
