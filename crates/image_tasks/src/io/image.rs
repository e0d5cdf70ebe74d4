//! Inputs that produce image samples.
//!
//! Every input here shares the same `load_sample`: decode whatever the raw
//! sample holds into a [`DynamicImage`], record its size and resolve any
//! target that needed the image first (mask files, relative boxes).

use crate::io::fiftyone::{FiftyOneDataset, FiftyOneLabel};
use crate::io::input::{check_targets, numeric_labels, with_targets, Input, InputSource, LoadedInput};
use crate::io::loader::image_loader;
use crate::readers::ImageDirSource;
use crate::sample::{BoundingBox, DataSample, Metadata, SampleInput, Target};
use crate::stage::RunningStage;
use crate::transforms::vision::tensor_to_image;
use anyhow::{bail, Context, Result};
use image::{DynamicImage, GenericImageView, GrayImage};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata key holding the path of a mask still to be loaded.
pub const MASK_PATH_KEY: &str = "mask_path";
/// Metadata flag: detection boxes are relative to the image size.
pub const RELATIVE_BOXES_KEY: &str = "relative_boxes";

/// Reads a segmentation mask. Single-channel files are used as-is; for
/// colour files the first channel holds the class id.
pub fn load_mask(path: impl AsRef<Path>) -> Result<GrayImage> {
    let path = path.as_ref();
    let image = image_loader(path).with_context(|| format!("Failed to load mask {}", path.display()))?;
    Ok(match image {
        DynamicImage::ImageLuma8(mask) => mask,
        other => {
            let rgb = other.to_rgb8();
            GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| image::Luma([rgb.get_pixel(x, y)[0]]))
        }
    })
}

/// Decodes the sample's input and resolves deferred targets.
pub fn load_image_sample(sample: DataSample) -> Result<DataSample> {
    let DataSample {
        input,
        target,
        mut metadata,
    } = sample;

    let image = match input {
        SampleInput::Path(path) => {
            let image = image_loader(&path)?;
            if metadata.filepath.is_none() {
                metadata.filepath = Some(path);
            }
            image
        }
        SampleInput::Image(image) => image,
        SampleInput::Tensor(tensor) => tensor_to_image(&tensor)?,
    };
    let (width, height) = image.dimensions();
    metadata.size = Some((height, width));

    let mut target = target;
    if let Some(mask_path) = metadata.extra.remove(MASK_PATH_KEY) {
        let mask_path = mask_path
            .as_str()
            .map(PathBuf::from)
            .context("Mask path must be a string")?;
        let mask = load_mask(&mask_path)?;
        if mask.dimensions() != (width, height) {
            bail!(
                "Mask {} is {:?} but its image is {:?}",
                mask_path.display(),
                mask.dimensions(),
                (width, height)
            );
        }
        target = Some(Target::Mask(mask));
    }
    if metadata.extra.remove(RELATIVE_BOXES_KEY).is_some() {
        let (w, h) = (width as f32, height as f32);
        target = target.map(|t| t.map_geometry(|b| b.scale(w, h), |k| k.scale(w, h), |m| m.clone()));
    }

    Ok(DataSample {
        input: SampleInput::Image(image),
        target,
        metadata,
    })
}

fn path_sample(path: PathBuf) -> DataSample {
    DataSample::from_path(&path).with_metadata(Metadata::default().with_filepath(path))
}

/// Class sub-folders of `dir`, sorted by name.
fn class_folders(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read folder {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            if let Some(name) = path.file_name() {
                classes.push((name.to_string_lossy().into_owned(), path));
            }
        }
    }
    classes.sort();
    Ok(classes)
}

/// Images from file paths, folders, or paired image/mask folders.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePathsInput;

impl ImagePathsInput {
    /// A folder of class folders becomes a labelled dataset; a flat folder
    /// is read unlabeled.
    pub fn load_folder(&self, dir: &Path) -> Result<LoadedInput> {
        let classes = class_folders(dir)?;
        if classes.is_empty() {
            let samples = ImageDirSource::new(dir, false)
                .sorted_paths()?
                .into_iter()
                .map(path_sample)
                .collect();
            return Ok(LoadedInput::sized(samples));
        }

        let mut samples = Vec::new();
        for (label, (_, class_dir)) in classes.iter().enumerate() {
            for path in ImageDirSource::new(class_dir, true).sorted_paths()? {
                samples.push(path_sample(path).with_target(Target::Class(label)));
            }
        }
        let names = classes.into_iter().map(|(name, _)| name).collect();
        Ok(LoadedInput::sized(samples).with_labels(names))
    }

    /// Pairs every image with the mask sharing its file stem.
    pub fn load_paired_folders(&self, images: &Path, masks: &Path) -> Result<LoadedInput> {
        let masks_by_stem: HashMap<String, PathBuf> = ImageDirSource::new(masks, false)
            .sorted_paths()?
            .into_iter()
            .filter_map(|p| Some((p.file_stem()?.to_string_lossy().into_owned(), p)))
            .collect();

        let samples = ImageDirSource::new(images, false)
            .sorted_paths()?
            .into_iter()
            .map(|path| {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mask = masks_by_stem
                    .get(&stem)
                    .with_context(|| format!("No mask found for image {}", path.display()))?;
                let metadata = Metadata::default()
                    .with_filepath(&path)
                    .with_extra(MASK_PATH_KEY, serde_json::Value::String(mask.to_string_lossy().into_owned()));
                Ok(DataSample::from_path(path).with_metadata(metadata))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LoadedInput::sized(samples))
    }
}

impl Input for ImagePathsInput {
    fn name(&self) -> &'static str {
        "ImagePathsInput"
    }

    fn load_data(&self, source: InputSource, _stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Files { paths, targets } => {
                check_targets(paths.len(), &targets)?;
                let labels = numeric_labels(&targets);
                let samples = with_targets(paths.into_iter().map(path_sample), targets);
                let loaded = LoadedInput::sized(samples);
                Ok(match labels {
                    Some(labels) => loaded.with_labels(labels),
                    None => loaded,
                })
            }
            InputSource::Folder(dir) => self.load_folder(&dir),
            InputSource::Folders { images, masks } => self.load_paired_folders(&images, &masks),
            InputSource::Samples(samples) => Ok(LoadedInput::sized(samples)),
            other => bail!("{} cannot read {:?}", self.name(), other),
        }
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

fn tensor_samples(
    tensors: Vec<tch::Tensor>,
    targets: Option<Vec<Target>>,
) -> Result<LoadedInput> {
    check_targets(tensors.len(), &targets)?;
    let labels = numeric_labels(&targets);
    let samples = with_targets(
        tensors.into_iter().map(|t| DataSample::new(SampleInput::Tensor(t))),
        targets,
    );
    let loaded = LoadedInput::sized(samples);
    Ok(match labels {
        Some(labels) => loaded.with_labels(labels),
        None => loaded,
    })
}

/// Images given as `[C, H, W]` or `[H, W, C]` tensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTensorInput;

impl Input for ImageTensorInput {
    fn name(&self) -> &'static str {
        "ImageTensorInput"
    }

    fn load_data(&self, source: InputSource, _stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Tensors { tensors, targets } => tensor_samples(tensors, targets),
            other => bail!("{} cannot read {:?}", self.name(), other),
        }
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

/// Images given as numpy arrays, or `.npy` file paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageNumpyInput;

impl Input for ImageNumpyInput {
    fn name(&self) -> &'static str {
        "ImageNumpyInput"
    }

    fn load_data(&self, source: InputSource, stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Numpy { arrays, targets } => tensor_samples(arrays, targets),
            files @ InputSource::Files { .. } => ImagePathsInput.load_data(files, stage),
            other => bail!("{} cannot read {:?}", self.name(), other),
        }
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

/// Images and labels from a FiftyOne JSON export.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFiftyOneInput;

impl ImageFiftyOneInput {
    fn to_target(label: &FiftyOneLabel, index: &HashMap<&str, usize>) -> Result<(Target, bool)> {
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .with_context(|| format!("Unknown class '{}'", name))
        };
        Ok(match label {
            FiftyOneLabel::Classification(c) => (Target::Class(lookup(&c.label)?), false),
            FiftyOneLabel::Classifications { classifications } => {
                let mut ids = classifications
                    .iter()
                    .map(|c| lookup(&c.label))
                    .collect::<Result<Vec<_>>>()?;
                ids.sort_unstable();
                ids.dedup();
                (Target::MultiLabel(ids), false)
            }
            FiftyOneLabel::Detections { detections } => {
                let boxes = detections
                    .iter()
                    .map(|d| {
                        let [x, y, w, h] = d.bounding_box;
                        BoundingBox::from_xywh(x, y, w, h)
                    })
                    .collect();
                let labels = detections
                    .iter()
                    .map(|d| lookup(&d.label))
                    .collect::<Result<Vec<_>>>()?;
                (Target::detection(boxes, labels)?, true)
            }
        })
    }
}

impl Input for ImageFiftyOneInput {
    fn name(&self) -> &'static str {
        "ImageFiftyOneInput"
    }

    fn load_data(&self, source: InputSource, _stage: RunningStage) -> Result<LoadedInput> {
        let (path, label_field) = match source {
            InputSource::FiftyOne { path, label_field } => (path, label_field),
            other => bail!("{} cannot read {:?}", self.name(), other),
        };
        let dataset = FiftyOneDataset::from_file(&path)?;
        let classes = dataset.classes(&label_field)?;
        let index: HashMap<&str, usize> = classes.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

        let samples = dataset
            .labels(&label_field)?
            .into_iter()
            .map(|(filepath, label)| {
                let mut sample = path_sample(filepath);
                if let Some(label) = label {
                    let (target, relative) = Self::to_target(&label, &index)?;
                    if relative {
                        sample
                            .metadata
                            .extra
                            .insert(RELATIVE_BOXES_KEY.to_string(), serde_json::Value::Bool(true));
                    }
                    sample = sample.with_target(target);
                }
                Ok(sample)
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(path = %path.display(), len = samples.len(), classes = classes.len(), "Read FiftyOne export");
        Ok(LoadedInput::sized(samples).with_labels(classes))
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

/// Streams a folder (recursively) instead of listing it up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterableImageFolderInput;

impl Input for IterableImageFolderInput {
    fn name(&self) -> &'static str {
        "IterableImageFolderInput"
    }

    fn load_data(&self, source: InputSource, _stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Folder(dir) => Ok(LoadedInput::iterable(Arc::new(ImageDirSource::new(dir, true)))),
            InputSource::Stream(source) => Ok(LoadedInput::iterable(source)),
            other => bail!("{} cannot read {:?}", self.name(), other),
        }
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }

    fn is_iterable(&self) -> bool {
        true
    }
}
