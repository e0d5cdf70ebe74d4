use crate::dataset::DataSource;
use crate::sample::{DataSample, Target};
use crate::stage::RunningStage;
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tch::Tensor;

/// The kinds of data an input transform can register an [`Input`] for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Files,
    Folders,
    Numpy,
    Tensors,
    Datasets,
    #[serde(rename = "fiftyone")]
    FiftyOne,
    Coco,
}

impl InputFormat {
    pub const ALL: [InputFormat; 7] = [
        InputFormat::Files,
        InputFormat::Folders,
        InputFormat::Numpy,
        InputFormat::Tensors,
        InputFormat::Datasets,
        InputFormat::FiftyOne,
        InputFormat::Coco,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Files => "files",
            InputFormat::Folders => "folders",
            InputFormat::Numpy => "numpy",
            InputFormat::Tensors => "tensors",
            InputFormat::Datasets => "datasets",
            InputFormat::FiftyOne => "fiftyone",
            InputFormat::Coco => "coco",
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data handed to an input for one stage.
pub enum InputSource {
    /// Image (or `.npy`) paths with optional per-path targets.
    Files {
        paths: Vec<PathBuf>,
        targets: Option<Vec<Target>>,
    },
    /// A folder of images, or of class sub-folders.
    Folder(PathBuf),
    /// Paired image and mask folders, matched by file stem.
    Folders { images: PathBuf, masks: PathBuf },
    /// Image tensors, `[C, H, W]` or `[H, W, C]`.
    Tensors {
        tensors: Vec<Tensor>,
        targets: Option<Vec<Target>>,
    },
    /// Arrays read from `.npy` files.
    Numpy {
        arrays: Vec<Tensor>,
        targets: Option<Vec<Target>>,
    },
    /// Samples that were already built, e.g. from another dataset library.
    Samples(Vec<DataSample>),
    FiftyOne { path: PathBuf, label_field: String },
    Coco { images_dir: PathBuf, annotations: PathBuf },
    Stream(Arc<dyn DataSource>),
}

impl InputSource {
    pub fn files(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        InputSource::Files {
            paths: paths.into_iter().map(Into::into).collect(),
            targets: None,
        }
    }

    pub fn labelled_files(
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
        targets: Vec<Target>,
    ) -> Self {
        InputSource::Files {
            paths: paths.into_iter().map(Into::into).collect(),
            targets: Some(targets),
        }
    }

    /// Reads `.npy` files into a [`InputSource::Numpy`].
    pub fn numpy_files(
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
        targets: Option<Vec<Target>>,
    ) -> Result<Self> {
        let arrays = paths
            .into_iter()
            .map(|path| {
                let path = path.into();
                Tensor::read_npy(&path)
                    .with_context(|| format!("Failed to read numpy array: {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(InputSource::Numpy { arrays, targets })
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Files { paths, targets } => f
                .debug_struct("Files")
                .field("paths", &paths.len())
                .field("labelled", &targets.is_some())
                .finish(),
            InputSource::Folder(path) => f.debug_tuple("Folder").field(path).finish(),
            InputSource::Folders { images, masks } => f
                .debug_struct("Folders")
                .field("images", images)
                .field("masks", masks)
                .finish(),
            InputSource::Tensors { tensors, .. } => f.debug_struct("Tensors").field("len", &tensors.len()).finish(),
            InputSource::Numpy { arrays, .. } => f.debug_struct("Numpy").field("len", &arrays.len()).finish(),
            InputSource::Samples(samples) => f.debug_struct("Samples").field("len", &samples.len()).finish(),
            InputSource::FiftyOne { path, label_field } => f
                .debug_struct("FiftyOne")
                .field("path", path)
                .field("label_field", label_field)
                .finish(),
            InputSource::Coco {
                images_dir,
                annotations,
            } => f
                .debug_struct("Coco")
                .field("images_dir", images_dir)
                .field("annotations", annotations)
                .finish(),
            InputSource::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Output of [`Input::load_data`].
pub enum LoadedData {
    Sized(Vec<DataSample>),
    Iterable(Arc<dyn DataSource>),
}

pub struct LoadedInput {
    pub data: LoadedData,
    /// Class names, index = label id.
    pub labels: Option<Vec<String>>,
}

impl LoadedInput {
    pub fn sized(samples: Vec<DataSample>) -> Self {
        Self {
            data: LoadedData::Sized(samples),
            labels: None,
        }
    }

    pub fn iterable(source: Arc<dyn DataSource>) -> Self {
        Self {
            data: LoadedData::Iterable(source),
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// Turns a user-facing source into raw samples, then loads each sample.
///
/// `load_data` runs once per stage and should stay cheap (list files, parse
/// label files). `load_sample` runs per sample, possibly on a worker thread,
/// and does the expensive work such as decoding the image.
pub trait Input: Send + Sync {
    fn name(&self) -> &'static str;

    fn load_data(&self, source: InputSource, stage: RunningStage) -> Result<LoadedInput>;

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        Ok(sample)
    }

    /// Iterable inputs produce streams instead of sized data.
    fn is_iterable(&self) -> bool {
        false
    }
}

/// Serves pre-built samples (or a stream of them) unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughInput;

impl Input for PassThroughInput {
    fn name(&self) -> &'static str {
        "PassThroughInput"
    }

    fn load_data(&self, source: InputSource, _stage: RunningStage) -> Result<LoadedInput> {
        match source {
            InputSource::Samples(samples) => Ok(LoadedInput::sized(samples)),
            other => bail!("PassThroughInput cannot read {:?}", other),
        }
    }
}

/// Checks that optional targets line up one-to-one with the inputs.
pub(crate) fn check_targets(len: usize, targets: &Option<Vec<Target>>) -> Result<()> {
    if let Some(targets) = targets {
        ensure!(
            targets.len() == len,
            "Got {} inputs but {} targets",
            len,
            targets.len()
        );
    }
    Ok(())
}

/// Zips inputs with optional targets, leaving targets empty when absent.
pub(crate) fn with_targets(
    samples: impl IntoIterator<Item = DataSample>,
    targets: Option<Vec<Target>>,
) -> Vec<DataSample> {
    match targets {
        Some(targets) => samples
            .into_iter()
            .zip(targets)
            .map(|(sample, target)| sample.with_target(target))
            .collect(),
        None => samples.into_iter().collect(),
    }
}

/// Class names from a set of targets: `"0"`, `"1"`, ... up to the largest id.
pub(crate) fn numeric_labels(targets: &Option<Vec<Target>>) -> Option<Vec<String>> {
    let max = targets
        .as_ref()?
        .iter()
        .filter_map(|t| match t {
            Target::Class(c) => Some(*c),
            Target::MultiLabel(cs) => cs.iter().max().copied(),
            _ => None,
        })
        .max()?;
    Some((0..=max).map(|i| i.to_string()).collect())
}
