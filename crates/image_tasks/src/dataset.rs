use crate::error::PipelineError;
use crate::io::input::{Input, InputSource, LoadedData};
use crate::sample::DataSample;
use crate::stage::RunningStage;
use anyhow::{ensure, Context, Result};
use std::fmt;
use std::sync::Arc;

/// A streaming source of items, re-opened every epoch.
///
/// `stream()` must return a fresh iterator each call so the same source can
/// be read once per epoch.
pub trait DataSource<T = DataSample>: Send + Sync {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<T>> + Send>>;
}

/// A pre-built list of samples served as a stream.
impl DataSource for Vec<DataSample> {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<DataSample>> + Send>> {
        Ok(Box::new(self.clone().into_iter().map(Ok)))
    }
}

/// What every dataset knows about where it came from.
#[derive(Clone)]
pub struct DatasetInfo {
    pub stage: RunningStage,
    pub input: Arc<dyn Input>,
    /// Class names discovered while loading, index = label.
    pub labels: Option<Arc<Vec<String>>>,
}

impl fmt::Debug for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetInfo")
            .field("stage", &self.stage)
            .field("input", &self.input.name())
            .field("labels", &self.labels)
            .finish()
    }
}

/// A dataset whose raw samples are all known up front.
///
/// Raw samples (paths, targets) are shared through an `Arc`, so cloning or
/// taking a subset is cheap. The expensive part, loading the image, happens
/// in [`get`](Self::get) through the [`Input`] that produced the data.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Arc<[DataSample]>,
    indices: Option<Arc<[usize]>>,
    info: DatasetInfo,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<DataSample>, info: DatasetInfo) -> Self {
        Self {
            samples: samples.into(),
            indices: None,
            info,
        }
    }

    pub fn len(&self) -> usize {
        match &self.indices {
            Some(indices) => indices.len(),
            None => self.samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn stage(&self) -> RunningStage {
        self.info.stage
    }

    /// The sample as it was produced by `load_data`, before loading.
    pub fn raw(&self, index: usize) -> Result<&DataSample> {
        let len = self.len();
        let position = match &self.indices {
            Some(indices) => indices.get(index).copied(),
            None => Some(index),
        };
        position
            .and_then(|i| self.samples.get(i))
            .with_context(|| format!("Index {} out of bounds for dataset of size {}", index, len))
    }

    /// Loads the sample at `index` through the dataset's input.
    pub fn get(&self, index: usize) -> Result<DataSample> {
        let raw = self.raw(index)?.clone();
        self.info
            .input
            .load_sample(raw)
            .with_context(|| format!("Failed to load sample {} ({} stage)", index, self.info.stage))
    }

    /// A view over some of the samples, e.g. a validation split.
    pub fn subset(&self, indices: &[usize], stage: RunningStage) -> Result<Self> {
        let len = self.len();
        let mapped = indices
            .iter()
            .map(|&i| {
                ensure!(i < len, "Index {} out of bounds for dataset of size {}", i, len);
                Ok(match &self.indices {
                    Some(existing) => existing[i],
                    None => i,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            samples: self.samples.clone(),
            indices: Some(mapped.into()),
            info: DatasetInfo {
                stage,
                ..self.info.clone()
            },
        })
    }
}

/// A dataset read as a stream. Length is unknown, there is no random access.
#[derive(Clone)]
pub struct IterableDataset {
    source: Arc<dyn DataSource>,
    info: DatasetInfo,
}

impl fmt::Debug for IterableDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterableDataset").field("info", &self.info).finish()
    }
}

impl IterableDataset {
    pub fn new(source: Arc<dyn DataSource>, info: DatasetInfo) -> Self {
        Self { source, info }
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn stage(&self) -> RunningStage {
        self.info.stage
    }

    /// Raw samples for one epoch, not loaded yet.
    pub fn stream_raw(&self) -> Result<Box<dyn Iterator<Item = Result<DataSample>> + Send>> {
        self.source.stream()
    }

    /// Loaded samples for one epoch.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<DataSample>> + Send> {
        let input = self.info.input.clone();
        Ok(self
            .source
            .stream()?
            .map(move |raw| raw.and_then(|sample| input.load_sample(sample))))
    }
}

/// The dataset for one stage, built by running an [`Input`] over a source.
#[derive(Debug, Clone)]
pub enum InputDataset {
    Sized(InMemoryDataset),
    Iterable(IterableDataset),
}

impl InputDataset {
    /// Loads `source` through `input`.
    ///
    /// An ordinary input must produce sized data and an iterable input must
    /// produce a stream; anything else is rejected.
    pub fn new(stage: RunningStage, input: Arc<dyn Input>, source: InputSource) -> Result<Self> {
        let loaded = input
            .load_data(source, stage)
            .with_context(|| format!("{} failed to load {} data", input.name(), stage))?;
        let info = DatasetInfo {
            stage,
            input: input.clone(),
            labels: loaded.labels.map(Arc::new),
        };

        match (input.is_iterable(), loaded.data) {
            (false, LoadedData::Sized(samples)) => {
                tracing::debug!(stage = %stage, input = input.name(), len = samples.len(), "Loaded dataset");
                Ok(InputDataset::Sized(InMemoryDataset::new(samples, info)))
            }
            (true, LoadedData::Iterable(source)) => {
                tracing::debug!(stage = %stage, input = input.name(), "Loaded iterable dataset");
                Ok(InputDataset::Iterable(IterableDataset::new(source, info)))
            }
            (false, LoadedData::Iterable(_)) => Err(PipelineError::IterableDataInSizedInput.into()),
            (true, LoadedData::Sized(_)) => Err(PipelineError::SizedDataInIterableInput.into()),
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            InputDataset::Sized(dataset) => Some(dataset.len()),
            InputDataset::Iterable(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn info(&self) -> &DatasetInfo {
        match self {
            InputDataset::Sized(dataset) => dataset.info(),
            InputDataset::Iterable(dataset) => dataset.info(),
        }
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.info().labels.as_deref().map(Vec::as_slice)
    }

    /// The first `n` loaded samples, in order.
    pub fn take(&self, n: usize) -> Result<Vec<DataSample>> {
        match self {
            InputDataset::Sized(dataset) => (0..n.min(dataset.len())).map(|i| dataset.get(i)).collect(),
            InputDataset::Iterable(dataset) => dataset.iter()?.take(n).collect(),
        }
    }
}
