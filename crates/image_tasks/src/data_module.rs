//! Per-stage datasets for one task, and the loaders over them.
//!
//! ```ignore
//! let data = DataModule::from_input(
//!     input_transform,
//!     Arc::new(DefaultOutputTransform),
//!     InputFormat::Folders,
//!     StageSources::default().with_train(InputSource::Folder("data/train".into())),
//!     DataModuleConfig { val_split: Some(0.1), ..Default::default() },
//! )?;
//! for batch in data.train_dataloader()?.iter()? {
//!     let batch = batch?;
//! }
//! ```

use crate::dataloader::{DataLoader, DataLoaderConfig};
use crate::dataset::InputDataset;
use crate::input_transform::InputTransform;
use crate::io::input::{InputFormat, InputSource};
use crate::output_transform::OutputTransform;
use crate::sampler::split_indices;
use crate::stage::RunningStage;
use crate::visualization::{render_grid, render_sample};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tch::Device;

/// Batching settings shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModuleConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Fraction of the training set held out for validation when no
    /// validation source is given.
    pub val_split: Option<f64>,
    pub seed: u64,
    /// Training stage only.
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            num_workers: 0,
            val_split: None,
            seed: 42,
            shuffle: true,
            drop_last: false,
        }
    }
}

impl DataModuleConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be greater than 0");
        if let Some(split) = self.val_split {
            ensure!(
                split > 0.0 && split < 1.0,
                "val_split should be a float in (0, 1), got {}",
                split
            );
        }
        Ok(())
    }

    pub fn to_loader_config(&self, stage: RunningStage, device: Device) -> DataLoaderConfig {
        DataLoaderConfig::builder()
            .batch_size(self.batch_size)
            .num_workers(self.num_workers)
            .shuffle(self.shuffle && stage == RunningStage::Training)
            .drop_last(self.drop_last)
            .seed(self.seed)
            .device(device)
            .build()
    }
}

/// What to load for each stage. Stages left `None` are skipped.
#[derive(Debug, Default)]
pub struct StageSources {
    pub train: Option<InputSource>,
    pub val: Option<InputSource>,
    pub test: Option<InputSource>,
    pub predict: Option<InputSource>,
}

impl StageSources {
    pub fn with_train(mut self, source: InputSource) -> Self {
        self.train = Some(source);
        self
    }

    pub fn with_val(mut self, source: InputSource) -> Self {
        self.val = Some(source);
        self
    }

    pub fn with_test(mut self, source: InputSource) -> Self {
        self.test = Some(source);
        self
    }

    pub fn with_predict(mut self, source: InputSource) -> Self {
        self.predict = Some(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_none() && self.val.is_none() && self.test.is_none() && self.predict.is_none()
    }

    fn into_stages(self) -> Vec<(RunningStage, InputSource)> {
        [
            (RunningStage::Training, self.train),
            (RunningStage::Validating, self.val),
            (RunningStage::Testing, self.test),
            (RunningStage::Predicting, self.predict),
        ]
        .into_iter()
        .filter_map(|(stage, source)| source.map(|s| (stage, s)))
        .collect()
    }
}

/// The datasets of a task plus everything needed to batch them.
pub struct DataModule {
    input_transform: InputTransform,
    output_transform: Arc<dyn OutputTransform>,
    datasets: BTreeMap<RunningStage, InputDataset>,
    labels: Option<Vec<String>>,
    config: DataModuleConfig,
    device: Device,
}

impl fmt::Debug for DataModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataModule")
            .field("input_transform", &self.input_transform)
            .field("output_transform", &self.output_transform.name())
            .field(
                "datasets",
                &self.datasets.iter().map(|(s, d)| (*s, d.len())).collect::<Vec<_>>(),
            )
            .field("labels", &self.labels)
            .field("config", &self.config)
            .finish()
    }
}

impl DataModule {
    /// Loads every given stage through the input registered for `format`.
    pub fn from_input(
        input_transform: InputTransform,
        output_transform: Arc<dyn OutputTransform>,
        format: InputFormat,
        sources: StageSources,
        config: DataModuleConfig,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(!sources.is_empty(), "At least one stage needs a data source");
        let input = input_transform.input(format)?;
        let has_val_source = sources.val.is_some();

        let mut datasets = BTreeMap::new();
        for (stage, source) in sources.into_stages() {
            input_transform.provider().check_stage(stage)?;
            let dataset = InputDataset::new(stage, input.clone(), source)?;
            datasets.insert(stage, dataset);
        }

        if let Some(val_split) = config.val_split {
            if has_val_source {
                tracing::debug!("Validation source given, ignoring val_split");
            } else if let Some(train) = datasets.remove(&RunningStage::Training) {
                input_transform.provider().check_stage(RunningStage::Validating)?;
                let (train, val) = split_train(train, val_split, config.seed)?;
                datasets.insert(RunningStage::Training, train);
                datasets.insert(RunningStage::Validating, val);
            }
        }

        let labels = [RunningStage::Training, RunningStage::Validating, RunningStage::Testing]
            .iter()
            .find_map(|stage| datasets.get(stage).and_then(InputDataset::labels))
            .map(<[String]>::to_vec);

        for (stage, dataset) in &datasets {
            match dataset.len() {
                Some(len) => tracing::info!(stage = %stage, len, "Dataset ready"),
                None => tracing::info!(stage = %stage, "Streaming dataset ready"),
            }
        }

        Ok(Self {
            input_transform,
            output_transform,
            datasets,
            labels,
            config,
            device: Device::Cpu,
        })
    }

    /// Moves batches to `device` in the on-device hooks.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn input_transform(&self) -> &InputTransform {
        &self.input_transform
    }

    pub fn output_transform(&self) -> &Arc<dyn OutputTransform> {
        &self.output_transform
    }

    /// Class names, from the first labelled stage.
    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    pub fn num_classes(&self) -> Option<usize> {
        self.labels.as_ref().map(Vec::len)
    }

    pub fn stages(&self) -> Vec<RunningStage> {
        self.datasets.keys().copied().collect()
    }

    pub fn dataset(&self, stage: RunningStage) -> Option<&InputDataset> {
        self.datasets.get(&stage)
    }

    /// `None` when the stage is missing or streamed.
    pub fn dataset_len(&self, stage: RunningStage) -> Option<usize> {
        self.datasets.get(&stage).and_then(InputDataset::len)
    }

    pub fn dataloader(&self, stage: RunningStage) -> Result<DataLoader> {
        let dataset = self
            .datasets
            .get(&stage)
            .with_context(|| format!("No {} dataset was provided", stage))?;
        let pipeline = self.input_transform.pipeline(stage, self.device)?;
        DataLoader::new(
            dataset.clone(),
            pipeline,
            self.config.to_loader_config(stage, self.device),
        )
    }

    pub fn train_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(RunningStage::Training)
    }

    pub fn val_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(RunningStage::Validating)
    }

    pub fn test_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(RunningStage::Testing)
    }

    pub fn predict_dataloader(&self) -> Result<DataLoader> {
        self.dataloader(RunningStage::Predicting)
    }

    /// Renders up to `n` samples of a stage, after the pre-tensor hook,
    /// into a PNG grid at `path`.
    pub fn show_batch(&self, stage: RunningStage, n: usize, path: impl AsRef<Path>) -> Result<()> {
        ensure!(n > 0, "show_batch needs at least one sample");
        let path = path.as_ref();
        let dataset = self
            .datasets
            .get(&stage)
            .with_context(|| format!("No {} dataset was provided", stage))?;
        let pipeline = self.input_transform.pipeline(stage, Device::Cpu)?;

        let images = dataset
            .take(n)?
            .into_iter()
            .map(|sample| pipeline.pre_tensor(sample).and_then(|s| render_sample(&s)))
            .collect::<Result<Vec<_>>>()?;
        let cols = (images.len() as f64).sqrt().ceil() as usize;
        let grid = render_grid(&images, cols)?;
        grid.save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(stage = %stage, count = images.len(), path = %path.display(), "Saved sample grid");
        Ok(())
    }
}

fn split_train(train: InputDataset, val_split: f64, seed: u64) -> Result<(InputDataset, InputDataset)> {
    let train = match train {
        InputDataset::Sized(train) => train,
        InputDataset::Iterable(_) => bail!("val_split needs a sized training dataset"),
    };
    let (train_idx, val_idx) = split_indices(train.len(), val_split, seed)?;
    let val = train.subset(&val_idx, RunningStage::Validating)?;
    let train = train.subset(&train_idx, RunningStage::Training)?;
    tracing::info!(
        train = train.len(),
        val = val.len(),
        val_split,
        "Split validation set off the training data"
    );
    Ok((InputDataset::Sized(train), InputDataset::Sized(val)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_transform::{StageTransforms, TransformProvider};
    use crate::io::image::{ImagePathsInput, IterableImageFolderInput};
    use crate::output_transform::DefaultOutputTransform;
    use crate::transforms::vision::Resize;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct NoValidation;

    impl TransformProvider for NoValidation {
        fn name(&self) -> &'static str {
            "no_validation"
        }

        fn default_transforms(&self, stage: RunningStage) -> Option<StageTransforms> {
            match stage {
                RunningStage::Validating => None,
                _ => Resize::new(8, 8).ok().map(|r| StageTransforms::new().with_pre_tensor(r)),
            }
        }
    }

    struct Sized8;

    impl TransformProvider for Sized8 {
        fn name(&self) -> &'static str {
            "sized8"
        }

        fn default_transforms(&self, _stage: RunningStage) -> Option<StageTransforms> {
            Resize::new(8, 8).ok().map(|r| StageTransforms::new().with_pre_tensor(r))
        }
    }

    /// `root/{cat,dog}/{0..per_class}.png`
    fn class_folders(per_class: usize) -> Result<(TempDir, PathBuf)> {
        let dir = TempDir::new()?;
        for class in ["cat", "dog"] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir_all(&class_dir)?;
            for i in 0..per_class {
                RgbImage::from_pixel(6 + i as u32, 5, Rgb([i as u8 * 20, 0, 0])).save(class_dir.join(format!("{}.png", i)))?;
            }
        }
        let root = dir.path().to_path_buf();
        Ok((dir, root))
    }

    fn module(
        provider: impl TransformProvider + 'static,
        sources: StageSources,
        config: DataModuleConfig,
    ) -> Result<DataModule> {
        let transform = InputTransform::new(provider).with_input(InputFormat::Folders, ImagePathsInput);
        DataModule::from_input(
            transform,
            Arc::new(DefaultOutputTransform),
            InputFormat::Folders,
            sources,
            config,
        )
    }

    #[test]
    fn test_config_defaults_from_toml() -> Result<()> {
        let config: DataModuleConfig = toml::from_str("batch_size = 8\nval_split = 0.2")?;
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.seed, 42);
        assert!(config.shuffle);
        assert!(!config.to_loader_config(RunningStage::Validating, Device::Cpu).shuffle);
        assert!(config.to_loader_config(RunningStage::Training, Device::Cpu).shuffle);
        assert!(DataModuleConfig { val_split: Some(1.0), ..Default::default() }.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_val_split_and_labels() -> Result<()> {
        let (_dir, root) = class_folders(5)?;
        let config = DataModuleConfig {
            batch_size: 3,
            val_split: Some(0.2),
            ..Default::default()
        };
        let data = module(Sized8, StageSources::default().with_train(InputSource::Folder(root)), config)?;

        assert_eq!(data.labels(), Some(&["cat".to_string(), "dog".to_string()][..]));
        assert_eq!(data.num_classes(), Some(2));
        assert_eq!(data.dataset_len(RunningStage::Training), Some(8));
        assert_eq!(data.dataset_len(RunningStage::Validating), Some(2));

        let loader = data.train_dataloader()?;
        let mut seen = 0;
        for batch in loader.iter()? {
            let batch = batch?;
            assert_eq!(batch.get("input")?.size()[1..], [3, 8, 8]);
            seen += batch.batch_size()?;
        }
        assert_eq!(seen, 8);
        assert!(data.test_dataloader().is_err());
        Ok(())
    }

    #[test]
    fn test_unsupported_stage_source_is_rejected() -> Result<()> {
        let (_dir, root) = class_folders(2)?;
        let sources = StageSources::default()
            .with_train(InputSource::Folder(root.clone()))
            .with_val(InputSource::Folder(root.clone()));
        assert!(module(NoValidation, sources, DataModuleConfig::default()).is_err());

        let split = DataModuleConfig {
            val_split: Some(0.5),
            ..Default::default()
        };
        let sources = StageSources::default().with_train(InputSource::Folder(root));
        assert!(module(NoValidation, sources, split).is_err());
        Ok(())
    }

    #[test]
    fn test_show_batch_writes_grid() -> Result<()> {
        let (dir, root) = class_folders(2)?;
        let data = module(
            Sized8,
            StageSources::default().with_predict(InputSource::Folder(root)),
            DataModuleConfig::default(),
        )?;
        let out = dir.path().join("grid.png");
        data.show_batch(RunningStage::Predicting, 3, &out)?;
        let grid = image::open(&out)?;
        assert_eq!((grid.width(), grid.height()), (16, 16));
        Ok(())
    }

    #[test]
    fn test_streamed_folder_stage() -> Result<()> {
        let (_dir, root) = class_folders(2)?;
        let transform = InputTransform::new(Sized8).with_input(InputFormat::Folders, IterableImageFolderInput);
        let data = DataModule::from_input(
            transform,
            Arc::new(DefaultOutputTransform),
            InputFormat::Folders,
            StageSources::default().with_predict(InputSource::Folder(root)),
            DataModuleConfig {
                batch_size: 3,
                num_workers: 2,
                ..Default::default()
            },
        )?;
        assert_eq!(data.dataset_len(RunningStage::Predicting), None);
        assert_eq!(data.labels(), None);

        // Two epochs: the folder is walked again for each.
        let loader = data.predict_dataloader()?;
        for _ in 0..2 {
            let mut sizes = Vec::new();
            for batch in loader.iter()? {
                let batch = batch?;
                assert_eq!(batch.get("input")?.size()[1..], [3, 8, 8]);
                sizes.push(batch.batch_size()?);
            }
            assert_eq!(sizes, vec![3, 1]);
        }
        Ok(())
    }
}
