use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image_tasks::io::input::{InputFormat, InputSource};
use image_tasks::tasks::{self, TaskRegistry, TaskSpec, TransformConfig};
use image_tasks::utils::download_data;
use image_tasks::{DataModule, DataModuleConfig, MiniBatch, RunningStage, StageSources};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "image-tasks", version, about = "Inspect image task data pipelines")]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the registered tasks.
    List,
    /// Run every stage for one epoch and print batch shapes as JSON.
    Inspect(DataArgs),
    /// Write a grid of samples as a PNG.
    Visualize {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long, default_value = "samples.png")]
        output: PathBuf,
        #[arg(long, default_value_t = 16)]
        count: usize,
        #[arg(long, default_value = "train", value_parser = parse_stage)]
        stage: RunningStage,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct DataArgs {
    #[arg(long)]
    task: String,
    #[arg(long)]
    train_folder: Option<PathBuf>,
    #[arg(long)]
    val_folder: Option<PathBuf>,
    #[arg(long)]
    test_folder: Option<PathBuf>,
    #[arg(long)]
    predict_folder: Option<PathBuf>,
    /// FiftyOne label file used for training.
    #[arg(long)]
    fiftyone: Option<PathBuf>,
    #[arg(long, default_value = "ground_truth")]
    label_field: String,
    #[arg(long, requires = "coco_annotations")]
    coco_images: Option<PathBuf>,
    #[arg(long, requires = "coco_images")]
    coco_annotations: Option<PathBuf>,
    #[arg(long)]
    val_split: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    num_workers: Option<usize>,
    #[arg(long, num_args = 2, value_names = ["H", "W"])]
    image_size: Option<Vec<u32>>,
    /// TOML file with `[data]` and `[transform]` sections.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dataset archive fetched into `--data-dir` before loading.
    #[arg(long)]
    download_url: Option<String>,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    data: DataModuleConfig,
    transform: toml::Table,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

fn parse_stage(name: &str) -> Result<RunningStage, String> {
    RunningStage::ALL
        .into_iter()
        .find(|stage| stage.as_str() == name)
        .ok_or_else(|| format!("unknown stage '{}', expected train, val, test or predict", name))
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

impl DataArgs {
    /// Config file values, overridden by flags.
    fn data_config(&self, file: &FileConfig) -> DataModuleConfig {
        let mut config = file.data.clone();
        if let Some(split) = self.val_split {
            config.val_split = Some(split);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        config
    }

    /// Task defaults, then the `[transform]` section, then `--image-size`.
    fn transform_args(&self, spec: &TaskSpec, file: &FileConfig) -> Result<serde_json::Value> {
        let mut args = match spec.arguments("input_transform") {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let section = serde_json::to_value(&file.transform)?;
        let _: TransformConfig = serde_json::from_value(section.clone()).context("Invalid [transform] section")?;
        if let serde_json::Value::Object(section) = section {
            args.extend(section);
        }
        if let Some(size) = &self.image_size {
            args.insert("image_size".to_string(), serde_json::json!(size));
        }
        Ok(serde_json::Value::Object(args))
    }

    fn sources(&self) -> Result<(InputFormat, StageSources)> {
        let predict = self.predict_folder.clone().map(InputSource::Folder);
        if let Some(path) = &self.fiftyone {
            if predict.is_some() {
                bail!("--predict-folder cannot be combined with --fiftyone");
            }
            let source = InputSource::FiftyOne {
                path: path.clone(),
                label_field: self.label_field.clone(),
            };
            return Ok((InputFormat::FiftyOne, StageSources::default().with_train(source)));
        }
        if let (Some(images_dir), Some(annotations)) = (&self.coco_images, &self.coco_annotations) {
            let sources = StageSources {
                train: Some(InputSource::Coco {
                    images_dir: images_dir.clone(),
                    annotations: annotations.clone(),
                }),
                predict,
                ..Default::default()
            };
            return Ok((InputFormat::Coco, sources));
        }
        let sources = StageSources {
            train: self.train_folder.clone().map(InputSource::Folder),
            val: self.val_folder.clone().map(InputSource::Folder),
            test: self.test_folder.clone().map(InputSource::Folder),
            predict,
        };
        if sources.is_empty() {
            bail!("No data given: pass stage folders, --fiftyone or --coco-images/--coco-annotations");
        }
        Ok((InputFormat::Folders, sources))
    }

    fn data_module(&self, registry: &TaskRegistry) -> Result<DataModule> {
        let spec = registry.get(&self.task)?;
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if let Some(url) = &self.download_url {
            download_data(url, &self.data_dir)?;
        }
        let (format, sources) = self.sources()?;
        let args = self.transform_args(spec, &file)?;
        tracing::debug!(task = %spec.name, %format, %args, "Building data module");
        tasks::data_module(spec, &args, format, sources, self.data_config(&file))
    }
}

fn list(registry: &TaskRegistry) -> Result<()> {
    let tasks: Vec<_> = registry
        .iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "description": spec.description,
                "formats": spec.formats,
                "default_format": spec.default_format,
                "default_arguments": spec.default_arguments,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

/// Shapes of every feature; ragged features list one shape per sample.
fn batch_shapes(batch: &MiniBatch) -> BTreeMap<String, serde_json::Value> {
    let stacked = batch
        .tensors
        .iter()
        .map(|(name, tensor)| (name.clone(), serde_json::json!(tensor.size())));
    let ragged = batch.lists.iter().map(|(name, list)| {
        let shapes: Vec<_> = list.iter().map(|t| t.size()).collect();
        (name.clone(), serde_json::json!(shapes))
    });
    stacked.chain(ragged).collect()
}

fn inspect(data: &DataModule) -> Result<serde_json::Value> {
    let mut stages = serde_json::Map::new();
    for stage in data.stages() {
        let loader = data.dataloader(stage)?;
        let mut batches = 0;
        let mut samples = 0;
        let mut shapes = BTreeMap::new();
        for batch in loader.iter()? {
            let batch = batch.with_context(|| format!("Failed to load a {} batch", stage))?;
            if batches == 0 {
                shapes = batch_shapes(&batch);
            }
            samples += batch.batch_size()?;
            batches += 1;
        }
        tracing::info!(stage = %stage, batches, samples, "Finished epoch");
        stages.insert(
            stage.as_str().to_string(),
            serde_json::json!({ "batches": batches, "samples": samples, "first_batch": shapes }),
        );
    }
    Ok(serde_json::json!({
        "labels": data.labels(),
        "stages": stages,
    }))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let registry = TaskRegistry::with_defaults();

    match cli.command {
        Command::List => list(&registry),
        Command::Inspect(args) => {
            let data = args.data_module(&registry)?;
            let mut report = inspect(&data)?;
            report["task"] = serde_json::json!(args.task);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Visualize {
            data,
            output,
            count,
            stage,
        } => data.data_module(&registry)?.show_batch(stage, count, output),
    }
}
