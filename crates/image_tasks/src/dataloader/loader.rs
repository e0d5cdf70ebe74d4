use crate::dataloader::common::thread::{init_worker_rng, with_worker_rng, worker_rng};
use crate::dataloader::config::DataLoaderConfig;
use crate::dataloader::workers::pool::WorkerPool;
use crate::dataloader::workers::{process_task, WorkerOutput, WorkerTask};
use crate::dataset::InputDataset;
use crate::input_transform::StagePipeline;
use crate::minibatch::MiniBatch;
use crate::sample::DataSample;
use crate::sampler::{BatchSampler, RandomSampler, Sampler, SequentialSampler};
use crate::stage::RunningStage;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Batches one stage's dataset through its [`StagePipeline`].
///
/// Every call to [`iter`](Self::iter) is one epoch. Sized datasets are
/// visited in sampler order (shuffled per epoch when configured); streams
/// are read in order and chunked into batches.
pub struct DataLoader {
    dataset: Arc<InputDataset>,
    pipeline: Arc<StagePipeline>,
    config: DataLoaderConfig,
    epoch: AtomicUsize,
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("stage", &self.pipeline.stage())
            .field("dataset_len", &self.dataset.len())
            .field("config", &self.config)
            .finish()
    }
}

impl DataLoader {
    pub fn new(dataset: InputDataset, pipeline: StagePipeline, config: DataLoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dataset: Arc::new(dataset),
            pipeline: Arc::new(pipeline),
            config,
            epoch: AtomicUsize::new(0),
        })
    }

    pub fn stage(&self) -> RunningStage {
        self.pipeline.stage()
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    pub fn dataset(&self) -> &InputDataset {
        &self.dataset
    }

    /// Epochs started so far.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of batches per epoch; `None` for streams.
    pub fn len(&self) -> Option<usize> {
        let n = self.dataset.len()?;
        let bs = self.config.batch_size;
        Some(if self.config.drop_last { n / bs } else { n.div_ceil(bs) })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Starts the next epoch.
    pub fn iter(&self) -> Result<DataLoaderIter> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let batches = self.batches(epoch)?;

        let mode = if self.config.num_workers == 0 {
            Mode::Single {
                rng: self.config.seed.map(|seed| worker_rng(0, epoch, seed)),
            }
        } else {
            Mode::Workers(self.spawn_workers(epoch)?)
        };

        tracing::debug!(stage = %self.stage(), epoch, num_workers = self.config.num_workers, "Starting epoch");
        Ok(DataLoaderIter {
            dataset: self.dataset.clone(),
            pipeline: self.pipeline.clone(),
            batches,
            mode,
            next_to_send: 0,
            next_to_yield: 0,
            in_flight: 0,
            per_worker: vec![0; self.config.num_workers],
            prefetch_factor: self.config.prefetch_factor,
            pending: BTreeMap::new(),
            timeout: self.config.timeout,
        })
    }

    fn batches(&self, epoch: usize) -> Result<Batches> {
        let bs = self.config.batch_size;
        let drop_last = self.config.drop_last;
        match self.dataset.as_ref() {
            InputDataset::Sized(dataset) => {
                let sampler: Box<dyn Sampler<Item = usize>> = if self.config.shuffle {
                    let seed = self.config.seed.unwrap_or_else(rand::random);
                    Box::new(RandomSampler::new(dataset.len(), false, None, seed)?)
                } else {
                    Box::new(SequentialSampler::new(dataset.len()))
                };
                let batch_sampler = BatchSampler::new(sampler, bs, drop_last)?;
                let indices: Vec<Vec<usize>> = batch_sampler.iter(epoch).collect();
                Ok(Batches::Indices(indices.into_iter()))
            }
            InputDataset::Iterable(dataset) => Ok(Batches::Stream {
                stream: dataset.stream_raw()?,
                batch_size: bs,
                drop_last,
                done: false,
            }),
        }
    }

    fn spawn_workers(&self, epoch: usize) -> Result<WorkerPool<WorkerTask, WorkerOutput>> {
        let dataset = self.dataset.clone();
        let pipeline = self.pipeline.clone();
        let seed = self.config.seed;
        let worker_timeout = self.config.worker_timeout;

        WorkerPool::new(
            self.config.num_workers,
            self.config.prefetch_factor,
            move |task_rx, output_tx, shutdown| {
                let worker_id = crate::dataloader::current_worker_id();
                if let Some(seed) = seed {
                    init_worker_rng(worker_id, epoch, seed);
                }
                while !shutdown.load(Ordering::Relaxed) {
                    match task_rx.recv_timeout(worker_timeout) {
                        Ok(task) => {
                            let output = process_task(&dataset, &pipeline, task);
                            if output_tx.send(output).is_err() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            },
        )
        .context("Failed to start data loading workers")
    }
}

enum Batches {
    Indices(std::vec::IntoIter<Vec<usize>>),
    Stream {
        stream: Box<dyn Iterator<Item = Result<DataSample>> + Send>,
        batch_size: usize,
        drop_last: bool,
        done: bool,
    },
}

impl Batches {
    fn next_task(&mut self, batch_idx: usize) -> Option<Result<WorkerTask>> {
        match self {
            Batches::Indices(iter) => iter.next().map(|indices| Ok(WorkerTask::Indices { batch_idx, indices })),
            Batches::Stream {
                stream,
                batch_size,
                drop_last,
                done,
            } => {
                if *done {
                    return None;
                }
                let mut samples = Vec::with_capacity(*batch_size);
                while samples.len() < *batch_size {
                    match stream.next() {
                        Some(Ok(sample)) => samples.push(sample),
                        Some(Err(e)) => {
                            *done = true;
                            return Some(Err(e.context(format!("Failed to read batch {}", batch_idx))));
                        }
                        None => {
                            *done = true;
                            break;
                        }
                    }
                }
                if samples.is_empty() || (*drop_last && samples.len() < *batch_size) {
                    None
                } else {
                    Some(Ok(WorkerTask::Samples { batch_idx, samples }))
                }
            }
        }
    }
}

enum Mode {
    /// Batches are built on the calling thread, with `rng` installed as the
    /// worker RNG while each one is processed.
    Single { rng: Option<rand::rngs::StdRng> },
    Workers(WorkerPool<WorkerTask, WorkerOutput>),
}

/// One epoch of batches, in order. Dropping it stops the workers.
pub struct DataLoaderIter {
    dataset: Arc<InputDataset>,
    pipeline: Arc<StagePipeline>,
    batches: Batches,
    mode: Mode,
    next_to_send: usize,
    next_to_yield: usize,
    in_flight: usize,
    /// Tasks sent to each worker and not yet received back.
    per_worker: Vec<usize>,
    prefetch_factor: usize,
    /// Results that arrived ahead of their turn.
    pending: BTreeMap<usize, Result<MiniBatch>>,
    timeout: std::time::Duration,
}

impl DataLoaderIter {
    /// Queues batches round-robin until the next worker in line already holds
    /// `prefetch_factor` tasks. A worker's channel never fills, so sending
    /// never blocks past the receive timeout.
    fn fill(&mut self, pool_size: usize) -> Result<()> {
        loop {
            let batch_idx = self.next_to_send;
            let worker = batch_idx % pool_size;
            if self.per_worker[worker] >= self.prefetch_factor {
                break;
            }
            let task = match self.batches.next_task(batch_idx) {
                None => break,
                Some(task) => task,
            };
            self.next_to_send += 1;
            match task {
                Ok(task) => {
                    if let Mode::Workers(pool) = &self.mode {
                        pool.send(worker, task)?;
                        self.per_worker[worker] += 1;
                        self.in_flight += 1;
                    }
                }
                Err(e) => {
                    self.pending.insert(batch_idx, Err(e));
                }
            }
        }
        Ok(())
    }

    fn next_from_workers(&mut self) -> Option<Result<MiniBatch>> {
        let pool_size = match &self.mode {
            Mode::Workers(pool) => pool.num_workers(),
            Mode::Single { .. } => return None,
        };
        if let Err(e) = self.fill(pool_size) {
            return Some(Err(e));
        }

        loop {
            if let Some(result) = self.pending.remove(&self.next_to_yield) {
                self.next_to_yield += 1;
                if let Err(e) = self.fill(pool_size) {
                    return Some(Err(e));
                }
                return Some(result);
            }
            if self.in_flight == 0 {
                return None;
            }
            let Mode::Workers(pool) = &self.mode else {
                return None;
            };
            match pool.recv_timeout(self.timeout) {
                Ok(output) => {
                    self.per_worker[output.batch_idx % pool_size] -= 1;
                    self.in_flight -= 1;
                    self.pending.insert(output.batch_idx, output.result);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Some(Err(anyhow!(
                        "Timed out after {:?} waiting for batch {}",
                        self.timeout,
                        self.next_to_yield
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(Err(anyhow!(
                        "Workers stopped before producing batch {}",
                        self.next_to_yield
                    )));
                }
            }
        }
    }
}

impl Iterator for DataLoaderIter {
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.mode {
            Mode::Single { rng } => {
                let batch_idx = self.next_to_send;
                let task = self.batches.next_task(batch_idx)?;
                self.next_to_send += 1;
                self.next_to_yield += 1;
                let (dataset, pipeline) = (&self.dataset, &self.pipeline);
                Some(task.and_then(|task| with_worker_rng(rng, || process_task(dataset, pipeline, task).result)))
            }
            Mode::Workers(_) => self.next_from_workers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetInfo, InMemoryDataset, IterableDataset};
    use crate::input_transform::StageTransforms;
    use crate::io::input::PassThroughInput;
    use crate::sample::{Metadata, SampleInput, Target};
    use crate::transforms::core::from_fn;
    use crate::transforms::vision::RandomHorizontalFlip;
    use std::time::Duration;
    use tch::{Device, Kind, Tensor};

    /// Sample `i` is a 1x1x2 image whose left pixel holds `i` and right pixel 0.
    fn samples(n: usize) -> Vec<DataSample> {
        (0..n)
            .map(|i| {
                let tensor = Tensor::from_slice(&[i as u8, 0]).reshape([1, 1, 2]);
                let image = crate::transforms::vision::tensor_to_image(&tensor).unwrap();
                DataSample::new(SampleInput::Image(image))
                    .with_target(Target::Class(i))
                    .with_metadata(Metadata::default().with_extra("index", i.into()))
            })
            .collect()
    }

    fn info() -> DatasetInfo {
        DatasetInfo {
            stage: RunningStage::Training,
            input: Arc::new(PassThroughInput),
            labels: None,
        }
    }

    fn pipeline(transforms: StageTransforms) -> StagePipeline {
        StagePipeline::new(RunningStage::Training, transforms, Device::Cpu)
    }

    fn targets(loader: &DataLoader) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for batch in loader.iter()? {
            let target = batch?.get("target")?.shallow_clone();
            out.extend(Vec::<i64>::try_from(&target)?);
        }
        Ok(out)
    }

    #[test]
    fn test_sequential_batches_in_order() -> Result<()> {
        let dataset = InputDataset::Sized(InMemoryDataset::new(samples(5), info()));
        let config = DataLoaderConfig::builder().batch_size(2).build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new()), config)?;
        assert_eq!(loader.len(), Some(3));
        assert_eq!(targets(&loader)?, vec![0, 1, 2, 3, 4]);
        assert_eq!(loader.epoch(), 1);
        Ok(())
    }

    #[test]
    fn test_workers_keep_sampler_order() -> Result<()> {
        let dataset = InputDataset::Sized(InMemoryDataset::new(samples(9), info()));
        let config = DataLoaderConfig::builder()
            .batch_size(2)
            .num_workers(3)
            .shuffle(true)
            .seed(11)
            .build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new()), config)?;

        let first = targets(&loader)?;
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..9).collect::<Vec<_>>());

        // Same seed, same epoch: same order as a single-threaded loader.
        let single = DataLoader::new(
            InputDataset::Sized(InMemoryDataset::new(samples(9), info())),
            pipeline(StageTransforms::new()),
            DataLoaderConfig::builder().batch_size(2).shuffle(true).seed(11).build(),
        )?;
        assert_eq!(targets(&single)?, first);
        Ok(())
    }

    #[test]
    fn test_drop_last() -> Result<()> {
        let dataset = InputDataset::Sized(InMemoryDataset::new(samples(5), info()));
        let config = DataLoaderConfig::builder().batch_size(2).drop_last(true).num_workers(2).build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new()), config)?;
        assert_eq!(loader.len(), Some(2));
        assert_eq!(loader.iter()?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_stream_is_chunked() -> Result<()> {
        let dataset = InputDataset::Iterable(IterableDataset::new(Arc::new(samples(5)), info()));
        let config = DataLoaderConfig::builder().batch_size(2).num_workers(2).build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new()), config)?;
        assert_eq!(loader.len(), None);
        assert_eq!(targets(&loader)?, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_seeded_augmentation_is_reproducible() -> Result<()> {
        let flips = || -> Result<Vec<f64>> {
            let dataset = InputDataset::Sized(InMemoryDataset::new(samples(16), info()));
            let transforms = StageTransforms::new().with_pre_tensor(RandomHorizontalFlip::new(0.5)?);
            let config = DataLoaderConfig::builder().batch_size(4).num_workers(2).seed(3).build();
            let loader = DataLoader::new(dataset, pipeline(transforms), config)?;
            let mut out = Vec::new();
            for batch in loader.iter()? {
                // Right pixel is non-zero only when the sample was flipped.
                let input = batch?.get("input")?.shallow_clone();
                let right = input.select(3, 1).to_kind(Kind::Double).sum(Kind::Double);
                out.push(right.double_value(&[]));
            }
            Ok(out)
        };
        assert_eq!(flips()?, flips()?);
        Ok(())
    }

    #[test]
    fn test_errors_name_the_batch() -> Result<()> {
        let broken = vec![DataSample::from_path("missing.png")];
        let dataset = InputDataset::Sized(InMemoryDataset::new(broken, info()));
        let config = DataLoaderConfig::builder()
            .num_workers(1)
            .timeout(Duration::from_secs(5))
            .build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new()), config)?;
        let err = loader.iter()?.next().map(|r| r.map(|_| ()));
        let message = match err {
            Some(Err(e)) => format!("{:#}", e),
            _ => String::new(),
        };
        assert!(message.contains("batch 0"), "{}", message);
        Ok(())
    }

    #[test]
    fn test_stalled_worker_times_out_without_blocking() -> Result<()> {
        let dataset = InputDataset::Sized(InMemoryDataset::new(samples(8), info()));
        let stall = from_fn(|sample: DataSample| {
            if sample.metadata.extra.get("index") == Some(&serde_json::json!(0)) {
                std::thread::sleep(Duration::from_secs(2));
            }
            Ok(sample)
        });
        let config = DataLoaderConfig::builder()
            .num_workers(3)
            .prefetch_factor(1)
            .timeout(Duration::from_millis(100))
            .build();
        let loader = DataLoader::new(dataset, pipeline(StageTransforms::new().with_pre_tensor(stall)), config)?;

        // Batch 3 waits behind batch 0 on the same worker; later calls must
        // keep timing out instead of blocking on a full task channel.
        let mut iter = loader.iter()?;
        for _ in 0..4 {
            let message = match iter.next() {
                Some(Err(e)) => format!("{:#}", e),
                other => panic!("expected a timeout, got {:?}", other.map(|r| r.is_ok())),
            };
            assert!(message.contains("batch 0"), "{}", message);
        }
        Ok(())
    }

    #[test]
    fn test_interleaved_seeded_loaders_keep_their_streams() -> Result<()> {
        let loader = || -> Result<DataLoader> {
            let dataset = InputDataset::Sized(InMemoryDataset::new(samples(16), info()));
            let transforms = StageTransforms::new().with_pre_tensor(RandomHorizontalFlip::new(0.5)?);
            let config = DataLoaderConfig::builder().batch_size(4).seed(3).build();
            DataLoader::new(dataset, pipeline(transforms), config)
        };
        let flipped = |batch: Result<MiniBatch>| -> Result<f64> {
            let input = batch?.get("input")?.shallow_clone();
            Ok(input.select(3, 1).to_kind(Kind::Double).sum(Kind::Double).double_value(&[]))
        };

        let alone = loader()?.iter()?.map(flipped).collect::<Result<Vec<_>>>()?;

        let (a, b) = (loader()?, loader()?);
        let mut interleaved = Vec::new();
        for batch in a.iter()? {
            interleaved.push(flipped(batch)?);
            for other in b.iter()? {
                flipped(other)?;
            }
        }
        assert_eq!(interleaved, alone);
        Ok(())
    }
}
