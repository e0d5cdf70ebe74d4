//! Worker side of parallel loading: what a worker is asked to do and how
//! it does it.

pub(crate) mod pool;

use crate::dataset::InputDataset;
use crate::input_transform::StagePipeline;
use crate::minibatch::MiniBatch;
use crate::sample::DataSample;
use anyhow::{Context, Result};

/// One batch of work.
pub(crate) enum WorkerTask {
    /// Sized datasets: the worker loads the samples itself.
    Indices { batch_idx: usize, indices: Vec<usize> },
    /// Streams: raw samples are read on the main thread, loaded here.
    Samples { batch_idx: usize, samples: Vec<DataSample> },
}

impl WorkerTask {
    pub(crate) fn batch_idx(&self) -> usize {
        match self {
            WorkerTask::Indices { batch_idx, .. } | WorkerTask::Samples { batch_idx, .. } => *batch_idx,
        }
    }
}

pub(crate) struct WorkerOutput {
    pub(crate) batch_idx: usize,
    pub(crate) result: Result<MiniBatch>,
}

/// Loads the samples of a task and runs them through the stage pipeline.
pub(crate) fn process_task(dataset: &InputDataset, pipeline: &StagePipeline, task: WorkerTask) -> WorkerOutput {
    let batch_idx = task.batch_idx();
    let result = load_samples(dataset, task)
        .and_then(|samples| pipeline.process_batch(samples))
        .with_context(|| format!("Failed to build batch {}", batch_idx));
    WorkerOutput { batch_idx, result }
}

fn load_samples(dataset: &InputDataset, task: WorkerTask) -> Result<Vec<DataSample>> {
    match (dataset, task) {
        (InputDataset::Sized(dataset), WorkerTask::Indices { indices, .. }) => {
            indices.into_iter().map(|i| dataset.get(i)).collect()
        }
        (dataset, WorkerTask::Samples { samples, .. }) => {
            let input = dataset.info().input.clone();
            samples.into_iter().map(|s| input.load_sample(s)).collect()
        }
        (InputDataset::Iterable(_), WorkerTask::Indices { .. }) => {
            anyhow::bail!("Iterable datasets cannot be indexed")
        }
    }
}
