//! Running a model over batches: loss, metrics and formatted predictions.
//!
//! The model itself is user code behind [`Model`]. A [`Task`] ties it to a
//! [`TaskHead`] (loss and metrics) and to the output transform and output
//! the task formats predictions with.
//!
//! ```ignore
//! let task = Task::new(TaskHead::classification(false), model, output_transform, output);
//! let scores = task.evaluate(&data.val_dataloader()?)?;
//! let predictions = task.predict(&data.predict_dataloader()?)?;
//! ```

use crate::dataloader::DataLoader;
use crate::io::output::{Output, Prediction};
use crate::minibatch::MiniBatch;
use crate::output_transform::OutputTransform;
use crate::sample::DataKey;
use crate::tasks::TaskSpec;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tch::{Kind, Reduction, Tensor};

/// Anything that maps a batch to predictions.
pub trait Model: Send + Sync {
    fn forward(&self, batch: &MiniBatch) -> Result<Tensor>;
}

impl<F> Model for F
where
    F: Fn(&MiniBatch) -> Result<Tensor> + Send + Sync,
{
    fn forward(&self, batch: &MiniBatch) -> Result<Tensor> {
        self(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFn {
    /// Logits `[B, C]`, class indices `[B]`.
    CrossEntropy,
    /// Logits and multi-hot targets of the same shape.
    BinaryCrossEntropyWithLogits,
    MeanSquaredError,
    L1,
}

impl LossFn {
    /// Mean over the batch.
    pub fn compute(&self, preds: &Tensor, target: &Tensor) -> Result<Tensor> {
        let loss = match self {
            LossFn::CrossEntropy => {
                ensure!(
                    preds.dim() == 2 && target.dim() == 1 && preds.size()[0] == target.size()[0],
                    "Cross-entropy needs [B, C] logits and [B] targets, got {:?} and {:?}",
                    preds.size(),
                    target.size()
                );
                preds
                    .log_softmax(-1, Kind::Float)
                    .f_nll_loss::<Tensor>(&target.to_kind(Kind::Int64), None, Reduction::Mean, -100)?
            }
            other => {
                ensure!(
                    preds.size() == target.size(),
                    "{:?} needs predictions and targets of the same shape, got {:?} and {:?}",
                    other,
                    preds.size(),
                    target.size()
                );
                let target = target.to_kind(Kind::Float);
                let preds = preds.to_kind(Kind::Float);
                match other {
                    LossFn::BinaryCrossEntropyWithLogits => {
                        preds.f_binary_cross_entropy_with_logits::<Tensor>(&target, None, None, Reduction::Mean)?
                    }
                    LossFn::MeanSquaredError => preds.f_mse_loss(&target, Reduction::Mean)?,
                    _ => preds.f_l1_loss(&target, Reduction::Mean)?,
                }
            }
        };
        Ok(loss)
    }
}

/// A metric accumulated over batches.
pub trait Metric: Send {
    fn name(&self) -> &'static str;

    fn update(&mut self, preds: &Tensor, target: &Tensor) -> Result<()>;

    /// `0.0` before any update.
    fn compute(&self) -> f64;

    fn reset(&mut self);
}

/// Argmax accuracy, or element-wise accuracy of thresholded multi-label
/// predictions.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    threshold: Option<f64>,
    correct: u64,
    total: u64,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predictions are probabilities; `>= threshold` counts as present.
    pub fn multi_label(threshold: f64) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::default()
        }
    }
}

impl Metric for Accuracy {
    fn name(&self) -> &'static str {
        "accuracy"
    }

    fn update(&mut self, preds: &Tensor, target: &Tensor) -> Result<()> {
        let (hits, count) = match self.threshold {
            Some(threshold) => {
                ensure!(
                    preds.size() == target.size(),
                    "Multi-label accuracy needs matching shapes, got {:?} and {:?}",
                    preds.size(),
                    target.size()
                );
                let predicted = preds.ge(threshold);
                let actual = target.ge(0.5);
                (predicted.eq_tensor(&actual), target.numel())
            }
            None => {
                ensure!(
                    preds.dim() == 2 && target.dim() == 1,
                    "Accuracy needs [B, C] scores and [B] targets, got {:?} and {:?}",
                    preds.size(),
                    target.size()
                );
                let predicted = preds.argmax(-1, false);
                (predicted.eq_tensor(&target.to_kind(Kind::Int64)), target.numel())
            }
        };
        self.correct += hits.sum(Kind::Int64).int64_value(&[]) as u64;
        self.total += count as u64;
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError {
    sum_squared: f64,
    count: u64,
}

impl Metric for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mse"
    }

    fn update(&mut self, preds: &Tensor, target: &Tensor) -> Result<()> {
        ensure!(
            preds.size() == target.size(),
            "MSE needs matching shapes, got {:?} and {:?}",
            preds.size(),
            target.size()
        );
        let diff = preds.to_kind(Kind::Double) - target.to_kind(Kind::Double);
        self.sum_squared += (&diff * &diff).sum(Kind::Double).double_value(&[]);
        self.count += preds.numel() as u64;
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_squared / self.count as f64
        }
    }

    fn reset(&mut self) {
        self.sum_squared = 0.0;
        self.count = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadKind {
    Classification { multi_label: bool },
    Regression,
}

/// Loss, metrics and the activation applied before metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHead {
    kind: HeadKind,
    loss: LossFn,
}

impl TaskHead {
    /// Cross-entropy, or BCE with logits when multi-label; accuracy.
    pub fn classification(multi_label: bool) -> Self {
        Self {
            kind: HeadKind::Classification { multi_label },
            loss: if multi_label {
                LossFn::BinaryCrossEntropyWithLogits
            } else {
                LossFn::CrossEntropy
            },
        }
    }

    /// MSE loss and an MSE metric.
    pub fn regression() -> Self {
        Self {
            kind: HeadKind::Regression,
            loss: LossFn::MeanSquaredError,
        }
    }

    pub fn with_loss(mut self, loss: LossFn) -> Self {
        self.loss = loss;
        self
    }

    pub fn loss(&self) -> LossFn {
        self.loss
    }

    /// Fresh, empty metrics.
    pub fn metrics(&self) -> Vec<Box<dyn Metric>> {
        match self.kind {
            HeadKind::Classification { multi_label: true } => vec![Box::new(Accuracy::multi_label(0.5))],
            HeadKind::Classification { multi_label: false } => vec![Box::new(Accuracy::new())],
            HeadKind::Regression => vec![Box::new(MeanSquaredError::default())],
        }
    }

    /// Softmax over classes, sigmoid when multi-label, unchanged for regression.
    pub fn to_metrics_format(&self, preds: &Tensor) -> Tensor {
        match self.kind {
            HeadKind::Classification { multi_label: false } => preds.softmax(-1, Kind::Float),
            HeadKind::Classification { multi_label: true } => preds.sigmoid(),
            HeadKind::Regression => preds.shallow_clone(),
        }
    }
}

/// Loss of one batch (still attached to the graph) and its metrics.
#[derive(Debug)]
pub struct StepOutput {
    pub loss: Tensor,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalOutput {
    /// Mean of the per-batch losses.
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
    pub batches: usize,
}

pub struct Task {
    head: TaskHead,
    model: Box<dyn Model>,
    output_transform: Arc<dyn OutputTransform>,
    output: Arc<dyn Output>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("head", &self.head)
            .field("output_transform", &self.output_transform.name())
            .field("output", &self.output.name())
            .finish()
    }
}

impl Task {
    pub fn new(
        head: TaskHead,
        model: impl Model + 'static,
        output_transform: Arc<dyn OutputTransform>,
        output: Arc<dyn Output>,
    ) -> Self {
        Self {
            head,
            model: Box::new(model),
            output_transform,
            output,
        }
    }

    /// Output transform and output from the registry entry.
    pub fn from_spec(
        spec: &TaskSpec,
        args: &serde_json::Value,
        labels: Option<&[String]>,
        head: TaskHead,
        model: impl Model + 'static,
    ) -> Result<Self> {
        let output = (spec.build_output)(args, labels)
            .with_context(|| format!("Failed to build the {} output", spec.name))?;
        Ok(Self::new(head, model, (spec.build_output_transform)(), output))
    }

    pub fn head(&self) -> &TaskHead {
        &self.head
    }

    fn target(batch: &MiniBatch) -> Result<&Tensor> {
        batch
            .get(DataKey::Target.as_str())
            .context("Batch has no target; loss and metrics need labelled data")
    }

    /// Forward pass, loss and metrics of one labelled batch.
    pub fn step(&self, batch: &MiniBatch) -> Result<StepOutput> {
        let preds = self.model.forward(batch)?;
        let target = Self::target(batch)?;
        let loss = self.head.loss.compute(&preds, target)?;

        let scores = self.head.to_metrics_format(&preds.detach());
        let mut metrics = BTreeMap::new();
        for mut metric in self.head.metrics() {
            metric.update(&scores, target)?;
            metrics.insert(metric.name().to_string(), metric.compute());
        }
        Ok(StepOutput { loss, metrics })
    }

    /// One pass over `loader` without gradients.
    pub fn evaluate(&self, loader: &DataLoader) -> Result<EvalOutput> {
        let _guard = tch::no_grad_guard();
        let mut metrics = self.head.metrics();
        let mut total_loss = 0.0;
        let mut batches = 0;

        for batch in loader.iter()? {
            let batch = batch?;
            let preds = self.model.forward(&batch)?;
            let target = Self::target(&batch)?;
            total_loss += self.head.loss.compute(&preds, target)?.double_value(&[]);
            let scores = self.head.to_metrics_format(&preds);
            for metric in metrics.iter_mut() {
                metric.update(&scores, target)?;
            }
            batches += 1;
        }
        ensure!(batches > 0, "Cannot evaluate on an empty {} loader", loader.stage());

        let metrics = metrics
            .iter()
            .map(|m| (m.name().to_string(), m.compute()))
            .collect();
        tracing::info!(stage = %loader.stage(), batches, loss = total_loss / batches as f64, "Evaluation done");
        Ok(EvalOutput {
            loss: total_loss / batches as f64,
            metrics,
            batches,
        })
    }

    /// Model outputs stored under `preds`, then output transform and output,
    /// one prediction per sample in loader order.
    pub fn predict(&self, loader: &DataLoader) -> Result<Vec<Prediction>> {
        let _guard = tch::no_grad_guard();
        let mut predictions = Vec::new();
        for batch in loader.iter()? {
            let mut batch = batch?;
            let preds = self.model.forward(&batch)?;
            batch.insert(DataKey::Preds.as_str(), preds);
            for sample in self.output_transform.apply(batch)? {
                predictions.push(self.output.transform(&sample)?);
            }
        }
        tracing::debug!(count = predictions.len(), "Predictions formatted");
        Ok(predictions)
    }
}
