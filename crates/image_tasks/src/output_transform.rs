//! Post-processing of model predictions before they reach an [`Output`].
//!
//! [`Output`]: crate::io::output::Output

use crate::io::output::tensor_to_vec;
use crate::minibatch::MiniBatch;
use crate::sample::{keys, DataKey, Sample};
use anyhow::{ensure, Context, Result};
use tch::Tensor;

/// Batch → samples, in three steps the task can override:
/// `per_batch_transform`, `uncollate`, then `per_sample_transform`.
pub trait OutputTransform: Send + Sync {
    fn name(&self) -> &'static str {
        "OutputTransform"
    }

    fn per_batch_transform(&self, batch: MiniBatch) -> Result<MiniBatch> {
        Ok(batch)
    }

    fn uncollate(&self, batch: MiniBatch) -> Result<Vec<Sample>> {
        batch.uncollate()
    }

    fn per_sample_transform(&self, sample: Sample) -> Result<Sample> {
        Ok(sample)
    }

    fn apply(&self, batch: MiniBatch) -> Result<Vec<Sample>> {
        let batch = self
            .per_batch_transform(batch)
            .with_context(|| format!("{} per-batch transform failed", self.name()))?;
        self.uncollate(batch)?
            .into_iter()
            .map(|sample| self.per_sample_transform(sample))
            .collect()
    }
}

/// Splits the batch and leaves predictions as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOutputTransform;

impl OutputTransform for DefaultOutputTransform {
    fn name(&self) -> &'static str {
        "DefaultOutputTransform"
    }
}

/// Undoes [`AdaptiveBatchCollator`](crate::collator::AdaptiveBatchCollator).
///
/// Expects `preds` `[M, 6]` rows of `(x1, y1, x2, y2, score, batch_idx)`
/// for the whole batch, plus the collator's `scales` and `paddings`. Each
/// image gets its own `preds` `[m, 5]` in original pixel coordinates,
/// `(box - padding) / scale`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceDetectionOutputTransform;

impl OutputTransform for FaceDetectionOutputTransform {
    fn name(&self) -> &'static str {
        "FaceDetectionOutputTransform"
    }

    fn per_batch_transform(&self, mut batch: MiniBatch) -> Result<MiniBatch> {
        let preds_key = DataKey::Preds.as_str();
        let preds = batch.remove(preds_key)?;
        let scales = tensor_to_vec(&batch.remove(keys::SCALES)?)?;
        let paddings = tensor_to_vec(&batch.remove(keys::PADDINGS)?)?;
        ensure!(
            paddings.len() == 2 * scales.len(),
            "Got {} scales but {} padding values",
            scales.len(),
            paddings.len()
        );
        ensure!(
            preds.dim() == 2 && preds.size()[1] == 6,
            "Face detection predictions must be [M, 6], got {:?}",
            preds.size()
        );

        let mut per_image: Vec<Vec<f32>> = vec![Vec::new(); scales.len()];
        for row in tensor_to_vec(&preds)?.chunks_exact(6) {
            let image = row[5].round();
            ensure!(
                image >= 0.0 && (image as usize) < scales.len(),
                "Prediction refers to image {} in a batch of {}",
                image,
                scales.len()
            );
            let i = image as usize;
            let (scale, left, top) = (scales[i], paddings[2 * i], paddings[2 * i + 1]);
            ensure!(scale > 0.0, "Image {} has a non-positive scale {}", i, scale);
            per_image[i].extend([
                (row[0] - left) / scale,
                (row[1] - top) / scale,
                (row[2] - left) / scale,
                (row[3] - top) / scale,
                row[4],
            ]);
        }

        let lists = per_image
            .into_iter()
            .map(|values| {
                let rows = (values.len() / 5) as i64;
                Tensor::from_slice(&values).reshape([rows, 5])
            })
            .collect();
        batch.insert_list(preds_key, lists);
        Ok(batch)
    }
}
