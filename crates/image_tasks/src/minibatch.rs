use crate::collator::Collator;
use crate::error::PipelineError;
use crate::sample::{Metadata, Sample};
use anyhow::{bail, ensure, Result};
use std::collections::HashMap;
use tch::{Device, Tensor};

/// A batch of samples grouped for model input.
///
/// - `tensors`: features stacked along dim 0, shape `[batch_size, ...]`.
/// - `lists`: ragged features kept as one tensor per sample, e.g.
///   `target_boxes` when images hold different numbers of objects.
/// - `metadata`: one entry per sample, in batch order.
///
/// # Examples
/// Four detection samples of size `[3, 128, 128]` collate into:
/// - `"input"` -> shape `[4, 3, 128, 128]`
/// - `"target_boxes"` -> list of 4 tensors `[N_i, 4]`
#[derive(Debug, Default)]
pub struct MiniBatch {
    pub tensors: HashMap<String, Tensor>,
    pub lists: HashMap<String, Vec<Tensor>>,
    pub metadata: Vec<Metadata>,
}

/// Shallow clone: tensors share storage.
impl Clone for MiniBatch {
    fn clone(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow_clone()))
                .collect(),
            lists: self
                .lists
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(Tensor::shallow_clone).collect()))
                .collect(),
            metadata: self.metadata.clone(),
        }
    }
}

impl MiniBatch {
    /// Constructs a `MiniBatch` by applying the given [`Collator`].
    ///
    /// ```ignore
    /// let batch = MiniBatch::collate(samples, &StackCollator)?;
    /// ```
    pub fn collate(samples: Vec<Sample>, collator: &(impl Collator + ?Sized)) -> Result<Self> {
        collator.collate(&samples)
    }

    /// Returns the number of samples in the batch.
    pub fn batch_size(&self) -> Result<usize> {
        if !self.metadata.is_empty() {
            return Ok(self.metadata.len());
        }
        if let Some(t) = self.tensors.values().next() {
            return Ok(t.size().first().copied().unwrap_or(0) as usize);
        }
        match self.lists.values().next() {
            Some(list) => Ok(list.len()),
            None => bail!("Empty mini-batch"),
        }
    }

    /// Returns the stacked tensor for a feature.
    pub fn get(&self, feature: &str) -> Result<&Tensor> {
        self.tensors
            .get(feature)
            .ok_or_else(|| PipelineError::MissingFeature(feature.to_string()).into())
    }

    /// Returns the per-sample tensors of a ragged feature.
    pub fn get_list(&self, feature: &str) -> Result<&[Tensor]> {
        self.lists
            .get(feature)
            .map(Vec::as_slice)
            .ok_or_else(|| PipelineError::MissingFeature(feature.to_string()).into())
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.tensors.contains_key(feature) || self.lists.contains_key(feature)
    }

    pub fn insert(&mut self, feature: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(feature.into(), tensor)
    }

    pub fn insert_list(&mut self, feature: impl Into<String>, tensors: Vec<Tensor>) -> Option<Vec<Tensor>> {
        self.lists.insert(feature.into(), tensors)
    }

    pub fn remove(&mut self, feature: &str) -> Result<Tensor> {
        self.tensors
            .remove(feature)
            .ok_or_else(|| PipelineError::MissingFeature(feature.to_string()).into())
    }

    /// Returns an iterator over all feature keys, stacked and ragged.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.tensors
            .keys()
            .chain(self.lists.keys())
            .map(String::as_str)
    }

    /// Transfers all tensors to the target device (CPU/GPU)
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.to_device(device)))
                .collect(),
            lists: self
                .lists
                .iter()
                .map(|(name, list)| (name.clone(), list.iter().map(|t| t.to_device(device)).collect()))
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    /// Splits the batch back into one [`Sample`] per element.
    ///
    /// Stacked features are indexed along dim 0, ragged features are handed
    /// out per sample and metadata goes back to its sample.
    pub fn uncollate(self) -> Result<Vec<Sample>> {
        let batch_size = self.batch_size()?;
        for (name, tensor) in &self.tensors {
            ensure!(
                tensor.size().first().copied() == Some(batch_size as i64),
                "Feature '{}' has shape {:?}, expected a leading batch dim of {}",
                name,
                tensor.size(),
                batch_size
            );
        }
        for (name, list) in &self.lists {
            ensure!(
                list.len() == batch_size,
                "Feature '{}' has {} entries for a batch of {}",
                name,
                list.len(),
                batch_size
            );
        }

        let mut metadata = self.metadata.into_iter();
        let mut lists: Vec<(String, std::vec::IntoIter<Tensor>)> = self
            .lists
            .into_iter()
            .map(|(name, list)| (name, list.into_iter()))
            .collect();

        let mut samples = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let mut features: HashMap<String, Tensor> = self
                .tensors
                .iter()
                .map(|(name, t)| (name.clone(), t.get(i as i64)))
                .collect();
            for (name, list) in lists.iter_mut() {
                if let Some(t) = list.next() {
                    features.insert(name.clone(), t);
                }
            }
            let meta = metadata.next().unwrap_or_default();
            samples.push(Sample::new(features).with_metadata(meta));
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::{ListCollator, StackCollator};
    use tch::Kind;

    fn make_sample(value: i64) -> Sample {
        Sample::from_single("input", Tensor::from_slice(&[value]).to_kind(Kind::Int64))
            .with_feature("target", Tensor::from(value % 2))
            .with_feature("mask", Tensor::ones([1], (Kind::Float, Device::Cpu)))
            .with_metadata(Metadata::default().with_size(value as u32, 1))
    }

    #[test]
    fn test_minibatch_collate() -> Result<()> {
        let samples = vec![make_sample(1), make_sample(2), make_sample(3)];
        let batch = MiniBatch::collate(samples, &StackCollator)?;

        assert_eq!(batch.batch_size()?, 3);
        assert_eq!(batch.get("input")?.size(), &[3, 1]);
        let labels: Vec<i64> = batch.get("target")?.try_into()?;
        assert_eq!(labels, vec![1, 0, 1]);
        assert_eq!(batch.metadata[2].size, Some((3, 1)));
        Ok(())
    }

    #[test]
    fn test_minibatch_to_device() -> Result<()> {
        let cpu_batch = MiniBatch::collate(vec![make_sample(9), make_sample(10)], &StackCollator)?;
        let target_device = Device::cuda_if_available();
        let moved_batch = cpu_batch.to_device(target_device);

        for feature in moved_batch.features() {
            assert_eq!(moved_batch.get(feature)?.device(), target_device);
            assert_eq!(cpu_batch.get(feature)?.device(), Device::Cpu);
        }
        Ok(())
    }

    #[test]
    fn test_uncollate_restores_samples() -> Result<()> {
        let samples = vec![
            make_sample(4).with_feature("target_boxes", Tensor::zeros([2, 4], (Kind::Float, Device::Cpu))),
            make_sample(5).with_feature("target_boxes", Tensor::zeros([0, 4], (Kind::Float, Device::Cpu))),
        ];
        let batch = MiniBatch::collate(samples, &ListCollator::default())?;
        assert_eq!(batch.get_list("target_boxes")?.len(), 2);

        let back = batch.uncollate()?;
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].get("input")?.int64_value(&[0]), 4);
        assert_eq!(back[0].get("target_boxes")?.size(), vec![2, 4]);
        assert_eq!(back[1].get("target_boxes")?.size(), vec![0, 4]);
        assert_eq!(back[1].metadata.size, Some((5, 1)));
        Ok(())
    }

    #[test]
    fn test_missing_feature() {
        let batch = MiniBatch::default();
        assert!(batch.batch_size().is_err());
        assert!(matches!(
            batch.get("input").unwrap_err().downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingFeature(_))
        ));
    }
}
