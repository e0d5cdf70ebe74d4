use crate::sample::Sample;
use crate::transforms::{ApplyToTensorInput, Transform};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tch::Tensor;

// ============================================================================
// Normalize
// ============================================================================

/// Normalizes tensors using channel-wise statistics.
///
/// Works on `[C, H, W]` images and on `[B, C, H, W]` batches, so it can run
/// per sample or per batch on device.
///
/// ```text
/// output[...,c,h,w] = (input[...,c,h,w] - mean[c]) / std[c]
/// ```
///
/// # Example
/// ```ignore
/// let norm = Normalize::imagenet();
/// let normalized = norm.apply(tensor)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: &[f32], std: &[f32]) -> Result<Self> {
        ensure!(!mean.is_empty(), "Normalization mean cannot be empty");
        ensure!(
            mean.len() == std.len(),
            "The mean and standard deviation for normalization must match in dimension. \
             The dimension of mean is {} but the dimension of std is {}.",
            mean.len(),
            std.len()
        );
        ensure!(
            std.iter().all(|&s| s != 0.0),
            "Normalization std must be non-zero"
        );
        Ok(Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
        })
    }

    /// ImageNet standard normalization (RGB)
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }
}

impl Transform<Tensor, Tensor> for Normalize {
    fn apply(&self, tensor: Tensor) -> Result<Tensor> {
        let size = tensor.size();
        let channel_dim = match size.len() {
            3 => 0,
            4 => 1,
            _ => anyhow::bail!("Input must be [C, H, W] or [B, C, H, W], got {:?}", size),
        };
        let num_channels = size[channel_dim];
        ensure!(
            num_channels as usize == self.mean.len(),
            "Channel count mismatch: input has {} channels but normalization expects {}",
            num_channels,
            self.mean.len()
        );

        let view = [num_channels, 1, 1];
        let options = (tensor.kind(), tensor.device());
        let mean_t = Tensor::from_slice(&self.mean).reshape(view).to_kind(options.0).to_device(options.1);
        let std_t = Tensor::from_slice(&self.std).reshape(view).to_kind(options.0).to_device(options.1);
        Ok((tensor - mean_t) / std_t)
    }
}

impl Transform<Sample, Sample> for Normalize {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        ApplyToTensorInput::new(self.clone()).apply(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_normalize() -> Result<()> {
        let tensor = Tensor::ones([3, 32, 32], (Kind::Float, Device::Cpu));
        let norm = Normalize::new(&[1.0; 3], &[1.0; 3])?;
        let normalized = Transform::<Tensor, Tensor>::apply(&norm, tensor)?;

        for c in 0..3 {
            let channel_mean = normalized.select(0, c).mean(Kind::Float);
            assert!(channel_mean.double_value(&[]).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_normalize_batch_and_sample() -> Result<()> {
        let norm = Normalize::new(&[0.5, 0.5], &[0.5, 0.5])?;
        let batch = Tensor::ones([4, 2, 3, 3], (Kind::Float, Device::Cpu));
        let out = Transform::<Tensor, Tensor>::apply(&norm, batch)?;
        assert_eq!(out.size(), vec![4, 2, 3, 3]);
        assert!((out.double_value(&[3, 1, 2, 2]) - 1.0).abs() < 1e-6);

        let sample = Sample::from_single("input", Tensor::zeros([2, 2, 2], (Kind::Float, Device::Cpu)));
        let out = Transform::<Sample, Sample>::apply(&norm, sample)?;
        assert!((out.input()?.double_value(&[0, 0, 0]) + 1.0).abs() < 1e-6);

        let wrong = Tensor::ones([3, 2, 2], (Kind::Float, Device::Cpu));
        assert!(Transform::<Tensor, Tensor>::apply(&norm, wrong).is_err());
        assert!(Normalize::new(&[0.5], &[0.5, 0.5]).is_err());
        Ok(())
    }
}
