//! Transforms that act on one part of a sample and leave the rest alone.

use crate::sample::{DataKey, DataSample, Sample};
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::DynamicImage;
use tch::Tensor;

/// Applies an image transform to the input image only. Targets and metadata
/// are carried over unchanged, so use it for photometric ops or for tasks
/// without spatial targets.
#[derive(Debug, Clone)]
pub struct ApplyToInput<T> {
    inner: T,
}

impl<T> ApplyToInput<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> Transform<DataSample, DataSample> for ApplyToInput<T>
where
    T: Transform<DynamicImage, DynamicImage>,
{
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        sample.map_image(|image| self.inner.apply(image))
    }
}

/// Applies a tensor transform to the `input` feature of a converted sample.
#[derive(Debug, Clone)]
pub struct ApplyToTensorInput<T> {
    inner: T,
}

impl<T> ApplyToTensorInput<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> Transform<Sample, Sample> for ApplyToTensorInput<T>
where
    T: Transform<Tensor, Tensor>,
{
    fn apply(&self, mut sample: Sample) -> Result<Sample> {
        let key = DataKey::Input.as_str();
        let input = sample.remove(key)?;
        let output = self
            .inner
            .apply(input)
            .with_context(|| format!("Failed to transform feature '{}'", key))?;
        sample.insert(key, output);
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::from_fn;
    use tch::{Device, Kind};

    #[test]
    fn test_apply_to_input_keeps_target() -> Result<()> {
        let sample = DataSample::from_image(DynamicImage::new_rgb8(4, 4))
            .with_target(crate::sample::Target::Class(3));
        let t = ApplyToInput::new(from_fn(|img: DynamicImage| Ok(img.grayscale())));
        let out = t.apply(sample)?;
        assert_eq!(out.target, Some(crate::sample::Target::Class(3)));
        assert!(matches!(out.image()?, DynamicImage::ImageLuma8(_)));
        Ok(())
    }

    #[test]
    fn test_apply_to_tensor_input() -> Result<()> {
        let sample = Sample::from_single("input", Tensor::ones([1, 2, 2], (Kind::Float, Device::Cpu)))
            .with_feature("target", Tensor::from(1i64));
        let t = ApplyToTensorInput::new(from_fn(|x: Tensor| Ok(x * 3.0)));
        let out = t.apply(sample)?;
        assert_eq!(out.input()?.double_value(&[0, 0, 0]), 3.0);
        assert_eq!(out.get("target")?.int64_value(&[]), 1);
        Ok(())
    }
}
