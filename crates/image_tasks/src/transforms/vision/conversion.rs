use crate::sample::{keys, DataKey, DataSample, Sample, SampleInput, Target};
use crate::transforms::Transform;
use anyhow::{bail, ensure, Context, Result};
use image::{DynamicImage, GenericImageView, GrayImage, GrayAlphaImage, RgbImage, RgbaImage};
use tch::{Device, Kind, Tensor};

// ============================================================================
// Image <-> Tensor
// ============================================================================

/// Converts an image to a channel-first f32 tensor in [0.0, 1.0] range.
///
/// Channel Handling
/// | Input Format  | Output Shape |
/// |---------------|--------------|
/// | Grayscale (L) | `[1, H, W]`  |
/// | RGB           | `[3, H, W]`  |
/// | RGBA          | `[4, H, W]`  |
/// | Other         | `[3, H, W]`  |
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    ensure!(
        width > 0 && height > 0,
        "Image dimensions must be positive (got {}x{})",
        width,
        height
    );
    let (raw, channels) = match img {
        DynamicImage::ImageLuma8(img) => (Tensor::from_slice(img.as_raw()), 1),
        DynamicImage::ImageRgb8(img) => (Tensor::from_slice(img.as_raw()), 3),
        DynamicImage::ImageRgba8(img) => (Tensor::from_slice(img.as_raw()), 4),
        other => (Tensor::from_slice(other.to_rgb8().as_raw()), 3),
    };

    // Pixels are stored interleaved (HWC), so permute into CHW.
    raw.reshape([height as i64, width as i64, channels])
        .permute([2, 0, 1])
        .to_kind(Kind::Float)
        .f_div_scalar(255.0)
        .context("Failed to normalize tensor values")
}

/// Converts a tensor back into an image.
///
/// Accepts `[C, H, W]` with C in {1, 3, 4}, or `[H, W, C]` when the last dim
/// is 1, 3 or 4 and the first is not. 2D tensors are treated as grayscale.
/// `uint8` data is used as-is, floating data is assumed to be in `[0, 1]`
/// and scaled by 255, anything else is cast.
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let tensor = tensor.to_device(Device::Cpu);
    let hwc = match tensor.size().as_slice() {
        [_, _] => tensor.unsqueeze(-1),
        &[c, _, _] if matches!(c, 1 | 3 | 4) => tensor.permute([1, 2, 0]),
        &[_, _, c] if matches!(c, 1 | 3 | 4) => tensor,
        other => bail!("Cannot convert a tensor of shape {:?} to an image", other),
    };

    let bytes = match hwc.kind() {
        Kind::Uint8 => hwc,
        Kind::Float | Kind::Double | Kind::Half | Kind::BFloat16 => {
            (hwc.to_kind(Kind::Float) * 255.0).round().clamp(0.0, 255.0).to_kind(Kind::Uint8)
        }
        _ => hwc.clamp(0i64, 255i64).to_kind(Kind::Uint8),
    };

    let (height, width, channels) = bytes.size3().context("Expected an [H, W, C] tensor")?;
    let data = Vec::<u8>::try_from(&bytes.contiguous().flatten(0, -1))
        .context("Failed to copy tensor data")?;
    let (w, h) = (width as u32, height as u32);
    let image = match channels {
        1 => GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
        2 => GrayAlphaImage::from_raw(w, h, data).map(DynamicImage::ImageLumaA8),
        3 => RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        c => bail!("Unsupported channel count {}", c),
    };
    image.context("Tensor data does not match the image size")
}

// ============================================================================
// ToTensor
// ============================================================================

/// Converts images, or whole samples, into tensors.
///
/// On a [`DataSample`] the input image becomes the `input` feature and the
/// target becomes tensors:
///
/// | Target         | Features                                             |
/// |----------------|------------------------------------------------------|
/// | `Class`        | `target`: `[]` i64                                   |
/// | `MultiLabel`   | `target`: `[num_classes]` f32 multi-hot              |
/// | `Detection`    | `target_boxes` `[N, 4]` f32, `target_labels` `[N]` i64 |
/// | `Keypoints`    | as detection, plus `target_keypoints` `[N, K, 3]` f32 |
/// | `Instances`    | as detection, plus `target_masks` `[N, H, W]` u8      |
/// | `Mask`         | `target`: `[H, W]` i64                               |
///
/// # Example
/// ```ignore
/// let converter = ToTensor::new();
/// let tensor = converter.apply(image)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToTensor {
    num_classes: Option<usize>,
}

impl ToTensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Needed to build multi-hot vectors for multi-label targets.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    fn input_tensor(input: SampleInput) -> Result<Tensor> {
        match input {
            SampleInput::Image(image) => image_to_tensor(&image),
            SampleInput::Tensor(tensor) => Ok(tensor),
            SampleInput::Path(path) => bail!(
                "Sample input {} has not been loaded into an image",
                path.display()
            ),
        }
    }

    fn insert_target(&self, sample: &mut Sample, target: Target) -> Result<()> {
        let target_key = DataKey::Target.as_str();
        match target {
            Target::Class(class) => {
                sample.insert(target_key, Tensor::from(class as i64));
            }
            Target::MultiLabel(classes) => {
                let num_classes = self
                    .num_classes
                    .context("Multi-label targets need the number of classes")?;
                let mut hot = vec![0f32; num_classes];
                for class in classes {
                    ensure!(
                        class < num_classes,
                        "Label {} is out of range for {} classes",
                        class,
                        num_classes
                    );
                    hot[class] = 1.0;
                }
                sample.insert(target_key, Tensor::from_slice(&hot));
            }
            Target::Detection { boxes, labels } => {
                insert_boxes(sample, &boxes, &labels);
            }
            Target::Keypoints {
                boxes,
                labels,
                keypoints,
            } => {
                insert_boxes(sample, &boxes, &labels);
                let per_object = keypoints.first().map_or(0, Vec::len);
                ensure!(
                    keypoints.iter().all(|k| k.len() == per_object),
                    "Every object needs the same number of keypoints"
                );
                let flat: Vec<f32> = keypoints
                    .iter()
                    .flatten()
                    .flat_map(|k| [k.x, k.y, if k.visible { 1.0 } else { 0.0 }])
                    .collect();
                sample.insert(
                    keys::TARGET_KEYPOINTS,
                    Tensor::from_slice(&flat).reshape([keypoints.len() as i64, per_object as i64, 3]),
                );
            }
            Target::Instances {
                boxes,
                labels,
                masks,
            } => {
                insert_boxes(sample, &boxes, &labels);
                let masks = masks
                    .iter()
                    .map(|m| {
                        let (w, h) = m.dimensions();
                        Tensor::from_slice(m.as_raw()).reshape([h as i64, w as i64])
                    })
                    .collect::<Vec<_>>();
                let stacked = if masks.is_empty() {
                    let (_, h, w) = sample.input()?.size3().context("Expected a [C, H, W] input")?;
                    Tensor::zeros([0, h, w], (Kind::Uint8, Device::Cpu))
                } else {
                    Tensor::f_stack(&masks, 0).context("Instance masks differ in size")?
                };
                sample.insert(keys::TARGET_MASKS, stacked);
            }
            Target::Mask(mask) => {
                let (w, h) = mask.dimensions();
                sample.insert(
                    target_key,
                    Tensor::from_slice(mask.as_raw())
                        .reshape([h as i64, w as i64])
                        .to_kind(Kind::Int64),
                );
            }
        }
        Ok(())
    }
}

fn insert_boxes(sample: &mut Sample, boxes: &[crate::sample::BoundingBox], labels: &[usize]) {
    let flat: Vec<f32> = boxes.iter().flat_map(|b| b.to_array()).collect();
    let labels: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    sample.insert(
        keys::TARGET_BOXES,
        Tensor::from_slice(&flat).reshape([boxes.len() as i64, 4]),
    );
    sample.insert(keys::TARGET_LABELS, Tensor::from_slice(&labels));
}

impl Transform<DynamicImage, Tensor> for ToTensor {
    fn apply(&self, img: DynamicImage) -> Result<Tensor> {
        image_to_tensor(&img)
    }
}

impl Transform<DataSample, Sample> for ToTensor {
    fn apply(&self, sample: DataSample) -> Result<Sample> {
        let DataSample {
            input,
            target,
            metadata,
        } = sample;
        let mut out = Sample::from_single(DataKey::Input.as_str(), Self::input_tensor(input)?)
            .with_metadata(metadata);
        if let Some(target) = target {
            self.insert_target(&mut out, target)?;
        }
        Ok(out)
    }
}
