use crate::minibatch::MiniBatch;
use crate::sample::{keys, DataKey, Sample};
use anyhow::{bail, ensure, Context, Result};
use std::collections::{HashMap, HashSet};
use tch::{Kind, Tensor};

/// A `Collator` defines how to pad and combine multiple [`Sample`]s into a [`MiniBatch`].
pub trait Collator: Send + Sync {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch>;
}

impl<C: Collator + ?Sized> Collator for Box<C> {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        (**self).collate(samples)
    }
}

impl<C: Collator + ?Sized> Collator for std::sync::Arc<C> {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        (**self).collate(samples)
    }
}

/// Checks that every sample carries the same feature keys as the first.
fn validate_keys(samples: &[Sample]) -> Result<HashSet<&String>> {
    if samples.is_empty() {
        bail!("Cannot collate empty sample list");
    }

    let first_keys: HashSet<&String> = samples[0].features.keys().collect();
    for (i, sample) in samples.iter().enumerate().skip(1) {
        let missing_keys: Vec<&String> = first_keys
            .iter()
            .filter(|&&k| !sample.features.contains_key(k))
            .cloned()
            .collect();

        let extra_keys: Vec<&String> = sample
            .features
            .keys()
            .filter(|k| !first_keys.contains(k))
            .collect();

        if !missing_keys.is_empty() || !extra_keys.is_empty() {
            bail!(
                "Sample #{} has mismatch feature keys:\n -Missing: {:?}\n -Extra: {:?}",
                i,
                missing_keys,
                extra_keys
            )
        }
    }
    Ok(first_keys)
}

fn gather<'a>(samples: &'a [Sample], key: &str) -> Vec<&'a Tensor> {
    samples.iter().filter_map(|s| s.features.get(key)).collect()
}

/// Stacks same-shaped tensors along a new dim 0.
fn stack_feature(key: &str, tensors: &[&Tensor]) -> Result<Tensor> {
    let reference_shape = tensors[0].size();
    for (i, tensor) in tensors.iter().enumerate() {
        if tensor.size() != reference_shape {
            bail!(
                "Shape mismatch in sample {} for feature '{}': expected {:?}, got {:?}",
                i,
                key,
                reference_shape,
                tensor.size()
            );
        }
    }
    Tensor::f_stack(tensors, 0).with_context(|| format!("Failed to stack feature '{}'", key))
}

fn collect_metadata(samples: &[Sample]) -> Vec<crate::sample::Metadata> {
    samples.iter().map(|s| s.metadata.clone()).collect()
}

/// A `Collator` that simply stacks tensors with identical shapes
/// along the batch dimension (dim 0). If any sample has an inconsistent
/// shape, an error is returned.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackCollator;

impl Collator for StackCollator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        let first_keys = validate_keys(samples)?;

        let mut tensors = HashMap::with_capacity(first_keys.len());
        for key in first_keys {
            let stacked = stack_feature(key, &gather(samples, key))?;
            tensors.insert(key.clone(), stacked);
        }
        Ok(MiniBatch {
            tensors,
            lists: HashMap::new(),
            metadata: collect_metadata(samples),
        })
    }
}

//=======================================================================================================
/// Defines how a tensor should be padded across a batch
#[derive(Debug, Clone)]
pub enum PaddingRule {
    /// Pad to maximum size of batch
    MaxLength,
    /// Pad (or truncate) to the right to exactly this size
    FixedRight(i64),
    /// Pad to the left to exactly this size
    FixedLeft(i64),
    /// Center-pad to reach exactly this size.
    /// For odd padding amounts, the extra unit goes to the right/bottom.
    Symmetric(i64),
}

/// A `Collator` that pads variable-size tensors so they can be stacked.
///
/// Padding rules are configured per-feature and per-dimension using
/// `.pad(...)`. Features without rules must already agree in shape.
///
/// ```ignore
/// // Pad masks of different heights and widths to the largest in the batch.
/// let collator = PaddingCollator::new()
///     .pad("input", [(1, PaddingRule::MaxLength), (2, PaddingRule::MaxLength)], None)
///     .pad("target", [(0, PaddingRule::MaxLength), (1, PaddingRule::MaxLength)], Some(255.0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PaddingCollator {
    pad_config: HashMap<String, Vec<(usize, PaddingRule)>>,
    pad_values: HashMap<String, f64>,
}

impl PaddingCollator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers padding rules for a feature.
    ///
    /// - `rules`: list of `(dimension, rule)` pairs
    /// - `pad_value`: optional padding value (defaults to 0.0)
    pub fn pad<I>(mut self, feature: impl ToString, rules: I, pad_value: Option<f64>) -> Self
    where
        I: IntoIterator<Item = (usize, PaddingRule)>,
    {
        let key = feature.to_string();
        self.pad_config
            .entry(key.clone())
            .or_default()
            .extend(rules);

        if let Some(v) = pad_value {
            self.pad_values.insert(key, v);
        }
        self
    }

    fn compute_target_shape(
        &self,
        tensors: &[&Tensor],
        rules: &[(usize, PaddingRule)],
    ) -> Result<Vec<i64>> {
        let mut target = tensors[0].size();
        for (dim, rule) in rules {
            let dim = *dim;
            if dim >= target.len() {
                bail!(
                    "Invalid padding dimension {} for tensor with {} dims",
                    dim,
                    target.len()
                );
            }
            target[dim] = match rule {
                PaddingRule::MaxLength => tensors.iter().map(|t| t.size()[dim]).max().unwrap_or(0),
                PaddingRule::FixedRight(n)
                | PaddingRule::FixedLeft(n)
                | PaddingRule::Symmetric(n) => *n,
            };
        }
        Ok(target)
    }

    fn pad_single(
        &self,
        tensor: &Tensor,
        target_shape: &[i64],
        rules: &[(usize, PaddingRule)],
        pad_value: f64,
    ) -> Result<Tensor> {
        let mut result = tensor.shallow_clone();
        for (dim, rule) in rules {
            let dim = *dim;
            let current_len = result.size()[dim];
            let target_len = target_shape[dim];

            match current_len.cmp(&target_len) {
                std::cmp::Ordering::Less => {
                    let pad_total = target_len - current_len;
                    let pad_before = match rule {
                        PaddingRule::Symmetric(_) => pad_total / 2,
                        PaddingRule::FixedLeft(_) => pad_total,
                        _ => 0,
                    };

                    let mut new_shape = result.size();
                    new_shape[dim] = target_len;
                    let padded = Tensor::full(new_shape.as_slice(), pad_value, (result.kind(), result.device()));
                    padded
                        .narrow(dim as i64, pad_before, current_len)
                        .copy_(&result);
                    result = padded;
                }
                std::cmp::Ordering::Greater => {
                    result = result.narrow(dim as i64, 0, target_len);
                }
                std::cmp::Ordering::Equal => {}
            }
        }
        Ok(result)
    }
}

impl Collator for PaddingCollator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        let first_keys = validate_keys(samples)?;

        let mut batched = HashMap::with_capacity(first_keys.len());
        for key in first_keys {
            let tensors = gather(samples, key);

            if let Some(rules) = self.pad_config.get(key.as_str()) {
                let target_shape = self.compute_target_shape(&tensors, rules)?;
                let pad_value = self.pad_values.get(key.as_str()).copied().unwrap_or(0.0);
                let padded = tensors
                    .iter()
                    .map(|t| self.pad_single(t, &target_shape, rules, pad_value))
                    .collect::<Result<Vec<_>>>()?;
                let stacked = Tensor::f_stack(&padded, 0)
                    .with_context(|| format!("Failed to stack padded feature '{}'", key))?;
                batched.insert(key.clone(), stacked);
            } else {
                batched.insert(key.clone(), stack_feature(key, &tensors)?);
            }
        }
        Ok(MiniBatch {
            tensors: batched,
            lists: HashMap::new(),
            metadata: collect_metadata(samples),
        })
    }
}

//=======================================================================================================
/// Stacks regular features and keeps ragged ones as per-sample lists.
///
/// By default the per-object target keys (`target_boxes`, `target_labels`,
/// `target_keypoints`, `target_masks`) are kept as lists, which is what
/// detection and instance segmentation models expect.
#[derive(Debug, Clone)]
pub struct ListCollator {
    list_keys: HashSet<String>,
}

impl Default for ListCollator {
    fn default() -> Self {
        Self {
            list_keys: keys::OBJECT_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl ListCollator {
    pub fn with_list_key(mut self, key: impl Into<String>) -> Self {
        self.list_keys.insert(key.into());
        self
    }
}

impl Collator for ListCollator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        let first_keys = validate_keys(samples)?;

        let mut batch = MiniBatch {
            metadata: collect_metadata(samples),
            ..MiniBatch::default()
        };
        for key in first_keys {
            let tensors = gather(samples, key);
            if self.list_keys.contains(key.as_str()) {
                batch.insert_list(key.clone(), tensors.iter().map(|t| t.shallow_clone()).collect());
            } else {
                batch.insert(key.clone(), stack_feature(key, &tensors)?);
            }
        }
        Ok(batch)
    }
}

//=======================================================================================================
/// Adaptive batching for images of different sizes.
///
/// Every `input` `[C, H, W]` is resized into the batch's largest height and
/// width with its aspect ratio kept, then zero-padded to that size with the
/// image centered. Odd padding puts the smaller half on the left/top.
///
/// Adds `scales` `[B]` and `paddings` `[B, 2]` (left, top) so predictions can
/// be mapped back, and moves `target_boxes` into the padded frame:
/// `box * scale + (pad_left, pad_top, pad_left, pad_top)`.
/// Per-object targets are kept as lists.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveBatchCollator;

impl AdaptiveBatchCollator {
    fn fit(image: &Tensor, max_h: i64, max_w: i64) -> Result<(Tensor, f64, i64, i64)> {
        let (_, h, w) = image.size3().context("Adaptive batching expects [C, H, W] inputs")?;
        let scale = (max_h as f64 / h as f64).min(max_w as f64 / w as f64);
        let new_h = ((h as f64 * scale).round() as i64).clamp(1, max_h);
        let new_w = ((w as f64 * scale).round() as i64).clamp(1, max_w);

        let resized = if (new_h, new_w) == (h, w) {
            image.shallow_clone()
        } else {
            image
                .to_kind(Kind::Float)
                .unsqueeze(0)
                .f_upsample_bilinear2d([new_h, new_w], false, None, None)?
                .squeeze_dim(0)
        };

        let pad_w = max_w - new_w;
        let pad_h = max_h - new_h;
        let (left, top) = (pad_w / 2, pad_h / 2);
        let padded = resized.constant_pad_nd([left, pad_w - left, top, pad_h - top]);
        Ok((padded, scale, left, top))
    }
}

impl Collator for AdaptiveBatchCollator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        let first_keys = validate_keys(samples)?;
        let input_key = DataKey::Input.as_str();
        let inputs = gather(samples, input_key);
        ensure!(!inputs.is_empty(), "Adaptive batching needs an '{}' feature", input_key);

        let mut max_h = 0;
        let mut max_w = 0;
        for image in &inputs {
            let (_, h, w) = image.size3().context("Adaptive batching expects [C, H, W] inputs")?;
            max_h = max_h.max(h);
            max_w = max_w.max(w);
        }

        let mut images = Vec::with_capacity(inputs.len());
        let mut scales = Vec::with_capacity(inputs.len());
        let mut paddings = Vec::with_capacity(inputs.len() * 2);
        for image in &inputs {
            let (padded, scale, left, top) = Self::fit(image, max_h, max_w)?;
            images.push(padded);
            scales.push(scale as f32);
            paddings.extend([left as f32, top as f32]);
        }

        let mut batch = MiniBatch {
            metadata: collect_metadata(samples),
            ..MiniBatch::default()
        };
        batch.insert(input_key, Tensor::f_stack(&images, 0)?);

        for key in first_keys.into_iter().filter(|k| k.as_str() != input_key) {
            let tensors = gather(samples, key);
            if key.as_str() == keys::TARGET_BOXES {
                let moved = tensors
                    .iter()
                    .enumerate()
                    .map(|(i, boxes)| {
                        let offset = Tensor::from_slice(&[
                            paddings[2 * i],
                            paddings[2 * i + 1],
                            paddings[2 * i],
                            paddings[2 * i + 1],
                        ]);
                        boxes.to_kind(Kind::Float) * scales[i] as f64 + offset
                    })
                    .collect();
                batch.insert_list(key.clone(), moved);
            } else if keys::OBJECT_KEYS.contains(&key.as_str()) {
                batch.insert_list(key.clone(), tensors.iter().map(|t| t.shallow_clone()).collect());
            } else {
                batch.insert(key.clone(), stack_feature(key, &tensors)?);
            }
        }

        batch.insert(keys::SCALES, Tensor::from_slice(&scales));
        batch.insert(
            keys::PADDINGS,
            Tensor::from_slice(&paddings).reshape([inputs.len() as i64, 2]),
        );
        Ok(batch)
    }
}
