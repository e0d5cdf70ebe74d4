//! Turning per-sample predictions into user-facing formats.

use crate::io::deserializer::encode_png;
use crate::io::fiftyone::{FiftyOneClassification, FiftyOneLabel};
use crate::sample::{DataKey, Sample};
use crate::transforms::vision::tensor_to_image;
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPrediction {
    /// `[xmin, ymin, xmax, ymax]` in pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A single formatted prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prediction {
    Class { index: usize },
    Classes { indices: Vec<usize> },
    Label { label: String },
    Labels { labels: Vec<String> },
    Probabilities { probabilities: Vec<f32> },
    Detections { detections: Vec<DetectionPrediction> },
    /// Per instance, `(x, y, score)` per keypoint.
    Keypoints { keypoints: Vec<Vec<[f32; 3]>> },
    /// Row-major class ids.
    Mask { mask: Vec<Vec<u32>> },
    Embedding { values: Vec<f32> },
    /// Base64 PNG.
    Image { height: u32, width: u32, png_base64: String },
    #[serde(rename = "fiftyone")]
    FiftyOne {
        label: FiftyOneLabel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filepath: Option<PathBuf>,
    },
}

/// Formats the `preds` of one uncollated sample.
pub trait Output: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform(&self, sample: &Sample) -> Result<Prediction>;
}

/// Copies any tensor into a flat `Vec<f32>` on the CPU.
pub fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor
        .flatten(0, -1)
        .to_device(Device::Cpu)
        .to_kind(Kind::Float);
    Vec::<f32>::try_from(&flat).context("Failed to copy tensor values")
}

fn preds(sample: &Sample) -> Result<&Tensor> {
    sample.get(DataKey::Preds.as_str())
}

fn argmax(values: &[f32]) -> Result<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .context("Cannot take argmax of empty predictions")
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn sigmoid(logits: &[f32]) -> Vec<f32> {
    logits.iter().map(|&l| 1.0 / (1.0 + (-l).exp())).collect()
}

fn lookup(labels: &[String], index: usize) -> Result<String> {
    labels
        .get(index)
        .cloned()
        .with_context(|| format!("Class index {} has no label ({} labels known)", index, labels.len()))
}

/// Class indices: argmax, or every class above `threshold` when multi-label.
#[derive(Debug, Clone)]
pub struct ClassesOutput {
    pub multi_label: bool,
    pub threshold: f32,
}

impl Default for ClassesOutput {
    fn default() -> Self {
        Self {
            multi_label: false,
            threshold: 0.5,
        }
    }
}

impl ClassesOutput {
    pub fn multi_label(threshold: f32) -> Self {
        Self {
            multi_label: true,
            threshold,
        }
    }

    fn indices(&self, logits: &[f32]) -> Result<Vec<usize>> {
        if self.multi_label {
            Ok(sigmoid(logits)
                .iter()
                .enumerate()
                .filter_map(|(i, &p)| (p >= self.threshold).then_some(i))
                .collect())
        } else {
            Ok(vec![argmax(logits)?])
        }
    }
}

impl Output for ClassesOutput {
    fn name(&self) -> &'static str {
        "classes"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let logits = tensor_to_vec(preds(sample)?)?;
        let indices = self.indices(&logits)?;
        Ok(if self.multi_label {
            Prediction::Classes { indices }
        } else {
            Prediction::Class { index: indices[0] }
        })
    }
}

/// Like [`ClassesOutput`], with indices mapped to class names.
#[derive(Debug, Clone)]
pub struct LabelsOutput {
    pub labels: Vec<String>,
    pub classes: ClassesOutput,
}

impl LabelsOutput {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            classes: ClassesOutput::default(),
        }
    }

    pub fn multi_label(mut self, threshold: f32) -> Self {
        self.classes = ClassesOutput::multi_label(threshold);
        self
    }
}

impl Output for LabelsOutput {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let logits = tensor_to_vec(preds(sample)?)?;
        let labels = self
            .classes
            .indices(&logits)?
            .into_iter()
            .map(|i| lookup(&self.labels, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(if self.classes.multi_label {
            Prediction::Labels { labels }
        } else {
            Prediction::Label {
                label: labels.into_iter().next().unwrap_or_default(),
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbabilitiesOutput {
    pub multi_label: bool,
}

impl Output for ProbabilitiesOutput {
    fn name(&self) -> &'static str {
        "probabilities"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let logits = tensor_to_vec(preds(sample)?)?;
        let probabilities = if self.multi_label {
            sigmoid(&logits)
        } else {
            softmax(&logits)
        };
        Ok(Prediction::Probabilities { probabilities })
    }
}

/// A FiftyOne `Classification` (or `Classifications` when multi-label).
#[derive(Debug, Clone)]
pub struct FiftyOneLabelsOutput {
    pub labels: Vec<String>,
    pub multi_label: bool,
    pub threshold: f32,
    pub return_filepath: bool,
}

impl FiftyOneLabelsOutput {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            multi_label: false,
            threshold: 0.5,
            return_filepath: true,
        }
    }
}

impl Output for FiftyOneLabelsOutput {
    fn name(&self) -> &'static str {
        "fiftyone"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let logits = tensor_to_vec(preds(sample)?)?;
        let label = if self.multi_label {
            let classifications = sigmoid(&logits)
                .into_iter()
                .enumerate()
                .filter(|(_, p)| *p >= self.threshold)
                .map(|(i, p)| {
                    Ok(FiftyOneClassification {
                        label: lookup(&self.labels, i)?,
                        confidence: Some(p as f64),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            FiftyOneLabel::Classifications { classifications }
        } else {
            let probabilities = softmax(&logits);
            let index = argmax(&probabilities)?;
            FiftyOneLabel::Classification(FiftyOneClassification {
                label: lookup(&self.labels, index)?,
                confidence: Some(probabilities[index] as f64),
            })
        };
        let filepath = if self.return_filepath {
            Some(
                sample
                    .metadata
                    .filepath
                    .clone()
                    .context("FiftyOne output needs the sample's filepath")?,
            )
        } else {
            None
        };
        Ok(Prediction::FiftyOne { label, filepath })
    }
}

/// Reads `preds` rows of `(xmin, ymin, xmax, ymax, score[, class])`.
#[derive(Debug, Clone, Default)]
pub struct DetectionLabelsOutput {
    pub labels: Option<Vec<String>>,
    pub threshold: f32,
}

impl Output for DetectionLabelsOutput {
    fn name(&self) -> &'static str {
        "detections"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let preds = preds(sample)?;
        let (rows, cols) = preds.size2().context("Detection preds must be [N, 5] or [N, 6]")?;
        ensure!(cols == 5 || cols == 6, "Detection preds must have 5 or 6 columns, got {}", cols);
        let values = tensor_to_vec(preds)?;

        let mut detections = Vec::with_capacity(rows as usize);
        for row in values.chunks_exact(cols as usize) {
            let score = row[4];
            if score < self.threshold {
                continue;
            }
            let class = if cols == 6 { row[5].max(0.0) as usize } else { 0 };
            let label = match &self.labels {
                Some(labels) => Some(lookup(labels, class)?),
                None => None,
            };
            detections.push(DetectionPrediction {
                bbox: [row[0], row[1], row[2], row[3]],
                score,
                class,
                label,
            });
        }
        Ok(Prediction::Detections { detections })
    }
}

/// Reads `preds` of shape `[N, K, 3]`.
#[derive(Debug, Clone, Default)]
pub struct KeypointsOutput;

impl Output for KeypointsOutput {
    fn name(&self) -> &'static str {
        "keypoints"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let preds = preds(sample)?;
        let (_, k, c) = preds.size3().context("Keypoint preds must be [N, K, 3]")?;
        ensure!(c == 3, "Keypoint preds must end in 3 values, got {}", c);
        let values = tensor_to_vec(preds)?;
        let keypoints = if k == 0 {
            Vec::new()
        } else {
            values
                .chunks_exact((k * 3) as usize)
                .map(|instance| instance.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect())
                .collect()
        };
        Ok(Prediction::Keypoints { keypoints })
    }
}

/// Per-pixel argmax over `[C, H, W]` logits, or `[H, W]` labels as-is.
#[derive(Debug, Clone, Default)]
pub struct SegmentationLabelsOutput;

impl Output for SegmentationLabelsOutput {
    fn name(&self) -> &'static str {
        "segmentation_labels"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let preds = preds(sample)?;
        let labels = match preds.dim() {
            3 => preds.argmax(0, false),
            2 => preds.shallow_clone(),
            n => bail!("Segmentation preds must be [C, H, W] or [H, W], got {} dims", n),
        };
        let (_, width) = labels.size2()?;
        let values = tensor_to_vec(&labels)?;
        let mask = if width == 0 {
            Vec::new()
        } else {
            values
                .chunks_exact(width as usize)
                .map(|row| row.iter().map(|&v| v as u32).collect())
                .collect()
        };
        Ok(Prediction::Mask { mask })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutput;

impl Output for EmbeddingOutput {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        Ok(Prediction::Embedding {
            values: tensor_to_vec(preds(sample)?)?,
        })
    }
}

/// Encodes a `[C, H, W]` float image in `[0, 1]` as PNG.
#[derive(Debug, Clone, Default)]
pub struct StyledImageOutput;

impl Output for StyledImageOutput {
    fn name(&self) -> &'static str {
        "styled_image"
    }

    fn transform(&self, sample: &Sample) -> Result<Prediction> {
        let preds = preds(sample)?.to_device(Device::Cpu);
        let image = tensor_to_image(&preds.clamp(0.0, 1.0))?;
        Ok(Prediction::Image {
            height: image.height(),
            width: image.width(),
            png_base64: encode_png(&image)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Metadata;

    fn with_preds(preds: Tensor) -> Sample {
        Sample::from_single("preds", preds)
    }

    #[test]
    fn test_classes_and_labels() -> Result<()> {
        let sample = with_preds(Tensor::from_slice(&[0.1f32, 2.0, -1.0]));
        assert_eq!(ClassesOutput::default().transform(&sample)?, Prediction::Class { index: 1 });

        let labels = LabelsOutput::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(labels.transform(&sample)?, Prediction::Label { label: "b".into() });

        let multi = LabelsOutput::new(vec!["a".into(), "b".into(), "c".into()]).multi_label(0.5);
        assert_eq!(
            multi.transform(&sample)?,
            Prediction::Labels {
                labels: vec!["a".into(), "b".into()]
            }
        );

        let short = LabelsOutput::new(vec!["a".into()]);
        assert!(short.transform(&sample).is_err());
        Ok(())
    }

    #[test]
    fn test_probabilities_sum_to_one() -> Result<()> {
        let sample = with_preds(Tensor::from_slice(&[1.0f32, 1.0]));
        match ProbabilitiesOutput::default().transform(&sample)? {
            Prediction::Probabilities { probabilities } => {
                assert!((probabilities[0] - 0.5).abs() < 1e-6);
                assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-6);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_fiftyone_output_carries_filepath() -> Result<()> {
        let sample = with_preds(Tensor::from_slice(&[0.0f32, 3.0]))
            .with_metadata(Metadata::default().with_filepath("img.png"));
        let output = FiftyOneLabelsOutput::new(vec!["cat".into(), "dog".into()]);
        let prediction = output.transform(&sample)?;
        let json = serde_json::to_value(&prediction)?;
        assert_eq!(json["type"], "fiftyone");
        assert_eq!(json["label"]["_cls"], "Classification");
        assert_eq!(json["label"]["label"], "dog");
        assert_eq!(json["filepath"], "img.png");

        let bare = with_preds(Tensor::from_slice(&[0.0f32, 3.0]));
        assert!(output.transform(&bare).is_err());
        Ok(())
    }

    #[test]
    fn test_detections_filter_by_score() -> Result<()> {
        let preds = Tensor::from_slice(&[
            0.0f32, 0.0, 4.0, 4.0, 0.9, 1.0, //
            1.0, 1.0, 2.0, 2.0, 0.1, 0.0,
        ])
        .reshape([2, 6]);
        let output = DetectionLabelsOutput {
            labels: Some(vec!["background".into(), "face".into()]),
            threshold: 0.5,
        };
        match output.transform(&with_preds(preds))? {
            Prediction::Detections { detections } => {
                assert_eq!(detections.len(), 1);
                assert_eq!(detections[0].label.as_deref(), Some("face"));
                assert_eq!(detections[0].bbox, [0.0, 0.0, 4.0, 4.0]);
            }
            other => panic!("unexpected prediction {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_segmentation_argmax() -> Result<()> {
        // Two classes over a 1x2 image: pixel 0 → class 1, pixel 1 → class 0.
        let preds = Tensor::from_slice(&[0.0f32, 5.0, 1.0, 0.0]).reshape([2, 1, 2]);
        assert_eq!(
            SegmentationLabelsOutput.transform(&with_preds(preds))?,
            Prediction::Mask { mask: vec![vec![1, 0]] }
        );
        Ok(())
    }

    #[test]
    fn test_styled_image_output() -> Result<()> {
        let preds = Tensor::ones([3, 4, 5], (Kind::Float, Device::Cpu));
        match StyledImageOutput.transform(&with_preds(preds))? {
            Prediction::Image { height, width, png_base64 } => {
                assert_eq!((height, width), (4, 5));
                assert!(!png_base64.is_empty());
            }
            other => panic!("unexpected prediction {:?}", other),
        }
        Ok(())
    }
}
