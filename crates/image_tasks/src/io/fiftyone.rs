//! Reading FiftyOne dataset exports.
//!
//! Accepts either `{"samples": [...]}` or a bare array of samples. Each
//! sample has a `filepath` and any number of label fields, tagged by `_cls`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiftyOneClassification {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiftyOneDetection {
    pub label: String,
    /// `[x, y, width, height]`, relative to the image size.
    pub bounding_box: [f32; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_cls")]
pub enum FiftyOneLabel {
    Classification(FiftyOneClassification),
    Classifications {
        classifications: Vec<FiftyOneClassification>,
    },
    Detections {
        detections: Vec<FiftyOneDetection>,
    },
}

impl FiftyOneLabel {
    /// Every class name mentioned by this label.
    pub fn names(&self) -> Vec<&str> {
        match self {
            FiftyOneLabel::Classification(c) => vec![c.label.as_str()],
            FiftyOneLabel::Classifications { classifications } => {
                classifications.iter().map(|c| c.label.as_str()).collect()
            }
            FiftyOneLabel::Detections { detections } => {
                detections.iter().map(|d| d.label.as_str()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FiftyOneSample {
    pub filepath: PathBuf,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Export {
    Wrapped { samples: Vec<FiftyOneSample> },
    Bare(Vec<FiftyOneSample>),
}

#[derive(Debug, Clone)]
pub struct FiftyOneDataset {
    pub samples: Vec<FiftyOneSample>,
}

impl FiftyOneDataset {
    /// Reads an export. Relative file paths are resolved against the
    /// directory holding the JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read FiftyOne export: {}", path.display()))?;
        let mut dataset = Self::from_json(&text)
            .with_context(|| format!("Failed to parse FiftyOne export: {}", path.display()))?;
        if let Some(root) = path.parent() {
            for sample in &mut dataset.samples {
                if sample.filepath.is_relative() {
                    sample.filepath = root.join(&sample.filepath);
                }
            }
        }
        Ok(dataset)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let samples = match serde_json::from_str::<Export>(text)? {
            Export::Wrapped { samples } | Export::Bare(samples) => samples,
        };
        Ok(Self { samples })
    }

    /// `(filepath, label)` pairs for one label field. Samples without the
    /// field (or with `null`) get `None`.
    pub fn labels(&self, label_field: &str) -> Result<Vec<(PathBuf, Option<FiftyOneLabel>)>> {
        self.samples
            .iter()
            .map(|sample| {
                let label = match sample.fields.get(label_field) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(value) => Some(
                        serde_json::from_value::<FiftyOneLabel>(value.clone()).with_context(|| {
                            format!(
                                "Unsupported '{}' label for {}",
                                label_field,
                                sample.filepath.display()
                            )
                        })?,
                    ),
                };
                Ok((sample.filepath.clone(), label))
            })
            .collect()
    }

    /// Sorted, de-duplicated class names for a label field.
    pub fn classes(&self, label_field: &str) -> Result<Vec<String>> {
        let labels = self.labels(label_field)?;
        let names: BTreeSet<&str> = labels
            .iter()
            .filter_map(|(_, label)| label.as_ref())
            .flat_map(FiftyOneLabel::names)
            .collect();
        if names.is_empty() && !labels.is_empty() {
            bail!("Label field '{}' holds no labels", label_field);
        }
        Ok(names.into_iter().map(String::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"{
        "samples": [
            {"filepath": "/data/a.jpg", "ground_truth": {"_cls": "Classification", "label": "dog"}},
            {"filepath": "/data/b.jpg", "ground_truth": {"_cls": "Classification", "label": "cat"}},
            {"filepath": "/data/c.jpg", "ground_truth": null,
             "boxes": {"_cls": "Detections", "detections": [
                {"_cls": "Detection", "label": "face", "bounding_box": [0.1, 0.2, 0.5, 0.5]}
             ]}}
        ]
    }"#;

    #[test]
    fn test_parse_classifications() -> Result<()> {
        let dataset = FiftyOneDataset::from_json(EXPORT)?;
        assert_eq!(dataset.samples.len(), 3);
        assert_eq!(dataset.classes("ground_truth")?, vec!["cat", "dog"]);

        let labels = dataset.labels("ground_truth")?;
        assert!(labels[2].1.is_none());
        assert_eq!(
            labels[0].1,
            Some(FiftyOneLabel::Classification(FiftyOneClassification {
                label: "dog".into(),
                confidence: None
            }))
        );
        Ok(())
    }

    #[test]
    fn test_parse_detections_and_bare_array() -> Result<()> {
        let dataset = FiftyOneDataset::from_json(EXPORT)?;
        let labels = dataset.labels("boxes")?;
        match &labels[2].1 {
            Some(FiftyOneLabel::Detections { detections }) => {
                assert_eq!(detections[0].bounding_box, [0.1, 0.2, 0.5, 0.5]);
            }
            other => panic!("unexpected label {:?}", other),
        }

        let bare = FiftyOneDataset::from_json(r#"[{"filepath": "x.png"}]"#)?;
        assert_eq!(bare.samples.len(), 1);
        assert!(bare.classes("ground_truth").is_err());
        Ok(())
    }
}
