//! COCO annotation files for detection, keypoints and instance masks.

use crate::io::image::{load_image_sample, ImagePathsInput};
use crate::io::input::{Input, InputSource, LoadedInput};
use crate::sample::{BoundingBox, DataSample, Keypoint, Metadata, Target};
use crate::stage::RunningStage;
use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub keypoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CocoSegmentation {
    Polygons(Vec<Vec<f32>>),
    /// Run-length encoded masks are not decoded; the box is filled instead.
    Rle(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoAnnotation {
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [f32; 4],
    #[serde(default)]
    pub segmentation: Option<CocoSegmentation>,
    /// Flattened `(x, y, v)` triples.
    #[serde(default)]
    pub keypoints: Vec<f32>,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoDataset {
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

/// Which part of the annotations becomes the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CocoTargetKind {
    Detection,
    Keypoints,
    Instances,
}

impl CocoDataset {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read COCO annotations: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse COCO annotations: {}", path.display()))
    }

    /// Category id → contiguous label, plus the names in label order.
    pub fn label_map(&self) -> (HashMap<u64, usize>, Vec<String>) {
        let sorted: BTreeMap<u64, &str> = self
            .categories
            .iter()
            .map(|c| (c.id, c.name.as_str()))
            .collect();
        let ids = sorted.keys().enumerate().map(|(label, &id)| (id, label)).collect();
        let names = sorted.values().map(|name| name.to_string()).collect();
        (ids, names)
    }

    /// One sample per image, in file order. Images without annotations get
    /// an empty target.
    pub fn samples(&self, images_dir: &Path, kind: CocoTargetKind) -> Result<(Vec<DataSample>, Vec<String>)> {
        let (label_map, names) = self.label_map();
        let mut by_image: HashMap<u64, Vec<&CocoAnnotation>> = HashMap::new();
        for annotation in &self.annotations {
            by_image.entry(annotation.image_id).or_default().push(annotation);
        }

        let samples = self
            .images
            .iter()
            .map(|image| {
                let annotations = by_image.remove(&image.id).unwrap_or_default();
                let target = build_target(image, &annotations, &label_map, kind)?;
                let path = images_dir.join(&image.file_name);
                Ok(DataSample::from_path(&path)
                    .with_target(target)
                    .with_metadata(Metadata::default().with_filepath(path)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((samples, names))
    }
}

fn build_target(
    image: &CocoImage,
    annotations: &[&CocoAnnotation],
    label_map: &HashMap<u64, usize>,
    kind: CocoTargetKind,
) -> Result<Target> {
    let mut boxes = Vec::with_capacity(annotations.len());
    let mut labels = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        let label = label_map.get(&annotation.category_id).copied().with_context(|| {
            format!(
                "Annotation on image {} uses unknown category {}",
                image.id, annotation.category_id
            )
        })?;
        let [x, y, w, h] = annotation.bbox;
        boxes.push(BoundingBox::from_xywh(x, y, w, h));
        labels.push(label);
    }

    Ok(match kind {
        CocoTargetKind::Detection => Target::Detection { boxes, labels },
        CocoTargetKind::Keypoints => {
            let keypoints = annotations
                .iter()
                .map(|a| parse_keypoints(&a.keypoints))
                .collect::<Result<Vec<_>>>()?;
            Target::Keypoints {
                boxes,
                labels,
                keypoints,
            }
        }
        CocoTargetKind::Instances => {
            let masks = annotations
                .iter()
                .zip(&boxes)
                .map(|(a, bbox)| rasterize(a.segmentation.as_ref(), bbox, image.width, image.height))
                .collect();
            Target::Instances { boxes, labels, masks }
        }
    })
}

fn parse_keypoints(values: &[f32]) -> Result<Vec<Keypoint>> {
    if values.len() % 3 != 0 {
        bail!("Keypoints must be (x, y, v) triples, got {} values", values.len());
    }
    Ok(values
        .chunks_exact(3)
        .map(|kp| Keypoint::new(kp[0], kp[1], kp[2] > 0.0))
        .collect())
}

/// Draws an instance mask (`1` inside, `0` outside).
pub fn rasterize(
    segmentation: Option<&CocoSegmentation>,
    bbox: &BoundingBox,
    width: u32,
    height: u32,
) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    match segmentation {
        Some(CocoSegmentation::Polygons(polygons)) if !polygons.is_empty() => {
            for polygon in polygons {
                let mut points: Vec<Point<i32>> = polygon
                    .chunks_exact(2)
                    .map(|p| Point::new(p[0].round() as i32, p[1].round() as i32))
                    .collect();
                // The drawing routine rejects explicitly closed polygons.
                while points.len() > 1 && points.first() == points.last() {
                    points.pop();
                }
                points.dedup();
                if points.len() >= 3 {
                    draw_polygon_mut(&mut mask, &points, Luma([1u8]));
                }
            }
        }
        _ => {
            let clipped = bbox.clip(width as f32, height as f32);
            let (w, h) = (clipped.width().round() as u32, clipped.height().round() as u32);
            if w > 0 && h > 0 {
                let rect = Rect::at(clipped.xmin.round() as i32, clipped.ymin.round() as i32).of_size(w, h);
                draw_filled_rect_mut(&mut mask, rect, Luma([1u8]));
            }
        }
    }
    mask
}

/// Reads a COCO annotation file paired with an image folder.
#[derive(Debug, Clone, Copy)]
pub struct CocoInput {
    kind: CocoTargetKind,
}

impl CocoInput {
    pub fn new(kind: CocoTargetKind) -> Self {
        Self { kind }
    }
}

impl Input for CocoInput {
    fn name(&self) -> &'static str {
        "CocoInput"
    }

    fn load_data(&self, source: InputSource, stage: RunningStage) -> Result<LoadedInput> {
        let (images_dir, annotations) = match source {
            InputSource::Coco {
                images_dir,
                annotations,
            } => (images_dir, annotations),
            // Unlabelled images, e.g. for prediction.
            source @ (InputSource::Folder(_) | InputSource::Files { .. }) => {
                return ImagePathsInput.load_data(source, stage);
            }
            other => bail!("{} cannot read {:?}", self.name(), other),
        };
        let dataset = CocoDataset::from_file(&annotations)?;
        let (samples, names) = dataset.samples(&images_dir, self.kind)?;
        tracing::debug!(
            annotations = %annotations.display(),
            images = samples.len(),
            categories = names.len(),
            "Read COCO annotations"
        );
        Ok(LoadedInput::sized(samples).with_labels(names))
    }

    fn load_sample(&self, sample: DataSample) -> Result<DataSample> {
        load_image_sample(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOTATIONS: &str = r#"{
        "images": [
            {"id": 1, "file_name": "a.png", "width": 10, "height": 10},
            {"id": 2, "file_name": "b.png", "width": 10, "height": 10}
        ],
        "annotations": [
            {"image_id": 1, "category_id": 7, "bbox": [1, 1, 4, 4],
             "segmentation": [[1, 1, 5, 1, 5, 5, 1, 5]],
             "keypoints": [2, 2, 2, 0, 0, 0]},
            {"image_id": 1, "category_id": 3, "bbox": [6, 6, 2, 2]}
        ],
        "categories": [
            {"id": 7, "name": "person", "keypoints": ["nose", "eye"]},
            {"id": 3, "name": "car"}
        ]
    }"#;

    fn dataset() -> Result<CocoDataset> {
        Ok(serde_json::from_str(ANNOTATIONS)?)
    }

    #[test]
    fn test_labels_follow_sorted_category_ids() -> Result<()> {
        let (ids, names) = dataset()?.label_map();
        assert_eq!(names, vec!["car", "person"]);
        assert_eq!(ids[&3], 0);
        assert_eq!(ids[&7], 1);
        Ok(())
    }

    #[test]
    fn test_detection_samples_keep_empty_images() -> Result<()> {
        let (samples, _) = dataset()?.samples(Path::new("/imgs"), CocoTargetKind::Detection)?;
        assert_eq!(samples.len(), 2);
        let first = samples[0].target.as_ref();
        assert_eq!(first.and_then(Target::labels), Some(&[1, 0][..]));
        assert_eq!(
            first.and_then(Target::boxes).map(|b| b[0].to_array()),
            Some([1.0, 1.0, 5.0, 5.0])
        );
        assert_eq!(samples[1].target.as_ref().and_then(Target::labels), Some(&[][..]));
        assert_eq!(samples[1].metadata.filepath.as_deref(), Some(Path::new("/imgs/b.png")));
        Ok(())
    }

    #[test]
    fn test_keypoint_visibility() -> Result<()> {
        let (samples, _) = dataset()?.samples(Path::new("."), CocoTargetKind::Keypoints)?;
        match &samples[0].target {
            Some(Target::Keypoints { keypoints, .. }) => {
                assert_eq!(keypoints[0].len(), 2);
                assert!(keypoints[0][0].visible);
                assert!(!keypoints[0][1].visible);
                assert!(keypoints[1].is_empty());
            }
            other => panic!("unexpected target {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_polygon_and_box_masks() -> Result<()> {
        let (samples, _) = dataset()?.samples(Path::new("."), CocoTargetKind::Instances)?;
        match &samples[0].target {
            Some(Target::Instances { masks, .. }) => {
                assert_eq!(masks[0].get_pixel(3, 3)[0], 1);
                assert_eq!(masks[0].get_pixel(8, 8)[0], 0);
                // No segmentation: the box is filled.
                assert_eq!(masks[1].get_pixel(7, 7)[0], 1);
                assert_eq!(masks[1].get_pixel(3, 3)[0], 0);
            }
            other => panic!("unexpected target {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_plain_folder_for_prediction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        image::RgbImage::new(3, 3).save(dir.path().join("a.png"))?;
        let loaded = CocoInput::new(CocoTargetKind::Detection)
            .load_data(InputSource::Folder(dir.path().into()), RunningStage::Predicting)?;
        assert!(loaded.labels.is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_category_fails() {
        let text = r#"{"images": [{"id": 1, "file_name": "a.png", "width": 2, "height": 2}],
            "annotations": [{"image_id": 1, "category_id": 9, "bbox": [0, 0, 1, 1]}],
            "categories": []}"#;
        let dataset: CocoDataset = serde_json::from_str(text).unwrap();
        assert!(dataset.samples(Path::new("."), CocoTargetKind::Detection).is_err());
    }
}
