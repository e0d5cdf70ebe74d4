//! Rendering samples for inspection, and recording what passes through
//! each hook of a stage pipeline.

use crate::input_transform::TransformHook;
use crate::minibatch::MiniBatch;
use crate::sample::{DataSample, Sample, Target};
use crate::stage::RunningStage;
use anyhow::{ensure, Result};
use image::{imageops, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

const PALETTE: [[u8; 3]; 10] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
    [227, 119, 194],
    [127, 127, 127],
    [188, 189, 34],
    [23, 190, 207],
];

pub fn class_color(label: usize) -> Rgb<u8> {
    Rgb(PALETTE[label % PALETTE.len()])
}

/// Maps class ids to palette colours; `0` stays black.
pub fn colorize_mask(mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| match mask.get_pixel(x, y)[0] {
        0 => Rgb([0, 0, 0]),
        id => class_color(id as usize),
    })
}

fn blend(image: &mut RgbImage, mask: &GrayImage, color: Rgb<u8>, alpha: f32) {
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if x < mask.width() && y < mask.height() && mask.get_pixel(x, y)[0] > 0 {
            for c in 0..3 {
                pixel[c] = (pixel[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha).round() as u8;
            }
        }
    }
}

fn draw_box(image: &mut RgbImage, bbox: &crate::sample::BoundingBox, color: Rgb<u8>) {
    let clipped = bbox.clip(image.width() as f32, image.height() as f32);
    let (w, h) = (clipped.width().round() as u32, clipped.height().round() as u32);
    if w > 0 && h > 0 {
        let rect = Rect::at(clipped.xmin.round() as i32, clipped.ymin.round() as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Draws a loaded sample with its target: boxes coloured by label,
/// keypoints as dots and masks blended over the image.
pub fn render_sample(sample: &DataSample) -> Result<RgbImage> {
    let mut canvas = sample.image()?.to_rgb8();
    match &sample.target {
        Some(Target::Detection { boxes, labels }) => {
            for (bbox, &label) in boxes.iter().zip(labels) {
                draw_box(&mut canvas, bbox, class_color(label));
            }
        }
        Some(Target::Keypoints {
            boxes,
            labels,
            keypoints,
        }) => {
            for ((bbox, &label), points) in boxes.iter().zip(labels).zip(keypoints) {
                let color = class_color(label);
                draw_box(&mut canvas, bbox, color);
                for kp in points.iter().filter(|kp| kp.visible) {
                    draw_filled_circle_mut(&mut canvas, (kp.x.round() as i32, kp.y.round() as i32), 2, color);
                }
            }
        }
        Some(Target::Instances { boxes, labels, masks }) => {
            for ((bbox, &label), mask) in boxes.iter().zip(labels).zip(masks) {
                let color = class_color(label);
                blend(&mut canvas, mask, color, 0.5);
                draw_box(&mut canvas, bbox, color);
            }
        }
        Some(Target::Mask(mask)) => {
            let colored = colorize_mask(mask);
            for (x, y, pixel) in canvas.enumerate_pixels_mut() {
                if x < mask.width() && y < mask.height() && mask.get_pixel(x, y)[0] > 0 {
                    let color = colored.get_pixel(x, y);
                    for c in 0..3 {
                        pixel[c] = ((pixel[c] as u16 + color[c] as u16) / 2) as u8;
                    }
                }
            }
        }
        Some(Target::Class(_)) | Some(Target::MultiLabel(_)) | None => {}
    }
    Ok(canvas)
}

/// Tiles images left to right, `cols` per row. Cells are as large as the
/// largest image; smaller images sit in the top-left corner of their cell.
pub fn render_grid(images: &[RgbImage], cols: usize) -> Result<RgbImage> {
    ensure!(!images.is_empty(), "Nothing to render");
    ensure!(cols > 0, "A grid needs at least one column");
    let cell_w = images.iter().map(RgbImage::width).max().unwrap_or(1);
    let cell_h = images.iter().map(RgbImage::height).max().unwrap_or(1);
    let cols = cols.min(images.len());
    let rows = images.len().div_ceil(cols);

    let mut grid = RgbImage::new(cell_w * cols as u32, cell_h * rows as u32);
    for (i, image) in images.iter().enumerate() {
        let x = (i % cols) as i64 * cell_w as i64;
        let y = (i / cols) as i64 * cell_h as i64;
        imageops::overlay(&mut grid, image, x, y);
    }
    Ok(grid)
}

/// What one hook of one stage has seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HookRecord {
    /// Samples (or batches, for batch hooks) that passed through.
    pub count: usize,
    /// Shapes from the most recent call, by feature.
    pub shapes: BTreeMap<String, Vec<i64>>,
}

/// Records per stage and hook how much data passed and its shapes.
///
/// Attach one to an [`InputTransform`](crate::input_transform::InputTransform)
/// and the stage pipelines report into it, including from worker threads.
#[derive(Debug, Default)]
pub struct BaseVisualization {
    records: Mutex<BTreeMap<(RunningStage, TransformHook), HookRecord>>,
}

impl BaseVisualization {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, stage: RunningStage, hook: TransformHook, shapes: BTreeMap<String, Vec<i64>>) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = records.entry((stage, hook)).or_default();
        record.count += 1;
        record.shapes = shapes;
    }

    pub fn record_data_sample(&self, stage: RunningStage, hook: TransformHook, sample: &DataSample) {
        let mut shapes = BTreeMap::new();
        if let Ok(image) = sample.image() {
            let channels = image.color().channel_count() as i64;
            shapes.insert(
                "input".to_string(),
                vec![channels, image.height() as i64, image.width() as i64],
            );
        }
        self.record(stage, hook, shapes);
    }

    pub fn record_sample(&self, stage: RunningStage, hook: TransformHook, sample: &Sample) {
        let shapes = sample.features.iter().map(|(k, v)| (k.clone(), v.size())).collect();
        self.record(stage, hook, shapes);
    }

    pub fn record_batch(&self, stage: RunningStage, hook: TransformHook, batch: &MiniBatch) {
        let mut shapes: BTreeMap<String, Vec<i64>> =
            batch.tensors.iter().map(|(k, v)| (k.clone(), v.size())).collect();
        for (key, list) in &batch.lists {
            shapes.insert(key.clone(), vec![list.len() as i64]);
        }
        self.record(stage, hook, shapes);
    }

    pub fn get(&self, stage: RunningStage, hook: TransformHook) -> Option<HookRecord> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.get(&(stage, hook)).cloned()
    }

    /// `{stage: {hook: record}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: BTreeMap<&str, BTreeMap<&str, &HookRecord>> = BTreeMap::new();
        for ((stage, hook), record) in records.iter() {
            out.entry(stage.as_str()).or_default().insert(hook.as_str(), record);
        }
        serde_json::to_value(out).unwrap_or(serde_json::Value::Null)
    }

    pub fn reset(&self) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{BoundingBox, Keypoint};
    use image::{DynamicImage, Luma};
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_render_detection_draws_box_outline() -> Result<()> {
        let sample = DataSample::from_image(DynamicImage::new_rgb8(10, 10))
            .with_target(Target::detection(vec![BoundingBox::new(2.0, 2.0, 8.0, 8.0)], vec![3])?);
        let rendered = render_sample(&sample)?;
        assert_eq!(*rendered.get_pixel(2, 2), class_color(3));
        assert_eq!(*rendered.get_pixel(5, 5), Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_render_keypoints_and_mask() -> Result<()> {
        let sample = DataSample::from_image(DynamicImage::new_rgb8(10, 10)).with_target(Target::Keypoints {
            boxes: vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)],
            labels: vec![0],
            keypoints: vec![vec![Keypoint::new(5.0, 5.0, true)]],
        });
        assert_eq!(*render_sample(&sample)?.get_pixel(5, 5), class_color(0));

        let mask = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 0 } else { 1 }]));
        let sample = DataSample::from_image(DynamicImage::new_rgb8(4, 4)).with_target(Target::Mask(mask.clone()));
        let rendered = render_sample(&sample)?;
        assert_eq!(*rendered.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_ne!(*rendered.get_pixel(3, 0), Rgb([0, 0, 0]));
        assert_eq!(*colorize_mask(&mask).get_pixel(3, 3), class_color(1));
        Ok(())
    }

    #[test]
    fn test_grid_layout() -> Result<()> {
        let images = vec![RgbImage::new(4, 3), RgbImage::new(2, 5), RgbImage::new(1, 1)];
        let grid = render_grid(&images, 2)?;
        assert_eq!(grid.dimensions(), (8, 10));
        assert!(render_grid(&[], 2).is_err());
        Ok(())
    }

    #[test]
    fn test_records_counts_and_shapes() {
        let vis = BaseVisualization::new();
        let sample = Sample::from_single("input", Tensor::zeros([3, 2, 2], (Kind::Float, Device::Cpu)));
        vis.record_sample(RunningStage::Training, TransformHook::ToTensorTransform, &sample);
        vis.record_sample(RunningStage::Training, TransformHook::ToTensorTransform, &sample);

        let record = vis.get(RunningStage::Training, TransformHook::ToTensorTransform);
        assert_eq!(record.as_ref().map(|r| r.count), Some(2));
        assert_eq!(vis.to_json()["train"]["to_tensor_transform"]["shapes"]["input"][0], 3);
        vis.reset();
        assert!(vis.get(RunningStage::Training, TransformHook::ToTensorTransform).is_none());
    }
}
