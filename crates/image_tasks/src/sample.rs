use crate::error::PipelineError;
use anyhow::{anyhow, bail, ensure, Result};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tch::Tensor;

/// Well-known feature names shared by inputs, transforms, collators and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKey {
    Input,
    Target,
    Preds,
    Metadata,
}

impl DataKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKey::Input => "input",
            DataKey::Target => "target",
            DataKey::Preds => "preds",
            DataKey::Metadata => "metadata",
        }
    }
}

impl AsRef<str> for DataKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Feature names for structured targets. Each is ragged across a batch
/// (a different number of objects per image).
pub mod keys {
    pub const TARGET_BOXES: &str = "target_boxes";
    pub const TARGET_LABELS: &str = "target_labels";
    pub const TARGET_KEYPOINTS: &str = "target_keypoints";
    pub const TARGET_MASKS: &str = "target_masks";
    pub const SCALES: &str = "scales";
    pub const PADDINGS: &str = "paddings";

    /// All keys that hold one tensor per object rather than per image.
    pub const OBJECT_KEYS: [&str; 4] = [TARGET_BOXES, TARGET_LABELS, TARGET_KEYPOINTS, TARGET_MASKS];
}

/// Per-sample bookkeeping that travels alongside the tensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<PathBuf>,
    /// `(height, width)` of the image as loaded, before any resizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn with_filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    pub fn with_size(mut self, height: u32, width: u32) -> Self {
        self.size = Some((height, width));
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Axis-aligned box in absolute pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Builds a box from `[x, y, width, height]`.
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.xmin * sx, self.ymin * sy, self.xmax * sx, self.ymax * sy)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.xmin + dx, self.ymin + dy, self.xmax + dx, self.ymax + dy)
    }

    /// Mirrors the box inside an image of the given width.
    pub fn flip_horizontal(&self, image_width: f32) -> Self {
        Self::new(image_width - self.xmax, self.ymin, image_width - self.xmin, self.ymax)
    }

    pub fn clip(&self, width: f32, height: f32) -> Self {
        Self::new(
            self.xmin.clamp(0.0, width),
            self.ymin.clamp(0.0, height),
            self.xmax.clamp(0.0, width),
            self.ymax.clamp(0.0, height),
        )
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub visible: bool,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, visible: bool) -> Self {
        Self { x, y, visible }
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x * sx, self.y * sy, self.visible)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.visible)
    }

    pub fn flip_horizontal(&self, image_width: f32) -> Self {
        Self::new(image_width - self.x, self.y, self.visible)
    }
}

/// Label attached to a sample, one variant per kind of task.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Single class index.
    Class(usize),
    /// Class indices of every label present in the image.
    MultiLabel(Vec<usize>),
    Detection {
        boxes: Vec<BoundingBox>,
        labels: Vec<usize>,
    },
    Keypoints {
        boxes: Vec<BoundingBox>,
        labels: Vec<usize>,
        keypoints: Vec<Vec<Keypoint>>,
    },
    Instances {
        boxes: Vec<BoundingBox>,
        labels: Vec<usize>,
        masks: Vec<GrayImage>,
    },
    /// Per-pixel class ids.
    Mask(GrayImage),
}

impl Target {
    /// Detection target with one label per box.
    pub fn detection(boxes: Vec<BoundingBox>, labels: Vec<usize>) -> Result<Self> {
        ensure!(
            boxes.len() == labels.len(),
            "Got {} boxes but {} labels",
            boxes.len(),
            labels.len()
        );
        Ok(Target::Detection { boxes, labels })
    }

    pub fn boxes(&self) -> Option<&[BoundingBox]> {
        match self {
            Target::Detection { boxes, .. }
            | Target::Keypoints { boxes, .. }
            | Target::Instances { boxes, .. } => Some(boxes),
            _ => None,
        }
    }

    pub fn labels(&self) -> Option<&[usize]> {
        match self {
            Target::Detection { labels, .. }
            | Target::Keypoints { labels, .. }
            | Target::Instances { labels, .. } => Some(labels),
            _ => None,
        }
    }

    /// Applies a geometric change to every spatial part of the target.
    /// Class labels pass through untouched.
    pub fn map_geometry<B, K, M>(self, map_box: B, map_keypoint: K, map_mask: M) -> Self
    where
        B: Fn(&BoundingBox) -> BoundingBox,
        K: Fn(&Keypoint) -> Keypoint,
        M: Fn(&GrayImage) -> GrayImage,
    {
        match self {
            Target::Detection { boxes, labels } => Target::Detection {
                boxes: boxes.iter().map(&map_box).collect(),
                labels,
            },
            Target::Keypoints {
                boxes,
                labels,
                keypoints,
            } => Target::Keypoints {
                boxes: boxes.iter().map(&map_box).collect(),
                labels,
                keypoints: keypoints
                    .iter()
                    .map(|points| points.iter().map(&map_keypoint).collect())
                    .collect(),
            },
            Target::Instances {
                boxes,
                labels,
                masks,
            } => Target::Instances {
                boxes: boxes.iter().map(&map_box).collect(),
                labels,
                masks: masks.iter().map(&map_mask).collect(),
            },
            Target::Mask(mask) => Target::Mask(map_mask(&mask)),
            other => other,
        }
    }

    /// Drops objects whose box became empty (e.g. cropped away).
    pub fn retain_non_empty(self) -> Self {
        fn keep<T>(items: Vec<T>, mask: &[bool]) -> Vec<T> {
            items
                .into_iter()
                .zip(mask)
                .filter_map(|(item, &keep)| keep.then_some(item))
                .collect()
        }

        let mask: Vec<bool> = match self.boxes() {
            Some(boxes) => boxes.iter().map(|b| !b.is_empty()).collect(),
            None => return self,
        };

        match self {
            Target::Detection { boxes, labels } => Target::Detection {
                boxes: keep(boxes, &mask),
                labels: keep(labels, &mask),
            },
            Target::Keypoints {
                boxes,
                labels,
                keypoints,
            } => Target::Keypoints {
                boxes: keep(boxes, &mask),
                labels: keep(labels, &mask),
                keypoints: keep(keypoints, &mask),
            },
            Target::Instances {
                boxes,
                labels,
                masks,
            } => Target::Instances {
                boxes: keep(boxes, &mask),
                labels: keep(labels, &mask),
                masks: keep(masks, &mask),
            },
            other => other,
        }
    }
}

/// Raw input of a sample before it is loaded.
#[derive(Debug)]
pub enum SampleInput {
    Path(PathBuf),
    Image(DynamicImage),
    Tensor(Tensor),
}

impl Clone for SampleInput {
    fn clone(&self) -> Self {
        match self {
            SampleInput::Path(path) => SampleInput::Path(path.clone()),
            SampleInput::Image(image) => SampleInput::Image(image.clone()),
            SampleInput::Tensor(tensor) => SampleInput::Tensor(tensor.shallow_clone()),
        }
    }
}

/// A sample on its way through the pre-tensor stages: the input may still
/// be a path, the target is structured and geometric transforms can see both.
#[derive(Debug, Clone)]
pub struct DataSample {
    pub input: SampleInput,
    pub target: Option<Target>,
    pub metadata: Metadata,
}

impl DataSample {
    pub fn new(input: SampleInput) -> Self {
        Self {
            input,
            target: None,
            metadata: Metadata::default(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(SampleInput::Path(path.into()))
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self::new(SampleInput::Image(image))
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the decoded image, failing if the sample was not loaded yet.
    pub fn image(&self) -> Result<&DynamicImage> {
        match &self.input {
            SampleInput::Image(image) => Ok(image),
            SampleInput::Path(path) => Err(anyhow!(
                "Sample input {} has not been loaded into an image",
                path.display()
            )),
            SampleInput::Tensor(_) => Err(anyhow!(
                "Sample input is a tensor; convert it with an image input first"
            )),
        }
    }

    /// Replaces the image through `f`, keeping target and metadata.
    pub fn map_image<F>(self, f: F) -> Result<Self>
    where
        F: FnOnce(DynamicImage) -> Result<DynamicImage>,
    {
        let DataSample {
            input,
            target,
            metadata,
        } = self;
        let image = match input {
            SampleInput::Image(image) => image,
            SampleInput::Path(path) => bail!(
                "Sample input {} has not been loaded into an image",
                path.display()
            ),
            SampleInput::Tensor(_) => {
                bail!("Sample input is a tensor; convert it with an image input first")
            }
        };
        Ok(DataSample {
            input: SampleInput::Image(f(image)?),
            target,
            metadata,
        })
    }
}

/// A sample after tensor conversion: named tensors plus the metadata that
/// came with it.
///
/// # Examples
/// - Classification: `{"input": Tensor([3, 196, 196]), "target": Tensor([])}`
/// - Detection: `{"input": Tensor([3, 128, 128]), "target_boxes": Tensor([N, 4]), "target_labels": Tensor([N])}`
#[derive(Debug)]
pub struct Sample {
    pub features: HashMap<String, Tensor>,
    pub metadata: Metadata,
}

/// Creates a shallow clone of the `Sample`
impl Clone for Sample {
    fn clone(&self) -> Self {
        let features = self
            .features
            .iter()
            .map(|(k, v)| (k.clone(), v.shallow_clone()))
            .collect();
        Self {
            features,
            metadata: self.metadata.clone(),
        }
    }
}

impl Sample {
    pub fn new(features: HashMap<String, Tensor>) -> Self {
        Self {
            features,
            metadata: Metadata::default(),
        }
    }

    /// Creates a `Sample` from a single `(feature_name, tensor)` pair.
    /// Chain with [`with_feature`](Self::with_feature) to add more features.
    pub fn from_single(name: impl Into<String>, tensor: Tensor) -> Self {
        Self::new(HashMap::from([(name.into(), tensor)]))
    }

    /// Adds or overwrites a feature.
    pub fn with_feature(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.features.insert(name.into(), tensor);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn get(&self, feature: &str) -> Result<&Tensor> {
        self.features
            .get(feature)
            .ok_or_else(|| PipelineError::MissingFeature(feature.to_string()).into())
    }

    pub fn input(&self) -> Result<&Tensor> {
        self.get(DataKey::Input.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.features.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, feature: &str) -> Result<Tensor> {
        self.features
            .remove(feature)
            .ok_or_else(|| PipelineError::MissingFeature(feature.to_string()).into())
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.features.contains_key(feature)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tch::{Device, Kind};

    fn make_sample(value: i64) -> Sample {
        Sample::from_single("input", Tensor::ones([3, 2, 2], (Kind::Float, Device::Cpu)))
            .with_feature("target", Tensor::from(value))
    }

    #[test]
    fn test_sample_basic_construction() -> Result<()> {
        let sample = make_sample(4);

        assert_eq!(sample.input()?.size(), vec![3, 2, 2]);
        assert_eq!(sample.get("target")?.int64_value(&[]), 4);
        let err = sample.get("missing").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingFeature(name)) if name == "missing"
        ));

        let features: Vec<_> = sample.features().collect();
        assert!(features.contains(&"input"));
        assert!(features.contains(&"target"));
        Ok(())
    }

    #[test]
    fn test_box_geometry() {
        let b = BoundingBox::from_xywh(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.to_array(), [10.0, 20.0, 40.0, 60.0]);
        assert_eq!(b.area(), 1200.0);
        assert_eq!(b.scale(0.5, 0.5).to_array(), [5.0, 10.0, 20.0, 30.0]);
        assert_eq!(b.flip_horizontal(100.0).to_array(), [60.0, 20.0, 90.0, 60.0]);
        assert!(BoundingBox::new(5.0, 5.0, 5.0, 9.0).is_empty());
    }

    #[test]
    fn test_target_map_and_retain() -> Result<()> {
        let target = Target::detection(
            vec![
                BoundingBox::new(0.0, 0.0, 4.0, 4.0),
                BoundingBox::new(10.0, 10.0, 12.0, 12.0),
            ],
            vec![1, 2],
        )?;

        let moved = target
            .map_geometry(|b| b.translate(-8.0, -8.0).clip(8.0, 8.0), |k| *k, |m| m.clone())
            .retain_non_empty();

        assert_eq!(moved.labels(), Some(&[2][..]));
        assert_eq!(moved.boxes().map(|b| b[0].to_array()), Some([2.0, 2.0, 4.0, 4.0]));
        Ok(())
    }

    #[test]
    fn test_mask_target_maps_mask() {
        let mask = GrayImage::from_pixel(2, 2, Luma([3]));
        let mapped = Target::Mask(mask).map_geometry(|b| *b, |k| *k, |m| {
            image::imageops::resize(m, 4, 4, image::imageops::FilterType::Nearest)
        });
        match mapped {
            Target::Mask(m) => assert_eq!(m.dimensions(), (4, 4)),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_detection_requires_matching_labels() {
        assert!(Target::detection(vec![BoundingBox::new(0.0, 0.0, 1.0, 1.0)], vec![]).is_err());
    }

    #[test]
    fn test_data_sample_image_access() -> Result<()> {
        let sample = DataSample::from_path("missing.png");
        assert!(sample.image().is_err());

        let loaded = DataSample::from_image(DynamicImage::new_rgb8(4, 3));
        let resized = loaded.map_image(|img| Ok(img.resize_exact(2, 2, image::imageops::FilterType::Nearest)))?;
        assert_eq!(resized.image()?.width(), 2);
        Ok(())
    }
}
