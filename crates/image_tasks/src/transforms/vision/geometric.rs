use crate::sample::{DataSample, Keypoint};
use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, GrayImage};
use tch::Tensor;

// ============================================================================
// EnsureRGB
// ============================================================================
/// Ensures that the image is indeed 3-channel RGB
#[derive(Debug, Clone)]
pub struct EnsureRGB;

impl Transform<DynamicImage, DynamicImage> for EnsureRGB {
    fn apply(&self, img: DynamicImage) -> Result<DynamicImage> {
        Ok(match img {
            DynamicImage::ImageRgb8(_) => img,
            _ => DynamicImage::ImageRgb8(img.to_rgb8()),
        })
    }
}

impl Transform<DataSample, DataSample> for EnsureRGB {
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        sample.map_image(|img| Transform::<DynamicImage, DynamicImage>::apply(self, img))
    }
}

// ============================================================================
// Resize
// ============================================================================

/// Resizes an image to exactly `height x width`.
///
/// # Filter Types
/// - `Nearest`: Nearest neighbour, fastest
/// - `Triangle`: Bilinear filter, good all-round default
/// - `CatmullRom`: Bicubic sharpening
/// - `Gaussian`: Blurring/smoothing
/// - `Lanczos3`: Lanczos with window 3, highest quality re-sampling but slowest.
///
/// On a [`DataSample`], boxes and keypoints are rescaled and masks are
/// resized with nearest-neighbour so class ids are preserved.
#[derive(Debug, Clone)]
pub struct Resize {
    height: u32,
    width: u32,
    filter: FilterType,
}

impl Resize {
    /// Creates a bilinear resize to `(height, width)`.
    pub fn new(height: u32, width: u32) -> Result<Self> {
        Self::with_filter(height, width, FilterType::Triangle)
    }

    pub fn with_filter(height: u32, width: u32, filter: FilterType) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive after resizing (got {}x{})",
            height,
            width
        );
        Ok(Self {
            height,
            width,
            filter,
        })
    }
}

impl Transform<DynamicImage, DynamicImage> for Resize {
    fn apply(&self, img: DynamicImage) -> Result<DynamicImage> {
        Ok(img.resize_exact(self.width, self.height, self.filter))
    }
}

impl Transform<DataSample, DataSample> for Resize {
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        let (old_w, old_h) = sample.image()?.dimensions();
        let sx = self.width as f32 / old_w as f32;
        let sy = self.height as f32 / old_h as f32;
        let (width, height) = (self.width, self.height);

        let mut sample = sample.map_image(|img| Transform::<DynamicImage, DynamicImage>::apply(self, img))?;
        sample.target = sample.target.map(|target| {
            target.map_geometry(
                |b| b.scale(sx, sy),
                |k| k.scale(sx, sy),
                |m| imageops::resize(m, width, height, FilterType::Nearest),
            )
        });
        Ok(sample)
    }
}

// ============================================================================
// CenterCrop
// ============================================================================

/// Crops the central `height x width` region. Images smaller than the crop
/// are padded with zeros, like torchvision does.
///
/// On a [`DataSample`], boxes are shifted and clipped (boxes left with no
/// area are dropped) and keypoints falling outside become invisible.
#[derive(Debug, Clone)]
pub struct CenterCrop {
    height: u32,
    width: u32,
}

impl CenterCrop {
    pub fn new(height: u32, width: u32) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Crop dimensions must be positive (got {}x{})",
            height,
            width
        );
        Ok(Self { height, width })
    }

    /// Top-left corner of the crop inside an image of the given size.
    /// Negative offsets mean the image gets padded.
    fn offsets(&self, img_w: u32, img_h: u32) -> (i64, i64) {
        let left = ((img_w as f64 - self.width as f64) / 2.0).round() as i64;
        let top = ((img_h as f64 - self.height as f64) / 2.0).round() as i64;
        (left, top)
    }

    fn crop_mask(&self, mask: &GrayImage, left: i64, top: i64) -> GrayImage {
        let mut canvas = GrayImage::new(self.width, self.height);
        imageops::overlay(&mut canvas, mask, -left, -top);
        canvas
    }
}

impl Transform<DynamicImage, DynamicImage> for CenterCrop {
    fn apply(&self, img: DynamicImage) -> Result<DynamicImage> {
        let (w, h) = img.dimensions();
        let (left, top) = self.offsets(w, h);
        if left >= 0 && top >= 0 {
            return Ok(img.crop_imm(left as u32, top as u32, self.width, self.height));
        }
        let mut canvas = DynamicImage::new(self.width, self.height, img.color());
        imageops::overlay(&mut canvas, &img, -left, -top);
        Ok(canvas)
    }
}

impl Transform<DataSample, DataSample> for CenterCrop {
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        let (w, h) = sample.image()?.dimensions();
        let (left, top) = self.offsets(w, h);
        let (dx, dy) = (-left as f32, -top as f32);
        let (cw, ch) = (self.width as f32, self.height as f32);

        let mut sample = sample.map_image(|img| Transform::<DynamicImage, DynamicImage>::apply(self, img))?;
        sample.target = sample.target.map(|target| {
            target
                .map_geometry(
                    |b| b.translate(dx, dy).clip(cw, ch),
                    |k| {
                        let moved = k.translate(dx, dy);
                        let inside = (0.0..cw).contains(&moved.x) && (0.0..ch).contains(&moved.y);
                        Keypoint::new(moved.x, moved.y, moved.visible && inside)
                    },
                    |m| self.crop_mask(m, left, top),
                )
                .retain_non_empty()
        });
        Ok(sample)
    }
}

// ============================================================================
// Tensor variants (on-device stage)
// ============================================================================

/// Bilinear resize of a `[C, H, W]` (or `[B, C, H, W]`) float tensor.
#[derive(Debug, Clone)]
pub struct ResizeTensor {
    height: i64,
    width: i64,
}

impl ResizeTensor {
    pub fn new(height: u32, width: u32) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive after resizing (got {}x{})",
            height,
            width
        );
        Ok(Self {
            height: height as i64,
            width: width as i64,
        })
    }
}

impl Transform<Tensor, Tensor> for ResizeTensor {
    fn apply(&self, tensor: Tensor) -> Result<Tensor> {
        let dims = tensor.dim();
        ensure!(
            dims == 3 || dims == 4,
            "ResizeTensor expects [C, H, W] or [B, C, H, W], got {:?}",
            tensor.size()
        );
        let batched = if dims == 3 { tensor.unsqueeze(0) } else { tensor };
        let resized = batched
            .f_upsample_bilinear2d([self.height, self.width], false, None, None)
            .context("Failed to resize tensor")?;
        Ok(if dims == 3 { resized.squeeze_dim(0) } else { resized })
    }
}

/// Center crop of the last two dims of a tensor, zero-padding when needed.
#[derive(Debug, Clone)]
pub struct CenterCropTensor {
    height: i64,
    width: i64,
}

impl CenterCropTensor {
    pub fn new(height: u32, width: u32) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Crop dimensions must be positive (got {}x{})",
            height,
            width
        );
        Ok(Self {
            height: height as i64,
            width: width as i64,
        })
    }
}

impl Transform<Tensor, Tensor> for CenterCropTensor {
    fn apply(&self, tensor: Tensor) -> Result<Tensor> {
        let size = tensor.size();
        ensure!(size.len() >= 2, "CenterCropTensor needs at least 2 dims, got {:?}", size);
        let (h, w) = (size[size.len() - 2], size[size.len() - 1]);

        let pad_w = (self.width - w).max(0);
        let pad_h = (self.height - h).max(0);
        let tensor = if pad_w > 0 || pad_h > 0 {
            tensor.constant_pad_nd([pad_w / 2, pad_w - pad_w / 2, pad_h / 2, pad_h - pad_h / 2])
        } else {
            tensor
        };

        let size = tensor.size();
        let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
        let top = ((h - self.height) as f64 / 2.0).round() as i64;
        let left = ((w - self.width) as f64 / 2.0).round() as i64;
        let dims = size.len() as i64;
        Ok(tensor
            .narrow(dims - 2, top, self.height)
            .narrow(dims - 1, left, self.width))
    }
}
