use crate::dataloader::worker_gen_bool;
use crate::sample::DataSample;
use crate::transforms::Transform;
use anyhow::{ensure, Result};
use image::{imageops, DynamicImage};

// ============================================================================
// RandomHorizontalFlip
// ============================================================================

/// Randomly flips images horizontally during training.
///
/// Randomness comes from the worker RNG, so a loader with a fixed seed
/// flips the same samples every run.
///
/// # Example
/// ```ignore
/// let flip = RandomHorizontalFlip::new(0.5)?; // 50% flip chance
/// let augmented = flip.apply(image)?;
/// ```
#[derive(Debug, Clone)]
pub struct RandomHorizontalFlip {
    p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&p),
            "Probability must be in [0.0, 1.0] range (got {})",
            p
        );
        Ok(Self { p })
    }

    fn should_flip(&self) -> bool {
        match self.p {
            p if p <= 0.0 => false,
            p if p >= 1.0 => true,
            p => worker_gen_bool(p),
        }
    }
}

impl Transform<DynamicImage, DynamicImage> for RandomHorizontalFlip {
    fn apply(&self, img: DynamicImage) -> Result<DynamicImage> {
        Ok(if self.should_flip() { img.fliph() } else { img })
    }
}

/// Flips the image together with boxes, keypoints and masks.
impl Transform<DataSample, DataSample> for RandomHorizontalFlip {
    fn apply(&self, sample: DataSample) -> Result<DataSample> {
        if !self.should_flip() {
            return Ok(sample);
        }
        let width = sample.image()?.width() as f32;
        let mut sample = sample.map_image(|img| Ok(img.fliph()))?;
        sample.target = sample.target.map(|target| {
            target.map_geometry(
                |b| b.flip_horizontal(width),
                |k| k.flip_horizontal(width),
                |m| imageops::flip_horizontal(m),
            )
        });
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataloader::init_worker_rng;
    use crate::sample::{BoundingBox, Keypoint, Target};
    use image::{Rgb, RgbImage};

    fn red_blue() -> DynamicImage {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_random_horizontal_flip() -> Result<()> {
        init_worker_rng(0, 0, 42);
        let flip = RandomHorizontalFlip::new(1.0)?;
        let flipped = Transform::<DynamicImage, DynamicImage>::apply(&flip, red_blue())?;
        assert_eq!(flipped.as_bytes(), &[0, 0, 255, 255, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_random_horizontal_flip_no_flip() -> Result<()> {
        let original = red_blue();
        let flip = RandomHorizontalFlip::new(0.0)?;
        let result = Transform::<DynamicImage, DynamicImage>::apply(&flip, original.clone())?;
        assert_eq!(original.as_bytes(), result.as_bytes());
        assert!(RandomHorizontalFlip::new(1.5).is_err());
        Ok(())
    }

    #[test]
    fn test_flip_moves_targets() -> Result<()> {
        let sample = DataSample::from_image(DynamicImage::new_rgb8(10, 4)).with_target(Target::Keypoints {
            boxes: vec![BoundingBox::new(1.0, 0.0, 3.0, 2.0)],
            labels: vec![0],
            keypoints: vec![vec![Keypoint::new(2.0, 1.0, true)]],
        });
        let out = Transform::<DataSample, DataSample>::apply(&RandomHorizontalFlip::new(1.0)?, sample)?;
        match out.target {
            Some(Target::Keypoints { boxes, keypoints, .. }) => {
                assert_eq!(boxes[0].to_array(), [7.0, 0.0, 9.0, 2.0]);
                assert_eq!(keypoints[0][0], Keypoint::new(8.0, 1.0, true));
            }
            other => panic!("unexpected target {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_seeded_flips_repeat() -> Result<()> {
        let flip = RandomHorizontalFlip::new(0.5)?;
        let run = || {
            init_worker_rng(1, 3, 7);
            (0..16).map(|_| flip.should_flip()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        Ok(())
    }
}
