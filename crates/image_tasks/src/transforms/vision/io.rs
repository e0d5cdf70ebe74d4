use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::{DynamicImage, ImageReader};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

// ============================================================================
// LoadImage
// ============================================================================

/// Loads images from file paths.
///
/// Reads the whole file through a buffered reader and decodes it with the
/// `image` crate, guessing the format from the content. With the
/// `turbojpeg` feature enabled, JPEG files go through libjpeg-turbo first
/// and fall back to the `image` decoder if that fails.
///
/// # Example
/// ```ignore
/// let loader = LoadImage::new();
/// let image = loader.apply(PathBuf::from("photo.jpg"))?;
/// println!("Image size: {:?}", image.dimensions());
/// ```
#[derive(Debug, Clone)]
pub struct LoadImage {
    buffer_size: usize,
}

impl Default for LoadImage {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadImage {
    /// Creates a new image loader with an 8KB read buffer.
    pub fn new() -> Self {
        Self { buffer_size: 8192 }
    }

    /// Decodes an in-memory encoded image (PNG, JPEG, ...).
    pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .context("Failed to guess image format")?
            .decode()
            .context("Failed to decode image bytes")
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?;
        let file_size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        let mut reader = BufReader::with_capacity(self.buffer_size, file);
        let mut buffer = Vec::with_capacity(file_size);
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read image: {}", path.display()))?;
        Ok(buffer)
    }

    fn load_standard_format(&self, path: &Path) -> Result<DynamicImage> {
        let buffer = self.read_file(path)?;
        Self::decode_bytes(&buffer)
            .with_context(|| format!("Failed to decode image: {}", path.display()))
    }

    #[cfg(feature = "turbojpeg")]
    fn load_jpeg_optimized(&self, path: &Path) -> Result<DynamicImage> {
        use image::RgbImage;
        use turbojpeg::{Decompressor, Image, PixelFormat};

        let buffer = self.read_file(path)?;
        let mut decompressor =
            Decompressor::new().context("Failed to create TurboJPEG decompressor")?;
        let header = decompressor
            .read_header(&buffer)
            .with_context(|| format!("Failed to read JPEG header: {}", path.display()))?;

        let (width, height) = (header.width, header.height);
        let mut rgb_data = vec![0u8; width * height * 3];
        let output_image = Image {
            pixels: rgb_data.as_mut_slice(),
            width,
            height,
            format: PixelFormat::RGB,
            pitch: width * 3,
        };
        decompressor
            .decompress(&buffer, output_image)
            .with_context(|| format!("Failed to decompress JPEG: {}", path.display()))?;

        let rgb_image = RgbImage::from_raw(width as u32, height as u32, rgb_data)
            .context("Failed to create RGB image from TurboJPEG data")?;
        Ok(DynamicImage::ImageRgb8(rgb_image))
    }

    #[cfg(feature = "turbojpeg")]
    fn is_jpeg_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "jpg" | "jpeg"))
    }
}

impl Transform<PathBuf, DynamicImage> for LoadImage {
    #[cfg(feature = "turbojpeg")]
    fn apply(&self, path: PathBuf) -> Result<DynamicImage> {
        if Self::is_jpeg_file(&path) {
            self.load_jpeg_optimized(&path).or_else(|turbo_error| {
                tracing::warn!(
                    path = %path.display(),
                    error = %turbo_error,
                    "TurboJPEG failed, falling back to standard decoder"
                );
                self.load_standard_format(&path)
            })
        } else {
            self.load_standard_format(&path)
        }
    }

    #[cfg(not(feature = "turbojpeg"))]
    fn apply(&self, path: PathBuf) -> Result<DynamicImage> {
        self.load_standard_format(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::NamedTempFile;

    fn create_test_image() -> Result<NamedTempFile> {
        let mut test_img = RgbImage::new(3, 3);
        test_img.put_pixel(0, 0, Rgb([255, 0, 0]));
        test_img.put_pixel(1, 1, Rgb([0, 255, 0]));
        test_img.put_pixel(2, 2, Rgb([0, 0, 255]));

        let temp_file = NamedTempFile::with_suffix(".png")?;
        test_img.save(temp_file.path())?;
        Ok(temp_file)
    }

    #[test]
    fn test_load_image() -> Result<()> {
        let temp_file = create_test_image()?;
        let loaded_image = LoadImage::new().apply(temp_file.path().to_path_buf())?;

        assert_eq!(loaded_image.dimensions(), (3, 3));
        let rgb = loaded_image.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(rgb.get_pixel(1, 1), &Rgb([0, 255, 0]));
        assert_eq!(rgb.get_pixel(2, 2), &Rgb([0, 0, 255]));
        Ok(())
    }

    #[test]
    fn test_decode_bytes() -> Result<()> {
        let temp_file = create_test_image()?;
        let bytes = std::fs::read(temp_file.path())?;
        assert_eq!(LoadImage::decode_bytes(&bytes)?.dimensions(), (3, 3));
        assert!(LoadImage::decode_bytes(b"not an image").is_err());
        Ok(())
    }

    #[test]
    fn test_error_handling() {
        let result = LoadImage::new().apply(PathBuf::from("nonexistent.jpg"));
        assert!(result.is_err(), "Should error for non-existent file");
    }
}
