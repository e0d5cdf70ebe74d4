use crate::error::PipelineError;
use crate::transforms::vision::{tensor_to_image, LoadImage};
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::Path;
use tch::Tensor;

/// Image file extensions accepted by the image inputs.
pub const IMG_EXTENSIONS: [&str; 9] = [
    ".jpg", ".jpeg", ".png", ".ppm", ".bmp", ".pgm", ".tif", ".tiff", ".webp",
];

/// Arrays saved with numpy, read as images.
pub const NP_EXTENSIONS: [&str; 1] = [".npy"];

/// Case-insensitive suffix check.
pub fn has_file_allowed_extension(path: impl AsRef<Path>, extensions: &[&str]) -> bool {
    let name = path.as_ref().to_string_lossy().to_lowercase();
    extensions.iter().any(|ext| name.ends_with(&ext.to_lowercase()))
}

/// Every extension [`image_loader`] accepts.
pub fn supported_extensions() -> Vec<&'static str> {
    IMG_EXTENSIONS.iter().chain(NP_EXTENSIONS.iter()).copied().collect()
}

/// Loads an image file or a `.npy` array as an image.
///
/// Any other extension fails with [`PipelineError::UnsupportedExtension`].
pub fn image_loader(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    if has_file_allowed_extension(path, &IMG_EXTENSIONS) {
        LoadImage::new().apply(path.to_path_buf())
    } else if has_file_allowed_extension(path, &NP_EXTENSIONS) {
        let array = Tensor::read_npy(path)
            .with_context(|| format!("Failed to read numpy array: {}", path.display()))?;
        tensor_to_image(&array).with_context(|| format!("Failed to convert {} to an image", path.display()))
    } else {
        Err(PipelineError::UnsupportedExtension {
            path: path.to_path_buf(),
            supported: supported_extensions().into_iter().map(String::from).collect(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbImage};
    use tch::{Device, Kind};
    use tempfile::tempdir;

    #[test]
    fn test_extension_check_is_case_insensitive() {
        assert!(has_file_allowed_extension("a/b/photo.JPG", &IMG_EXTENSIONS));
        assert!(has_file_allowed_extension("x.tiff", &IMG_EXTENSIONS));
        assert!(!has_file_allowed_extension("x.npy", &IMG_EXTENSIONS));
        assert!(!has_file_allowed_extension("jpg", &IMG_EXTENSIONS));
    }

    #[test]
    fn test_image_loader_formats() -> Result<()> {
        let dir = tempdir()?;
        let png = dir.path().join("img.png");
        RgbImage::new(5, 4).save(&png)?;
        assert_eq!(image_loader(&png)?.dimensions(), (5, 4));

        let npy = dir.path().join("arr.npy");
        Tensor::zeros([4, 6, 3], (Kind::Uint8, Device::Cpu)).write_npy(&npy)?;
        assert_eq!(image_loader(&npy)?.dimensions(), (6, 4));
        Ok(())
    }

    #[test]
    fn test_unsupported_extension_lists_supported() {
        let err = image_loader("notes.txt").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("File: notes.txt has an unsupported extension."));
        assert!(message.contains(".webp"));
        assert!(message.contains(".npy"));
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnsupportedExtension { .. })
        ));
    }
}
