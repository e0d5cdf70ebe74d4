#![allow(dead_code)]

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes a solid `width x height` PNG.
pub fn write_image(path: &Path, width: u32, height: u32, value: u8) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    RgbImage::from_pixel(width, height, Rgb([value, value / 2, 255 - value])).save(path)?;
    Ok(path.to_path_buf())
}

/// `root/<class>/<i>.png` for every `(class, count)`.
pub fn class_folders(root: &Path, classes: &[(&str, usize)]) -> Result<()> {
    for (class, count) in classes {
        for i in 0..*count {
            write_image(&root.join(class).join(format!("{}.png", i)), 12 + i as u32, 10, 40 * i as u8)?;
        }
    }
    Ok(())
}

/// `root/<i>.png` for every size, in order.
pub fn flat_folder(root: &Path, sizes: &[(u32, u32)]) -> Result<Vec<PathBuf>> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, (width, height))| write_image(&root.join(format!("{:02}.png", i)), *width, *height, 10 * i as u8))
        .collect()
}
