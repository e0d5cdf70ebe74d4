use crate::sample::{DataSample, Metadata};
use crate::transforms::vision::LoadImage;
use anyhow::{Context, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Accepts payloads with or without `=` padding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Turns a base64-encoded image (as sent to a serving endpoint) into a
/// loaded sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDeserializer;

impl ImageDeserializer {
    pub fn deserialize(&self, payload: &str) -> Result<DataSample> {
        let payload = payload.trim();
        // `data:image/png;base64,....`
        let encoded = match payload.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => payload,
        };
        let encoded = encoded.trim_end_matches('=');
        let bytes = LENIENT
            .decode(encoded)
            .context("Image payload is not valid base64")?;
        let image = LoadImage::decode_bytes(&bytes)?;
        let (width, height) = image.dimensions();
        Ok(DataSample::from_image(image).with_metadata(Metadata::default().with_size(height, width)))
    }

    /// A small PNG, base64-encoded, for trying out an endpoint.
    pub fn example_input(&self) -> Result<String> {
        let image = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 128]));
        encode_png(&DynamicImage::ImageRgb8(image))
    }
}

/// Encodes an image as base64 PNG.
pub fn encode_png(image: &DynamicImage) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(STANDARD.encode(buffer.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_input_round_trips() -> Result<()> {
        let deserializer = ImageDeserializer;
        let sample = deserializer.deserialize(&deserializer.example_input()?)?;
        assert_eq!(sample.metadata.size, Some((16, 16)));
        assert_eq!(sample.image()?.dimensions(), (16, 16));
        Ok(())
    }

    #[test]
    fn test_padding_is_lenient() -> Result<()> {
        let deserializer = ImageDeserializer;
        let encoded = deserializer.example_input()?;
        let stripped = encoded.trim_end_matches('=');
        assert!(deserializer.deserialize(stripped).is_ok());
        assert!(deserializer.deserialize(&format!("{}===", stripped)).is_ok());
        assert!(deserializer
            .deserialize(&format!("data:image/png;base64,{}", encoded))
            .is_ok());
        Ok(())
    }

    #[test]
    fn test_garbage_fails() {
        assert!(ImageDeserializer.deserialize("not an image!").is_err());
        assert!(ImageDeserializer.deserialize("aGVsbG8").is_err());
    }
}
