//! Helpers outside the data pipeline proper.

pub mod download;

pub use download::{download_data, extract_zip, ZipLimits};
