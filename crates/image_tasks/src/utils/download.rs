//! Fetching example datasets: bounded HTTP download plus guarded zip
//! extraction.

use anyhow::{bail, ensure, Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest download accepted, 4 GiB.
pub const MAX_DOWNLOAD_BYTES: u64 = 4 << 30;

/// Limits applied while extracting an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
    /// Uncompressed / compressed size, per entry.
    pub max_compression_ratio: u64,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self {
            max_entries: 200_000,
            max_total_bytes: 16 << 30,
            max_compression_ratio: 200,
        }
    }
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(READ_TIMEOUT)
        .user_agent(concat!("image-tasks/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Last path segment of the URL, without query or fragment.
fn file_name_from_url(url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a file name from {}", url))
}

fn copy_limited(reader: impl Read, writer: &mut impl Write, max_bytes: u64) -> Result<u64> {
    let mut limited = reader.take(max_bytes + 1);
    let copied = io::copy(&mut limited, writer)?;
    ensure!(copied <= max_bytes, "Download exceeded {} bytes", max_bytes);
    Ok(copied)
}

/// Downloads `url` into `dir` and extracts it when it is a `.zip` file.
/// A file that is already present is not downloaded again.
///
/// Returns the path of the downloaded file.
pub fn download_data(url: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let target = dir.join(file_name_from_url(url)?);

    if target.exists() {
        tracing::info!(path = %target.display(), "Already downloaded");
    } else {
        tracing::info!(url, path = %target.display(), "Downloading");
        let response = agent()
            .get(url)
            .call()
            .with_context(|| format!("Failed to download {}", url))?;
        if let Some(length) = response.header("Content-Length").and_then(|l| l.parse::<u64>().ok()) {
            ensure!(
                length <= MAX_DOWNLOAD_BYTES,
                "Download is {} bytes, limit is {}",
                length,
                MAX_DOWNLOAD_BYTES
            );
        }

        // Write next to the target and rename, so an interrupted download
        // is never mistaken for a finished one.
        let partial = target.with_extension("part");
        let mut file = File::create(&partial).with_context(|| format!("Failed to create {}", partial.display()))?;
        let bytes = copy_limited(response.into_reader(), &mut file, MAX_DOWNLOAD_BYTES)?;
        file.flush()?;
        fs::rename(&partial, &target)?;
        tracing::debug!(bytes, "Download finished");
    }

    if target.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip")) {
        extract_zip(&target, dir, ZipLimits::default())?;
    }
    Ok(target)
}

/// Extracts `archive` into `dir`. Entries escaping `dir` fail the whole
/// extraction.
pub fn extract_zip(archive: impl AsRef<Path>, dir: impl AsRef<Path>, limits: ZipLimits) -> Result<usize> {
    let (archive, dir) = (archive.as_ref(), dir.as_ref());
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).with_context(|| format!("Not a zip archive: {}", archive.display()))?;
    ensure!(
        zip.len() <= limits.max_entries,
        "Archive has {} entries, limit is {}",
        zip.len(),
        limits.max_entries
    );

    let mut total: u64 = 0;
    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("Archive entry '{}' points outside the target folder", entry.name());
        };
        let size = entry.size();
        if size > 0 {
            ensure!(
                size <= entry.compressed_size().saturating_mul(limits.max_compression_ratio),
                "Archive entry '{}' exceeds the compression ratio limit",
                entry.name()
            );
        }
        total = total.saturating_add(size);
        ensure!(
            total <= limits.max_total_bytes,
            "Archive extracts to more than {} bytes",
            limits.max_total_bytes
        );

        let out = dir.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = File::create(&out).with_context(|| format!("Failed to create {}", out.display()))?;
        copy_limited(&mut entry, &mut writer, size)?;
        files += 1;
    }
    tracing::info!(archive = %archive.display(), files, "Extracted archive");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let mut zip = ZipWriter::new(File::create(path)?);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default())?;
            zip.write_all(data)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn test_extracts_nested_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("data.zip");
        write_zip(&archive, &[("data/train/a.txt", b"a"), ("data/val/b.txt", b"bb")])?;

        let out = dir.path().join("out");
        assert_eq!(extract_zip(&archive, &out, ZipLimits::default())?, 2);
        assert_eq!(fs::read(out.join("data/val/b.txt"))?, b"bb");
        Ok(())
    }

    #[test]
    fn test_rejects_path_traversal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x")])?;
        assert!(extract_zip(&archive, dir.path().join("out"), ZipLimits::default()).is_err());
        assert!(!dir.path().join("escape.txt").exists());
        Ok(())
    }

    #[test]
    fn test_entry_limit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("many.zip");
        write_zip(&archive, &[("a", b"1"), ("b", b"2"), ("c", b"3")])?;
        let limits = ZipLimits {
            max_entries: 2,
            ..Default::default()
        };
        assert!(extract_zip(&archive, dir.path(), limits).is_err());
        Ok(())
    }

    #[test]
    fn test_existing_file_is_not_fetched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("labels.json"), b"{}")?;
        // Unroutable host: only succeeds because nothing is fetched.
        let path = download_data("http://invalid.invalid/data/labels.json?raw=1", dir.path())?;
        assert_eq!(path, dir.path().join("labels.json"));
        Ok(())
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://host/a/b.zip").ok(), Some("b.zip".to_string()));
        assert!(file_name_from_url("https://").is_err());
    }
}
