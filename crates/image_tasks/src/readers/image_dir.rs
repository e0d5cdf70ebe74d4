use crate::dataset::DataSource;
use crate::io::loader::{has_file_allowed_extension, supported_extensions};
use crate::sample::{DataSample, Metadata};
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Streams image file paths from a directory, with optional recursion and
/// extension filtering.
///
/// Only paths are produced; decoding happens later in the input's
/// `load_sample`, usually on a worker thread.
///
/// # Example
/// ```ignore
/// let source = ImageDirSource::new("./data/images", true);
/// for sample in source.stream()? {
///     let sample = ImagePathsInput.load_sample(sample?)?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ImageDirSource {
    dir_path: PathBuf,
    extensions: Vec<String>,
    recurse: bool,
}

impl ImageDirSource {
    /// Accepts every image and `.npy` extension.
    pub fn new(dir_path: impl Into<PathBuf>, recurse: bool) -> Self {
        Self {
            dir_path: dir_path.into(),
            extensions: supported_extensions().into_iter().map(String::from).collect(),
            recurse,
        }
    }

    /// Restricts the accepted extensions, e.g. `[".jpg", ".png"]`.
    /// Case-insensitive.
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|s| s.to_lowercase()).collect();
        self
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    /// Lazily walks the directory. Order follows the file system.
    pub fn paths(&self) -> Result<Box<dyn Iterator<Item = Result<PathBuf>> + Send>> {
        let dir_metadata = fs::metadata(&self.dir_path)
            .with_context(|| format!("Failed to access directory: {}", self.dir_path.display()))?;
        if !dir_metadata.is_dir() {
            bail!("Path is not a directory: {}", self.dir_path.display());
        }

        let extensions = self.extensions.clone();
        let path_iter: Box<dyn Iterator<Item = Result<PathBuf>> + Send> = if self.recurse {
            Box::new(WalkDir::new(&self.dir_path).into_iter().map(|entry| {
                entry
                    .map(|e| e.path().to_path_buf())
                    .map_err(|e| anyhow!("Failed to read directory entry: {}", e))
            }))
        } else {
            Box::new(fs::read_dir(&self.dir_path)?.map(|entry| {
                entry
                    .map(|e| e.path())
                    .map_err(|e| anyhow!("Failed to read directory entry: {}", e))
            }))
        };

        // Symlinks, non-files and other extensions are skipped.
        let iter = path_iter.filter_map(move |path_result| match path_result {
            Ok(path) => {
                if path.is_symlink() {
                    return None;
                }
                match path.metadata() {
                    Ok(metadata) if metadata.is_file() => {
                        let allowed: Vec<&str> = extensions.iter().map(String::as_str).collect();
                        if !has_file_allowed_extension(&path, &allowed) {
                            return None;
                        }
                        match fs::File::open(&path) {
                            Ok(_) => Some(Ok(path)),
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                                None
                            }
                        }
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e).with_context(|| {
                        format!("Failed to get metadata for: {}", path.display())
                    })),
                }
            }
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(iter))
    }

    /// All matching paths, sorted so sample order is stable across runs.
    pub fn sorted_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = self.paths()?.collect::<Result<Vec<_>>>()?;
        paths.sort();
        Ok(paths)
    }
}

/// Yields unloaded samples, one per file.
impl DataSource for ImageDirSource {
    fn stream(&self) -> Result<Box<dyn Iterator<Item = Result<DataSample>> + Send>> {
        Ok(Box::new(self.paths()?.map(|path| {
            path.map(|p| DataSample::from_path(&p).with_metadata(Metadata::default().with_filepath(p)))
        })))
    }
}
