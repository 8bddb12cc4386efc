use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use assetso_lifecycle_core::UPLOADS_PREFIX;

const TEMP_PREFIX: &str = ".alm-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Forward-slash path relative to the store root.
    pub relative_path: String,
    pub size: u64,
}

/// The directory-like collaborator that holds uploaded asset files.
pub trait BinaryStore: Send + Sync {
    /// # Errors
    /// Returns `NotFound` for an absent file and `InvalidInput` for an unsafe path.
    fn open(&self, relative_path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Replace the file at `relative_path` with everything read from `contents`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an unsafe path or the underlying I/O error.
    fn write(&self, relative_path: &str, contents: &mut dyn Read) -> io::Result<u64>;

    /// Every stored file in lexical path order.
    ///
    /// # Errors
    /// Returns the underlying I/O error when the store cannot be walked.
    fn list(&self) -> io::Result<Vec<StoredFile>>;

    /// Size of the file, or `None` when it does not exist.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an unsafe path or the underlying I/O error.
    fn stat(&self, relative_path: &str) -> io::Result<Option<u64>>;
}

/// Check that `relative_path` stays inside the store root.
///
/// # Errors
/// Returns `InvalidInput` for empty, absolute, or parent-escaping paths.
pub fn safe_relative_path(relative_path: &str) -> io::Result<PathBuf> {
    let invalid = || {
        io::Error::new(io::ErrorKind::InvalidInput, format!("unsafe store path: {relative_path:?}"))
    };
    if relative_path.is_empty() || relative_path.contains('\\') || relative_path.contains('\0') {
        return Err(invalid());
    }
    let path = Path::new(relative_path);
    if !path.components().all(|component| matches!(component, Component::Normal(_))) {
        return Err(invalid());
    }
    Ok(path.to_path_buf())
}

/// How a row's image column relates to the binary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// Hosted elsewhere; never bundled.
    External,
    /// Store-relative path, already checked with [`safe_relative_path`].
    Local(String),
    /// Points outside the store or is otherwise unusable.
    Unsafe,
}

/// Classify an image reference. `None` when the column is blank.
#[must_use]
pub fn normalize_reference(raw: &str) -> Option<ImageReference> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(ImageReference::External);
    }

    let without_query = trimmed.split(['?', '#']).next().unwrap_or_default();
    let relative = without_query.trim_start_matches('/');
    let relative = relative.strip_prefix(UPLOADS_PREFIX).unwrap_or(relative);
    match safe_relative_path(relative) {
        Ok(_) => Some(ImageReference::Local(relative.to_string())),
        Err(_) => Some(ImageReference::Unsafe),
    }
}

/// [`BinaryStore`] rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBinaryStore {
    root: PathBuf,
}

impl FsBinaryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative_path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(safe_relative_path(relative_path)?))
    }
}

impl BinaryStore for FsBinaryStore {
    fn open(&self, relative_path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.resolve(relative_path)?)?))
    }

    fn write(&self, relative_path: &str, contents: &mut dyn Read) -> io::Result<u64> {
        let path = self.resolve(relative_path)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let mut staged = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent)?;
        let written = io::copy(contents, &mut staged)?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|err| err.error)?;
        Ok(written)
    }

    fn list(&self) -> io::Result<Vec<StoredFile>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative_path = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(StoredFile { relative_path, size: entry.metadata()?.len() });
        }
        Ok(files)
    }

    fn stat(&self, relative_path: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.resolve(relative_path)?) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}
