use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Live on-disk identity of one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub modified_time: i64,
    pub byte_size: u64,
}

/// Result of listing one directory.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub directory: PathBuf,
    pub modified_time: i64,
    /// Sorted by name; this is the canonical file ordering.
    pub files: Vec<FileStat>,
}

impl DirectoryListing {
    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }
}

/// Lists supported image files directly inside a directory.
pub struct ScannerService {
    supported_formats: HashSet<String>,
}

impl ScannerService {
    pub fn new() -> Self {
        Self {
            supported_formats: SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn is_supported_format(&self, file_path: &Path) -> bool {
        if let Some(extension) = file_path.extension() {
            let ext = extension.to_string_lossy().to_lowercase();
            self.supported_formats.contains(&ext)
        } else {
            false
        }
    }

    pub fn scan(&self, directory: &Path) -> Result<DirectoryListing, ScanError> {
        if !directory.is_dir() {
            return Err(ScanError::InvalidPath {
                path: directory.to_string_lossy().to_string(),
            });
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || !self.is_supported_format(path) {
                continue;
            }
            files.push(stat_file(path)?);
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DirectoryListing {
            directory: directory.to_path_buf(),
            modified_time: modified_time(directory)?,
            files,
        })
    }
}

impl Default for ScannerService {
    fn default() -> Self {
        Self::new()
    }
}

pub fn stat_file(path: &Path) -> Result<FileStat, ScanError> {
    let metadata = fs::metadata(path)?;
    let name = path
        .file_name()
        .ok_or_else(|| ScanError::InvalidPath {
            path: path.to_string_lossy().to_string(),
        })?
        .to_string_lossy()
        .to_string();
    Ok(FileStat {
        name,
        modified_time: nanos_since_epoch(metadata.modified()?),
        byte_size: metadata.len(),
    })
}

pub fn modified_time(path: &Path) -> Result<i64, ScanError> {
    Ok(nanos_since_epoch(fs::metadata(path)?.modified()?))
}

pub fn nanos_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos().min(i64::MAX as u128) as i64,
        Err(e) => -(e.duration().as_nanos().min(i64::MAX as u128) as i64),
    }
}
