//! Disk store for similarity descriptors, shared by every directory.
//!
//! Descriptors are dropped from records before they are persisted. This
//! store keeps them keyed by content hash and algorithm so a rescan of an
//! unchanged file can skip the extractor. Every failure is a cache miss.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, warn};

use crate::core::similarity::{Algorithm, Descriptor};

#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<user cache dir>/lenscull/descriptors`, if the platform has one.
    pub fn default_root() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("lenscull").join("descriptors"))
    }

    pub fn open_default() -> Option<Self> {
        Self::default_root().map(Self::open)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, content_hash: &str, algorithm: Algorithm) -> PathBuf {
        self.root.join(format!("{content_hash}_{}.json.gz", algorithm.name()))
    }

    pub fn get(&self, content_hash: &str, algorithm: Algorithm) -> Option<Descriptor> {
        let path = self.entry_path(content_hash, algorithm);
        let file = File::open(&path).ok()?;
        match serde_json::from_reader(BufReader::new(GzDecoder::new(file))) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!("discarding unreadable descriptor {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Store `descriptor`. Returns whether it was written.
    pub fn put(&self, content_hash: &str, algorithm: Algorithm, descriptor: &Descriptor) -> bool {
        match self.try_put(content_hash, algorithm, descriptor) {
            Ok(()) => true,
            Err(e) => {
                debug!("descriptor for {content_hash} not stored: {e}");
                false
            }
        }
    }

    fn try_put(
        &self,
        content_hash: &str,
        algorithm: Algorithm,
        descriptor: &Descriptor,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        {
            let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::fast());
            serde_json::to_writer(&mut encoder, descriptor)?;
            encoder.finish()?.flush()?;
        }
        tmp.persist(self.entry_path(content_hash, algorithm))?;
        Ok(())
    }

    /// Remove every stored descriptor. Returns how many were deleted.
    pub fn clear(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter(|entry| fs::remove_file(entry.path()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_then_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = DescriptorStore::open(temp_dir.path().join("store"));
        let descriptor = Descriptor::Histogram(vec![0.25, 0.5]);

        assert!(store.get("abc", Algorithm::Histogram).is_none());
        assert!(store.put("abc", Algorithm::Histogram, &descriptor));
        assert_eq!(store.get("abc", Algorithm::Histogram), Some(descriptor));
        // Keyed by algorithm as well as hash.
        assert!(store.get("abc", Algorithm::PHash).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = DescriptorStore::open(temp_dir.path());
        fs::write(store.entry_path("bad", Algorithm::PHash), b"garbage").unwrap();

        assert!(store.get("bad", Algorithm::PHash).is_none());
        assert!(!store.entry_path("bad", Algorithm::PHash).exists());
    }

    #[test]
    fn test_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = DescriptorStore::open(temp_dir.path());
        store.put("a", Algorithm::PHash, &Descriptor::Hash(vec![1]));
        store.put("b", Algorithm::PHash, &Descriptor::Hash(vec![2]));

        assert_eq!(store.clear(), 2);
        assert!(store.get("a", Algorithm::PHash).is_none());
        assert_eq!(DescriptorStore::open(temp_dir.path().join("missing")).clear(), 0);
    }
}
