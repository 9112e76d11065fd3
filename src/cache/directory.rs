use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{FieldKind, FieldSet, Record};
use crate::core::scanner::{FileStat, modified_time, nanos_since_epoch};
use crate::core::similarity::Algorithm;

pub const CACHE_FILE: &str = "lenscull.db";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode cache: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    fn from_io(path: &Path) -> impl Fn(io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk shape: one JSON object mapping file name to record, plus the
/// reserved `@`-prefixed keys.
#[derive(Deserialize)]
struct CacheDocument {
    #[serde(rename = "@last_scan_time", default)]
    last_scan_time: i64,
    #[serde(rename = "@algorithm", default)]
    algorithm: Option<Algorithm>,
    #[serde(flatten)]
    records: BTreeMap<String, Record>,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<String>,
    pub invalidated: Vec<String>,
    pub removed: Vec<String>,
}

impl Reconciliation {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.invalidated.is_empty() && self.removed.is_empty()
    }
}

/// All records of one directory plus the time it was last fully scanned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryCache {
    records: BTreeMap<String, Record>,
    /// Directory mtime (ns) recorded at the last save.
    last_scan_time: i64,
    /// Algorithm that produced the stored distances.
    algorithm: Option<Algorithm>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_for(directory: &Path) -> PathBuf {
        directory.join(CACHE_FILE)
    }

    /// Load the cache for `directory`. A missing, unreadable or corrupt file
    /// yields an empty cache.
    pub fn load(directory: &Path) -> Self {
        let path = Self::path_for(directory);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("no cache at {}: {}", path.display(), e);
                return Self::new();
            }
        };

        let stamp = file.metadata().and_then(|m| m.modified()).ok();
        let reader = BufReader::new(GzDecoder::new(BufReader::new(file)));
        match serde_json::from_reader::<_, CacheDocument>(reader) {
            Ok(doc) => {
                debug!("loaded {} record(s) from {}", doc.records.len(), path.display());
                let stamped = stamp.map_or(0, nanos_since_epoch);
                Self {
                    records: doc.records,
                    last_scan_time: doc.last_scan_time.max(stamped),
                    algorithm: doc.algorithm,
                }
            }
            Err(e) => {
                warn!("ignoring unreadable cache {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Persist atomically next to the images. Returns `Ok(false)` when the
    /// directory is not writable; the next run simply retries.
    pub fn save(&mut self, directory: &Path, directory_mtime: i64) -> Result<bool, CacheError> {
        let path = Self::path_for(directory);
        let previous = self.last_scan_time;
        self.last_scan_time = directory_mtime;

        let result = self.write_atomic(directory, &path);
        match result {
            Ok(()) => {
                debug!("saved {} record(s) to {}", self.records.len(), path.display());
                self.restamp(directory, &path);
                Ok(true)
            }
            Err(CacheError::Io { source, .. }) if source.kind() == io::ErrorKind::PermissionDenied => {
                debug!("cache not saved, {} is read-only", directory.display());
                self.last_scan_time = previous;
                Ok(false)
            }
            Err(e) => {
                self.last_scan_time = previous;
                Err(e)
            }
        }
    }

    fn write_atomic(&self, directory: &Path, path: &Path) -> Result<(), CacheError> {
        let tmp =
            tempfile::NamedTempFile::new_in(directory).map_err(CacheError::from_io(path))?;
        self.encode_into(tmp.as_file(), path)?;
        tmp.persist(path).map_err(|e| CacheError::from_io(path)(e.error))?;
        Ok(())
    }

    /// Renaming the cache into place bumps the directory mtime. The settled
    /// value goes into the cache file's own mtime, which [`Self::load`] reads
    /// back, so the write is not mistaken for an external change. Setting a
    /// file time touches only its inode, never the directory or the contents.
    fn restamp(&mut self, directory: &Path, path: &Path) {
        let Ok(settled) = modified_time(directory) else {
            return;
        };
        if settled <= self.last_scan_time || settled < 0 {
            return;
        }
        let stamped = File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(UNIX_EPOCH + Duration::from_nanos(settled as u64)));
        match stamped {
            Ok(()) => self.last_scan_time = settled,
            Err(e) => warn!("could not restamp {}: {}", path.display(), e),
        }
    }

    fn encode_into(&self, file: &File, path: &Path) -> Result<(), CacheError> {
        let doc = CacheDocumentRef {
            last_scan_time: self.last_scan_time,
            algorithm: self.algorithm,
            records: &self.records,
        };
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &doc)?;
        let mut inner = encoder.finish().map_err(CacheError::from_io(path))?;
        inner.flush().map_err(CacheError::from_io(path))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_scan_time(&self) -> i64 {
        self.last_scan_time
    }

    /// Algorithm the stored distances were computed with; `None` for a cache
    /// that never held any.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Switch to `algorithm`. Distances from a different one are dropped, so
    /// the next refresh compares every pair again. Returns how many records
    /// lost their distances.
    pub fn use_algorithm(&mut self, algorithm: Algorithm) -> usize {
        let previous = self.algorithm.replace(algorithm);
        match previous {
            Some(previous) if previous != algorithm => {
                let fields: FieldSet = [FieldKind::Similarity].into_iter().collect();
                let cleared = self.clear_fields(&fields);
                debug!("algorithm changed from {previous} to {algorithm}, {cleared} record(s) reset");
                cleared
            }
            _ => 0,
        }
    }

    pub fn get(&self, file: &str) -> Option<&Record> {
        self.records.get(file)
    }

    pub fn get_mut(&mut self, file: &str) -> Option<&mut Record> {
        self.records.get_mut(file)
    }

    pub fn insert(&mut self, file: &str, record: Record) {
        self.records.insert(file.to_string(), record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Record)> {
        self.records.iter_mut()
    }

    /// Bring records in line with the live file list. Runs to completion
    /// before any extraction is scheduled.
    ///
    /// * unknown files get a fresh record;
    /// * files whose mtime or size changed get a fresh record, and their old
    ///   distances are scrubbed from every other record;
    /// * records of files that no longer exist are deleted and scrubbed.
    pub fn reconcile(&mut self, files: &[FileStat]) -> Reconciliation {
        let mut outcome = Reconciliation::default();

        for stat in files {
            match self.records.get(&stat.name) {
                Some(record) if record.is_valid_for(stat.modified_time, stat.byte_size) => {}
                Some(_) => {
                    self.records.insert(
                        stat.name.clone(),
                        Record::fresh(stat.modified_time, stat.byte_size),
                    );
                    outcome.invalidated.push(stat.name.clone());
                }
                None => {
                    self.records.insert(
                        stat.name.clone(),
                        Record::fresh(stat.modified_time, stat.byte_size),
                    );
                    outcome.added.push(stat.name.clone());
                }
            }
        }

        let live: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
        outcome.removed = self
            .records
            .keys()
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();
        for name in &outcome.removed {
            self.records.remove(name);
        }

        for name in outcome.invalidated.iter().chain(outcome.removed.iter()) {
            self.scrub_neighbor(name);
        }

        if !outcome.is_unchanged() {
            debug!(
                "reconciled: {} added, {} invalidated, {} removed",
                outcome.added.len(),
                outcome.invalidated.len(),
                outcome.removed.len()
            );
        }
        outcome
    }

    /// Remove `file` from every record's neighbor map.
    pub fn scrub_neighbor(&mut self, file: &str) {
        for record in self.records.values_mut() {
            if let Some(neighbors) = record.neighbors.as_mut() {
                neighbors.remove(file);
            }
        }
    }

    /// Whether extraction and comparison must run again.
    pub fn needs_rescan<'a>(
        &self,
        directory_mtime: i64,
        files: impl IntoIterator<Item = &'a str>,
        clear_requested: bool,
    ) -> bool {
        if directory_mtime > self.last_scan_time || clear_requested {
            return true;
        }
        files
            .into_iter()
            .any(|file| self.records.get(file).is_none_or(|r| !r.has_similarity()))
    }

    /// Drop the named derived fields from every record. Returns how many
    /// values were removed.
    pub fn clear_fields(&mut self, fields: &FieldSet) -> usize {
        let mut cleared = 0;
        for record in self.records.values_mut() {
            for field in fields {
                if record.clear(*field) {
                    cleared += 1;
                }
            }
        }
        if !fields.is_empty() {
            debug!("cleared {:?}: {} value(s) removed", fields, cleared);
        }
        cleared
    }

    /// Forget every record.
    pub fn clear_all(&mut self) {
        self.records.clear();
        self.last_scan_time = 0;
    }
}

#[derive(Serialize)]
struct CacheDocumentRef<'a> {
    #[serde(rename = "@last_scan_time")]
    last_scan_time: i64,
    #[serde(rename = "@algorithm", skip_serializing_if = "Option::is_none")]
    algorithm: Option<Algorithm>,
    #[serde(flatten)]
    records: &'a BTreeMap<String, Record>,
}
