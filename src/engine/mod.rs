//! The similarity engine: one session per directory.
//!
//! A session owns its [`DirectoryCache`] exclusively and moves through
//! `NeedsScan -> Extracting -> Comparing -> Clustered`. Extraction and
//! comparison each run as one batch on the task runner; a failed batch
//! leaves nothing saved and the session back in `NeedsScan`.

pub mod cluster;
pub mod compare;
pub mod extract;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cache::{DescriptorStore, DirectoryCache, FieldKind, FieldSet, Reconciliation, Record};
use crate::config::{Config, ConfigError};
use crate::core::faces::{FaceBox, FaceDetector, NoFaceDetector, crop_faces};
use crate::core::scanner::{DirectoryListing, ScanError, ScannerService};
use crate::core::scoring::normalize_to_max;
use crate::core::similarity::{Algorithm, DEFAULT_TIME_WINDOW_SECS, SimilarityConfig};
use crate::tasks::{TaskError, TaskRunner, TaskTrace};

use compare::Comparison;
use extract::{ANALYSES, ExtractError, ExtractJob, Extractor};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("scan aborted, nothing was saved: {0}")]
    Batch(#[from] TaskError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("`{0}` is not an image in this directory")]
    UnknownFile(String),

    #[error("failed to export faces: {0}")]
    Export(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NeedsScan,
    Extracting,
    Comparing,
    Clustered,
}

/// Stage notifications for a front end. Calls arrive on the thread that
/// runs [`Session::refresh`] and must return quickly.
pub trait Progress {
    fn begin(&mut self, _stage: SessionState, _total: usize) {}

    fn advance(&mut self) {}

    fn finish(&mut self) {}
}

impl Progress for () {}

/// Derived fields to drop before the next refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearRequest {
    pub fields: FieldSet,
    /// Forget every record, not just some fields.
    pub everything: bool,
    /// Also empty the descriptor store.
    pub descriptor_store: bool,
}

impl ClearRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fields(fields: impl IntoIterator<Item = FieldKind>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn everything() -> Self {
        Self {
            everything: true,
            ..Self::default()
        }
    }

    /// Whether any cached record data is being discarded.
    pub fn is_requested(&self) -> bool {
        self.everything || !self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub rescanned: bool,
    pub cleared: usize,
    pub extracted: usize,
    pub descriptors_reused: usize,
    pub compared_pairs: usize,
    pub saved: bool,
}

#[derive(Clone)]
pub struct SessionOptions {
    pub algorithm: Algorithm,
    pub runner: TaskRunner,
    pub time_window_secs: i64,
    pub descriptor_store: Option<DescriptorStore>,
    pub face_detector: Arc<dyn FaceDetector>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            runner: TaskRunner::default(),
            time_window_secs: DEFAULT_TIME_WINDOW_SECS,
            descriptor_store: None,
            face_detector: Arc::new(NoFaceDetector),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            algorithm: config.algorithm,
            runner: config.runner()?,
            time_window_secs: config.time_window_secs,
            descriptor_store: config.descriptor_store(),
            face_detector: config.face_detector()?,
        })
    }

    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.face_detector = detector;
        self
    }
}

/// Quality scores for one file, scaled 0-100 against the best file in the
/// same view. `None` when the file has not been scored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rating {
    pub file: String,
    pub sharpness: Option<f64>,
    pub brightness: Option<f64>,
    pub contrast: Option<f64>,
    pub blurred: bool,
}

pub struct Session {
    directory: PathBuf,
    listing: DirectoryListing,
    files: Vec<String>,
    cache: DirectoryCache,
    similarity: SimilarityConfig,
    options: SessionOptions,
    state: SessionState,
    reconciliation: Reconciliation,
}

impl Session {
    /// List `directory`, load its cache and reconcile the two. No extraction
    /// happens until [`Session::refresh`].
    pub fn open(directory: impl AsRef<Path>, options: SessionOptions) -> Result<Self, EngineError> {
        let directory = directory.as_ref().to_path_buf();
        let listing = ScannerService::new().scan(&directory)?;
        let mut cache = DirectoryCache::load(&directory);
        let reconciliation = cache.reconcile(&listing.files);
        let files = listing.names();

        let previous = cache.algorithm();
        let reset = cache.use_algorithm(options.algorithm);
        if reset > 0 {
            log::info!(
                "{} was scanned with {}, recomputing distances with {}",
                directory.display(),
                previous.map_or("another algorithm", |a| a.name()),
                options.algorithm
            );
        }

        log::info!(
            "opened {}: {} image(s), {} cached record(s) reused",
            directory.display(),
            files.len(),
            files.len() - reconciliation.added.len() - reconciliation.invalidated.len()
        );

        Ok(Self {
            directory,
            files,
            listing,
            cache,
            similarity: SimilarityConfig::new(options.algorithm),
            options,
            state: SessionState::NeedsScan,
            reconciliation,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Image files in canonical order.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    pub fn record(&self, file: &str) -> Result<&Record, EngineError> {
        self.cache
            .get(file)
            .ok_or_else(|| EngineError::UnknownFile(file.to_string()))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn algorithm(&self) -> Algorithm {
        self.similarity.algorithm()
    }

    pub fn threshold(&self) -> f64 {
        self.similarity.threshold()
    }

    pub fn set_threshold(&mut self, value: f64) -> f64 {
        self.similarity.set_threshold(value);
        self.similarity.threshold()
    }

    /// What reconciliation changed when the session was opened.
    pub fn reconciliation(&self) -> &Reconciliation {
        &self.reconciliation
    }

    /// Apply `clear`, then extract, compare and cluster whatever is stale,
    /// and save the cache.
    pub fn refresh(
        &mut self,
        clear: &ClearRequest,
        progress: &mut dyn Progress,
    ) -> Result<RefreshSummary, EngineError> {
        let mut summary = RefreshSummary::default();

        if clear.everything {
            self.cache.clear_all();
            self.cache.reconcile(&self.listing.files);
        }
        summary.cleared = self.cache.clear_fields(&clear.fields);
        if clear.descriptor_store {
            if let Some(store) = &self.options.descriptor_store {
                let removed = store.clear();
                log::info!("removed {removed} stored descriptor(s)");
            }
        }

        let files = self.files.iter().map(String::as_str);
        if !self
            .cache
            .needs_rescan(self.listing.modified_time, files, clear.is_requested())
        {
            log::info!("{} is up to date", self.directory.display());
            self.state = SessionState::Clustered;
            return Ok(summary);
        }
        summary.rescanned = true;

        match self.rescan(&mut summary, progress) {
            Ok(()) => {
                self.state = SessionState::Clustered;
                summary.saved = self.save();
                Ok(summary)
            }
            Err(e) => {
                self.state = SessionState::NeedsScan;
                Err(e)
            }
        }
    }

    fn rescan(
        &mut self,
        summary: &mut RefreshSummary,
        progress: &mut dyn Progress,
    ) -> Result<(), EngineError> {
        self.state = SessionState::Extracting;
        self.extract(summary, progress)?;

        self.state = SessionState::Comparing;
        summary.compared_pairs = self.compare(progress)?;

        cluster::finalize(&mut self.cache);
        log::info!(
            "{}: {} file(s) extracted, {} pair(s) compared",
            self.directory.display(),
            summary.extracted,
            summary.compared_pairs
        );
        Ok(())
    }

    fn extract(
        &mut self,
        summary: &mut RefreshSummary,
        progress: &mut dyn Progress,
    ) -> Result<(), EngineError> {
        let window = self.options.time_window_secs;
        let wanted = compare::files_needing_descriptors(&self.cache, &self.files, window);
        let jobs: Vec<ExtractJob> = self
            .files
            .iter()
            .filter_map(|name| {
                let record = self.cache.get(name)?;
                ExtractJob::plan(name, record, wanted.contains(name))
            })
            .collect();
        if jobs.is_empty() {
            log::debug!("nothing to extract");
            return Ok(());
        }

        let runner = self.options.runner;
        let analysis_pool = runner.build_pool(ANALYSES, "analyze")?;
        let extractor = Extractor {
            directory: &self.directory,
            algorithm: self.similarity.algorithm(),
            runner,
            analysis_pool: &analysis_pool,
            store: self.options.descriptor_store.as_ref(),
            detector: self.options.face_detector.as_ref(),
        };

        progress.begin(SessionState::Extracting, jobs.len());
        let results = extract::extract_all(&extractor, &jobs, |_| progress.advance());
        progress.finish();
        let results = results?;

        summary.extracted = results.len();
        for (name, extracted) in results {
            if extracted.descriptor_reused {
                summary.descriptors_reused += 1;
            }
            if let Some(record) = self.cache.get_mut(&name) {
                extracted.apply(record);
            }
        }
        Ok(())
    }

    fn compare(&mut self, progress: &mut dyn Progress) -> Result<usize, EngineError> {
        let comparison = Comparison::new(
            &self.cache,
            &self.files,
            self.similarity.algorithm(),
            self.options.time_window_secs,
        );
        let pending = comparison.pending();

        let mut compared = 0;
        if !pending.is_empty() {
            let work = |i: &usize, trace: &TaskTrace| comparison.compare_from(*i, trace);
            let mut results = std::collections::HashMap::with_capacity(pending.len());

            progress.begin(SessionState::Comparing, pending.len());
            let outcome = self
                .options
                .runner
                .each("compare", &work, &pending)
                .on_each_done(|_| progress.advance())
                .run(Some(&mut results));
            progress.finish();
            outcome?;
            compared = results.values().sum();
        }

        let lists = comparison.into_neighbors();
        for (name, neighbors) in self.files.iter().zip(lists) {
            if let Some(record) = self.cache.get_mut(name) {
                record.neighbors = Some(neighbors);
            }
        }
        Ok(compared)
    }

    /// Persist the cache. Failures are logged and otherwise ignored; the
    /// next run recomputes.
    pub fn save(&mut self) -> bool {
        match self.cache.save(&self.directory, self.listing.modified_time) {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("cache for {} not saved: {}", self.directory.display(), e);
                false
            }
        }
    }

    /// The cluster of `file` under the current threshold, excluding `file`.
    pub fn get_similar(&self, file: &str) -> Result<BTreeSet<String>, EngineError> {
        self.record(file)?;
        Ok(cluster::get_similar(&self.cache, file, self.threshold()))
    }

    /// One representative file per cluster, in canonical order.
    pub fn groups(&self) -> Vec<String> {
        cluster::groups(&self.cache, &self.files, self.threshold())
    }

    pub fn tighten(&mut self) -> f64 {
        let threshold = self.similarity.tighten();
        log::debug!("threshold tightened to {threshold}");
        threshold
    }

    pub fn loosen(&mut self) -> f64 {
        let threshold = self.similarity.loosen();
        log::debug!("threshold loosened to {threshold}");
        threshold
    }

    /// Scores for `files` (every file when empty), normalised per metric
    /// against the maximum among them.
    pub fn ratings(&self, files: &[String]) -> Result<Vec<Rating>, EngineError> {
        let view = if files.is_empty() { &self.files[..] } else { files };
        let records = view
            .iter()
            .map(|f| self.record(f).map(|r| (f.clone(), r)))
            .collect::<Result<Vec<_>, _>>()?;

        let scale = |pick: fn(&Record) -> Option<f64>| {
            let present: Vec<(usize, f64)> = records
                .iter()
                .enumerate()
                .filter_map(|(i, (_, r))| pick(r).map(|v| (i, v)))
                .collect();
            let mut column = vec![None; records.len()];
            for (i, v) in normalize_to_max(&present) {
                column[i] = Some(v);
            }
            column
        };
        let sharpness = scale(|r| r.sharpness);
        let brightness = scale(|r| r.brightness);
        let contrast = scale(|r| r.contrast);

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, (file, record))| Rating {
                file,
                sharpness: sharpness[i],
                brightness: brightness[i],
                contrast: contrast[i],
                blurred: record.blurred,
            })
            .collect())
    }

    /// Flip the blurred mark of `file` and return the new state. Persisted by
    /// the next [`Session::save`].
    pub fn toggle_blurred(&mut self, file: &str) -> Result<bool, EngineError> {
        let record = self
            .cache
            .get_mut(file)
            .ok_or_else(|| EngineError::UnknownFile(file.to_string()))?;
        record.blurred = !record.blurred;
        log::debug!("{file} marked {}", if record.blurred { "blurred" } else { "sharp" });
        Ok(record.blurred)
    }

    /// Face boxes found in `file`; empty until it has been extracted.
    pub fn faces(&self, file: &str) -> Result<&[FaceBox], EngineError> {
        Ok(self.record(file)?.faces.as_deref().unwrap_or(&[]))
    }

    /// Write each face of `file` as its own image into `out_dir`.
    pub fn export_faces(&self, file: &str, out_dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
        let record = self.record(file)?;
        let faces = record.faces.as_deref().unwrap_or(&[]);
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let orientation = record.capture.as_ref().map_or(1, |c| c.orientation);
        let path = self.directory.join(file);
        let image = extract::decode(&path, orientation)?;

        let stem = Path::new(file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file.to_string());
        let extension = Path::new(file)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "png".to_string());
        crop_faces(&image, faces, out_dir, &stem, &extension).map_err(EngineError::Export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, shade: u8) {
        let img: RgbImage =
            ImageBuffer::from_fn(24, 24, |x, y| Rgb([shade, (x * 10) as u8, (y * 10) as u8]));
        img.save(dir.join(name)).unwrap();
    }

    fn options() -> SessionOptions {
        SessionOptions {
            runner: TaskRunner::new(2).unwrap(),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(matches!(
            Session::open(&missing, options()),
            Err(EngineError::Scan(ScanError::InvalidPath { .. }))
        ));
    }

    #[test]
    fn test_empty_directory_refreshes_without_batches() {
        let temp_dir = TempDir::new().unwrap();
        let mut session = Session::open(temp_dir.path(), options()).unwrap();
        let summary = session.refresh(&ClearRequest::none(), &mut ()).unwrap();
        assert_eq!(summary.extracted, 0);
        assert_eq!(summary.compared_pairs, 0);
        assert_eq!(session.state(), SessionState::Clustered);
        assert!(session.groups().is_empty());
    }

    #[test]
    fn test_unknown_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        write_png(temp_dir.path(), "a.png", 10);
        let session = Session::open(temp_dir.path(), options()).unwrap();
        assert!(matches!(
            session.get_similar("b.png"),
            Err(EngineError::UnknownFile(_))
        ));
        assert!(session.faces("b.png").is_err());
    }

    #[test]
    fn test_ratings_scale_to_best_file() {
        let temp_dir = TempDir::new().unwrap();
        write_png(temp_dir.path(), "a.png", 10);
        write_png(temp_dir.path(), "b.png", 200);
        let mut session = Session::open(temp_dir.path(), options()).unwrap();

        let before = session.ratings(&[]).unwrap();
        assert!(before.iter().all(|r| r.sharpness.is_none()));

        session.refresh(&ClearRequest::none(), &mut ()).unwrap();
        let ratings = session.ratings(&[]).unwrap();
        assert_eq!(ratings.len(), 2);
        let best = ratings
            .iter()
            .map(|r| r.brightness.unwrap())
            .fold(f64::MIN, f64::max);
        assert!((best - 100.0).abs() < 1e-9);
        assert!(ratings[0].brightness.unwrap() < ratings[1].brightness.unwrap());
    }

    #[test]
    fn test_progress_sees_both_stages() {
        #[derive(Default)]
        struct Recorder {
            stages: Vec<(SessionState, usize)>,
            ticks: usize,
        }
        impl Progress for Recorder {
            fn begin(&mut self, stage: SessionState, total: usize) {
                self.stages.push((stage, total));
            }
            fn advance(&mut self) {
                self.ticks += 1;
            }
        }

        let temp_dir = TempDir::new().unwrap();
        for (name, shade) in [("a.png", 1), ("b.png", 2), ("c.png", 3)] {
            write_png(temp_dir.path(), name, shade);
        }
        let mut session = Session::open(temp_dir.path(), options()).unwrap();
        let mut recorder = Recorder::default();
        session.refresh(&ClearRequest::none(), &mut recorder).unwrap();

        assert_eq!(
            recorder.stages,
            vec![(SessionState::Extracting, 3), (SessionState::Comparing, 2)]
        );
        assert_eq!(recorder.ticks, 5);
    }

    #[test]
    fn test_detected_faces_are_exported() {
        struct CenterDetector;
        impl FaceDetector for CenterDetector {
            fn name(&self) -> &str {
                "center"
            }
            fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<FaceBox>> {
                Ok(vec![FaceBox::new(6, 6, 18, 18)])
            }
        }

        let temp_dir = TempDir::new().unwrap();
        write_png(temp_dir.path(), "portrait.png", 40);
        let options = options().with_face_detector(Arc::new(CenterDetector));
        let mut session = Session::open(temp_dir.path(), options).unwrap();
        session.refresh(&ClearRequest::none(), &mut ()).unwrap();

        assert_eq!(session.faces("portrait.png").unwrap(), &[FaceBox::new(6, 6, 18, 18)]);
        let out_dir = temp_dir.path().join("faces");
        let written = session.export_faces("portrait.png", &out_dir).unwrap();
        assert_eq!(written, vec![out_dir.join("portrait-0000.png")]);
        let crop = image::open(&written[0]).unwrap();
        assert_eq!((crop.width(), crop.height()), (12, 12));
    }

    #[test]
    fn test_failed_batch_still_finishes_progress() {
        #[derive(Default)]
        struct Recorder {
            begun: usize,
            finished: usize,
        }
        impl Progress for Recorder {
            fn begin(&mut self, _stage: SessionState, _total: usize) {
                self.begun += 1;
            }
            fn finish(&mut self) {
                self.finished += 1;
            }
        }

        let temp_dir = TempDir::new().unwrap();
        write_png(temp_dir.path(), "a.png", 1);
        std::fs::write(temp_dir.path().join("b.png"), b"not a png").unwrap();
        let mut session = Session::open(temp_dir.path(), options()).unwrap();
        let mut recorder = Recorder::default();

        assert!(session.refresh(&ClearRequest::none(), &mut recorder).is_err());
        assert_eq!(recorder.begun, 1);
        assert_eq!(recorder.finished, 1);
    }

    #[test]
    fn test_toggle_blurred_shows_in_ratings() {
        let temp_dir = TempDir::new().unwrap();
        write_png(temp_dir.path(), "a.png", 10);
        write_png(temp_dir.path(), "b.png", 20);
        let mut session = Session::open(temp_dir.path(), options()).unwrap();

        assert!(session.toggle_blurred("b.png").unwrap());
        let ratings = session.ratings(&[]).unwrap();
        assert!(!ratings[0].blurred);
        assert!(ratings[1].blurred);

        assert!(!session.toggle_blurred("b.png").unwrap());
        assert!(matches!(
            session.toggle_blurred("c.png"),
            Err(EngineError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_threshold_adjustments_are_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let mut session = Session::open(temp_dir.path(), options()).unwrap();
        let max = session.algorithm().max();
        for _ in 0..100 {
            session.loosen();
        }
        assert_eq!(session.threshold(), max);
        assert_eq!(session.set_threshold(-3.0), 0.0);
        assert_eq!(session.tighten(), 0.0);
    }
}
