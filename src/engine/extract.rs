//! Per-file feature extraction.
//!
//! One task per stale file. Inside a task the independent analyses of the
//! decoded image run as a second batch on a shared analysis pool. Tasks only
//! return values; the collector writes them into the owning record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use image::{DynamicImage, GrayImage};
use rayon::ThreadPool;
use thiserror::Error;

use crate::cache::{DescriptorStore, Record};
use crate::core::exif::{CaptureInfo, ExifService, apply_orientation, capture_time};
use crate::core::faces::{FaceBox, FaceDetector, normalize_boxes};
use crate::core::hash::HashService;
use crate::core::scoring::{QualityScore, ScoringService};
use crate::core::similarity::{Algorithm, Descriptor};
use crate::tasks::{TaskError, TaskRunner, TaskTrace};

/// Analyses that can run concurrently on one decoded image.
pub const ANALYSES: usize = 3;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Open `path` and rotate it upright.
pub fn decode(path: &Path, orientation: u16) -> Result<DynamicImage, ExtractError> {
    let image = image::open(path).map_err(|source| ExtractError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(apply_orientation(image, orientation))
}

/// The outstanding work for one file, planned from its record.
#[derive(Debug, Clone)]
pub struct ExtractJob {
    pub name: String,
    pub modified_time: i64,
    pub byte_size: u64,
    /// Capture metadata and content hash already on record, if complete.
    pub known_capture: Option<(CaptureInfo, String)>,
    pub scores: bool,
    pub faces: bool,
    pub descriptor: bool,
}

impl ExtractJob {
    /// `None` when the record already holds everything that is asked for.
    pub fn plan(name: &str, record: &Record, wants_descriptor: bool) -> Option<Self> {
        let known_capture = match (&record.capture, &record.content_hash, record.capture_time) {
            (Some(capture), Some(hash), Some(_)) => Some((capture.clone(), hash.clone())),
            _ => None,
        };
        let job = Self {
            name: name.to_string(),
            modified_time: record.modified_time,
            byte_size: record.byte_size,
            known_capture,
            scores: record.needs_scores(),
            faces: record.faces.is_none(),
            descriptor: wants_descriptor && record.descriptor.is_none(),
        };
        let idle = job.known_capture.is_some() && !job.scores && !job.faces && !job.descriptor;
        (!idle).then_some(job)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFields {
    pub info: CaptureInfo,
    pub content_hash: String,
    pub capture_time: Option<i64>,
}

/// Values produced for one file. Absent fields were not requested.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub capture: Option<CaptureFields>,
    pub scores: Option<QualityScore>,
    pub faces: Option<Vec<FaceBox>>,
    pub descriptor: Option<Descriptor>,
    /// The descriptor came from the descriptor store.
    pub descriptor_reused: bool,
}

impl Extracted {
    pub fn apply(self, record: &mut Record) {
        if let Some(capture) = self.capture {
            record.capture = Some(capture.info);
            record.content_hash = Some(capture.content_hash);
            record.capture_time = capture.capture_time;
        }
        if let Some(scores) = self.scores {
            record.set_quality(scores);
        }
        if let Some(faces) = self.faces {
            record.faces = Some(faces);
        }
        if let Some(descriptor) = self.descriptor {
            record.descriptor = Some(descriptor);
        }
    }
}

enum Analysis {
    Scores(QualityScore),
    Faces(Vec<FaceBox>),
    Descriptor(Descriptor),
}

struct Decoded {
    image: DynamicImage,
    gray: GrayImage,
}

type AnalysisFn<'a> = &'a (dyn Fn(&Decoded, &TaskTrace) -> anyhow::Result<Analysis> + Sync);

pub struct Extractor<'a> {
    pub directory: &'a Path,
    pub algorithm: Algorithm,
    pub runner: TaskRunner,
    pub analysis_pool: &'a ThreadPool,
    pub store: Option<&'a DescriptorStore>,
    pub detector: &'a dyn FaceDetector,
}

impl Extractor<'_> {
    pub fn extract(&self, job: &ExtractJob, trace: &TaskTrace) -> anyhow::Result<Extracted> {
        let path = self.directory.join(&job.name);
        let mut out = Extracted::default();

        let (info, content_hash) = match &job.known_capture {
            Some((info, hash)) => (info.clone(), hash.clone()),
            None => {
                let info = ExifService::new().extract(&path);
                let hash = HashService::new().compute_content_hash(
                    job.modified_time,
                    job.byte_size,
                    &info,
                );
                out.capture = Some(CaptureFields {
                    info: info.clone(),
                    content_hash: hash.clone(),
                    capture_time: capture_time(&info, &path),
                });
                (info, hash)
            }
        };

        if job.descriptor {
            if let Some(descriptor) = self.store.and_then(|s| s.get(&content_hash, self.algorithm)) {
                trace.debug("descriptor store hit");
                out.descriptor = Some(descriptor);
                out.descriptor_reused = true;
            }
        }

        let compute_descriptor = job.descriptor && out.descriptor.is_none();
        if !(job.scores || job.faces || compute_descriptor) {
            return Ok(out);
        }

        let image = trace.timed("decode", || decode(&path, info.orientation))?;
        let gray = image.to_luma8();
        let decoded = Decoded { image, gray };

        let scores = |d: &Decoded, _: &TaskTrace| -> anyhow::Result<Analysis> {
            Ok(Analysis::Scores(ScoringService::new().score(&d.gray)))
        };
        let faces = |d: &Decoded, trace: &TaskTrace| -> anyhow::Result<Analysis> {
            let rgb = d.image.to_rgb8();
            let found = trace.timed(self.detector.name(), || self.detector.detect(&rgb))?;
            Ok(Analysis::Faces(normalize_boxes(found, rgb.width(), rgb.height())))
        };
        let descriptor = |d: &Decoded, trace: &TaskTrace| -> anyhow::Result<Analysis> {
            let descriptor = trace.timed(self.algorithm.name(), || {
                self.algorithm.extract(&d.image, &d.gray)
            })?;
            Ok(Analysis::Descriptor(descriptor))
        };

        let mut funcs: Vec<(&'static str, AnalysisFn<'_>)> = Vec::with_capacity(ANALYSES);
        if job.scores {
            funcs.push(("scores", &scores));
        }
        if job.faces {
            funcs.push(("faces", &faces));
        }
        if compute_descriptor {
            funcs.push(("descriptor", &descriptor));
        }

        let mut results = HashMap::new();
        self.runner
            .all(&format!("analyze {}", job.name), funcs, &decoded)
            .shared_pool(self.analysis_pool)
            .run(Some(&mut results))?;

        for analysis in results.into_values() {
            match analysis {
                Analysis::Scores(scores) => out.scores = Some(scores),
                Analysis::Faces(faces) => out.faces = Some(faces),
                Analysis::Descriptor(descriptor) => {
                    if let Some(store) = self.store {
                        store.put(&content_hash, self.algorithm, &descriptor);
                    }
                    out.descriptor = Some(descriptor);
                }
            }
        }
        Ok(out)
    }
}

/// Run `jobs` as one batch and return what each file produced, keyed by
/// file name. `on_done` fires on the collecting thread after every file.
pub fn extract_all(
    extractor: &Extractor<'_>,
    jobs: &[ExtractJob],
    on_done: impl FnMut(&String),
) -> Result<HashMap<String, Extracted>, TaskError> {
    let by_name: HashMap<&str, &ExtractJob> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();
    let names: Vec<String> = jobs.iter().map(|j| j.name.clone()).collect();

    let work = |name: &String, trace: &TaskTrace| -> anyhow::Result<Extracted> {
        let job = by_name
            .get(name.as_str())
            .ok_or_else(|| anyhow!("no extraction planned for {name}"))?;
        extractor.extract(job, trace)
    };

    let mut results = HashMap::with_capacity(names.len());
    extractor
        .runner
        .each("extract", &work, &names)
        .on_each_done(on_done)
        .run(Some(&mut results))?;
    Ok(results)
}
