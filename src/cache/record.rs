use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::exif::CaptureInfo;
use crate::core::faces::FaceBox;
use crate::core::scoring::QualityScore;
use crate::core::similarity::Descriptor;

/// Derived field groups that can be cleared independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Sharpness,
    Brightness,
    Contrast,
    Exif,
    Faces,
    Similarity,
}

impl FieldKind {
    pub const ALL: [FieldKind; 6] = [
        FieldKind::Sharpness,
        FieldKind::Brightness,
        FieldKind::Contrast,
        FieldKind::Exif,
        FieldKind::Faces,
        FieldKind::Similarity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Sharpness => "sharpness",
            FieldKind::Brightness => "brightness",
            FieldKind::Contrast => "contrast",
            FieldKind::Exif => "exif",
            FieldKind::Faces => "faces",
            FieldKind::Similarity => "similarity",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown field `{0}` (expected sharpness, brightness, contrast, exif, faces or similarity)")]
pub struct UnknownField(pub String);

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldKind {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

pub type FieldSet = BTreeSet<FieldKind>;

/// Per-file neighbor distances. Kept sorted closest-first once a comparison
/// pass has finished; persisted as an array of `[file, distance]` pairs so
/// that order survives a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Neighbors(Vec<(String, f64)>);

impl Neighbors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, file: &str) -> Option<f64> {
        self.0.iter().find(|(f, _)| f == file).map(|(_, d)| *d)
    }

    pub fn contains(&self, file: &str) -> bool {
        self.get(file).is_some()
    }

    /// Insert or overwrite the distance to `file`.
    pub fn insert(&mut self, file: &str, distance: f64) {
        match self.0.iter_mut().find(|(f, _)| f == file) {
            Some(entry) => entry.1 = distance,
            None => self.0.push((file.to_string(), distance)),
        }
    }

    pub fn remove(&mut self, file: &str) -> Option<f64> {
        let index = self.0.iter().position(|(f, _)| f == file)?;
        Some(self.0.remove(index).1)
    }

    /// Order by ascending distance, ties by file name.
    pub fn sort_ascending(&mut self) {
        self.0
            .sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(f, d)| (f.as_str(), *d))
    }

    /// Neighbors strictly closer than `threshold`. Relies on ascending order.
    pub fn within(&self, threshold: f64) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .take_while(move |(_, d)| *d < threshold)
            .map(|(f, _)| f.as_str())
    }
}

/// Cached metadata and derived scores for one image file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Nanoseconds since the Unix epoch.
    pub modified_time: i64,
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureInfo>,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<FaceBox>>,
    #[serde(skip)]
    pub descriptor: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<Neighbors>,
    /// Marked by the user as blurred. Not derived, so no clear touches it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blurred: bool,
}

impl Record {
    /// A record that knows only the file's identity; every derived field is
    /// empty.
    pub fn fresh(modified_time: i64, byte_size: u64) -> Self {
        Self {
            modified_time,
            byte_size,
            ..Default::default()
        }
    }

    pub fn is_valid_for(&self, modified_time: i64, byte_size: u64) -> bool {
        self.modified_time == modified_time && self.byte_size == byte_size
    }

    pub fn has_similarity(&self) -> bool {
        self.neighbors.is_some()
    }

    pub fn quality(&self) -> Option<QualityScore> {
        Some(QualityScore {
            sharpness: self.sharpness?,
            brightness: self.brightness?,
            contrast: self.contrast?,
        })
    }

    pub fn set_quality(&mut self, score: QualityScore) {
        self.sharpness = Some(score.sharpness);
        self.brightness = Some(score.brightness);
        self.contrast = Some(score.contrast);
    }

    pub fn needs_scores(&self) -> bool {
        self.quality().is_none()
    }

    pub fn needs_capture(&self) -> bool {
        self.capture.is_none() || self.content_hash.is_none() || self.capture_time.is_none()
    }

    /// Drop one group of derived fields. Returns whether anything was there.
    pub fn clear(&mut self, field: FieldKind) -> bool {
        match field {
            FieldKind::Sharpness => self.sharpness.take().is_some(),
            FieldKind::Brightness => self.brightness.take().is_some(),
            FieldKind::Contrast => self.contrast.take().is_some(),
            FieldKind::Exif => {
                let had = self.capture.is_some();
                self.capture = None;
                self.capture_time = None;
                had
            }
            FieldKind::Faces => self.faces.take().is_some(),
            FieldKind::Similarity => {
                let had = self.neighbors.is_some();
                self.neighbors = None;
                self.descriptor = None;
                had
            }
        }
    }
}
