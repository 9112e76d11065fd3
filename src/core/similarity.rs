//! Similarity algorithms and the adjustable duplicate filter.
//!
//! Exactly one [`Algorithm`] is active per session. Each variant owns its
//! extractor, comparator and filter constants; callers never branch on the
//! variant themselves.

use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, GrayImage};
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::keypoints::{BinaryDescriptor, match_score};

/// Seconds between capture times beyond which two shots are never compared.
pub const DEFAULT_TIME_WINDOW_SECS: i64 = 2 * 60;

const HISTOGRAM_BINS: usize = 256;

#[derive(Debug, Error)]
pub enum SimilarityError {
    #[error("unknown similarity algorithm `{0}` (expected phash, histogram or keypoints)")]
    UnknownAlgorithm(String),

    #[error("cannot compare a {left} descriptor with a {right} descriptor")]
    Mismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("`{0}` needs a build with the `opencv` feature")]
    Unavailable(Algorithm),

    #[cfg(feature = "opencv")]
    #[error("vision backend failed: {0}")]
    Vision(#[from] opencv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// DCT perceptual hash compared by Hamming distance.
    #[cfg_attr(not(feature = "opencv"), default)]
    PHash,
    /// Normalised grey-level histogram compared by chi-square distance.
    Histogram,
    /// ORB descriptors compared by 2-NN ratio test.
    #[cfg_attr(feature = "opencv", default)]
    Keypoints,
}

/// Opaque comparator input produced by an [`Algorithm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Descriptor {
    Hash(Vec<u8>),
    Histogram(Vec<f32>),
    Keypoints(Vec<BinaryDescriptor>),
}

impl Descriptor {
    fn kind(&self) -> &'static str {
        match self {
            Descriptor::Hash(_) => "hash",
            Descriptor::Histogram(_) => "histogram",
            Descriptor::Keypoints(_) => "keypoints",
        }
    }
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::PHash, Algorithm::Histogram, Algorithm::Keypoints];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::PHash => "phash",
            Algorithm::Histogram => "histogram",
            Algorithm::Keypoints => "keypoints",
        }
    }

    pub fn default_threshold(&self) -> f64 {
        match self {
            Algorithm::PHash => 20.0,
            Algorithm::Histogram => 1.0,
            Algorithm::Keypoints => 96.0,
        }
    }

    pub fn step(&self) -> f64 {
        match self {
            Algorithm::PHash => 1.0,
            Algorithm::Histogram => 0.1,
            Algorithm::Keypoints => 1.0,
        }
    }

    pub fn max(&self) -> f64 {
        match self {
            Algorithm::PHash => 25.0,
            Algorithm::Histogram => 1.2,
            Algorithm::Keypoints => 99.0,
        }
    }

    /// Whether this build can extract descriptors for the algorithm.
    pub fn is_available(&self) -> bool {
        match self {
            Algorithm::PHash | Algorithm::Histogram => true,
            Algorithm::Keypoints => cfg!(feature = "opencv"),
        }
    }

    pub fn extract(&self, image: &DynamicImage, gray: &GrayImage) -> Result<Descriptor, SimilarityError> {
        match self {
            Algorithm::PHash => {
                let hasher = HasherConfig::new()
                    .hash_size(8, 8)
                    .hash_alg(HashAlg::Mean)
                    .preproc_dct()
                    .to_hasher();
                Ok(Descriptor::Hash(hasher.hash_image(image).as_bytes().to_vec()))
            }
            Algorithm::Histogram => Ok(Descriptor::Histogram(normalized_histogram(gray))),
            Algorithm::Keypoints => keypoints(gray),
        }
    }

    /// Dissimilarity of two descriptors; lower means more alike.
    pub fn compare(&self, a: &Descriptor, b: &Descriptor) -> Result<f64, SimilarityError> {
        match (self, a, b) {
            (Algorithm::PHash, Descriptor::Hash(x), Descriptor::Hash(y)) => Ok(x
                .iter()
                .zip(y.iter())
                .map(|(p, q)| (p ^ q).count_ones())
                .sum::<u32>() as f64),
            (Algorithm::Histogram, Descriptor::Histogram(x), Descriptor::Histogram(y)) => {
                Ok(chi_square(x, y))
            }
            (Algorithm::Keypoints, Descriptor::Keypoints(x), Descriptor::Keypoints(y)) => {
                Ok(match_score(x, y))
            }
            _ => Err(SimilarityError::Mismatch {
                left: a.kind(),
                right: b.kind(),
            }),
        }
    }
}

#[cfg(feature = "opencv")]
fn keypoints(gray: &GrayImage) -> Result<Descriptor, SimilarityError> {
    Ok(Descriptor::Keypoints(crate::core::keypoints::orb_descriptors(gray)?))
}

#[cfg(not(feature = "opencv"))]
fn keypoints(_gray: &GrayImage) -> Result<Descriptor, SimilarityError> {
    Err(SimilarityError::Unavailable(Algorithm::Keypoints))
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = SimilarityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SimilarityError::UnknownAlgorithm(s.to_string()))
    }
}

/// L2-normalised 256-bin luma histogram.
pub fn normalized_histogram(gray: &GrayImage) -> Vec<f32> {
    let mut hist = vec![0f32; HISTOGRAM_BINS];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1.0;
    }
    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        hist.iter_mut().for_each(|v| *v /= norm);
    }
    hist
}

/// Chi-square distance, `sum((a - b)^2 / a)` over bins where `a` is non-zero.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .filter(|(x, _)| x.abs() > f32::EPSILON)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d / x as f64
        })
        .sum()
}

/// Active algorithm plus the runtime-adjustable duplicate cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityConfig {
    algorithm: Algorithm,
    filter_threshold: f64,
}

impl SimilarityConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            filter_threshold: algorithm.default_threshold(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn threshold(&self) -> f64 {
        self.filter_threshold
    }

    pub fn set_threshold(&mut self, value: f64) {
        self.filter_threshold = value.clamp(0.0, self.algorithm.max());
    }

    /// Lower the cutoff by one step: fewer pairs count as similar.
    pub fn tighten(&mut self) -> f64 {
        self.set_threshold(round_step(self.filter_threshold - self.algorithm.step()));
        self.filter_threshold
    }

    /// Raise the cutoff by one step: more pairs count as similar.
    pub fn loosen(&mut self) -> f64 {
        self.set_threshold(round_step(self.filter_threshold + self.algorithm.step()));
        self.filter_threshold
    }

    pub fn is_similar(&self, distance: f64) -> bool {
        distance < self.filter_threshold
    }
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self::new(Algorithm::default())
    }
}

// Keeps repeated 0.1 steps from drifting off the grid.
fn round_step(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn gradient(offset: u8) -> GrayImage {
        ImageBuffer::from_fn(64, 64, |x, _| Luma([(x as u8 * 3).wrapping_add(offset)]))
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("PHASH".parse::<Algorithm>().unwrap(), Algorithm::PHash);
        assert_eq!("keypoints".parse::<Algorithm>().unwrap(), Algorithm::Keypoints);
        assert!("sift".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_threshold_clamped_to_range() {
        let mut config = SimilarityConfig::new(Algorithm::PHash);
        assert_eq!(config.threshold(), 20.0);
        for _ in 0..10 {
            config.loosen();
        }
        assert_eq!(config.threshold(), 25.0);
        for _ in 0..40 {
            config.tighten();
        }
        assert_eq!(config.threshold(), 0.0);
    }

    #[test]
    fn test_histogram_steps_stay_on_grid() {
        let mut config = SimilarityConfig::new(Algorithm::Histogram);
        config.loosen();
        assert_eq!(config.threshold(), 1.1);
        config.loosen();
        config.loosen();
        assert_eq!(config.threshold(), 1.2);
        config.tighten();
        config.tighten();
        assert_eq!(config.threshold(), 1.0);
    }

    #[test]
    fn test_is_similar_is_strict() {
        let config = SimilarityConfig::new(Algorithm::PHash);
        assert!(config.is_similar(19.0));
        assert!(!config.is_similar(20.0));
    }

    #[test]
    fn test_phash_identical_images_have_zero_distance() {
        let gray = gradient(0);
        let image = DynamicImage::ImageLuma8(gray.clone());
        let a = Algorithm::PHash.extract(&image, &gray).unwrap();
        let b = Algorithm::PHash.extract(&image, &gray).unwrap();
        assert_eq!(Algorithm::PHash.compare(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_histogram_distance() {
        let same = normalized_histogram(&gradient(0));
        assert_eq!(chi_square(&same, &same), 0.0);

        let flat: GrayImage = ImageBuffer::from_pixel(64, 64, Luma([10]));
        let other = normalized_histogram(&flat);
        assert!(chi_square(&same, &other) > 0.0);

        let norm: f32 = same.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_compare_rejects_mismatched_descriptors() {
        let err = Algorithm::PHash
            .compare(&Descriptor::Hash(vec![0]), &Descriptor::Histogram(vec![0.0]))
            .unwrap_err();
        assert!(matches!(err, SimilarityError::Mismatch { left: "hash", right: "histogram" }));
    }

    #[test]
    fn test_keypoints_follow_the_vision_feature() {
        let gray = gradient(0);
        let image = DynamicImage::ImageLuma8(gray.clone());
        let result = Algorithm::Keypoints.extract(&image, &gray);
        if Algorithm::Keypoints.is_available() {
            assert!(matches!(result, Ok(Descriptor::Keypoints(_))));
        } else {
            assert!(matches!(result, Err(SimilarityError::Unavailable(Algorithm::Keypoints))));
        }
        assert!(Algorithm::default().is_available());
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let descriptor = Descriptor::Keypoints(vec![[7u8; 32]]);
        let json = serde_json::to_string(&descriptor).unwrap();
        assert_eq!(serde_json::from_str::<Descriptor>(&json).unwrap(), descriptor);
    }
}
