//! ORB local features, matched by Hamming 2-NN with a ratio test.
//!
//! Extraction goes through OpenCV and is only available with the `opencv`
//! feature. Matching works on the raw 256-bit descriptors and needs nothing
//! beyond this module.

pub const DESCRIPTOR_BYTES: usize = 32;
pub type BinaryDescriptor = [u8; DESCRIPTOR_BYTES];

/// Lowe ratio: the best match must be clearly better than the runner-up.
pub const RATIO: f32 = 0.7;

#[cfg(feature = "opencv")]
pub use orb::{ORB_FEATURES, orb_descriptors};

#[cfg(feature = "opencv")]
mod orb {
    use image::GrayImage;
    use opencv::core::{KeyPoint, Mat, Vector};
    use opencv::features2d::{ORB, ORB_ScoreType};
    use opencv::prelude::*;

    use super::{BinaryDescriptor, DESCRIPTOR_BYTES};
    use crate::core::vision::{fit_within, gray_mat};

    pub const ORB_FEATURES: i32 = 10_000;

    /// Detect ORB keypoints in `gray` and return their descriptors. Large
    /// images are shrunk to 1920x1080 first.
    pub fn orb_descriptors(gray: &GrayImage) -> opencv::Result<Vec<BinaryDescriptor>> {
        let (image, _) = fit_within(gray_mat(gray)?, 1920, 1080)?;
        let mut orb = ORB::create(
            ORB_FEATURES,
            1.2,
            8,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;

        let mask = Mat::default();
        let mut kps = Vector::<KeyPoint>::new();
        let mut des = Mat::default();
        orb.detect_and_compute(&image, &mask, &mut kps, &mut des, false)?;
        if des.rows() == 0 {
            return Ok(Vec::new());
        }

        Ok(des
            .data_bytes()?
            .chunks_exact(DESCRIPTOR_BYTES)
            .filter_map(|row| row.try_into().ok())
            .collect())
    }
}

#[inline(always)]
pub fn hamming(va: &BinaryDescriptor, vb: &BinaryDescriptor) -> u32 {
    va.chunks_exact(8)
        .zip(vb.chunks_exact(8))
        .map(|(a, b)| {
            let a = u64::from_le_bytes(a.try_into().unwrap_or_default());
            let b = u64::from_le_bytes(b.try_into().unwrap_or_default());
            (a ^ b).count_ones()
        })
        .sum()
}

/// Distances to the two nearest descriptors in `train`, closest first.
pub fn knn2(query: &BinaryDescriptor, train: &[BinaryDescriptor]) -> Option<(u32, u32)> {
    if train.len() < 2 {
        return None;
    }
    let (mut best, mut second) = (u32::MAX, u32::MAX);
    for candidate in train {
        let d = hamming(query, candidate);
        if d < best {
            second = best;
            best = d;
        } else if d < second {
            second = d;
        }
    }
    Some((best, second))
}

/// Dissimilarity on a 0-100 scale: 100 minus the percentage of query
/// descriptors with a good match. Images without features are treated as
/// entirely dissimilar.
pub fn match_score(des1: &[BinaryDescriptor], des2: &[BinaryDescriptor]) -> f64 {
    if des1.is_empty() || des2.is_empty() {
        return 100.0;
    }
    let good = des1
        .iter()
        .filter_map(|d| knn2(d, des2))
        .filter(|&(m, n)| (m as f32) < RATIO * n as f32)
        .count();
    100.0 - good as f64 / des1.len() as f64 * 100.0
}
