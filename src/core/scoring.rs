use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Raw, unnormalised quality measurements for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
}

pub struct ScoringService;

impl ScoringService {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, gray: &GrayImage) -> QualityScore {
        QualityScore {
            sharpness: self.laplacian_variance(gray),
            brightness: self.brightness(gray),
            contrast: self.contrast(gray),
        }
    }

    /// Variance of the Laplacian response. Blurry images have few edges and
    /// therefore a low variance.
    pub fn laplacian_variance(&self, image: &GrayImage) -> f64 {
        let (width, height) = image.dimensions();
        if width < 3 || height < 3 {
            return 0.0;
        }

        // Laplacian kernel
        let kernel = [[0, -1, 0], [-1, 4, -1], [0, -1, 0]];

        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        for y in 1..(height - 1) {
            for x in 1..(width - 1) {
                let mut laplacian = 0.0;
                for (ky, row) in kernel.iter().enumerate() {
                    for (kx, weight) in row.iter().enumerate() {
                        let pixel = image.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1)[0];
                        laplacian += pixel as f64 * *weight as f64;
                    }
                }
                sum += laplacian;
                sum_sq += laplacian * laplacian;
                count += 1;
            }
        }

        let mean = sum / count as f64;
        (sum_sq / count as f64 - mean * mean).max(0.0)
    }

    /// Root mean square of luma.
    pub fn brightness(&self, image: &GrayImage) -> f64 {
        let (count, _, sum_sq) = moments(image);
        if count == 0 {
            return 0.0;
        }
        (sum_sq / count as f64).sqrt()
    }

    /// Standard deviation of luma.
    pub fn contrast(&self, image: &GrayImage) -> f64 {
        let (count, sum, sum_sq) = moments(image);
        if count == 0 {
            return 0.0;
        }
        let mean = sum / count as f64;
        (sum_sq / count as f64 - mean * mean).max(0.0).sqrt()
    }
}

impl Default for ScoringService {
    fn default() -> Self {
        Self::new()
    }
}

fn moments(image: &GrayImage) -> (usize, f64, f64) {
    image.pixels().fold((0, 0.0, 0.0), |(n, s, sq), p| {
        let v = p[0] as f64;
        (n + 1, s + v, sq + v * v)
    })
}

/// Scale `values` to 0-100 relative to the largest one. A zero maximum maps
/// everything to zero.
pub fn normalize_to_max<K: Clone>(values: &[(K, f64)]) -> Vec<(K, f64)> {
    let max = values.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max);
    values
        .iter()
        .map(|(k, v)| {
            let scaled = if max > 0.0 { v / max * 100.0 } else { 0.0 };
            (k.clone(), scaled)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn flat(value: u8) -> GrayImage {
        ImageBuffer::from_pixel(16, 16, Luma([value]))
    }

    fn checkerboard() -> GrayImage {
        ImageBuffer::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 { Luma([255]) } else { Luma([0]) }
        })
    }

    #[test]
    fn test_flat_image_has_no_sharpness_or_contrast() {
        let score = ScoringService::new().score(&flat(128));
        assert_eq!(score.sharpness, 0.0);
        assert_eq!(score.contrast, 0.0);
        assert!((score.brightness - 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_edges_are_sharper_than_flat() {
        let scoring = ScoringService::new();
        let sharp = scoring.score(&checkerboard());
        let dull = scoring.score(&flat(128));
        assert!(sharp.sharpness > dull.sharpness);
        assert!(sharp.contrast > 100.0);
    }

    #[test]
    fn test_brightness_is_rms() {
        let img: GrayImage = ImageBuffer::from_fn(2, 1, |x, _| Luma([if x == 0 { 0 } else { 200 }]));
        let b = ScoringService::new().brightness(&img);
        assert!((b - (200.0f64 * 200.0 / 2.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_image_sharpness_is_zero() {
        let img: GrayImage = ImageBuffer::from_pixel(2, 2, Luma([9]));
        assert_eq!(ScoringService::new().laplacian_variance(&img), 0.0);
    }

    #[test]
    fn test_normalize_to_max() {
        let scaled = normalize_to_max(&[("a", 5.0), ("b", 10.0), ("c", 0.0)]);
        assert_eq!(scaled, vec![("a", 50.0), ("b", 100.0), ("c", 0.0)]);

        let zeros = normalize_to_max(&[("a", 0.0)]);
        assert_eq!(zeros, vec![("a", 0.0)]);
        assert!(normalize_to_max::<&str>(&[]).is_empty());
    }
}
