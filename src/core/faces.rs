//! Face boxes and the detector seam.
//!
//! Detection belongs to an external vision backend: with the `opencv`
//! feature that is [`YuNetDetector`]. The core only invokes a
//! [`FaceDetector`], stores the boxes it returns, and can crop them back out
//! of the source image.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView, RgbImage};
use serde::{Deserialize, Serialize};

/// Pixel rectangle of one detected face, in the upright image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl FaceBox {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: right.max(left),
            bottom: bottom.max(top),
        }
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    /// Clip to an image of the given size; `None` if nothing is left.
    pub fn clamp(&self, width: u32, height: u32) -> Option<FaceBox> {
        let clipped = FaceBox::new(
            self.left.min(width),
            self.top.min(height),
            self.right.min(width),
            self.bottom.min(height),
        );
        (clipped.width() > 0 && clipped.height() > 0).then_some(clipped)
    }
}

/// Finds faces in an upright RGB image.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<FaceBox>>;
}

/// Detector used when no vision backend is configured. Reports no faces.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn name(&self) -> &str {
        "none"
    }

    fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<FaceBox>> {
        Ok(Vec::new())
    }
}

/// Order boxes top-to-bottom then left-to-right and drop degenerate ones so
/// the stored list does not depend on detector output order.
pub fn normalize_boxes(mut faces: Vec<FaceBox>, width: u32, height: u32) -> Vec<FaceBox> {
    faces = faces.iter().filter_map(|f| f.clamp(width, height)).collect();
    faces.sort_by_key(|f| (f.top, f.left, f.bottom, f.right));
    faces.dedup();
    faces
}

/// Write each face of `image` as its own file into `out_dir`, named
/// `{stem}-{index:04}.{extension}`. Returns the written paths.
pub fn crop_faces(
    image: &DynamicImage,
    faces: &[FaceBox],
    out_dir: &Path,
    stem: &str,
    extension: &str,
) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)?;
    let (width, height) = image.dimensions();

    let mut written = Vec::new();
    for (i, face) in faces.iter().enumerate() {
        let Some(face) = face.clamp(width, height) else {
            continue;
        };
        let crop = image.crop_imm(face.left, face.top, face.width(), face.height());
        let path = out_dir.join(format!("{stem}-{i:04}.{extension}"));
        crop.save(&path)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(feature = "opencv")]
pub use yunet::YuNetDetector;

#[cfg(feature = "opencv")]
mod yunet {
    use std::path::{Path, PathBuf};

    use anyhow::{Context, bail};
    use image::RgbImage;
    use opencv::core::{Mat, Ptr, Size};
    use opencv::dnn::{DNN_BACKEND_DEFAULT, DNN_TARGET_CPU};
    use opencv::objdetect::FaceDetectorYN;
    use opencv::prelude::*;

    use super::{FaceBox, FaceDetector};
    use crate::core::vision::{bgr_mat, fit_within};

    const SCORE_THRESHOLD: f32 = 0.5;
    const NMS_THRESHOLD: f32 = 0.3;
    const TOP_K: i32 = 5000;
    /// Frames are shrunk to fit this box before inference.
    const MAX_INPUT: i32 = 960;

    /// OpenCV's `FaceDetectorYN` over a YuNet ONNX model.
    ///
    /// The network is built per image, sized to that image, so one detector
    /// can serve every worker.
    #[derive(Debug, Clone)]
    pub struct YuNetDetector {
        model: PathBuf,
    }

    impl YuNetDetector {
        /// Fails when `model` is missing or OpenCV cannot load it.
        pub fn new(model: impl Into<PathBuf>) -> anyhow::Result<Self> {
            let detector = Self { model: model.into() };
            if !detector.model.is_file() {
                bail!("face model {} not found", detector.model.display());
            }
            detector.create(Size::new(320, 320))?;
            log::debug!("YuNet face model loaded from {}", detector.model.display());
            Ok(detector)
        }

        pub fn model(&self) -> &Path {
            &self.model
        }

        fn create(&self, input_size: Size) -> anyhow::Result<Ptr<FaceDetectorYN>> {
            let model = self
                .model
                .to_str()
                .context("face model path is not valid UTF-8")?;
            FaceDetectorYN::create(
                model,
                "",
                input_size,
                SCORE_THRESHOLD,
                NMS_THRESHOLD,
                TOP_K,
                DNN_BACKEND_DEFAULT,
                DNN_TARGET_CPU,
            )
            .with_context(|| format!("cannot load face model {}", self.model.display()))
        }
    }

    impl FaceDetector for YuNetDetector {
        fn name(&self) -> &str {
            "yunet"
        }

        fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<FaceBox>> {
            let (frame, back) = fit_within(bgr_mat(image)?, MAX_INPUT, MAX_INPUT)?;
            let mut detector = self.create(Size::new(frame.cols(), frame.rows()))?;
            let mut faces = Mat::default();
            detector.detect(&frame, &mut faces)?;

            // Rows are [x, y, w, h, five landmarks, score].
            let mut boxes = Vec::with_capacity(faces.rows().max(0) as usize);
            for i in 0..faces.rows() {
                let at = |col| {
                    faces
                        .at_2d::<f32>(i, col)
                        .map(|v| (*v as f64 * back).max(0.0))
                };
                let (x, y, w, h) = (at(0)?, at(1)?, at(2)?, at(3)?);
                boxes.push(FaceBox::new(
                    x.round() as u32,
                    y.round() as u32,
                    (x + w).round() as u32,
                    (y + h).round() as u32,
                ));
            }
            Ok(boxes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_orders_corners() {
        let face = FaceBox::new(10, 20, 5, 8);
        assert_eq!(face, FaceBox { left: 5, top: 8, right: 10, bottom: 20 });
        assert_eq!(face.width(), 5);
        assert_eq!(face.height(), 12);
    }

    #[test]
    fn test_clamp_drops_out_of_bounds() {
        assert_eq!(FaceBox::new(90, 90, 120, 130).clamp(100, 100), Some(FaceBox::new(90, 90, 100, 100)));
        assert_eq!(FaceBox::new(100, 0, 120, 10).clamp(100, 100), None);
    }

    #[test]
    fn test_normalize_boxes_sorts_and_dedups() {
        let faces = vec![
            FaceBox::new(50, 10, 60, 20),
            FaceBox::new(0, 10, 10, 20),
            FaceBox::new(0, 10, 10, 20),
            FaceBox::new(500, 500, 600, 600),
        ];
        let normalized = normalize_boxes(faces, 100, 100);
        assert_eq!(normalized, vec![FaceBox::new(0, 10, 10, 20), FaceBox::new(50, 10, 60, 20)]);
    }

    #[test]
    fn test_no_face_detector() {
        let img = RgbImage::new(8, 8);
        assert!(NoFaceDetector.detect(&img).unwrap().is_empty());
    }

    #[test]
    fn test_crop_faces_writes_files() {
        let temp_dir = TempDir::new().unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 30));
        let faces = vec![FaceBox::new(0, 0, 10, 10), FaceBox::new(20, 5, 35, 25)];

        let written = crop_faces(&img, &faces, temp_dir.path(), "abc", "png").unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[1].ends_with("abc-0001.png"));

        let second = image::open(&written[1]).unwrap();
        assert_eq!(second.dimensions(), (15, 20));
    }

    #[cfg(feature = "opencv")]
    #[test]
    fn test_yunet_rejects_missing_model() {
        let temp_dir = TempDir::new().unwrap();
        let err = YuNetDetector::new(temp_dir.path().join("none.onnx")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(feature = "opencv")]
    #[test]
    fn test_yunet_rejects_garbage_model() {
        let temp_dir = TempDir::new().unwrap();
        let model = temp_dir.path().join("broken.onnx");
        std::fs::write(&model, b"not a network").unwrap();
        assert!(YuNetDetector::new(&model).is_err());
    }
}
