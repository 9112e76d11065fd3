//! Glue between `image` buffers and OpenCV matrices.

use image::{GrayImage, RgbImage};
use opencv::core::{self, Mat, Vec3b};
use opencv::imgproc;
use opencv::prelude::*;

/// Single-channel 8-bit matrix holding a copy of `gray`.
pub fn gray_mat(gray: &GrayImage) -> opencv::Result<Mat> {
    Mat::from_slice_rows_cols(gray.as_raw(), gray.height() as usize, gray.width() as usize)
}

/// Three-channel BGR matrix holding a copy of `rgb`.
pub fn bgr_mat(rgb: &RgbImage) -> opencv::Result<Mat> {
    let pixels: Vec<Vec3b> = rgb
        .pixels()
        .map(|p| Vec3b::from([p[2], p[1], p[0]]))
        .collect();
    Mat::from_slice_rows_cols(&pixels, rgb.height() as usize, rgb.width() as usize)
}

/// Shrink `img` to fit inside `width` x `height`. Returns the matrix to use
/// and the factor that maps its coordinates back onto the input.
pub fn fit_within(img: Mat, width: i32, height: i32) -> opencv::Result<(Mat, f64)> {
    let (ow, oh) = (img.cols() as f64, img.rows() as f64);
    let scale = (height as f64 / oh).min(width as f64 / ow);
    if scale >= 1.0 {
        return Ok((img, 1.0));
    }
    let mut output = Mat::default();
    imgproc::resize(
        &img,
        &mut output,
        core::Size::default(),
        scale,
        scale,
        imgproc::InterpolationFlags::INTER_AREA as i32,
    )?;
    Ok((output, 1.0 / scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    #[test]
    fn test_gray_mat_shape() {
        let gray: GrayImage = ImageBuffer::from_fn(30, 20, |x, _| Luma([x as u8]));
        let mat = gray_mat(&gray).unwrap();
        assert_eq!((mat.cols(), mat.rows(), mat.channels()), (30, 20, 1));
        assert_eq!(*mat.at_2d::<u8>(0, 7).unwrap(), 7);
    }

    #[test]
    fn test_bgr_mat_swaps_channels() {
        let rgb: RgbImage = ImageBuffer::from_pixel(4, 3, Rgb([1, 2, 3]));
        let mat = bgr_mat(&rgb).unwrap();
        assert_eq!((mat.cols(), mat.rows(), mat.channels()), (4, 3, 3));
        assert_eq!(*mat.at_2d::<Vec3b>(2, 3).unwrap(), Vec3b::from([3, 2, 1]));
    }

    #[test]
    fn test_fit_within_only_shrinks() {
        let gray: GrayImage = ImageBuffer::from_pixel(400, 200, Luma([9]));
        let (small, back) = fit_within(gray_mat(&gray).unwrap(), 100, 100).unwrap();
        assert_eq!((small.cols(), small.rows()), (100, 50));
        assert_eq!(back, 4.0);

        let (same, back) = fit_within(gray_mat(&gray).unwrap(), 1000, 1000).unwrap();
        assert_eq!(same.cols(), 400);
        assert_eq!(back, 1.0);
    }
}
