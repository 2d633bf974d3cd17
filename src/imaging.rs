use image::{
    DynamicImage, GrayImage, ImageFormat, codecs::jpeg::JpegEncoder, imageops::FilterType,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("unreadable image: {0}")]
    Decode(String),
    #[error("image encoding failed: {0}")]
    Encode(String),
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    image::load_from_memory(bytes).map_err(|err| ImagingError::Decode(err.to_string()))
}

pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImagingError> {
    let rgb = img.to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .map_err(|err| ImagingError::Encode(err.to_string()))?;
    Ok(buffer)
}

/// Shrink so that neither side exceeds `max_side`, keeping the aspect ratio.
/// Smaller images are returned untouched.
pub fn fit_within(img: DynamicImage, max_side: u32) -> DynamicImage {
    if img.width() <= max_side && img.height() <= max_side {
        return img;
    }
    img.resize(max_side, max_side, FilterType::Lanczos3)
}

pub fn thumbnail_jpeg(bytes: &[u8], max_side: u32, quality: u8) -> Result<Vec<u8>, ImagingError> {
    let img = fit_within(decode(bytes)?, max_side);
    encode_jpeg(&img, quality)
}

/// Variance of the 3x3 Laplacian `[0,1,0; 1,-4,1; 0,1,0]` over the interior
/// pixels. Low values mean a blurry image.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width(), gray.height());
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray.get_pixel(x, y).0[0] as f64;
            let top = gray.get_pixel(x, y - 1).0[0] as f64;
            let bottom = gray.get_pixel(x, y + 1).0[0] as f64;
            let left = gray.get_pixel(x - 1, y).0[0] as f64;
            let right = gray.get_pixel(x + 1, y).0[0] as f64;

            let laplacian = top + bottom + left + right - 4.0 * center;
            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    /// Deterministic high-detail test image: a one-pixel checkerboard with a
    /// colour ramp, which stays sharp under the Laplacian.
    pub(crate) fn detailed_rgb(width: u32, height: u32, seed: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let on = (x + y) % 2 == 0;
            let base = if on { 40u8 } else { 210u8 };
            Rgb([
                base.wrapping_add(seed),
                ((x * 255) / width.max(1)) as u8,
                ((y * 255) / height.max(1)) as u8,
            ])
        })
    }

    pub(crate) fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut cursor, format)
            .expect("encode test image");
        cursor.into_inner()
    }

    #[test]
    fn flat_image_has_zero_laplacian_variance() {
        let flat = GrayImage::from_pixel(16, 16, Luma([128]));
        assert_eq!(laplacian_variance(&flat), 0.0);
    }

    #[test]
    fn checkerboard_is_sharp() {
        let board = GrayImage::from_fn(16, 16, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert!(laplacian_variance(&board) > 100.0);
    }

    #[test]
    fn fit_within_keeps_aspect_and_never_upscales() {
        let wide = DynamicImage::ImageRgb8(RgbImage::new(400, 200));
        let shrunk = fit_within(wide, 100);
        assert_eq!((shrunk.width(), shrunk.height()), (100, 50));

        let small = DynamicImage::ImageRgb8(RgbImage::new(40, 20));
        let same = fit_within(small, 100);
        assert_eq!((same.width(), same.height()), (40, 20));
    }

    #[test]
    fn jpeg_roundtrip_decodes() {
        let bytes = encode(&detailed_rgb(32, 32, 0), ImageFormat::Png);
        let jpeg = thumbnail_jpeg(&bytes, 16, 85).expect("thumbnail");
        assert_eq!(sniff_format(&jpeg), Some(ImageFormat::Jpeg));
        let decoded = decode(&jpeg).expect("decode");
        assert_eq!(decoded.width(), 16);
    }
}
