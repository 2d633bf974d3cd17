//! 64-bit DCT perceptual hash.
//!
//! The image is reduced to a 32x32 grayscale square, transformed with a 2-D
//! DCT-II, and the top-left 8x8 block of low frequencies is compared with its
//! median. Bit 63 is the first coefficient, row-major.

use image::{DynamicImage, imageops::FilterType};
use once_cell::sync::Lazy;
use std::fmt;

pub const HASH_BITS: usize = 64;
const SIDE: usize = 32;
const LOW: usize = 8;

static COSINES: Lazy<[[f64; SIDE]; SIDE]> = Lazy::new(|| {
    let mut table = [[0.0; SIDE]; SIDE];
    for (k, row) in table.iter_mut().enumerate() {
        for (n, cell) in row.iter_mut().enumerate() {
            *cell = (std::f64::consts::PI * k as f64 * (2 * n + 1) as f64 / (2 * SIDE) as f64).cos();
        }
    }
    table
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(u64);

impl PerceptualHash {
    pub fn from_image(img: &DynamicImage) -> Self {
        let gray = img
            .grayscale()
            .resize_exact(SIDE as u32, SIDE as u32, FilterType::Lanczos3)
            .to_luma8();

        let mut pixels = [[0.0f64; SIDE]; SIDE];
        for (y, row) in pixels.iter_mut().enumerate() {
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = gray.get_pixel(x as u32, y as u32).0[0] as f64;
            }
        }

        // Separable DCT: columns first, then rows. Only the low block is kept.
        let mut columns = [[0.0f64; SIDE]; LOW];
        for (k, out_row) in columns.iter_mut().enumerate() {
            for (x, out) in out_row.iter_mut().enumerate() {
                *out = (0..SIDE).map(|y| pixels[y][x] * COSINES[k][y]).sum();
            }
        }
        let mut low = [0.0f64; LOW * LOW];
        for r in 0..LOW {
            for c in 0..LOW {
                low[r * LOW + c] = (0..SIDE).map(|x| columns[r][x] * COSINES[c][x]).sum();
            }
        }

        let median = median(&low);
        let bits = low
            .iter()
            .fold(0u64, |acc, value| (acc << 1) | u64::from(*value > median));
        Self(bits)
    }

    pub fn from_hex(raw: &str) -> Option<Self> {
        u64::from_str_radix(raw.trim(), 16).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn hamming(&self, other: &Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// 1.0 for identical hashes, 0.0 when every bit differs.
    pub fn similarity(&self, other: &Self) -> f64 {
        1.0 - self.hamming(other) as f64 / HASH_BITS as f64
    }

    /// One 0.0/1.0 coordinate per bit, most significant first. Squared
    /// Euclidean distance between two such vectors is their Hamming distance.
    pub fn to_vector(&self) -> Vec<f32> {
        (0..HASH_BITS)
            .rev()
            .map(|bit| ((self.0 >> bit) & 1) as f32)
            .collect()
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::imaging::tests::detailed_rgb;
    use image::{Rgb, RgbImage};

    /// Smooth image built from fixed low-frequency cosine terms, so its
    /// hash does not depend on quantisation noise.
    pub(crate) fn cosine_pattern(width: u32, height: u32, invert: bool) -> DynamicImage {
        let mut terms = Vec::new();
        for k in 0..8u32 {
            for l in 0..8u32 {
                let magnitude = 2.0 + ((k * 5 + l * 3) % 4) as f64;
                let sign = if (k + l) % 2 == 0 { 1.0 } else { -1.0 };
                let sign = if invert { -sign } else { sign };
                terms.push((k as f64, l as f64, magnitude * sign));
            }
        }
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            let u = (2 * x + 1) as f64 / (2 * width) as f64;
            let v = (2 * y + 1) as f64 / (2 * height) as f64;
            let value: f64 = terms
                .iter()
                .map(|(k, l, a)| {
                    a * (std::f64::consts::PI * l * u).cos() * (std::f64::consts::PI * k * v).cos()
                })
                .sum();
            let level = (128.0 + value).clamp(0.0, 255.0) as u8;
            Rgb([level, level, level])
        }))
    }

    #[test]
    fn identical_images_hash_identically() {
        let a = PerceptualHash::from_image(&cosine_pattern(64, 64, false));
        let b = PerceptualHash::from_image(&cosine_pattern(64, 64, false));
        assert_eq!(a, b);
        assert_eq!(a.hamming(&b), 0);
        assert_eq!(a.similarity(&b), 1.0);
    }

    #[test]
    fn rescaled_image_stays_close() {
        let a = PerceptualHash::from_image(&cosine_pattern(256, 256, false));
        let b = PerceptualHash::from_image(&cosine_pattern(128, 128, false));
        assert!(a.hamming(&b) <= 6, "distance {}", a.hamming(&b));
    }

    #[test]
    fn inverted_pattern_is_far() {
        let a = PerceptualHash::from_image(&cosine_pattern(64, 64, false));
        let b = PerceptualHash::from_image(&cosine_pattern(64, 64, true));
        assert!(a.hamming(&b) > 10);
    }

    #[test]
    fn hex_and_vector_agree() {
        let hash = PerceptualHash::from_image(&DynamicImage::ImageRgb8(detailed_rgb(40, 40, 3)));
        assert_eq!(PerceptualHash::from_hex(&hash.to_hex()), Some(hash));
        let vector = hash.to_vector();
        assert_eq!(vector.len(), HASH_BITS);
        let ones = vector.iter().filter(|v| **v == 1.0).count() as u32;
        assert_eq!(ones, hash.0.count_ones());
    }

    #[test]
    fn vector_distance_matches_hamming() {
        let a = PerceptualHash(0b1011);
        let b = PerceptualHash(0b0001);
        let squared: f32 = a
            .to_vector()
            .iter()
            .zip(b.to_vector())
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        assert_eq!(squared as u32, a.hamming(&b));
    }
}
