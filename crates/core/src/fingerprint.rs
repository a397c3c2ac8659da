//! Equality-style fingerprints used for duplicate suppression.
//!
//! Images get a DCT perceptual hash so that re-scans and re-encodes of the same
//! page collide. Text gets a SHA-256 digest over a case and whitespace
//! insensitive form.

use crate::embeddings::normalize_whitespace;
use crate::error::IngestError;
use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const HASH_SIDE: usize = 8;
const SAMPLE_SIDE: usize = HASH_SIDE * 4;

/// Perceptual hash of the image stored at `path`, as 16 lowercase hex digits.
pub fn image_fingerprint(path: &Path) -> Result<String, IngestError> {
    let image = image::open(path)
        .map_err(|error| IngestError::UnreadableImage(format!("{}: {error}", path.display())))?;
    Ok(perceptual_hash(&image))
}

/// Runs [`image_fingerprint`] on the blocking pool.
pub async fn image_fingerprint_blocking(path: PathBuf) -> Result<String, IngestError> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || image_fingerprint(&path))
        .await
        .map_err(|error| IngestError::UnreadableImage(format!("{display}: {error}")))?
}

pub fn perceptual_hash(image: &DynamicImage) -> String {
    let gray = image.to_luma8();
    let sampled = image::imageops::resize(
        &gray,
        SAMPLE_SIDE as u32,
        SAMPLE_SIDE as u32,
        FilterType::Lanczos3,
    );

    let pixels: Vec<f64> = sampled.pixels().map(|pixel| f64::from(pixel.0[0])).collect();
    let coefficients = low_frequency_dct(&pixels);

    let mut sorted = coefficients.clone();
    sorted.sort_by(|left, right| left.total_cmp(right));
    let middle = sorted.len() / 2;
    let median = (sorted[middle - 1] + sorted[middle]) / 2.0;

    let bits = coefficients
        .iter()
        .fold(0u64, |acc, value| (acc << 1) | u64::from(*value > median));

    format!("{bits:016x}")
}

/// Top-left `HASH_SIDE` x `HASH_SIDE` block of the 2-D DCT-II of a square image, row major.
fn low_frequency_dct(pixels: &[f64]) -> Vec<f64> {
    let n = SAMPLE_SIDE;
    let basis: Vec<f64> = (0..HASH_SIDE)
        .flat_map(|k| {
            (0..n).map(move |x| {
                (std::f64::consts::PI * k as f64 * (2 * x + 1) as f64 / (2 * n) as f64).cos()
            })
        })
        .collect();

    // Transform rows first, keeping only the low frequencies.
    let mut rows = vec![0f64; n * HASH_SIDE];
    for y in 0..n {
        for k in 0..HASH_SIDE {
            rows[y * HASH_SIDE + k] = (0..n)
                .map(|x| pixels[y * n + x] * basis[k * n + x])
                .sum();
        }
    }

    let mut out = vec![0f64; HASH_SIDE * HASH_SIDE];
    for k in 0..HASH_SIDE {
        for column in 0..HASH_SIDE {
            out[k * HASH_SIDE + column] = (0..n)
                .map(|y| rows[y * HASH_SIDE + column] * basis[k * n + y])
                .sum();
        }
    }

    out
}

/// Case and whitespace insensitive form hashed by [`text_fingerprint`].
pub fn normalize_for_fingerprint(text: &str) -> String {
    normalize_whitespace(&text.trim().to_lowercase())
}

pub fn text_fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_for_fingerprint(text).as_bytes());
    format!("{:x}", hasher.finalize())
}
