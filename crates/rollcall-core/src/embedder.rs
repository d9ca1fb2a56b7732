//! Face embedding provider interfaces.
//!
//! The detection and encoding math lives behind [`FaceEmbedder`]; everything
//! downstream only needs [`FaceMetric`] to compare embeddings. [`ColorEmbedder`]
//! is a deterministic stand-in that derives embeddings from pixel colour.

use crate::types::{BoundingBox, Detection, Embedding};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Distance between embeddings, as defined by whoever produced them.
pub trait FaceMetric {
    /// Non-negative distance; 0 means identical.
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }

    /// Two embeddings match when their distance is at most `tolerance`.
    fn matches(&self, a: &Embedding, b: &Embedding, tolerance: f32) -> bool {
        self.distance(a, b) <= tolerance
    }
}

/// Finds faces in an image and encodes each one.
pub trait FaceEmbedder: FaceMetric + Send {
    /// Detections ordered by detector confidence, highest first.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, EmbedderError>;
}

/// Plain Euclidean metric, matching the provider default.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMetric;

impl FaceMetric for EuclideanMetric {}

/// Fixture provider: every non-black vertical band of the image is a face
/// whose embedding is the band's mean RGB scaled to [0, 1].
///
/// Lets registry and pipeline tests run on tiny solid-colour images
/// without model files.
#[derive(Debug, Clone, Copy)]
pub struct ColorEmbedder {
    bands: u32,
}

impl ColorEmbedder {
    /// One face per image.
    pub fn new() -> Self {
        Self { bands: 1 }
    }

    /// Split each image into `bands` equal-width faces.
    pub fn with_bands(bands: u32) -> Self {
        Self { bands: bands.max(1) }
    }
}

impl Default for ColorEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceMetric for ColorEmbedder {}

impl FaceEmbedder for ColorEmbedder {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, EmbedderError> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let band_width = width / self.bands;
        if band_width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let mut detections = Vec::new();
        for band in 0..self.bands {
            let x0 = band * band_width;
            let mut sum = [0u64; 3];
            for y in 0..height {
                for x in x0..x0 + band_width {
                    let p = rgb.get_pixel(x, y);
                    for c in 0..3 {
                        sum[c] += p[c] as u64;
                    }
                }
            }
            if sum.iter().all(|&s| s == 0) {
                continue;
            }

            let count = (band_width * height) as f32;
            let values = sum.iter().map(|&s| s as f32 / count / 255.0).collect();
            detections.push(Detection {
                bbox: BoundingBox {
                    x: x0 as f32,
                    y: 0.0,
                    width: band_width as f32,
                    height: height as f32,
                    confidence: 1.0,
                    landmarks: None,
                },
                embedding: Embedding {
                    values,
                    model_version: Some("color-fixture".into()),
                },
            });
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn test_matches_boundary_is_inclusive() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.6, 0.0]);
        let d = EuclideanMetric.distance(&a, &b);
        assert!(EuclideanMetric.matches(&a, &b, d));
        assert!(!EuclideanMetric.matches(&a, &b, d - 1e-4));
        assert!(EuclideanMetric.matches(&a, &b, d + 1e-4));
    }

    #[test]
    fn test_matches_agrees_with_distance() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        for t in [0.0f32, 0.1, 0.25, 0.5, 1.0] {
            for shift in [0.0f32, 0.05, 0.2, 0.7] {
                let b = Embedding::new(vec![0.1 + shift, 0.2, 0.3]);
                let d = EuclideanMetric.distance(&a, &b);
                assert_eq!(EuclideanMetric.matches(&a, &b, t), d <= t, "t={t} d={d}");
            }
        }
    }

    #[test]
    fn test_color_embedder_black_image_has_no_face() {
        let faces = ColorEmbedder::new().detect(&solid(4, 4, [0, 0, 0])).unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_color_embedder_mean_color() {
        let faces = ColorEmbedder::new().detect(&solid(4, 4, [255, 0, 51])).unwrap();
        assert_eq!(faces.len(), 1);
        let v = &faces[0].embedding.values;
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!(v[1].abs() < 1e-6);
        assert!((v[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_color_embedder_bands_skip_black() {
        let mut img = RgbImage::from_pixel(6, 2, Rgb([0, 0, 0]));
        for y in 0..2 {
            for x in 4..6 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let faces = ColorEmbedder::with_bands(3)
            .detect(&DynamicImage::ImageRgb8(img))
            .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.x, 4.0);
    }
}
