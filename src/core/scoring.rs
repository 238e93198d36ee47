use image::{DynamicImage, GrayImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::core::faces::FaceDetector;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
}

/// Assigns a quality score to an image. Only the ordering of scores produced
/// by one policy is meaningful.
pub trait ScoringPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score_image(&self, image: &DynamicImage) -> f64;

    fn score_path(&self, path: &Path) -> Result<f64, ScoringError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(self.score_image(&image))
    }
}

/// Named scoring policies selectable from the command line or config.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMethod {
    /// Sharpness, resolution and face presence combined
    #[default]
    Advanced,
    /// Sharpness only (variance of the Laplacian)
    Laplacian,
}

impl ScoringMethod {
    pub fn build(
        self,
        weights: AdvancedWeights,
        face_detector: Option<Arc<dyn FaceDetector>>,
    ) -> Box<dyn ScoringPolicy> {
        match self {
            ScoringMethod::Advanced => Box::new(AdvancedPolicy::new(weights, face_detector)),
            ScoringMethod::Laplacian => Box::new(LaplacianPolicy),
        }
    }
}

impl fmt::Display for ScoringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringMethod::Advanced => write!(f, "advanced"),
            ScoringMethod::Laplacian => write!(f, "laplacian"),
        }
    }
}

/// Variance of the 4-neighbour Laplacian response over interior pixels.
///
/// Images narrower or shorter than three pixels have no interior and score 0.
pub fn laplacian_variance(image: &GrayImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0u64;

    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let center = image.get_pixel(x, y)[0] as f64;
            let laplacian = 4.0 * center
                - image.get_pixel(x - 1, y)[0] as f64
                - image.get_pixel(x + 1, y)[0] as f64
                - image.get_pixel(x, y - 1)[0] as f64
                - image.get_pixel(x, y + 1)[0] as f64;

            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0)
}

/// Sharpness only.
pub struct LaplacianPolicy;

impl ScoringPolicy for LaplacianPolicy {
    fn name(&self) -> &'static str {
        "laplacian"
    }

    fn score_image(&self, image: &DynamicImage) -> f64 {
        laplacian_variance(&image.to_luma8())
    }
}

/// Weights of the advanced composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedWeights {
    #[serde(rename = "sharpness_weight")]
    pub sharpness: f64,
    #[serde(rename = "resolution_weight")]
    pub resolution: f64,
    #[serde(rename = "face_weight")]
    pub face: f64,
}

impl Default for AdvancedWeights {
    fn default() -> Self {
        Self {
            sharpness: 1.0,
            resolution: 1.0,
            face: 2.0,
        }
    }
}

impl AdvancedWeights {
    /// Negative or non-finite weights would break monotonicity; they are
    /// replaced by zero.
    pub fn sanitized(self) -> Self {
        let clean = |name: &str, w: f64| {
            if w.is_finite() && w >= 0.0 {
                w
            } else {
                log::warn!("Ignoring invalid {} weight {}; using 0", name, w);
                0.0
            }
        };
        Self {
            sharpness: clean("sharpness", self.sharpness),
            resolution: clean("resolution", self.resolution),
            face: clean("face", self.face),
        }
    }
}

/// Measured components of an image's quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageQuality {
    pub sharpness: f64,
    pub pixels: u64,
    pub faces: usize,
}

/// Weighted sum of log-sharpness, log-megapixels and a face bonus.
pub struct AdvancedPolicy {
    weights: AdvancedWeights,
    face_detector: Option<Arc<dyn FaceDetector>>,
}

impl AdvancedPolicy {
    pub fn new(weights: AdvancedWeights, face_detector: Option<Arc<dyn FaceDetector>>) -> Self {
        Self {
            weights: weights.sanitized(),
            face_detector,
        }
    }

    pub fn has_face_detection(&self) -> bool {
        self.face_detector.is_some()
    }

    pub fn quality(&self, image: &DynamicImage) -> ImageQuality {
        ImageQuality {
            sharpness: laplacian_variance(&image.to_luma8()),
            pixels: image.width() as u64 * image.height() as u64,
            faces: self
                .face_detector
                .as_ref()
                .map(|detector| detector.detect_faces(image))
                .unwrap_or(0),
        }
    }

    /// Non-decreasing in each component.
    pub fn combine(&self, quality: &ImageQuality) -> f64 {
        let sharpness = quality.sharpness.max(0.0).ln_1p();
        let resolution = (quality.pixels as f64 / 1_000_000.0).ln_1p();
        let face = if quality.faces > 0 { 1.0 } else { 0.0 };

        self.weights.sharpness * sharpness
            + self.weights.resolution * resolution
            + self.weights.face * face
    }
}

impl ScoringPolicy for AdvancedPolicy {
    fn name(&self) -> &'static str {
        "advanced"
    }

    fn score_image(&self, image: &DynamicImage) -> f64 {
        self.combine(&self.quality(image))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    pub(crate) fn checkerboard(size: u32, cell: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        }))
    }

    pub(crate) fn gradient(size: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(size, size, |x, _| {
            Luma([(x * 255 / size.max(1)) as u8])
        }))
    }

    /// Reports one face whenever the top-left pixel is white.
    pub(crate) struct BrightCornerDetector;

    impl FaceDetector for BrightCornerDetector {
        fn detect_faces(&self, image: &DynamicImage) -> usize {
            if image.to_luma8().get_pixel(0, 0)[0] == 255 { 1 } else { 0 }
        }
    }

    #[test]
    fn test_laplacian_variance_of_checkerboard() {
        let gray = checkerboard(16, 1).to_luma8();
        // every interior response is +/-1020
        assert!((laplacian_variance(&gray) - 1020.0 * 1020.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_and_linear_images_have_zero_variance() {
        let flat = GrayImage::from_pixel(10, 10, Luma([90u8]));
        assert_eq!(laplacian_variance(&flat), 0.0);

        let ramp = GrayImage::from_fn(10, 10, |x, _| Luma([(x * 10) as u8]));
        assert_eq!(laplacian_variance(&ramp), 0.0);
    }

    #[test]
    fn test_tiny_image_scores_zero() {
        let tiny = GrayImage::from_pixel(2, 2, Luma([255u8]));
        assert_eq!(laplacian_variance(&tiny), 0.0);
    }

    #[test]
    fn test_sharp_beats_blurry() {
        let policy = LaplacianPolicy;
        assert!(policy.score_image(&checkerboard(32, 2)) > policy.score_image(&gradient(32)));
    }

    #[test]
    fn test_advanced_is_monotonic_in_each_component() {
        let policy = AdvancedPolicy::new(AdvancedWeights::default(), None);
        let base = ImageQuality {
            sharpness: 120.0,
            pixels: 2_000_000,
            faces: 0,
        };

        let sharper = ImageQuality {
            sharpness: 480.0,
            ..base
        };
        let larger = ImageQuality {
            pixels: 12_000_000,
            ..base
        };
        let with_face = ImageQuality { faces: 1, ..base };

        assert!(policy.combine(&sharper) >= policy.combine(&base));
        assert!(policy.combine(&larger) >= policy.combine(&base));
        assert!(policy.combine(&with_face) >= policy.combine(&base));
        assert!(policy.combine(&with_face) > policy.combine(&base));
    }

    #[test]
    fn test_advanced_without_detector_ignores_faces() {
        let policy = AdvancedPolicy::new(AdvancedWeights::default(), None);
        assert!(!policy.has_face_detection());
        let image = checkerboard(16, 1);
        assert_eq!(policy.quality(&image).faces, 0);
    }

    #[test]
    fn test_advanced_face_bonus() {
        let image = checkerboard(16, 1);
        let plain = AdvancedPolicy::new(AdvancedWeights::default(), None);
        let faces = AdvancedPolicy::new(
            AdvancedWeights::default(),
            Some(Arc::new(BrightCornerDetector)),
        );
        assert!((faces.score_image(&image) - plain.score_image(&image) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_weights_are_zeroed() {
        let weights = AdvancedWeights {
            sharpness: -1.0,
            resolution: f64::NAN,
            face: 3.0,
        }
        .sanitized();
        assert_eq!(weights.sharpness, 0.0);
        assert_eq!(weights.resolution, 0.0);
        assert_eq!(weights.face, 3.0);
    }

    #[test]
    fn test_scores_are_deterministic() {
        let policy = ScoringMethod::Advanced.build(AdvancedWeights::default(), None);
        let image = checkerboard(24, 3);
        assert_eq!(policy.score_image(&image), policy.score_image(&image));
        assert_eq!(policy.name(), "advanced");
        assert_eq!(
            ScoringMethod::Laplacian
                .build(AdvancedWeights::default(), None)
                .name(),
            "laplacian"
        );
    }
}
