// Optional face detection used by the advanced scoring policy.
//
// The detector evaluates a boosted Haar cascade (Viola-Jones) over an integral
// image. Cascades are stored as JSON; converting an OpenCV XML cascade is a
// job for an external script.

use image::{imageops::FilterType, DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaceDetectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cascade parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid cascade: {message}")]
    InvalidCascade { message: String },
}

/// Counts faces in an image.
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &DynamicImage) -> usize;
}

/// One rectangle of a Haar feature, relative to the detection window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f64,
}

/// A decision stump over one Haar feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<FeatureRect>,
    pub threshold: f64,
    pub left: f64,
    pub right: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStage {
    pub threshold: f64,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: usize,
    pub stages: Vec<CascadeStage>,
}

fn default_scale_factor() -> f64 {
    1.25
}

fn default_min_neighbors() -> usize {
    3
}

impl HaarCascade {
    pub fn from_file(path: &Path) -> Result<Self, FaceDetectorError> {
        let contents = fs::read_to_string(path)?;
        let cascade: HaarCascade = serde_json::from_str(&contents)?;
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), FaceDetectorError> {
        let invalid = |message: String| Err(FaceDetectorError::InvalidCascade { message });

        if self.window_width == 0 || self.window_height == 0 {
            return invalid("window size must be positive".to_string());
        }
        if self.scale_factor <= 1.0 {
            return invalid(format!("scale factor {} must exceed 1", self.scale_factor));
        }
        if self.stages.is_empty() {
            return invalid("cascade has no stages".to_string());
        }
        for (s, stage) in self.stages.iter().enumerate() {
            for classifier in &stage.classifiers {
                for rect in &classifier.rects {
                    let right = rect.x.checked_add(rect.width);
                    let bottom = rect.y.checked_add(rect.height);
                    let inside = matches!(right, Some(r) if r <= self.window_width)
                        && matches!(bottom, Some(b) if b <= self.window_height);
                    if !inside {
                        return invalid(format!("stage {} has a rect outside the window", s));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Detection {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl Detection {
    fn overlap(&self, other: &Detection) -> f64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let inter = ((right - left) * (bottom - top)) as f64;
        let union =
            (self.width * self.height + other.width * other.height) as f64 - inter;
        inter / union
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    width: usize,
    sum: Vec<f64>,
    sq_sum: Vec<f64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = gray.dimensions();
        let width = w as usize + 1;
        let mut sum = vec![0.0; width * (h as usize + 1)];
        let mut sq_sum = vec![0.0; width * (h as usize + 1)];

        for y in 0..h as usize {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w as usize {
                let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * width + x + 1;
                sum[idx] = sum[idx - width] + row;
                sq_sum[idx] = sq_sum[idx - width] + row_sq;
            }
        }

        Self { width, sum, sq_sum }
    }

    fn area(table: &[f64], width: usize, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * width + x1] - table[y0 * width + x1] - table[y1 * width + x0]
            + table[y0 * width + x0]
    }

    fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::area(&self.sum, self.width, x, y, w, h)
    }

    fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::area(&self.sq_sum, self.width, x, y, w, h)
    }
}

pub struct CascadeFaceDetector {
    cascade: HaarCascade,
    max_side: u32,
}

impl CascadeFaceDetector {
    pub fn new(cascade: HaarCascade) -> Self {
        Self {
            cascade,
            max_side: 640,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, FaceDetectorError> {
        Ok(Self::new(HaarCascade::from_file(path)?))
    }

    /// Images are downscaled so their longer side is at most `max_side`
    /// before detection.
    pub fn with_max_side(mut self, max_side: u32) -> Self {
        self.max_side = max_side.max(1);
        self
    }

    fn prepare(&self, image: &DynamicImage) -> GrayImage {
        if image.width().max(image.height()) > self.max_side {
            image
                .resize(self.max_side, self.max_side, FilterType::Triangle)
                .to_luma8()
        } else {
            image.to_luma8()
        }
    }

    fn evaluate_window(
        &self,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        scale: f64,
        win_w: u32,
        win_h: u32,
    ) -> bool {
        let area = (win_w * win_h) as f64;
        let mean = integral.rect_sum(x, y, win_w, win_h) / area;
        let variance = integral.rect_sq_sum(x, y, win_w, win_h) / area - mean * mean;
        if variance <= 1e-6 {
            // flat patch
            return false;
        }
        let std_dev = variance.sqrt();

        for stage in &self.cascade.stages {
            let mut stage_sum = 0.0;
            for classifier in &stage.classifiers {
                let mut feature = 0.0;
                for rect in &classifier.rects {
                    let rx = ((rect.x as f64 * scale).round() as u32).min(win_w - 1);
                    let ry = ((rect.y as f64 * scale).round() as u32).min(win_h - 1);
                    let rw = ((rect.width as f64 * scale).round() as u32)
                        .max(1)
                        .min(win_w - rx);
                    let rh = ((rect.height as f64 * scale).round() as u32)
                        .max(1)
                        .min(win_h - ry);
                    feature += rect.weight * integral.rect_sum(x + rx, y + ry, rw, rh);
                }
                feature /= area;

                stage_sum += if feature < classifier.threshold * std_dev {
                    classifier.left
                } else {
                    classifier.right
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn raw_detections(&self, gray: &GrayImage) -> Vec<Detection> {
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(gray);
        let mut detections = Vec::new();

        let mut scale = 1.0f64;
        loop {
            let win_w = (self.cascade.window_width as f64 * scale).round() as u32;
            let win_h = (self.cascade.window_height as f64 * scale).round() as u32;
            if win_w > width || win_h > height {
                break;
            }
            let step = (scale.round() as u32).max(1);

            let mut y = 0;
            while y + win_h <= height {
                let mut x = 0;
                while x + win_w <= width {
                    if self.evaluate_window(&integral, x, y, scale, win_w, win_h) {
                        detections.push(Detection {
                            x,
                            y,
                            width: win_w,
                            height: win_h,
                        });
                    }
                    x += step;
                }
                y += step;
            }

            scale *= self.cascade.scale_factor;
        }

        detections
    }
}

/// Merge overlapping raw detections and keep the clusters that gathered at
/// least `min_neighbors` hits.
fn group_detections(detections: &[Detection], min_neighbors: usize) -> usize {
    let mut clusters: Vec<(Detection, usize)> = Vec::new();
    for detection in detections {
        match clusters
            .iter_mut()
            .find(|(representative, _)| representative.overlap(detection) > 0.3)
        {
            Some(cluster) => cluster.1 += 1,
            None => clusters.push((*detection, 1)),
        }
    }
    clusters
        .iter()
        .filter(|(_, hits)| *hits >= min_neighbors.max(1))
        .count()
}

impl FaceDetector for CascadeFaceDetector {
    fn detect_faces(&self, image: &DynamicImage) -> usize {
        let gray = self.prepare(image);
        let detections = self.raw_detections(&gray);
        let faces = group_detections(&detections, self.cascade.min_neighbors);
        log::debug!(
            "Face detection: {} raw window(s), {} face(s)",
            detections.len(),
            faces
        );
        faces
    }
}

/// Build the configured face detector, if any.
///
/// No path means face detection is off. A path that cannot be loaded is
/// logged and also turns face detection off; it never fails the run.
pub fn load_face_detector(path: Option<&Path>) -> Option<Arc<dyn FaceDetector>> {
    let Some(path) = path else {
        log::info!("No face cascade configured; face detection disabled");
        return None;
    };

    match CascadeFaceDetector::from_file(path) {
        Ok(detector) => {
            log::info!("Loaded face cascade from {}", path.display());
            Some(Arc::new(detector))
        }
        Err(e) => {
            log::warn!(
                "Could not load face cascade {}: {}; face detection disabled",
                path.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    /// A one-stage cascade firing on "dark above, bright below" windows.
    pub(crate) fn edge_cascade() -> HaarCascade {
        HaarCascade {
            window_width: 8,
            window_height: 8,
            scale_factor: 1.25,
            min_neighbors: 3,
            stages: vec![CascadeStage {
                threshold: 0.5,
                classifiers: vec![WeakClassifier {
                    rects: vec![
                        FeatureRect {
                            x: 0,
                            y: 0,
                            width: 8,
                            height: 4,
                            weight: -1.0,
                        },
                        FeatureRect {
                            x: 0,
                            y: 4,
                            width: 8,
                            height: 4,
                            weight: 1.0,
                        },
                    ],
                    threshold: 0.25,
                    left: -1.0,
                    right: 1.0,
                }],
            }],
        }
    }

    fn split_image(dark_on_top: bool) -> DynamicImage {
        let img = GrayImage::from_fn(32, 32, |_, y| {
            let top = y < 16;
            if top == dark_on_top {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_detects_matching_pattern() {
        let detector = CascadeFaceDetector::new(edge_cascade());
        assert!(detector.detect_faces(&split_image(true)) >= 1);
    }

    #[test]
    fn test_ignores_inverted_pattern_and_flat_image() {
        let detector = CascadeFaceDetector::new(edge_cascade());
        assert_eq!(detector.detect_faces(&split_image(false)), 0);

        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 32, Luma([128u8])));
        assert_eq!(detector.detect_faces(&flat), 0);
    }

    #[test]
    fn test_image_smaller_than_window() {
        let detector = CascadeFaceDetector::new(edge_cascade());
        let tiny = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([0u8])));
        assert_eq!(detector.detect_faces(&tiny), 0);
    }

    #[test]
    fn test_integral_rect_sum() {
        let img = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let integral = IntegralImage::new(&img);
        // pixels (1,1),(2,1),(1,2),(2,2) = 5 + 6 + 9 + 10
        assert_eq!(integral.rect_sum(1, 1, 2, 2), 30.0);
        assert_eq!(integral.rect_sum(0, 0, 4, 3), (0..12).sum::<u32>() as f64);
    }

    #[test]
    fn test_cascade_roundtrips_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cascade.json");
        fs::write(&path, serde_json::to_string(&edge_cascade()).unwrap()).unwrap();

        let detector = CascadeFaceDetector::from_file(&path).unwrap();
        assert!(detector.detect_faces(&split_image(true)) >= 1);
    }

    #[test]
    fn test_invalid_cascade_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cascade.json");
        let mut cascade = edge_cascade();
        cascade.stages[0].classifiers[0].rects[0].width = 20;
        fs::write(&path, serde_json::to_string(&cascade).unwrap()).unwrap();

        assert!(matches!(
            HaarCascade::from_file(&path),
            Err(FaceDetectorError::InvalidCascade { .. })
        ));
    }

    #[test]
    fn test_rect_overflowing_u32_rejected() {
        let mut cascade = edge_cascade();
        cascade.stages[0].classifiers[0].rects[0].x = u32::MAX;
        assert!(matches!(
            cascade.validate(),
            Err(FaceDetectorError::InvalidCascade { .. })
        ));

        let mut cascade = edge_cascade();
        cascade.stages[0].classifiers[0].rects[1].y = 4;
        cascade.stages[0].classifiers[0].rects[1].height = u32::MAX;
        assert!(matches!(
            cascade.validate(),
            Err(FaceDetectorError::InvalidCascade { .. })
        ));
        assert!(edge_cascade().validate().is_ok());
    }

    #[test]
    fn test_missing_cascade_disables_detection() {
        assert!(load_face_detector(None).is_none());
        assert!(load_face_detector(Some(Path::new("/nonexistent/cascade.json"))).is_none());
    }
}
