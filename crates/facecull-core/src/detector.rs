//! Cascade face locator via the SeetaFace engine (`rustface`).
//!
//! The pipeline only depends on the [`FaceLocator`] contract: a grayscale
//! image in, an ordered list of boxes out. The first box is canonical.

use crate::config::DetectorParams;
use crate::types::BoundingBox;
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

// rustface accepts pyramid factors strictly inside this range.
const MIN_PYRAMID_FACTOR: f32 = 0.01;
const MAX_PYRAMID_FACTOR: f32 = 0.99;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download seeta_fd_frontal_v1.0.bin from the rustface repository)")]
    ModelNotFound(String),
    #[error("failed to read model {path}: {source}")]
    InvalidModel {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Locates faces in a grayscale image.
///
/// Implementations must be shareable with the engine's worker thread.
pub trait FaceLocator: Send + Sync {
    /// Detect faces, in detector order. Boxes lie inside the image.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Default directory for detector model files:
/// `$XDG_DATA_HOME/facecull/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecull")
        .join("models")
}

/// SeetaFace funnel-cascade detector.
pub struct SeetaFaceLocator {
    model: rustface::Model,
    params: DetectorParams,
}

impl SeetaFaceLocator {
    /// Load the SeetaFace model named by `params.model_path`.
    pub fn load(params: &DetectorParams) -> Result<Self, DetectorError> {
        params
            .validate()
            .map_err(|e| DetectorError::InvalidParams(e.to_string()))?;

        let path = &params.model_path;
        if !Path::new(path).exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }

        let file = std::fs::File::open(path).map_err(|source| DetectorError::InvalidModel {
            path: path.display().to_string(),
            source,
        })?;
        let model = rustface::read_model(std::io::BufReader::new(file)).map_err(|source| {
            DetectorError::InvalidModel {
                path: path.display().to_string(),
                source,
            }
        })?;

        tracing::info!(
            path = %path.display(),
            scale_factor = params.scale_factor,
            min_size = params.min_size,
            score_threshold = params.score_threshold,
            "loaded SeetaFace model"
        );

        Ok(Self {
            model,
            params: params.clone(),
        })
    }

    fn build_detector(&self) -> Box<dyn rustface::Detector> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.params.min_size);
        detector.set_score_thresh(self.params.score_threshold);
        detector.set_pyramid_scale_factor(pyramid_factor(self.params.scale_factor));
        detector.set_slide_window_step(self.params.slide_step, self.params.slide_step);
        detector
    }
}

impl FaceLocator for SeetaFaceLocator {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (width, height) = gray.dimensions();
        if width < self.params.min_size || height < self.params.min_size {
            tracing::debug!(width, height, "image smaller than minimum face size");
            return Vec::new();
        }

        let mut detector = self.build_detector();
        let mut image = rustface::ImageData::new(gray.as_raw(), width, height);
        let faces = detector.detect(&mut image);

        let boxes: Vec<BoundingBox> = faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                BoundingBox::clipped(
                    bbox.x(),
                    bbox.y(),
                    bbox.width(),
                    bbox.height(),
                    face.score() as f32,
                    width,
                    height,
                )
            })
            .collect();

        tracing::debug!(width, height, faces = boxes.len(), "face detection complete");
        boxes
    }
}

/// Convert an upscaling step (`1.1` = grow the window 10% per level) into
/// SeetaFace's downscaling pyramid factor.
fn pyramid_factor(scale_factor: f32) -> f32 {
    (1.0 / scale_factor).clamp(MIN_PYRAMID_FACTOR, MAX_PYRAMID_FACTOR)
}
