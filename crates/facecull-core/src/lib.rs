//! facecull-core — Data model and face location for the facecull pipeline.
//!
//! Holds the per-run configuration, the per-image outcome and statistics
//! types, and the cascade face locator used to classify images.

pub mod config;
pub mod detector;
pub mod types;

pub use config::{
    default_config_path, ConfigError, DetectorParams, InferenceSettings, RunConfiguration,
};
pub use detector::{default_model_dir, DetectorError, FaceLocator, SeetaFaceLocator};
pub use types::{BoundingBox, ImageOutcome, ReasonCode, RunStatistics};
