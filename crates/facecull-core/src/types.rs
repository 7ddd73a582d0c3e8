use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector score; scale is backend-specific.
    pub confidence: f32,
}

impl BoundingBox {
    /// Clip a raw detector rectangle to a `frame_width` × `frame_height` image.
    ///
    /// Cascade detectors may report boxes that extend past the frame edge.
    /// Returns `None` if nothing of the box remains inside the image.
    pub fn clipped(
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        confidence: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        let x0 = i64::from(x).clamp(0, i64::from(frame_width));
        let y0 = i64::from(y).clamp(0, i64::from(frame_height));
        let x1 = (i64::from(x) + i64::from(width)).clamp(0, i64::from(frame_width));
        let y1 = (i64::from(y) + i64::from(height)).clamp(0, i64::from(frame_height));

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
            confidence,
        })
    }
}

/// Why an image was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    SmallImage,
    NoFace,
    FailedValidation,
    Processed,
    /// The file could not be decoded as an image.
    Unreadable,
    /// A face was found but the output file could not be written.
    WriteFailed,
}

impl ReasonCode {
    /// Human-readable reason text shown alongside each outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::SmallImage => "Small image",
            ReasonCode::NoFace => "No face detected",
            ReasonCode::FailedValidation => "Failed AI validation",
            ReasonCode::Processed => "Processed successfully",
            ReasonCode::Unreadable => "Unreadable image",
            ReasonCode::WriteFailed => "Failed to save image",
        }
    }

    /// Whether the image reached the face-positive branch of the pipeline.
    pub fn had_face(&self) -> bool {
        matches!(
            self,
            ReasonCode::FailedValidation | ReasonCode::Processed | ReasonCode::WriteFailed
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result for one examined file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub file_name: String,
    pub accepted: bool,
    pub reason: ReasonCode,
    pub was_cropped: bool,
    /// Model text (validation answer or caption), or the error text when the
    /// AI call failed. Empty when no AI step ran.
    pub ai_text: String,
    /// Set when an AI call for this image failed, so callers can tell a
    /// transport/HTTP failure apart from a model answer.
    pub ai_error: Option<String>,
}

impl ImageOutcome {
    /// A rejection with no AI involvement.
    pub fn rejected(file_name: impl Into<String>, reason: ReasonCode) -> Self {
        Self {
            file_name: file_name.into(),
            accepted: false,
            reason,
            was_cropped: false,
            ai_text: String::new(),
            ai_error: None,
        }
    }
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Allowed-extension files found by the counting pass at run start.
    pub total_images: u64,
    pub faces_found: u64,
    pub no_faces: u64,
    pub small_images: u64,
    pub failed_validation: u64,
    pub processed_successfully: u64,
    pub unreadable_images: u64,
    pub write_failures: u64,
}

impl RunStatistics {
    pub fn new(total_images: u64) -> Self {
        Self {
            total_images,
            ..Self::default()
        }
    }

    /// Count one resolved image under `reason`.
    ///
    /// Face-positive reasons also count toward `faces_found`.
    pub fn record(&mut self, reason: ReasonCode) {
        if reason.had_face() {
            self.faces_found += 1;
        }
        match reason {
            ReasonCode::SmallImage => self.small_images += 1,
            ReasonCode::NoFace => self.no_faces += 1,
            ReasonCode::FailedValidation => self.failed_validation += 1,
            ReasonCode::Processed => self.processed_successfully += 1,
            ReasonCode::Unreadable => self.unreadable_images += 1,
            ReasonCode::WriteFailed => self.write_failures += 1,
        }
    }

    /// Number of files resolved so far.
    pub fn examined(&self) -> u64 {
        self.faces_found + self.no_faces + self.small_images + self.unreadable_images
    }

    /// Progress as `floor(100 * examined / total)`, capped at 100.
    pub fn progress_percent(&self) -> u8 {
        if self.total_images == 0 {
            return 100;
        }
        (self.examined() * 100 / self.total_images).min(100) as u8
    }
}
