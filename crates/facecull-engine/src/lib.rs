//! facecull-engine — The per-run image classification pipeline.
//!
//! A run walks the configured folders on a dedicated worker thread and
//! resolves each image through size filter → face detection → optional
//! crop → optional AI validation → persist → optional AI caption, reporting
//! every step to a [`ResultSink`].

pub mod engine;
pub mod output;
pub mod sink;

pub use engine::{CancelHandle, EngineError, PipelineEngine, VALIDATION_PROMPT};
pub use sink::{ChannelSink, PipelineEvent, ResultSink};
