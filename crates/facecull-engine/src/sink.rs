//! Outbound event contract between the engine and its consumer.

use facecull_core::{ImageOutcome, RunStatistics};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Receives events from a running pipeline.
///
/// Called from the engine's worker thread. `on_finished` fires exactly once
/// per run, after every other event.
pub trait ResultSink: Send {
    fn on_progress(&mut self, percent: u8);
    fn on_status(&mut self, message: &str);
    fn on_image_result(&mut self, outcome: &ImageOutcome);
    /// Fired before each file is decoded, for live preview.
    fn on_current_image(&mut self, path: &Path);
    fn on_finished(&mut self, stats: &RunStatistics);
}

/// One sink callback as a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress { percent: u8 },
    Status { message: String },
    ImageResult(ImageOutcome),
    CurrentImage { path: PathBuf },
    Finished(RunStatistics),
}

/// Forwards events over an unbounded channel so a consumer on another
/// thread or task can render them without blocking the worker.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) {
        // A closed receiver means nobody is listening; the run still completes.
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_progress(&mut self, percent: u8) {
        self.send(PipelineEvent::Progress { percent });
    }

    fn on_status(&mut self, message: &str) {
        self.send(PipelineEvent::Status {
            message: message.to_string(),
        });
    }

    fn on_image_result(&mut self, outcome: &ImageOutcome) {
        self.send(PipelineEvent::ImageResult(outcome.clone()));
    }

    fn on_current_image(&mut self, path: &Path) {
        self.send(PipelineEvent::CurrentImage {
            path: path.to_path_buf(),
        });
    }

    fn on_finished(&mut self, stats: &RunStatistics) {
        self.send(PipelineEvent::Finished(stats.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecull_core::ReasonCode;

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (mut sink, mut rx) = ChannelSink::new();
        sink.on_current_image(Path::new("/in/a.png"));
        sink.on_status("Processing a.png...");
        sink.on_image_result(&ImageOutcome::rejected("a.png", ReasonCode::NoFace));
        sink.on_progress(50);
        sink.on_finished(&RunStatistics::new(2));
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.blocking_recv() {
            events.push(event);
        }

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            PipelineEvent::CurrentImage {
                path: PathBuf::from("/in/a.png")
            }
        );
        assert_eq!(events[3], PipelineEvent::Progress { percent: 50 });
        assert!(matches!(events[4], PipelineEvent::Finished(ref s) if s.total_images == 2));
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_status("nobody listening");
        sink.on_finished(&RunStatistics::default());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(PipelineEvent::Progress { percent: 40 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "progress", "percent": 40}));

        let outcome = ImageOutcome::rejected("b.jpg", ReasonCode::SmallImage);
        let json = serde_json::to_value(PipelineEvent::ImageResult(outcome)).unwrap();
        assert_eq!(json["event"], "image_result");
        assert_eq!(json["file_name"], "b.jpg");
        assert_eq!(json["reason"], "small_image");
    }
}
