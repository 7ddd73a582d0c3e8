use crate::output;
use crate::sink::ResultSink;
use facecull_core::{ConfigError, FaceLocator, ImageOutcome, ReasonCode, RunConfiguration, RunStatistics};
use facecull_inference::InferenceClient;
use image::{DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

/// Prompt for the face validation gate. Only an exact, case-insensitive
/// `yes` answer accepts the image.
pub const VALIDATION_PROMPT: &str =
    "Does this image contain a clearly visible human face? Respond with only 'yes' or 'no'.";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Requests cooperative cancellation of the current run.
///
/// Checked by the worker at each folder and file boundary; the image in
/// flight always finishes.
#[derive(Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Clears the running flag when the worker exits, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs the classification pipeline on a dedicated worker thread.
///
/// One run at a time per engine. The locator and client are shared with
/// every run this engine starts.
pub struct PipelineEngine {
    locator: Arc<dyn FaceLocator>,
    client: Arc<dyn InferenceClient>,
    running: Arc<AtomicBool>,
    cancel: CancelHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineEngine {
    pub fn new(locator: Arc<dyn FaceLocator>, client: Arc<dyn InferenceClient>) -> Self {
        Self {
            locator,
            client,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancelHandle::default(),
            worker: Mutex::new(None),
        }
    }

    /// Validate `config` and start a run that reports to `sink`.
    ///
    /// Returns `Ok(false)` without touching the active run if one is still
    /// in progress, whatever `config` holds. Otherwise configuration errors
    /// are returned before any work starts.
    pub fn start(
        &self,
        config: RunConfiguration,
        sink: Box<dyn ResultSink>,
    ) -> Result<bool, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("start requested while a run is active; ignoring");
            return Ok(false);
        }

        if let Err(e) = config.validate() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        // Reap the previous, already finished worker.
        self.wait();
        self.cancel.reset();

        let worker = Worker {
            config,
            sink,
            locator: Arc::clone(&self.locator),
            client: Arc::clone(&self.client),
            cancel: self.cancel.clone(),
        };
        let guard = RunningGuard(Arc::clone(&self.running));

        let handle = std::thread::Builder::new()
            .name("facecull-engine".into())
            .spawn(move || {
                let _guard = guard;
                worker.run();
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                EngineError::Spawn(e)
            })?;

        *self.lock_worker() = Some(handle);
        Ok(true)
    }

    /// Request a cooperative stop of the active run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel runs from another thread or task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Block until the current worker, if any, has exited.
    pub fn wait(&self) {
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PipelineEngine {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// Everything one run owns on the worker thread.
struct Worker {
    config: RunConfiguration,
    sink: Box<dyn ResultSink>,
    locator: Arc<dyn FaceLocator>,
    client: Arc<dyn InferenceClient>,
    cancel: CancelHandle,
}

impl Worker {
    fn run(mut self) {
        tracing::info!(
            folders = self.config.input_folders.len(),
            output = %self.config.output_directory.display(),
            crop = self.config.crop_faces,
            validate = self.config.ai_validate,
            captions = self.config.generate_captions,
            "run started"
        );

        let total = match count_images(&self.config) {
            Ok(total) => total,
            Err(message) => {
                self.abort(&RunStatistics::default(), &message);
                return;
            }
        };
        let mut stats = RunStatistics::new(total);

        if let Err(e) = std::fs::create_dir_all(&self.config.output_directory) {
            let message = format!(
                "cannot create output directory {}: {e}",
                self.config.output_directory.display()
            );
            self.abort(&stats, &message);
            return;
        }

        let cancelled = self.process_folders(&mut stats);
        if cancelled {
            tracing::info!(examined = stats.examined(), total, "run cancelled");
            self.sink.on_status("Processing cancelled");
        } else {
            tracing::info!(examined = stats.examined(), total, "run complete");
            self.sink.on_status("Processing complete");
        }
        self.sink.on_finished(&stats);
    }

    fn abort(&mut self, stats: &RunStatistics, message: &str) {
        tracing::error!(%message, "run aborted");
        self.sink.on_status(&format!("Run aborted: {message}"));
        self.sink.on_finished(stats);
    }

    /// Returns true if the run was cancelled.
    fn process_folders(&mut self, stats: &mut RunStatistics) -> bool {
        let folders = self.config.input_folders.clone();
        for folder in &folders {
            if self.cancel.is_cancelled() {
                return true;
            }

            let files = match list_images(folder, &self.config) {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(folder = %folder.display(), error = %e, "folder became unreadable");
                    self.sink
                        .on_status(&format!("Skipping {}: {e}", folder.display()));
                    continue;
                }
            };

            for path in files {
                if self.cancel.is_cancelled() {
                    return true;
                }

                let outcome = self.process_image(&path);
                tracing::debug!(
                    file = %outcome.file_name,
                    reason = %outcome.reason,
                    cropped = outcome.was_cropped,
                    "image resolved"
                );
                stats.record(outcome.reason);
                self.sink.on_image_result(&outcome);
                self.sink.on_progress(stats.progress_percent());
            }
        }
        false
    }

    fn process_image(&mut self, path: &Path) -> ImageOutcome {
        // `list_images` only yields paths with a final component.
        let original_name = path.file_name().unwrap_or_default();
        let file_name = original_name.to_string_lossy().into_owned();

        self.sink.on_current_image(path);
        self.sink.on_status(&format!("Processing {file_name}..."));

        let image = match output::decode_image(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to decode image");
                self.sink
                    .on_status(&format!("Could not read {file_name}: {e}"));
                return ImageOutcome::rejected(file_name, ReasonCode::Unreadable);
            }
        };

        let (width, height) = image.dimensions();
        if width < self.config.min_width || height < self.config.min_height {
            return ImageOutcome::rejected(file_name, ReasonCode::SmallImage);
        }

        let faces = self.locator.detect(&image.to_luma8());
        let Some(face) = faces.first().copied() else {
            return ImageOutcome::rejected(file_name, ReasonCode::NoFace);
        };
        tracing::debug!(file = %file_name, faces = faces.len(), x = face.x, y = face.y, w = face.width, h = face.height, "face found");

        let (working, was_cropped) = if self.config.crop_faces {
            (image.crop_imm(face.x, face.y, face.width, face.height), true)
        } else {
            (image, false)
        };

        let mut outcome = ImageOutcome {
            file_name,
            accepted: false,
            reason: ReasonCode::Processed,
            was_cropped,
            ai_text: String::new(),
            ai_error: None,
        };

        if self.config.ai_validate && !self.validate(&working, &mut outcome) {
            outcome.reason = ReasonCode::FailedValidation;
            return outcome;
        }

        let dest = self.config.output_directory.join(original_name);
        let persisted = if was_cropped {
            output::save_image(&working, &dest)
        } else {
            output::copy_original(path, &dest)
        };
        if let Err(e) = persisted {
            tracing::error!(path = %dest.display(), error = %e, "failed to write output image");
            self.sink
                .on_status(&format!("Failed to save {}: {e}", outcome.file_name));
            outcome.reason = ReasonCode::WriteFailed;
            return outcome;
        }

        if self.config.generate_captions {
            self.caption(&dest, &mut outcome);
        }

        outcome.accepted = true;
        outcome.reason = ReasonCode::Processed;
        outcome
    }

    /// Ask the model whether `working` shows a face. Records the raw answer
    /// (or the failure) on `outcome` and returns whether it passed.
    fn validate(&mut self, working: &DynamicImage, outcome: &mut ImageOutcome) -> bool {
        let payload = match output::encode_jpeg(working) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_ai_failure(outcome, format!("failed to encode image: {e}"));
                return false;
            }
        };

        match self.client.infer(&payload, VALIDATION_PROMPT) {
            Ok(answer) => {
                let passed = is_affirmative(&answer);
                tracing::debug!(file = %outcome.file_name, %answer, passed, "validation answer");
                outcome.ai_text = answer;
                passed
            }
            Err(e) => {
                self.record_ai_failure(outcome, e.to_string());
                false
            }
        }
    }

    /// Caption the persisted file at `dest` and write the caption beside it.
    fn caption(&mut self, dest: &Path, outcome: &mut ImageOutcome) {
        let bytes = match std::fs::read(dest) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_ai_failure(outcome, format!("failed to read {}: {e}", dest.display()));
                return;
            }
        };

        let caption = match self.client.infer(&bytes, &self.config.inference.prompt) {
            Ok(text) => text,
            Err(e) => {
                self.record_ai_failure(outcome, e.to_string());
                return;
            }
        };

        let caption = match self.config.caption_limit {
            Some(limit) => output::truncate_chars(&caption, limit).to_string(),
            None => caption,
        };

        let original_name = dest.file_name().unwrap_or_default();
        match output::write_caption(&self.config.output_directory, original_name, &caption) {
            Ok(path) => tracing::debug!(path = %path.display(), "caption written"),
            Err(e) => {
                tracing::error!(file = %outcome.file_name, error = %e, "failed to write caption");
                self.sink.on_status(&format!(
                    "Failed to write caption for {}: {e}",
                    outcome.file_name
                ));
                outcome.ai_error = Some(e.to_string());
            }
        }
        outcome.ai_text = caption;
    }

    fn record_ai_failure(&mut self, outcome: &mut ImageOutcome, error: String) {
        tracing::warn!(file = %outcome.file_name, %error, "AI request failed");
        self.sink.on_status(&format!(
            "AI request failed for {}: {error}",
            outcome.file_name
        ));
        outcome.ai_text = error.clone();
        outcome.ai_error = Some(error);
    }
}

/// Strict validation policy: the whole answer must be `yes`, any case.
fn is_affirmative(answer: &str) -> bool {
    answer.eq_ignore_ascii_case("yes")
}

/// Allowed-extension files directly inside `folder`, sorted by file name.
fn list_images(folder: &Path, config: &RunConfiguration) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        // Follows symlinks; directories and dangling links are skipped.
        if !path.is_file() {
            continue;
        }
        if config.is_allowed_file(&entry.file_name().to_string_lossy()) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Counting pass over every configured folder. Fixes `total_images` for the run.
fn count_images(config: &RunConfiguration) -> Result<u64, String> {
    let mut total = 0u64;
    for folder in &config.input_folders {
        let files = list_images(folder, config)
            .map_err(|e| format!("cannot list {}: {e}", folder.display()))?;
        total += files.len() as u64;
    }
    tracing::info!(total, "counted images");
    Ok(total)
}
