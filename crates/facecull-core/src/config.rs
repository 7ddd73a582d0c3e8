//! Run configuration: one validated value per run, loaded from TOML.
//!
//! The persisted document mirrors the settings the desktop front-end
//! exports: folders, thresholds, feature toggles, and inference parameters.
//! Environment variables (`FACECULL_*`) override the endpoint and model.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_GENERATE_PATH: &str = "/api/generate";
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_PROMPT: &str =
    "Return tags describing this picture. Use single words or short phrases separated by commas.";
pub const DEFAULT_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".jpeg", ".webp"];

// SeetaFace frontal model shipped by the rustface project.
const DEFAULT_DETECTOR_MODEL: &str = "seeta_fd_frontal_v1.0.bin";
// rustface rejects minimum face sizes below this.
const MIN_DETECTABLE_FACE: u32 = 20;

/// `$XDG_CONFIG_HOME/facecull/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facecull")
        .join("config.toml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no input folders configured")]
    NoInputFolders,
    #[error("no output directory configured")]
    NoOutputDirectory,
    #[error("no allowed file extensions configured")]
    NoAllowedExtensions,
    #[error("invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Endpoint, model, prompt, and generation options for the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub base_url: String,
    pub generate_path: String,
    pub model: String,
    /// Prompt used for captioning.
    pub prompt: String,
    #[serde(deserialize_with = "lenient::f32")]
    pub temperature: f32,
    #[serde(deserialize_with = "lenient::u32")]
    pub max_tokens: u32,
    #[serde(deserialize_with = "lenient::f32")]
    pub top_p: f32,
    #[serde(deserialize_with = "lenient::f32")]
    pub frequency_penalty: f32,
    #[serde(deserialize_with = "lenient::f32")]
    pub presence_penalty: f32,
    /// Per-request timeout. `None` waits for the service indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            generate_path: DEFAULT_GENERATE_PATH.to_string(),
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            timeout_secs: None,
        }
    }
}

impl InferenceSettings {
    /// Full URL of the generation endpoint.
    pub fn generate_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.generate_path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "base_url",
                reason: "must not be empty".into(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "model",
                reason: "must not be empty".into(),
            });
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidParameter {
                name: "timeout_secs",
                reason: "must be at least 1 when set".into(),
            });
        }
        for (name, value) in [
            ("temperature", self.temperature),
            ("top_p", self.top_p),
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("{value} is not a finite number"),
                });
            }
        }
        Ok(())
    }
}

/// Cascade detector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Path to the SeetaFace frontal model file.
    pub model_path: PathBuf,
    /// Image pyramid step between scales (> 1.0).
    pub scale_factor: f32,
    /// Smallest face edge, in pixels, that the detector searches for.
    pub min_size: u32,
    /// Minimum cascade score for a window to count as a face.
    pub score_threshold: f64,
    /// Sliding-window step in pixels.
    pub slide_step: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            model_path: crate::detector::default_model_dir().join(DEFAULT_DETECTOR_MODEL),
            scale_factor: 1.1,
            min_size: 30,
            score_threshold: 2.0,
            slide_step: 4,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 1.0 || self.scale_factor >= 100.0 {
            return Err(ConfigError::InvalidParameter {
                name: "scale_factor",
                reason: format!("{} must be in (1.0, 100.0)", self.scale_factor),
            });
        }
        if self.min_size < MIN_DETECTABLE_FACE {
            return Err(ConfigError::InvalidParameter {
                name: "min_size",
                reason: format!("{} is below the minimum of {MIN_DETECTABLE_FACE}", self.min_size),
            });
        }
        if !self.score_threshold.is_finite() || self.score_threshold <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "score_threshold",
                reason: format!("{} must be positive", self.score_threshold),
            });
        }
        if self.slide_step == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "slide_step",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Everything one pipeline run needs. Not mutated once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Processed in the given order.
    pub input_folders: Vec<PathBuf>,
    pub output_directory: PathBuf,
    pub min_width: u32,
    pub min_height: u32,
    /// Case-insensitive file-name suffixes, e.g. `.png`.
    pub allowed_extensions: Vec<String>,
    pub crop_faces: bool,
    pub ai_validate: bool,
    pub generate_captions: bool,
    /// Maximum caption length in characters; longer captions are truncated.
    pub caption_limit: Option<usize>,
    pub inference: InferenceSettings,
    pub detector: DetectorParams,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            input_folders: Vec::new(),
            output_directory: PathBuf::new(),
            min_width: 0,
            min_height: 0,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            crop_faces: false,
            ai_validate: false,
            generate_captions: false,
            caption_limit: None,
            inference: InferenceSettings::default(),
            detector: DetectorParams::default(),
        }
    }
}

impl RunConfiguration {
    /// Import a configuration document from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.normalize_extensions();
        Ok(config)
    }

    /// Export the configuration as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACECULL_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup (environment, test map, ...).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FACECULL_BASE_URL") {
            self.inference.base_url = url;
        }
        if let Some(model) = lookup("FACECULL_MODEL") {
            self.inference.model = model;
        }
        if let Some(path) = lookup("FACECULL_DETECTOR_MODEL") {
            self.detector.model_path = PathBuf::from(path);
        }
    }

    /// Lowercase every extension and ensure a leading dot; drop blanks.
    pub fn normalize_extensions(&mut self) {
        let mut normalized: Vec<String> = Vec::with_capacity(self.allowed_extensions.len());
        for ext in self.allowed_extensions.iter().filter_map(|e| normalize_extension(e)) {
            if !normalized.contains(&ext) {
                normalized.push(ext);
            }
        }
        self.allowed_extensions = normalized;
    }

    /// Whether `file_name` ends with one of the allowed extensions.
    ///
    /// Entries are matched in normalized form, so `png` only matches a
    /// `.png` suffix even when the list was built without a leading dot.
    pub fn is_allowed_file(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .filter_map(|e| normalize_extension(e))
            .any(|ext| lower.ends_with(&ext))
    }

    /// Reject configurations that must never start a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_folders.is_empty() {
            return Err(ConfigError::NoInputFolders);
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(ConfigError::NoOutputDirectory);
        }
        if self
            .allowed_extensions
            .iter()
            .all(|e| normalize_extension(e).is_none())
        {
            return Err(ConfigError::NoAllowedExtensions);
        }
        if self.caption_limit == Some(0) {
            return Err(ConfigError::InvalidParameter {
                name: "caption_limit",
                reason: "must be at least 1 when set".into(),
            });
        }
        self.inference.validate()?;
        self.detector.validate()?;
        Ok(())
    }
}

/// Lowercase `.ext` form of a configured extension, or `None` if blank.
fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext == "." {
        return None;
    }
    Some(if ext.starts_with('.') { ext } else { format!(".{ext}") })
}

/// Numeric fields that accept either TOML numbers or numeric strings.
///
/// Older settings exports stored generation parameters as text; anything
/// that does not parse as a number is rejected at load time.
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn f32<'de, D>(deserializer: D) -> Result<f32, D::Error>
    where
        D: Deserializer<'de>,
    {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Int(i) => Ok(i as f32),
            NumberOrText::Float(f) => Ok(f as f32),
            NumberOrText::Text(s) => s
                .trim()
                .parse::<f32>()
                .map_err(|_| D::Error::custom(format!("expected a number, got {s:?}"))),
        }
    }

    pub fn u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Int(i) => u32::try_from(i)
                .map_err(|_| D::Error::custom(format!("{i} is out of range"))),
            NumberOrText::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX) => {
                Ok(f as u32)
            }
            NumberOrText::Float(f) => Err(D::Error::custom(format!("expected an integer, got {f}"))),
            NumberOrText::Text(s) => s
                .trim()
                .parse::<u32>()
                .map_err(|_| D::Error::custom(format!("expected an integer, got {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> RunConfiguration {
        RunConfiguration {
            input_folders: vec![PathBuf::from("/in")],
            output_directory: PathBuf::from("/out"),
            ..RunConfiguration::default()
        }
    }

    #[test]
    fn test_defaults_match_front_end() {
        let config = RunConfiguration::default();
        assert_eq!(config.allowed_extensions, vec![".png", ".jpg", ".jpeg", ".webp"]);
        assert_eq!(config.inference.base_url, "http://localhost:11434");
        assert_eq!(config.inference.generate_url(), "http://localhost:11434/api/generate");
        assert_eq!(config.inference.max_tokens, 1000);
        assert!((config.detector.scale_factor - 1.1).abs() < 1e-6);
        assert_eq!(config.detector.min_size, 30);
    }

    #[test]
    fn test_parse_numeric_strings() {
        let config = RunConfiguration::from_toml_str(
            r#"
            input_folders = ["/a", "/b"]
            output_directory = "/out"

            [inference]
            temperature = "0.2"
            max_tokens = "256"
            top_p = 0.9
            frequency_penalty = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.input_folders, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!((config.inference.temperature - 0.2).abs() < 1e-6);
        assert_eq!(config.inference.max_tokens, 256);
        assert!((config.inference.top_p - 0.9).abs() < 1e-6);
        assert!((config.inference.frequency_penalty - 1.0).abs() < 1e-6);
        assert_eq!(config.inference.model, "default");
    }

    #[test]
    fn test_non_numeric_parameter_is_rejected() {
        let err = RunConfiguration::from_toml_str(
            r#"
            [inference]
            temperature = "warm"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
        assert!(err.to_string().contains("warm"));
    }

    #[test]
    fn test_fractional_max_tokens_is_rejected() {
        let err = RunConfiguration::from_toml_str("[inference]\nmax_tokens = 10.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_export_import() {
        let mut config = valid_config();
        config.crop_faces = true;
        config.caption_limit = Some(120);
        config.inference.model = "llava:13b".into();

        let text = config.to_toml_string().unwrap();
        let parsed = RunConfiguration::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facecull.toml");
        let config = valid_config();
        config.save(&path).unwrap();
        assert_eq!(RunConfiguration::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunConfiguration::load(Path::new("/nonexistent/facecull.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_extension_normalization() {
        let mut config = valid_config();
        config.allowed_extensions = vec![" PNG".into(), ".Jpg".into(), "".into(), ".png".into()];
        config.normalize_extensions();
        assert_eq!(config.allowed_extensions, vec![".png", ".jpg"]);
        assert!(config.is_allowed_file("Photo.JPG"));
        assert!(config.is_allowed_file("a.png"));
        assert!(!config.is_allowed_file("notes.txt"));
        assert!(!config.is_allowed_file("image.webp"));
    }

    #[test]
    fn test_validate_ok() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_validate_empty_folders() {
        let mut config = valid_config();
        config.input_folders.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoInputFolders)));
    }

    #[test]
    fn test_validate_missing_output() {
        let mut config = valid_config();
        config.output_directory = PathBuf::new();
        assert!(matches!(config.validate(), Err(ConfigError::NoOutputDirectory)));
    }

    #[test]
    fn test_validate_no_extensions() {
        let mut config = valid_config();
        config.allowed_extensions.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoAllowedExtensions)));
    }

    #[test]
    fn test_validate_blank_extensions() {
        let mut config = valid_config();
        config.allowed_extensions = vec![".".into(), "  ".into()];
        assert!(matches!(config.validate(), Err(ConfigError::NoAllowedExtensions)));
    }

    #[test]
    fn test_unnormalized_extension_requires_dot() {
        let mut config = valid_config();
        config.allowed_extensions = vec!["PNG".into()];
        config.validate().unwrap();
        assert!(config.is_allowed_file("photo.png"));
        assert!(config.is_allowed_file("photo.PNG"));
        assert!(!config.is_allowed_file("photo.xpng"));
        assert!(!config.is_allowed_file("png"));
    }

    #[test]
    fn test_validate_non_finite_temperature() {
        let mut config = valid_config();
        config.inference.temperature = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { name: "temperature", .. })
        ));
    }

    #[test]
    fn test_validate_detector_bounds() {
        let mut config = valid_config();
        config.detector.min_size = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { name: "min_size", .. })
        ));

        let mut config = valid_config();
        config.detector.scale_factor = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { name: "scale_factor", .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FACECULL_BASE_URL", "http://gpu-box:11434"),
            ("FACECULL_MODEL", "llava"),
        ]
        .into_iter()
        .collect();

        let mut config = valid_config();
        let original_model_path = config.detector.model_path.clone();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.inference.base_url, "http://gpu-box:11434");
        assert_eq!(config.inference.model, "llava");
        assert_eq!(config.detector.model_path, original_model_path);
    }

    #[test]
    fn test_generate_url_trims_trailing_slash() {
        let settings = InferenceSettings {
            base_url: "http://host:1234/".into(),
            ..InferenceSettings::default()
        };
        assert_eq!(settings.generate_url(), "http://host:1234/api/generate");
    }

    #[test]
    fn test_default_config_path_suffix() {
        assert!(default_config_path().ends_with("facecull/config.toml"));
    }
}
